use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info};

use crate::config::ADMIN_SECRET_HEADER;

/// Interval between upload passes. A pass is also kicked off once at startup.
pub const UPLOAD_INTERVAL: Duration = Duration::from_secs(60);

/// A finished match recording discovered on local disk. Everything here is
/// derived purely from the `{root}/{matchId}/{mapId}/{name}.dem` layout.
#[derive(Debug, Clone)]
pub struct Demo {
    pub match_id: String,
    pub map_id: String,
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
}

#[derive(Debug, Error)]
enum UploadError {
    #[error("presigned url request failed with status {0}")]
    Presign(StatusCode),
    #[error("object upload failed with status {0}")]
    Upload(StatusCode),
    #[error("completion notification failed with status {0}")]
    Complete(StatusCode),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PresignedResponse {
    presigned_url: String,
}

/// Drains finished recordings to the coordinator's object store.
///
/// Decoupled from the control channel: it runs on its own timer and talks
/// HTTP only. Files are processed strictly sequentially to bound bandwidth
/// and server-side load, and at most one pass runs at a time.
pub struct DemoUploadPipeline {
    root: PathBuf,
    api_base: String,
    admin_secret: String,
    client: reqwest::Client,
    busy: AtomicBool,
}

impl DemoUploadPipeline {
    pub fn new(
        root: impl Into<PathBuf>,
        api_base: impl Into<String>,
        admin_secret: impl Into<String>,
    ) -> Self {
        Self {
            root: root.into(),
            api_base: api_base.into(),
            admin_secret: admin_secret.into(),
            client: reqwest::Client::new(),
            busy: AtomicBool::new(false),
        }
    }

    /// One upload pass. A call while a pass is already in flight returns
    /// immediately; the next timer tick picks up whatever is left.
    pub async fn run(&self) {
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("upload pass already in progress");
            return;
        }

        if let Err(err) = self.upload_pass().await {
            error!(error = %err, "demo upload pass failed");
        }

        self.busy.store(false, Ordering::SeqCst);
    }

    async fn upload_pass(&self) -> Result<()> {
        let demos = self.discover().await?;
        if demos.is_empty() {
            return Ok(());
        }
        info!(count = demos.len(), "found demos to upload");

        for demo in &demos {
            if let Err(err) = self.process(demo).await {
                error!(
                    match_id = %demo.match_id,
                    map_id = %demo.map_id,
                    demo = %demo.name,
                    error = %err,
                    "unable to upload demo"
                );
            }
            // Runs regardless of how the upload went, so empty match
            // directories never linger.
            self.cleanup_match_dir(&demo.match_id).await;
        }

        Ok(())
    }

    /// Recordings matching `{matchId}/{mapId}/*.dem` under the root.
    pub async fn discover(&self) -> Result<Vec<Demo>> {
        let mut demos = Vec::new();

        let mut matches = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) => {
                debug!(root = %self.root.display(), error = %err, "no demo directory to scan");
                return Ok(demos);
            }
        };

        while let Some(match_entry) = matches.next_entry().await? {
            if !match_entry.file_type().await?.is_dir() {
                continue;
            }
            let match_id = match_entry.file_name().to_string_lossy().to_string();

            let mut maps = tokio::fs::read_dir(match_entry.path()).await?;
            while let Some(map_entry) = maps.next_entry().await? {
                if !map_entry.file_type().await?.is_dir() {
                    continue;
                }
                let map_id = map_entry.file_name().to_string_lossy().to_string();

                let mut files = tokio::fs::read_dir(map_entry.path()).await?;
                while let Some(file_entry) = files.next_entry().await? {
                    let path = file_entry.path();
                    if !file_entry.file_type().await?.is_file() || !is_demo_file(&path) {
                        continue;
                    }
                    demos.push(Demo {
                        match_id: match_id.clone(),
                        map_id: map_id.clone(),
                        name: file_entry.file_name().to_string_lossy().to_string(),
                        size: file_entry.metadata().await?.len(),
                        path,
                    });
                }
            }
        }

        Ok(demos)
    }

    async fn process(&self, demo: &Demo) -> Result<()> {
        info!(
            match_id = %demo.match_id,
            map_id = %demo.map_id,
            demo = %demo.name,
            size = demo.size,
            "uploading demo"
        );

        let response = self
            .client
            .post(format!("{}/demos/{}/pre-signed", self.api_base, demo.match_id))
            .header(ADMIN_SECRET_HEADER, &self.admin_secret)
            .json(&json!({ "demo": demo.name, "mapId": demo.map_id }))
            .send()
            .await?;

        // The status is a control signal, not merely success/failure.
        match response.status() {
            StatusCode::CONFLICT => {
                info!(match_id = %demo.match_id, map_id = %demo.map_id, "match map is not finished yet");
                return Ok(());
            }
            StatusCode::NOT_ACCEPTABLE => {
                info!(demo = %demo.name, "demo is already uploaded");
                tokio::fs::remove_file(&demo.path).await?;
                return Ok(());
            }
            StatusCode::GONE => {
                info!(match_id = %demo.match_id, map_id = %demo.map_id, "match map no longer exists");
                tokio::fs::remove_file(&demo.path).await?;
                return Ok(());
            }
            status if !status.is_success() => return Err(UploadError::Presign(status).into()),
            _ => {}
        }

        let presigned: PresignedResponse = response.json().await?;

        let file = tokio::fs::File::open(&demo.path).await?;
        let response = self
            .client
            .put(&presigned.presigned_url)
            .header(CONTENT_LENGTH, demo.size)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(reqwest::Body::wrap_stream(ReaderStream::new(file)))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(UploadError::Upload(response.status()).into());
        }

        let response = self
            .client
            .post(format!("{}/demos/{}/uploaded", self.api_base, demo.match_id))
            .header(ADMIN_SECRET_HEADER, &self.admin_secret)
            .json(&json!({ "demo": demo.name, "mapId": demo.map_id, "size": demo.size }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(UploadError::Complete(response.status()).into());
        }

        // Only now is the local copy expendable.
        tokio::fs::remove_file(&demo.path).await?;
        Ok(())
    }

    async fn cleanup_match_dir(&self, match_id: &str) {
        let match_dir = self.root.join(match_id);
        match remaining_demos(&match_dir).await {
            Ok(0) => match tokio::fs::remove_dir_all(&match_dir).await {
                Ok(()) => info!(match_id, "removed empty match directory"),
                Err(err) => error!(match_id, error = %err, "unable to remove match directory"),
            },
            Ok(_) => {}
            Err(err) => debug!(match_id, error = %err, "unable to inspect match directory"),
        }
    }
}

async fn remaining_demos(match_dir: &Path) -> std::io::Result<usize> {
    let mut count = 0;
    let mut maps = tokio::fs::read_dir(match_dir).await?;
    while let Some(map_entry) = maps.next_entry().await? {
        if !map_entry.file_type().await?.is_dir() {
            continue;
        }
        let mut files = tokio::fs::read_dir(map_entry.path()).await?;
        while let Some(file_entry) = files.next_entry().await? {
            if file_entry.file_type().await?.is_file() && is_demo_file(&file_entry.path()) {
                count += 1;
            }
        }
    }
    Ok(count)
}

fn is_demo_file(path: &Path) -> bool {
    path.extension().map(|ext| ext == "dem").unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_root(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("game-node-agent-{tag}-{}", std::process::id()))
    }

    async fn write_file(path: &Path, contents: &[u8]) {
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(path, contents).await.unwrap();
    }

    #[tokio::test]
    async fn discovery_only_matches_the_expected_layout() {
        let root = scratch_root("discover");
        let _ = tokio::fs::remove_dir_all(&root).await;

        write_file(&root.join("match-1/de_dust2/round1.dem"), b"abcd").await;
        write_file(&root.join("match-1/de_dust2/notes.txt"), b"x").await;
        write_file(&root.join("match-1/stray.dem"), b"x").await;
        write_file(&root.join("stray.dem"), b"x").await;

        let pipeline = DemoUploadPipeline::new(&root, "http://unused", "secret");
        let demos = pipeline.discover().await.unwrap();

        assert_eq!(demos.len(), 1);
        assert_eq!(demos[0].match_id, "match-1");
        assert_eq!(demos[0].map_id, "de_dust2");
        assert_eq!(demos[0].name, "round1.dem");
        assert_eq!(demos[0].size, 4);

        tokio::fs::remove_dir_all(&root).await.unwrap();
    }

    #[tokio::test]
    async fn missing_root_yields_no_demos() {
        let pipeline =
            DemoUploadPipeline::new(scratch_root("missing-root"), "http://unused", "secret");
        assert!(pipeline.discover().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn remaining_demo_count_spans_map_directories() {
        let root = scratch_root("remaining");
        let _ = tokio::fs::remove_dir_all(&root).await;

        let match_dir = root.join("match-1");
        write_file(&match_dir.join("de_dust2/a.dem"), b"x").await;
        write_file(&match_dir.join("de_nuke/b.dem"), b"x").await;
        write_file(&match_dir.join("de_nuke/readme.md"), b"x").await;

        assert_eq!(remaining_demos(&match_dir).await.unwrap(), 2);

        tokio::fs::remove_dir_all(&root).await.unwrap();
    }
}
