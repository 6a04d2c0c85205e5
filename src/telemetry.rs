use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::Config;

/// Source of node-level facts for the telemetry push.
///
/// Everything here is consumed read-only by the channel session, and every
/// method is allowed to come back empty: a missing field is sent as absent,
/// never treated as an error. Cluster resource metrics are an external call
/// and stay behind this seam.
#[async_trait]
pub trait TelemetryCollector: Send + Sync {
    async fn labels(&self) -> Option<HashMap<String, String>> {
        None
    }

    async fn node_stats(&self) -> Option<Value> {
        None
    }

    async fn pod_stats(&self) -> Option<Value> {
        None
    }

    async fn supports_cpu_pinning(&self) -> Option<bool> {
        None
    }

    async fn cs_build(&self) -> Option<u64> {
        None
    }
}

/// Collector backed by what is mounted into the agent's container: node
/// labels from a downward-API file, CPU pinning capability from the
/// environment, and the CS build id from the Steam app manifest.
pub struct EnvCollector {
    labels_file: String,
    app_manifest: String,
}

impl EnvCollector {
    pub fn new(config: &Config) -> Self {
        Self {
            labels_file: config.labels_file.clone(),
            app_manifest: config.app_manifest.clone(),
        }
    }
}

#[async_trait]
impl TelemetryCollector for EnvCollector {
    async fn labels(&self) -> Option<HashMap<String, String>> {
        let raw = tokio::fs::read_to_string(&self.labels_file).await.ok()?;
        Some(parse_labels(&raw))
    }

    async fn supports_cpu_pinning(&self) -> Option<bool> {
        let value = std::env::var("NODE_CPU_PINNING").ok()?;
        Some(value == "1" || value.eq_ignore_ascii_case("true"))
    }

    async fn cs_build(&self) -> Option<u64> {
        let manifest = tokio::fs::read_to_string(&self.app_manifest).await.ok()?;
        parse_build_id(&manifest)
    }
}

/// Downward-API label files hold one `key="value"` pair per line.
fn parse_labels(raw: &str) -> HashMap<String, String> {
    raw.lines()
        .filter_map(|line| {
            let (key, value) = line.split_once('=')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            Some((key.to_string(), value.trim().trim_matches('"').to_string()))
        })
        .collect()
}

/// Pull the `buildid` value out of a Steam ACF app manifest.
fn parse_build_id(manifest: &str) -> Option<u64> {
    manifest.lines().find_map(|line| {
        let mut fields = line.split('"').filter(|part| !part.trim().is_empty());
        match (fields.next(), fields.next()) {
            (Some("buildid"), Some(value)) => value.parse().ok(),
            _ => None,
        }
    })
}
