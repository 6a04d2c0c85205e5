use anyhow::Result;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;

/// Result of one completed latency round, published for the coordinator to
/// pick up. Immutable once written; a later probe round overwrites it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencyResult {
    pub region: String,
    pub latency: f64,
    pub is_lan: bool,
}

/// Shared key-value store for per-region latency results.
///
/// Results live in a hash keyed by probe session id, one field per normalized
/// region. The store is multi-writer; last write wins per field, which is
/// acceptable since each field represents one probe session/region pair.
#[derive(Clone)]
pub struct LatencyStore {
    client: Client,
    conn: OnceCell<ConnectionManager>,
}

impl LatencyStore {
    /// Opening the client performs no I/O; the connection is established on
    /// first publish and re-used afterwards.
    pub fn new(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)?;
        Ok(Self {
            client,
            conn: OnceCell::new(),
        })
    }

    pub async fn publish(&self, probe_session_id: &str, result: &LatencyResult) -> Result<()> {
        let mut conn = self
            .conn
            .get_or_try_init(|| ConnectionManager::new(self.client.clone()))
            .await?
            .clone();

        let key = result_key(probe_session_id);
        let field = normalize_region(&result.region);
        let value = serde_json::to_string(result)?;
        conn.hset::<_, _, _, ()>(&key, &field, value).await?;

        tracing::debug!(%key, %field, latency = result.latency, "published latency result");
        Ok(())
    }
}

fn result_key(probe_session_id: &str) -> String {
    format!("latency-test:{probe_session_id}")
}

pub fn normalize_region(region: &str) -> String {
    region.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_is_trimmed_and_lowercased() {
        assert_eq!(normalize_region(" EU-West "), "eu-west");
        assert_eq!(normalize_region("na"), "na");
    }

    #[test]
    fn result_key_includes_probe_session() {
        assert_eq!(result_key("abc-123"), "latency-test:abc-123");
    }

    #[test]
    fn result_serializes_with_camel_case_fields() {
        let result = LatencyResult {
            region: "eu-west".into(),
            latency: 12.5,
            is_lan: false,
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["region"], "eu-west");
        assert_eq!(json["latency"], 12.5);
        assert_eq!(json["isLan"], false);
    }
}
