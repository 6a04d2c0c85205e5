use anyhow::{Context, Result};
use std::env;

/// Header carrying the node's IP on the control-channel handshake; the
/// coordinator maps it to a known node.
pub const NODE_IP_HEADER: &str = "x-node-ip";

/// Shared-secret header for the coordinator's demo upload API.
pub const ADMIN_SECRET_HEADER: &str = "x-admin-secret";

#[derive(Debug, Clone)]
pub struct Config {
    /// Coordinator WebSocket endpoint, e.g. `ws://coordinator:5586/ws`.
    pub channel_url: String,
    /// Coordinator HTTP API base, e.g. `http://coordinator:5585`.
    pub api_base: String,
    pub admin_secret: String,
    pub node_name: String,
    pub node_ip: String,
    pub redis_url: String,
    pub demos_dir: String,
    pub health_port: u16,
    pub labels_file: String,
    pub app_manifest: String,
}

impl Config {
    /// Node identity and the coordinator endpoint have no sane defaults;
    /// starting without them would leave the agent with an undefined identity,
    /// so they fail loudly here instead.
    pub fn from_env() -> Result<Self> {
        let api_host =
            env::var("API_SERVICE_HOST").context("API_SERVICE_HOST environment variable is not set")?;
        let api_port: u16 = env::var("API_SERVICE_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(5585);
        let channel_port: u16 = env::var("WS_SERVICE_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(5586);

        Ok(Self {
            channel_url: format!("ws://{api_host}:{channel_port}/ws"),
            api_base: format!("http://{api_host}:{api_port}"),
            admin_secret: env::var("API_ADMIN_SECRET")
                .context("API_ADMIN_SECRET environment variable is not set")?,
            node_name: env::var("NODE_NAME").context("NODE_NAME environment variable is not set")?,
            node_ip: env::var("NODE_IP").context("NODE_IP environment variable is not set")?,
            redis_url: env::var("REDIS_URL").unwrap_or_else(|_| "redis://redis:6379/1".to_string()),
            demos_dir: env::var("DEMOS_DIR").unwrap_or_else(|_| "/demos".to_string()),
            health_port: env::var("HEALTH_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            labels_file: env::var("NODE_LABELS_FILE")
                .unwrap_or_else(|_| "/etc/podinfo/labels".to_string()),
            app_manifest: env::var("CS_APP_MANIFEST")
                .unwrap_or_else(|_| "/serverfiles/steamapps/appmanifest_730.acf".to_string()),
        })
    }
}
