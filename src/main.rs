use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};

use game_node_agent::channel::{self, ChannelContext};
use game_node_agent::config::Config;
use game_node_agent::demos::{DemoUploadPipeline, UPLOAD_INTERVAL};
use game_node_agent::health;
use game_node_agent::network::{NicThroughput, PublicIp};
use game_node_agent::relay::SignalingRelay;
use game_node_agent::storage::LatencyStore;
use game_node_agent::telemetry::{EnvCollector, TelemetryCollector};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Arc::new(Config::from_env()?);
    info!(node = %config.node_name, coordinator = %config.channel_url, "starting node agent");

    let public_ip = PublicIp::new();
    let ip_task = public_ip.spawn_refresh();
    let throughput = NicThroughput::new();
    let sampler_task = throughput.spawn_sampler();

    let store = LatencyStore::new(&config.redis_url)?;
    let relay = Arc::new(SignalingRelay::new(store));
    let collector: Arc<dyn TelemetryCollector> = Arc::new(EnvCollector::new(&config));

    let health_port = config.health_port;
    tokio::spawn(async move {
        if let Err(err) = health::serve(health_port).await {
            error!(error = %err, "health endpoint failed");
        }
    });

    let pipeline = Arc::new(DemoUploadPipeline::new(
        &config.demos_dir,
        &config.api_base,
        &config.admin_secret,
    ));
    let upload_task = tokio::spawn({
        let pipeline = pipeline.clone();
        async move {
            // The first tick completes immediately, giving the startup pass.
            let mut ticker = tokio::time::interval(UPLOAD_INTERVAL);
            loop {
                ticker.tick().await;
                pipeline.run().await;
            }
        }
    });

    let channel_task = tokio::spawn(channel::run_forever(ChannelContext {
        config: config.clone(),
        relay,
        collector,
        public_ip,
        throughput,
    }));

    shutdown_signal().await;
    info!("shutdown signal received, stopping");

    channel_task.abort();
    upload_task.abort();
    ip_task.abort();
    sampler_task.abort();

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
