use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{error, info, warn};

use crate::config::{Config, NODE_IP_HEADER};
use crate::network::{self, NicThroughput, PublicIp};
use crate::relay::SignalingRelay;
use crate::signaling::{ChannelSender, Envelope, NodeStatus};
use crate::telemetry::TelemetryCollector;

/// Interval of the periodic telemetry push.
pub const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Constant reconnect delay. No backoff or jitter: the coordinator endpoint
/// is a stable in-cluster service and the delay is part of the observable
/// timing contract.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Everything a channel session needs from the rest of the agent. Cloned per
/// reconnect cycle; the collaborators themselves are shared.
#[derive(Clone)]
pub struct ChannelContext {
    pub config: Arc<Config>,
    pub relay: Arc<SignalingRelay>,
    pub collector: Arc<dyn TelemetryCollector>,
    pub public_ip: PublicIp,
    pub throughput: NicThroughput,
}

/// Connect-run-reconnect loop. There is no permanent failure state short of
/// process exit; transport errors and closes both land back here.
pub async fn run_forever(ctx: ChannelContext) {
    loop {
        match ChannelSession::connect(&ctx).await {
            Ok(session) => session.run(&ctx).await,
            Err(err) => warn!(error = %err, "unable to connect to coordinator"),
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

/// One control connection to the coordinator. All signaling and telemetry
/// multiplex over it; it is the only socket the agent holds open to the
/// coordinator.
pub struct ChannelSession {
    reader: WsStream,
    outbound: ChannelSender,
    forward_task: JoinHandle<()>,
    ping_task: JoinHandle<()>,
}

impl ChannelSession {
    /// Open the control connection, identifying this node to the coordinator
    /// via the node-IP header, and start the telemetry push immediately.
    pub async fn connect(ctx: &ChannelContext) -> Result<Self> {
        let mut request = ctx.config.channel_url.as_str().into_client_request()?;
        request.headers_mut().insert(
            NODE_IP_HEADER,
            ctx.config
                .node_ip
                .parse::<HeaderValue>()
                .context("node ip is not a valid header value")?,
        );

        let (stream, _) = connect_async(request).await?;
        info!(url = %ctx.config.channel_url, "connected to coordinator");

        let (sink, reader) = stream.split();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let forward_task = tokio::spawn(forward_outbound(sink, outbound_rx));
        let ping_task = tokio::spawn(push_telemetry(ctx.clone(), outbound.clone()));

        Ok(Self {
            reader,
            outbound,
            forward_task,
            ping_task,
        })
    }

    /// Process inbound envelopes strictly in arrival order until the
    /// transport errors or closes, then release everything owned by this
    /// connection. The caller owns the reconnect schedule.
    pub async fn run(mut self, ctx: &ChannelContext) {
        while let Some(message) = self.reader.next().await {
            match message {
                Ok(Message::Text(text)) => self.dispatch(&text, ctx).await,
                Ok(Message::Close(frame)) => {
                    warn!(?frame, "control channel closed");
                    break;
                }
                Ok(_) => {}
                Err(err) => {
                    error!(error = %err, "control channel error");
                    break;
                }
            }
        }

        self.ping_task.abort();
        self.forward_task.abort();
    }

    async fn dispatch(&self, text: &str, ctx: &ChannelContext) {
        let envelope: Envelope = match serde_json::from_str(text) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(error = %err, "malformed control message");
                return;
            }
        };

        match envelope.event.as_str() {
            "offer" | "answer" | "candidate" => {
                ctx.relay
                    .handle(&envelope.event, envelope.data, &self.outbound)
                    .await;
            }
            // Unknown events are not an error condition.
            other => warn!(event = other, "unknown event"),
        }
    }
}

async fn forward_outbound(mut sink: WsSink, mut rx: mpsc::UnboundedReceiver<Envelope>) {
    while let Some(envelope) = rx.recv().await {
        let Ok(json) = serde_json::to_string(&envelope) else {
            continue;
        };
        if sink.send(Message::Text(json)).await.is_err() {
            break;
        }
    }
}

/// Push a `message` envelope with the node's status every ping interval,
/// starting right away rather than waiting for the first tick.
async fn push_telemetry(ctx: ChannelContext, out: ChannelSender) {
    let mut observed = ObservedIps::default();
    let mut ticker = tokio::time::interval(PING_INTERVAL);
    loop {
        ticker.tick().await;

        let status = collect_status(&ctx, &mut observed).await;
        let data = match serde_json::to_value(&status) {
            Ok(data) => data,
            Err(err) => {
                warn!(error = %err, "unable to serialize node status");
                continue;
            }
        };
        if out.send(Envelope::new("message", data)).is_err() {
            break;
        }
    }
}

/// Each field is gathered independently; an unavailable field goes out as
/// absent instead of blocking or aborting the push.
async fn collect_status(ctx: &ChannelContext, observed: &mut ObservedIps) -> NodeStatus {
    let lan_ip = network::lan_ip();
    let node_ip = Some(ctx.config.node_ip.clone());
    let public_ip = ctx.public_ip.get_or_refresh().await;

    observed.log_changes(&lan_ip, &node_ip, &public_ip);

    NodeStatus {
        node: ctx.config.node_name.clone(),
        labels: ctx.collector.labels().await,
        lan_ip,
        node_ip,
        public_ip,
        node_stats: ctx.collector.node_stats().await,
        pod_stats: ctx.collector.pod_stats().await,
        supports_cpu_pinning: ctx.collector.supports_cpu_pinning().await,
        cs_build: ctx.collector.cs_build().await,
        network: ctx.throughput.take_averages(),
    }
}

/// Last-observed addresses, kept only so changes show up in the log.
#[derive(Default)]
struct ObservedIps {
    lan: Option<String>,
    node: Option<String>,
    public: Option<String>,
}

impl ObservedIps {
    fn log_changes(&mut self, lan: &Option<String>, node: &Option<String>, public: &Option<String>) {
        log_ip_change("lan", &mut self.lan, lan);
        log_ip_change("node", &mut self.node, node);
        log_ip_change("public", &mut self.public, public);
    }
}

fn log_ip_change(kind: &str, last: &mut Option<String>, current: &Option<String>) {
    let Some(ip) = current else {
        return;
    };
    if last.as_deref() != Some(ip.as_str()) {
        info!(kind, %ip, "node address observed");
        *last = Some(ip.clone());
    }
}
