use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::signaling::NicStats;

const DEFAULT_PUBLIC_IP_ENDPOINT: &str = "https://checkip.amazonaws.com";
const PUBLIC_IP_REFRESH: Duration = Duration::from_secs(5);
const PUBLIC_IP_TIMEOUT: Duration = Duration::from_secs(2);
const THROUGHPUT_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// First non-virtual IPv4 interface address, if any. Overlay (`cni*`) and
/// tailnet (`tailscale*`) interfaces are skipped so the game traffic
/// interface wins.
pub fn lan_ip() -> Option<String> {
    let interfaces = if_addrs::get_if_addrs().ok()?;
    interfaces
        .iter()
        .find(|iface| is_lan_candidate(&iface.name, &iface.ip(), iface.is_loopback()))
        .map(|iface| iface.ip().to_string())
}

fn is_lan_candidate(name: &str, ip: &IpAddr, is_loopback: bool) -> bool {
    if is_loopback || !ip.is_ipv4() {
        return false;
    }
    !name.starts_with("cni") && !name.starts_with("tailscale")
}

fn candidate_interface_names() -> Vec<String> {
    if_addrs::get_if_addrs()
        .map(|interfaces| {
            interfaces
                .iter()
                .filter(|iface| is_lan_candidate(&iface.name, &iface.ip(), iface.is_loopback()))
                .map(|iface| iface.name.clone())
                .collect()
        })
        .unwrap_or_default()
}

/// Cached public IP, refreshed on its own timer so the telemetry push never
/// waits on the external lookup.
#[derive(Clone)]
pub struct PublicIp {
    cached: Arc<RwLock<Option<String>>>,
    client: reqwest::Client,
    endpoint: String,
}

impl Default for PublicIp {
    fn default() -> Self {
        Self::new()
    }
}

impl PublicIp {
    pub fn new() -> Self {
        Self {
            cached: Arc::new(RwLock::new(None)),
            client: reqwest::Client::builder()
                .timeout(PUBLIC_IP_TIMEOUT)
                .build()
                .unwrap_or_default(),
            endpoint: std::env::var("PUBLIC_IP_ENDPOINT")
                .unwrap_or_else(|_| DEFAULT_PUBLIC_IP_ENDPOINT.to_string()),
        }
    }

    pub async fn refresh(&self) {
        match self.fetch().await {
            Ok(ip) => *self.cached.write().await = Some(ip),
            Err(err) => warn!(error = %err, "unable to get public ipv4 address"),
        }
    }

    async fn fetch(&self) -> anyhow::Result<String> {
        let body = self
            .client
            .get(&self.endpoint)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(body.trim().to_string())
    }

    pub async fn get(&self) -> Option<String> {
        self.cached.read().await.clone()
    }

    /// Cached value, falling back to one inline refresh when nothing has been
    /// fetched yet.
    pub async fn get_or_refresh(&self) -> Option<String> {
        if let Some(ip) = self.get().await {
            return Some(ip);
        }
        self.refresh().await;
        self.get().await
    }

    pub fn spawn_refresh(&self) -> JoinHandle<()> {
        let public_ip = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PUBLIC_IP_REFRESH);
            loop {
                ticker.tick().await;
                public_ip.refresh().await;
            }
        })
    }
}

#[derive(Default)]
struct NicWindow {
    baseline: Option<(u64, u64)>,
    rx: Vec<u64>,
    tx: Vec<u64>,
}

/// Per-interface throughput sampler backed by the kernel byte counters in
/// `/sys/class/net/<nic>/statistics`. Samples accumulate between telemetry
/// pushes; [`NicThroughput::take_averages`] drains them.
#[derive(Clone, Default)]
pub struct NicThroughput {
    windows: Arc<Mutex<HashMap<String, NicWindow>>>,
}

impl NicThroughput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn_sampler(&self) -> JoinHandle<()> {
        let sampler = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(THROUGHPUT_SAMPLE_INTERVAL);
            loop {
                ticker.tick().await;
                sampler.sample().await;
            }
        })
    }

    async fn sample(&self) {
        for nic in candidate_interface_names() {
            let (Some(rx), Some(tx)) = (
                read_counter(&nic, "rx_bytes").await,
                read_counter(&nic, "tx_bytes").await,
            ) else {
                continue;
            };
            self.record(&nic, rx, tx);
        }
    }

    fn record(&self, nic: &str, rx_total: u64, tx_total: u64) {
        let mut windows = self.windows.lock().unwrap();
        let window = windows.entry(nic.to_string()).or_default();
        if let Some((last_rx, last_tx)) = window.baseline {
            window.rx.push(rx_total.saturating_sub(last_rx));
            window.tx.push(tx_total.saturating_sub(last_tx));
        }
        window.baseline = Some((rx_total, tx_total));
    }

    /// Average bytes/s per interface since the last call, clearing the
    /// collected samples.
    pub fn take_averages(&self) -> Vec<NicStats> {
        let mut windows = self.windows.lock().unwrap();
        let mut stats: Vec<NicStats> = windows
            .iter_mut()
            .map(|(name, window)| {
                let rx = average_ceil(&window.rx);
                let tx = average_ceil(&window.tx);
                window.rx.clear();
                window.tx.clear();
                NicStats {
                    name: name.clone(),
                    rx,
                    tx,
                }
            })
            .collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }
}

fn average_ceil(samples: &[u64]) -> u64 {
    if samples.is_empty() {
        return 0;
    }
    let sum: u64 = samples.iter().sum();
    (sum as f64 / samples.len() as f64).ceil() as u64
}

async fn read_counter(nic: &str, counter: &str) -> Option<u64> {
    let path = format!("/sys/class/net/{nic}/statistics/{counter}");
    let raw = tokio::fs::read_to_string(path).await.ok()?;
    raw.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lan_candidates_skip_virtual_and_loopback_interfaces() {
        let v4: IpAddr = "10.0.0.5".parse().unwrap();
        let v6: IpAddr = "fe80::1".parse().unwrap();

        assert!(is_lan_candidate("eth0", &v4, false));
        assert!(!is_lan_candidate("lo", &v4, true));
        assert!(!is_lan_candidate("cni0", &v4, false));
        assert!(!is_lan_candidate("tailscale0", &v4, false));
        assert!(!is_lan_candidate("eth0", &v6, false));
    }

    #[test]
    fn throughput_deltas_are_averaged_and_drained() {
        let sampler = NicThroughput::new();

        // First observation only establishes the baseline.
        sampler.record("eth0", 1_000, 2_000);
        sampler.record("eth0", 1_100, 2_300);
        sampler.record("eth0", 1_300, 2_400);

        let stats = sampler.take_averages();
        assert_eq!(
            stats,
            vec![NicStats {
                name: "eth0".into(),
                rx: 150,
                tx: 200,
            }]
        );

        // Drained: a new window with no fresh samples averages to zero.
        let stats = sampler.take_averages();
        assert_eq!(stats[0].rx, 0);
        assert_eq!(stats[0].tx, 0);
    }

    #[test]
    fn counter_resets_do_not_underflow() {
        let sampler = NicThroughput::new();
        sampler.record("eth0", 5_000, 5_000);
        sampler.record("eth0", 100, 100);
        let stats = sampler.take_averages();
        assert_eq!(stats[0].rx, 0);
        assert_eq!(stats[0].tx, 0);
    }
}
