use std::time::Instant;

/// Round-trip samples collected per latency round before a result is produced.
pub const SAMPLES_PER_ROUND: usize = 4;

/// Outcome of feeding one data-channel echo into the current round.
#[derive(Debug, Clone, PartialEq)]
pub enum Echo {
    /// No round is armed; the message arrived outside a round and is ignored.
    Idle,
    /// The round needs more samples; send another probe and re-arm.
    Pending,
    /// The round finished with the averaged round-trip time in milliseconds.
    Complete { average: f64 },
}

/// Per-peer latency measurement state for the data-channel ping-pong protocol.
///
/// A round is started by the client sending the `latency-test` control string,
/// after which every echo pair contributes one sample. The buffer never grows
/// past [`SAMPLES_PER_ROUND`]; producing a result drains it.
#[derive(Debug, Default)]
pub struct LatencyRound {
    samples: Vec<f64>,
    sent_at: Option<Instant>,
}

impl LatencyRound {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset for a fresh round. Any partial samples from a previous round are
    /// discarded.
    pub fn begin(&mut self) {
        self.samples.clear();
        self.sent_at = None;
    }

    /// Record the instant a probe was sent; the next echo is measured
    /// against it.
    pub fn arm(&mut self, now: Instant) {
        self.sent_at = Some(now);
    }

    /// Feed an inbound echo. Returns [`Echo::Complete`] once the fourth
    /// sample lands, leaving the buffer empty for the next round.
    pub fn on_echo(&mut self, now: Instant) -> Echo {
        let Some(sent_at) = self.sent_at.take() else {
            return Echo::Idle;
        };

        let elapsed_ms = now.duration_since(sent_at).as_secs_f64() * 1000.0;
        self.samples.push(elapsed_ms);

        if self.samples.len() >= SAMPLES_PER_ROUND {
            let average = self.samples.iter().sum::<f64>() / self.samples.len() as f64;
            self.samples.clear();
            Echo::Complete { average }
        } else {
            Echo::Pending
        }
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }
}

/// Heuristic check whether two addresses sit on the same LAN.
///
/// IPv4 addresses compare equal on their first three octets (assumes a /24),
/// IPv6 on their first four segments (assumes a /64). Mixed families are never
/// considered LAN. This is a heuristic, not authoritative topology detection:
/// nodes on differently-sized subnets may be misclassified.
pub fn is_same_lan(local: &str, remote: &str) -> bool {
    match (local.contains(':'), remote.contains(':')) {
        (false, false) => same_prefix(local, remote, '.', 3),
        (true, true) => same_prefix(local, remote, ':', 4),
        _ => false,
    }
}

fn same_prefix(a: &str, b: &str, separator: char, segments: usize) -> bool {
    let a: Vec<&str> = a.split(separator).take(segments).collect();
    let b: Vec<&str> = b.split(separator).take(segments).collect();
    a.len() == segments && b.len() == segments && a == b
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn round_completes_after_four_samples_and_drains_buffer() {
        let mut round = LatencyRound::new();
        let base = Instant::now();

        round.begin();
        round.arm(base);

        for n in 1..SAMPLES_PER_ROUND {
            let now = base + Duration::from_millis(10 * n as u64);
            assert_eq!(round.on_echo(now), Echo::Pending);
            assert_eq!(round.sample_count(), n);
            round.arm(now);
        }

        let outcome = round.on_echo(base + Duration::from_millis(40));
        let Echo::Complete { average } = outcome else {
            panic!("expected a completed round, got {outcome:?}");
        };
        assert!((average - 10.0).abs() < 0.5, "average was {average}");
        assert_eq!(round.sample_count(), 0);
    }

    #[test]
    fn echo_without_armed_probe_is_ignored() {
        let mut round = LatencyRound::new();
        assert_eq!(round.on_echo(Instant::now()), Echo::Idle);
        assert_eq!(round.sample_count(), 0);
    }

    #[test]
    fn begin_discards_partial_samples() {
        let mut round = LatencyRound::new();
        let base = Instant::now();
        round.begin();
        round.arm(base);
        round.on_echo(base + Duration::from_millis(5));
        assert_eq!(round.sample_count(), 1);

        round.begin();
        assert_eq!(round.sample_count(), 0);
        assert_eq!(round.on_echo(base + Duration::from_millis(6)), Echo::Idle);
    }

    #[test]
    fn same_lan_ipv4() {
        assert!(is_same_lan("10.0.0.5", "10.0.0.9"));
        assert!(!is_same_lan("10.0.0.5", "10.0.1.9"));
    }

    #[test]
    fn same_lan_ipv6() {
        assert!(is_same_lan("fe80:0:0:1::a", "fe80:0:0:1::b"));
        assert!(!is_same_lan("fe80:0:0:1::a", "fe80:0:0:2::b"));
    }

    #[test]
    fn mixed_families_are_never_lan() {
        assert!(!is_same_lan("10.0.0.5", "fe80:0:0:1::a"));
        assert!(!is_same_lan("fe80:0:0:1::a", "10.0.0.5"));
    }
}
