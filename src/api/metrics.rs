//! Metrics Collection
//!
//! Collects and exposes metrics for monitoring the reputation engine.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::registry::{ReputationStats, SCORE_BUCKETS};
use crate::types::EventKind;

/// Metrics collector for the reputation engine
#[derive(Default)]
pub struct Metrics {
    /// Start time for uptime calculation
    start_time: Option<Instant>,

    /// Events recorded, indexed by [`EventKind::index`]
    events_by_kind: [AtomicU64; EventKind::COUNT],

    /// Events rejected as malformed
    pub malformed_events: AtomicU64,

    /// Automatic temporary bans
    pub temporary_bans: AtomicU64,

    /// Automatic permanent bans
    pub permanent_bans: AtomicU64,

    /// Bans applied by an operator
    pub manual_bans: AtomicU64,

    /// Bans lifted by an operator
    pub unbans: AtomicU64,

    /// Connections accepted
    pub admissions_accepted: AtomicU64,

    /// Connections rejected
    pub admissions_rejected: AtomicU64,

    /// Spam signals raised by the rate limiter
    pub rate_limit_signals: AtomicU64,

    /// Records written to storage
    pub storage_writes: AtomicU64,

    /// Failed storage operations
    pub storage_write_failures: AtomicU64,

    /// Writes dropped because the queue was full
    pub storage_dropped_writes: AtomicU64,

    /// Snapshots taken
    pub snapshots_taken: AtomicU64,

    /// Records evicted by maintenance
    pub peers_evicted: AtomicU64,

    /// Current tracked peers
    pub tracked_peers: AtomicU64,

    /// Current banned peers
    pub banned_peers: AtomicU64,

    /// Current whitelisted peers
    pub whitelisted_peers: AtomicU64,

    /// Current connected peers
    pub connected_peers: AtomicU64,

    /// Average score, stored as f64 bits
    average_score_bits: AtomicU64,

    /// Score histogram matching [`SCORE_BUCKETS`]
    score_buckets: [AtomicU64; 5],
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.start_time
            .map(|t| t.elapsed().as_secs())
            .unwrap_or(0)
    }

    pub fn inc_event(&self, kind: EventKind) {
        self.events_by_kind[kind.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn events(&self, kind: EventKind) -> u64 {
        self.events_by_kind[kind.index()].load(Ordering::Relaxed)
    }

    pub fn total_events(&self) -> u64 {
        self.events_by_kind.iter().map(|c| c.load(Ordering::Relaxed)).sum()
    }

    pub fn inc_malformed(&self) {
        self.malformed_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_temporary_bans(&self) {
        self.temporary_bans.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_permanent_bans(&self) {
        self.permanent_bans.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_manual_bans(&self) {
        self.manual_bans.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_unbans(&self) {
        self.unbans.fetch_add(1, Ordering::Relaxed);
    }

    /// Every ban applied so far, automatic or manual
    pub fn total_bans(&self) -> u64 {
        self.temporary_bans.load(Ordering::Relaxed)
            + self.permanent_bans.load(Ordering::Relaxed)
            + self.manual_bans.load(Ordering::Relaxed)
    }

    pub fn inc_admission(&self, accepted: bool) {
        if accepted {
            self.admissions_accepted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.admissions_rejected.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn inc_rate_limit_signals(&self) {
        self.rate_limit_signals.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_storage_writes(&self, count: u64) {
        self.storage_writes.fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_storage_failures(&self) {
        self.storage_write_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_storage_dropped(&self) {
        self.storage_dropped_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_snapshots(&self) {
        self.snapshots_taken.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_evicted(&self, count: u64) {
        self.peers_evicted.fetch_add(count, Ordering::Relaxed);
    }

    pub fn average_score(&self) -> f64 {
        f64::from_bits(self.average_score_bits.load(Ordering::Relaxed))
    }

    /// Refresh gauges from a stats snapshot
    pub fn update_from_stats(&self, stats: &ReputationStats) {
        self.tracked_peers.store(stats.total_peers as u64, Ordering::Relaxed);
        self.banned_peers.store(stats.banned_peers as u64, Ordering::Relaxed);
        self.whitelisted_peers.store(stats.whitelisted_peers as u64, Ordering::Relaxed);
        self.connected_peers.store(stats.connected_peers as u64, Ordering::Relaxed);
        self.average_score_bits.store(stats.average_score.to_bits(), Ordering::Relaxed);
        for (gauge, count) in self.score_buckets.iter().zip(stats.score_distribution.iter()) {
            gauge.store(*count as u64, Ordering::Relaxed);
        }
    }

    /// Export metrics in Prometheus format
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        // Uptime
        output.push_str(&format!(
            "# HELP kratos_reputation_uptime_seconds Reputation engine uptime in seconds\n\
             # TYPE kratos_reputation_uptime_seconds gauge\n\
             kratos_reputation_uptime_seconds {}\n\n",
            self.uptime_secs()
        ));

        // Events
        output.push_str(
            "# HELP kratos_reputation_events_total Peer events recorded by kind\n\
             # TYPE kratos_reputation_events_total counter\n",
        );
        for kind in EventKind::ALL {
            output.push_str(&format!(
                "kratos_reputation_events_total{{kind=\"{}\"}} {}\n",
                kind.as_str(),
                self.events(kind)
            ));
        }
        output.push('\n');

        let counters = [
            ("malformed_events_total", "Events rejected as malformed", &self.malformed_events),
            ("temporary_bans_total", "Automatic temporary bans", &self.temporary_bans),
            ("permanent_bans_total", "Automatic permanent bans", &self.permanent_bans),
            ("manual_bans_total", "Operator bans", &self.manual_bans),
            ("unbans_total", "Operator unbans", &self.unbans),
            ("admissions_accepted_total", "Connections accepted", &self.admissions_accepted),
            ("admissions_rejected_total", "Connections rejected", &self.admissions_rejected),
            ("rate_limit_signals_total", "Spam signals from the rate limiter", &self.rate_limit_signals),
            ("storage_writes_total", "Records written to storage", &self.storage_writes),
            ("storage_failures_total", "Failed storage operations", &self.storage_write_failures),
            ("storage_dropped_total", "Writes dropped on a full queue", &self.storage_dropped_writes),
            ("snapshots_total", "Storage snapshots taken", &self.snapshots_taken),
            ("peers_evicted_total", "Stale records evicted", &self.peers_evicted),
        ];
        for (name, help, value) in counters {
            output.push_str(&format!(
                "# HELP kratos_reputation_{name} {help}\n\
                 # TYPE kratos_reputation_{name} counter\n\
                 kratos_reputation_{name} {}\n\n",
                value.load(Ordering::Relaxed)
            ));
        }

        // Population
        let gauges = [
            ("peers", "Tracked peers", &self.tracked_peers),
            ("banned_peers", "Currently banned peers", &self.banned_peers),
            ("whitelisted_peers", "Whitelisted peers", &self.whitelisted_peers),
            ("connected_peers", "Connected peers", &self.connected_peers),
        ];
        for (name, help, value) in gauges {
            output.push_str(&format!(
                "# HELP kratos_reputation_{name} {help}\n\
                 # TYPE kratos_reputation_{name} gauge\n\
                 kratos_reputation_{name} {}\n\n",
                value.load(Ordering::Relaxed)
            ));
        }

        output.push_str(&format!(
            "# HELP kratos_reputation_average_score Average peer score\n\
             # TYPE kratos_reputation_average_score gauge\n\
             kratos_reputation_average_score {:.2}\n\n",
            self.average_score()
        ));

        output.push_str(
            "# HELP kratos_reputation_score_distribution Peers per score range\n\
             # TYPE kratos_reputation_score_distribution gauge\n",
        );
        for (label, gauge) in SCORE_BUCKETS.iter().zip(self.score_buckets.iter()) {
            output.push_str(&format!(
                "kratos_reputation_score_distribution{{range=\"{}\"}} {}\n",
                label,
                gauge.load(Ordering::Relaxed)
            ));
        }

        output
    }

    /// Export metrics as JSON
    pub fn to_json(&self) -> serde_json::Value {
        let events: serde_json::Map<String, serde_json::Value> = EventKind::ALL
            .iter()
            .map(|kind| (kind.as_str().to_string(), self.events(*kind).into()))
            .collect();

        let distribution: serde_json::Map<String, serde_json::Value> = SCORE_BUCKETS
            .iter()
            .zip(self.score_buckets.iter())
            .map(|(label, gauge)| (label.to_string(), gauge.load(Ordering::Relaxed).into()))
            .collect();

        serde_json::json!({
            "uptime_secs": self.uptime_secs(),
            "events": events,
            "malformed_events": self.malformed_events.load(Ordering::Relaxed),
            "bans": {
                "temporary": self.temporary_bans.load(Ordering::Relaxed),
                "permanent": self.permanent_bans.load(Ordering::Relaxed),
                "manual": self.manual_bans.load(Ordering::Relaxed),
                "unbans": self.unbans.load(Ordering::Relaxed),
            },
            "admissions": {
                "accepted": self.admissions_accepted.load(Ordering::Relaxed),
                "rejected": self.admissions_rejected.load(Ordering::Relaxed),
            },
            "rate_limit_signals": self.rate_limit_signals.load(Ordering::Relaxed),
            "storage": {
                "writes": self.storage_writes.load(Ordering::Relaxed),
                "failures": self.storage_write_failures.load(Ordering::Relaxed),
                "dropped": self.storage_dropped_writes.load(Ordering::Relaxed),
                "snapshots": self.snapshots_taken.load(Ordering::Relaxed),
            },
            "peers": {
                "tracked": self.tracked_peers.load(Ordering::Relaxed),
                "banned": self.banned_peers.load(Ordering::Relaxed),
                "whitelisted": self.whitelisted_peers.load(Ordering::Relaxed),
                "connected": self.connected_peers.load(Ordering::Relaxed),
                "evicted": self.peers_evicted.load(Ordering::Relaxed),
                "average_score": self.average_score(),
                "score_distribution": distribution,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_increment() {
        let metrics = Metrics::new();

        metrics.inc_event(EventKind::ValidMessage);
        metrics.inc_event(EventKind::ValidMessage);
        metrics.inc_event(EventKind::SpamAttempt);
        metrics.inc_temporary_bans();
        metrics.inc_manual_bans();

        assert_eq!(metrics.events(EventKind::ValidMessage), 2);
        assert_eq!(metrics.total_events(), 3);
        assert_eq!(metrics.total_bans(), 2);
    }

    #[test]
    fn test_prometheus_format() {
        let metrics = Metrics::new();
        metrics.inc_event(EventKind::DoubleSign);
        metrics.update_from_stats(&ReputationStats {
            total_peers: 100,
            banned_peers: 7,
            average_score: 61.5,
            score_distribution: [1, 2, 3, 4, 5],
            ..Default::default()
        });

        let output = metrics.to_prometheus();

        assert!(output.contains("kratos_reputation_events_total{kind=\"double_sign\"} 1"));
        assert!(output.contains("kratos_reputation_peers 100"));
        assert!(output.contains("kratos_reputation_banned_peers 7"));
        assert!(output.contains("kratos_reputation_average_score 61.50"));
        assert!(output.contains("kratos_reputation_score_distribution{range=\"80-100\"} 5"));
    }

    #[test]
    fn test_json_format() {
        let metrics = Metrics::new();
        metrics.inc_admission(false);
        metrics.inc_storage_dropped();

        let json = metrics.to_json();

        assert_eq!(json["admissions"]["rejected"], 1);
        assert_eq!(json["storage"]["dropped"], 1);
        assert_eq!(json["events"]["connected"], 0);
    }
}
