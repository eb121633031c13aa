//! Reputation Engine Configuration
//!
//! Configurable parameters for scoring, penalties, bans, diversity limits,
//! rate limiting, storage and monitoring.
//! Default values are chosen to balance security, resilience, and performance.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::types::EventKind;

/// Main configuration for the reputation engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReputationConfig {
    /// Port for HTTP API
    pub api_port: u16,

    /// Peer IDs whitelisted at startup
    pub whitelist: Vec<String>,

    pub scoring: ScoringConfig,
    pub penalties: PenaltyConfig,
    pub bans: BanConfig,
    pub diversity: DiversityConfig,
    pub rate_limit: RateLimitConfig,
    pub storage: StorageConfig,
    pub maintenance: MaintenanceConfig,
    pub monitor: MonitorConfig,
}

impl Default for ReputationConfig {
    fn default() -> Self {
        Self {
            api_port: 8090,
            whitelist: vec![],
            scoring: ScoringConfig::default(),
            penalties: PenaltyConfig::default(),
            bans: BanConfig::default(),
            diversity: DiversityConfig::default(),
            rate_limit: RateLimitConfig::default(),
            storage: StorageConfig::default(),
            maintenance: MaintenanceConfig::default(),
            monitor: MonitorConfig::default(),
        }
    }
}

/// Score model weights, thresholds and decay
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    // === Weights ===
    pub uptime_weight: f64,
    pub validity_weight: f64,
    pub latency_weight: f64,
    pub block_propagation_weight: f64,

    /// Score points removed per penalty point
    pub penalty_weight: f64,

    // === Evidence & Decay ===

    /// Evidence gained per recorded event (capped at 1.0)
    pub evidence_per_event: f64,

    /// Multiplier applied once per decay period
    pub decay_factor: f64,

    /// Decay period (seconds)
    pub decay_period_secs: u64,

    // === Thresholds ===

    /// Latency at or below which a peer scores in the top band (ms)
    pub good_latency_ms: u64,

    /// Latency after which the score decays exponentially (ms)
    pub max_latency_ms: u64,

    /// Exponential decay rate per second above `max_latency_ms`
    pub latency_decay_per_sec: f64,

    /// Block propagation below this counts as fast (ms)
    pub fast_block_ms: u64,

    /// Average session length that earns the uptime bonus (seconds)
    pub min_session_for_bonus_secs: u64,

    /// Score movements kept per peer
    pub score_history_len: usize,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            uptime_weight: 0.25,
            validity_weight: 0.30,
            latency_weight: 0.20,
            block_propagation_weight: 0.15,
            penalty_weight: 0.10,

            evidence_per_event: 0.1,    // 10 events for full confidence
            decay_factor: 0.95,
            decay_period_secs: 86_400,  // 24 hours

            good_latency_ms: 500,
            max_latency_ms: 2_000,
            latency_decay_per_sec: 0.5,
            fast_block_ms: 1_000,
            min_session_for_bonus_secs: 3_600,  // 1 hour
            score_history_len: 32,
        }
    }
}

impl ScoringConfig {
    pub fn metric_weight_sum(&self) -> f64 {
        self.uptime_weight + self.validity_weight + self.latency_weight + self.block_propagation_weight
    }
}

/// Penalty weights and violation streak tracking
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PenaltyConfig {
    // === Base penalty points per violation ===
    pub protocol_violation: f64,
    pub malformed_message: f64,
    pub spam_attempt: f64,
    pub oversized_message: f64,
    pub invalid_block: f64,
    pub double_sign: f64,
    pub bandwidth_abuse: f64,

    // === Streaks ===

    /// Window in which violations count toward a streak (seconds)
    pub streak_window_secs: u64,

    /// Quiet period that ends a streak (seconds)
    pub streak_cooldown_secs: u64,

    /// Violations inside the window before the multiplier applies
    pub streak_threshold: u32,

    /// Growth of the multiplier per additional violation
    pub streak_multiplier: f64,

    /// Ceiling for the streak multiplier
    pub max_streak_multiplier: f64,

    // === Violation log ===

    /// How long violations stay in the log (seconds)
    pub violation_retention_secs: u64,

    /// Maximum entries kept in the log
    pub violation_log_capacity: usize,
}

impl Default for PenaltyConfig {
    fn default() -> Self {
        Self {
            protocol_violation: 5.0,
            malformed_message: 2.0,
            spam_attempt: 10.0,
            oversized_message: 15.0,
            invalid_block: 20.0,
            double_sign: 100.0,
            bandwidth_abuse: 10.0,

            streak_window_secs: 600,    // 10 minutes
            streak_cooldown_secs: 600,  // 10 minutes of good behaviour
            streak_threshold: 3,
            streak_multiplier: 1.4,
            max_streak_multiplier: 3.0,

            violation_retention_secs: 86_400,
            violation_log_capacity: 64,
        }
    }
}

impl PenaltyConfig {
    /// Base penalty points for a violation kind
    pub fn weight(&self, kind: EventKind) -> f64 {
        match kind {
            EventKind::ProtocolViolation => self.protocol_violation,
            EventKind::MalformedMessage => self.malformed_message,
            EventKind::SpamAttempt => self.spam_attempt,
            EventKind::OversizedMessage => self.oversized_message,
            EventKind::InvalidBlock => self.invalid_block,
            EventKind::DoubleSign => self.double_sign,
            EventKind::BandwidthAbuse => self.bandwidth_abuse,
            _ => 0.0,
        }
    }
}

/// Ban triggers, ladder and admission thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BanConfig {
    /// Apply automatic bans
    pub auto_ban: bool,

    /// Scores below this trigger a temporary ban
    pub ban_score_threshold: f64,

    /// Penalty points above this trigger a temporary ban
    pub ban_penalty_threshold: f64,

    /// Temporary ban durations, escalating per offence (seconds)
    pub ban_ladder_secs: Vec<u64>,

    /// Temporary bans after which the next ban is permanent
    pub max_temp_bans: u32,

    /// Lifetime spam attempts that trigger a temporary ban
    pub spam_ban_count: u64,

    /// Lifetime invalid blocks that trigger a permanent ban
    pub invalid_block_ban_count: u64,

    /// Protocol violations in the log that make a low score permanent
    pub sustained_violation_count: usize,

    /// Messages required before the validity ratio can ban
    pub min_messages_for_validity_ban: u64,

    /// Validity ratio below which a peer is banned
    pub validity_ban_ratio: f64,

    // === Admission ===

    /// Minimum score for accepting a connection
    pub min_accept_score: f64,

    /// Maximum penalty points for accepting a connection
    pub max_accept_penalty: f64,
}

impl Default for BanConfig {
    fn default() -> Self {
        Self {
            auto_ban: true,
            ban_score_threshold: 20.0,
            ban_penalty_threshold: 100.0,
            ban_ladder_secs: vec![
                86_400,     // 24 hours
                604_800,    // 7 days
                2_592_000,  // 30 days
            ],
            max_temp_bans: 3,
            spam_ban_count: 5,
            invalid_block_ban_count: 3,
            sustained_violation_count: 3,
            min_messages_for_validity_ban: 100,
            validity_ban_ratio: 0.5,

            min_accept_score: 30.0,
            max_accept_penalty: 100.0,
        }
    }
}

/// Sybil/Eclipse guard limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiversityConfig {
    pub max_peers_per_subnet: usize,
    pub max_peers_per_asn: usize,
    pub max_peers_per_country: usize,

    /// Prefix length grouping IPv4 peers
    pub ipv4_prefix: u8,

    /// Prefix length grouping IPv6 peers
    pub ipv6_prefix: u8,
}

impl Default for DiversityConfig {
    fn default() -> Self {
        Self {
            max_peers_per_subnet: 10,
            max_peers_per_asn: 15,
            max_peers_per_country: 50,
            ipv4_prefix: 24,
            ipv6_prefix: 48,
        }
    }
}

/// Per-peer message and block rate limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub max_messages_per_second: u32,
    pub max_blocks_per_second: u32,

    /// Sliding window length (seconds)
    pub window_secs: u64,

    /// Idle windows older than this are dropped (seconds)
    pub idle_cleanup_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_messages_per_second: 100,
            max_blocks_per_second: 10,
            window_secs: 10,
            idle_cleanup_secs: 300,
        }
    }
}

/// Background persistence
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Bounded writer queue capacity
    pub queue_capacity: usize,

    /// Interval between batched flushes (seconds)
    pub flush_interval_secs: u64,

    /// Pending writes that force an early flush
    pub max_batch: usize,

    /// First retry delay after a failed flush (ms)
    pub retry_base_ms: u64,

    /// Retry delay ceiling (ms)
    pub retry_max_ms: u64,

    /// Snapshots kept on disk
    pub max_snapshots: usize,

    /// Interval between snapshots (seconds)
    pub snapshot_interval_secs: u64,

    /// Time allowed to drain the queue on shutdown (seconds)
    pub shutdown_timeout_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            flush_interval_secs: 5,
            max_batch: 512,
            retry_base_ms: 200,
            retry_max_ms: 30_000,
            max_snapshots: 5,
            snapshot_interval_secs: 3_600,  // 1 hour
            shutdown_timeout_secs: 10,
        }
    }
}

/// Periodic maintenance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// Interval for decay, ban expiry and eviction (seconds)
    pub interval_secs: u64,

    /// Records not seen for this long are evicted (seconds)
    pub retention_secs: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval_secs: 3_600,         // 1 hour
            retention_secs: 2_592_000,    // 30 days
        }
    }
}

/// Health checks and alerting
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Interval between health checks (seconds)
    pub check_interval_secs: u64,

    /// Bans per hour that raise an alert
    pub ban_rate_alert_per_hour: f64,

    /// Average score below which an alert is raised
    pub low_average_score: f64,

    /// Peers required before population alerts are evaluated
    pub min_peers_for_alerts: usize,

    /// Largest subnet share before alerting
    pub subnet_concentration_alert: f64,

    /// Largest country share before alerting
    pub country_concentration_alert: f64,

    /// Banned share of peers that marks the engine unhealthy
    pub unhealthy_ban_ratio: f64,

    /// Minimum time between two alerts of the same kind (seconds)
    pub alert_cooldown_secs: u64,

    /// Alerts kept in memory
    pub max_alerts: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 300,  // 5 minutes
            ban_rate_alert_per_hour: 10.0,
            low_average_score: 60.0,
            min_peers_for_alerts: 10,
            subnet_concentration_alert: 0.30,
            country_concentration_alert: 0.40,
            unhealthy_ban_ratio: 0.5,
            alert_cooldown_secs: 3_600,
            max_alerts: 1_000,
        }
    }
}

impl ReputationConfig {
    /// Load configuration from TOML file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    // Builder-style methods for CLI overrides

    pub fn with_api_port(mut self, port: u16) -> Self {
        self.api_port = port;
        self
    }

    pub fn with_whitelist(mut self, peers: Vec<String>) -> Self {
        self.whitelist.extend(peers);
        self
    }

    pub fn with_auto_ban(mut self, enabled: bool) -> Self {
        self.bans.auto_ban = enabled;
        self
    }

    /// Validate configuration values
    pub fn validate(&self) -> anyhow::Result<()> {
        let s = &self.scoring;
        let weights = [
            ("uptime_weight", s.uptime_weight),
            ("validity_weight", s.validity_weight),
            ("latency_weight", s.latency_weight),
            ("block_propagation_weight", s.block_propagation_weight),
            ("penalty_weight", s.penalty_weight),
        ];
        for (name, weight) in weights {
            if !weight.is_finite() || weight < 0.0 {
                anyhow::bail!("scoring.{} ({}) must be a non-negative number", name, weight);
            }
        }

        if s.metric_weight_sum() <= 0.0 {
            anyhow::bail!("scoring metric weights must sum to a positive value");
        }

        if !(s.decay_factor > 0.0 && s.decay_factor <= 1.0) {
            anyhow::bail!("scoring.decay_factor ({}) must be in (0, 1]", s.decay_factor);
        }

        if s.decay_period_secs == 0 {
            anyhow::bail!("scoring.decay_period_secs must be greater than 0");
        }

        if !(s.evidence_per_event > 0.0 && s.evidence_per_event <= 1.0) {
            anyhow::bail!(
                "scoring.evidence_per_event ({}) must be in (0, 1]",
                s.evidence_per_event
            );
        }

        if s.good_latency_ms >= s.max_latency_ms {
            anyhow::bail!(
                "scoring.good_latency_ms ({}) must be less than max_latency_ms ({})",
                s.good_latency_ms,
                s.max_latency_ms
            );
        }

        let p = &self.penalties;
        if p.streak_threshold == 0 {
            anyhow::bail!("penalties.streak_threshold must be at least 1");
        }

        if p.streak_multiplier < 1.0 || p.max_streak_multiplier < 1.0 {
            anyhow::bail!("penalties streak multipliers must be at least 1.0");
        }

        if p.violation_log_capacity == 0 {
            anyhow::bail!("penalties.violation_log_capacity must be at least 1");
        }

        let b = &self.bans;
        if b.ban_ladder_secs.is_empty() {
            anyhow::bail!("bans.ban_ladder_secs must not be empty");
        }

        if b.ban_ladder_secs.windows(2).any(|w| w[1] < w[0]) {
            anyhow::bail!("bans.ban_ladder_secs must be non-decreasing");
        }

        if b.max_temp_bans == 0 {
            anyhow::bail!("bans.max_temp_bans must be at least 1");
        }

        if !(0.0..=100.0).contains(&b.ban_score_threshold) || !(0.0..=100.0).contains(&b.min_accept_score) {
            anyhow::bail!("bans score thresholds must be within 0-100");
        }

        if b.ban_score_threshold > b.min_accept_score {
            anyhow::bail!(
                "bans.ban_score_threshold ({}) must not exceed min_accept_score ({})",
                b.ban_score_threshold,
                b.min_accept_score
            );
        }

        let d = &self.diversity;
        if d.max_peers_per_subnet == 0 || d.max_peers_per_asn == 0 || d.max_peers_per_country == 0 {
            anyhow::bail!("diversity caps must be at least 1");
        }

        if d.ipv4_prefix > 32 || d.ipv6_prefix > 128 {
            anyhow::bail!("diversity prefix lengths are out of range");
        }

        if self.rate_limit.window_secs == 0 {
            anyhow::bail!("rate_limit.window_secs must be greater than 0");
        }

        if self.storage.queue_capacity == 0 || self.storage.max_batch == 0 {
            anyhow::bail!("storage queue_capacity and max_batch must be at least 1");
        }

        if self.storage.flush_interval_secs == 0
            || self.storage.snapshot_interval_secs == 0
            || self.maintenance.interval_secs == 0
        {
            anyhow::bail!("storage and maintenance intervals must be greater than 0");
        }

        if self.monitor.check_interval_secs == 0 {
            anyhow::bail!("monitor.check_interval_secs must be greater than 0");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = ReputationConfig::default();
        assert_eq!(config.bans.ban_ladder_secs, vec![86_400, 604_800, 2_592_000]);
        assert_eq!(config.diversity.max_peers_per_subnet, 10);
        assert!((config.scoring.metric_weight_sum() - 0.90).abs() < 1e-9);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = ReputationConfig::default();
        config.scoring.decay_factor = 1.5;
        assert!(config.validate().is_err());

        let mut config = ReputationConfig::default();
        config.bans.ban_ladder_secs = vec![];
        assert!(config.validate().is_err());

        let mut config = ReputationConfig::default();
        config.bans.ban_ladder_secs = vec![3600, 60];
        assert!(config.validate().is_err());

        let mut config = ReputationConfig::default();
        config.diversity.max_peers_per_subnet = 0;
        assert!(config.validate().is_err());

        let mut config = ReputationConfig::default();
        config.scoring.latency_weight = -0.1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml() {
        let toml = r#"
            api_port = 9999
            whitelist = ["bootnode-1"]

            [bans]
            ban_ladder_secs = [3600, 7200]

            [diversity]
            max_peers_per_subnet = 4
        "#;

        let config: ReputationConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.api_port, 9999);
        assert_eq!(config.whitelist, vec!["bootnode-1".to_string()]);
        assert_eq!(config.bans.ban_ladder_secs, vec![3600, 7200]);
        assert_eq!(config.bans.max_temp_bans, 3);
        assert_eq!(config.diversity.max_peers_per_subnet, 4);
        assert_eq!(config.diversity.max_peers_per_asn, 15);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("reputation.toml");

        let config = ReputationConfig::default().with_api_port(7070);
        config.save(&path).unwrap();

        let loaded = ReputationConfig::load(&path).unwrap();
        assert_eq!(loaded.api_port, 7070);
        assert_eq!(loaded.storage.queue_capacity, config.storage.queue_capacity);
    }

    #[test]
    fn test_builder_methods() {
        let config = ReputationConfig::default()
            .with_api_port(9090)
            .with_whitelist(vec!["a".to_string(), "b".to_string()])
            .with_auto_ban(false);

        assert_eq!(config.api_port, 9090);
        assert_eq!(config.whitelist.len(), 2);
        assert!(!config.bans.auto_ban);
    }

    #[test]
    fn test_penalty_weights() {
        let penalties = PenaltyConfig::default();
        assert_eq!(penalties.weight(EventKind::OversizedMessage), 15.0);
        assert_eq!(penalties.weight(EventKind::DoubleSign), 100.0);
        assert_eq!(penalties.weight(EventKind::ValidMessage), 0.0);
    }
}
