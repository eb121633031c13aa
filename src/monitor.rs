//! Reputation Monitor
//!
//! Periodic health checks over the peer population. Reads the manager and
//! the metrics, raises alerts with a per-kind cooldown and keeps a bounded
//! alert history. Never mutates peer records.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::api::Metrics;
use crate::config::MonitorConfig;
use crate::registry::ReputationManager;
use crate::types::{current_timestamp, Timestamp};

const SECS_PER_HOUR: f64 = 3_600.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    HighBanRate,
    LowAverageScore,
    SubnetConcentration,
    GeographicConcentration,
    StorageDegraded,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::HighBanRate => "high_ban_rate",
            AlertKind::LowAverageScore => "low_average_score",
            AlertKind::SubnetConcentration => "subnet_concentration",
            AlertKind::GeographicConcentration => "geographic_concentration",
            AlertKind::StorageDegraded => "storage_degraded",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

/// A raised alert
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    pub message: String,
    /// Observed value
    pub value: f64,
    /// Threshold it crossed
    pub threshold: f64,
    pub raised_at: Timestamp,
}

/// Result of the latest health check
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub issues: Vec<String>,
    pub total_peers: usize,
    pub banned_peers: usize,
    pub average_score: f64,
    pub storage_healthy: bool,
    pub last_check: Timestamp,
}

#[derive(Default)]
struct MonitorState {
    alerts: VecDeque<Alert>,
    last_raised: HashMap<AlertKind, Timestamp>,
    /// Time and ban counter of the previous check
    baseline: Option<(Timestamp, u64)>,
    health: Option<HealthStatus>,
}

/// Health checker and alert source
pub struct ReputationMonitor {
    manager: Arc<ReputationManager>,
    config: MonitorConfig,
    metrics: Arc<Metrics>,
    state: Mutex<MonitorState>,
}

impl ReputationMonitor {
    pub fn new(manager: Arc<ReputationManager>, config: MonitorConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            manager,
            config,
            metrics,
            state: Mutex::new(MonitorState::default()),
        }
    }

    /// Run one health check now
    pub fn check(&self) -> HealthStatus {
        self.check_at(current_timestamp())
    }

    pub fn check_at(&self, now: Timestamp) -> HealthStatus {
        let stats = self.manager.stats_at(now);
        self.metrics.update_from_stats(&stats);

        let storage_healthy = !self.manager.storage_degraded();
        let enough_peers = stats.total_peers > self.config.min_peers_for_alerts;
        let mut issues = Vec::new();
        let mut raised = Vec::new();

        let total_bans = self.metrics.total_bans();
        let mut state = self.state.lock();

        // The first check only records a baseline
        if let Some((since, bans_then)) = state.baseline {
            let elapsed = now.saturating_sub(since);
            if elapsed > 0 {
                let per_hour = total_bans.saturating_sub(bans_then) as f64 * SECS_PER_HOUR / elapsed as f64;
                if per_hour > self.config.ban_rate_alert_per_hour {
                    raised.push(self.alert(
                        AlertKind::HighBanRate,
                        AlertSeverity::Warning,
                        format!("{:.1} bans per hour", per_hour),
                        per_hour,
                        self.config.ban_rate_alert_per_hour,
                        now,
                    ));
                }
            }
        }
        state.baseline = Some((now, total_bans));

        if enough_peers && stats.average_score < self.config.low_average_score {
            raised.push(self.alert(
                AlertKind::LowAverageScore,
                AlertSeverity::Warning,
                format!("average score {:.1} over {} peers", stats.average_score, stats.total_peers),
                stats.average_score,
                self.config.low_average_score,
                now,
            ));
        }

        let concentration = self.manager.diversity().concentration();
        if concentration.connected > self.config.min_peers_for_alerts {
            if let Some((subnet, share)) = &concentration.top_subnet {
                if *share > self.config.subnet_concentration_alert {
                    raised.push(self.alert(
                        AlertKind::SubnetConcentration,
                        AlertSeverity::Warning,
                        format!("{:.0}% of connected peers in {}", share * 100.0, subnet),
                        *share,
                        self.config.subnet_concentration_alert,
                        now,
                    ));
                }
            }
            if let Some((country, share)) = &concentration.top_country {
                if *share > self.config.country_concentration_alert {
                    raised.push(self.alert(
                        AlertKind::GeographicConcentration,
                        AlertSeverity::Warning,
                        format!("{:.0}% of connected peers in {}", share * 100.0, country),
                        *share,
                        self.config.country_concentration_alert,
                        now,
                    ));
                }
            }
        }

        if !storage_healthy {
            issues.push("storage degraded".to_string());
            raised.push(self.alert(
                AlertKind::StorageDegraded,
                AlertSeverity::Critical,
                "storage writes failing, running from memory".to_string(),
                1.0,
                0.0,
                now,
            ));
        }

        if enough_peers {
            let ban_ratio = stats.banned_peers as f64 / stats.total_peers as f64;
            if ban_ratio > self.config.unhealthy_ban_ratio {
                issues.push(format!("{:.0}% of peers banned", ban_ratio * 100.0));
            }
        }

        for alert in raised {
            self.raise(&mut state, alert);
        }

        let health = HealthStatus {
            healthy: issues.is_empty(),
            issues,
            total_peers: stats.total_peers,
            banned_peers: stats.banned_peers,
            average_score: stats.average_score,
            storage_healthy,
            last_check: now,
        };

        debug!(
            "Health check: {} peers, {} banned, avg score {:.1}, healthy {}",
            health.total_peers, health.banned_peers, health.average_score, health.healthy
        );

        state.health = Some(health.clone());
        health
    }

    fn alert(
        &self,
        kind: AlertKind,
        severity: AlertSeverity,
        message: String,
        value: f64,
        threshold: f64,
        now: Timestamp,
    ) -> Alert {
        Alert { kind, severity, message, value, threshold, raised_at: now }
    }

    fn raise(&self, state: &mut MonitorState, alert: Alert) {
        if let Some(last) = state.last_raised.get(&alert.kind) {
            if alert.raised_at.saturating_sub(*last) < self.config.alert_cooldown_secs {
                return;
            }
        }

        match alert.severity {
            AlertSeverity::Critical => error!("🚨 {}: {}", alert.kind.as_str(), alert.message),
            AlertSeverity::Warning => warn!("⚠️ {}: {}", alert.kind.as_str(), alert.message),
        }

        state.last_raised.insert(alert.kind, alert.raised_at);
        state.alerts.push_back(alert);
        while state.alerts.len() > self.config.max_alerts {
            state.alerts.pop_front();
        }
    }

    /// Latest health status, running a check if none exists yet
    pub fn health(&self) -> HealthStatus {
        let cached = self.state.lock().health.clone();
        match cached {
            Some(health) => health,
            None => self.check(),
        }
    }

    /// Alerts raised at or after `since`
    pub fn alerts_since(&self, since: Timestamp) -> Vec<Alert> {
        self.state
            .lock()
            .alerts
            .iter()
            .filter(|a| a.raised_at >= since)
            .cloned()
            .collect()
    }

    /// Periodic health check loop
    pub async fn run(self: Arc<Self>) {
        let period = Duration::from_secs(self.config.check_interval_secs.max(1));
        let mut interval = tokio::time::interval(period);
        info!("📊 Health monitor running every {}s", period.as_secs());

        loop {
            interval.tick().await;
            let health = self.check();
            if !health.healthy {
                warn!("Reputation engine unhealthy: {}", health.issues.join(", "));
            }
        }
    }
}
