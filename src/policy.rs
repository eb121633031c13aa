//! Penalty & Ban Policy
//!
//! Pure decision logic: how many penalty points a violation costs, whether a
//! record should be banned, and for how long.
//!
//! ```text
//! Clean ──violation──▶ Flagged ──trigger──▶ TemporarilyBanned ──expiry──▶ Clean
//!   │                     │                        │
//!   └─────────────────────┴──── instant trigger ───┴──▶ PermanentlyBanned
//! ```
//!
//! Temporary bans walk a ladder (24h, 7d, 30d by default). A burst of
//! violations starts one rung higher, and reaching `max_temp_bans` turns the
//! ban permanent. Expiry never resets penalty points or the ban count, so
//! reconnecting does not launder a peer's history.

use tracing::{debug, warn};

use crate::config::{BanConfig, PenaltyConfig};
use crate::types::{BanState, EventKind, PeerRecord, Timestamp, ViolationRecord};

/// Outcome of evaluating the ban policy for one event
#[derive(Debug, Clone, PartialEq)]
pub enum BanVerdict {
    None,
    Temporary { duration_secs: u64, reason: String },
    Permanent { reason: String },
}

impl BanVerdict {
    pub fn is_none(&self) -> bool {
        matches!(self, BanVerdict::None)
    }
}

/// Penalty and ban rules
#[derive(Debug, Clone)]
pub struct BanPolicy {
    penalties: PenaltyConfig,
    bans: BanConfig,
}

impl BanPolicy {
    pub fn new(penalties: PenaltyConfig, bans: BanConfig) -> Self {
        Self { penalties, bans }
    }

    pub fn penalties(&self) -> &PenaltyConfig {
        &self.penalties
    }

    pub fn bans(&self) -> &BanConfig {
        &self.bans
    }

    /// Violations inside the active streak, including any already logged at `now`
    pub fn streak_count(&self, record: &PeerRecord, now: Timestamp) -> u32 {
        let Some(anchor) = record.streak_anchor else {
            return 0;
        };
        let floor = anchor.max(now.saturating_sub(self.penalties.streak_window_secs));
        record
            .violation_log
            .iter()
            .filter(|v| v.at >= floor && v.at <= now)
            .count() as u32
    }

    /// Whether the record is in a burst of violations at `now`
    pub fn streak_active(&self, record: &PeerRecord, now: Timestamp) -> bool {
        self.streak_count(record, now) >= self.penalties.streak_threshold
    }

    /// Multiplier for a violation that is the `count`-th of its streak
    pub fn streak_multiplier(&self, count: u32) -> f64 {
        let threshold = self.penalties.streak_threshold;
        if count < threshold {
            return 1.0;
        }
        let exponent = (count - threshold + 1) as i32;
        self.penalties
            .streak_multiplier
            .powi(exponent)
            .min(self.penalties.max_streak_multiplier)
    }

    /// Log a violation and charge its penalty points
    ///
    /// Returns the points added.
    pub fn apply_violation(&self, record: &mut PeerRecord, kind: EventKind, now: Timestamp) -> f64 {
        let last_at = record.violation_log.back().map(|v| v.at);
        let streak_over = match last_at {
            Some(last) => now.saturating_sub(last) >= self.penalties.streak_cooldown_secs,
            None => true,
        };
        if streak_over || record.streak_anchor.is_none() {
            record.streak_anchor = Some(now);
        }

        record.violation_log.push_back(ViolationRecord { kind, at: now });
        self.prune_violation_log(record, now);
        record.metrics.violations.increment(kind);

        let count = self.streak_count(record, now);
        let multiplier = self.streak_multiplier(count);
        let points = self.penalties.weight(kind) * multiplier;
        record.penalty_points += points;

        debug!(
            "Peer {} {}: +{:.1} penalty points (x{:.2}, streak {}), total {:.1}",
            record.peer_id.short(),
            kind,
            points,
            multiplier,
            count,
            record.penalty_points
        );

        points
    }

    /// Drop entries past retention or capacity
    pub fn prune_violation_log(&self, record: &mut PeerRecord, now: Timestamp) {
        let cutoff = now.saturating_sub(self.penalties.violation_retention_secs);
        while record.violation_log.front().is_some_and(|v| v.at < cutoff) {
            record.violation_log.pop_front();
        }
        while record.violation_log.len() > self.penalties.violation_log_capacity {
            record.violation_log.pop_front();
        }
    }

    /// Decide whether `kind` at `now` should ban the record
    ///
    /// Caller guarantees the record is not whitelisted and the event is
    /// adverse; score and penalty points must already reflect the event.
    pub fn evaluate(&self, record: &PeerRecord, kind: EventKind, now: Timestamp) -> BanVerdict {
        if record.whitelisted || record.ban.is_permanent() {
            return BanVerdict::None;
        }

        if let Some(reason) = self.permanent_trigger(record, kind) {
            return BanVerdict::Permanent { reason };
        }

        if record.ban.is_active(now) {
            return BanVerdict::None;
        }

        match self.temporary_trigger(record, kind) {
            Some(reason) => BanVerdict::Temporary {
                duration_secs: self.ladder_duration(record, now),
                reason,
            },
            None => BanVerdict::None,
        }
    }

    fn permanent_trigger(&self, record: &PeerRecord, kind: EventKind) -> Option<String> {
        let violations = &record.metrics.violations;

        if kind == EventKind::DoubleSign {
            return Some("double signing".to_string());
        }

        if violations.invalid_block >= self.bans.invalid_block_ban_count {
            return Some(format!("{} invalid blocks", violations.invalid_block));
        }

        if kind == EventKind::ProtocolViolation && record.score < self.bans.ban_score_threshold {
            let sustained = record
                .violation_log
                .iter()
                .filter(|v| v.kind == EventKind::ProtocolViolation)
                .count();
            if sustained >= self.bans.sustained_violation_count {
                return Some(format!(
                    "sustained protocol violations ({}) with score {:.1}",
                    sustained, record.score
                ));
            }
        }

        None
    }

    fn temporary_trigger(&self, record: &PeerRecord, kind: EventKind) -> Option<String> {
        let metrics = &record.metrics;

        if kind == EventKind::OversizedMessage {
            return Some("oversized message".to_string());
        }

        if metrics.violations.spam >= self.bans.spam_ban_count {
            return Some(format!("{} spam attempts", metrics.violations.spam));
        }

        if record.penalty_points > self.bans.ban_penalty_threshold {
            return Some(format!("penalty points {:.1}", record.penalty_points));
        }

        if record.score < self.bans.ban_score_threshold {
            return Some(format!("score {:.1}", record.score));
        }

        if metrics.total_messages() >= self.bans.min_messages_for_validity_ban {
            if let Some(ratio) = metrics.validity_ratio() {
                if ratio < self.bans.validity_ban_ratio {
                    return Some(format!("message validity {:.0}%", ratio * 100.0));
                }
            }
        }

        None
    }

    /// Ladder rung for the next temporary ban
    pub fn ladder_tier(&self, record: &PeerRecord, now: Timestamp) -> usize {
        let burst = usize::from(self.streak_active(record, now));
        let tier = record.temp_ban_count as usize + burst;
        tier.min(self.bans.ban_ladder_secs.len().saturating_sub(1))
    }

    fn ladder_duration(&self, record: &PeerRecord, now: Timestamp) -> u64 {
        self.bans
            .ban_ladder_secs
            .get(self.ladder_tier(record, now))
            .copied()
            .unwrap_or(0)
    }

    /// Apply a verdict to the record, returning the new ban state if it changed
    pub fn apply_verdict(
        &self,
        record: &mut PeerRecord,
        verdict: BanVerdict,
        now: Timestamp,
    ) -> Option<BanState> {
        let state = match verdict {
            BanVerdict::None => return None,
            BanVerdict::Permanent { reason } => BanState::Permanent { since: now, reason },
            BanVerdict::Temporary { duration_secs, reason } => {
                record.temp_ban_count += 1;
                if record.temp_ban_count >= self.bans.max_temp_bans {
                    BanState::Permanent {
                        since: now,
                        reason: format!("{} after {} temporary bans", reason, record.temp_ban_count),
                    }
                } else {
                    BanState::Temporary {
                        since: now,
                        expires_at: now.saturating_add(duration_secs),
                        reason,
                    }
                }
            }
        };

        warn!(
            "⛔ Peer {} banned ({}): {}",
            record.peer_id.short(),
            state.label(),
            state.reason().unwrap_or_default()
        );

        record.ban = state.clone();
        Some(state)
    }

    /// Lift an expired temporary ban; counters and points are kept
    pub fn clear_expired(&self, record: &mut PeerRecord, now: Timestamp) -> bool {
        if record.ban.is_temporary() && !record.ban.is_active(now) {
            debug!("Temporary ban expired for peer {}", record.peer_id.short());
            record.ban = BanState::None;
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PeerId;

    const HOUR: u64 = 3_600;
    const DAY: u64 = 86_400;

    fn policy() -> BanPolicy {
        BanPolicy::new(PenaltyConfig::default(), BanConfig::default())
    }

    fn record() -> PeerRecord {
        PeerRecord::new(PeerId::from("offender"), 0)
    }

    #[test]
    fn test_streak_cooldown_and_window_are_separate() {
        let pv = EventKind::ProtocolViolation;

        // A 70s pause outlasts a 60s cooldown and restarts the streak
        let short_cooldown = BanPolicy::new(
            PenaltyConfig { streak_cooldown_secs: 60, ..PenaltyConfig::default() },
            BanConfig::default(),
        );
        let mut paused = record();
        short_cooldown.apply_violation(&mut paused, pv, 0);
        short_cooldown.apply_violation(&mut paused, pv, 30);
        assert_eq!(paused.streak_anchor, Some(0));
        short_cooldown.apply_violation(&mut paused, pv, 100);
        assert_eq!(paused.streak_anchor, Some(100));
        let points = short_cooldown.apply_violation(&mut paused, pv, 110);
        assert_eq!(short_cooldown.streak_count(&paused, 110), 2);
        assert_eq!(points, 5.0);

        // Same timeline under the default cooldown is one streak of four
        let default_policy = policy();
        let mut steady = record();
        for at in [0, 30, 100] {
            default_policy.apply_violation(&mut steady, pv, at);
        }
        let points = default_policy.apply_violation(&mut steady, pv, 110);
        assert_eq!(steady.streak_anchor, Some(0));
        assert_eq!(default_policy.streak_count(&steady, 110), 4);
        assert!((points - 9.8).abs() < 1e-9);

        // A window shorter than the cooldown only counts recent violations
        let short_window = BanPolicy::new(
            PenaltyConfig { streak_window_secs: 60, ..PenaltyConfig::default() },
            BanConfig::default(),
        );
        let mut spread = record();
        for at in [0, 20, 40] {
            short_window.apply_violation(&mut spread, pv, at);
        }
        assert!(short_window.streak_active(&spread, 40));
        let points = short_window.apply_violation(&mut spread, pv, 90);
        assert_eq!(spread.streak_anchor, Some(0));
        assert_eq!(short_window.streak_count(&spread, 90), 2);
        assert_eq!(points, 5.0);
    }

    #[test]
    fn test_streak_multiplier_curve() {
        let policy = policy();
        assert_eq!(policy.streak_multiplier(1), 1.0);
        assert_eq!(policy.streak_multiplier(2), 1.0);
        assert!((policy.streak_multiplier(3) - 1.4).abs() < 1e-12);
        assert!((policy.streak_multiplier(4) - 1.96).abs() < 1e-12);
        assert_eq!(policy.streak_multiplier(10), 3.0);
    }

    #[test]
    fn test_spam_burst_accrues_multiplied_points() {
        let policy = policy();
        let mut record = record();

        let mut total = 0.0;
        for i in 0..6 {
            total += policy.apply_violation(&mut record, EventKind::SpamAttempt, 1_000 + i * 10);
        }

        // 10 + 10 + 14 + 19.6 + 27.44 + 30
        assert!((total - 111.04).abs() < 1e-9);
        assert!((record.penalty_points - 111.04).abs() < 1e-9);
        assert_eq!(record.metrics.violations.spam, 6);
        assert!(policy.streak_active(&record, 1_050));
    }

    #[test]
    fn test_spaced_violations_do_not_streak() {
        let policy = policy();
        let mut record = record();

        for i in 0..5 {
            let points = policy.apply_violation(&mut record, EventKind::ProtocolViolation, i * 11 * 60);
            assert_eq!(points, 5.0);
        }
        assert!(!policy.streak_active(&record, 4 * 11 * 60));
    }

    #[test]
    fn test_violation_log_bounded() {
        let policy = policy();
        let mut record = record();

        for i in 0..100 {
            policy.apply_violation(&mut record, EventKind::MalformedMessage, i);
        }
        assert_eq!(record.violation_log.len(), 64);

        policy.prune_violation_log(&mut record, 100 + DAY + 1);
        assert!(record.violation_log.is_empty());
        assert_eq!(record.metrics.violations.malformed, 100);
    }

    #[test]
    fn test_double_sign_is_permanent() {
        let policy = policy();
        let mut record = record();
        policy.apply_violation(&mut record, EventKind::DoubleSign, 10);

        let verdict = policy.evaluate(&record, EventKind::DoubleSign, 10);
        assert!(matches!(verdict, BanVerdict::Permanent { .. }));
    }

    #[test]
    fn test_oversized_first_offence_is_one_day() {
        let policy = policy();
        let mut record = record();
        policy.apply_violation(&mut record, EventKind::OversizedMessage, 10);

        let verdict = policy.evaluate(&record, EventKind::OversizedMessage, 10);
        assert_eq!(
            verdict,
            BanVerdict::Temporary { duration_secs: DAY, reason: "oversized message".to_string() }
        );

        let state = policy.apply_verdict(&mut record, verdict, 10).unwrap();
        assert_eq!(state.expires_at(), Some(10 + DAY));
        assert_eq!(record.temp_ban_count, 1);
    }

    #[test]
    fn test_temp_ban_blocks_further_temp_verdicts() {
        let policy = policy();
        let mut record = record();
        policy.apply_violation(&mut record, EventKind::OversizedMessage, 10);
        let verdict = policy.evaluate(&record, EventKind::OversizedMessage, 10);
        policy.apply_verdict(&mut record, verdict, 10);

        policy.apply_violation(&mut record, EventKind::OversizedMessage, 20);
        assert!(policy.evaluate(&record, EventKind::OversizedMessage, 20).is_none());

        // Instant-permanent triggers still apply while banned
        policy.apply_violation(&mut record, EventKind::DoubleSign, 30);
        assert!(matches!(
            policy.evaluate(&record, EventKind::DoubleSign, 30),
            BanVerdict::Permanent { .. }
        ));
    }

    #[test]
    fn test_ladder_escalates_to_permanent() {
        let policy = policy();
        let mut record = record();
        record.penalty_points = 150.0;

        let first = policy.evaluate(&record, EventKind::ProtocolViolation, 0);
        assert!(matches!(first, BanVerdict::Temporary { duration_secs: DAY, .. }));
        policy.apply_verdict(&mut record, first, 0);

        assert!(policy.clear_expired(&mut record, DAY));
        let second = policy.evaluate(&record, EventKind::ProtocolViolation, DAY);
        assert!(matches!(second, BanVerdict::Temporary { duration_secs: 604_800, .. }));
        policy.apply_verdict(&mut record, second, DAY);

        let later = DAY + 604_800;
        assert!(policy.clear_expired(&mut record, later));
        let third = policy.evaluate(&record, EventKind::ProtocolViolation, later);
        let state = policy.apply_verdict(&mut record, third, later).unwrap();
        assert!(state.is_permanent());
        assert_eq!(record.temp_ban_count, 3);
    }

    #[test]
    fn test_burst_starts_higher_on_ladder() {
        let policy = policy();
        let mut record = record();
        for i in 0..3 {
            policy.apply_violation(&mut record, EventKind::ProtocolViolation, 100 + i);
        }
        assert_eq!(policy.ladder_tier(&record, 102), 1);
        assert_eq!(policy.ladder_tier(&record, 102 + HOUR), 0);
    }

    #[test]
    fn test_three_invalid_blocks_is_permanent() {
        let policy = policy();
        let mut record = record();
        for i in 0..2 {
            policy.apply_violation(&mut record, EventKind::InvalidBlock, i * HOUR);
        }
        assert!(!matches!(
            policy.evaluate(&record, EventKind::InvalidBlock, HOUR),
            BanVerdict::Permanent { .. }
        ));

        policy.apply_violation(&mut record, EventKind::InvalidBlock, 2 * HOUR);
        assert!(matches!(
            policy.evaluate(&record, EventKind::InvalidBlock, 2 * HOUR),
            BanVerdict::Permanent { .. }
        ));
    }

    #[test]
    fn test_low_validity_ratio_bans() {
        let policy = policy();
        let mut record = record();
        record.metrics.valid_message_count = 40;
        record.metrics.invalid_message_count = 60;

        let verdict = policy.evaluate(&record, EventKind::InvalidMessage, 0);
        assert!(matches!(verdict, BanVerdict::Temporary { .. }));
    }

    #[test]
    fn test_whitelisted_never_banned() {
        let policy = policy();
        let mut record = record();
        record.whitelisted = true;
        record.penalty_points = 500.0;
        assert!(policy.evaluate(&record, EventKind::DoubleSign, 0).is_none());
    }
}
