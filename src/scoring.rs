//! Peer Scoring Model
//!
//! Turns raw peer metrics into a bounded 0-100 trust score.
//!
//! The score blends four sub-scores (uptime, message validity, latency and
//! block propagation), each in [0, 1], with a penalty term:
//!
//! ```text
//! metric = 100 · Σ wᵢ·sᵢ / Σ wᵢ
//! score  = clamp(50 + evidence · (metric − 50) − w_P · penalty_points)
//! ```
//!
//! `evidence` grows with every observed event, so a peer we barely know sits
//! near the neutral score. Decay scales evidence and penalty points by the
//! same factor, which moves the score toward 50 without overshooting.

use serde::{Deserialize, Serialize};
use tracing::error;

use crate::config::ScoringConfig;
use crate::types::{PeerMetrics, PeerRecord, Timestamp, MAX_SCORE, MIN_SCORE, NEUTRAL_SCORE};

/// Sub-score used when there is no data for a dimension
const NEUTRAL_SUB_SCORE: f64 = 0.5;

/// Bonus applied to long sessions and mostly-fast block relays
const BONUS_MULTIPLIER: f64 = 1.1;

/// Per-dimension scores, each in [0, 1]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SubScores {
    pub uptime: f64,
    pub validity: f64,
    pub latency: f64,
    pub block_propagation: f64,
}

/// Compute every sub-score for a record
pub fn sub_scores(record: &PeerRecord, config: &ScoringConfig) -> SubScores {
    SubScores {
        uptime: uptime_score(&record.metrics, record.first_seen, record.last_seen, config),
        validity: validity_score(&record.metrics),
        latency: latency_score(&record.metrics, config),
        block_propagation: block_propagation_score(&record.metrics, config),
    }
}

/// Weighted metric score in [0, 100], ignoring evidence and penalties
pub fn metric_score(scores: &SubScores, config: &ScoringConfig) -> f64 {
    let weight_sum = config.metric_weight_sum();
    if weight_sum <= 0.0 {
        return NEUTRAL_SCORE;
    }

    let weighted = config.uptime_weight * scores.uptime
        + config.validity_weight * scores.validity
        + config.latency_weight * scores.latency
        + config.block_propagation_weight * scores.block_propagation;

    MAX_SCORE * weighted / weight_sum
}

/// Recompute the score of a record from its metrics and penalty points
pub fn compute_score(record: &PeerRecord, config: &ScoringConfig) -> f64 {
    let metric = metric_score(&sub_scores(record, config), config);
    let evidence = record.metrics.evidence.clamp(0.0, 1.0);

    let raw = NEUTRAL_SCORE + evidence * (metric - NEUTRAL_SCORE)
        - config.penalty_weight * record.penalty_points;

    clamp_score(raw)
}

/// Clamp score to valid range
///
/// A non-finite input is a bug upstream; it is logged and mapped to 0.
pub fn clamp_score(score: f64) -> f64 {
    if !score.is_finite() {
        error!("Non-finite peer score {} computed, clamping to {}", score, MIN_SCORE);
        return MIN_SCORE;
    }
    score.clamp(MIN_SCORE, MAX_SCORE)
}

/// Uptime sub-score
///
/// 70% uptime ratio, 30% connection stability, with a bonus for long
/// average sessions. Measured up to `last_seen`, not wall-clock time, so the
/// value only moves when the peer does something.
pub fn uptime_score(
    metrics: &PeerMetrics,
    first_seen: Timestamp,
    last_seen: Timestamp,
    config: &ScoringConfig,
) -> f64 {
    if metrics.connection_count == 0 {
        return NEUTRAL_SUB_SCORE;
    }

    let known = last_seen.saturating_sub(first_seen);
    let uptime = metrics.uptime_until(last_seen);
    let ratio = if known == 0 {
        if metrics.is_connected() { 1.0 } else { NEUTRAL_SUB_SCORE }
    } else {
        (uptime as f64 / known as f64).min(1.0)
    };

    let stability = (1.0
        - 0.5 * metrics.disconnection_count as f64 / metrics.connection_count as f64)
        .max(0.0);

    let mut score = 0.7 * ratio + 0.3 * stability;
    if metrics.avg_session_secs(last_seen) >= config.min_session_for_bonus_secs {
        score *= BONUS_MULTIPLIER;
    }

    score.clamp(0.0, 1.0)
}

/// Message validity sub-score, piecewise in the decayed valid ratio
pub fn validity_score(metrics: &PeerMetrics) -> f64 {
    let Some(ratio) = metrics.recent_validity_ratio() else {
        return NEUTRAL_SUB_SCORE;
    };

    let score = if ratio >= 0.95 {
        0.80 + (ratio - 0.95) / 0.05 * 0.20
    } else if ratio >= 0.80 {
        0.40 + (ratio - 0.80) / 0.15 * 0.40
    } else {
        ratio / 0.80 * 0.40
    };

    score.clamp(0.0, 1.0)
}

/// Latency sub-score
///
/// Linear bands up to `max_latency_ms`, exponential decay beyond it.
pub fn latency_score(metrics: &PeerMetrics, config: &ScoringConfig) -> f64 {
    if metrics.latency_samples == 0 {
        return NEUTRAL_SUB_SCORE;
    }

    let latency = metrics.avg_latency_ms.max(0.0);
    let good = config.good_latency_ms as f64;
    let max = config.max_latency_ms as f64;

    let score = if latency <= good {
        0.80 + (1.0 - latency / good) * 0.20
    } else if latency <= max {
        0.40 + (1.0 - (latency - good) / (max - good)) * 0.40
    } else {
        0.40 * (-config.latency_decay_per_sec * (latency - max) / 1000.0).exp()
    };

    score.clamp(0.0, 1.0)
}

/// Block propagation sub-score
///
/// Bands: under 1s, 1-5s, 5-30s and beyond, with a bonus when more than
/// 80% of relayed blocks were fast.
pub fn block_propagation_score(metrics: &PeerMetrics, config: &ScoringConfig) -> f64 {
    if metrics.blocks_propagated == 0 {
        return NEUTRAL_SUB_SCORE;
    }

    let t = metrics.avg_block_propagation_ms.max(0.0);
    let fast = config.fast_block_ms as f64;
    let slow = 5.0 * fast;
    let very_slow = 30.0 * fast;

    let mut score = if t < fast {
        0.90 + (1.0 - t / fast) * 0.10
    } else if t < slow {
        0.60 + (1.0 - (t - fast) / (slow - fast)) * 0.30
    } else if t < very_slow {
        0.30 + (1.0 - (t - slow) / (very_slow - slow)) * 0.30
    } else {
        0.30 * (-(t - very_slow) / very_slow).exp()
    };

    if metrics.fast_block_ratio().unwrap_or(0.0) > 0.8 {
        score *= BONUS_MULTIPLIER;
    }

    score.clamp(0.0, 1.0)
}

/// Weight of accumulated evidence after `elapsed_secs` of decay
pub fn decay_weight(elapsed_secs: u64, config: &ScoringConfig) -> f64 {
    if config.decay_period_secs == 0 {
        return 1.0;
    }
    let periods = elapsed_secs as f64 / config.decay_period_secs as f64;
    config.decay_factor.powf(periods).clamp(0.0, 1.0)
}

/// Decay a record's accumulated counters up to `now`
///
/// Returns the applied weight, or `None` when no time has passed.
pub fn apply_decay(record: &mut PeerRecord, now: Timestamp, config: &ScoringConfig) -> Option<f64> {
    let elapsed = now.saturating_sub(record.last_decay_at);
    if elapsed == 0 {
        return None;
    }

    let weight = decay_weight(elapsed, config);
    let metrics = &mut record.metrics;
    metrics.evidence *= weight;
    metrics.recent_valid *= weight;
    metrics.recent_invalid *= weight;
    record.penalty_points *= weight;
    record.last_decay_at = now;

    record.score = compute_score(record, config);
    Some(weight)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PeerId;

    fn record() -> PeerRecord {
        PeerRecord::new(PeerId::from("peer"), 1_000)
    }

    #[test]
    fn test_fresh_record_is_neutral() {
        let config = ScoringConfig::default();
        let record = record();
        assert_eq!(compute_score(&record, &config), NEUTRAL_SCORE);
        let subs = sub_scores(&record, &config);
        assert_eq!(subs.uptime, 0.5);
        assert_eq!(metric_score(&subs, &config), NEUTRAL_SCORE);
    }

    #[test]
    fn test_clamp_score() {
        assert_eq!(clamp_score(-50.0), MIN_SCORE);
        assert_eq!(clamp_score(300.0), MAX_SCORE);
        assert_eq!(clamp_score(42.0), 42.0);
        assert_eq!(clamp_score(f64::NAN), MIN_SCORE);
        assert_eq!(clamp_score(f64::INFINITY), MIN_SCORE);
    }

    #[test]
    fn test_validity_bands() {
        let mut metrics = PeerMetrics::default();
        metrics.recent_valid = 100.0;
        assert!((validity_score(&metrics) - 1.0).abs() < 1e-9);

        metrics.recent_valid = 95.0;
        metrics.recent_invalid = 5.0;
        assert!((validity_score(&metrics) - 0.80).abs() < 1e-9);

        metrics.recent_valid = 80.0;
        metrics.recent_invalid = 20.0;
        assert!((validity_score(&metrics) - 0.40).abs() < 1e-9);

        metrics.recent_valid = 40.0;
        metrics.recent_invalid = 60.0;
        assert!((validity_score(&metrics) - 0.20).abs() < 1e-9);
    }

    #[test]
    fn test_latency_bands() {
        let config = ScoringConfig::default();
        let mut metrics = PeerMetrics::default();

        metrics.add_latency_sample(0);
        assert!((latency_score(&metrics, &config) - 1.0).abs() < 1e-9);

        metrics = PeerMetrics::default();
        metrics.add_latency_sample(500);
        assert!((latency_score(&metrics, &config) - 0.80).abs() < 1e-9);

        metrics = PeerMetrics::default();
        metrics.add_latency_sample(2_000);
        assert!((latency_score(&metrics, &config) - 0.40).abs() < 1e-9);

        metrics = PeerMetrics::default();
        metrics.add_latency_sample(4_000);
        let expected = 0.40 * (-1.0f64).exp();
        assert!((latency_score(&metrics, &config) - expected).abs() < 1e-9);
    }

    #[test]
    fn test_block_propagation_bands() {
        let config = ScoringConfig::default();

        let mut fast = PeerMetrics::default();
        for _ in 0..10 {
            fast.add_block_propagation(200, config.fast_block_ms);
        }
        assert!(block_propagation_score(&fast, &config) > 0.95);

        let mut medium = PeerMetrics::default();
        medium.add_block_propagation(3_000, config.fast_block_ms);
        let score = block_propagation_score(&medium, &config);
        assert!((0.60..0.90).contains(&score));

        let mut slow = PeerMetrics::default();
        slow.add_block_propagation(60_000, config.fast_block_ms);
        assert!(block_propagation_score(&slow, &config) < 0.30);
    }

    #[test]
    fn test_uptime_stability() {
        let config = ScoringConfig::default();
        let mut metrics = PeerMetrics::default();

        // Connected the whole time, one long session
        metrics.connection_count = 1;
        metrics.session_started_at = Some(0);
        let steady = uptime_score(&metrics, 0, 7_200, &config);
        assert!((steady - 1.0).abs() < 1e-9);

        // Flapping connection: many short sessions
        let mut flappy = PeerMetrics::default();
        flappy.connection_count = 20;
        flappy.disconnection_count = 20;
        flappy.total_uptime_secs = 600;
        let unstable = uptime_score(&flappy, 0, 7_200, &config);
        assert!(unstable < 0.3);
    }

    #[test]
    fn test_penalty_lowers_score() {
        let config = ScoringConfig::default();
        let mut record = record();
        record.penalty_points = 150.0;
        assert!((compute_score(&record, &config) - 35.0).abs() < 1e-9);

        record.penalty_points = 1_000.0;
        assert_eq!(compute_score(&record, &config), MIN_SCORE);
    }

    #[test]
    fn test_full_evidence_matches_weighted_formula() {
        let config = ScoringConfig::default();
        let mut record = record();
        record.metrics.evidence = 1.0;
        record.metrics.recent_valid = 100.0;
        record.metrics.add_latency_sample(0);

        let subs = sub_scores(&record, &config);
        let expected = 100.0
            * (0.25 * subs.uptime + 0.30 * subs.validity + 0.20 * subs.latency + 0.15 * subs.block_propagation)
            / 0.90;
        assert!((compute_score(&record, &config) - expected).abs() < 1e-9);
    }

    #[test]
    fn test_decay_weight() {
        let config = ScoringConfig::default();
        assert_eq!(decay_weight(0, &config), 1.0);
        assert!((decay_weight(86_400, &config) - 0.95).abs() < 1e-12);
        assert!((decay_weight(2 * 86_400, &config) - 0.9025).abs() < 1e-12);
    }

    #[test]
    fn test_decay_moves_toward_neutral() {
        let config = ScoringConfig::default();
        let mut record = record();
        record.metrics.evidence = 1.0;
        record.metrics.recent_valid = 200.0;
        record.metrics.add_latency_sample(50);
        record.score = compute_score(&record, &config);
        let before = record.score;
        assert!(before > NEUTRAL_SCORE);

        let weight = apply_decay(&mut record, 1_000 + 86_400, &config).unwrap();
        assert!((weight - 0.95).abs() < 1e-12);
        let expected = NEUTRAL_SCORE + 0.95 * (before - NEUTRAL_SCORE);
        assert!((record.score - expected).abs() < 1e-9);

        // Same timestamp again is a no-op
        assert!(apply_decay(&mut record, 1_000 + 86_400, &config).is_none());
    }
}
