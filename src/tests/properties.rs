// Property Tests
// Invariants that must hold for any event stream: bounded scores, non-negative
// penalty points, consistent ban state and decay toward neutral

#[cfg(test)]
mod tests {
    use crate::api::Metrics;
    use crate::config::{ReputationConfig, ScoringConfig};
    use crate::registry::{EventOutcome, ReputationManager};
    use crate::scoring::{apply_decay, compute_score};
    use crate::types::*;
    use proptest::prelude::*;
    use std::sync::Arc;

    // =========================================================================
    // GENERATORS
    // =========================================================================

    /// (kind, seconds since previous event, latency)
    fn event_stream() -> impl Strategy<Value = Vec<(usize, u64, Option<u64>)>> {
        prop::collection::vec(
            (0..EventKind::COUNT, 0u64..4_000, prop::option::of(0u64..40_000)),
            1..150,
        )
    }

    fn replay(manager: &ReputationManager, peer: &str, stream: &[(usize, u64, Option<u64>)]) -> Timestamp {
        let mut now = 1_000;
        for (kind, gap, latency) in stream {
            now += gap;
            let mut event = PeerEvent::new(peer, EventKind::ALL[*kind])
                .at(now)
                .with_address("10.20.30.40:30333");
            event.data.latency_ms = *latency;
            let outcome = manager.record_event(event);
            if let EventOutcome::Recorded { score } = outcome {
                assert!((MIN_SCORE..=MAX_SCORE).contains(&score));
            }
        }
        now
    }

    // =========================================================================
    // PROPERTIES
    // =========================================================================

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn test_score_stays_in_range(stream in event_stream()) {
            let manager = ReputationManager::new(Arc::new(ReputationConfig::default()), Arc::new(Metrics::new()));
            let end = replay(&manager, "fuzzed", &stream);

            let record = manager.get_peer(&PeerId::from("fuzzed")).unwrap();
            prop_assert!(record.score.is_finite());
            prop_assert!((MIN_SCORE..=MAX_SCORE).contains(&record.score));
            prop_assert!(record.penalty_points >= 0.0);
            prop_assert!((0.0..=1.0).contains(&record.metrics.evidence));

            manager.run_maintenance(end + 30 * 86_400);
            if let Some(record) = manager.get_peer(&PeerId::from("fuzzed")) {
                prop_assert!((MIN_SCORE..=MAX_SCORE).contains(&record.score));
            }
        }

        #[test]
        fn test_ban_state_is_consistent(stream in event_stream()) {
            let manager = ReputationManager::new(Arc::new(ReputationConfig::default()), Arc::new(Metrics::new()));
            replay(&manager, "fuzzed", &stream);

            let record = manager.get_peer(&PeerId::from("fuzzed")).unwrap();
            let max_temp_bans = manager.config().bans.max_temp_bans;
            match &record.ban {
                BanState::Temporary { since, expires_at, .. } => {
                    prop_assert!(expires_at > since);
                    prop_assert!(record.temp_ban_count < max_temp_bans);
                }
                BanState::Permanent { .. } | BanState::None => {}
            }
            if record.temp_ban_count >= max_temp_bans {
                prop_assert!(record.ban.is_permanent());
            }
            prop_assert!(record.violation_log.len() <= manager.config().penalties.violation_log_capacity);
        }

        #[test]
        fn test_whitelisted_never_accrues_points(stream in event_stream()) {
            let config = ReputationConfig::default().with_whitelist(vec!["friend".to_string()]);
            let manager = ReputationManager::new(Arc::new(config), Arc::new(Metrics::new()));
            replay(&manager, "friend", &stream);

            let record = manager.get_peer(&PeerId::from("friend")).unwrap();
            prop_assert_eq!(record.penalty_points, 0.0);
            prop_assert_eq!(record.ban, BanState::None);
        }

        #[test]
        fn test_decay_never_crosses_neutral(
            evidence in 0.0f64..=1.0,
            valid in 1.0f64..500.0,
            invalid in 1.0f64..500.0,
            penalty in 0.0f64..300.0,
            elapsed in 1u64..(60 * 86_400),
        ) {
            let config = ScoringConfig::default();
            let mut record = PeerRecord::new(PeerId::from("decaying"), 0);
            record.metrics.evidence = evidence;
            record.metrics.recent_valid = valid;
            record.metrics.recent_invalid = invalid;
            record.penalty_points = penalty;
            record.score = compute_score(&record, &config);
            let before = record.score;

            // Record was created at t=0, so `elapsed` doubles as the decay time
            let weight = apply_decay(&mut record, elapsed, &config).unwrap();
            prop_assert!((0.0..=1.0).contains(&weight));

            // Moves toward 50 and never past it
            let distance_before = (before - NEUTRAL_SCORE).abs();
            let distance_after = (record.score - NEUTRAL_SCORE).abs();
            prop_assert!(distance_after <= distance_before + 1e-9);
            prop_assert!(record.penalty_points <= penalty);
        }
    }
}
