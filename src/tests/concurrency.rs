// Concurrency Tests
// Many producers hitting the same manager from different threads

#[cfg(test)]
mod tests {
    use crate::api::Metrics;
    use crate::config::ReputationConfig;
    use crate::registry::{Admission, ReputationManager};
    use crate::types::*;
    use std::sync::Arc;
    use std::thread;

    // =========================================================================
    // HELPER FUNCTIONS
    // =========================================================================

    fn manager() -> Arc<ReputationManager> {
        Arc::new(ReputationManager::new(
            Arc::new(ReputationConfig::default()),
            Arc::new(Metrics::new()),
        ))
    }

    // =========================================================================
    // TESTS
    // =========================================================================

    #[test]
    fn test_no_lost_updates_on_single_peer() {
        let manager = manager();
        let peer = PeerId::from("hot-peer");

        thread::scope(|s| {
            for t in 0..8u64 {
                let manager = &manager;
                let peer = &peer;
                s.spawn(move || {
                    for i in 0..1_250u64 {
                        manager.record_event(
                            PeerEvent::new(peer.clone(), EventKind::ValidMessage)
                                .at(1_000 + t * 10_000 + i),
                        );
                    }
                });
            }
        });

        let record = manager.get_peer(&peer).unwrap();
        assert_eq!(record.metrics.valid_message_count, 10_000);
        assert_eq!(manager.metrics().events(EventKind::ValidMessage), 10_000);
        assert_eq!(manager.peer_count(), 1);
    }

    #[test]
    fn test_many_peers_in_parallel() {
        let manager = manager();

        thread::scope(|s| {
            for t in 0..8 {
                let manager = &manager;
                s.spawn(move || {
                    for i in 0..200 {
                        let peer = format!("peer-{}-{}", t, i);
                        manager.record_event(PeerEvent::new(peer.as_str(), EventKind::ValidMessage).at(1_000));
                        manager.record_event(PeerEvent::new(peer.as_str(), EventKind::InvalidMessage).at(1_001));
                    }
                });
            }
        });

        assert_eq!(manager.peer_count(), 1_600);
        let stats = manager.stats_at(1_002);
        assert_eq!(stats.total_peers, 1_600);
        assert_eq!(stats.banned_peers, 0);
        assert_eq!(manager.metrics().total_events(), 3_200);
    }

    #[test]
    fn test_connect_disconnect_keeps_diversity_consistent() {
        let manager = manager();

        thread::scope(|s| {
            for t in 0..8u64 {
                let manager = &manager;
                s.spawn(move || {
                    for i in 0..100u64 {
                        let peer = format!("churn-{}-{}", t, i);
                        let address = format!("10.{}.{}.1:30333", t, i);
                        let ts = 1_000 + i * 10;
                        manager.record_event(
                            PeerEvent::new(peer.as_str(), EventKind::Connected)
                                .at(ts)
                                .with_address(&address),
                        );
                        manager.record_event(
                            PeerEvent::new(peer.as_str(), EventKind::Disconnected).at(ts + 5),
                        );
                    }
                });
            }
        });

        assert_eq!(manager.diversity().connected_count(), 0);
        let stats = manager.stats_at(3_000);
        assert_eq!(stats.connected_peers, 0);
        assert_eq!(stats.total_peers, 800);
    }

    #[test]
    fn test_admission_sees_concurrent_bans() {
        let manager = manager();
        let now = 10_000;
        for i in 0..64 {
            manager.record_event(PeerEvent::new(format!("target-{}", i), EventKind::ValidMessage).at(now));
        }

        thread::scope(|s| {
            // Banning threads
            for t in 0..4 {
                let manager = &manager;
                s.spawn(move || {
                    for i in (t..64).step_by(4) {
                        let peer = PeerId::new(format!("target-{}", i));
                        manager.ban_peer_at(&peer, Some(3_600), "test", now).unwrap();
                    }
                });
            }
            // Admission threads racing the bans
            for t in 0..4 {
                let manager = &manager;
                s.spawn(move || {
                    for i in 0..64 {
                        let peer = PeerId::new(format!("target-{}", i));
                        let address = format!("172.16.{}.{}:30333", t, i);
                        let _ = manager.should_accept_peer_at(&peer, &address, now);
                    }
                });
            }
        });

        for i in 0..64 {
            let peer = PeerId::new(format!("target-{}", i));
            let admission = manager.should_accept_peer_at(&peer, "192.0.2.1:30333", now + 1);
            assert_eq!(admission.reason(), "banned");
            assert!(!matches!(admission, Admission::Accepted));
        }
        assert_eq!(manager.metrics().total_bans(), 64);
    }

    #[test]
    fn test_maintenance_runs_alongside_events() {
        let manager = manager();

        thread::scope(|s| {
            for t in 0..4u64 {
                let manager = &manager;
                s.spawn(move || {
                    for i in 0..500u64 {
                        let peer = format!("busy-{}", i % 50);
                        let kind = if i % 7 == 0 { EventKind::ProtocolViolation } else { EventKind::ValidMessage };
                        manager.record_event(PeerEvent::new(peer.as_str(), kind).at(1_000 + t * 1_000 + i));
                    }
                });
            }
            let manager = &manager;
            s.spawn(move || {
                for round in 0..20u64 {
                    manager.run_maintenance(1_000 + round * 250);
                }
            });
        });

        assert_eq!(manager.peer_count(), 50);
        for i in 0..50 {
            let record = manager.get_peer(&PeerId::new(format!("busy-{}", i))).unwrap();
            assert!((MIN_SCORE..=MAX_SCORE).contains(&record.score));
            assert!(record.penalty_points >= 0.0);
        }
    }

    #[test]
    fn test_bans_survive_concurrent_eviction() {
        for _ in 0..50 {
            let manager = manager();
            let retention = manager.config().maintenance.retention_secs;
            let now = retention + 10;

            // Stale peers, all eligible for eviction at `now`
            for i in 0..200 {
                manager.record_event(PeerEvent::new(format!("stale-{}", i), EventKind::ValidMessage).at(0));
            }

            thread::scope(|s| {
                let m = &manager;
                s.spawn(move || {
                    m.run_maintenance(now);
                });
                s.spawn(move || {
                    for i in (0..200).step_by(2) {
                        m.record_event(PeerEvent::new(format!("stale-{}", i), EventKind::DoubleSign).at(now));
                    }
                });
                s.spawn(move || {
                    for i in (1..200).step_by(2) {
                        let peer = PeerId::new(format!("stale-{}", i));
                        m.ban_peer_at(&peer, None, "operator", now).unwrap();
                    }
                });
            });

            for i in 0..200 {
                let peer = PeerId::new(format!("stale-{}", i));
                let record = manager.get_peer(&peer).unwrap();
                assert!(record.ban.is_permanent(), "{} lost its ban", peer);
                let admission = manager.should_accept_peer_at(&peer, "198.51.100.1:30333", now + 1);
                assert_eq!(admission.reason(), "banned");
            }
            assert_eq!(manager.peer_count(), 200);
        }
    }
}
