//! Rate Limiting for Peer Traffic
//!
//! Counts messages and blocks per peer in one-second buckets over a sliding
//! window. When a peer goes over its limit a single `SpamAttempt` event is
//! sent to the reputation sink; it is up to the ban policy to decide what
//! that costs. The limiter itself never drops traffic.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::api::Metrics;
use crate::config::RateLimitConfig;
use crate::registry::ReputationManager;
use crate::types::{current_timestamp, EventKind, PeerEvent, PeerId, Timestamp};

/// Receiver of events produced outside the manager
pub trait EventSink: Send + Sync {
    fn submit(&self, event: PeerEvent);
}

impl EventSink for ReputationManager {
    fn submit(&self, event: PeerEvent) {
        self.record_event(event);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Traffic {
    Message,
    Block,
}

impl Traffic {
    fn as_str(&self) -> &'static str {
        match self {
            Traffic::Message => "messages",
            Traffic::Block => "blocks",
        }
    }
}

/// Counts for one second
#[derive(Debug, Clone, Copy)]
struct Bucket {
    second: Timestamp,
    messages: u32,
    blocks: u32,
}

impl Bucket {
    fn count(&self, traffic: Traffic) -> u32 {
        match traffic {
            Traffic::Message => self.messages,
            Traffic::Block => self.blocks,
        }
    }
}

/// Per-peer sliding window
#[derive(Debug, Default)]
struct PeerWindow {
    buckets: VecDeque<Bucket>,

    /// No further message signal before this time
    messages_quiet_until: Timestamp,

    /// No further block signal before this time
    blocks_quiet_until: Timestamp,

    last_activity: Timestamp,
}

impl PeerWindow {
    fn record(&mut self, traffic: Traffic, now: Timestamp, window_secs: u64) {
        let floor = now.saturating_sub(window_secs.saturating_sub(1));
        while self.buckets.front().is_some_and(|b| b.second < floor) {
            self.buckets.pop_front();
        }

        if self.buckets.back().map(|b| b.second) != Some(now) {
            self.buckets.push_back(Bucket { second: now, messages: 0, blocks: 0 });
        }
        if let Some(bucket) = self.buckets.back_mut() {
            match traffic {
                Traffic::Message => bucket.messages = bucket.messages.saturating_add(1),
                Traffic::Block => bucket.blocks = bucket.blocks.saturating_add(1),
            }
        }
        self.last_activity = now;
    }

    /// Count in the bucket for `now`
    fn current(&self, traffic: Traffic, now: Timestamp) -> u32 {
        self.buckets
            .back()
            .filter(|b| b.second == now)
            .map(|b| b.count(traffic))
            .unwrap_or(0)
    }

    /// Total over the retained window
    fn total(&self, traffic: Traffic) -> u64 {
        self.buckets.iter().map(|b| u64::from(b.count(traffic))).sum()
    }

    fn quiet_until(&mut self, traffic: Traffic) -> &mut Timestamp {
        match traffic {
            Traffic::Message => &mut self.messages_quiet_until,
            Traffic::Block => &mut self.blocks_quiet_until,
        }
    }
}

/// Per-peer message and block rate limiter
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: Mutex<HashMap<PeerId, PeerWindow>>,
    sink: Arc<dyn EventSink>,
    metrics: Arc<Metrics>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, sink: Arc<dyn EventSink>, metrics: Arc<Metrics>) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
            sink,
            metrics,
        }
    }

    /// Count a gossip message; returns true if a spam signal was emitted
    pub fn observe_message(&self, peer_id: &PeerId) -> bool {
        self.observe_message_at(peer_id, current_timestamp())
    }

    pub fn observe_message_at(&self, peer_id: &PeerId, now: Timestamp) -> bool {
        self.observe(peer_id, Traffic::Message, now)
    }

    /// Count a block announcement; returns true if a spam signal was emitted
    pub fn observe_block(&self, peer_id: &PeerId) -> bool {
        self.observe_block_at(peer_id, current_timestamp())
    }

    pub fn observe_block_at(&self, peer_id: &PeerId, now: Timestamp) -> bool {
        self.observe(peer_id, Traffic::Block, now)
    }

    fn observe(&self, peer_id: &PeerId, traffic: Traffic, now: Timestamp) -> bool {
        if peer_id.is_empty() {
            return false;
        }

        let limit = match traffic {
            Traffic::Message => self.config.max_messages_per_second,
            Traffic::Block => self.config.max_blocks_per_second,
        };
        let window_secs = self.config.window_secs;

        // Decide under the lock, emit outside it
        let details = {
            let mut windows = self.windows.lock();
            let window = windows.entry(peer_id.clone()).or_default();
            window.record(traffic, now, window_secs);

            let current = window.current(traffic, now);
            let total = window.total(traffic);
            let quiet_until = window.quiet_until(traffic);

            if current > limit && now >= *quiet_until {
                *quiet_until = now.saturating_add(window_secs);
                Some(format!(
                    "{} {}/s (limit {}/s), {} in last {}s",
                    traffic.as_str(),
                    current,
                    limit,
                    total,
                    window_secs
                ))
            } else {
                None
            }
        };

        let Some(details) = details else {
            return false;
        };

        warn!("Rate limit exceeded by peer {}: {}", peer_id.short(), details);
        self.metrics.inc_rate_limit_signals();
        self.sink.submit(
            PeerEvent::new(peer_id.clone(), EventKind::SpamAttempt)
                .at(now)
                .with_details(details),
        );
        true
    }

    /// Drop windows idle for longer than the configured timeout
    pub fn cleanup(&self, now: Timestamp) -> usize {
        let idle = self.config.idle_cleanup_secs;
        let mut windows = self.windows.lock();
        let before = windows.len();
        windows.retain(|_, w| now.saturating_sub(w.last_activity) <= idle);
        let removed = before - windows.len();
        if removed > 0 {
            debug!("Rate limiter dropped {} idle peers", removed);
        }
        removed
    }

    /// Get number of tracked peers
    pub fn tracked_count(&self) -> usize {
        self.windows.lock().len()
    }

    /// Periodic idle cleanup
    pub async fn run_cleanup(self: Arc<Self>) {
        let period = Duration::from_secs(self.config.idle_cleanup_secs.max(1));
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            self.cleanup(current_timestamp());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Sink that remembers what it was given
    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<PeerEvent>>,
    }

    impl EventSink for Recorder {
        fn submit(&self, event: PeerEvent) {
            self.events.lock().push(event);
        }
    }

    fn limiter(config: RateLimitConfig) -> (RateLimiter, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let limiter = RateLimiter::new(config, recorder.clone(), Arc::new(Metrics::new()));
        (limiter, recorder)
    }

    #[test]
    fn test_under_limit_is_silent() {
        let (limiter, recorder) = limiter(RateLimitConfig::default());
        let peer = PeerId::from("calm");

        for second in 0..20 {
            for _ in 0..50 {
                assert!(!limiter.observe_message_at(&peer, second));
            }
        }
        assert!(recorder.events.lock().is_empty());
    }

    #[test]
    fn test_burst_emits_single_signal_per_window() {
        let (limiter, recorder) = limiter(RateLimitConfig::default());
        let peer = PeerId::from("flood");

        let signals = (0..500).filter(|_| limiter.observe_message_at(&peer, 100)).count();
        assert_eq!(signals, 1);

        let events = recorder.events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::SpamAttempt);
        assert_eq!(events[0].peer_id, peer);
        assert_eq!(events[0].timestamp, 100);
        assert!(events[0].data.details.as_deref().unwrap_or_default().contains("messages"));
    }

    #[test]
    fn test_signals_again_after_window() {
        let (limiter, recorder) = limiter(RateLimitConfig::default());
        let peer = PeerId::from("persistent");

        for second in [100, 105, 110] {
            for _ in 0..150 {
                limiter.observe_message_at(&peer, second);
            }
        }
        // 100 signals; 105 is still quiet; 110 is a fresh window
        assert_eq!(recorder.events.lock().len(), 2);
    }

    #[test]
    fn test_blocks_limited_separately() {
        let (limiter, recorder) = limiter(RateLimitConfig::default());
        let peer = PeerId::from("miner");

        for _ in 0..50 {
            limiter.observe_message_at(&peer, 7);
        }
        let signalled = (0..11).any(|_| limiter.observe_block_at(&peer, 7));
        assert!(signalled);

        let events = recorder.events.lock();
        assert_eq!(events.len(), 1);
        assert!(events[0].data.details.as_deref().unwrap_or_default().starts_with("blocks"));
    }

    #[test]
    fn test_different_peers() {
        let config = RateLimitConfig {
            max_messages_per_second: 2,
            ..Default::default()
        };
        let (limiter, recorder) = limiter(config);

        for _ in 0..3 {
            limiter.observe_message_at(&PeerId::from("a"), 0);
        }
        assert!(!limiter.observe_message_at(&PeerId::from("b"), 0));
        assert_eq!(recorder.events.lock().len(), 1);
    }

    #[test]
    fn test_cleanup() {
        let (limiter, _) = limiter(RateLimitConfig::default());
        for i in 0..10 {
            limiter.observe_message_at(&PeerId::new(format!("p{}", i)), i);
        }
        assert_eq!(limiter.tracked_count(), 10);

        // idle_cleanup_secs is 300
        assert_eq!(limiter.cleanup(305), 5);
        assert_eq!(limiter.tracked_count(), 5);
    }

    #[test]
    fn test_signal_reaches_manager() {
        let metrics = Arc::new(Metrics::new());
        let manager = Arc::new(ReputationManager::new(Arc::default(), metrics.clone()));
        let limiter = RateLimiter::new(RateLimitConfig::default(), manager.clone(), metrics);
        let peer = PeerId::from("spammer");

        for _ in 0..101 {
            limiter.observe_message_at(&peer, 50);
        }

        let record = manager.get_peer(&peer).unwrap();
        assert_eq!(record.metrics.violations.spam, 1);
        assert_eq!(record.penalty_points, 10.0);
    }
}
