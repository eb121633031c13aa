//! Peer Reputation Registry
//!
//! Owns every peer record in memory, applies events to them and answers
//! admission and ranking queries. Records are persisted asynchronously.

pub mod diversity;
mod manager;

pub use diversity::{DiversityGuard, DiversityViolation, NetworkInfo, NetworkInfoResolver, NoopResolver};
pub use manager::{Admission, EventOutcome, MaintenanceReport, RejectReason, ReputationManager};

use serde::Serialize;
use std::collections::HashMap;

/// Labels of the score histogram buckets
pub const SCORE_BUCKETS: [&str; 5] = ["0-20", "20-40", "40-60", "60-80", "80-100"];

/// Aggregate view over all tracked peers
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReputationStats {
    /// Total peers in registry
    pub total_peers: usize,

    /// Peers currently banned
    pub banned_peers: usize,

    /// Of which permanently
    pub permanent_bans: usize,

    /// Whitelisted peers
    pub whitelisted_peers: usize,

    /// Peers with an open session
    pub connected_peers: usize,

    /// Average peer score
    pub average_score: f64,

    /// Peers per score range, see [`SCORE_BUCKETS`]
    pub score_distribution: [usize; 5],

    /// Peers per trust level
    pub trust_levels: HashMap<String, usize>,
}

/// Histogram bucket for a score
pub fn score_bucket(score: f64) -> usize {
    ((score / 20.0).floor().max(0.0) as usize).min(SCORE_BUCKETS.len() - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_score_buckets() {
        assert_eq!(score_bucket(0.0), 0);
        assert_eq!(score_bucket(19.9), 0);
        assert_eq!(score_bucket(20.0), 1);
        assert_eq!(score_bucket(59.0), 2);
        assert_eq!(score_bucket(100.0), 4);
    }
}
