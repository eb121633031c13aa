//! Core Reputation Types
//!
//! Peer identifiers, events, ban state and the per-peer record that the
//! manager owns. Timestamps are unix seconds throughout.

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use crate::error::ReputationError;

/// Unix timestamp in seconds
pub type Timestamp = u64;

/// Neutral score assigned to peers we know nothing about
pub const NEUTRAL_SCORE: f64 = 50.0;

/// Upper bound of the score range
pub const MAX_SCORE: f64 = 100.0;

/// Lower bound of the score range
pub const MIN_SCORE: f64 = 0.0;

/// Opaque peer identifier, verified and stable by the time it reaches us
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }

    /// Shortened form for log lines
    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(12)
            .map(|(i, _)| i)
            .unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Kinds of behavioural events reported by the node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Connected,
    Disconnected,
    ValidMessage,
    InvalidMessage,
    OversizedMessage,
    BlockPropagated,
    ProtocolViolation,
    MalformedMessage,
    SpamAttempt,
    InvalidBlock,
    DoubleSign,
    LatencyMeasured,
    BandwidthAbuse,
}

impl EventKind {
    pub const ALL: [EventKind; 13] = [
        EventKind::Connected,
        EventKind::Disconnected,
        EventKind::ValidMessage,
        EventKind::InvalidMessage,
        EventKind::OversizedMessage,
        EventKind::BlockPropagated,
        EventKind::ProtocolViolation,
        EventKind::MalformedMessage,
        EventKind::SpamAttempt,
        EventKind::InvalidBlock,
        EventKind::DoubleSign,
        EventKind::LatencyMeasured,
        EventKind::BandwidthAbuse,
    ];

    pub const COUNT: usize = Self::ALL.len();

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Connected => "connected",
            EventKind::Disconnected => "disconnected",
            EventKind::ValidMessage => "valid_message",
            EventKind::InvalidMessage => "invalid_message",
            EventKind::OversizedMessage => "oversized_message",
            EventKind::BlockPropagated => "block_propagated",
            EventKind::ProtocolViolation => "protocol_violation",
            EventKind::MalformedMessage => "malformed_message",
            EventKind::SpamAttempt => "spam_attempt",
            EventKind::InvalidBlock => "invalid_block",
            EventKind::DoubleSign => "double_sign",
            EventKind::LatencyMeasured => "latency_measured",
            EventKind::BandwidthAbuse => "bandwidth_abuse",
        }
    }

    /// Position in [`EventKind::ALL`], used for per-kind counters
    pub fn index(&self) -> usize {
        *self as usize
    }

    /// Events that carry penalty points and enter the violation log
    pub fn is_violation(&self) -> bool {
        matches!(
            self,
            EventKind::OversizedMessage
                | EventKind::ProtocolViolation
                | EventKind::MalformedMessage
                | EventKind::SpamAttempt
                | EventKind::InvalidBlock
                | EventKind::DoubleSign
                | EventKind::BandwidthAbuse
        )
    }

    /// Events after which the ban policy is evaluated
    pub fn is_adverse(&self) -> bool {
        self.is_violation() || *self == EventKind::InvalidMessage
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = ReputationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        EventKind::ALL
            .iter()
            .find(|kind| kind.as_str() == normalized || kind.as_str().replace('_', "") == normalized)
            .copied()
            .ok_or_else(|| ReputationError::InvalidEvent(format!("unknown event kind '{}'", s)))
    }
}

/// Optional payload attached to an event
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventData {
    /// Network address the peer was seen at
    pub address: Option<String>,

    /// Round-trip or propagation latency in milliseconds
    pub latency_ms: Option<u64>,

    /// Size of the message in bytes
    pub message_size: Option<u64>,

    /// Autonomous system number, when the caller knows it
    pub asn: Option<u32>,

    /// ISO country code, when the caller knows it
    pub country: Option<String>,

    /// Free-form detail for logs
    pub details: Option<String>,
}

/// A single behavioural observation about a peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerEvent {
    pub peer_id: PeerId,
    pub kind: EventKind,
    pub data: EventData,
    pub timestamp: Timestamp,
}

impl PeerEvent {
    /// Create an event stamped with the current time
    pub fn new(peer_id: impl Into<PeerId>, kind: EventKind) -> Self {
        Self {
            peer_id: peer_id.into(),
            kind,
            data: EventData::default(),
            timestamp: current_timestamp(),
        }
    }

    pub fn at(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_data(mut self, data: EventData) -> Self {
        self.data = data;
        self
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.data.address = Some(address.into());
        self
    }

    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.data.latency_ms = Some(latency_ms);
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.data.details = Some(details.into());
        self
    }
}

/// Trust category derived from the score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    Untrusted,
    Low,
    Medium,
    High,
    Whitelisted,
}

impl TrustLevel {
    pub fn from_score(score: f64) -> Self {
        if score < 20.0 {
            TrustLevel::Untrusted
        } else if score < 50.0 {
            TrustLevel::Low
        } else if score < 75.0 {
            TrustLevel::Medium
        } else {
            TrustLevel::High
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TrustLevel::Untrusted => "untrusted",
            TrustLevel::Low => "low",
            TrustLevel::Medium => "medium",
            TrustLevel::High => "high",
            TrustLevel::Whitelisted => "whitelisted",
        }
    }
}

/// Ban state of a peer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum BanState {
    #[default]
    None,
    Temporary {
        since: Timestamp,
        expires_at: Timestamp,
        reason: String,
    },
    Permanent {
        since: Timestamp,
        reason: String,
    },
}

impl BanState {
    /// Whether the ban blocks the peer at `now`
    pub fn is_active(&self, now: Timestamp) -> bool {
        match self {
            BanState::None => false,
            BanState::Temporary { expires_at, .. } => now < *expires_at,
            BanState::Permanent { .. } => true,
        }
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, BanState::Permanent { .. })
    }

    pub fn is_temporary(&self) -> bool {
        matches!(self, BanState::Temporary { .. })
    }

    pub fn expires_at(&self) -> Option<Timestamp> {
        match self {
            BanState::Temporary { expires_at, .. } => Some(*expires_at),
            _ => None,
        }
    }

    /// Ban length in seconds; `None` for no ban or a permanent one
    pub fn duration_secs(&self) -> Option<u64> {
        match self {
            BanState::Temporary { since, expires_at, .. } => Some(expires_at.saturating_sub(*since)),
            _ => None,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            BanState::None => None,
            BanState::Temporary { reason, .. } | BanState::Permanent { reason, .. } => Some(reason),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            BanState::None => "none",
            BanState::Temporary { .. } => "temporary",
            BanState::Permanent { .. } => "permanent",
        }
    }
}

/// Entry in the bounded violation log
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ViolationRecord {
    pub kind: EventKind,
    pub at: Timestamp,
}

/// Lifetime violation counters per kind
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ViolationCounts {
    pub protocol: u64,
    pub malformed: u64,
    pub spam: u64,
    pub oversized: u64,
    pub invalid_block: u64,
    pub double_sign: u64,
    pub bandwidth_abuse: u64,
}

impl ViolationCounts {
    pub fn increment(&mut self, kind: EventKind) {
        if let Some(counter) = self.counter_mut(kind) {
            *counter += 1;
        }
    }

    pub fn get(&self, kind: EventKind) -> u64 {
        match kind {
            EventKind::ProtocolViolation => self.protocol,
            EventKind::MalformedMessage => self.malformed,
            EventKind::SpamAttempt => self.spam,
            EventKind::OversizedMessage => self.oversized,
            EventKind::InvalidBlock => self.invalid_block,
            EventKind::DoubleSign => self.double_sign,
            EventKind::BandwidthAbuse => self.bandwidth_abuse,
            _ => 0,
        }
    }

    pub fn total(&self) -> u64 {
        self.protocol
            + self.malformed
            + self.spam
            + self.oversized
            + self.invalid_block
            + self.double_sign
            + self.bandwidth_abuse
    }

    fn counter_mut(&mut self, kind: EventKind) -> Option<&mut u64> {
        match kind {
            EventKind::ProtocolViolation => Some(&mut self.protocol),
            EventKind::MalformedMessage => Some(&mut self.malformed),
            EventKind::SpamAttempt => Some(&mut self.spam),
            EventKind::OversizedMessage => Some(&mut self.oversized),
            EventKind::InvalidBlock => Some(&mut self.invalid_block),
            EventKind::DoubleSign => Some(&mut self.double_sign),
            EventKind::BandwidthAbuse => Some(&mut self.bandwidth_abuse),
            _ => None,
        }
    }
}

/// Raw behavioural metrics for one peer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeerMetrics {
    // === Connectivity ===
    pub connection_count: u64,
    pub disconnection_count: u64,
    /// Seconds spent connected across closed sessions
    pub total_uptime_secs: u64,
    /// Start of the currently open session
    pub session_started_at: Option<Timestamp>,

    // === Messages ===
    pub valid_message_count: u64,
    pub invalid_message_count: u64,
    /// Decayed counters feeding the validity sub-score
    pub recent_valid: f64,
    pub recent_invalid: f64,
    pub bytes_received: u64,

    // === Latency ===
    pub latency_samples: u64,
    pub avg_latency_ms: f64,

    // === Blocks ===
    pub blocks_propagated: u64,
    pub fast_block_count: u64,
    pub avg_block_propagation_ms: f64,

    // === Behaviour ===
    pub violations: ViolationCounts,
    /// Confidence in the metric part of the score, in [0, 1]
    pub evidence: f64,
}

impl PeerMetrics {
    pub fn total_messages(&self) -> u64 {
        self.valid_message_count + self.invalid_message_count
    }

    /// Lifetime share of valid messages, `None` before any message
    pub fn validity_ratio(&self) -> Option<f64> {
        let total = self.total_messages();
        (total > 0).then(|| self.valid_message_count as f64 / total as f64)
    }

    /// Share of valid messages over the decayed counters
    pub fn recent_validity_ratio(&self) -> Option<f64> {
        let total = self.recent_valid + self.recent_invalid;
        (total > f64::EPSILON).then(|| self.recent_valid / total)
    }

    pub fn fast_block_ratio(&self) -> Option<f64> {
        (self.blocks_propagated > 0)
            .then(|| self.fast_block_count as f64 / self.blocks_propagated as f64)
    }

    pub fn is_connected(&self) -> bool {
        self.session_started_at.is_some()
    }

    /// Total connected time, counting an open session up to `until`
    pub fn uptime_until(&self, until: Timestamp) -> u64 {
        let open = self
            .session_started_at
            .map(|start| until.saturating_sub(start))
            .unwrap_or(0);
        self.total_uptime_secs.saturating_add(open)
    }

    /// Average session length in seconds
    pub fn avg_session_secs(&self, until: Timestamp) -> u64 {
        let sessions = self.disconnection_count + u64::from(self.is_connected());
        if sessions == 0 {
            return 0;
        }
        self.uptime_until(until) / sessions
    }

    /// Fold a latency sample into the running mean
    pub fn add_latency_sample(&mut self, latency_ms: u64) {
        self.latency_samples += 1;
        let n = self.latency_samples as f64;
        self.avg_latency_ms += (latency_ms as f64 - self.avg_latency_ms) / n;
    }

    /// Fold a block propagation time into the running mean
    pub fn add_block_propagation(&mut self, propagation_ms: u64, fast_threshold_ms: u64) {
        self.blocks_propagated += 1;
        if propagation_ms < fast_threshold_ms {
            self.fast_block_count += 1;
        }
        let n = self.blocks_propagated as f64;
        self.avg_block_propagation_ms += (propagation_ms as f64 - self.avg_block_propagation_ms) / n;
    }
}

/// Network placement used by the diversity guard
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkMeta {
    pub ip: Option<IpAddr>,
    pub subnet: Option<IpNet>,
    pub asn: Option<u32>,
    pub country: Option<String>,
}

/// Score movement worth remembering
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreSnapshot {
    pub at: Timestamp,
    pub score: f64,
    pub reason: String,
}

/// Everything known about one peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub peer_id: PeerId,
    pub address: Option<String>,
    pub score: f64,
    pub metrics: PeerMetrics,
    pub penalty_points: f64,
    pub violation_log: VecDeque<ViolationRecord>,
    /// Start of the current violation streak
    pub streak_anchor: Option<Timestamp>,
    pub ban: BanState,
    /// Automatic temporary bans ever applied; survives expiry
    pub temp_ban_count: u32,
    pub whitelisted: bool,
    pub first_seen: Timestamp,
    pub last_seen: Timestamp,
    pub last_decay_at: Timestamp,
    pub network: NetworkMeta,
    pub score_history: VecDeque<ScoreSnapshot>,
}

impl PeerRecord {
    /// Fresh record with a neutral score
    pub fn new(peer_id: PeerId, now: Timestamp) -> Self {
        Self {
            peer_id,
            address: None,
            score: NEUTRAL_SCORE,
            metrics: PeerMetrics::default(),
            penalty_points: 0.0,
            violation_log: VecDeque::new(),
            streak_anchor: None,
            ban: BanState::None,
            temp_ban_count: 0,
            whitelisted: false,
            first_seen: now,
            last_seen: now,
            last_decay_at: now,
            network: NetworkMeta::default(),
            score_history: VecDeque::new(),
        }
    }

    pub fn trust_level(&self) -> TrustLevel {
        if self.whitelisted {
            TrustLevel::Whitelisted
        } else {
            TrustLevel::from_score(self.score)
        }
    }

    pub fn is_banned_at(&self, now: Timestamp) -> bool {
        self.ban.is_active(now)
    }

    /// Not seen for longer than `retention_secs`
    pub fn is_stale(&self, retention_secs: u64, now: Timestamp) -> bool {
        now.saturating_sub(self.last_seen) > retention_secs
    }

    /// Close a session left open by a previous process
    pub fn close_dangling_session(&mut self) {
        if let Some(start) = self.metrics.session_started_at.take() {
            let session = self.last_seen.saturating_sub(start);
            self.metrics.total_uptime_secs = self.metrics.total_uptime_secs.saturating_add(session);
        }
    }
}

/// Get current unix timestamp in seconds
pub fn current_timestamp() -> Timestamp {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
