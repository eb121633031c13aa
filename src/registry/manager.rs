//! Reputation Manager
//!
//! Single owner of the peer table. Every mutation of a record happens under
//! that record's mutex; the table itself is sharded so unrelated peers never
//! contend. Lock order is always record, then diversity guard.
//!
//! Nothing on the event or admission path waits on storage: records are
//! handed to the [`StorageHandle`] queue and flushed in the background.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::diversity::{select_diverse, DiversityGuard, DiversityViolation, NetworkInfoResolver, NoopResolver};
use super::{score_bucket, ReputationStats};
use crate::api::Metrics;
use crate::config::ReputationConfig;
use crate::error::{ReputationError, Result};
use crate::policy::BanPolicy;
use crate::scoring::{apply_decay, compute_score};
use crate::storage::StorageHandle;
use crate::types::{
    current_timestamp, BanState, EventData, EventKind, NetworkMeta, PeerEvent, PeerId, PeerRecord,
    ScoreSnapshot, Timestamp,
};

/// Score movement worth keeping in a record's history
const SIGNIFICANT_SCORE_CHANGE: f64 = 5.0;

/// Result of recording an event
#[derive(Debug, Clone, PartialEq)]
pub enum EventOutcome {
    /// Malformed input, nothing changed
    Ignored,
    /// Event applied
    Recorded { score: f64 },
    /// Event applied and the peer was banned
    Banned(BanState),
}

/// Why a connection was refused
#[derive(Debug, Clone, PartialEq)]
pub enum RejectReason {
    Banned { expires_at: Option<Timestamp>, reason: String },
    LowScore(f64),
    ExcessivePenalty(f64),
    Diversity(DiversityViolation),
    InvalidAddress(String),
}

impl RejectReason {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            RejectReason::Banned { .. } => "banned",
            RejectReason::LowScore(_) => "low_score",
            RejectReason::ExcessivePenalty(_) => "penalty",
            RejectReason::Diversity(DiversityViolation::Subnet(_)) => "subnet_limit",
            RejectReason::Diversity(DiversityViolation::Asn(_)) => "asn_limit",
            RejectReason::Diversity(DiversityViolation::Country(_)) => "country_limit",
            RejectReason::InvalidAddress(_) => "invalid_address",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::Banned { expires_at: Some(at), reason } => {
                write!(f, "banned until {} ({})", at, reason)
            }
            RejectReason::Banned { expires_at: None, reason } => write!(f, "banned permanently ({})", reason),
            RejectReason::LowScore(score) => write!(f, "score {:.1} below threshold", score),
            RejectReason::ExcessivePenalty(points) => write!(f, "{:.1} penalty points", points),
            RejectReason::Diversity(v) => write!(f, "{}", v),
            RejectReason::InvalidAddress(addr) => write!(f, "unparseable address '{}'", addr),
        }
    }
}

/// Connection admission decision
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Accepted,
    Whitelisted,
    Rejected(RejectReason),
}

impl Admission {
    pub fn is_accepted(&self) -> bool {
        !matches!(self, Admission::Rejected(_))
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Admission::Accepted => "accepted",
            Admission::Whitelisted => "whitelisted",
            Admission::Rejected(r) => r.code(),
        }
    }

    /// Reason safe to send to the remote peer; never reveals policy detail
    pub fn wire_reason(&self) -> Option<&'static str> {
        (!self.is_accepted()).then_some("connection rejected")
    }
}

/// Summary of one maintenance pass
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MaintenanceReport {
    pub peers: usize,
    pub decayed: usize,
    pub bans_expired: usize,
    pub evicted: usize,
}

/// Owns peer records and applies the reputation policy to them
pub struct ReputationManager {
    config: Arc<ReputationConfig>,
    policy: BanPolicy,
    peers: DashMap<PeerId, Arc<Mutex<PeerRecord>>>,
    diversity: DiversityGuard,
    resolver: Arc<dyn NetworkInfoResolver>,
    storage: Option<StorageHandle>,
    metrics: Arc<Metrics>,
}

impl ReputationManager {
    /// Create a manager and whitelist the peers named in the config
    pub fn new(config: Arc<ReputationConfig>, metrics: Arc<Metrics>) -> Self {
        let manager = Self {
            policy: BanPolicy::new(config.penalties.clone(), config.bans.clone()),
            diversity: DiversityGuard::new(config.diversity.clone()),
            peers: DashMap::new(),
            resolver: Arc::new(NoopResolver),
            storage: None,
            metrics,
            config,
        };
        manager.apply_config_whitelist(current_timestamp());
        manager
    }

    pub fn with_storage(mut self, storage: StorageHandle) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn NetworkInfoResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn config(&self) -> &ReputationConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn diversity(&self) -> &DiversityGuard {
        &self.diversity
    }

    pub fn storage_degraded(&self) -> bool {
        self.storage.as_ref().is_some_and(|s| s.is_degraded())
    }

    /// Install records recovered from storage
    ///
    /// Sessions left open by the previous process are closed at their
    /// `last_seen`; nobody is connected after a restart.
    pub fn load_records(&self, records: Vec<PeerRecord>) -> usize {
        let count = records.len();
        for mut record in records {
            record.close_dangling_session();
            self.peers.insert(record.peer_id.clone(), Arc::new(Mutex::new(record)));
        }
        self.apply_config_whitelist(current_timestamp());
        info!("📦 Restored {} peer records", count);
        count
    }

    fn apply_config_whitelist(&self, now: Timestamp) {
        for id in &self.config.whitelist {
            let peer_id = PeerId::new(id.clone());
            if peer_id.is_empty() {
                continue;
            }
            self.update_or_insert(&peer_id, now, |record| {
                record.whitelisted = true;
                record.ban = BanState::None;
                self.persist(record);
            });
        }
    }

    // =========================================================================
    // EVENTS
    // =========================================================================

    /// Apply a behavioural event; never panics on bad input
    pub fn record_event(&self, event: PeerEvent) -> EventOutcome {
        if event.peer_id.is_empty() {
            warn!("Ignoring {} event with empty peer id", event.kind);
            self.metrics.inc_malformed();
            return EventOutcome::Ignored;
        }

        self.metrics.inc_event(event.kind);

        self.update_or_insert(&event.peer_id, event.timestamp, |record| {
            let outcome = self.apply_event(record, &event);
            self.persist(record);
            outcome
        })
    }

    /// Record an event whose kind arrives as a string
    pub fn record_raw_event(
        &self,
        peer_id: &str,
        kind: &str,
        data: EventData,
        timestamp: Timestamp,
    ) -> EventOutcome {
        match kind.parse::<EventKind>() {
            Ok(kind) => self.record_event(PeerEvent {
                peer_id: PeerId::from(peer_id),
                kind,
                data,
                timestamp,
            }),
            Err(e) => {
                warn!("Ignoring event for peer {}: {}", peer_id, e);
                self.metrics.inc_malformed();
                EventOutcome::Ignored
            }
        }
    }

    fn apply_event(&self, record: &mut PeerRecord, event: &PeerEvent) -> EventOutcome {
        let now = event.timestamp;
        let scoring = &self.config.scoring;

        record.last_seen = record.last_seen.max(now);
        if let Some(address) = &event.data.address {
            record.address = Some(address.clone());
        }

        match event.kind {
            EventKind::Connected => {
                let metrics = &mut record.metrics;
                if let Some(start) = metrics.session_started_at.take() {
                    metrics.total_uptime_secs = metrics.total_uptime_secs.saturating_add(now.saturating_sub(start));
                }
                metrics.connection_count += 1;
                metrics.session_started_at = Some(now);
                self.register_connection(record, &event.data);
            }
            EventKind::Disconnected => {
                let metrics = &mut record.metrics;
                if let Some(start) = metrics.session_started_at.take() {
                    metrics.total_uptime_secs = metrics.total_uptime_secs.saturating_add(now.saturating_sub(start));
                    metrics.disconnection_count += 1;
                }
                self.diversity.unregister(&record.peer_id);
            }
            EventKind::ValidMessage => {
                let metrics = &mut record.metrics;
                metrics.valid_message_count += 1;
                metrics.recent_valid += 1.0;
                if let Some(latency) = event.data.latency_ms {
                    metrics.add_latency_sample(latency);
                }
            }
            EventKind::InvalidMessage | EventKind::MalformedMessage => {
                let metrics = &mut record.metrics;
                metrics.invalid_message_count += 1;
                metrics.recent_invalid += 1.0;
            }
            EventKind::BlockPropagated => match event.data.latency_ms {
                Some(latency) => record.metrics.add_block_propagation(latency, scoring.fast_block_ms),
                None => debug!("Block propagation from {} without latency", record.peer_id.short()),
            },
            EventKind::LatencyMeasured => {
                if let Some(latency) = event.data.latency_ms {
                    record.metrics.add_latency_sample(latency);
                }
            }
            _ => {}
        }

        if let Some(size) = event.data.message_size {
            record.metrics.bytes_received = record.metrics.bytes_received.saturating_add(size);
        }
        record.metrics.evidence = (record.metrics.evidence + scoring.evidence_per_event).min(1.0);

        if event.kind.is_violation() {
            if record.whitelisted {
                record.metrics.violations.increment(event.kind);
            } else {
                self.policy.apply_violation(record, event.kind, now);
            }
        }

        self.policy.clear_expired(record, now);

        let previous = record.score;
        record.score = compute_score(record, scoring);
        self.note_score_change(record, previous, event.kind.as_str(), now);

        if event.kind.is_adverse() && !record.whitelisted && self.policy.bans().auto_ban {
            let verdict = self.policy.evaluate(record, event.kind, now);
            if let Some(state) = self.policy.apply_verdict(record, verdict, now) {
                match &state {
                    BanState::Permanent { .. } => self.metrics.inc_permanent_bans(),
                    BanState::Temporary { .. } => self.metrics.inc_temporary_bans(),
                    BanState::None => {}
                }
                self.push_history(record, state.label(), now);
                return EventOutcome::Banned(state);
            }
        }

        EventOutcome::Recorded { score: record.score }
    }

    fn register_connection(&self, record: &mut PeerRecord, data: &EventData) {
        let address = data.address.as_deref().or(record.address.as_deref());
        let meta = address
            .and_then(|addr| {
                self.diversity
                    .meta_for(addr, self.resolver.as_ref(), data.asn, data.country.clone())
            })
            .unwrap_or_else(|| NetworkMeta {
                asn: data.asn,
                country: data.country.as_ref().map(|c| c.to_ascii_uppercase()),
                ..Default::default()
            });

        record.network = meta.clone();
        self.diversity.register(&record.peer_id, meta);
    }

    fn note_score_change(&self, record: &mut PeerRecord, previous: f64, reason: &str, now: Timestamp) {
        if (record.score - previous).abs() > SIGNIFICANT_SCORE_CHANGE {
            self.push_history(record, reason, now);
        }
    }

    fn push_history(&self, record: &mut PeerRecord, reason: &str, now: Timestamp) {
        record.score_history.push_back(ScoreSnapshot {
            at: now,
            score: record.score,
            reason: reason.to_string(),
        });
        while record.score_history.len() > self.config.scoring.score_history_len {
            record.score_history.pop_front();
        }
    }

    // =========================================================================
    // ADMISSION
    // =========================================================================

    /// Decide whether to accept a connection from `peer_id` at `address`
    pub fn should_accept_peer(&self, peer_id: &PeerId, address: &str) -> Admission {
        self.should_accept_peer_at(peer_id, address, current_timestamp())
    }

    pub fn should_accept_peer_at(&self, peer_id: &PeerId, address: &str, now: Timestamp) -> Admission {
        let admission = self.evaluate_admission(peer_id, address, now);
        self.metrics.inc_admission(admission.is_accepted());
        if let Admission::Rejected(reason) = &admission {
            debug!("Rejected connection from {} ({}): {}", peer_id.short(), address, reason);
        }
        admission
    }

    fn evaluate_admission(&self, peer_id: &PeerId, address: &str, now: Timestamp) -> Admission {
        let bans = self.policy.bans();

        let known = self.update(peer_id, |record| {
            if record.whitelisted {
                return Some(Admission::Whitelisted);
            }

            if self.policy.clear_expired(record, now) {
                self.persist(record);
            }

            if record.ban.is_active(now) {
                return Some(Admission::Rejected(RejectReason::Banned {
                    expires_at: record.ban.expires_at(),
                    reason: record.ban.reason().unwrap_or_default().to_string(),
                }));
            }

            if record.score < bans.min_accept_score {
                return Some(Admission::Rejected(RejectReason::LowScore(record.score)));
            }

            if record.penalty_points > bans.max_accept_penalty {
                return Some(Admission::Rejected(RejectReason::ExcessivePenalty(record.penalty_points)));
            }
            None
        });
        if let Some(admission) = known.flatten() {
            return admission;
        }

        let Some(meta) = self.diversity.meta_for(address, self.resolver.as_ref(), None, None) else {
            return Admission::Rejected(RejectReason::InvalidAddress(address.to_string()));
        };

        match self.diversity.check(peer_id, &meta) {
            Ok(()) => Admission::Accepted,
            Err(violation) => Admission::Rejected(RejectReason::Diversity(violation)),
        }
    }

    // =========================================================================
    // ADMIN
    // =========================================================================

    /// Ban a peer; `None` duration means permanent
    pub fn ban_peer(&self, peer_id: &PeerId, duration_secs: Option<u64>, reason: &str) -> Result<BanState> {
        self.ban_peer_at(peer_id, duration_secs, reason, current_timestamp())
    }

    pub fn ban_peer_at(
        &self,
        peer_id: &PeerId,
        duration_secs: Option<u64>,
        reason: &str,
        now: Timestamp,
    ) -> Result<BanState> {
        if peer_id.is_empty() {
            return Err(ReputationError::InvalidEvent("empty peer id".to_string()));
        }

        self.update_or_insert(peer_id, now, |record| {
            if record.whitelisted {
                return Err(ReputationError::Whitelisted(peer_id.clone()));
            }

            // A manual temporary ban never downgrades a permanent one
            if record.ban.is_permanent() {
                return Ok(record.ban.clone());
            }

            let reason = format!("manual: {}", reason);
            record.ban = match duration_secs {
                None => BanState::Permanent { since: now, reason },
                Some(duration) => BanState::Temporary {
                    since: now,
                    expires_at: now.saturating_add(duration),
                    reason,
                },
            };

            self.metrics.inc_manual_bans();
            info!("⛔ Peer {} banned by operator ({})", peer_id, record.ban.label());
            self.push_history(record, "manual ban", now);
            self.persist(record);
            Ok(record.ban.clone())
        })
    }

    /// Lift any ban, including a permanent one; history is kept
    pub fn unban_peer(&self, peer_id: &PeerId) -> Result<()> {
        self.update(peer_id, |record| {
            if record.ban != BanState::None {
                info!("Peer {} unbanned by operator", peer_id);
                self.metrics.inc_unbans();
            }
            record.ban = BanState::None;
            self.persist(record);
        })
        .ok_or_else(|| ReputationError::PeerNotFound(peer_id.clone()))
    }

    /// Whitelist a peer and clear any ban
    pub fn add_to_whitelist(&self, peer_id: &PeerId) -> Result<()> {
        if peer_id.is_empty() {
            return Err(ReputationError::InvalidEvent("empty peer id".to_string()));
        }

        self.update_or_insert(peer_id, current_timestamp(), |record| {
            record.whitelisted = true;
            record.ban = BanState::None;
            self.persist(record);
        });
        info!("Peer {} whitelisted", peer_id);
        Ok(())
    }

    pub fn remove_from_whitelist(&self, peer_id: &PeerId) -> Result<()> {
        self.update(peer_id, |record| {
            record.whitelisted = false;
            self.persist(record);
        })
        .ok_or_else(|| ReputationError::PeerNotFound(peer_id.clone()))?;
        info!("Peer {} removed from whitelist", peer_id);
        Ok(())
    }

    pub fn is_whitelisted(&self, peer_id: &PeerId) -> bool {
        self.get_entry(peer_id).is_some_and(|e| e.lock().whitelisted)
    }

    // =========================================================================
    // QUERIES
    // =========================================================================

    /// Copy of a record; never creates one
    pub fn get_peer(&self, peer_id: &PeerId) -> Option<PeerRecord> {
        self.get_entry(peer_id).map(|e| e.lock().clone())
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Best `n` unbanned peers with at least `min_score`
    pub fn get_top_peers(&self, n: usize, min_score: f64) -> Vec<PeerRecord> {
        self.get_top_peers_at(n, min_score, current_timestamp())
    }

    pub fn get_top_peers_at(&self, n: usize, min_score: f64, now: Timestamp) -> Vec<PeerRecord> {
        let mut peers = self.eligible_peers(min_score, now);
        peers.sort_by(|a, b| b.score.total_cmp(&a.score));
        peers.truncate(n);
        peers
    }

    /// Up to `n` unbanned peers spread across subnets and countries
    pub fn get_diverse_peers(&self, n: usize, min_score: f64) -> Vec<PeerRecord> {
        self.get_diverse_peers_at(n, min_score, current_timestamp())
    }

    pub fn get_diverse_peers_at(&self, n: usize, min_score: f64, now: Timestamp) -> Vec<PeerRecord> {
        select_diverse(self.eligible_peers(min_score, now), n)
    }

    fn eligible_peers(&self, min_score: f64, now: Timestamp) -> Vec<PeerRecord> {
        self.entries()
            .into_iter()
            .filter_map(|(_, entry)| {
                let record = entry.lock();
                (!record.ban.is_active(now) && record.score >= min_score).then(|| record.clone())
            })
            .collect()
    }

    /// Aggregate statistics
    pub fn stats(&self) -> ReputationStats {
        self.stats_at(current_timestamp())
    }

    pub fn stats_at(&self, now: Timestamp) -> ReputationStats {
        let mut stats = ReputationStats::default();
        let mut trust_levels: HashMap<String, usize> = HashMap::new();
        let mut score_sum = 0.0;

        for (_, entry) in self.entries() {
            let record = entry.lock();
            stats.total_peers += 1;
            score_sum += record.score;
            stats.score_distribution[score_bucket(record.score)] += 1;
            *trust_levels.entry(record.trust_level().as_str().to_string()).or_insert(0) += 1;

            if record.ban.is_active(now) {
                stats.banned_peers += 1;
                if record.ban.is_permanent() {
                    stats.permanent_bans += 1;
                }
            }
            if record.whitelisted {
                stats.whitelisted_peers += 1;
            }
            if record.metrics.is_connected() {
                stats.connected_peers += 1;
            }
        }

        if stats.total_peers > 0 {
            stats.average_score = score_sum / stats.total_peers as f64;
        }
        stats.trust_levels = trust_levels;
        stats
    }

    // =========================================================================
    // MAINTENANCE
    // =========================================================================

    /// Decay scores, lift expired bans, prune logs and evict stale peers
    pub fn run_maintenance(&self, now: Timestamp) -> MaintenanceReport {
        let retention = self.config.maintenance.retention_secs;
        let mut report = MaintenanceReport::default();
        let mut stale = Vec::new();

        for (peer_id, entry) in self.entries() {
            let mut record = entry.lock();
            report.peers += 1;

            let previous = record.score;
            if apply_decay(&mut record, now, &self.config.scoring).is_some() {
                report.decayed += 1;
            }
            if self.policy.clear_expired(&mut record, now) {
                report.bans_expired += 1;
            }
            self.policy.prune_violation_log(&mut record, now);
            self.note_score_change(&mut record, previous, "decay", now);

            if Self::evictable(&record, retention, now) {
                drop(record);
                stale.push((peer_id, entry));
                continue;
            }
            self.persist(&record);
        }

        for (peer_id, entry) in stale {
            // Held across the removal so a concurrent writer either refreshes
            // the record first or finds it gone and starts a new one
            let record = entry.lock();
            if !Self::evictable(&record, retention, now) || !self.is_live(&peer_id, &entry) {
                continue;
            }
            self.diversity.unregister(&peer_id);
            if let Some(storage) = &self.storage {
                storage.remove(peer_id.clone());
            }
            self.peers.remove_if(&peer_id, |_, current| Arc::ptr_eq(current, &entry));
            drop(record);
            report.evicted += 1;
        }

        self.metrics.add_evicted(report.evicted as u64);
        if report.evicted > 0 || report.bans_expired > 0 {
            info!(
                "🧹 Maintenance: {} peers, {} bans expired, {} evicted",
                report.peers, report.bans_expired, report.evicted
            );
        }
        report
    }

    fn evictable(record: &PeerRecord, retention: u64, now: Timestamp) -> bool {
        record.is_stale(retention, now)
            && !record.ban.is_permanent()
            && !record.whitelisted
            && !record.metrics.is_connected()
    }

    // =========================================================================
    // INTERNALS
    // =========================================================================

    fn get_entry(&self, peer_id: &PeerId) -> Option<Arc<Mutex<PeerRecord>>> {
        self.peers.get(peer_id).map(|e| Arc::clone(e.value()))
    }

    fn entry_or_insert(&self, peer_id: &PeerId, now: Timestamp) -> Arc<Mutex<PeerRecord>> {
        if let Some(entry) = self.get_entry(peer_id) {
            return entry;
        }
        let entry = self.peers.entry(peer_id.clone()).or_insert_with(|| {
            debug!("New peer {}", peer_id.short());
            Arc::new(Mutex::new(PeerRecord::new(peer_id.clone(), now)))
        });
        Arc::clone(entry.value())
    }

    /// Whether the table still maps `peer_id` to this record
    ///
    /// Called with the record locked; lock order is record, then shard.
    fn is_live(&self, peer_id: &PeerId, entry: &Arc<Mutex<PeerRecord>>) -> bool {
        self.peers
            .get(peer_id)
            .is_some_and(|current| Arc::ptr_eq(current.value(), entry))
    }

    /// Run `f` on the peer's record under its lock, creating the record if absent
    ///
    /// Retries when the record was evicted between lookup and lock, so
    /// updates never land on a record that has left the table.
    fn update_or_insert<R>(
        &self,
        peer_id: &PeerId,
        now: Timestamp,
        f: impl FnOnce(&mut PeerRecord) -> R,
    ) -> R {
        loop {
            let entry = self.entry_or_insert(peer_id, now);
            let mut record = entry.lock();
            if self.is_live(peer_id, &entry) {
                return f(&mut record);
            }
        }
    }

    /// Run `f` on an existing record under its lock; `None` for unknown peers
    fn update<R>(&self, peer_id: &PeerId, f: impl FnOnce(&mut PeerRecord) -> R) -> Option<R> {
        loop {
            let entry = self.get_entry(peer_id)?;
            let mut record = entry.lock();
            if self.is_live(peer_id, &entry) {
                return Some(f(&mut record));
            }
        }
    }

    /// Clone the table's handles so no shard lock is held while records are locked
    fn entries(&self) -> Vec<(PeerId, Arc<Mutex<PeerRecord>>)> {
        self.peers
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect()
    }

    fn persist(&self, record: &PeerRecord) {
        if let Some(storage) = &self.storage {
            storage.persist(record.clone());
        }
    }
}
