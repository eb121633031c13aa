//! KratOs Peer Reputation Engine
//!
//! Scores peers from observed behaviour, applies penalty points and an
//! escalating ban ladder, guards against Sybil concentration and decides
//! whether a connection should be accepted.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  KRATOS REPUTATION ENGINE                   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Rate Limiter        ──▶ SpamAttempt events                 │
//! │  Reputation Manager  ←── record_event / should_accept_peer  │
//! │    ├─ Scoring        ←── sub-scores, evidence, decay        │
//! │    ├─ Ban Policy     ←── penalty points, ban ladder         │
//! │    └─ Diversity      ←── subnet / ASN / country caps        │
//! │  Storage Writer      ──▶ RocksDB (batched, snapshots)       │
//! │  Monitor             ──▶ health, alerts                     │
//! │  HTTP API (8090)     ←── stats, peers, metrics, admin       │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod config;
pub mod error;
pub mod monitor;
pub mod policy;
pub mod rate_limiter;
pub mod registry;
pub mod scoring;
pub mod storage;
pub mod types;

#[cfg(test)]
mod tests;

pub use api::Metrics;
pub use config::ReputationConfig;
pub use error::{ReputationError, Result};
pub use monitor::{Alert, AlertKind, HealthStatus, ReputationMonitor};
pub use policy::{BanPolicy, BanVerdict};
pub use rate_limiter::{EventSink, RateLimiter};
pub use registry::{Admission, EventOutcome, RejectReason, ReputationManager, ReputationStats};
pub use storage::{MemoryStore, PeerStore, RocksStore, StorageHandle, StorageWriter};
pub use types::{BanState, EventData, EventKind, PeerEvent, PeerId, PeerRecord, TrustLevel};
