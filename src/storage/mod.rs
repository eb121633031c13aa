//! Reputation Storage
//!
//! Durable copy of peer records. The manager never touches a store directly
//! on the hot path: writes go through the [`StorageWriter`] queue and are
//! flushed in batches on a background task.

mod memory;
mod rocks;
mod writer;

pub use memory::MemoryStore;
pub use rocks::RocksStore;
pub use writer::{StorageHandle, StorageWriter};

use crate::types::{PeerId, PeerRecord, Timestamp};

/// Write operation for batch
#[derive(Debug, Clone)]
pub enum StoreOp {
    Put(PeerRecord),
    Delete(PeerId),
}

impl StoreOp {
    pub fn peer_id(&self) -> &PeerId {
        match self {
            StoreOp::Put(record) => &record.peer_id,
            StoreOp::Delete(peer_id) => peer_id,
        }
    }
}

/// Persistence contract for peer records
pub trait PeerStore: Send + Sync {
    /// Apply a batch of operations atomically
    fn save_batch(&self, ops: &[StoreOp]) -> Result<(), StorageError>;

    fn load(&self, peer_id: &PeerId) -> Result<Option<PeerRecord>, StorageError>;

    fn load_all(&self) -> Result<Vec<PeerRecord>, StorageError>;

    /// Capture a point-in-time copy of every record
    fn snapshot(&self, now: Timestamp) -> Result<(), StorageError>;

    /// Remove records not seen for `age_secs`; permanent bans are kept
    fn delete_older_than(&self, age_secs: u64, now: Timestamp) -> Result<usize, StorageError>;

    fn flush(&self) -> Result<(), StorageError>;

    fn save(&self, record: &PeerRecord) -> Result<(), StorageError> {
        self.save_batch(&[StoreOp::Put(record.clone())])
    }

    fn delete(&self, peer_id: &PeerId) -> Result<(), StorageError> {
        self.save_batch(&[StoreOp::Delete(peer_id.clone())])
    }
}

/// Storage errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Failed to open store: {0}")]
    OpenFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    #[error("Snapshot failed: {0}")]
    SnapshotFailed(String),
}

/// Whether the store may drop this record during age-based cleanup
pub(crate) fn is_prunable(record: &PeerRecord, age_secs: u64, now: Timestamp) -> bool {
    record.is_stale(age_secs, now) && !record.ban.is_permanent() && !record.whitelisted
}
