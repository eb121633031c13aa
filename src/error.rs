//! Reputation engine errors

use crate::storage::StorageError;
use crate::types::PeerId;

/// Errors returned by the reputation manager's admin and query API
#[derive(Debug, thiserror::Error)]
pub enum ReputationError {
    #[error("Peer not found: {0}")]
    PeerNotFound(PeerId),

    #[error("Peer {0} is whitelisted")]
    Whitelisted(PeerId),

    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

pub type Result<T> = std::result::Result<T, ReputationError>;
