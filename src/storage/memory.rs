//! In-memory peer store
//!
//! Used by tests and by embedders that do not need durability. Writes can be
//! made to fail on demand to exercise the writer's retry path.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use super::{is_prunable, PeerStore, StorageError, StoreOp};
use crate::types::{PeerId, PeerRecord, Timestamp};

#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<PeerId, PeerRecord>>,
    snapshots: Mutex<Vec<(Timestamp, HashMap<PeerId, PeerRecord>)>>,
    fail_writes: AtomicBool,
    batches: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail until reset
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Successful batches written so far
    pub fn batch_count(&self) -> u64 {
        self.batches.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots.lock().len()
    }
}

impl PeerStore for MemoryStore {
    fn save_batch(&self, ops: &[StoreOp]) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::WriteFailed("injected failure".to_string()));
        }

        let mut records = self.records.write();
        for op in ops {
            match op {
                StoreOp::Put(record) => {
                    records.insert(record.peer_id.clone(), record.clone());
                }
                StoreOp::Delete(peer_id) => {
                    records.remove(peer_id);
                }
            }
        }
        self.batches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn load(&self, peer_id: &PeerId) -> Result<Option<PeerRecord>, StorageError> {
        Ok(self.records.read().get(peer_id).cloned())
    }

    fn load_all(&self) -> Result<Vec<PeerRecord>, StorageError> {
        Ok(self.records.read().values().cloned().collect())
    }

    fn snapshot(&self, now: Timestamp) -> Result<(), StorageError> {
        let copy = self.records.read().clone();
        self.snapshots.lock().push((now, copy));
        Ok(())
    }

    fn delete_older_than(&self, age_secs: u64, now: Timestamp) -> Result<usize, StorageError> {
        let mut records = self.records.write();
        let before = records.len();
        records.retain(|_, record| !is_prunable(record, age_secs, now));
        Ok(before - records.len())
    }

    fn flush(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_injected_failure() {
        let store = MemoryStore::new();
        let record = PeerRecord::new(PeerId::from("p"), 0);

        store.set_fail_writes(true);
        assert!(store.save(&record).is_err());
        assert!(store.is_empty());

        store.set_fail_writes(false);
        store.save(&record).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.batch_count(), 1);
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let store = MemoryStore::new();
        store.save(&PeerRecord::new(PeerId::from("p"), 0)).unwrap();
        store.snapshot(10).unwrap();
        store.delete(&PeerId::from("p")).unwrap();

        assert_eq!(store.snapshot_count(), 1);
        assert!(store.is_empty());
    }
}
