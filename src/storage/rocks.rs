//! RocksDB peer store
//!
//! Persistent storage for peer records.
//! Survives restarts so bans and history cannot be laundered by a reboot.

use rocksdb::checkpoint::Checkpoint;
use rocksdb::{IteratorMode, Options, WriteBatch, DB};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use super::{is_prunable, PeerStore, StorageError, StoreOp};
use crate::types::{PeerId, PeerRecord, Timestamp};

/// Key prefix for peer records
const PREFIX_PEER: &[u8] = b"peer:";

/// Directory name prefix for checkpoints
const SNAPSHOT_PREFIX: &str = "snapshot-";

/// Peer store backed by RocksDB
pub struct RocksStore {
    db: DB,

    /// Checkpoint directory, a sibling of the database
    snapshot_dir: PathBuf,

    /// Checkpoints kept on disk
    max_snapshots: usize,
}

impl RocksStore {
    /// Open or create a store at the given path
    ///
    /// If the database cannot be opened, the newest snapshot is restored in
    /// its place.
    pub fn open(path: &Path, max_snapshots: usize) -> Result<Self, StorageError> {
        let snapshot_dir = snapshot_dir_for(path);

        let db = match open_db(path) {
            Ok(db) => db,
            Err(e) => {
                error!("Failed to open reputation store at {:?}: {}", path, e);
                let snapshot = latest_snapshot(&snapshot_dir)?
                    .ok_or_else(|| StorageError::OpenFailed(format!("{} (no snapshot to restore)", e)))?;
                restore_snapshot(&snapshot, path)?;
                warn!("♻️  Restored reputation store from {:?}", snapshot);
                open_db(path)?
            }
        };

        Ok(Self {
            db,
            snapshot_dir,
            max_snapshots,
        })
    }

    pub fn snapshot_dir(&self) -> &Path {
        &self.snapshot_dir
    }

    /// Snapshot directories, oldest first
    pub fn list_snapshots(&self) -> Result<Vec<PathBuf>, StorageError> {
        list_snapshots(&self.snapshot_dir)
    }

    fn prune_snapshots(&self) -> Result<(), StorageError> {
        let snapshots = self.list_snapshots()?;
        if snapshots.len() <= self.max_snapshots {
            return Ok(());
        }

        let excess = snapshots.len() - self.max_snapshots;
        for old in snapshots.into_iter().take(excess) {
            debug!("Removing old snapshot {:?}", old);
            std::fs::remove_dir_all(&old).map_err(|e| StorageError::SnapshotFailed(e.to_string()))?;
        }
        Ok(())
    }

    fn iter_records(&self) -> impl Iterator<Item = PeerRecord> + '_ {
        self.db
            .iterator(IteratorMode::From(PREFIX_PEER, rocksdb::Direction::Forward))
            .filter_map(|item| match item {
                Ok(kv) => Some(kv),
                Err(e) => {
                    warn!("Reputation store iteration error (skipping): {}", e);
                    None
                }
            })
            .take_while(|(key, _)| key.starts_with(PREFIX_PEER))
            .filter_map(|(key, value)| match bincode::deserialize::<PeerRecord>(&value) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!("Skipping undecodable record {:?}: {}", String::from_utf8_lossy(&key), e);
                    None
                }
            })
    }
}

impl PeerStore for RocksStore {
    fn save_batch(&self, ops: &[StoreOp]) -> Result<(), StorageError> {
        let mut batch = WriteBatch::default();

        for op in ops {
            match op {
                StoreOp::Put(record) => {
                    let value = bincode::serialize(record)
                        .map_err(|e| StorageError::SerializationFailed(e.to_string()))?;
                    batch.put(peer_key(&record.peer_id), value);
                }
                StoreOp::Delete(peer_id) => batch.delete(peer_key(peer_id)),
            }
        }

        self.db
            .write(batch)
            .map_err(|e| StorageError::WriteFailed(e.to_string()))
    }

    fn load(&self, peer_id: &PeerId) -> Result<Option<PeerRecord>, StorageError> {
        let value = self
            .db
            .get(peer_key(peer_id))
            .map_err(|e| StorageError::ReadFailed(e.to_string()))?;

        value
            .map(|bytes| {
                bincode::deserialize(&bytes).map_err(|e| StorageError::SerializationFailed(e.to_string()))
            })
            .transpose()
    }

    fn load_all(&self) -> Result<Vec<PeerRecord>, StorageError> {
        let records: Vec<_> = self.iter_records().collect();
        info!("📦 Loaded {} peer records from store", records.len());
        Ok(records)
    }

    fn snapshot(&self, now: Timestamp) -> Result<(), StorageError> {
        std::fs::create_dir_all(&self.snapshot_dir)
            .map_err(|e| StorageError::SnapshotFailed(e.to_string()))?;

        let target = self.snapshot_dir.join(format!("{}{:020}", SNAPSHOT_PREFIX, now));
        if target.exists() {
            debug!("Snapshot {:?} already exists", target);
            return Ok(());
        }

        let checkpoint = Checkpoint::new(&self.db).map_err(|e| StorageError::SnapshotFailed(e.to_string()))?;
        checkpoint
            .create_checkpoint(&target)
            .map_err(|e| StorageError::SnapshotFailed(e.to_string()))?;

        info!("📸 Reputation snapshot written to {:?}", target);
        self.prune_snapshots()
    }

    fn delete_older_than(&self, age_secs: u64, now: Timestamp) -> Result<usize, StorageError> {
        let stale: Vec<StoreOp> = self
            .iter_records()
            .filter(|record| is_prunable(record, age_secs, now))
            .map(|record| StoreOp::Delete(record.peer_id))
            .collect();

        let count = stale.len();
        if count > 0 {
            self.save_batch(&stale)?;
            debug!("Deleted {} stale peer records", count);
        }
        Ok(count)
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.db.flush().map_err(|e| StorageError::WriteFailed(e.to_string()))
    }
}

fn open_db(path: &Path) -> Result<DB, StorageError> {
    let mut opts = Options::default();
    opts.create_if_missing(true);
    opts.set_max_open_files(100);
    opts.set_keep_log_file_num(3);

    DB::open(&opts, path).map_err(|e| StorageError::OpenFailed(e.to_string()))
}

fn snapshot_dir_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "reputation".to_string());
    path.with_file_name(format!("{}-snapshots", name))
}

fn list_snapshots(dir: &Path) -> Result<Vec<PathBuf>, StorageError> {
    if !dir.exists() {
        return Ok(vec![]);
    }

    let mut snapshots: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(|e| StorageError::ReadFailed(e.to_string()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|p| {
            p.is_dir()
                && p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(SNAPSHOT_PREFIX))
        })
        .collect();

    // Zero-padded timestamps sort chronologically
    snapshots.sort();
    Ok(snapshots)
}

fn latest_snapshot(dir: &Path) -> Result<Option<PathBuf>, StorageError> {
    Ok(list_snapshots(dir)?.pop())
}

/// Replace the database directory with a copy of a checkpoint
fn restore_snapshot(snapshot: &Path, path: &Path) -> Result<(), StorageError> {
    let map_err = |e: std::io::Error| StorageError::OpenFailed(format!("snapshot restore: {}", e));

    if path.is_dir() {
        std::fs::remove_dir_all(path).map_err(map_err)?;
    } else if path.exists() {
        std::fs::remove_file(path).map_err(map_err)?;
    }
    std::fs::create_dir_all(path).map_err(map_err)?;

    for entry in std::fs::read_dir(snapshot).map_err(map_err)? {
        let entry = entry.map_err(map_err)?;
        if entry.path().is_file() {
            std::fs::copy(entry.path(), path.join(entry.file_name())).map_err(map_err)?;
        }
    }
    Ok(())
}

/// Create storage key for a peer
fn peer_key(peer_id: &PeerId) -> Vec<u8> {
    let id = peer_id.as_str().as_bytes();
    let mut key = Vec::with_capacity(PREFIX_PEER.len() + id.len());
    key.extend_from_slice(PREFIX_PEER);
    key.extend_from_slice(id);
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BanState;
    use tempfile::tempdir;

    fn create_test_record(id: &str, last_seen: u64) -> PeerRecord {
        let mut record = PeerRecord::new(PeerId::from(id), last_seen);
        record.address = Some(format!("10.0.0.1:{}", 30000 + last_seen % 1000));
        record.score = 72.5;
        record
    }

    #[test]
    fn test_store_open() {
        let dir = tempdir().unwrap();
        let store = RocksStore::open(&dir.path().join("reputation"), 5).unwrap();
        assert!(store.load_all().unwrap().is_empty());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let store = RocksStore::open(&dir.path().join("reputation"), 5).unwrap();

        let record = create_test_record("peer-a", 100);
        store.save(&record).unwrap();

        let loaded = store.load(&record.peer_id).unwrap().unwrap();
        assert_eq!(loaded, record);
        assert!(store.load(&PeerId::from("missing")).unwrap().is_none());
    }

    #[test]
    fn test_batch_put_and_delete() {
        let dir = tempdir().unwrap();
        let store = RocksStore::open(&dir.path().join("reputation"), 5).unwrap();

        store
            .save_batch(&[
                StoreOp::Put(create_test_record("a", 1)),
                StoreOp::Put(create_test_record("b", 2)),
                StoreOp::Put(create_test_record("c", 3)),
            ])
            .unwrap();
        store.delete(&PeerId::from("b")).unwrap();

        let mut ids: Vec<_> = store.load_all().unwrap().into_iter().map(|r| r.peer_id).collect();
        ids.sort();
        assert_eq!(ids, vec![PeerId::from("a"), PeerId::from("c")]);
    }

    #[test]
    fn test_persistence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("reputation");

        // Add record and close
        {
            let store = RocksStore::open(&path, 5).unwrap();
            store.save(&create_test_record("durable", 10)).unwrap();
            store.flush().unwrap();
        }

        // Reopen and verify
        {
            let store = RocksStore::open(&path, 5).unwrap();
            assert_eq!(store.load_all().unwrap().len(), 1);
        }
    }

    #[test]
    fn test_delete_older_than_keeps_permanent_bans() {
        let dir = tempdir().unwrap();
        let store = RocksStore::open(&dir.path().join("reputation"), 5).unwrap();

        let stale = create_test_record("stale", 0);
        let mut banned = create_test_record("banned", 0);
        banned.ban = BanState::Permanent { since: 0, reason: "double signing".to_string() };
        let fresh = create_test_record("fresh", 1_000);

        store
            .save_batch(&[StoreOp::Put(stale), StoreOp::Put(banned), StoreOp::Put(fresh)])
            .unwrap();

        let removed = store.delete_older_than(500, 1_000).unwrap();
        assert_eq!(removed, 1);
        assert!(store.load(&PeerId::from("stale")).unwrap().is_none());
        assert!(store.load(&PeerId::from("banned")).unwrap().is_some());
        assert!(store.load(&PeerId::from("fresh")).unwrap().is_some());
    }

    #[test]
    fn test_snapshot_retention() {
        let dir = tempdir().unwrap();
        let store = RocksStore::open(&dir.path().join("reputation"), 2).unwrap();
        store.save(&create_test_record("a", 1)).unwrap();

        for ts in [100, 200, 300] {
            store.snapshot(ts).unwrap();
        }

        let snapshots = store.list_snapshots().unwrap();
        assert_eq!(snapshots.len(), 2);
        assert!(snapshots[0].ends_with(format!("snapshot-{:020}", 200)));
    }

    #[test]
    fn test_restore_from_snapshot_when_db_is_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("reputation");

        {
            let store = RocksStore::open(&path, 5).unwrap();
            store.save(&create_test_record("survivor", 5)).unwrap();
            store.snapshot(1_000).unwrap();
        }

        // Replace the database directory with a plain file
        std::fs::remove_dir_all(&path).unwrap();
        std::fs::write(&path, b"not a database").unwrap();

        let store = RocksStore::open(&path, 5).unwrap();
        assert!(store.load(&PeerId::from("survivor")).unwrap().is_some());
    }
}
