//! Background storage writer
//!
//! The hot path hands records to a bounded queue with `try_send` and never
//! waits on disk. A single tokio task coalesces pending writes per peer and
//! flushes them in batches through `spawn_blocking`. Failed flushes are kept
//! and retried with exponential backoff while the store is marked degraded.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::{PeerStore, StoreOp};
use crate::api::Metrics;
use crate::config::StorageConfig;
use crate::types::{PeerId, PeerRecord, Timestamp};

enum WriterMessage {
    Op(StoreOp),
    Snapshot(Timestamp),
    Prune { age_secs: u64, now: Timestamp },
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable handle used to enqueue writes
#[derive(Clone)]
pub struct StorageHandle {
    tx: mpsc::Sender<WriterMessage>,
    degraded: Arc<AtomicBool>,
    metrics: Arc<Metrics>,
}

impl StorageHandle {
    /// Queue a record for persistence; drops it if the queue is full
    pub fn persist(&self, record: PeerRecord) -> bool {
        self.try_enqueue(WriterMessage::Op(StoreOp::Put(record)))
    }

    /// Queue a record deletion
    pub fn remove(&self, peer_id: PeerId) -> bool {
        self.try_enqueue(WriterMessage::Op(StoreOp::Delete(peer_id)))
    }

    pub fn request_snapshot(&self, now: Timestamp) -> bool {
        self.try_enqueue(WriterMessage::Snapshot(now))
    }

    pub fn request_prune(&self, age_secs: u64, now: Timestamp) -> bool {
        self.try_enqueue(WriterMessage::Prune { age_secs, now })
    }

    /// Whether the last flush attempt failed
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Drain the queue and stop the writer
    ///
    /// Returns false if the writer did not finish within `timeout`.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        let (ack_tx, ack_rx) = oneshot::channel();
        let drained = tokio::time::timeout(timeout, async {
            if self.tx.send(WriterMessage::Shutdown(ack_tx)).await.is_err() {
                return false;
            }
            ack_rx.await.is_ok()
        })
        .await;

        match drained {
            Ok(true) => true,
            Ok(false) => {
                warn!("Storage writer already stopped");
                false
            }
            Err(_) => {
                warn!("Storage writer did not drain within {:?}", timeout);
                false
            }
        }
    }

    fn try_enqueue(&self, msg: WriterMessage) -> bool {
        match self.tx.try_send(msg) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.metrics.inc_storage_dropped();
                debug!("Storage queue full, dropping write");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.metrics.inc_storage_dropped();
                warn!("Storage writer closed, dropping write");
                false
            }
        }
    }
}

/// Spawns the writer task
pub struct StorageWriter;

impl StorageWriter {
    pub fn spawn(
        store: Arc<dyn PeerStore>,
        config: &StorageConfig,
        metrics: Arc<Metrics>,
    ) -> (StorageHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let degraded = Arc::new(AtomicBool::new(false));

        let worker = Worker {
            store,
            rx,
            pending: HashMap::new(),
            degraded: degraded.clone(),
            metrics: metrics.clone(),
            flush_interval: Duration::from_secs(config.flush_interval_secs.max(1)),
            max_batch: config.max_batch.max(1),
            retry_base: Duration::from_millis(config.retry_base_ms.max(1)),
            retry_max: Duration::from_millis(config.retry_max_ms.max(config.retry_base_ms).max(1)),
            backoff: None,
            retry_at: None,
        };

        let handle = tokio::spawn(worker.run());
        (StorageHandle { tx, degraded, metrics }, handle)
    }
}

struct Worker {
    store: Arc<dyn PeerStore>,
    rx: mpsc::Receiver<WriterMessage>,
    pending: HashMap<PeerId, StoreOp>,
    degraded: Arc<AtomicBool>,
    metrics: Arc<Metrics>,
    flush_interval: Duration,
    max_batch: usize,
    retry_base: Duration,
    retry_max: Duration,
    backoff: Option<Duration>,
    retry_at: Option<Instant>,
}

impl Worker {
    async fn run(mut self) {
        let mut interval = tokio::time::interval_at(Instant::now() + self.flush_interval, self.flush_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                msg = self.rx.recv() => match msg {
                    Some(WriterMessage::Op(op)) => {
                        self.pending.insert(op.peer_id().clone(), op);
                        if self.pending.len() >= self.max_batch {
                            self.flush(false).await;
                        }
                    }
                    Some(WriterMessage::Snapshot(now)) => {
                        self.flush(true).await;
                        self.snapshot(now).await;
                    }
                    Some(WriterMessage::Prune { age_secs, now }) => {
                        self.flush(true).await;
                        self.prune(age_secs, now).await;
                    }
                    Some(WriterMessage::Shutdown(ack)) => {
                        self.drain_queue();
                        self.flush(true).await;
                        let _ = ack.send(());
                        break;
                    }
                    None => {
                        self.flush(true).await;
                        break;
                    }
                },
                _ = interval.tick() => {
                    self.flush(false).await;
                }
            }
        }

        if !self.pending.is_empty() {
            error!("Storage writer stopped with {} unsaved records", self.pending.len());
        }
        info!("📦 Storage writer stopped");
    }

    /// Pull every queued op into `pending` without waiting
    fn drain_queue(&mut self) {
        while let Ok(msg) = self.rx.try_recv() {
            if let WriterMessage::Op(op) = msg {
                self.pending.insert(op.peer_id().clone(), op);
            }
        }
    }

    async fn flush(&mut self, force: bool) {
        if self.pending.is_empty() {
            return;
        }
        if !force && self.retry_at.is_some_and(|at| Instant::now() < at) {
            return;
        }

        let ops: Vec<StoreOp> = self.pending.drain().map(|(_, op)| op).collect();
        let count = ops.len();
        let store = self.store.clone();

        let result = tokio::task::spawn_blocking(move || {
            let result = store.save_batch(&ops);
            (ops, result)
        })
        .await;

        match result {
            Ok((_, Ok(()))) => {
                self.metrics.add_storage_writes(count as u64);
                if self.degraded.swap(false, Ordering::Relaxed) {
                    info!("Storage recovered, {} records flushed", count);
                }
                self.backoff = None;
                self.retry_at = None;
                debug!("Flushed {} peer records", count);
            }
            Ok((ops, Err(e))) => {
                self.metrics.inc_storage_failures();
                self.degraded.store(true, Ordering::Relaxed);

                // Newer writes queued meanwhile take precedence
                for op in ops {
                    self.pending.entry(op.peer_id().clone()).or_insert(op);
                }

                let delay = self
                    .backoff
                    .map(|d| (d * 2).min(self.retry_max))
                    .unwrap_or(self.retry_base);
                self.backoff = Some(delay);
                self.retry_at = Some(Instant::now() + delay);
                warn!("Storage flush of {} records failed: {} (retry in {:?})", count, e, delay);
            }
            Err(e) => {
                self.metrics.inc_storage_failures();
                error!("Storage flush task panicked, {} records lost: {}", count, e);
            }
        }
    }

    async fn snapshot(&self, now: Timestamp) {
        let store = self.store.clone();
        match tokio::task::spawn_blocking(move || store.snapshot(now)).await {
            Ok(Ok(())) => self.metrics.inc_snapshots(),
            Ok(Err(e)) => {
                self.metrics.inc_storage_failures();
                warn!("Snapshot failed: {}", e);
            }
            Err(e) => error!("Snapshot task panicked: {}", e),
        }
    }

    async fn prune(&self, age_secs: u64, now: Timestamp) {
        let store = self.store.clone();
        match tokio::task::spawn_blocking(move || store.delete_older_than(age_secs, now)).await {
            Ok(Ok(removed)) if removed > 0 => info!("🧹 Pruned {} stale records from store", removed),
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                self.metrics.inc_storage_failures();
                warn!("Store prune failed: {}", e);
            }
            Err(e) => error!("Prune task panicked: {}", e),
        }
    }
}
