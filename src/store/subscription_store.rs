//! Durable subscription store
//!
//! Two write paths: lifecycle edges (create, activate, terminate) persist
//! immediately; routine state updates queue onto a write-behind batch that
//! a background task flushes when it reaches the batch size or on the sync
//! interval, preserving enqueue order. A persistence failure is counted,
//! never propagated into SIP processing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::PersistenceConfig;
use crate::errors::{Error, Result};
use crate::store::document::{DocumentStore, SubscriptionDocument};
use crate::subscription::types::SubscriptionRecord;

/// A record loaded during recovery; the owning worker must send a
/// full-state NOTIFY before relying on incremental updates again
#[derive(Debug)]
pub struct StoredSubscription {
    pub record: SubscriptionRecord,
    pub needs_full_state_notify: bool,
}

#[derive(Debug, Default)]
pub struct StoreStats {
    pub upserts: AtomicU64,
    pub deletes: AtomicU64,
    pub loads: AtomicU64,
    pub errors: AtomicU64,
    pub batch_writes: AtomicU64,
    pub queue_depth: AtomicU64,
}

const BATCH_FLUSH_WARN_MS: u64 = 100;

enum PendingOp {
    Upsert(SubscriptionDocument),
    Delete(String),
}

pub struct SubscriptionStore {
    enabled: bool,
    backend: Option<Arc<dyn DocumentStore>>,
    service_id: String,
    batch_size: usize,
    sync_interval: std::time::Duration,
    pending: Mutex<Vec<PendingOp>>,
    wakeup: Notify,
    stats: StoreStats,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SubscriptionStore {
    pub fn new(
        config: &PersistenceConfig,
        service_id: &str,
        backend: Arc<dyn DocumentStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            enabled: config.enable,
            backend: Some(backend),
            service_id: service_id.to_string(),
            batch_size: config.batch_size.max(1),
            sync_interval: config.sync_interval(),
            pending: Mutex::new(Vec::new()),
            wakeup: Notify::new(),
            stats: StoreStats::default(),
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
        })
    }

    /// A store that accepts everything and persists nothing
    pub fn disabled() -> Arc<Self> {
        Arc::new(Self {
            enabled: false,
            backend: None,
            service_id: String::new(),
            batch_size: 1,
            sync_interval: std::time::Duration::from_secs(1),
            pending: Mutex::new(Vec::new()),
            wakeup: Notify::new(),
            stats: StoreStats::default(),
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled && self.backend.is_some()
    }

    pub fn is_connected(&self) -> bool {
        self.backend.as_ref().map(|b| b.is_connected()).unwrap_or(false)
    }

    pub fn stats(&self) -> &StoreStats {
        &self.stats
    }

    /// Spawn the background sync task. Idempotent; no-op when disabled.
    pub fn start(self: &Arc<Self>) {
        if !self.is_enabled() {
            info!("subscription store persistence disabled");
            return;
        }
        let mut task = self.task.lock().unwrap();
        if task.is_some() {
            return;
        }
        let store = self.clone();
        *task = Some(tokio::spawn(async move { store.sync_loop().await }));
        info!(
            batch_size = self.batch_size,
            sync_interval_secs = self.sync_interval.as_secs(),
            "subscription store started"
        );
    }

    /// Stop the sync task; pending operations are drained before exit
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        info!("subscription store stopped");
    }

    /// Queue an async, batched persistence write
    pub fn queue_upsert(&self, record: &SubscriptionRecord) {
        if !self.is_enabled() {
            return;
        }
        let document = SubscriptionDocument::from_record(record, &self.service_id);
        let depth = {
            let mut pending = self.pending.lock().unwrap();
            pending.push(PendingOp::Upsert(document));
            pending.len()
        };
        self.stats.queue_depth.store(depth as u64, Ordering::Relaxed);
        if depth >= self.batch_size {
            self.wakeup.notify_one();
        }
    }

    /// Queue an async delete
    pub fn queue_delete(&self, dialog_id: &str) {
        if !self.is_enabled() {
            return;
        }
        let depth = {
            let mut pending = self.pending.lock().unwrap();
            pending.push(PendingOp::Delete(dialog_id.to_string()));
            pending.len()
        };
        self.stats.queue_depth.store(depth as u64, Ordering::Relaxed);
        if depth >= self.batch_size {
            self.wakeup.notify_one();
        }
    }

    /// Synchronous write for lifecycle edges
    pub async fn save_immediately(&self, record: &SubscriptionRecord) -> Result<()> {
        let Some(backend) = self.backend.as_ref().filter(|_| self.enabled) else {
            return Ok(());
        };
        let document = SubscriptionDocument::from_record(record, &self.service_id);
        match backend.upsert(&document).await {
            Ok(()) => {
                self.stats.upserts.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                warn!(dialog = %record.dialog_id, error = %e, "immediate save failed");
                Err(e)
            }
        }
    }

    /// Synchronous delete for lifecycle edges
    pub async fn delete_immediately(&self, dialog_id: &str) -> Result<()> {
        let Some(backend) = self.backend.as_ref().filter(|_| self.enabled) else {
            return Ok(());
        };
        match backend.delete(dialog_id).await {
            Ok(()) => {
                self.stats.deletes.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                warn!(dialog = dialog_id, error = %e, "immediate delete failed");
                Err(e)
            }
        }
    }

    /// Recovery loader: every Active or Pending row becomes a
    /// [`StoredSubscription`] needing a full-state NOTIFY. Rows without a
    /// dialog id are skipped. The caller re-dispatches each record to the
    /// owning worker; this method never touches the watcher index.
    pub async fn load_active_subscriptions(&self) -> Result<Vec<StoredSubscription>> {
        let Some(backend) = self.backend.as_ref().filter(|_| self.enabled) else {
            return Ok(Vec::new());
        };

        let mut out = Vec::new();
        for lifecycle in ["Active", "Pending"] {
            for document in backend.find_by_lifecycle(lifecycle).await? {
                if document.dialog_id.is_empty() {
                    continue;
                }
                self.stats.loads.fetch_add(1, Ordering::Relaxed);
                out.push(StoredSubscription {
                    record: document.into_record(),
                    needs_full_state_notify: true,
                });
            }
        }
        info!(count = out.len(), "loaded subscriptions for recovery");
        Ok(out)
    }

    /// Single-record load by dialog id
    pub async fn load_subscription(&self, dialog_id: &str) -> Result<StoredSubscription> {
        let Some(backend) = self.backend.as_ref().filter(|_| self.enabled) else {
            return Err(Error::not_found(dialog_id));
        };
        match backend.find_one(dialog_id).await? {
            Some(document) if !document.dialog_id.is_empty() => {
                self.stats.loads.fetch_add(1, Ordering::Relaxed);
                Ok(StoredSubscription {
                    record: document.into_record(),
                    needs_full_state_notify: true,
                })
            }
            _ => Err(Error::not_found(dialog_id)),
        }
    }

    async fn sync_loop(&self) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.wakeup.notified() => {}
                _ = tokio::time::sleep(self.sync_interval) => {}
            }
            self.flush_pending().await;
        }
        // Drain whatever arrived before the cancel
        self.flush_pending().await;
    }

    async fn flush_pending(&self) {
        let batch = {
            let mut pending = self.pending.lock().unwrap();
            std::mem::take(&mut *pending)
        };
        self.stats.queue_depth.store(0, Ordering::Relaxed);
        if batch.is_empty() {
            return;
        }

        let Some(backend) = self.backend.as_ref() else {
            return;
        };

        let count = batch.len();
        let started = std::time::Instant::now();

        // One op at a time, order preserved
        for op in batch {
            let result = match op {
                PendingOp::Upsert(document) => {
                    let result = backend.upsert(&document).await;
                    if result.is_ok() {
                        self.stats.upserts.fetch_add(1, Ordering::Relaxed);
                    }
                    result
                }
                PendingOp::Delete(dialog_id) => {
                    let result = backend.delete(&dialog_id).await;
                    if result.is_ok() {
                        self.stats.deletes.fetch_add(1, Ordering::Relaxed);
                    }
                    result
                }
            };
            if let Err(e) = result {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "batched persistence op failed");
            }
        }

        self.stats.batch_writes.fetch_add(1, Ordering::Relaxed);
        let elapsed_ms = started.elapsed().as_millis() as u64;
        if elapsed_ms > BATCH_FLUSH_WARN_MS {
            warn!(ops = count, elapsed_ms, "slow batch flush");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::document::MemoryDocumentStore;
    use crate::subscription::types::{SubLifecycle, SubscriptionType};

    fn record(dialog_id: &str, lifecycle: SubLifecycle) -> SubscriptionRecord {
        let mut record = SubscriptionRecord::new(dialog_id, "test.com", SubscriptionType::Blf);
        record.lifecycle = lifecycle;
        record
    }

    fn store_with_memory() -> (Arc<SubscriptionStore>, Arc<MemoryDocumentStore>) {
        let backend = Arc::new(MemoryDocumentStore::new());
        let config = PersistenceConfig {
            batch_size: 3,
            sync_interval_sec: 3600,
            ..Default::default()
        };
        (
            SubscriptionStore::new(&config, "svc-test", backend.clone()),
            backend,
        )
    }

    #[tokio::test]
    async fn test_immediate_save_and_delete() {
        let (store, backend) = store_with_memory();
        store
            .save_immediately(&record("d1", SubLifecycle::Active))
            .await
            .unwrap();
        assert_eq!(backend.len(), 1);

        store.delete_immediately("d1").await.unwrap();
        assert!(backend.is_empty());
        assert_eq!(store.stats().upserts.load(Ordering::Relaxed), 1);
        assert_eq!(store.stats().deletes.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_batch_flushes_on_threshold() {
        let (store, backend) = store_with_memory();
        store.start();

        store.queue_upsert(&record("d1", SubLifecycle::Active));
        store.queue_upsert(&record("d2", SubLifecycle::Active));
        assert!(backend.is_empty());

        // Third op reaches the batch size and wakes the sync task
        store.queue_upsert(&record("d3", SubLifecycle::Active));
        for _ in 0..50 {
            if backend.len() == 3 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(backend.len(), 3);
        assert_eq!(store.stats().batch_writes.load(Ordering::Relaxed), 1);

        store.stop().await;
    }

    #[tokio::test]
    async fn test_stop_drains_pending() {
        let (store, backend) = store_with_memory();
        store.start();
        store.queue_upsert(&record("d1", SubLifecycle::Active));
        store.queue_delete("other");
        store.stop().await;
        assert_eq!(backend.len(), 1);
    }

    #[tokio::test]
    async fn test_load_filters_lifecycles_and_empty_ids() {
        let (store, backend) = store_with_memory();
        store.save_immediately(&record("d1", SubLifecycle::Active)).await.unwrap();
        store.save_immediately(&record("d2", SubLifecycle::Pending)).await.unwrap();
        store.save_immediately(&record("d3", SubLifecycle::Terminated)).await.unwrap();
        backend
            .upsert(&SubscriptionDocument {
                lifecycle: "Active".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        let recovered = store.load_active_subscriptions().await.unwrap();
        assert_eq!(recovered.len(), 2);
        assert!(recovered.iter().all(|s| s.needs_full_state_notify));
        assert!(recovered.iter().all(|s| s.record.lifecycle != SubLifecycle::Terminated));
    }

    #[tokio::test]
    async fn test_load_single_record() {
        let (store, _backend) = store_with_memory();
        store.save_immediately(&record("d1", SubLifecycle::Active)).await.unwrap();

        let stored = store.load_subscription("d1").await.unwrap();
        assert_eq!(stored.record.dialog_id, "d1");
        assert!(stored.needs_full_state_notify);

        assert!(matches!(
            store.load_subscription("missing").await,
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_disabled_store_is_inert() {
        let store = SubscriptionStore::disabled();
        store.start();
        store.queue_upsert(&record("d1", SubLifecycle::Active));
        store.save_immediately(&record("d1", SubLifecycle::Active)).await.unwrap();
        assert!(store.load_active_subscriptions().await.unwrap().is_empty());
        assert!(!store.is_enabled());
        assert!(!store.is_connected());
        store.stop().await;
    }
}
