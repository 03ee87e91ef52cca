//! Sharded event router
//!
//! Owns the worker pool. Routing is `hash(dialog_id) mod W` over the exact
//! dialog id string — computed here and nowhere else — so every event of a
//! dialog lands on the same single-writer worker.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;
use crate::errors::{Error, Result};
use crate::events::{DialogId, SipEvent};
use crate::store::{StoredSubscription, SubscriptionStore};
use crate::subscription::{SubscriptionRegistry, WatcherIndex};
use crate::telemetry::SlowEventLogger;

use super::worker::{DialogWorker, WorkerHandle};

/// Best-effort sums of the per-worker counters; not transactionally
/// consistent across workers
#[derive(Debug, Default, Clone, Copy)]
pub struct AggregateStats {
    pub events_received: u64,
    pub events_processed: u64,
    pub events_dropped: u64,
    pub presence_triggers: u64,
    pub dialogs_active: u64,
    pub dialogs_reaped: u64,
    pub max_queue_depth: u64,
    pub slow_events: u64,
    pub notify_errors: u64,
}

pub struct DialogDispatcher {
    handles: Vec<WorkerHandle>,
    /// Workers not yet spawned; present between construction and start()
    pending: Mutex<Vec<DialogWorker>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    shutdown: CancellationToken,
}

impl DialogDispatcher {
    pub fn new(
        config: &Config,
        registry: Arc<SubscriptionRegistry>,
        watcher_index: Arc<WatcherIndex>,
        store: Arc<SubscriptionStore>,
        slow: Arc<SlowEventLogger>,
    ) -> Self {
        let num_workers = config.dispatcher.effective_workers();
        let shutdown = CancellationToken::new();

        let mut workers = Vec::with_capacity(num_workers);
        let mut handles = Vec::with_capacity(num_workers);
        for index in 0..num_workers {
            let (worker, handle) = DialogWorker::new(
                index,
                config,
                registry.clone(),
                watcher_index.clone(),
                store.clone(),
                slow.clone(),
                shutdown.clone(),
            );
            workers.push(worker);
            handles.push(handle);
        }

        info!(workers = num_workers, "dialog dispatcher created");
        Self {
            handles,
            pending: Mutex::new(workers),
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            shutdown,
        }
    }

    /// The worker that owns a dialog id
    pub fn worker_index_for(&self, dialog_id: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        dialog_id.hash(&mut hasher);
        (hasher.finish() % self.handles.len() as u64) as usize
    }

    /// Reseed a recovered subscription into its owning worker. Only valid
    /// before start().
    pub fn load_recovered_subscription(&self, stored: StoredSubscription) -> Result<()> {
        if self.started.load(Ordering::Acquire) {
            return Err(Error::invalid_argument("recovery must happen before start"));
        }
        let index = self.worker_index_for(&stored.record.dialog_id);
        let mut pending = self.pending.lock().unwrap();
        match pending.get_mut(index) {
            Some(worker) => {
                worker.load_recovered_subscription(stored);
                Ok(())
            }
            None => Err(Error::invalid_argument("dispatcher already started")),
        }
    }

    /// Spawn all worker tasks. Idempotent.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let workers = std::mem::take(&mut *self.pending.lock().unwrap());
        let mut tasks = self.tasks.lock().unwrap();
        for worker in workers {
            tasks.push(tokio::spawn(worker.run()));
        }
        info!(workers = tasks.len(), "dialog dispatcher started");
    }

    /// Stop every worker and wait for each to drain and exit. Idempotent.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap());
        for task in tasks {
            let _ = task.await;
        }
        info!("dialog dispatcher stopped");
    }

    /// Route one event to its owning worker
    pub fn dispatch(&self, mut event: SipEvent) -> Result<()> {
        if !self.started.load(Ordering::Acquire) {
            return Err(Error::ShuttingDown);
        }
        if !DialogId::is_valid(&event.dialog_id) {
            return Err(Error::invalid_argument("malformed dialog id"));
        }
        event.enqueued_at = Some(Instant::now());
        self.handles[self.worker_index_for(&event.dialog_id)].enqueue(event)
    }

    pub fn num_workers(&self) -> usize {
        self.handles.len()
    }

    pub fn worker(&self, index: usize) -> &WorkerHandle {
        &self.handles[index]
    }

    pub fn workers(&self) -> &[WorkerHandle] {
        &self.handles
    }

    pub fn aggregate_stats(&self) -> AggregateStats {
        let mut agg = AggregateStats::default();
        for handle in &self.handles {
            let stats = handle.stats();
            agg.events_received += stats.events_received.load(Ordering::Relaxed);
            agg.events_processed += stats.events_processed.load(Ordering::Relaxed);
            agg.events_dropped += stats.events_dropped.load(Ordering::Relaxed);
            agg.presence_triggers += stats.presence_triggers_processed.load(Ordering::Relaxed);
            agg.dialogs_active += stats.dialogs_active.load(Ordering::Relaxed);
            agg.dialogs_reaped += stats.dialogs_reaped.load(Ordering::Relaxed);
            agg.slow_events += stats.slow_events.load(Ordering::Relaxed);
            agg.notify_errors += stats.notify_errors.load(Ordering::Relaxed);
            agg.max_queue_depth =
                agg.max_queue_depth.max(stats.queue_depth.load(Ordering::Relaxed));
        }
        agg
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::events::SipEvent;

    fn dispatcher(num_workers: usize) -> DialogDispatcher {
        let mut config = Config::default();
        config.dispatcher.num_workers = num_workers;
        DialogDispatcher::new(
            &config,
            Arc::new(SubscriptionRegistry::new()),
            Arc::new(WatcherIndex::new()),
            SubscriptionStore::disabled(),
            Arc::new(SlowEventLogger::new(&config.slow_event)),
        )
    }

    #[test]
    fn test_routing_is_stable_and_case_sensitive() {
        let dispatcher = dispatcher(8);
        let a = dispatcher.worker_index_for("dialog-abc;ft=1");
        assert_eq!(a, dispatcher.worker_index_for("dialog-abc;ft=1"));
        assert!(a < 8);
        // The hash is over the exact string: case matters
        let b = dispatcher.worker_index_for("DIALOG-ABC;ft=1");
        let _ = b; // may or may not collide, but must be deterministic
        assert_eq!(b, dispatcher.worker_index_for("DIALOG-ABC;ft=1"));
    }

    #[tokio::test]
    async fn test_dispatch_before_start_is_refused() {
        let dispatcher = dispatcher(2);
        let event = SipEvent::incoming_subscribe(
            "d1", "sip:a@t.com", "sip:b@t.com", "dialog", Some(60), 1, None,
        );
        assert!(matches!(dispatcher.dispatch(event), Err(Error::ShuttingDown)));
    }

    #[tokio::test]
    async fn test_dispatch_rejects_invalid_dialog_id() {
        let dispatcher = dispatcher(2);
        dispatcher.start();
        let event = SipEvent::incoming_subscribe(
            "", "sip:a@t.com", "sip:b@t.com", "dialog", Some(60), 1, None,
        );
        assert!(matches!(
            dispatcher.dispatch(event),
            Err(Error::InvalidArgument { .. })
        ));
        let long_id = "x".repeat(2000);
        let event = SipEvent::incoming_subscribe(
            long_id, "sip:a@t.com", "sip:b@t.com", "dialog", Some(60), 1, None,
        );
        assert!(matches!(
            dispatcher.dispatch(event),
            Err(Error::InvalidArgument { .. })
        ));
        dispatcher.stop().await;
    }
}
