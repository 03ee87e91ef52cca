//! Presence event router
//!
//! Fans a call state event out to every BLF watcher of the two parties.
//! Events arrive on a bounded queue (drop-newest on overflow); a single
//! consumer task does the index lookups and dispatches one synthetic
//! presence-trigger event per watcher to that watcher's owning worker.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::dispatch::DialogDispatcher;
use crate::events::{CallStateEvent, SipEvent};
use crate::subscription::WatcherIndex;
use crate::telemetry::SlowEventLogger;

#[derive(Debug, Default)]
pub struct RouterStats {
    pub events_received: AtomicU64,
    pub events_processed: AtomicU64,
    pub events_dropped: AtomicU64,
    pub notifications_generated: AtomicU64,
    pub watchers_not_found: AtomicU64,
    pub dispatch_failures: AtomicU64,
}

pub struct PresenceRouter {
    tx: mpsc::Sender<CallStateEvent>,
    stats: Arc<RouterStats>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PresenceRouter {
    /// Build the router and spawn its consumer task
    pub fn start(
        max_pending_events: usize,
        index: Arc<WatcherIndex>,
        dispatcher: Arc<DialogDispatcher>,
        slow: Arc<SlowEventLogger>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(max_pending_events.max(1));
        let stats = Arc::new(RouterStats::default());
        let shutdown = CancellationToken::new();

        let consumer = RouterTask {
            rx,
            index,
            dispatcher,
            slow,
            stats: stats.clone(),
            shutdown: shutdown.clone(),
        };
        let task = tokio::spawn(consumer.run());
        info!("presence router started");

        Arc::new(Self {
            tx,
            stats,
            shutdown,
            task: Mutex::new(Some(task)),
        })
    }

    /// Producer side: called from the TCP client's event callback.
    /// Overflow drops the newest event with a warning.
    pub fn on_call_state_event(&self, event: CallStateEvent) {
        self.stats.events_received.fetch_add(1, Ordering::Relaxed);
        if let Err(rejected) = self.tx.try_send(event) {
            self.stats.events_dropped.fetch_add(1, Ordering::Relaxed);
            if let mpsc::error::TrySendError::Full(event) = rejected {
                warn!(call = %event.presence_call_id, "presence router queue full, dropping event");
            }
        }
    }

    pub fn on_connection_state_changed(&self, connected: bool, detail: &str) {
        info!(connected, detail, "presence connection state changed");
    }

    pub fn stats(&self) -> &Arc<RouterStats> {
        &self.stats
    }

    pub async fn stop(&self) {
        self.shutdown.cancel();
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        info!("presence router stopped");
    }
}

struct RouterTask {
    rx: mpsc::Receiver<CallStateEvent>,
    index: Arc<WatcherIndex>,
    dispatcher: Arc<DialogDispatcher>,
    slow: Arc<SlowEventLogger>,
    stats: Arc<RouterStats>,
    shutdown: CancellationToken,
}

impl RouterTask {
    async fn run(mut self) {
        loop {
            let event = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = self.rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            self.route(event);
        }
        debug!("presence router task exiting");
    }

    fn route(&self, event: CallStateEvent) {
        if !event.is_valid() {
            return;
        }

        let timer = self.slow.timer("PRESENCE_ROUTE", &event.presence_call_id);

        // Watchers of either side of the call; each owning worker renders
        // the NOTIFY body against its own monitored URI
        let callee_watchers = self.index.lookup(&event.callee_uri);
        let caller_watchers = self.index.lookup(&event.caller_uri);

        if callee_watchers.is_empty() && caller_watchers.is_empty() {
            self.stats.watchers_not_found.fetch_add(1, Ordering::Relaxed);
            trace!(
                callee = %event.callee_uri,
                caller = %event.caller_uri,
                "no watchers for call state event"
            );
            self.stats.events_processed.fetch_add(1, Ordering::Relaxed);
            timer.finish();
            return;
        }

        let blf_state = event.state.as_blf_state();
        debug!(
            call = %event.presence_call_id,
            state = blf_state,
            watchers = callee_watchers.len() + caller_watchers.len(),
            "routing call state event"
        );

        for watcher in callee_watchers.iter().chain(caller_watchers.iter()) {
            let trigger = SipEvent::presence_trigger(
                watcher.dialog_id.clone(),
                watcher.tenant_id.clone(),
                event.presence_call_id.clone(),
                event.caller_uri.clone(),
                event.callee_uri.clone(),
                blf_state,
                event.direction.clone(),
            );

            match self.dispatcher.dispatch(trigger) {
                Ok(()) => {
                    self.stats.notifications_generated.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.stats.dispatch_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(dialog = %watcher.dialog_id, error = %e, "presence trigger dispatch failed");
                }
            }
        }

        self.stats.events_processed.fetch_add(1, Ordering::Relaxed);
        timer.finish();
    }
}
