//! Per-dialog worker
//!
//! Each worker is one task owning a shard of the dialog space. Events
//! arrive on a bounded incoming channel and are drained in one sweep per
//! cycle into per-dialog queues; the worker then processes at most one
//! event per dialog per cycle, so a chatty dialog cannot starve its
//! neighbors. Out-of-band force-terminations and stale queries arrive on a
//! control channel drained ahead of event distribution. Nothing outside
//! the worker ever touches its dialog table.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::errors::{Error, Result};
use crate::events::{SipDirection, SipEvent, SipEventCategory, SipEventSource};
use crate::store::{StoredSubscription, SubscriptionStore};
use crate::subscription::registry::{SubscriptionInfo, SubscriptionRegistry};
use crate::subscription::types::{SubLifecycle, SubscriptionRecord, SubscriptionType};
use crate::subscription::{BlfProcessor, MwiProcessor, WatcherIndex};
use crate::telemetry::SlowEventLogger;
use crate::transport::SipHandle;

/// How often an idle worker wakes to run cleanup and control work
const IDLE_TICK: Duration = Duration::from_millis(100);
/// Terminated-dialog sweep cadence, in processing cycles
const CLEANUP_INTERVAL: u64 = 1000;

#[derive(Debug, Default)]
pub struct WorkerStats {
    pub events_received: AtomicU64,
    pub events_processed: AtomicU64,
    pub events_dropped: AtomicU64,
    pub presence_triggers_processed: AtomicU64,
    pub dialogs_active: AtomicU64,
    pub dialogs_reaped: AtomicU64,
    pub queue_depth: AtomicU64,
    pub slow_events: AtomicU64,
    pub notify_errors: AtomicU64,
}

/// One stale dialog, as reported to the reaper
#[derive(Debug, Clone)]
pub struct StaleInfo {
    pub dialog_id: String,
    pub tenant_id: String,
    pub kind: SubscriptionType,
    pub lifecycle: SubLifecycle,
    pub is_stuck: bool,
}

/// Out-of-band requests served between processing cycles
pub enum WorkerControl {
    ForceTerminate(String),
    StaleQuery {
        blf_ttl: Duration,
        mwi_ttl: Duration,
        stuck_timeout: Duration,
        reply: oneshot::Sender<Vec<StaleInfo>>,
    },
}

struct DialogContext {
    record: SubscriptionRecord,
    queue: VecDeque<SipEvent>,
    handle: Option<SipHandle>,
    needs_full_state_notify: bool,
}

/// Producer-side view of a worker
#[derive(Clone)]
pub struct WorkerHandle {
    index: usize,
    event_tx: mpsc::Sender<SipEvent>,
    control_tx: mpsc::UnboundedSender<WorkerControl>,
    stats: Arc<WorkerStats>,
}

impl WorkerHandle {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn stats(&self) -> &Arc<WorkerStats> {
        &self.stats
    }

    /// Hand an event to the worker. Full queue is backpressure, not an
    /// error of the event itself.
    pub fn enqueue(&self, event: SipEvent) -> Result<()> {
        match self.event_tx.try_send(event) {
            Ok(()) => {
                self.stats.events_received.fetch_add(1, Ordering::Relaxed);
                self.stats.queue_depth.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.stats.events_dropped.fetch_add(1, Ordering::Relaxed);
                Err(Error::capacity_exceeded(format!("worker {} incoming queue", self.index)))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Error::ShuttingDown),
        }
    }

    /// Ask the worker to terminate a dialog on its next cycle
    pub fn force_terminate(&self, dialog_id: &str) -> Result<()> {
        self.control_tx
            .send(WorkerControl::ForceTerminate(dialog_id.to_string()))
            .map_err(|_| Error::ShuttingDown)
    }

    /// Point-in-time stale snapshot, computed by the worker between events
    pub async fn stale_subscriptions(
        &self,
        blf_ttl: Duration,
        mwi_ttl: Duration,
        stuck_timeout: Duration,
    ) -> Result<Vec<StaleInfo>> {
        let (reply, response) = oneshot::channel();
        self.control_tx
            .send(WorkerControl::StaleQuery { blf_ttl, mwi_ttl, stuck_timeout, reply })
            .map_err(|_| Error::ShuttingDown)?;
        response.await.map_err(|_| Error::ShuttingDown)
    }
}

/// Everything the processing paths need besides the dialog table itself
struct WorkerCore {
    index: usize,
    max_dialogs: usize,
    max_per_tenant: usize,
    registry: Arc<SubscriptionRegistry>,
    watcher_index: Arc<WatcherIndex>,
    store: Arc<SubscriptionStore>,
    slow: Arc<SlowEventLogger>,
    stats: Arc<WorkerStats>,
    blf: BlfProcessor,
    mwi: MwiProcessor,
}

pub struct DialogWorker {
    core: WorkerCore,
    dialogs: HashMap<String, DialogContext>,
    event_rx: mpsc::Receiver<SipEvent>,
    control_rx: mpsc::UnboundedReceiver<WorkerControl>,
    shutdown: CancellationToken,
    cycle: u64,
}

impl DialogWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        index: usize,
        config: &Config,
        registry: Arc<SubscriptionRegistry>,
        watcher_index: Arc<WatcherIndex>,
        store: Arc<SubscriptionStore>,
        slow: Arc<SlowEventLogger>,
        shutdown: CancellationToken,
    ) -> (Self, WorkerHandle) {
        let (event_tx, event_rx) =
            mpsc::channel(config.dispatcher.max_incoming_queue_per_worker.max(1));
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let stats = Arc::new(WorkerStats::default());

        let worker = Self {
            core: WorkerCore {
                index,
                max_dialogs: config.dispatcher.max_dialogs_per_worker,
                max_per_tenant: config.tenant.max_subscriptions_per_tenant,
                registry,
                watcher_index,
                store,
                slow,
                stats: stats.clone(),
                blf: BlfProcessor::new(),
                mwi: MwiProcessor::new(),
            },
            dialogs: HashMap::new(),
            event_rx,
            control_rx,
            shutdown,
            cycle: 0,
        };
        let handle = WorkerHandle { index, event_tx, control_tx, stats };
        (worker, handle)
    }

    /// Reseed one recovered subscription. Must be called before the worker
    /// task is spawned; this is the only indexing path during recovery.
    pub fn load_recovered_subscription(&mut self, stored: StoredSubscription) {
        let record = stored.record;
        if record.kind == SubscriptionType::Blf && !record.blf_monitored_uri.is_empty() {
            self.core
                .watcher_index
                .add(&record.blf_monitored_uri, &record.dialog_id, &record.tenant_id);
        }
        self.core.registry.register(SubscriptionInfo {
            dialog_id: record.dialog_id.clone(),
            tenant_id: record.tenant_id.clone(),
            kind: record.kind,
            lifecycle: record.lifecycle,
            last_activity: record.last_activity,
            worker_index: self.core.index,
        });

        debug!(
            worker = self.core.index,
            dialog = %record.dialog_id,
            kind = %record.kind,
            "recovered subscription"
        );
        self.dialogs.insert(
            record.dialog_id.clone(),
            DialogContext {
                record,
                queue: VecDeque::new(),
                handle: None,
                needs_full_state_notify: stored.needs_full_state_notify,
            },
        );
        self.core
            .stats
            .dialogs_active
            .store(self.dialogs.len() as u64, Ordering::Relaxed);
    }

    pub async fn run(mut self) {
        info!(worker = self.core.index, "dialog worker started");
        let mut batch: Vec<SipEvent> = Vec::new();
        let mut controls: Vec<WorkerControl> = Vec::new();

        loop {
            let mut stopping = false;
            tokio::select! {
                _ = self.shutdown.cancelled() => stopping = true,
                event = self.event_rx.recv() => match event {
                    Some(event) => batch.push(event),
                    None => stopping = true,
                },
                control = self.control_rx.recv() => {
                    if let Some(control) = control {
                        controls.push(control);
                    }
                }
                _ = tokio::time::sleep(IDLE_TICK) => {}
            }

            // Control requests drain first, ahead of event distribution
            while let Ok(control) = self.control_rx.try_recv() {
                controls.push(control);
            }
            // The incoming batch drains in one sweep
            while let Ok(event) = self.event_rx.try_recv() {
                batch.push(event);
            }
            if !batch.is_empty() {
                self.core
                    .stats
                    .queue_depth
                    .fetch_sub(batch.len() as u64, Ordering::Relaxed);
            }

            for control in controls.drain(..) {
                self.handle_control(control).await;
            }
            for event in batch.drain(..) {
                self.distribute(event).await;
            }

            self.process_dialog_queues().await;

            self.cycle += 1;
            if self.cycle % CLEANUP_INTERVAL == 0 {
                self.cleanup_terminated_dialogs();
            }

            if stopping || self.shutdown.is_cancelled() {
                break;
            }
        }

        self.drain_on_shutdown().await;
    }

    async fn handle_control(&mut self, control: WorkerControl) {
        match control {
            WorkerControl::ForceTerminate(dialog_id) => {
                if let Some(ctx) = self.dialogs.get_mut(&dialog_id) {
                    self.core.terminate_dialog(&dialog_id, ctx, true).await;
                    ctx.queue.clear();
                    self.core.stats.dialogs_reaped.fetch_add(1, Ordering::Relaxed);
                }
            }
            WorkerControl::StaleQuery { blf_ttl, mwi_ttl, stuck_timeout, reply } => {
                let _ = reply.send(self.stale_subscriptions(blf_ttl, mwi_ttl, stuck_timeout));
            }
        }
    }

    fn stale_subscriptions(
        &self,
        blf_ttl: Duration,
        mwi_ttl: Duration,
        stuck_timeout: Duration,
    ) -> Vec<StaleInfo> {
        let mut stale = Vec::new();
        for (dialog_id, ctx) in &self.dialogs {
            let record = &ctx.record;
            if record.lifecycle == SubLifecycle::Terminated {
                continue;
            }
            let ttl = if record.kind == SubscriptionType::Blf { blf_ttl } else { mwi_ttl };
            let is_stuck = record.is_stuck(stuck_timeout);
            let is_stale = record.last_activity.elapsed() > ttl || record.is_expired();
            if is_stale || is_stuck {
                stale.push(StaleInfo {
                    dialog_id: dialog_id.clone(),
                    tenant_id: record.tenant_id.clone(),
                    kind: record.kind,
                    lifecycle: record.lifecycle,
                    is_stuck,
                });
            }
        }
        stale
    }

    /// Place one drained event into its dialog's queue, creating the
    /// dialog when admission allows it
    async fn distribute(&mut self, event: SipEvent) {
        if !self.dialogs.contains_key(&event.dialog_id) {
            // No dialog to target: presence triggers race termination
            if event.source == SipEventSource::PresenceFeed {
                self.core.stats.events_dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
            let is_new_subscribe = event.category == SipEventCategory::Subscribe
                && event.direction == SipDirection::Incoming;
            if !is_new_subscribe {
                debug!(dialog = %event.dialog_id, category = event.category.as_str(),
                       "event for unknown dialog dropped");
                self.core.stats.events_dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
            if !self.admit_new_subscription(&event).await {
                self.core.stats.events_dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
        if let Some(ctx) = self.dialogs.get_mut(&event.dialog_id) {
            ctx.queue.push_back(event);
        }
    }

    /// Create a Pending dialog for a first SUBSCRIBE, or refuse it with
    /// the mandated response
    async fn admit_new_subscription(&mut self, event: &SipEvent) -> bool {
        let core = &self.core;
        if core.registry.count_by_tenant(&event.tenant_id) >= core.max_per_tenant {
            warn!(tenant = %event.tenant_id, "tenant subscription quota exceeded");
            if let Some(handle) = event.handle.as_ref() {
                handle.respond(403, "Forbidden", None);
            }
            return false;
        }
        if self.dialogs.len() >= core.max_dialogs {
            warn!(worker = core.index, "dialog capacity exceeded");
            if let Some(handle) = event.handle.as_ref() {
                handle.respond(503, "Service Unavailable", None);
            }
            return false;
        }
        if event.sub_type == SubscriptionType::Unknown {
            debug!(event_header = %event.event_header, "unknown event package");
            if let Some(handle) = event.handle.as_ref() {
                handle.respond(489, "Bad Event", None);
            }
            return false;
        }

        let mut record =
            SubscriptionRecord::new(&event.dialog_id, &event.tenant_id, event.sub_type);
        record.call_id = event.call_id.clone();
        record.from_uri = event.from_uri.clone();
        record.from_tag = event.from_tag.clone();
        record.to_uri = event.to_uri.clone();
        record.to_tag = event.to_tag.clone();
        record.contact_uri = event.contact_uri.clone();
        match event.sub_type {
            SubscriptionType::Blf => record.blf_monitored_uri = event.to_uri.clone(),
            SubscriptionType::Mwi => record.mwi_account_uri = event.to_uri.clone(),
            SubscriptionType::Unknown => {}
        }
        if let Some(expires) = event.expires.filter(|&e| e > 0) {
            record.extend_expiry(expires);
        }

        core.registry.register(SubscriptionInfo {
            dialog_id: record.dialog_id.clone(),
            tenant_id: record.tenant_id.clone(),
            kind: record.kind,
            lifecycle: SubLifecycle::Pending,
            last_activity: record.last_activity,
            worker_index: core.index,
        });
        // Creation is a lifecycle edge: persist before the dialog is visible
        let _ = core.store.save_immediately(&record).await;

        self.dialogs.insert(
            event.dialog_id.clone(),
            DialogContext {
                record,
                queue: VecDeque::new(),
                handle: None,
                needs_full_state_notify: false,
            },
        );
        self.core
            .stats
            .dialogs_active
            .store(self.dialogs.len() as u64, Ordering::Relaxed);
        true
    }

    /// One event per dialog per cycle: round-robin fairness across dialogs
    async fn process_dialog_queues(&mut self) {
        let core = &self.core;
        for ctx in self.dialogs.values_mut() {
            if let Some(event) = ctx.queue.pop_front() {
                core.process_event(ctx, event).await;
            }
        }
    }

    fn cleanup_terminated_dialogs(&mut self) {
        let core = &self.core;
        let before = self.dialogs.len();
        self.dialogs.retain(|dialog_id, ctx| {
            let done = ctx.queue.is_empty()
                && (ctx.record.lifecycle == SubLifecycle::Terminated || ctx.record.is_expired());
            if done {
                if ctx.record.kind == SubscriptionType::Blf {
                    core.watcher_index.remove_dialog(dialog_id);
                }
                core.registry.unregister(dialog_id);
            }
            !done
        });
        let removed = before - self.dialogs.len();
        if removed > 0 {
            debug!(worker = core.index, removed, "cleaned up terminated dialogs");
            core.stats
                .dialogs_active
                .store(self.dialogs.len() as u64, Ordering::Relaxed);
        }
    }

    async fn drain_on_shutdown(&mut self) {
        while let Ok(event) = self.event_rx.try_recv() {
            self.distribute(event).await;
        }
        while self.dialogs.values().any(|ctx| !ctx.queue.is_empty()) {
            self.process_dialog_queues().await;
        }
        // Deindex everything this worker owned; dropping the contexts
        // releases their transport handles
        for (dialog_id, ctx) in self.dialogs.drain() {
            if ctx.record.kind == SubscriptionType::Blf {
                self.core.watcher_index.remove_dialog(&dialog_id);
            }
        }
        info!(worker = self.core.index, "dialog worker stopped");
    }
}

impl WorkerCore {
    async fn process_event(&self, ctx: &mut DialogContext, mut event: SipEvent) {
        ctx.record.is_processing = true;
        ctx.record.processing_started_at = Some(Instant::now());
        ctx.record.touch();
        ctx.record.events_processed += 1;

        let timer = self.slow.timer(event.category.as_str(), &event.dialog_id);

        // Latest transport handle wins; the displaced one releases its ref
        if let Some(handle) = event.handle.take() {
            ctx.handle = Some(handle);
        }

        if event.source == SipEventSource::PresenceFeed {
            self.process_presence_trigger(ctx, &event);
        } else {
            self.process_sip_event(ctx, &event).await;
        }

        ctx.record.is_processing = false;
        ctx.record.processing_started_at = None;

        let elapsed_ms = timer.finish();
        if elapsed_ms >= self.slow.thresholds().0 {
            self.stats.slow_events.fetch_add(1, Ordering::Relaxed);
        }
        self.stats.events_processed.fetch_add(1, Ordering::Relaxed);
    }

    fn process_presence_trigger(&self, ctx: &mut DialogContext, event: &SipEvent) {
        if let Some(action) = self.blf.process_presence_trigger(event, &mut ctx.record) {
            match ctx.handle.as_ref() {
                Some(handle) => handle.send_notify(
                    ctx.record.kind.notify_event_type(),
                    action.content_type,
                    &action.body,
                    action.subscription_state,
                ),
                // Recovered dialogs have no handle until the peer re-subscribes
                None => debug!(dialog = %ctx.record.dialog_id, "no transport handle, notify skipped"),
            }
        }
        self.stats.presence_triggers_processed.fetch_add(1, Ordering::Relaxed);

        if ctx.record.dirty {
            self.store.queue_upsert(&ctx.record);
            ctx.record.dirty = false;
        }
    }

    async fn process_sip_event(&self, ctx: &mut DialogContext, event: &SipEvent) {
        // Responses to NOTIFYs we sent: failure means the dialog is gone
        if event.category == SipEventCategory::Notify && event.direction == SipDirection::Outgoing {
            if (200..300).contains(&event.status) {
                return;
            }
            if event.status >= 400 {
                warn!(
                    dialog = %ctx.record.dialog_id,
                    status = event.status,
                    "notify rejected, terminating subscription"
                );
                self.stats.notify_errors.fetch_add(1, Ordering::Relaxed);
                let dialog_id = ctx.record.dialog_id.clone();
                self.terminate_dialog(&dialog_id, ctx, false).await;
            }
            return;
        }

        if ctx.record.kind == SubscriptionType::Unknown
            && event.sub_type != SubscriptionType::Unknown
        {
            ctx.record.kind = event.sub_type;
        }

        let previous_lifecycle = ctx.record.lifecycle;
        let result = match ctx.record.kind {
            SubscriptionType::Blf => self.blf.process(event, &mut ctx.record),
            SubscriptionType::Mwi => self.mwi.process(event, &mut ctx.record),
            SubscriptionType::Unknown => {
                Err(Error::invalid_argument("subscription type never resolved"))
            }
        };
        if let Err(e) = result {
            debug!(dialog = %ctx.record.dialog_id, error = %e, "processor rejected event");
        }

        let is_incoming_subscribe = event.category == SipEventCategory::Subscribe
            && event.direction == SipDirection::Incoming;
        let dialog_id = ctx.record.dialog_id.clone();

        if is_incoming_subscribe
            && (event.is_unsubscribe() || ctx.record.lifecycle == SubLifecycle::Terminating)
        {
            if let Some(handle) = ctx.handle.as_ref() {
                handle.respond(200, "OK", Some(0));
            }
            self.terminate_dialog(&dialog_id, ctx, true).await;
        } else if ctx.record.lifecycle == SubLifecycle::Terminated {
            // Terminal substate from the peer or a 481/489 response path
            self.terminate_dialog(&dialog_id, ctx, false).await;
        } else if is_incoming_subscribe {
            let activated = previous_lifecycle == SubLifecycle::Pending
                && ctx.record.lifecycle == SubLifecycle::Active;

            if activated && ctx.record.kind == SubscriptionType::Blf {
                if !ctx.record.blf_monitored_uri.is_empty() {
                    self.watcher_index.add(
                        &ctx.record.blf_monitored_uri,
                        &dialog_id,
                        &ctx.record.tenant_id,
                    );
                }
            }
            if activated {
                self.registry.register(SubscriptionInfo {
                    dialog_id: dialog_id.clone(),
                    tenant_id: ctx.record.tenant_id.clone(),
                    kind: ctx.record.kind,
                    lifecycle: SubLifecycle::Active,
                    last_activity: ctx.record.last_activity,
                    worker_index: self.index,
                });
            }

            if let Some(handle) = ctx.handle.as_ref() {
                handle.respond(200, "OK", event.expires);
            }

            if activated || ctx.needs_full_state_notify {
                self.emit_initial_notify(ctx);
                ctx.needs_full_state_notify = false;
                // Activation is a lifecycle edge: persist synchronously
                let _ = self.store.save_immediately(&ctx.record).await;
                ctx.record.dirty = false;
            } else if ctx.record.dirty {
                self.store.queue_upsert(&ctx.record);
                ctx.record.dirty = false;
            }
        } else if ctx.record.dirty {
            self.store.queue_upsert(&ctx.record);
            ctx.record.dirty = false;
        }
    }

    /// Full-state NOTIFY on activation or after recovery. A recovered
    /// dialog reuses its stored body verbatim so the watcher sees exactly
    /// the pre-failover state.
    fn emit_initial_notify(&self, ctx: &mut DialogContext) {
        let Some(handle) = ctx.handle.as_ref() else {
            debug!(dialog = %ctx.record.dialog_id, "no transport handle, initial notify skipped");
            return;
        };

        match ctx.record.kind {
            SubscriptionType::Blf => {
                let body = if ctx.needs_full_state_notify
                    && !ctx.record.blf_last_notify_body.is_empty()
                {
                    ctx.record.blf_last_notify_body.clone()
                } else {
                    match self.blf.build_full_state_body(&mut ctx.record) {
                        Ok(body) => {
                            ctx.record.blf_last_notify_body = body.clone();
                            body
                        }
                        Err(e) => {
                            warn!(dialog = %ctx.record.dialog_id, error = %e,
                                  "initial notify body build failed");
                            return;
                        }
                    }
                };
                handle.send_notify("dialog", "application/dialog-info+xml", &body, "active");
            }
            SubscriptionType::Mwi | SubscriptionType::Unknown => {
                let body = self.mwi.build_message_summary(&ctx.record);
                ctx.record.next_notify_version();
                ctx.record.mwi_last_notify_body = body.clone();
                handle.send_notify(
                    "message-summary",
                    "application/simple-message-summary",
                    &body,
                    "active",
                );
            }
        }
    }

    /// Shared termination path: deindex, mark Terminated, unregister,
    /// optionally emit the final NOTIFY, persist, queue the delete
    async fn terminate_dialog(&self, dialog_id: &str, ctx: &mut DialogContext, final_notify: bool) {
        ctx.record.lifecycle = SubLifecycle::Terminated;
        if ctx.record.kind == SubscriptionType::Blf {
            self.watcher_index.remove_dialog(dialog_id);
        }
        self.registry.unregister(dialog_id);

        if final_notify {
            if let Some(handle) = ctx.handle.as_ref() {
                match ctx.record.kind {
                    SubscriptionType::Blf => {
                        match self.blf.build_termination_body(&mut ctx.record) {
                            Ok(body) => handle.send_notify(
                                "dialog",
                                "application/dialog-info+xml",
                                &body,
                                "terminated",
                            ),
                            Err(e) => warn!(dialog = dialog_id, error = %e,
                                            "final notify body build failed"),
                        }
                    }
                    SubscriptionType::Mwi | SubscriptionType::Unknown => {
                        ctx.record.next_notify_version();
                        let body = self.mwi.build_termination_body();
                        handle.send_notify(
                            "message-summary",
                            "application/simple-message-summary",
                            &body,
                            "terminated",
                        );
                    }
                }
            }
        }

        let _ = self.store.save_immediately(&ctx.record).await;
        self.store.queue_delete(dialog_id);
        ctx.record.dirty = false;

        info!(dialog = dialog_id, kind = %ctx.record.kind, "subscription terminated");
    }
}
