//! Stale subscription reaper
//!
//! Periodically asks every worker for dialogs past their TTL or expiry, or
//! stuck mid-processing, and force-terminates them on their owning worker.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ReaperConfig;
use crate::dispatch::DialogDispatcher;
use crate::store::SubscriptionStore;

#[derive(Debug, Default)]
pub struct ReaperStats {
    pub scan_count: AtomicU64,
    pub expired_reaped: AtomicU64,
    pub stuck_reaped: AtomicU64,
    pub last_scan_duration_ms: AtomicU64,
    pub last_scan_stale_count: AtomicU64,
}

pub struct StaleReaper {
    stats: Arc<ReaperStats>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl StaleReaper {
    /// Spawn the periodic scan task
    pub fn start(
        config: ReaperConfig,
        dispatcher: Arc<DialogDispatcher>,
        store: Arc<SubscriptionStore>,
    ) -> Arc<Self> {
        let stats = Arc::new(ReaperStats::default());
        let shutdown = CancellationToken::new();

        let scan_stats = stats.clone();
        let scan_shutdown = shutdown.clone();
        info!(interval_secs = config.scan_interval_sec, "stale reaper started");
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = scan_shutdown.cancelled() => break,
                    _ = tokio::time::sleep(config.scan_interval()) => {}
                }
                scan_and_reap(&config, &dispatcher, &store, &scan_stats).await;
            }
        });

        Arc::new(Self {
            stats,
            shutdown,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn stats(&self) -> &Arc<ReaperStats> {
        &self.stats
    }

    pub async fn stop(&self) {
        self.shutdown.cancel();
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        info!("stale reaper stopped");
    }
}

async fn scan_and_reap(
    config: &ReaperConfig,
    dispatcher: &DialogDispatcher,
    store: &SubscriptionStore,
    stats: &ReaperStats,
) {
    let started = Instant::now();
    stats.scan_count.fetch_add(1, Ordering::Relaxed);
    let mut total = 0u64;

    for handle in dispatcher.workers() {
        let stale = match handle
            .stale_subscriptions(config.blf_ttl(), config.mwi_ttl(), config.stuck_timeout())
            .await
        {
            Ok(stale) => stale,
            Err(e) => {
                warn!(worker = handle.index(), error = %e, "stale query failed");
                continue;
            }
        };

        for info in stale {
            if info.is_stuck {
                stats.stuck_reaped.fetch_add(1, Ordering::Relaxed);
            } else {
                stats.expired_reaped.fetch_add(1, Ordering::Relaxed);
            }
            let _ = handle.force_terminate(&info.dialog_id);
            store.queue_delete(&info.dialog_id);
            total += 1;
        }
    }

    let elapsed_ms = started.elapsed().as_millis() as u64;
    stats.last_scan_duration_ms.store(elapsed_ms, Ordering::Relaxed);
    stats.last_scan_stale_count.store(total, Ordering::Relaxed);
    if total > 0 {
        info!(reaped = total, elapsed_ms, "reaper scan complete");
    }
}
