//! Admin HTTP surface
//!
//! Read-only JSON endpoints for health probes and operational visibility.
//! Health is 200 iff the SIP stack is running, the dispatcher exists, and
//! the persistence client is connected when persistence is enabled. A
//! disconnected presence feed is reported as degraded, not unhealthy.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;
use crate::dispatch::{DialogDispatcher, ReaperStats};
use crate::errors::{Error, Result};
use crate::presence::{FailoverManager, PresenceTcpClient, RouterStats};
use crate::store::SubscriptionStore;
use crate::subscription::{SubscriptionRegistry, SubscriptionType, WatcherIndex};
use crate::telemetry::SlowEventLogger;
use crate::transport::SipTransport;

/// Shared handles the endpoints read from
#[derive(Clone)]
pub struct AdminState {
    pub config: Arc<Config>,
    pub dispatcher: Arc<DialogDispatcher>,
    pub registry: Arc<SubscriptionRegistry>,
    pub watcher_index: Arc<WatcherIndex>,
    pub failover: Arc<FailoverManager>,
    pub presence_client: Arc<PresenceTcpClient>,
    pub router_stats: Arc<RouterStats>,
    pub reaper_stats: Arc<ReaperStats>,
    pub store: Arc<SubscriptionStore>,
    pub transport: Arc<dyn SipTransport>,
    pub slow: Arc<SlowEventLogger>,
}

impl AdminState {
    fn is_healthy(&self) -> bool {
        self.transport.is_running() && (!self.store.is_enabled() || self.store.is_connected())
    }
}

pub struct AdminServer {
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl AdminServer {
    /// Bind and serve the admin router
    pub async fn start(state: AdminState) -> Result<Arc<Self>> {
        let bind = format!(
            "{}:{}",
            state.config.http.bind_address, state.config.http.port
        );
        let listener = tokio::net::TcpListener::bind(&bind)
            .await
            .map_err(|e| Error::config_error(format!("admin bind {bind} failed: {e}")))?;
        info!(bind = %bind, "admin http server listening");

        let app = Router::new()
            .route("/health", get(handle_health))
            .route("/ready", get(handle_ready))
            .route("/stats", get(handle_stats))
            .route("/stats/workers", get(handle_stats_workers))
            .route("/stats/presence", get(handle_stats_presence))
            .route("/subscriptions", get(handle_subscriptions))
            .route("/config", get(handle_config))
            .with_state(state);

        let shutdown = CancellationToken::new();
        let serve_shutdown = shutdown.clone();
        let task = tokio::spawn(async move {
            let serve = axum::serve(listener, app)
                .with_graceful_shutdown(async move { serve_shutdown.cancelled().await });
            if let Err(e) = serve.await {
                tracing::error!(error = %e, "admin server error");
            }
        });

        Ok(Arc::new(Self {
            shutdown,
            task: Mutex::new(Some(task)),
        }))
    }

    pub async fn stop(&self) {
        self.shutdown.cancel();
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        info!("admin http server stopped");
    }
}

async fn handle_health(State(state): State<AdminState>) -> impl IntoResponse {
    let healthy = state.is_healthy();
    let presence_ok = state.presence_client.is_connected();

    let body = json!({
        "sip_stack": state.transport.is_running(),
        "dispatcher": true,
        "persistence": if state.store.is_enabled() { Some(state.store.is_connected()) } else { None },
        "presence_feed": presence_ok,
        "presence_server": state.presence_client.connected_server(),
        "presence_healthy_servers": state.failover.healthy_count(),
        "healthy": healthy,
        "degraded": !presence_ok,
    });

    let status = if healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(body))
}

async fn handle_ready(State(state): State<AdminState>) -> impl IntoResponse {
    let ready = state.is_healthy();
    let status = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(json!({ "ready": ready })))
}

async fn handle_stats(State(state): State<AdminState>) -> Json<serde_json::Value> {
    let agg = state.dispatcher.aggregate_stats();
    let store_stats = state.store.stats();
    let slow_stats = state.slow.stats();
    let (warn_ms, error_ms, critical_ms) = state.slow.thresholds();
    let reaper = state.reaper_stats.as_ref();

    Json(json!({
        "service_id": state.config.general.service_id,
        "dispatcher": {
            "events_received": agg.events_received,
            "events_processed": agg.events_processed,
            "events_dropped": agg.events_dropped,
            "presence_triggers": agg.presence_triggers,
            "dialogs_active": agg.dialogs_active,
            "dialogs_reaped": agg.dialogs_reaped,
            "max_queue_depth": agg.max_queue_depth,
            "slow_events": agg.slow_events,
            "notify_errors": agg.notify_errors,
        },
        "subscriptions": {
            "total": state.registry.total_count(),
            "blf": state.registry.count_by_type(SubscriptionType::Blf),
            "mwi": state.registry.count_by_type(SubscriptionType::Mwi),
        },
        "blf_index": {
            "monitored_uris": state.watcher_index.monitored_uri_count(),
            "total_watchers": state.watcher_index.total_watcher_count(),
        },
        "reaper": {
            "scans": reaper.scan_count.load(Ordering::Relaxed),
            "expired": reaper.expired_reaped.load(Ordering::Relaxed),
            "stuck": reaper.stuck_reaped.load(Ordering::Relaxed),
            "last_scan_ms": reaper.last_scan_duration_ms.load(Ordering::Relaxed),
        },
        "slow_events": {
            "warn_count": slow_stats.warn_count.load(Ordering::Relaxed),
            "error_count": slow_stats.error_count.load(Ordering::Relaxed),
            "critical_count": slow_stats.critical_count.load(Ordering::Relaxed),
            "max_duration_ms": slow_stats.max_duration_ms.load(Ordering::Relaxed),
            "warn_threshold_ms": warn_ms,
            "error_threshold_ms": error_ms,
            "critical_threshold_ms": critical_ms,
        },
        "persistence": {
            "enabled": state.store.is_enabled(),
            "connected": state.store.is_connected(),
            "upserts": store_stats.upserts.load(Ordering::Relaxed),
            "deletes": store_stats.deletes.load(Ordering::Relaxed),
            "loads": store_stats.loads.load(Ordering::Relaxed),
            "errors": store_stats.errors.load(Ordering::Relaxed),
            "batch_writes": store_stats.batch_writes.load(Ordering::Relaxed),
            "queue_depth": store_stats.queue_depth.load(Ordering::Relaxed),
        },
    }))
}

async fn handle_stats_workers(State(state): State<AdminState>) -> Json<serde_json::Value> {
    let workers: Vec<_> = state
        .dispatcher
        .workers()
        .iter()
        .map(|handle| {
            let stats = handle.stats();
            json!({
                "index": handle.index(),
                "events_received": stats.events_received.load(Ordering::Relaxed),
                "events_processed": stats.events_processed.load(Ordering::Relaxed),
                "events_dropped": stats.events_dropped.load(Ordering::Relaxed),
                "presence_triggers": stats.presence_triggers_processed.load(Ordering::Relaxed),
                "dialogs_active": stats.dialogs_active.load(Ordering::Relaxed),
                "queue_depth": stats.queue_depth.load(Ordering::Relaxed),
                "slow_events": stats.slow_events.load(Ordering::Relaxed),
            })
        })
        .collect();
    Json(json!({ "workers": workers }))
}

async fn handle_stats_presence(State(state): State<AdminState>) -> Json<serde_json::Value> {
    let client = state.presence_client.stats();
    let router = state.router_stats.as_ref();
    let servers: Vec<_> = state
        .failover
        .all_health()
        .into_iter()
        .map(|health| {
            json!({
                "server": health.endpoint.address(),
                "priority": health.endpoint.priority,
                "healthy": health.is_healthy,
                "consecutive_failures": health.consecutive_failures,
                "total_successes": health.total_successes,
                "total_failures": health.total_failures,
                "in_cooldown": health.cooldown_until.is_some(),
            })
        })
        .collect();

    Json(json!({
        "client": {
            "connected": state.presence_client.is_connected(),
            "state": state.presence_client.connection_state().as_str(),
            "server": state.presence_client.connected_server(),
            "events_received": client.events_received.load(Ordering::Relaxed),
            "events_delivered": client.events_delivered.load(Ordering::Relaxed),
            "bytes_received": client.bytes_received.load(Ordering::Relaxed),
            "connect_attempts": client.connect_attempts.load(Ordering::Relaxed),
            "connect_successes": client.connect_successes.load(Ordering::Relaxed),
            "disconnects": client.disconnect_count.load(Ordering::Relaxed),
            "failovers": client.failover_count.load(Ordering::Relaxed),
            "heartbeat_timeouts": client.heartbeat_timeouts.load(Ordering::Relaxed),
            "parse_errors": client.parse_errors.load(Ordering::Relaxed),
        },
        "router": {
            "events_received": router.events_received.load(Ordering::Relaxed),
            "events_processed": router.events_processed.load(Ordering::Relaxed),
            "events_dropped": router.events_dropped.load(Ordering::Relaxed),
            "notifications_generated": router.notifications_generated.load(Ordering::Relaxed),
            "watchers_not_found": router.watchers_not_found.load(Ordering::Relaxed),
        },
        "servers": servers,
    }))
}

async fn handle_subscriptions(
    State(state): State<AdminState>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<serde_json::Value> {
    let subscriptions = match params.get("tenant") {
        Some(tenant) => state.registry.tenant_subscriptions(tenant),
        None => state.registry.all(),
    };
    let entries: Vec<_> = subscriptions
        .into_iter()
        .map(|info| {
            json!({
                "dialog_id": info.dialog_id,
                "tenant_id": info.tenant_id,
                "type": info.kind.as_str(),
                "lifecycle": info.lifecycle.as_str(),
                "idle_secs": info.last_activity.elapsed().as_secs(),
                "worker": info.worker_index,
            })
        })
        .collect();
    Json(json!({ "count": entries.len(), "subscriptions": entries }))
}

/// Configuration echo with secrets redacted
async fn handle_config(State(state): State<AdminState>) -> Json<serde_json::Value> {
    let config = &state.config;
    let servers: Vec<_> = config
        .presence
        .servers
        .iter()
        .map(|s| json!({ "host": s.host, "port": s.port, "priority": s.priority }))
        .collect();

    Json(json!({
        "general": {
            "service_id": config.general.service_id,
            "instance_name": config.general.instance_name,
            "log_level": config.general.log_level,
        },
        "dispatcher": {
            "num_workers": config.dispatcher.effective_workers(),
            "max_incoming_queue_per_worker": config.dispatcher.max_incoming_queue_per_worker,
            "max_dialogs_per_worker": config.dispatcher.max_dialogs_per_worker,
        },
        "tenant": {
            "max_subscriptions_per_tenant": config.tenant.max_subscriptions_per_tenant,
        },
        "reaper": {
            "blf_subscription_ttl_sec": config.reaper.blf_subscription_ttl_sec,
            "mwi_subscription_ttl_sec": config.reaper.mwi_subscription_ttl_sec,
            "scan_interval_sec": config.reaper.scan_interval_sec,
            "stuck_processing_timeout_sec": config.reaper.stuck_processing_timeout_sec,
        },
        "presence": {
            "servers": servers,
            "failover_strategy": format!("{:?}", config.presence.failover_strategy),
            "heartbeat_interval_sec": config.presence.heartbeat_interval_sec,
            "max_pending_events": config.presence.max_pending_events,
        },
        "persistence": {
            "enable": config.persistence.enable,
            "uri": config.persistence.redacted_uri(),
            "database": config.persistence.database,
            "collection": config.persistence.collection,
            "sync_interval_sec": config.persistence.sync_interval_sec,
            "batch_size": config.persistence.batch_size,
        },
        "http": {
            "bind_address": config.http.bind_address,
            "port": config.http.port,
        },
    }))
}
