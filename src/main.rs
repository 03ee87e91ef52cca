//! SIP event processor binary: wiring, recovery, and shutdown ordering

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};

use sip_event_core::admin::{AdminServer, AdminState};
use sip_event_core::config::Config;
use sip_event_core::dispatch::{DialogDispatcher, StaleReaper};
use sip_event_core::presence::{
    ConnectionState, FailoverManager, PresenceRouter, PresenceTcpClient,
};
use sip_event_core::store::{MongoDocumentStore, SubscriptionStore};
use sip_event_core::subscription::{SubscriptionRegistry, WatcherIndex};
use sip_event_core::telemetry::{self, SlowEventLogger};
use sip_event_core::transport::LoggingTransport;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => Config::load_from_file(&path)?,
        None => Config::load_defaults(),
    };
    let _log_guard = telemetry::init_tracing(&config.general, &config.logging)?;
    info!(version = env!("CARGO_PKG_VERSION"), "sip event processor starting");

    let config = Arc::new(config);
    let registry = Arc::new(SubscriptionRegistry::new());
    let watcher_index = Arc::new(WatcherIndex::new());
    let slow = Arc::new(SlowEventLogger::new(&config.slow_event));

    // Persistence client first: recovery depends on it
    let store = if config.persistence.enable {
        let backend = MongoDocumentStore::connect(&config.persistence)
            .await
            .context("document store connection failed")?;
        SubscriptionStore::new(&config.persistence, &config.general.service_id, Arc::new(backend))
    } else {
        SubscriptionStore::disabled()
    };
    store.start();

    // Recovery reseeds the workers before any of them runs, so the watcher
    // index is complete by the time the first presence event arrives
    let dispatcher = DialogDispatcher::new(
        &config,
        registry.clone(),
        watcher_index.clone(),
        store.clone(),
        slow.clone(),
    );
    if store.is_enabled() {
        match store.load_active_subscriptions().await {
            Ok(recovered) => {
                let count = recovered.len();
                for stored in recovered {
                    if let Err(e) = dispatcher.load_recovered_subscription(stored) {
                        warn!(error = %e, "recovery insert failed");
                    }
                }
                info!(count, "recovery complete");
            }
            Err(e) => warn!(error = %e, "recovery load failed, starting empty"),
        }
    }
    dispatcher.start();
    let dispatcher = Arc::new(dispatcher);

    // The embedding SIP stack would register a real transport here; the
    // standalone binary logs outgoing messages instead
    let transport = LoggingTransport::new();
    transport.set_running(true);

    // Presence pipeline: failover -> tcp client -> router -> dispatcher
    let failover = Arc::new(FailoverManager::new(
        config.presence.servers.clone(),
        config.presence.failover_strategy,
        config.presence.server_cooldown(),
    ));
    let router = PresenceRouter::start(
        config.presence.max_pending_events,
        watcher_index.clone(),
        dispatcher.clone(),
        slow.clone(),
    );
    let presence_client = Arc::new(PresenceTcpClient::new(
        config.presence.clone(),
        failover.clone(),
    ));
    {
        let event_router = router.clone();
        let state_router = router.clone();
        presence_client.start(
            Arc::new(move |event| event_router.on_call_state_event(event)),
            Arc::new(move |state, detail| {
                state_router
                    .on_connection_state_changed(state == ConnectionState::Connected, detail)
            }),
        );
    }

    let reaper = StaleReaper::start(config.reaper.clone(), dispatcher.clone(), store.clone());

    let admin = if config.http.enabled {
        Some(
            AdminServer::start(AdminState {
                config: config.clone(),
                dispatcher: dispatcher.clone(),
                registry: registry.clone(),
                watcher_index: watcher_index.clone(),
                failover: failover.clone(),
                presence_client: presence_client.clone(),
                router_stats: router.stats().clone(),
                reaper_stats: reaper.stats().clone(),
                store: store.clone(),
                transport: transport.clone(),
                slow: slow.clone(),
            })
            .await?,
        )
    } else {
        None
    };

    info!(service_id = %config.general.service_id, "all components started");

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut stats_tick = tokio::time::interval(Duration::from_secs(30));
    stats_tick.tick().await;
    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            _ = stats_tick.tick() => {
                let agg = dispatcher.aggregate_stats();
                info!(
                    received = agg.events_received,
                    processed = agg.events_processed,
                    dialogs = agg.dialogs_active,
                    slow = agg.slow_events,
                    presence = presence_client.is_connected(),
                    "periodic stats"
                );
            }
        }
    }

    // Reverse dependency order: stop producers before consumers
    info!("shutting down");
    if let Some(admin) = admin {
        admin.stop().await;
    }
    reaper.stop().await;
    presence_client.stop().await;
    router.stop().await;
    transport.set_running(false);
    dispatcher.stop().await;
    store.stop().await;

    info!("sip event processor stopped cleanly");
    Ok(())
}
