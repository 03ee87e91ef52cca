//! Recovery after restart: reseeding workers from the durable store

mod common;

use std::sync::Arc;

use common::{wait_until, Harness, RecordingTransport};

use sip_event_core::config::Config;
use sip_event_core::dispatch::DialogDispatcher;
use sip_event_core::events::SipEvent;
use sip_event_core::store::SubscriptionStore;
use sip_event_core::subscription::types::{SubLifecycle, SubscriptionRecord, SubscriptionType};
use sip_event_core::subscription::{SubscriptionRegistry, WatcherIndex};
use sip_event_core::telemetry::SlowEventLogger;

const STORED_BODY: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
    <dialog-info xmlns=\"urn:ietf:params:xml:ns:dialog-info\"\n  version=\"4\"\n  state=\"full\"\n\
      entity=\"sip:300@t.com\">\n</dialog-info>\n";

fn recovered_record() -> SubscriptionRecord {
    let mut record = SubscriptionRecord::new("d1;ft=x;tt=y", "t.com", SubscriptionType::Blf);
    record.lifecycle = SubLifecycle::Active;
    record.blf_monitored_uri = "sip:300@t.com".to_string();
    record.blf_last_state = "early".to_string();
    record.blf_presence_call_id = "c4".to_string();
    record.blf_last_notify_body = STORED_BODY.to_string();
    record.notify_version = 5;
    record.extend_expiry(3600);
    record
}

#[tokio::test]
async fn test_restart_reseeds_index_and_reuses_stored_notify_body() {
    // First life: persist one active BLF subscription
    let first = Harness::start(|_| {});
    first.store.save_immediately(&recovered_record()).await.unwrap();
    first.stop().await;
    let backend = first.backend.clone();

    // Second life: same backend, fresh everything else
    let mut config = Config::default();
    config.dispatcher.num_workers = 2;
    let registry = Arc::new(SubscriptionRegistry::new());
    let index = Arc::new(WatcherIndex::new());
    let store = SubscriptionStore::new(&config.persistence, "svc-test", backend);
    store.start();
    let slow = Arc::new(SlowEventLogger::new(&config.slow_event));
    let dispatcher = Arc::new(DialogDispatcher::new(
        &config,
        registry.clone(),
        index.clone(),
        store.clone(),
        slow.clone(),
    ));

    let recovered = store.load_active_subscriptions().await.unwrap();
    assert_eq!(recovered.len(), 1);
    for stored in recovered {
        dispatcher.load_recovered_subscription(stored).unwrap();
    }
    dispatcher.start();

    // The watcher index and registry were reproduced
    assert_eq!(index.lookup("sip:300@t.com").len(), 1);
    assert_eq!(index.lookup("sip:300@t.com")[0].dialog_id, "d1;ft=x;tt=y");
    assert_eq!(registry.count_by_type(SubscriptionType::Blf), 1);

    // A presence trigger routes to the owning worker (same state as the
    // stored record, so it is absorbed silently)
    let trigger = SipEvent::presence_trigger(
        "d1;ft=x;tt=y",
        "t.com",
        "c4",
        "sip:100@t.com",
        "sip:300@t.com",
        "early",
        "inbound",
    );
    dispatcher.dispatch(trigger).unwrap();
    assert!(wait_until(|| dispatcher.aggregate_stats().presence_triggers == 1).await);

    // The peer re-subscribes after failover: the initial NOTIFY replays
    // the stored body byte for byte
    let transport = RecordingTransport::new();
    let resubscribe = SipEvent::incoming_subscribe(
        "d1;ft=x;tt=y",
        "sip:watcher@t.com",
        "sip:300@t.com",
        "dialog",
        Some(3600),
        2,
        Some(transport.handle(1)),
    );
    dispatcher.dispatch(resubscribe).unwrap();

    assert!(wait_until(|| transport.notifies().len() == 1).await);
    let notify = transport.notifies()[0].clone();
    assert_eq!(notify.body, STORED_BODY);
    assert_eq!(notify.subscription_state, "active");
    let responses = transport.responses();
    assert_eq!(responses[0].1, 200);

    dispatcher.stop().await;
    store.stop().await;
}

#[tokio::test]
async fn test_recovery_skips_terminated_rows() {
    let first = Harness::start(|_| {});
    let mut terminated = recovered_record();
    terminated.dialog_id = "dead;ft=x".to_string();
    terminated.lifecycle = SubLifecycle::Terminated;
    first.store.save_immediately(&recovered_record()).await.unwrap();
    first.store.save_immediately(&terminated).await.unwrap();

    let recovered = first.store.load_active_subscriptions().await.unwrap();
    assert_eq!(recovered.len(), 1);
    assert_eq!(recovered[0].record.dialog_id, "d1;ft=x;tt=y");

    first.stop().await;
}
