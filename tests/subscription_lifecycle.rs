//! End-to-end subscription lifecycle through the dispatcher and workers

mod common;

use common::{settle, wait_until, Harness};

use sip_event_core::errors::Error;
use sip_event_core::events::{SipEvent, SipEventCategory};

#[tokio::test]
async fn test_blf_lifecycle_with_presence_fanout() {
    let harness = Harness::start(|_| {});
    let dialog = "call-1;ft=a;tt=b";

    // Initial SUBSCRIBE: 200 OK plus a full-state NOTIFY with the empty
    // envelope (no state known yet)
    harness
        .dispatcher
        .dispatch(harness.subscribe(dialog, "sip:200@test.com", 3600, 1))
        .unwrap();
    assert!(wait_until(|| harness.transport.notifies().len() == 1).await);

    let responses = harness.transport.responses();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].1, 200);

    let initial = harness.transport.notifies()[0].clone();
    assert_eq!(initial.event_type, "dialog");
    assert_eq!(initial.subscription_state, "active");
    assert!(initial.body.contains("version=\"0\""));
    assert!(!initial.body.contains("<dialog "), "initial envelope is empty");

    // The watcher is indexed under the normalized monitored URI
    assert_eq!(harness.index.lookup("sip:200@TEST.COM").len(), 1);
    assert_eq!(harness.registry.count_by_tenant("test.com"), 1);

    // Presence: ringing -> NOTIFY version 1 with early state
    let ringing = presence_trigger(dialog, "early", "c1");
    harness.dispatcher.dispatch(ringing).unwrap();
    assert!(wait_until(|| harness.transport.notifies().len() == 2).await);
    let early = harness.transport.notifies()[1].clone();
    assert!(early.body.contains("version=\"1\""));
    assert!(early.body.contains("<state>early</state>"));

    // The identical state again is suppressed
    let duplicate = presence_trigger(dialog, "early", "c1");
    harness.dispatcher.dispatch(duplicate).unwrap();
    settle().await;
    assert_eq!(harness.transport.notifies().len(), 2);

    // Confirmed -> NOTIFY version 2
    let confirmed = presence_trigger(dialog, "confirmed", "c1");
    harness.dispatcher.dispatch(confirmed).unwrap();
    assert!(wait_until(|| harness.transport.notifies().len() == 3).await);
    let confirmed = harness.transport.notifies()[2].clone();
    assert!(confirmed.body.contains("version=\"2\""));
    assert!(confirmed.body.contains("<state>confirmed</state>"));

    // Unsubscribe: 200 OK, final NOTIFY version 3 terminated, empty
    // envelope, index and registry cleared
    harness
        .dispatcher
        .dispatch(harness.subscribe(dialog, "sip:200@test.com", 0, 2))
        .unwrap();
    assert!(wait_until(|| harness.transport.notifies().len() == 4).await);

    let terminal = harness.transport.notifies()[3].clone();
    assert_eq!(terminal.subscription_state, "terminated");
    assert!(terminal.body.contains("version=\"3\""));
    assert!(!terminal.body.contains("<dialog "));

    let responses = harness.transport.responses();
    assert_eq!(responses.last().unwrap().1, 200);
    assert!(harness.index.lookup("sip:200@test.com").is_empty());
    assert_eq!(harness.registry.count_by_tenant("test.com"), 0);

    harness.stop().await;
}

#[tokio::test]
async fn test_unknown_event_package_is_refused() {
    let harness = Harness::start(|_| {});

    let event = SipEvent::incoming_subscribe(
        "call-x;ft=a",
        "sip:watcher@test.com",
        "sip:200@test.com",
        "presence",
        Some(3600),
        1,
        Some(harness.transport.handle(9)),
    );
    harness.dispatcher.dispatch(event).unwrap();

    assert!(wait_until(|| !harness.transport.responses().is_empty()).await);
    let responses = harness.transport.responses();
    assert_eq!(responses[0], (9, 489, "Bad Event".to_string()));

    // No record, no registry entry, handle released
    assert_eq!(harness.registry.total_count(), 0);
    assert!(wait_until(|| harness.transport.released.lock().unwrap().contains(&9)).await);

    harness.stop().await;
}

#[tokio::test]
async fn test_tenant_quota_yields_403() {
    let harness = Harness::start(|config| {
        config.tenant.max_subscriptions_per_tenant = 1;
    });

    harness
        .dispatcher
        .dispatch(harness.subscribe("call-1;ft=a", "sip:200@test.com", 3600, 1))
        .unwrap();
    assert!(wait_until(|| harness.registry.count_by_tenant("test.com") == 1).await);

    harness
        .dispatcher
        .dispatch(harness.subscribe("call-2;ft=b", "sip:201@test.com", 3600, 2))
        .unwrap();
    assert!(wait_until(|| {
        harness.transport.responses().iter().any(|(id, status, _)| *id == 2 && *status == 403)
    })
    .await);
    assert_eq!(harness.registry.count_by_tenant("test.com"), 1);

    harness.stop().await;
}

#[tokio::test]
async fn test_worker_capacity_yields_503() {
    let harness = Harness::start(|config| {
        config.dispatcher.max_dialogs_per_worker = 1;
    });

    harness
        .dispatcher
        .dispatch(harness.subscribe("call-1;ft=a", "sip:200@test.com", 3600, 1))
        .unwrap();
    assert!(wait_until(|| harness.registry.total_count() == 1).await);

    harness
        .dispatcher
        .dispatch(harness.subscribe("call-2;ft=b", "sip:201@other.com", 3600, 2))
        .unwrap();
    assert!(wait_until(|| {
        harness.transport.responses().iter().any(|(id, status, _)| *id == 2 && *status == 503)
    })
    .await);

    harness.stop().await;
}

#[tokio::test]
async fn test_refresh_extends_without_renotifying() {
    let harness = Harness::start(|_| {});
    let dialog = "call-1;ft=a;tt=b";

    harness
        .dispatcher
        .dispatch(harness.subscribe(dialog, "sip:200@test.com", 60, 1))
        .unwrap();
    assert!(wait_until(|| harness.transport.notifies().len() == 1).await);

    // Refresh: another 200, but no second initial NOTIFY
    harness
        .dispatcher
        .dispatch(harness.subscribe(dialog, "sip:200@test.com", 3600, 2))
        .unwrap();
    assert!(wait_until(|| harness.transport.responses().len() == 2).await);
    settle().await;
    assert_eq!(harness.transport.notifies().len(), 1);

    // The displaced original handle was released
    assert!(harness.transport.released.lock().unwrap().contains(&1));

    harness.stop().await;
}

#[tokio::test]
async fn test_mwi_lifecycle_and_body_parse() {
    // Keep the write-behind flush out of the way so the terminal document
    // stays observable
    let harness = Harness::start(|config| {
        config.persistence.sync_interval_sec = 3600;
    });
    let dialog = "mwi-1;ft=a;tt=b";

    let subscribe = SipEvent::incoming_subscribe(
        dialog,
        "sip:user@test.com",
        "sip:user@test.com",
        "message-summary",
        Some(3600),
        1,
        Some(harness.transport.handle(1)),
    );
    harness.dispatcher.dispatch(subscribe).unwrap();
    assert!(wait_until(|| harness.transport.notifies().len() == 1).await);

    let initial = harness.transport.notifies()[0].clone();
    assert_eq!(initial.event_type, "message-summary");
    assert!(initial.body.contains("Messages-Waiting: no"));

    // Voicemail server reports counts within the dialog
    let notify = SipEvent::incoming_body(
        SipEventCategory::Notify,
        dialog,
        "application/simple-message-summary",
        "Messages-Waiting: yes\r\nMessage-Account: sip:user@test.com\r\nVoice-Message: 3/7 (1/2)\r\n",
        "active",
    );
    harness.dispatcher.dispatch(notify).unwrap();

    // Unsubscribe persists the final record; counts must have been applied
    let unsubscribe = SipEvent::incoming_subscribe(
        dialog,
        "sip:user@test.com",
        "sip:user@test.com",
        "message-summary",
        Some(0),
        2,
        Some(harness.transport.handle(2)),
    );
    harness.dispatcher.dispatch(unsubscribe).unwrap();
    assert!(wait_until(|| {
        harness
            .transport
            .notifies()
            .iter()
            .any(|n| n.subscription_state == "terminated")
    })
    .await);

    let terminal = harness.transport.notifies();
    let terminal = terminal.last().unwrap();
    assert!(terminal.body.contains("Messages-Waiting: no"));

    let document = harness.backend_document(dialog).await;
    assert_eq!(document.mwi_new_messages, 3);
    assert_eq!(document.mwi_old_messages, 7);
    assert_eq!(document.mwi_account_uri, "sip:user@test.com");

    harness.stop().await;
}

#[tokio::test]
async fn test_notify_rejection_terminates_dialog() {
    let harness = Harness::start(|_| {});
    let dialog = "call-1;ft=a;tt=b";

    harness
        .dispatcher
        .dispatch(harness.subscribe(dialog, "sip:200@test.com", 3600, 1))
        .unwrap();
    assert!(wait_until(|| harness.index.lookup("sip:200@test.com").len() == 1).await);

    // The phone answered our NOTIFY with 481: the dialog no longer exists
    harness
        .dispatcher
        .dispatch(SipEvent::notify_response(dialog, 481))
        .unwrap();

    assert!(wait_until(|| harness.index.lookup("sip:200@test.com").is_empty()).await);
    assert_eq!(harness.registry.count_by_tenant("test.com"), 0);

    harness.stop().await;
}

#[tokio::test]
async fn test_incoming_queue_backpressure() {
    let harness = Harness::start(|config| {
        config.dispatcher.max_incoming_queue_per_worker = 4;
    });
    // Park the worker pool by never starting it: use a second dispatcher
    // whose workers are created but not spawned
    let idle = sip_event_core::dispatch::DialogDispatcher::new(
        &{
            let mut config = sip_event_core::config::Config::default();
            config.dispatcher.num_workers = 1;
            config.dispatcher.max_incoming_queue_per_worker = 4;
            config
        },
        harness.registry.clone(),
        harness.index.clone(),
        harness.store.clone(),
        harness.slow.clone(),
    );

    let worker = idle.worker(0);
    for i in 0..4 {
        let event = harness.subscribe(&format!("call-{i};ft=a"), "sip:200@test.com", 60, i);
        worker.enqueue(event).unwrap();
    }
    let overflow = harness.subscribe("call-full;ft=a", "sip:200@test.com", 60, 99);
    assert!(matches!(
        worker.enqueue(overflow),
        Err(Error::CapacityExceeded { .. })
    ));
    assert_eq!(
        worker
            .stats()
            .events_dropped
            .load(std::sync::atomic::Ordering::Relaxed),
        1
    );

    harness.stop().await;
}

fn presence_trigger(dialog: &str, state: &str, call_id: &str) -> SipEvent {
    SipEvent::presence_trigger(
        dialog,
        "test.com",
        call_id,
        "sip:100@test.com",
        "sip:200@test.com",
        state,
        "inbound",
    )
}

impl Harness {
    /// Fetch the persisted document for a dialog, waiting for writes
    async fn backend_document(&self, dialog_id: &str) -> sip_event_core::store::SubscriptionDocument {
        use sip_event_core::store::DocumentStore;
        for _ in 0..200 {
            if let Some(document) = self.backend.find_one(dialog_id).await.unwrap() {
                if document.mwi_new_messages > 0 || document.lifecycle == "Terminated" {
                    return document;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("document for {dialog_id} never persisted");
    }
}
