//! Shared helpers for integration tests

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sip_event_core::config::Config;
use sip_event_core::dispatch::DialogDispatcher;
use sip_event_core::events::SipEvent;
use sip_event_core::store::{MemoryDocumentStore, SubscriptionStore};
use sip_event_core::subscription::{SubscriptionRegistry, WatcherIndex};
use sip_event_core::telemetry::SlowEventLogger;
use sip_event_core::transport::{SipHandle, SipTransport};

/// One outgoing NOTIFY as seen by the transport
#[derive(Debug, Clone)]
pub struct NotifyRecord {
    pub handle_id: u64,
    pub event_type: String,
    pub content_type: String,
    pub body: String,
    pub subscription_state: String,
}

/// Transport double that records everything the core sends
#[derive(Default)]
pub struct RecordingTransport {
    running: AtomicBool,
    pub responses: Mutex<Vec<(u64, u16, String)>>,
    pub notifies: Mutex<Vec<NotifyRecord>>,
    pub released: Mutex<Vec<u64>>,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        let transport = Arc::new(Self::default());
        transport.running.store(true, Ordering::Release);
        transport
    }

    pub fn handle(self: &Arc<Self>, id: u64) -> SipHandle {
        SipHandle::new(id, self.clone())
    }

    pub fn responses(&self) -> Vec<(u64, u16, String)> {
        self.responses.lock().unwrap().clone()
    }

    pub fn notifies(&self) -> Vec<NotifyRecord> {
        self.notifies.lock().unwrap().clone()
    }
}

impl SipTransport for RecordingTransport {
    fn respond(&self, handle: &SipHandle, status: u16, phrase: &str, _expires: Option<u32>) {
        self.responses
            .lock()
            .unwrap()
            .push((handle.id(), status, phrase.to_string()));
    }

    fn send_notify(
        &self,
        handle: &SipHandle,
        event_type: &str,
        content_type: &str,
        body: &str,
        subscription_state: &str,
    ) {
        self.notifies.lock().unwrap().push(NotifyRecord {
            handle_id: handle.id(),
            event_type: event_type.to_string(),
            content_type: content_type.to_string(),
            body: body.to_string(),
            subscription_state: subscription_state.to_string(),
        });
    }

    fn release(&self, handle_id: u64) {
        self.released.lock().unwrap().push(handle_id);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// Everything a pipeline test needs, wired like the binary does it
pub struct Harness {
    pub registry: Arc<SubscriptionRegistry>,
    pub index: Arc<WatcherIndex>,
    pub backend: Arc<MemoryDocumentStore>,
    pub store: Arc<SubscriptionStore>,
    pub dispatcher: Arc<DialogDispatcher>,
    pub transport: Arc<RecordingTransport>,
    pub slow: Arc<SlowEventLogger>,
}

impl Harness {
    pub fn start(mutate: impl FnOnce(&mut Config)) -> Self {
        let mut config = Config::default();
        config.dispatcher.num_workers = 1;
        mutate(&mut config);

        let registry = Arc::new(SubscriptionRegistry::new());
        let index = Arc::new(WatcherIndex::new());
        let backend = Arc::new(MemoryDocumentStore::new());
        let store = SubscriptionStore::new(&config.persistence, "svc-test", backend.clone());
        store.start();
        let slow = Arc::new(SlowEventLogger::new(&config.slow_event));

        let dispatcher = Arc::new(DialogDispatcher::new(
            &config,
            registry.clone(),
            index.clone(),
            store.clone(),
            slow.clone(),
        ));
        dispatcher.start();

        Self {
            registry,
            index,
            backend,
            store,
            dispatcher,
            transport: RecordingTransport::new(),
            slow,
        }
    }

    pub async fn stop(&self) {
        self.dispatcher.stop().await;
        self.store.stop().await;
    }

    /// An incoming BLF SUBSCRIBE carrying a fresh transport handle
    pub fn subscribe(&self, dialog_id: &str, to_uri: &str, expires: u32, handle_id: u64) -> SipEvent {
        SipEvent::incoming_subscribe(
            dialog_id,
            "sip:watcher@test.com",
            to_uri,
            "dialog",
            Some(expires),
            1,
            Some(self.transport.handle(handle_id)),
        )
    }
}

/// Poll until the condition holds or the deadline passes
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Give in-flight work a moment, then return; for asserting that
/// something did NOT happen
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(250)).await;
}
