//! SIP transport contract
//!
//! The SIP wire stack lives outside this crate. It delivers categorized
//! events ([`crate::events::SipEvent`]) and exposes two outgoing
//! operations: responding to an in-dialog request and sending a NOTIFY.
//! Handles are opaque, reference-counted identifiers owned by the core
//! once accepted; [`SipHandle`] is a move-only wrapper whose drop releases
//! the reference exactly once.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tracing::debug;

/// Operations the core needs from the embedding SIP stack
pub trait SipTransport: Send + Sync {
    /// Respond to an incoming in-dialog request. The stack encodes the
    /// subscription substate as `active` for 2xx and `terminated` otherwise.
    fn respond(&self, handle: &SipHandle, status: u16, phrase: &str, expires: Option<u32>);

    /// Send a NOTIFY within the dialog the handle belongs to.
    /// `event_type` is `"dialog"` for BLF and `"message-summary"` for MWI.
    fn send_notify(
        &self,
        handle: &SipHandle,
        event_type: &str,
        content_type: &str,
        body: &str,
        subscription_state: &str,
    );

    /// Release one reference on a handle. Called by [`SipHandle::drop`].
    fn release(&self, handle_id: u64);

    /// Whether the stack's event loop is up (drives the /health endpoint)
    fn is_running(&self) -> bool;
}

/// Move-only wrapper around a transport handle reference.
///
/// The callback side acquires a reference when the event is accepted and
/// hands it to the owning worker inside the event; dropping the wrapper
/// releases it, so there is exactly one release per acquisition no matter
/// which path the event takes.
pub struct SipHandle {
    id: u64,
    transport: Arc<dyn SipTransport>,
}

impl SipHandle {
    pub fn new(id: u64, transport: Arc<dyn SipTransport>) -> Self {
        Self { id, transport }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn respond(&self, status: u16, phrase: &str, expires: Option<u32>) {
        self.transport.respond(self, status, phrase, expires);
    }

    pub fn send_notify(
        &self,
        event_type: &str,
        content_type: &str,
        body: &str,
        subscription_state: &str,
    ) {
        self.transport
            .send_notify(self, event_type, content_type, body, subscription_state);
    }
}

impl Drop for SipHandle {
    fn drop(&mut self) {
        self.transport.release(self.id);
    }
}

impl fmt::Debug for SipHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SipHandle").field("id", &self.id).finish()
    }
}

/// Counters kept by [`LoggingTransport`]
#[derive(Debug, Default)]
pub struct TransportStats {
    pub responses_sent: AtomicU64,
    pub notifies_sent: AtomicU64,
    pub handles_released: AtomicU64,
}

/// Transport used when no real SIP stack is wired in (standalone runs).
/// Outgoing messages are logged and counted instead of being sent.
#[derive(Debug, Default)]
pub struct LoggingTransport {
    running: AtomicBool,
    stats: TransportStats,
}

impl LoggingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    pub fn stats(&self) -> &TransportStats {
        &self.stats
    }
}

impl SipTransport for LoggingTransport {
    fn respond(&self, handle: &SipHandle, status: u16, phrase: &str, _expires: Option<u32>) {
        self.stats.responses_sent.fetch_add(1, Ordering::Relaxed);
        debug!(handle = handle.id(), status, phrase, "sip response");
    }

    fn send_notify(
        &self,
        handle: &SipHandle,
        event_type: &str,
        _content_type: &str,
        body: &str,
        subscription_state: &str,
    ) {
        self.stats.notifies_sent.fetch_add(1, Ordering::Relaxed);
        debug!(
            handle = handle.id(),
            event_type,
            subscription_state,
            body_len = body.len(),
            "sip notify"
        );
    }

    fn release(&self, handle_id: u64) {
        self.stats.handles_released.fetch_add(1, Ordering::Relaxed);
        debug!(handle = handle_id, "sip handle released");
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_released_once_on_drop() {
        let transport = LoggingTransport::new();
        {
            let _handle = SipHandle::new(7, transport.clone());
        }
        assert_eq!(transport.stats().handles_released.load(Ordering::Relaxed), 1);
    }
}
