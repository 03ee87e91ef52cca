//! Event types flowing through the dispatcher
//!
//! Two event families share one queue type: categorized SIP events handed
//! over by the transport callback, and synthetic presence triggers built by
//! the presence router. Both carry the dialog id that selects the owning
//! worker.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::subscription::types::SubscriptionType;
use crate::transport::SipHandle;

/// Monotonic event id, for log correlation only
pub type EventId = u64;

static EVENT_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_event_id() -> EventId {
    EVENT_ID_COUNTER.fetch_add(1, Ordering::Relaxed) + 1
}

/// Whether the event describes a request we received or a response to
/// something we sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SipDirection {
    Incoming,
    Outgoing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SipEventCategory {
    Subscribe,
    Notify,
    Publish,
    PresenceTrigger,
    Unknown,
}

impl SipEventCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            SipEventCategory::Subscribe => "SUBSCRIBE",
            SipEventCategory::Notify => "NOTIFY",
            SipEventCategory::Publish => "PUBLISH",
            SipEventCategory::PresenceTrigger => "PRESENCE_TRIGGER",
            SipEventCategory::Unknown => "UNKNOWN",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SipEventSource {
    SipStack,
    PresenceFeed,
}

/// One unit of work for a dialog worker
#[derive(Debug)]
pub struct SipEvent {
    pub id: EventId,
    pub dialog_id: String,
    pub tenant_id: String,

    pub direction: SipDirection,
    pub category: SipEventCategory,
    pub sub_type: SubscriptionType,
    pub source: SipEventSource,

    /// Response status when this is a response event, 0 otherwise
    pub status: u16,

    pub call_id: String,
    pub from_uri: String,
    pub from_tag: String,
    pub to_uri: String,
    pub to_tag: String,
    pub contact_uri: String,
    pub event_header: String,
    pub content_type: String,
    pub body: String,
    pub cseq: u32,
    /// `None` when the request carried no Expires header
    pub expires: Option<u32>,
    pub subscription_state: String,

    // Presence feed fields, set only on presence triggers
    pub presence_call_id: String,
    pub presence_caller_uri: String,
    pub presence_callee_uri: String,
    pub presence_state: String,
    pub presence_direction: String,

    pub created_at: Instant,
    pub enqueued_at: Option<Instant>,

    /// Transport handle, owned by this event until the worker takes it
    pub handle: Option<SipHandle>,
}

impl SipEvent {
    /// Blank event skeleton; constructors below fill in the interesting parts
    fn blank(category: SipEventCategory, dialog_id: impl Into<String>) -> Self {
        Self {
            id: next_event_id(),
            dialog_id: dialog_id.into(),
            tenant_id: String::new(),
            direction: SipDirection::Incoming,
            category,
            sub_type: SubscriptionType::Unknown,
            source: SipEventSource::SipStack,
            status: 0,
            call_id: String::new(),
            from_uri: String::new(),
            from_tag: String::new(),
            to_uri: String::new(),
            to_tag: String::new(),
            contact_uri: String::new(),
            event_header: String::new(),
            content_type: String::new(),
            body: String::new(),
            cseq: 0,
            expires: None,
            subscription_state: String::new(),
            presence_call_id: String::new(),
            presence_caller_uri: String::new(),
            presence_callee_uri: String::new(),
            presence_state: String::new(),
            presence_direction: String::new(),
            created_at: Instant::now(),
            enqueued_at: None,
            handle: None,
        }
    }

    /// An incoming SUBSCRIBE as delivered by the transport callback
    #[allow(clippy::too_many_arguments)]
    pub fn incoming_subscribe(
        dialog_id: impl Into<String>,
        from_uri: impl Into<String>,
        to_uri: impl Into<String>,
        event_header: &str,
        expires: Option<u32>,
        cseq: u32,
        handle: Option<SipHandle>,
    ) -> Self {
        let to_uri = to_uri.into();
        let mut event = Self::blank(SipEventCategory::Subscribe, dialog_id);
        event.sub_type = SubscriptionType::parse_event_header(event_header);
        event.event_header = event_header.to_string();
        event.from_uri = from_uri.into();
        event.tenant_id = tenant_from_uris(&to_uri, &event.from_uri);
        event.to_uri = to_uri;
        event.expires = expires;
        event.cseq = cseq;
        event.handle = handle;
        event
    }

    /// An incoming NOTIFY or PUBLISH carrying a state body
    pub fn incoming_body(
        category: SipEventCategory,
        dialog_id: impl Into<String>,
        content_type: impl Into<String>,
        body: impl Into<String>,
        subscription_state: impl Into<String>,
    ) -> Self {
        let mut event = Self::blank(category, dialog_id);
        event.content_type = content_type.into();
        event.body = truncate_body(body.into());
        event.subscription_state = subscription_state.into();
        event
    }

    /// The transport's report of a response to a NOTIFY we sent
    pub fn notify_response(dialog_id: impl Into<String>, status: u16) -> Self {
        let mut event = Self::blank(SipEventCategory::Notify, dialog_id);
        event.direction = SipDirection::Outgoing;
        event.status = status;
        event
    }

    /// Synthetic event the presence router targets at one watcher dialog.
    /// Carries only the presence fields; the owning worker renders the
    /// dialog-info body so the NOTIFY version has a single source.
    pub fn presence_trigger(
        dialog_id: impl Into<String>,
        tenant_id: impl Into<String>,
        presence_call_id: impl Into<String>,
        caller_uri: impl Into<String>,
        callee_uri: impl Into<String>,
        blf_state: impl Into<String>,
        direction: impl Into<String>,
    ) -> Self {
        let mut event = Self::blank(SipEventCategory::PresenceTrigger, dialog_id);
        event.tenant_id = tenant_id.into();
        event.source = SipEventSource::PresenceFeed;
        event.sub_type = SubscriptionType::Blf;
        event.presence_call_id = presence_call_id.into();
        event.presence_caller_uri = caller_uri.into();
        event.presence_callee_uri = callee_uri.into();
        event.presence_state = blf_state.into();
        event.presence_direction = direction.into();
        event.content_type = "application/dialog-info+xml".to_string();
        event
    }

    /// A SUBSCRIBE that ends the dialog (Expires: 0 or terminated substate)
    pub fn is_unsubscribe(&self) -> bool {
        self.expires == Some(0) || self.subscription_state == "terminated"
    }
}

const MAX_BODY_BYTES: usize = 65_536;

fn truncate_body(body: String) -> String {
    if body.len() <= MAX_BODY_BYTES {
        return body;
    }
    tracing::warn!(len = body.len(), "sip body too large, truncating");
    let mut end = MAX_BODY_BYTES;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    let mut body = body;
    body.truncate(end);
    body
}

/// Call state as reported by the presence feed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Unknown,
    Trying,
    Ringing,
    Confirmed,
    Terminated,
    Held,
    Resumed,
}

impl CallState {
    /// Parse the feed's `<State>` text, accepting the aliases upstream
    /// sources are known to emit
    pub fn parse(state: &str) -> Self {
        match state.to_ascii_lowercase().as_str() {
            "trying" | "setup" => CallState::Trying,
            "ringing" | "early" | "alerting" => CallState::Ringing,
            "confirmed" | "connected" | "active" => CallState::Confirmed,
            "terminated" | "disconnected" | "released" | "idle" => CallState::Terminated,
            "held" | "hold" => CallState::Held,
            "resumed" => CallState::Resumed,
            _ => CallState::Unknown,
        }
    }

    /// RFC 4235 dialog state the phones expect. Held and Resumed are
    /// still `confirmed` from the watcher's point of view.
    pub fn as_blf_state(&self) -> &'static str {
        match self {
            CallState::Trying => "trying",
            CallState::Ringing => "early",
            CallState::Confirmed | CallState::Held | CallState::Resumed => "confirmed",
            CallState::Terminated => "terminated",
            CallState::Unknown => "unknown",
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_blf_state())
    }
}

/// One parsed frame from the presence feed. Built by the frame scanner,
/// consumed by the router, discarded after dispatch.
#[derive(Debug, Clone)]
pub struct CallStateEvent {
    pub id: EventId,
    pub presence_call_id: String,
    pub caller_uri: String,
    pub callee_uri: String,
    pub state: CallState,
    pub direction: String,
    pub tenant_id: String,
    pub timestamp: String,
    pub received_at: Instant,
}

impl CallStateEvent {
    pub fn new() -> Self {
        Self {
            id: next_event_id(),
            presence_call_id: String::new(),
            caller_uri: String::new(),
            callee_uri: String::new(),
            state: CallState::Unknown,
            direction: String::new(),
            tenant_id: String::new(),
            timestamp: String::new(),
            received_at: Instant::now(),
        }
    }

    /// A frame is usable iff it names a call, at least one party, and a
    /// state we recognize
    pub fn is_valid(&self) -> bool {
        !self.presence_call_id.is_empty()
            && (!self.callee_uri.is_empty() || !self.caller_uri.is_empty())
            && self.state != CallState::Unknown
    }
}

impl Default for CallStateEvent {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for the stable dialog key: sanitized Call-ID with tag suffixes
pub struct DialogId;

impl DialogId {
    pub const MAX_LEN: usize = 1024;

    /// `call-id[;ft=from-tag][;tt=to-tag]`, all parts sanitized
    pub fn build(call_id: &str, from_tag: &str, to_tag: &str) -> String {
        let call_id = Self::sanitize(call_id);
        if call_id.is_empty() {
            return String::new();
        }
        let mut id = call_id;
        let from_tag = Self::sanitize(from_tag);
        if !from_tag.is_empty() {
            id.push_str(";ft=");
            id.push_str(&from_tag);
        }
        let to_tag = Self::sanitize(to_tag);
        if !to_tag.is_empty() {
            id.push_str(";tt=");
            id.push_str(&to_tag);
        }
        id
    }

    pub fn is_valid(dialog_id: &str) -> bool {
        !dialog_id.is_empty() && dialog_id.len() <= Self::MAX_LEN
    }

    /// Keep printable ASCII except `;` (the suffix separator)
    pub fn sanitize(input: &str) -> String {
        input
            .chars()
            .take(Self::MAX_LEN)
            .filter(|&c| ('\u{20}'..='\u{7e}').contains(&c) && c != ';')
            .collect()
    }
}

/// Tenant is the host part of the To URI, falling back to From
pub fn tenant_from_uris(to_uri: &str, from_uri: &str) -> String {
    host_of(to_uri)
        .or_else(|| host_of(from_uri))
        .unwrap_or("unknown")
        .to_string()
}

fn host_of(uri: &str) -> Option<&str> {
    let after_at = uri.split('@').nth(1)?;
    let host = after_at
        .split(|c| c == ':' || c == ';' || c == '>')
        .next()
        .unwrap_or(after_at);
    if host.is_empty() {
        None
    } else {
        Some(host)
    }
}
