//! Subscription record and its enumerations

use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

/// The event package a dialog subscribed to; immutable once set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionType {
    Unknown,
    Blf,
    Mwi,
}

impl SubscriptionType {
    /// Classify a SIP Event header value
    pub fn parse_event_header(event_header: &str) -> Self {
        if event_header.contains("dialog") {
            SubscriptionType::Blf
        } else if event_header.contains("message-summary") {
            SubscriptionType::Mwi
        } else {
            SubscriptionType::Unknown
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionType::Blf => "BLF",
            SubscriptionType::Mwi => "MWI",
            SubscriptionType::Unknown => "Unknown",
        }
    }

    pub fn from_str_loose(s: &str) -> Self {
        match s {
            "BLF" => SubscriptionType::Blf,
            "MWI" => SubscriptionType::Mwi,
            _ => SubscriptionType::Unknown,
        }
    }

    /// Value for the SIP Event header on outgoing NOTIFYs
    pub fn notify_event_type(&self) -> &'static str {
        match self {
            SubscriptionType::Blf => "dialog",
            SubscriptionType::Mwi => "message-summary",
            SubscriptionType::Unknown => "dialog",
        }
    }
}

impl fmt::Display for SubscriptionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dialog lifecycle. Monotonic except Pending -> Terminated, which is legal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubLifecycle {
    Pending,
    Active,
    Terminating,
    Terminated,
}

impl SubLifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubLifecycle::Pending => "Pending",
            SubLifecycle::Active => "Active",
            SubLifecycle::Terminating => "Terminating",
            SubLifecycle::Terminated => "Terminated",
        }
    }

    pub fn from_str_loose(s: &str) -> Self {
        match s {
            "Active" => SubLifecycle::Active,
            "Terminating" => SubLifecycle::Terminating,
            "Terminated" => SubLifecycle::Terminated,
            _ => SubLifecycle::Pending,
        }
    }
}

impl fmt::Display for SubLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The dialog's persistent state. Mutated only by the owning worker; every
/// other component sees copies.
#[derive(Debug, Clone)]
pub struct SubscriptionRecord {
    pub dialog_id: String,
    pub tenant_id: String,
    pub kind: SubscriptionType,
    pub lifecycle: SubLifecycle,

    pub created_at: Instant,
    pub last_activity: Instant,
    /// Wall-clock expiry so it survives persistence round trips
    pub expires_at: Option<DateTime<Utc>>,
    pub processing_started_at: Option<Instant>,
    pub is_processing: bool,
    /// Needs an async (batched) persistence write
    pub dirty: bool,

    pub cseq: u32,
    pub notify_version: u32,
    pub events_processed: u64,

    // Dialog re-creation tuple
    pub call_id: String,
    pub from_uri: String,
    pub from_tag: String,
    pub to_uri: String,
    pub to_tag: String,
    pub contact_uri: String,

    // BLF state
    pub blf_monitored_uri: String,
    pub blf_last_state: String,
    pub blf_last_direction: String,
    pub blf_presence_call_id: String,
    /// Verbatim last NOTIFY payload, reused for full-state NOTIFY after failover
    pub blf_last_notify_body: String,

    // MWI state
    pub mwi_new_messages: i32,
    pub mwi_old_messages: i32,
    pub mwi_account_uri: String,
    pub mwi_last_notify_body: String,
}

impl SubscriptionRecord {
    pub fn new(
        dialog_id: impl Into<String>,
        tenant_id: impl Into<String>,
        kind: SubscriptionType,
    ) -> Self {
        let now = Instant::now();
        Self {
            dialog_id: dialog_id.into(),
            tenant_id: tenant_id.into(),
            kind,
            lifecycle: SubLifecycle::Pending,
            created_at: now,
            last_activity: now,
            expires_at: None,
            processing_started_at: None,
            is_processing: false,
            dirty: false,
            cseq: 0,
            notify_version: 0,
            events_processed: 0,
            call_id: String::new(),
            from_uri: String::new(),
            from_tag: String::new(),
            to_uri: String::new(),
            to_tag: String::new(),
            contact_uri: String::new(),
            blf_monitored_uri: String::new(),
            blf_last_state: String::new(),
            blf_last_direction: String::new(),
            blf_presence_call_id: String::new(),
            blf_last_notify_body: String::new(),
            mwi_new_messages: 0,
            mwi_old_messages: 0,
            mwi_account_uri: String::new(),
            mwi_last_notify_body: String::new(),
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Extend the expiry window by `expires` seconds from now
    pub fn extend_expiry(&mut self, expires: u32) {
        self.expires_at = Some(Utc::now() + chrono::Duration::seconds(i64::from(expires)));
    }

    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(at) => Utc::now() > at,
            None => false,
        }
    }

    pub fn is_stuck(&self, timeout: Duration) -> bool {
        if !self.is_processing {
            return false;
        }
        match self.processing_started_at {
            Some(started) => started.elapsed() > timeout,
            None => false,
        }
    }

    /// Single bump site for the outgoing NOTIFY version. Returns the value
    /// to embed in the body being emitted; strictly increasing per dialog.
    pub fn next_notify_version(&mut self) -> u32 {
        let version = self.notify_version;
        self.notify_version += 1;
        version
    }
}
