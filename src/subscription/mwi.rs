//! Message Waiting Indication processing (simple-message-summary package)

use tracing::{debug, info};

use crate::errors::{Error, Result};
use crate::events::{SipDirection, SipEvent, SipEventCategory};
use crate::subscription::types::{SubLifecycle, SubscriptionRecord};

/// Fields parsed from an `application/simple-message-summary` body
#[derive(Debug, Default, PartialEq, Eq)]
pub struct MessageSummary {
    pub messages_waiting: bool,
    pub account: String,
    pub new_messages: i32,
    pub old_messages: i32,
    pub new_urgent: i32,
    pub old_urgent: i32,
    pub valid: bool,
}

#[derive(Debug, Default)]
pub struct MwiProcessor;

impl MwiProcessor {
    pub fn new() -> Self {
        Self
    }

    pub fn process(&self, event: &SipEvent, record: &mut SubscriptionRecord) -> Result<()> {
        match event.category {
            SipEventCategory::Subscribe => {
                if event.direction == SipDirection::Incoming {
                    self.handle_subscribe(event, record)
                } else {
                    self.handle_subscribe_response(event, record)
                }
            }
            SipEventCategory::Notify => self.handle_notify(event, record),
            SipEventCategory::Publish => self.handle_publish(event, record),
            _ => Err(Error::invalid_argument("unexpected event category for MWI")),
        }
    }

    /// NOTIFY body for this subscription's current counts
    pub fn build_message_summary(&self, record: &SubscriptionRecord) -> String {
        let waiting = if record.mwi_new_messages > 0 { "yes" } else { "no" };
        let mut body = format!("Messages-Waiting: {waiting}\r\n");
        if !record.mwi_account_uri.is_empty() {
            body.push_str(&format!("Message-Account: {}\r\n", record.mwi_account_uri));
        }
        body.push_str(&format!(
            "Voice-Message: {}/{} (0/0)\r\n",
            record.mwi_new_messages, record.mwi_old_messages
        ));
        body
    }

    /// Final NOTIFY body when the subscription ends
    pub fn build_termination_body(&self) -> String {
        "Messages-Waiting: no\r\n".to_string()
    }

    fn handle_subscribe(&self, event: &SipEvent, record: &mut SubscriptionRecord) -> Result<()> {
        debug!(
            dialog = %record.dialog_id,
            from = %event.from_uri,
            expires = ?event.expires,
            "mwi subscribe"
        );

        if !event.to_uri.is_empty() {
            record.mwi_account_uri = event.to_uri.clone();
        }

        if event.expires == Some(0) {
            record.lifecycle = SubLifecycle::Terminating;
            return Ok(());
        }

        if let Some(expires) = event.expires {
            record.extend_expiry(expires);
        }
        if event.cseq > 0 {
            record.cseq = event.cseq;
        }
        if record.lifecycle == SubLifecycle::Pending {
            record.lifecycle = SubLifecycle::Active;
        }
        record.dirty = true;
        Ok(())
    }

    fn handle_subscribe_response(
        &self,
        event: &SipEvent,
        record: &mut SubscriptionRecord,
    ) -> Result<()> {
        if (200..300).contains(&event.status) {
            if record.lifecycle == SubLifecycle::Pending {
                record.lifecycle = SubLifecycle::Active;
            }
            if let Some(expires) = event.expires.filter(|&e| e > 0) {
                record.extend_expiry(expires);
            }
        } else if event.status == 481 || event.status == 489 || event.status == 403 {
            record.lifecycle = SubLifecycle::Terminated;
        }
        Ok(())
    }

    fn handle_notify(&self, event: &SipEvent, record: &mut SubscriptionRecord) -> Result<()> {
        if !event.body.is_empty() {
            let summary = parse_message_summary(&event.body);
            if summary.valid {
                self.update_state(record, &summary);
            }
        }

        if event.subscription_state == "terminated" {
            record.lifecycle = SubLifecycle::Terminated;
        }
        Ok(())
    }

    fn handle_publish(&self, event: &SipEvent, record: &mut SubscriptionRecord) -> Result<()> {
        if !event.body.is_empty() {
            let summary = parse_message_summary(&event.body);
            if summary.valid {
                self.update_state(record, &summary);
            }
        }
        Ok(())
    }

    fn update_state(&self, record: &mut SubscriptionRecord, summary: &MessageSummary) {
        let previous_new = record.mwi_new_messages;
        let previous_old = record.mwi_old_messages;
        record.mwi_new_messages = summary.new_messages;
        record.mwi_old_messages = summary.old_messages;
        if !summary.account.is_empty() {
            record.mwi_account_uri = summary.account.clone();
        }

        if previous_new != summary.new_messages || previous_old != summary.old_messages {
            info!(
                dialog = %record.dialog_id,
                account = %record.mwi_account_uri,
                new = format!("{previous_new}->{}", summary.new_messages),
                old = format!("{previous_old}->{}", summary.old_messages),
                "mwi change"
            );
            record.dirty = true;
        }
    }
}

/// Parse a simple-message-summary body: case-insensitive header names,
/// LWSP trimmed, `Voice-Message` counts with or without the parenthesized
/// urgent pair.
pub fn parse_message_summary(body: &str) -> MessageSummary {
    let mut summary = MessageSummary::default();

    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();

        match name.trim().to_ascii_lowercase().as_str() {
            "messages-waiting" => {
                summary.messages_waiting = value.eq_ignore_ascii_case("yes");
                summary.valid = true;
            }
            "message-account" => {
                summary.account = value.to_string();
            }
            "voice-message" => {
                if let Some((new_messages, old_messages, new_urgent, old_urgent)) =
                    parse_voice_message(value)
                {
                    summary.new_messages = new_messages;
                    summary.old_messages = old_messages;
                    summary.new_urgent = new_urgent;
                    summary.old_urgent = old_urgent;
                    summary.valid = true;
                }
            }
            _ => {}
        }
    }
    summary
}

/// `<new>/<old>` optionally followed by ` (<new_urgent>/<old_urgent>)`
fn parse_voice_message(value: &str) -> Option<(i32, i32, i32, i32)> {
    let mut parts = value.split_whitespace();
    let counts = parts.next()?;
    let (new_messages, old_messages) = split_pair(counts)?;

    let (new_urgent, old_urgent) = match parts.next() {
        Some(urgent) => {
            let urgent = urgent.strip_prefix('(')?.strip_suffix(')')?;
            split_pair(urgent)?
        }
        None => (0, 0),
    };
    Some((new_messages, old_messages, new_urgent, old_urgent))
}

fn split_pair(s: &str) -> Option<(i32, i32)> {
    let (a, b) = s.split_once('/')?;
    Some((a.trim().parse().ok()?, b.trim().parse().ok()?))
}
