//! Busy Lamp Field processing (RFC 4235 dialog-info package)
//!
//! Pure state transformer over `(event, record)`. The worker owns the
//! record and the transport; this module only decides what changed and
//! renders the dialog-info+xml payloads.

use std::io::Cursor;

use quick_xml::events::{BytesDecl, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use tracing::{debug, info, trace, warn};

use crate::errors::{Error, Result};
use crate::events::{SipDirection, SipEvent, SipEventCategory};
use crate::subscription::types::{SubLifecycle, SubscriptionRecord};

/// What the worker should send after a presence trigger
#[derive(Debug)]
pub struct NotifyAction {
    pub body: String,
    pub content_type: &'static str,
    pub subscription_state: &'static str,
}

/// Fields extracted from an incoming dialog-info+xml body
#[derive(Debug, Default)]
pub struct DialogInfoState {
    pub entity: String,
    pub id: String,
    pub direction: String,
    pub state: String,
    pub valid: bool,
}

#[derive(Debug, Default)]
pub struct BlfProcessor;

impl BlfProcessor {
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
            SipEventCategory::PresenceTrigger => {
                warn!("presence trigger reached BlfProcessor::process");
                Err(Error::invalid_argument("presence trigger must use process_presence_trigger"))
            }
            SipEventCategory::Unknown => Err(Error::invalid_argument("unknown event category")),
        }
    }

    /// Apply a presence-feed trigger. Returns the NOTIFY to emit, or None
    /// when the subscription is not active or nothing changed.
    pub fn process_presence_trigger(
        &self,
        event: &SipEvent,
        record: &mut SubscriptionRecord,
    ) -> Option<NotifyAction> {
        if record.lifecycle != SubLifecycle::Active {
            debug!(
                dialog = %record.dialog_id,
                lifecycle = %record.lifecycle,
                "skipping presence trigger for non-active subscription"
            );
            return None;
        }

        let changed = record.blf_last_state != event.presence_state
            || record.blf_presence_call_id != event.presence_call_id;
        if !changed && !record.blf_last_state.is_empty() {
            trace!(dialog = %record.dialog_id, state = %record.blf_last_state, "no state change");
            return None;
        }

        let previous = std::mem::replace(&mut record.blf_last_state, event.presence_state.clone());
        record.blf_last_direction = event.presence_direction.clone();
        record.blf_presence_call_id = event.presence_call_id.clone();
        record.touch();
        record.dirty = true;

        info!(
            dialog = %record.dialog_id,
            monitored = %record.blf_monitored_uri,
            from = %if previous.is_empty() { "(none)" } else { &previous },
            to = %event.presence_state,
            call = %event.presence_call_id,
            "blf state change"
        );

        let version = record.next_notify_version();
        let body = match build_dialog_info_xml(
            version,
            &record.blf_monitored_uri,
            &event.presence_call_id,
            &event.presence_state,
            &event.presence_direction,
            &event.presence_caller_uri,
            &event.presence_callee_uri,
        ) {
            Ok(body) => body,
            Err(e) => {
                warn!(dialog = %record.dialog_id, error = %e, "dialog-info build failed");
                return None;
            }
        };
        record.blf_last_notify_body = body.clone();

        Some(NotifyAction {
            body,
            content_type: "application/dialog-info+xml",
            subscription_state: "active",
        })
    }

    /// Full-state body for the initial NOTIFY: the current dialog state
    /// when one is known, otherwise just the empty envelope. Bumps the
    /// record's NOTIFY version.
    pub fn build_full_state_body(&self, record: &mut SubscriptionRecord) -> Result<String> {
        let version = record.next_notify_version();
        if record.blf_last_state.is_empty() {
            build_dialog_info_xml(version, &record.blf_monitored_uri, "", "terminated", "", "", "")
        } else {
            let state = record.blf_last_state.clone();
            let call_id = record.blf_presence_call_id.clone();
            let direction = record.blf_last_direction.clone();
            build_dialog_info_xml(
                version,
                &record.blf_monitored_uri,
                &call_id,
                &state,
                &direction,
                "",
                "",
            )
        }
    }

    /// Empty terminated body for the final NOTIFY. Bumps the version.
    pub fn build_termination_body(&self, record: &mut SubscriptionRecord) -> Result<String> {
        let version = record.next_notify_version();
        build_dialog_info_xml(version, &record.blf_monitored_uri, "", "terminated", "", "", "")
    }

    fn handle_subscribe(&self, event: &SipEvent, record: &mut SubscriptionRecord) -> Result<()> {
        debug!(
            dialog = %record.dialog_id,
            from = %event.from_uri,
            to = %event.to_uri,
            expires = ?event.expires,
            "blf subscribe"
        );

        if !event.to_uri.is_empty() {
            record.blf_monitored_uri = event.to_uri.clone();
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
        debug!(dialog = %record.dialog_id, status = event.status, "blf subscribe response");

        if (200..300).contains(&event.status) {
            if record.lifecycle == SubLifecycle::Pending {
                record.lifecycle = SubLifecycle::Active;
            }
            if let Some(expires) = event.expires.filter(|&e| e > 0) {
                record.extend_expiry(expires);
            }
        } else if event.status == 481 || event.status == 489 {
            record.lifecycle = SubLifecycle::Terminated;
        }
        Ok(())
    }

    fn handle_notify(&self, event: &SipEvent, record: &mut SubscriptionRecord) -> Result<()> {
        debug!(dialog = %record.dialog_id, body_len = event.body.len(), "blf notify");

        if !event.body.is_empty() {
            let state = parse_dialog_info(&event.body);
            if state.valid {
                self.update_state(record, &state);
            }
        }

        if event.subscription_state == "terminated" {
            record.lifecycle = SubLifecycle::Terminated;
        }
        Ok(())
    }

    fn handle_publish(&self, event: &SipEvent, record: &mut SubscriptionRecord) -> Result<()> {
        if !event.body.is_empty() {
            let state = parse_dialog_info(&event.body);
            if state.valid {
                self.update_state(record, &state);
            }
        }
        Ok(())
    }

    fn update_state(&self, record: &mut SubscriptionRecord, state: &DialogInfoState) {
        let previous = std::mem::replace(&mut record.blf_last_state, state.state.clone());
        if !state.entity.is_empty() {
            record.blf_monitored_uri = state.entity.clone();
        }
        if previous != state.state {
            info!(
                dialog = %record.dialog_id,
                monitored = %record.blf_monitored_uri,
                from = %if previous.is_empty() { "(none)" } else { &previous },
                to = %state.state,
                "blf state change from peer"
            );
            record.dirty = true;
        }
    }
}

/// Render an RFC 4235 dialog-info+xml document.
///
/// A terminated state with no known presence call leaves the envelope
/// empty. When both parties are known the `<local>`/`<remote>` identities
/// are emitted in direction-sensitive order: the caller is the remote
/// party for inbound calls and the local party otherwise.
pub fn build_dialog_info_xml(
    version: u32,
    entity: &str,
    call_id: &str,
    state: &str,
    direction: &str,
    caller_uri: &str,
    callee_uri: &str,
) -> Result<String> {
    let mut writer = Writer::new(Cursor::new(Vec::new()));

    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .map_err(xml_error)?;

    let mut root = BytesStart::new("dialog-info");
    root.push_attribute(("xmlns", "urn:ietf:params:xml:ns:dialog-info"));
    root.push_attribute(("version", version.to_string().as_str()));
    root.push_attribute(("state", "full"));
    root.push_attribute(("entity", entity));
    writer.write_event(Event::Start(root)).map_err(xml_error)?;

    if state != "terminated" || !call_id.is_empty() {
        let mut dialog = BytesStart::new("dialog");
        dialog.push_attribute(("id", call_id));
        if !call_id.is_empty() {
            dialog.push_attribute(("call-id", call_id));
        }
        if !direction.is_empty() {
            dialog.push_attribute(("direction", direction));
        }
        writer.write_event(Event::Start(dialog)).map_err(xml_error)?;

        writer
            .write_event(Event::Start(BytesStart::new("state")))
            .map_err(xml_error)?;
        writer
            .write_event(Event::Text(BytesText::new(state)))
            .map_err(xml_error)?;
        writer
            .write_event(Event::End(BytesStart::new("state").to_end()))
            .map_err(xml_error)?;

        if !caller_uri.is_empty() && !callee_uri.is_empty() {
            if direction == "inbound" || direction == "recipient" {
                write_identity(&mut writer, "remote", caller_uri)?;
                write_identity(&mut writer, "local", callee_uri)?;
            } else {
                write_identity(&mut writer, "local", caller_uri)?;
                write_identity(&mut writer, "remote", callee_uri)?;
            }
        }

        writer
            .write_event(Event::End(BytesStart::new("dialog").to_end()))
            .map_err(xml_error)?;
    }

    writer
        .write_event(Event::End(BytesStart::new("dialog-info").to_end()))
        .map_err(xml_error)?;

    let xml = writer.into_inner().into_inner();
    String::from_utf8(xml).map_err(|e| Error::parse_error(format!("dialog-info xml: {e}")))
}

fn write_identity<W: std::io::Write>(
    writer: &mut Writer<W>,
    role: &str,
    uri: &str,
) -> Result<()> {
    writer
        .write_event(Event::Start(BytesStart::new(role)))
        .map_err(xml_error)?;
    writer
        .write_event(Event::Start(BytesStart::new("identity")))
        .map_err(xml_error)?;
    writer
        .write_event(Event::Text(BytesText::new(uri)))
        .map_err(xml_error)?;
    writer
        .write_event(Event::End(BytesStart::new("identity").to_end()))
        .map_err(xml_error)?;
    writer
        .write_event(Event::End(BytesStart::new(role).to_end()))
        .map_err(xml_error)?;
    Ok(())
}

fn xml_error(e: impl std::fmt::Display) -> Error {
    Error::parse_error(format!("dialog-info xml: {e}"))
}

/// Tolerant extraction from an incoming dialog-info+xml body: the entity
/// and dialog attributes plus the `<state>` text, ignoring unknown child
/// elements. A malformed tail does not discard what was already read.
pub fn parse_dialog_info(body: &str) -> DialogInfoState {
    let mut reader = Reader::from_str(body);
    reader.trim_text(true);

    let mut result = DialogInfoState::default();
    let mut buf = Vec::new();
    let mut in_state = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => match e.name().as_ref() {
                b"dialog-info" => {
                    for attr in e.attributes().flatten() {
                        if attr.key.as_ref() == b"entity" {
                            result.entity = String::from_utf8_lossy(&attr.value).to_string();
                        }
                    }
                }
                b"dialog" => {
                    for attr in e.attributes().flatten() {
                        match attr.key.as_ref() {
                            b"id" => {
                                result.id = String::from_utf8_lossy(&attr.value).to_string();
                            }
                            b"direction" => {
                                result.direction =
                                    String::from_utf8_lossy(&attr.value).to_string();
                            }
                            _ => {}
                        }
                    }
                }
                b"state" => in_state = true,
                _ => {}
            },
            Ok(Event::Text(ref e)) if in_state => {
                if let Ok(text) = e.unescape() {
                    result.state = text.trim().to_string();
                    result.valid = true;
                }
                in_state = false;
            }
            Ok(Event::End(ref e)) => {
                if e.name().as_ref() == b"state" {
                    in_state = false;
                }
            }
            Ok(Event::Eof) => break,
            Err(_) => break,
            _ => {}
        }
        buf.clear();
    }
    result
}
