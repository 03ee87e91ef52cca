//! Streaming frame scanner for the presence feed
//!
//! The feed is a continuous byte stream of concatenated XML frames with no
//! length prefix. The scanner keeps an append-only byte buffer, extracts
//! every complete `<CallStateEvent>` and `<Heartbeat>` frame in stream
//! order, and leaves partial frames in place for the next feed — a chunk
//! boundary can land anywhere, including inside a multibyte character.
//! Unknown top-level elements are skipped. The buffer is capped at 1 MiB;
//! overflow resets it and counts an error.

use tracing::{error, warn};

use crate::events::{CallState, CallStateEvent};

const MAX_BUFFER_SIZE: usize = 1_048_576;

const EVENT_OPEN: &[u8] = b"<CallStateEvent>";
const EVENT_CLOSE: &[u8] = b"</CallStateEvent>";
const HEARTBEAT_OPEN: &[u8] = b"<Heartbeat>";
const HEARTBEAT_CLOSE: &[u8] = b"</Heartbeat>";

/// Outcome of one `feed` call
#[derive(Debug, Default)]
pub struct FeedResult {
    pub events: Vec<CallStateEvent>,
    pub saw_heartbeat: bool,
    pub error: Option<String>,
}

/// Stateful scanner; one per connection, reset on reconnect
pub struct PresenceFrameParser {
    buffer: Vec<u8>,
    total_parsed: u64,
    total_errors: u64,
}

impl PresenceFrameParser {
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(4096),
            total_parsed: 0,
            total_errors: 0,
        }
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    pub fn total_events_parsed(&self) -> u64 {
        self.total_parsed
    }

    pub fn total_parse_errors(&self) -> u64 {
        self.total_errors
    }

    /// Consume one chunk from the socket and extract complete frames
    pub fn feed(&mut self, data: &[u8]) -> FeedResult {
        let mut result = FeedResult::default();
        if data.is_empty() {
            return result;
        }

        if self.buffer.len() + data.len() > MAX_BUFFER_SIZE {
            error!(
                buffered = self.buffer.len(),
                incoming = data.len(),
                "presence parser buffer overflow, resetting"
            );
            self.buffer.clear();
            self.total_errors += 1;
            result.error = Some("buffer overflow".to_string());
            return result;
        }

        self.buffer.extend_from_slice(data);

        let mut consumed = 0;
        loop {
            let rest = &self.buffer[consumed..];
            let event_at = find_bytes(rest, EVENT_OPEN);
            let heartbeat_at = find_bytes(rest, HEARTBEAT_OPEN);

            // Take whichever known frame opens first, in stream order
            let next = match (event_at, heartbeat_at) {
                (Some(e), Some(h)) if e < h => Frame::Event(e),
                (Some(_), Some(h)) => Frame::Heartbeat(h),
                (Some(e), None) => Frame::Event(e),
                (None, Some(h)) => Frame::Heartbeat(h),
                (None, None) => break,
            };

            match next {
                Frame::Event(start) => {
                    let Some(end) = find_bytes(&rest[start..], EVENT_CLOSE) else {
                        break;
                    };
                    let frame = &rest[start..start + end + EVENT_CLOSE.len()];
                    let event = parse_call_state_event(&String::from_utf8_lossy(frame));
                    if event.is_valid() {
                        self.total_parsed += 1;
                        result.events.push(event);
                    } else {
                        warn!(call = %event.presence_call_id, "invalid call state event");
                        self.total_errors += 1;
                    }
                    consumed += start + end + EVENT_CLOSE.len();
                }
                Frame::Heartbeat(start) => {
                    let Some(end) = find_bytes(&rest[start..], HEARTBEAT_CLOSE) else {
                        break;
                    };
                    result.saw_heartbeat = true;
                    consumed += start + end + HEARTBEAT_CLOSE.len();
                }
            }
        }

        if consumed > 0 {
            self.buffer.drain(..consumed);
        }

        // Discard leading garbage so junk before the next tag cannot grow
        // the buffer without bound
        if !self.buffer.is_empty() {
            match find_bytes(&self.buffer, b"<") {
                Some(0) => {}
                Some(lt) => {
                    self.buffer.drain(..lt);
                }
                None => self.buffer.clear(),
            }
        }

        result
    }
}

impl Default for PresenceFrameParser {
    fn default() -> Self {
        Self::new()
    }
}

enum Frame {
    Event(usize),
    Heartbeat(usize),
}

fn find_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn parse_call_state_event(frame: &str) -> CallStateEvent {
    let mut event = CallStateEvent::new();
    event.presence_call_id = extract_element(frame, "CallId");
    event.caller_uri = extract_element(frame, "CallerUri");
    event.callee_uri = extract_element(frame, "CalleeUri");
    event.direction = extract_element(frame, "Direction");
    event.tenant_id = extract_element(frame, "TenantId");
    event.timestamp = extract_element(frame, "Timestamp");
    event.state = CallState::parse(&extract_element(frame, "State"));
    event
}

fn extract_element(xml: &str, tag: &str) -> String {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let Some(start) = xml.find(&open) else {
        return String::new();
    };
    let content_start = start + open.len();
    let Some(end) = xml[content_start..].find(&close) else {
        return String::new();
    };
    xml[content_start..content_start + end].trim().to_string()
}
