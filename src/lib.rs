//! # sip-event-core
//!
//! Multi-tenant SIP event processor: accepts SUBSCRIBE/NOTIFY/PUBLISH
//! dialogs from SIP user agents and maintains two subscription packages —
//! Busy Lamp Field (dialog-info, RFC 4235) and Message Waiting Indication
//! (message-summary). BLF state is not synthesized locally: call state
//! arrives on a TCP presence feed and is fanned out to every watcher of
//! the affected line.
//!
//! ## Architecture
//!
//! - [`dispatch`] — hash-sharded dispatcher and single-writer per-dialog
//!   workers with bounded queues and round-robin fairness
//! - [`subscription`] — records, the watcher index, the registry, and the
//!   BLF/MWI processors
//! - [`presence`] — TCP feed client with multi-server failover, streaming
//!   frame parsing, and the watcher fanout router
//! - [`store`] — write-behind durable store with immediate writes on
//!   lifecycle edges and recovery reseeding on startup
//! - [`transport`] — the contract the embedding SIP stack implements
//! - [`admin`] — JSON health and stats endpoints
//!
//! The SIP wire protocol itself is out of scope: an external stack
//! delivers categorized events and owns the sockets.

pub mod admin;
pub mod config;
pub mod dispatch;
pub mod errors;
pub mod events;
pub mod presence;
pub mod store;
pub mod subscription;
pub mod telemetry;
pub mod transport;

pub use config::Config;
pub use dispatch::{DialogDispatcher, StaleReaper};
pub use errors::{Error, Result};
pub use events::{CallState, CallStateEvent, DialogId, SipEvent};
pub use presence::{FailoverManager, PresenceRouter, PresenceTcpClient};
pub use store::SubscriptionStore;
pub use subscription::{SubscriptionRegistry, WatcherIndex};
pub use transport::{SipHandle, SipTransport};
