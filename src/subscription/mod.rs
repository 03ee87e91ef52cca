//! Subscription state: records, the process-wide registry, the BLF watcher
//! index, and the per-package processors.

pub mod blf;
pub mod index;
pub mod mwi;
pub mod registry;
pub mod types;

pub use blf::{BlfProcessor, NotifyAction};
pub use index::{normalize_uri, WatcherEntry, WatcherIndex};
pub use mwi::MwiProcessor;
pub use registry::{SubscriptionInfo, SubscriptionRegistry};
pub use types::{SubLifecycle, SubscriptionRecord, SubscriptionType};
