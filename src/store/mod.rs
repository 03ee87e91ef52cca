//! Durable persistence: the document-store contract, its backends, and the
//! write-behind subscription store.

pub mod document;
pub mod mongo;
pub mod subscription_store;

pub use document::{DocumentStore, MemoryDocumentStore, SubscriptionDocument};
pub use mongo::MongoDocumentStore;
pub use subscription_store::{StoreStats, StoredSubscription, SubscriptionStore};
