//! MongoDB document store backend

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::bson::doc;
use mongodb::options::{ClientOptions, ReplaceOptions};
use mongodb::{Client, Collection};
use tracing::{error, info};

use crate::config::PersistenceConfig;
use crate::errors::{Error, Result};
use crate::store::document::{DocumentStore, SubscriptionDocument};

#[derive(Debug, Default)]
pub struct MongoStats {
    pub operations: AtomicU64,
    pub errors: AtomicU64,
}

pub struct MongoDocumentStore {
    collection: Collection<SubscriptionDocument>,
    connected: AtomicBool,
    stats: MongoStats,
}

impl MongoDocumentStore {
    /// Connect and verify the server responds to ping
    pub async fn connect(config: &PersistenceConfig) -> Result<Self> {
        let mut options = ClientOptions::parse(&config.uri)
            .await
            .map_err(|e| Error::persistence_error(format!("bad persistence uri: {e}")))?;
        options.max_pool_size = Some(config.pool_size);
        options.app_name = Some("sip-event-processor".to_string());

        let client = Client::with_options(options)
            .map_err(|e| Error::persistence_error(format!("client init failed: {e}")))?;
        let database = client.database(&config.database);

        database
            .run_command(doc! { "ping": 1 }, None)
            .await
            .map_err(|e| Error::persistence_error(format!("ping failed: {e}")))?;

        info!(
            uri = %config.redacted_uri(),
            database = %config.database,
            collection = %config.collection,
            "connected to document store"
        );

        Ok(Self {
            collection: database.collection(&config.collection),
            connected: AtomicBool::new(true),
            stats: MongoStats::default(),
        })
    }

    pub fn stats(&self) -> &MongoStats {
        &self.stats
    }

    fn record_result<T>(&self, result: mongodb::error::Result<T>, what: &str) -> Result<T> {
        self.stats.operations.fetch_add(1, Ordering::Relaxed);
        result.map_err(|e| {
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
            error!(error = %e, what, "document store operation failed");
            Error::persistence_error(format!("{what}: {e}"))
        })
    }
}

#[async_trait]
impl DocumentStore for MongoDocumentStore {
    async fn upsert(&self, document: &SubscriptionDocument) -> Result<()> {
        let filter = doc! { "dialog_id": &document.dialog_id };
        let options = ReplaceOptions::builder().upsert(true).build();
        let result = self.collection.replace_one(filter, document, options).await;
        self.record_result(result, "upsert")?;
        Ok(())
    }

    async fn delete(&self, dialog_id: &str) -> Result<()> {
        let result = self
            .collection
            .delete_many(doc! { "dialog_id": dialog_id }, None)
            .await;
        self.record_result(result, "delete")?;
        Ok(())
    }

    async fn find_by_lifecycle(&self, lifecycle: &str) -> Result<Vec<SubscriptionDocument>> {
        let cursor = self
            .collection
            .find(doc! { "lifecycle": lifecycle }, None)
            .await;
        let cursor = self.record_result(cursor, "find")?;
        let documents = cursor.try_collect().await;
        self.record_result(documents, "find cursor")
    }

    async fn find_one(&self, dialog_id: &str) -> Result<Option<SubscriptionDocument>> {
        let result = self
            .collection
            .find_one(doc! { "dialog_id": dialog_id }, None)
            .await;
        self.record_result(result, "find_one")
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}
