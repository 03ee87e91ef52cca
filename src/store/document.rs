//! Persisted subscription document and the document-store contract

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::errors::Result;
use crate::subscription::types::{SubLifecycle, SubscriptionRecord, SubscriptionType};

/// Flat document stored per dialog. Just enough to resume the subscription
/// on another service instance: identifiers, the dialog re-creation tuple,
/// the last known package state, and the verbatim last NOTIFY bodies.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SubscriptionDocument {
    pub dialog_id: String,
    pub tenant_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub lifecycle: String,
    pub cseq: u32,

    pub blf_monitored_uri: String,
    pub blf_last_state: String,
    pub blf_last_direction: String,
    pub blf_presence_call_id: String,
    pub blf_last_notify_body: String,
    pub blf_notify_version: u32,

    pub mwi_new_messages: i32,
    pub mwi_old_messages: i32,
    pub mwi_account_uri: String,
    pub mwi_last_notify_body: String,

    pub from_uri: String,
    pub from_tag: String,
    pub to_uri: String,
    pub to_tag: String,
    pub call_id: String,
    pub contact_uri: String,

    /// Seconds since epoch
    pub updated_at: i64,
    /// Seconds since epoch; 0 when the subscription has no expiry
    pub expires_at: i64,
    /// Operator-side partitioning key
    pub service_id: String,
}

impl SubscriptionDocument {
    pub fn from_record(record: &SubscriptionRecord, service_id: &str) -> Self {
        Self {
            dialog_id: record.dialog_id.clone(),
            tenant_id: record.tenant_id.clone(),
            kind: record.kind.as_str().to_string(),
            lifecycle: record.lifecycle.as_str().to_string(),
            cseq: record.cseq,
            blf_monitored_uri: record.blf_monitored_uri.clone(),
            blf_last_state: record.blf_last_state.clone(),
            blf_last_direction: record.blf_last_direction.clone(),
            blf_presence_call_id: record.blf_presence_call_id.clone(),
            blf_last_notify_body: record.blf_last_notify_body.clone(),
            blf_notify_version: record.notify_version,
            mwi_new_messages: record.mwi_new_messages,
            mwi_old_messages: record.mwi_old_messages,
            mwi_account_uri: record.mwi_account_uri.clone(),
            mwi_last_notify_body: record.mwi_last_notify_body.clone(),
            from_uri: record.from_uri.clone(),
            from_tag: record.from_tag.clone(),
            to_uri: record.to_uri.clone(),
            to_tag: record.to_tag.clone(),
            call_id: record.call_id.clone(),
            contact_uri: record.contact_uri.clone(),
            updated_at: Utc::now().timestamp(),
            expires_at: record.expires_at.map(|at| at.timestamp()).unwrap_or(0),
            service_id: service_id.to_string(),
        }
    }

    pub fn into_record(self) -> SubscriptionRecord {
        let mut record = SubscriptionRecord::new(
            self.dialog_id,
            self.tenant_id,
            SubscriptionType::from_str_loose(&self.kind),
        );
        record.lifecycle = SubLifecycle::from_str_loose(&self.lifecycle);
        record.cseq = self.cseq;
        record.blf_monitored_uri = self.blf_monitored_uri;
        record.blf_last_state = self.blf_last_state;
        record.blf_last_direction = self.blf_last_direction;
        record.blf_presence_call_id = self.blf_presence_call_id;
        record.blf_last_notify_body = self.blf_last_notify_body;
        record.notify_version = self.blf_notify_version;
        record.mwi_new_messages = self.mwi_new_messages;
        record.mwi_old_messages = self.mwi_old_messages;
        record.mwi_account_uri = self.mwi_account_uri;
        record.mwi_last_notify_body = self.mwi_last_notify_body;
        record.from_uri = self.from_uri;
        record.from_tag = self.from_tag;
        record.to_uri = self.to_uri;
        record.to_tag = self.to_tag;
        record.call_id = self.call_id;
        record.contact_uri = self.contact_uri;
        if self.expires_at > 0 {
            record.expires_at = chrono::DateTime::from_timestamp(self.expires_at, 0);
        }
        record
    }
}

/// Backend contract: idempotent upsert-by-key, delete-by-key, and equality
/// queries. Everything above this seam is backend-agnostic.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn upsert(&self, document: &SubscriptionDocument) -> Result<()>;
    async fn delete(&self, dialog_id: &str) -> Result<()>;
    async fn find_by_lifecycle(&self, lifecycle: &str) -> Result<Vec<SubscriptionDocument>>;
    async fn find_one(&self, dialog_id: &str) -> Result<Option<SubscriptionDocument>>;
    fn is_connected(&self) -> bool;
}

/// In-memory backend for tests and persistence-less operation
#[derive(Default)]
pub struct MemoryDocumentStore {
    documents: Mutex<HashMap<String, SubscriptionDocument>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.documents.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn upsert(&self, document: &SubscriptionDocument) -> Result<()> {
        self.documents
            .lock()
            .unwrap()
            .insert(document.dialog_id.clone(), document.clone());
        Ok(())
    }

    async fn delete(&self, dialog_id: &str) -> Result<()> {
        self.documents.lock().unwrap().remove(dialog_id);
        Ok(())
    }

    async fn find_by_lifecycle(&self, lifecycle: &str) -> Result<Vec<SubscriptionDocument>> {
        Ok(self
            .documents
            .lock()
            .unwrap()
            .values()
            .filter(|d| d.lifecycle == lifecycle)
            .cloned()
            .collect())
    }

    async fn find_one(&self, dialog_id: &str) -> Result<Option<SubscriptionDocument>> {
        Ok(self.documents.lock().unwrap().get(dialog_id).cloned())
    }

    fn is_connected(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_round_trip_preserves_state() {
        let mut record = SubscriptionRecord::new("d1;ft=a", "test.com", SubscriptionType::Blf);
        record.lifecycle = SubLifecycle::Active;
        record.blf_monitored_uri = "sip:200@test.com".to_string();
        record.blf_last_state = "confirmed".to_string();
        record.blf_last_notify_body = "<dialog-info/>".to_string();
        record.notify_version = 7;
        record.extend_expiry(3600);

        let document = SubscriptionDocument::from_record(&record, "svc-1");
        assert_eq!(document.kind, "BLF");
        assert_eq!(document.service_id, "svc-1");
        assert!(document.expires_at > 0);

        let restored = document.into_record();
        assert_eq!(restored.dialog_id, "d1;ft=a");
        assert_eq!(restored.lifecycle, SubLifecycle::Active);
        assert_eq!(restored.kind, SubscriptionType::Blf);
        assert_eq!(restored.blf_last_notify_body, "<dialog-info/>");
        assert_eq!(restored.notify_version, 7);
        assert!(restored.expires_at.is_some());
    }
}
