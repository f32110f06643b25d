use async_trait::async_trait;
use dashmap::DashMap;
use herald_core::RequestId;

use super::InboxRecord;
use crate::error::StoreError;
use crate::traits::Inbox;

/// Process-local [`Inbox`] backed by a `DashMap` keyed by `(request_id, context_key)`.
#[derive(Debug, Default)]
pub struct InMemoryInbox {
    records: DashMap<(RequestId, String), InboxRecord>,
}

impl InMemoryInbox {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drops every record. Intended for test teardown.
    pub fn clear(&self) {
        self.records.clear();
    }
}

#[async_trait]
impl Inbox for InMemoryInbox {
    async fn add(&self, record: InboxRecord) -> Result<(), StoreError> {
        // First record wins; records are never updated.
        self.records
            .entry((record.request_id, record.context_key.clone()))
            .or_insert(record);
        Ok(())
    }

    async fn exists(&self, request_id: RequestId, context_key: &str) -> Result<bool, StoreError> {
        Ok(self
            .records
            .contains_key(&(request_id, context_key.to_string())))
    }
}
