//! In-memory task store.
//!
//! Used by the test suites and by embedded deployments that accept losing
//! records on restart. Cloning the store clones the handle, not the data,
//! so a "restarted" service wired to the same handle sees the same records
//! (which is how the restart-resume tests simulate durability).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use demix_core::types::TaskId;

use crate::models::TaskRecord;
use crate::store::{StoreError, TaskFilter, TaskStore};

/// HashMap-backed [`TaskStore`].
#[derive(Clone, Default)]
pub struct MemoryTaskStore {
    records: Arc<RwLock<HashMap<TaskId, TaskRecord>>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records currently held.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

fn matches(record: &TaskRecord, filter: &TaskFilter) -> bool {
    if let Some(statuses) = &filter.statuses {
        if !statuses.contains(&record.status) {
            return false;
        }
    }
    if let Some(cutoff) = filter.completed_before {
        match record.completed_at {
            Some(completed_at) if completed_at < cutoff => {}
            _ => return false,
        }
    }
    true
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn put(&self, record: &TaskRecord) -> Result<(), StoreError> {
        self.records
            .write()
            .await
            .insert(record.id, record.clone());
        Ok(())
    }

    async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError> {
        Ok(self.records.read().await.get(&id).cloned())
    }

    async fn list(&self, filter: &TaskFilter) -> Result<Vec<TaskRecord>, StoreError> {
        let records = self.records.read().await;
        let mut matched: Vec<TaskRecord> = records
            .values()
            .filter(|r| matches(r, filter))
            .cloned()
            .collect();
        matched.sort_by_key(|r| r.created_at);
        if let Some(limit) = filter.limit {
            matched.truncate(limit as usize);
        }
        Ok(matched)
    }

    async fn delete(&self, id: TaskId) -> Result<bool, StoreError> {
        Ok(self.records.write().await.remove(&id).is_some())
    }
}
