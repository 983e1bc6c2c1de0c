//! The record store contract the orchestration core depends on.
//!
//! The store is a durable key-value mapping from task id to [`TaskRecord`].
//! Per-record write serialization is the orchestrator's job; the store only
//! guarantees that individual operations are atomic.

use async_trait::async_trait;

use demix_core::task::TaskStatus;
use demix_core::types::{TaskId, Timestamp};

use crate::models::TaskRecord;

/// Errors surfaced by store implementations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

/// Predicate for [`TaskStore::list`] scans.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    /// Restrict to these statuses. `None` matches all.
    pub statuses: Option<Vec<TaskStatus>>,
    /// Only records whose `completed_at` is before this instant.
    pub completed_before: Option<Timestamp>,
    /// Maximum number of records to return.
    pub limit: Option<i64>,
}

impl TaskFilter {
    /// Filter matching tasks left unfinished by a prior run.
    pub fn incomplete() -> Self {
        Self {
            statuses: Some(vec![TaskStatus::Pending, TaskStatus::Processing]),
            ..Self::default()
        }
    }

    /// Filter matching all terminal tasks.
    pub fn terminal() -> Self {
        Self {
            statuses: Some(vec![
                TaskStatus::Completed,
                TaskStatus::Failed,
                TaskStatus::Cancelled,
            ]),
            ..Self::default()
        }
    }
}

/// Durable task record store.
///
/// Results of [`list`](Self::list) are ordered by `created_at` ascending so
/// restart resume re-queues tasks in their original submission order.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert or fully replace the record for `record.id`.
    async fn put(&self, record: &TaskRecord) -> Result<(), StoreError>;

    /// Fetch a record by id.
    async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError>;

    /// Scan records matching `filter`, oldest first.
    async fn list(&self, filter: &TaskFilter) -> Result<Vec<TaskRecord>, StoreError>;

    /// Delete a record. Returns `false` if it did not exist.
    async fn delete(&self, id: TaskId) -> Result<bool, StoreError>;
}
