//! PostgreSQL-backed task store.
//!
//! Runtime-checked queries only (`query_as` with explicit binds), so the
//! crate builds without a live database. The `request` and `output_files`
//! columns hold JSON; everything the sweeper or dispatcher filters on is a
//! first-class column.

use async_trait::async_trait;
use sqlx::FromRow;

use demix_core::task::TaskStatus;
use demix_core::types::{TaskId, Timestamp};

use crate::models::TaskRecord;
use crate::store::{StoreError, TaskFilter, TaskStore};
use crate::DbPool;

/// Column list for `tasks` queries.
const COLUMNS: &str = "\
    id, status, created_at, started_at, completed_at, \
    request, input_path, output_dir, file_size_bytes, \
    progress_percent, current_stage, output_files, error_message, \
    processing_time_secs, crash_count, cancel_requested, artifacts_removed_at";

/// A row from the `tasks` table, before JSON fields are decoded.
#[derive(Debug, FromRow)]
struct TaskRow {
    id: TaskId,
    status: String,
    created_at: Timestamp,
    started_at: Option<Timestamp>,
    completed_at: Option<Timestamp>,
    request: serde_json::Value,
    input_path: String,
    output_dir: String,
    file_size_bytes: i64,
    progress_percent: Option<f32>,
    current_stage: Option<String>,
    output_files: serde_json::Value,
    error_message: Option<String>,
    processing_time_secs: Option<f64>,
    crash_count: i32,
    cancel_requested: bool,
    artifacts_removed_at: Option<Timestamp>,
}

impl TryFrom<TaskRow> for TaskRecord {
    type Error = StoreError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let status = TaskStatus::parse(&row.status)
            .map_err(|e| StoreError::Corrupt(format!("task {}: {e}", row.id)))?;
        Ok(TaskRecord {
            id: row.id,
            status,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            request: serde_json::from_value(row.request)?,
            input_path: row.input_path,
            output_dir: row.output_dir,
            file_size_bytes: row.file_size_bytes,
            progress_percent: row.progress_percent,
            current_stage: row.current_stage,
            output_files: serde_json::from_value(row.output_files)?,
            error_message: row.error_message,
            processing_time_secs: row.processing_time_secs,
            crash_count: row.crash_count,
            cancel_requested: row.cancel_requested,
            artifacts_removed_at: row.artifacts_removed_at,
        })
    }
}

/// [`TaskStore`] backed by a PostgreSQL pool.
#[derive(Clone)]
pub struct PgTaskStore {
    pool: DbPool,
}

impl PgTaskStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TaskStore for PgTaskStore {
    async fn put(&self, record: &TaskRecord) -> Result<(), StoreError> {
        let request = serde_json::to_value(&record.request)?;
        let output_files = serde_json::to_value(&record.output_files)?;

        sqlx::query(
            "INSERT INTO tasks (\
                 id, status, created_at, started_at, completed_at, \
                 request, input_path, output_dir, file_size_bytes, \
                 progress_percent, current_stage, output_files, error_message, \
                 processing_time_secs, crash_count, cancel_requested, artifacts_removed_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17) \
             ON CONFLICT (id) DO UPDATE SET \
                 status = EXCLUDED.status, \
                 started_at = EXCLUDED.started_at, \
                 completed_at = EXCLUDED.completed_at, \
                 progress_percent = EXCLUDED.progress_percent, \
                 current_stage = EXCLUDED.current_stage, \
                 output_files = EXCLUDED.output_files, \
                 error_message = EXCLUDED.error_message, \
                 processing_time_secs = EXCLUDED.processing_time_secs, \
                 crash_count = EXCLUDED.crash_count, \
                 cancel_requested = EXCLUDED.cancel_requested, \
                 artifacts_removed_at = EXCLUDED.artifacts_removed_at",
        )
        .bind(record.id)
        .bind(record.status.as_str())
        .bind(record.created_at)
        .bind(record.started_at)
        .bind(record.completed_at)
        .bind(&request)
        .bind(&record.input_path)
        .bind(&record.output_dir)
        .bind(record.file_size_bytes)
        .bind(record.progress_percent)
        .bind(&record.current_stage)
        .bind(&output_files)
        .bind(&record.error_message)
        .bind(record.processing_time_secs)
        .bind(record.crash_count)
        .bind(record.cancel_requested)
        .bind(record.artifacts_removed_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError> {
        let query = format!("SELECT {COLUMNS} FROM tasks WHERE id = $1");
        let row = sqlx::query_as::<_, TaskRow>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(TaskRecord::try_from).transpose()
    }

    async fn list(&self, filter: &TaskFilter) -> Result<Vec<TaskRecord>, StoreError> {
        // Build the WHERE clause and track the next bind parameter index.
        let mut conditions: Vec<String> = Vec::new();
        let mut bind_idx: u32 = 1;

        if filter.statuses.is_some() {
            conditions.push(format!("status = ANY(${bind_idx})"));
            bind_idx += 1;
        }
        if filter.completed_before.is_some() {
            conditions.push(format!("completed_at < ${bind_idx}"));
            bind_idx += 1;
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let limit_clause = if filter.limit.is_some() {
            format!("LIMIT ${bind_idx}")
        } else {
            String::new()
        };

        let query = format!(
            "SELECT {COLUMNS} FROM tasks {where_clause} ORDER BY created_at ASC {limit_clause}"
        );

        let mut q = sqlx::query_as::<_, TaskRow>(&query);

        if let Some(statuses) = &filter.statuses {
            let names: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
            q = q.bind(names);
        }
        if let Some(cutoff) = filter.completed_before {
            q = q.bind(cutoff);
        }
        if let Some(limit) = filter.limit {
            q = q.bind(limit);
        }

        let rows = q.fetch_all(&self.pool).await?;
        rows.into_iter().map(TaskRecord::try_from).collect()
    }

    async fn delete(&self, id: TaskId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM tasks WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
