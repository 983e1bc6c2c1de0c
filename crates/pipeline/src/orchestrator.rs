//! Task orchestrator: owns task creation, lifecycle mutation, cancellation,
//! and restart recovery.
//!
//! Every status change funnels through one transition-validating function,
//! and every mutation of a given task id is serialized by a per-id async
//! lock. Different ids proceed fully in parallel; lookups never wait on
//! executing work.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use demix_core::device::Device;
use demix_core::error::CoreError;
use demix_core::separation::{validate_request, SeparationRequest};
use demix_core::task::{state_machine, TaskStatus};
use demix_core::types::{TaskId, Timestamp};
use demix_db::models::TaskRecord;
use demix_db::store::StoreError;
use demix_db::{TaskFilter, TaskStore};
use demix_engine::OutputFiles;

/// A task that crashes its worker this many times is permanently failed
/// instead of requeued.
pub const MAX_WORKER_CRASHES: i32 = 2;

/// Terminal outcome reported by the worker pool, exactly once per task.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    Completed(OutputFiles),
    Failed(String),
    Cancelled,
}

/// What to do with a task whose worker crashed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashDisposition {
    /// The task was reset to pending and should be resubmitted.
    Requeue,
    /// The crash cap was hit (or the task is already terminal); do not
    /// resubmit.
    Abandon,
}

type TaskLock = Arc<tokio::sync::Mutex<()>>;

/// Central coordinator for task lifecycle mutations.
pub struct TaskOrchestrator {
    store: Arc<dyn TaskStore>,
    /// Root directory task output subdirectories are created under.
    outputs_root: PathBuf,
    /// Per-id mutation locks. Entries are pruned when a task reaches a
    /// terminal state or is deleted.
    locks: Mutex<HashMap<TaskId, TaskLock>>,
    /// Cancellation tokens for in-flight executions, registered at dispatch.
    cancellations: Mutex<HashMap<TaskId, CancellationToken>>,
}

impl TaskOrchestrator {
    pub fn new(store: Arc<dyn TaskStore>, outputs_root: PathBuf) -> Self {
        Self {
            store,
            outputs_root,
            locks: Mutex::new(HashMap::new()),
            cancellations: Mutex::new(HashMap::new()),
        }
    }

    // -----------------------------------------------------------------------
    // Caller-facing operations
    // -----------------------------------------------------------------------

    /// Validate a request and persist a fresh pending record.
    ///
    /// Returns before any execution happens; the caller hands the id to the
    /// worker pool separately so admission control can run first.
    pub async fn create(
        &self,
        request: SeparationRequest,
        input_path: String,
        file_size_bytes: i64,
    ) -> Result<TaskRecord, CoreError> {
        validate_request(&request)?;

        let id = uuid::Uuid::new_v4();
        let output_dir = self.outputs_root.join(id.to_string());
        let record = TaskRecord::new(
            id,
            request,
            input_path,
            output_dir.to_string_lossy().into_owned(),
            file_size_bytes,
            Utc::now(),
        );

        self.store.put(&record).await.map_err(store_err)?;
        tracing::info!(task_id = %id, model_type = %record.request.model_type, "Task created");
        Ok(record)
    }

    /// Fetch the current record for a task.
    pub async fn get(&self, id: TaskId) -> Result<TaskRecord, CoreError> {
        self.store
            .get(id)
            .await
            .map_err(store_err)?
            .ok_or(CoreError::NotFound(id))
    }

    /// Fetch the output map of a finished task.
    ///
    /// `Conflict` while the task is still pending/processing, `Gone` once it
    /// failed or was cancelled.
    pub async fn results(&self, id: TaskId) -> Result<OutputFiles, CoreError> {
        let record = self.get(id).await?;
        match record.status {
            TaskStatus::Completed => Ok(record.output_files),
            TaskStatus::Failed | TaskStatus::Cancelled => Err(CoreError::Gone(format!(
                "Task {id} is {}; its results are not available",
                record.status
            ))),
            TaskStatus::Pending | TaskStatus::Processing => Err(CoreError::Conflict(format!(
                "Task {id} is still {}; results are not ready",
                record.status
            ))),
        }
    }

    /// Cancel a task.
    ///
    /// Pending tasks transition to `cancelled` immediately (the queued entry
    /// becomes inert; the dispatcher re-checks status before starting
    /// anything). Processing tasks get a cooperative cancellation request:
    /// the intent is recorded and the execution's token is fired, but the
    /// worker observes it at its own pace. Returns `false` if the task is
    /// already terminal.
    pub async fn cancel(&self, id: TaskId) -> Result<bool, CoreError> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let mut record = self.get(id).await?;
        match record.status {
            TaskStatus::Pending => {
                transition(&mut record, TaskStatus::Cancelled)?;
                record.completed_at = Some(Utc::now());
                self.store.put(&record).await.map_err(store_err)?;
                self.prune(id);
                tracing::info!(task_id = %id, "Task cancelled before dispatch");
                Ok(true)
            }
            TaskStatus::Processing => {
                record.cancel_requested = true;
                self.store.put(&record).await.map_err(store_err)?;
                if let Some(token) = self
                    .cancellations
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .get(&id)
                {
                    token.cancel();
                }
                tracing::info!(task_id = %id, "Cooperative cancellation requested");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    // -----------------------------------------------------------------------
    // Worker pool hooks
    // -----------------------------------------------------------------------

    /// Dispatch-time transition into `processing`.
    ///
    /// Returns `None` when the task should not run after all (cancelled
    /// while queued, or its record vanished); the pool skips it silently.
    /// On success the returned token is already registered, so a cancel
    /// arriving any time after this call reaches the execution.
    pub(crate) async fn begin(
        &self,
        id: TaskId,
        device: Device,
        parent: &CancellationToken,
    ) -> Result<Option<(TaskRecord, CancellationToken)>, CoreError> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let Some(mut record) = self.store.get(id).await.map_err(store_err)? else {
            tracing::warn!(task_id = %id, "Queued task has no record; skipping dispatch");
            return Ok(None);
        };
        if record.status != TaskStatus::Pending {
            tracing::info!(
                task_id = %id,
                status = %record.status,
                "Task no longer pending; skipping dispatch",
            );
            return Ok(None);
        }

        transition(&mut record, TaskStatus::Processing)?;
        if record.started_at.is_none() {
            record.started_at = Some(Utc::now());
        }
        record.progress_percent = Some(0.0);
        self.store.put(&record).await.map_err(store_err)?;

        let token = parent.child_token();
        self.cancellations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, token.clone());

        tracing::info!(task_id = %id, device = %device, "Task starting");
        Ok(Some((record, token)))
    }

    /// Record a progress update from the executing worker.
    ///
    /// Dropped (and logged) when the task does not exist or is not
    /// processing -- this guards against stale callbacks from a crashed or
    /// cancelled worker.
    pub async fn report_progress(&self, id: TaskId, percent: f32, stage: Option<&str>) {
        if !percent.is_finite() {
            tracing::warn!(task_id = %id, percent, "Dropping non-finite progress value");
            return;
        }

        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let record = match self.store.get(id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                tracing::warn!(task_id = %id, "Dropping progress report for unknown task");
                return;
            }
            Err(e) => {
                tracing::error!(task_id = %id, error = %e, "Failed to load task for progress update");
                return;
            }
        };
        if record.status != TaskStatus::Processing {
            tracing::warn!(
                task_id = %id,
                status = %record.status,
                "Dropping stale progress report",
            );
            return;
        }

        let mut record = record;
        record.progress_percent = Some(percent.clamp(0.0, 100.0));
        if let Some(stage) = stage {
            record.current_stage = Some(stage.to_string());
        }
        if let Err(e) = self.store.put(&record).await {
            tracing::error!(task_id = %id, error = %e, "Failed to persist progress update");
        }
    }

    /// Record the terminal outcome of an execution, exactly once.
    ///
    /// A second terminal report for the same id is a logged no-op anomaly.
    pub async fn report_terminal(&self, id: TaskId, outcome: TaskOutcome) {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let mut record = match self.store.get(id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                tracing::warn!(task_id = %id, "Terminal report for unknown task ignored");
                return;
            }
            Err(e) => {
                tracing::error!(task_id = %id, error = %e, "Failed to load task for terminal report");
                return;
            }
        };
        if record.is_terminal() {
            tracing::warn!(
                task_id = %id,
                status = %record.status,
                "Duplicate terminal report ignored",
            );
            return;
        }

        let now = Utc::now();
        let applied = match outcome {
            TaskOutcome::Completed(outputs) => {
                transition(&mut record, TaskStatus::Completed).map(|()| {
                    record.output_files = outputs;
                    record.progress_percent = Some(100.0);
                    record.processing_time_secs = record.processing_duration_secs(now);
                    record.completed_at = Some(now);
                })
            }
            TaskOutcome::Failed(reason) => {
                transition(&mut record, TaskStatus::Failed).map(|()| {
                    tracing::warn!(task_id = %id, error = %reason, "Task failed");
                    record.error_message = Some(reason);
                    record.processing_time_secs = record.processing_duration_secs(now);
                    record.completed_at = Some(now);
                })
            }
            TaskOutcome::Cancelled => transition(&mut record, TaskStatus::Cancelled).map(|()| {
                record.completed_at = Some(now);
            }),
        };
        if applied.is_err() {
            // Already logged loudly by `transition`; leave the record as-is.
            return;
        }

        if let Err(e) = self.store.put(&record).await {
            tracing::error!(task_id = %id, error = %e, "Failed to persist terminal state");
            return;
        }
        tracing::info!(task_id = %id, status = %record.status, "Task finished");
        self.prune(id);
    }

    /// Apply crash recovery to a task whose worker panicked.
    ///
    /// The first crash resets the record to fresh pending work; the second
    /// marks it permanently failed so a poisonous input cannot starve the
    /// pool.
    pub(crate) async fn handle_worker_crash(&self, id: TaskId) -> CrashDisposition {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let mut record = match self.store.get(id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                tracing::warn!(task_id = %id, "Crashed task has no record");
                return CrashDisposition::Abandon;
            }
            Err(e) => {
                tracing::error!(task_id = %id, error = %e, "Failed to load crashed task");
                return CrashDisposition::Abandon;
            }
        };
        if record.is_terminal() {
            return CrashDisposition::Abandon;
        }

        record.crash_count += 1;
        if record.crash_count >= MAX_WORKER_CRASHES {
            tracing::error!(
                task_id = %id,
                crash_count = record.crash_count,
                "Task crashed its worker repeatedly; failing permanently",
            );
            let now = Utc::now();
            if transition(&mut record, TaskStatus::Failed).is_err() {
                return CrashDisposition::Abandon;
            }
            record.error_message = Some(format!(
                "Worker crashed {} times during execution",
                record.crash_count
            ));
            record.completed_at = Some(now);
            if let Err(e) = self.store.put(&record).await {
                tracing::error!(task_id = %id, error = %e, "Failed to persist crash failure");
            }
            self.prune(id);
            CrashDisposition::Abandon
        } else {
            tracing::warn!(
                task_id = %id,
                crash_count = record.crash_count,
                "Worker crashed; requeueing task",
            );
            record.reset_to_pending();
            if let Err(e) = self.store.put(&record).await {
                tracing::error!(task_id = %id, error = %e, "Failed to persist crash requeue");
                return CrashDisposition::Abandon;
            }
            CrashDisposition::Requeue
        }
    }

    /// Drop the cancellation token registered for an execution.
    pub(crate) fn unregister_cancellation(&self, id: TaskId) {
        self.cancellations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }

    // -----------------------------------------------------------------------
    // Recovery and cleanup
    // -----------------------------------------------------------------------

    /// Find tasks left unfinished by a prior run and reset them to fresh
    /// pending work, oldest first.
    ///
    /// Progress history is not trusted across a restart: partial output is
    /// discarded and execution restarts from the beginning. Returns the ids
    /// to resubmit, in submission order.
    pub async fn resume_incomplete(&self) -> Result<Vec<TaskId>, CoreError> {
        let incomplete = self
            .store
            .list(&TaskFilter::incomplete())
            .await
            .map_err(store_err)?;

        let mut resumed = Vec::with_capacity(incomplete.len());
        for mut record in incomplete {
            let lock = self.lock_for(record.id);
            let _guard = lock.lock().await;

            discard_partial_outputs(&record).await;
            record.reset_to_pending();
            record.crash_count = 0;
            self.store.put(&record).await.map_err(store_err)?;
            resumed.push(record.id);
        }

        if !resumed.is_empty() {
            tracing::info!(count = resumed.len(), "Resuming incomplete tasks");
        }
        Ok(resumed)
    }

    /// Stamp a record as having had its artifacts deleted.
    pub(crate) async fn mark_artifacts_removed(
        &self,
        id: TaskId,
        now: Timestamp,
    ) -> Result<(), CoreError> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let mut record = self.get(id).await?;
        record.artifacts_removed_at = Some(now);
        self.store.put(&record).await.map_err(store_err)?;
        Ok(())
    }

    /// Delete a task record outright (metadata retention expiry).
    pub(crate) async fn delete_task(&self, id: TaskId) -> Result<bool, CoreError> {
        let lock = self.lock_for(id);
        let deleted = {
            let _guard = lock.lock().await;
            self.store.delete(id).await.map_err(store_err)?
        };
        self.prune(id);
        Ok(deleted)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn lock_for(&self, id: TaskId) -> TaskLock {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(id).or_default())
    }

    /// Remove bookkeeping for a task that can no longer transition.
    fn prune(&self, id: TaskId) {
        self.locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
        self.unregister_cancellation(id);
    }
}

/// The single transition-validating gate every status change goes through.
fn transition(record: &mut TaskRecord, to: TaskStatus) -> Result<(), CoreError> {
    match state_machine::validate_transition(record.status, to) {
        Ok(()) => {
            record.status = to;
            Ok(())
        }
        Err(reason) => {
            tracing::error!(task_id = %record.id, error = %reason, "Illegal status transition rejected");
            Err(CoreError::InternalInconsistency {
                from: record.status,
                to,
            })
        }
    }
}

/// Best-effort removal of a task's partially written output directory.
async fn discard_partial_outputs(record: &TaskRecord) {
    match tokio::fs::remove_dir_all(&record.output_dir).await {
        Ok(()) => {
            tracing::info!(task_id = %record.id, "Discarded partial output");
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(task_id = %record.id, error = %e, "Failed to discard partial output");
        }
    }
}

fn store_err(e: StoreError) -> CoreError {
    CoreError::Internal(e.to_string())
}
