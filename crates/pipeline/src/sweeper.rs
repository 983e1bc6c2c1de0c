//! Retention sweeper: periodic deletion of expired artifacts and metadata.
//!
//! Artifacts (output stems and the uploaded input) expire first, on a
//! status-specific window; the record itself lives until the longer
//! metadata window lapses. The two deletions are independent and may happen
//! in separate sweeps. A failure on one task never aborts the sweep of the
//! rest.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use demix_core::error::CoreError;
use demix_core::task::TaskStatus;
use demix_core::types::Timestamp;
use demix_db::models::TaskRecord;
use demix_db::{TaskFilter, TaskStore};

use crate::config::CleanupConfig;
use crate::orchestrator::TaskOrchestrator;

/// Retention windows, derived from [`CleanupConfig`].
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    /// How long a completed task keeps its artifacts.
    pub completed_retention: chrono::Duration,
    /// How long a failed (or cancelled) task keeps its artifacts.
    pub failed_retention: chrono::Duration,
    /// How long any terminal task keeps its record.
    pub metadata_retention: chrono::Duration,
}

impl From<&CleanupConfig> for RetentionConfig {
    fn from(config: &CleanupConfig) -> Self {
        Self {
            completed_retention: chrono::Duration::hours(config.completed_retention_hours),
            failed_retention: chrono::Duration::hours(config.failed_retention_hours),
            metadata_retention: chrono::Duration::days(config.metadata_retention_days),
        }
    }
}

/// Report returned after one sweep pass.
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    /// Terminal records examined.
    pub scanned: usize,
    /// Tasks whose artifacts were deleted this pass.
    pub artifacts_removed: usize,
    /// Records deleted outright this pass.
    pub records_deleted: usize,
    /// Per-task failures, skipped and collected.
    pub errors: Vec<String>,
}

/// Background service that enforces retention windows.
pub struct RetentionSweeper {
    store: Arc<dyn TaskStore>,
    orchestrator: Arc<TaskOrchestrator>,
    config: RetentionConfig,
    interval: Duration,
}

impl RetentionSweeper {
    pub fn new(
        store: Arc<dyn TaskStore>,
        orchestrator: Arc<TaskOrchestrator>,
        config: RetentionConfig,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            orchestrator,
            config,
            interval,
        }
    }

    /// Run the sweep loop until the token is cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Retention sweeper cancelled");
                    break;
                }
                _ = interval.tick() => {
                    self.sweep_once(Utc::now()).await;
                }
            }
        }
    }

    /// Run a single sweep pass against the clock value `now`.
    pub async fn sweep_once(&self, now: Timestamp) -> SweepReport {
        let mut report = SweepReport::default();

        let terminal = match self.store.list(&TaskFilter::terminal()).await {
            Ok(terminal) => terminal,
            Err(e) => {
                tracing::error!(error = %e, "Retention sweep failed to scan the store");
                report.errors.push(e.to_string());
                return report;
            }
        };
        report.scanned = terminal.len();

        for record in terminal {
            if let Err(e) = self.sweep_task(&record, now, &mut report).await {
                tracing::warn!(
                    task_id = %record.id,
                    error = %e,
                    "Retention sweep failed for task; continuing",
                );
                report.errors.push(format!("task {}: {e}", record.id));
            }
        }

        if report.artifacts_removed > 0 || report.records_deleted > 0 {
            tracing::info!(
                scanned = report.scanned,
                artifacts_removed = report.artifacts_removed,
                records_deleted = report.records_deleted,
                errors = report.errors.len(),
                "Retention sweep complete",
            );
        }
        report
    }

    async fn sweep_task(
        &self,
        record: &TaskRecord,
        now: Timestamp,
        report: &mut SweepReport,
    ) -> Result<(), CoreError> {
        let Some(completed_at) = record.completed_at else {
            return Ok(());
        };

        let artifact_window = match record.status {
            TaskStatus::Completed => self.config.completed_retention,
            _ => self.config.failed_retention,
        };

        let mut artifacts_present = record.artifacts_removed_at.is_none();
        if artifacts_present && completed_at + artifact_window <= now {
            remove_artifacts(record)
                .await
                .map_err(|e| CoreError::Internal(e.to_string()))?;
            self.orchestrator
                .mark_artifacts_removed(record.id, now)
                .await?;
            report.artifacts_removed += 1;
            artifacts_present = false;
            tracing::info!(task_id = %record.id, status = %record.status, "Expired artifacts removed");
        }

        if completed_at + self.config.metadata_retention <= now {
            if artifacts_present {
                remove_artifacts(record)
                    .await
                    .map_err(|e| CoreError::Internal(e.to_string()))?;
            }
            if self.orchestrator.delete_task(record.id).await? {
                report.records_deleted += 1;
                tracing::info!(task_id = %record.id, "Expired task record deleted");
            }
        }

        Ok(())
    }
}

/// Delete a task's output files, uploaded input, and output directory.
///
/// Already-missing files are fine (a previous pass may have been
/// interrupted); any other I/O failure is returned so the pass retries the
/// task on the next sweep instead of marking its artifacts removed.
async fn remove_artifacts(record: &TaskRecord) -> std::io::Result<()> {
    for path in record.output_files.values() {
        remove_file_if_exists(path).await?;
    }
    remove_file_if_exists(&record.input_path).await?;

    match tokio::fs::remove_dir_all(&record.output_dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

async fn remove_file_if_exists(path: &str) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
