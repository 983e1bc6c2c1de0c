//! Task record model: one record per separation task, tracked from
//! submission to retention-driven deletion.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use demix_core::separation::SeparationRequest;
use demix_core::task::TaskStatus;
use demix_core::types::{TaskId, Timestamp};

/// A task's full lifecycle record as held by the store.
///
/// Mutation happens exclusively through the orchestrator, which serializes
/// writes per id and funnels status changes through the state machine. The
/// record itself only knows how to construct and reset itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub status: TaskStatus,

    // Timestamps: each set at most once, monotonically non-decreasing.
    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,

    /// Separation parameters, immutable after creation.
    pub request: SeparationRequest,
    /// Path to the uploaded input file.
    pub input_path: String,
    /// Directory the engine writes stems into.
    pub output_dir: String,
    /// Input size captured at creation, for quota accounting.
    pub file_size_bytes: i64,

    // Progress: absent until processing starts.
    pub progress_percent: Option<f32>,
    pub current_stage: Option<String>,

    /// Output label -> file path. Populated only on completion.
    pub output_files: BTreeMap<String, String>,
    /// Failure reason. Populated only on failure.
    pub error_message: Option<String>,
    /// Wall-clock execution time, derived at completion.
    pub processing_time_secs: Option<f64>,

    /// Worker crashes attributed to this task. A task that crashes its
    /// worker twice is permanently failed instead of requeued.
    pub crash_count: i32,
    /// Cooperative-cancellation intent, observed by the executing worker.
    pub cancel_requested: bool,
    /// Set by the retention sweeper once artifacts have been deleted.
    /// Metadata outlives artifacts until its own retention window lapses.
    pub artifacts_removed_at: Option<Timestamp>,
}

impl TaskRecord {
    /// Create a fresh pending record.
    pub fn new(
        id: TaskId,
        request: SeparationRequest,
        input_path: String,
        output_dir: String,
        file_size_bytes: i64,
        created_at: Timestamp,
    ) -> Self {
        Self {
            id,
            status: TaskStatus::Pending,
            created_at,
            started_at: None,
            completed_at: None,
            request,
            input_path,
            output_dir,
            file_size_bytes,
            progress_percent: None,
            current_stage: None,
            output_files: BTreeMap::new(),
            error_message: None,
            processing_time_secs: None,
            crash_count: 0,
            cancel_requested: false,
            artifacts_removed_at: None,
        }
    }

    /// True once the task has reached a terminal status.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Reset to a fresh pending record, keeping identity and parameters.
    ///
    /// Used by crash recovery and restart resume: progress history is not
    /// trusted across either, so execution restarts from the beginning.
    /// `crash_count` is intentionally untouched; callers that want a clean
    /// slate (restart resume) zero it explicitly.
    pub fn reset_to_pending(&mut self) {
        self.status = TaskStatus::Pending;
        self.started_at = None;
        self.completed_at = None;
        self.progress_percent = None;
        self.current_stage = None;
        self.output_files.clear();
        self.error_message = None;
        self.processing_time_secs = None;
        self.cancel_requested = false;
    }

    /// Seconds from `started_at` to `now`, if execution ever started.
    pub fn processing_duration_secs(&self, now: Timestamp) -> Option<f64> {
        self.started_at
            .map(|started| (now - started).num_milliseconds() as f64 / 1000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use demix_core::separation::{OutputFormat, PcmType};

    fn record() -> TaskRecord {
        TaskRecord::new(
            uuid::Uuid::new_v4(),
            SeparationRequest {
                model_type: "mdx23c".to_string(),
                instruments: vec!["vocals".to_string()],
                use_tta: false,
                extract_instrumental: false,
                output_format: OutputFormat::Wav,
                pcm_type: PcmType::Pcm24,
            },
            "/uploads/in.wav".to_string(),
            "/outputs/task".to_string(),
            1024,
            Utc::now(),
        )
    }

    #[test]
    fn new_record_is_pending_and_empty() {
        let record = record();
        assert_eq!(record.status, TaskStatus::Pending);
        assert!(record.started_at.is_none());
        assert!(record.completed_at.is_none());
        assert!(record.progress_percent.is_none());
        assert!(record.output_files.is_empty());
        assert!(record.error_message.is_none());
        assert_eq!(record.crash_count, 0);
        assert!(!record.cancel_requested);
    }

    #[test]
    fn reset_clears_execution_state() {
        let mut record = record();
        record.status = TaskStatus::Processing;
        record.started_at = Some(Utc::now());
        record.progress_percent = Some(42.0);
        record.current_stage = Some("Demixing".to_string());
        record.cancel_requested = true;
        record.crash_count = 1;

        record.reset_to_pending();

        assert_eq!(record.status, TaskStatus::Pending);
        assert!(record.started_at.is_none());
        assert!(record.progress_percent.is_none());
        assert!(record.current_stage.is_none());
        assert!(!record.cancel_requested);
        // Crash attribution survives the reset.
        assert_eq!(record.crash_count, 1);
    }

    #[test]
    fn processing_duration_requires_start() {
        let mut record = record();
        let now = Utc::now();
        assert!(record.processing_duration_secs(now).is_none());

        record.started_at = Some(now - chrono::Duration::seconds(90));
        let secs = record.processing_duration_secs(now).unwrap();
        assert!((secs - 90.0).abs() < 0.5);
    }

    #[test]
    fn record_serde_round_trip() {
        let record = record();
        let json = serde_json::to_string(&record).unwrap();
        let back: TaskRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
