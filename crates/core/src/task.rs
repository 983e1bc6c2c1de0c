//! Task status set and lifecycle state machine.
//!
//! This module lives in `core` (zero internal deps) so the same transition
//! rules are shared by the orchestrator, the record store, and any future
//! CLI tooling. Every status mutation anywhere in the workspace must go
//! through [`state_machine::validate_transition`].

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Status constants
// ---------------------------------------------------------------------------

/// Task created and queued for processing.
pub const STATUS_PENDING: &str = "pending";
/// Task currently executing on a worker.
pub const STATUS_PROCESSING: &str = "processing";
/// Task finished successfully; output files recorded.
pub const STATUS_COMPLETED: &str = "completed";
/// Task finished with an error; failure reason recorded.
pub const STATUS_FAILED: &str = "failed";
/// Task cancelled by the caller.
pub const STATUS_CANCELLED: &str = "cancelled";

/// All valid task statuses, in lifecycle order.
pub const VALID_STATUSES: &[&str] = &[
    STATUS_PENDING,
    STATUS_PROCESSING,
    STATUS_COMPLETED,
    STATUS_FAILED,
    STATUS_CANCELLED,
];

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

/// Lifecycle status of a separation task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Return the stable string representation used in storage and APIs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => STATUS_PENDING,
            Self::Processing => STATUS_PROCESSING,
            Self::Completed => STATUS_COMPLETED,
            Self::Failed => STATUS_FAILED,
            Self::Cancelled => STATUS_CANCELLED,
        }
    }

    /// Parse from a string, returning an error for unknown statuses.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            STATUS_PENDING => Ok(Self::Pending),
            STATUS_PROCESSING => Ok(Self::Processing),
            STATUS_COMPLETED => Ok(Self::Completed),
            STATUS_FAILED => Ok(Self::Failed),
            STATUS_CANCELLED => Ok(Self::Cancelled),
            other => Err(CoreError::Validation(format!(
                "Unknown task status: '{other}'. Valid statuses: {}",
                VALID_STATUSES.join(", ")
            ))),
        }
    }

    /// True for statuses with no outgoing transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

pub mod state_machine {
    use super::TaskStatus;

    /// Returns the set of valid target statuses reachable from `from`.
    ///
    /// Terminal states (Completed, Failed, Cancelled) return an empty slice
    /// because no further transitions are allowed. Crash recovery and
    /// restart resume do not transition out of `Processing`; they reset the
    /// record to a fresh pending state through a dedicated recovery path.
    pub fn valid_transitions(from: TaskStatus) -> &'static [TaskStatus] {
        match from {
            TaskStatus::Pending => &[TaskStatus::Processing, TaskStatus::Cancelled],
            TaskStatus::Processing => &[
                TaskStatus::Completed,
                TaskStatus::Failed,
                TaskStatus::Cancelled,
            ],
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled => &[],
        }
    }

    /// Check whether a transition from `from` to `to` is valid.
    pub fn can_transition(from: TaskStatus, to: TaskStatus) -> bool {
        valid_transitions(from).contains(&to)
    }

    /// Validate a state transition, returning an error message for invalid
    /// ones.
    pub fn validate_transition(from: TaskStatus, to: TaskStatus) -> Result<(), String> {
        if can_transition(from, to) {
            Ok(())
        } else {
            Err(format!("Invalid transition: {from} -> {to}"))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
