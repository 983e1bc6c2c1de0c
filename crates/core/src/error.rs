use crate::task::TaskStatus;
use crate::types::TaskId;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Task not found: {0}")]
    NotFound(TaskId),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Gone: {0}")]
    Gone(String),

    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("Illegal status transition: {from} -> {to}")]
    InternalInconsistency { from: TaskStatus, to: TaskStatus },

    #[error("Internal error: {0}")]
    Internal(String),
}
