//! Inference engine contract for audio source separation.
//!
//! The engine is an external collaborator: opaque, potentially slow, and
//! potentially crashing. The orchestration core only depends on the
//! [`InferenceEngine`] trait; [`RemoteEngine`] implements it against an
//! engine sidecar over HTTP with a streamed NDJSON event protocol.
//!
//! Failure is an explicit [`Result`] branch at this boundary -- worker code
//! never relies on unwinding to observe an engine fault.

pub mod client;
pub mod messages;

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use demix_core::device::Device;
use demix_core::separation::SeparationRequest;
use demix_core::types::TaskId;

pub use client::RemoteEngine;

/// Output label -> produced file path.
pub type OutputFiles = BTreeMap<String, String>;

/// A progress update emitted by the engine mid-separation.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    /// Overall progress in `[0, 100]`.
    pub percent: f32,
    /// Free-text stage label (e.g. `"Demixing"`).
    pub stage: String,
}

/// One unit of work handed to the engine.
#[derive(Debug, Clone)]
pub struct SeparationJob {
    pub task_id: TaskId,
    /// Path to the uploaded input file.
    pub input_path: String,
    /// Directory the engine writes stems into.
    pub output_dir: String,
    /// Compute device assigned by the worker pool.
    pub device: Device,
    pub request: SeparationRequest,
}

/// Errors from an engine invocation.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The engine reported a separation failure.
    #[error("Separation failed: {0}")]
    Failed(String),

    /// The engine observed the cancellation signal and stopped.
    #[error("Separation cancelled")]
    Cancelled,

    /// Could not reach the engine (network, DNS, TLS, dropped stream).
    #[error("Engine connection error: {0}")]
    Connection(String),

    /// The engine sent something the protocol does not allow.
    #[error("Engine protocol error: {0}")]
    Protocol(String),
}

/// The external separation engine.
///
/// Implementations report progress through the provided channel and should
/// observe `cancel` at their own pace; cancellation is cooperative and
/// best-effort, never preemptive.
#[async_trait]
pub trait InferenceEngine: Send + Sync {
    async fn separate(
        &self,
        job: &SeparationJob,
        progress: mpsc::Sender<ProgressUpdate>,
        cancel: CancellationToken,
    ) -> Result<OutputFiles, EngineError>;
}
