//! Shared test fixtures: a scriptable in-process engine and service helpers.

// Each integration test binary compiles this module separately and uses a
// different subset of it.
#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use demix_core::device::Device;
use demix_core::separation::{OutputFormat, PcmType, SeparationRequest};
use demix_core::task::TaskStatus;
use demix_core::types::TaskId;
use demix_db::models::TaskRecord;
use demix_engine::{EngineError, InferenceEngine, OutputFiles, ProgressUpdate, SeparationJob};
use demix_pipeline::{SeparationService, ServiceConfig};

/// Generous upper bound for any single wait in these tests.
pub const WAIT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

pub fn request() -> SeparationRequest {
    SeparationRequest {
        model_type: "mdx23c".to_string(),
        instruments: vec!["vocals".to_string(), "drums".to_string()],
        use_tta: false,
        extract_instrumental: false,
        output_format: OutputFormat::Wav,
        pcm_type: PcmType::Pcm24,
    }
}

/// Service configuration pointed at a temp directory, with the sweeper off
/// (sweeper tests drive passes by hand).
pub fn test_config(
    workers: usize,
    device_ids: Vec<u32>,
    queue_depth: usize,
    dir: &Path,
) -> ServiceConfig {
    let defaults = ServiceConfig::default();
    ServiceConfig {
        workers,
        device_ids,
        queue_depth,
        upload_dir: dir.join("uploads").to_string_lossy().into_owned(),
        output_dir: dir.join("outputs").to_string_lossy().into_owned(),
        drain_timeout_secs: 1,
        cleanup: demix_pipeline::config::CleanupConfig {
            enabled: false,
            ..defaults.cleanup.clone()
        },
        ..defaults
    }
}

/// Poll until a task reaches `status` or the wait budget runs out.
pub async fn wait_for_status(
    service: &SeparationService,
    id: TaskId,
    status: TaskStatus,
) -> TaskRecord {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let record = service.status(id).await.expect("task should exist");
        if record.status == status {
            return record;
        }
        if tokio::time::Instant::now() > deadline {
            panic!(
                "task {id} never reached {status}; currently {}",
                record.status
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ---------------------------------------------------------------------------
// ScriptedEngine
// ---------------------------------------------------------------------------

/// What the engine should do with a job, keyed by its input path.
#[derive(Clone, Debug)]
pub enum Behavior {
    /// Write one output file per requested instrument and return them.
    Succeed,
    /// Return an engine failure.
    Fail(String),
    /// Panic the worker `times` times, then succeed.
    Crash { times: u32 },
    /// Block until released via [`ScriptedEngine::release`] or cancelled.
    Gate,
    /// Report one progress update, then gate.
    GateWithProgress { percent: f32, stage: String },
}

/// Emitted on the start channel the moment a job enters the engine.
#[derive(Debug, Clone)]
pub struct StartEvent {
    pub input_path: String,
    pub device: Device,
}

/// Deterministic in-process engine driven by per-job scripts.
pub struct ScriptedEngine {
    default_behavior: Behavior,
    behaviors: Mutex<HashMap<String, Behavior>>,
    crash_counts: Mutex<HashMap<String, u32>>,
    gate: Semaphore,
    start_tx: mpsc::UnboundedSender<StartEvent>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl ScriptedEngine {
    pub fn new(default_behavior: Behavior) -> (Arc<Self>, mpsc::UnboundedReceiver<StartEvent>) {
        let (start_tx, start_rx) = mpsc::unbounded_channel();
        let engine = Arc::new(Self {
            default_behavior,
            behaviors: Mutex::new(HashMap::new()),
            crash_counts: Mutex::new(HashMap::new()),
            gate: Semaphore::new(0),
            start_tx,
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        });
        (engine, start_rx)
    }

    pub fn set_behavior(&self, input_path: &str, behavior: Behavior) {
        self.behaviors
            .lock()
            .unwrap()
            .insert(input_path.to_string(), behavior);
    }

    /// Let `n` gated jobs proceed, in the order they started waiting.
    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }

    /// Highest number of jobs ever observed inside the engine at once.
    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    async fn finish(&self, job: &SeparationJob) -> Result<OutputFiles, EngineError> {
        tokio::fs::create_dir_all(&job.output_dir)
            .await
            .map_err(|e| EngineError::Failed(e.to_string()))?;
        let mut outputs = OutputFiles::new();
        for instrument in &job.request.instruments {
            let path = format!(
                "{}/{}.{}",
                job.output_dir,
                instrument,
                job.request.output_format.as_str()
            );
            tokio::fs::write(&path, b"stem")
                .await
                .map_err(|e| EngineError::Failed(e.to_string()))?;
            outputs.insert(instrument.clone(), path);
        }
        Ok(outputs)
    }
}

struct ActiveGuard<'a>(&'a ScriptedEngine);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl InferenceEngine for ScriptedEngine {
    async fn separate(
        &self,
        job: &SeparationJob,
        progress: mpsc::Sender<ProgressUpdate>,
        cancel: CancellationToken,
    ) -> Result<OutputFiles, EngineError> {
        let behavior = self
            .behaviors
            .lock()
            .unwrap()
            .get(&job.input_path)
            .cloned()
            .unwrap_or_else(|| self.default_behavior.clone());

        let count = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(count, Ordering::SeqCst);
        let _guard = ActiveGuard(self);

        let _ = self.start_tx.send(StartEvent {
            input_path: job.input_path.clone(),
            device: job.device,
        });

        match behavior {
            Behavior::Succeed => self.finish(job).await,
            Behavior::Fail(reason) => Err(EngineError::Failed(reason)),
            Behavior::Crash { times } => {
                let crashes_so_far = {
                    let mut counts = self.crash_counts.lock().unwrap();
                    let entry = counts.entry(job.input_path.clone()).or_insert(0);
                    if *entry < times {
                        *entry += 1;
                        None
                    } else {
                        Some(*entry)
                    }
                };
                if crashes_so_far.is_none() {
                    panic!("scripted worker crash");
                }
                self.finish(job).await
            }
            Behavior::Gate | Behavior::GateWithProgress { .. } => {
                if let Behavior::GateWithProgress { percent, stage } = &behavior {
                    let _ = progress
                        .send(ProgressUpdate {
                            percent: *percent,
                            stage: stage.clone(),
                        })
                        .await;
                }
                tokio::select! {
                    _ = cancel.cancelled() => Err(EngineError::Cancelled),
                    permit = self.gate.acquire() => {
                        permit.expect("gate semaphore closed").forget();
                        self.finish(job).await
                    }
                }
            }
        }
    }
}

/// Await the next engine start, panicking after the wait budget.
pub async fn expect_start(rx: &mut mpsc::UnboundedReceiver<StartEvent>) -> StartEvent {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for a task to start")
        .expect("start channel closed")
}

/// Assert that nothing starts within a short window.
pub async fn expect_no_start(rx: &mut mpsc::UnboundedReceiver<StartEvent>) {
    let result = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
    assert!(result.is_err(), "unexpected task start: {:?}", result);
}
