//! Service facade wiring the orchestrator, worker pool, rate limiter, and
//! retention sweeper over one record store.
//!
//! [`SeparationService::start`] performs the startup sequence: build the
//! orchestrator, start the pool, resume work left over from a prior run,
//! then start the sweeper. The embedding HTTP layer calls the operations
//! below and owns nothing else.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use demix_core::error::CoreError;
use demix_core::rate_limit::{Decision, RateLimiter};
use demix_core::separation::SeparationRequest;
use demix_core::types::TaskId;
use demix_db::models::TaskRecord;
use demix_db::TaskStore;
use demix_engine::{InferenceEngine, OutputFiles};

use crate::config::ServiceConfig;
use crate::orchestrator::TaskOrchestrator;
use crate::pool::{WorkerPool, WorkerPoolConfig};
use crate::sweeper::{RetentionConfig, RetentionSweeper};

/// How long shutdown waits for the sweeper task to exit.
const SWEEPER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// The separation service: everything behind the (external) HTTP surface.
pub struct SeparationService {
    orchestrator: Arc<TaskOrchestrator>,
    pool: Arc<WorkerPool>,
    limiter: RateLimiter,
    sweeper_cancel: CancellationToken,
    sweeper_handle: Mutex<Option<JoinHandle<()>>>,
}

impl SeparationService {
    /// Start the service over the given store and engine.
    ///
    /// Tasks left `pending`/`processing` by a prior run are reset and
    /// resubmitted before this returns.
    pub async fn start(
        config: ServiceConfig,
        store: Arc<dyn TaskStore>,
        engine: Arc<dyn InferenceEngine>,
    ) -> Result<Self, CoreError> {
        let orchestrator = Arc::new(TaskOrchestrator::new(
            Arc::clone(&store),
            PathBuf::from(&config.output_dir),
        ));

        let pool = WorkerPool::start(
            WorkerPoolConfig {
                workers: config.workers,
                devices: config.devices(),
                queue_depth: config.queue_depth,
                drain_timeout: Some(config.drain_timeout()),
            },
            engine,
            Arc::clone(&orchestrator),
        );

        let resumed = orchestrator.resume_incomplete().await?;
        for id in resumed {
            pool.submit_wait(id).await?;
        }

        let limiter = config.rate_limiter();

        let sweeper_cancel = CancellationToken::new();
        let sweeper_handle = if config.cleanup.enabled {
            let sweeper = RetentionSweeper::new(
                store,
                Arc::clone(&orchestrator),
                RetentionConfig::from(&config.cleanup),
                Duration::from_secs(config.cleanup.interval_secs),
            );
            let cancel = sweeper_cancel.clone();
            Some(tokio::spawn(async move { sweeper.run(cancel).await }))
        } else {
            None
        };

        tracing::info!("Separation service started");
        Ok(Self {
            orchestrator,
            pool,
            limiter,
            sweeper_cancel,
            sweeper_handle: Mutex::new(sweeper_handle),
        })
    }

    /// Admission check for a caller identity. The HTTP layer calls this
    /// before [`submit`](Self::submit) and turns a denial into a 429 with
    /// the returned retry-after.
    pub fn admit(&self, key: &str) -> Decision {
        self.limiter.check(key)
    }

    /// The injected rate limiter (reset is an operational utility).
    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Validate, persist, and enqueue a new task.
    ///
    /// Returns before execution begins. Fails with `CapacityExceeded` when
    /// the pending queue is full -- no record is created in that case, so
    /// the caller can simply retry later.
    pub async fn submit(
        &self,
        request: SeparationRequest,
        input_path: String,
        file_size_bytes: i64,
    ) -> Result<TaskId, CoreError> {
        let permit = self.pool.reserve()?;
        let record = self
            .orchestrator
            .create(request, input_path, file_size_bytes)
            .await?;
        permit.send(record.id);
        Ok(record.id)
    }

    /// Current record for a task.
    pub async fn status(&self, id: TaskId) -> Result<TaskRecord, CoreError> {
        self.orchestrator.get(id).await
    }

    /// Output map of a completed task (`Conflict`/`Gone` otherwise).
    pub async fn results(&self, id: TaskId) -> Result<OutputFiles, CoreError> {
        self.orchestrator.results(id).await
    }

    /// Cancel a task; see [`TaskOrchestrator::cancel`] for the semantics.
    pub async fn cancel(&self, id: TaskId) -> Result<bool, CoreError> {
        self.orchestrator.cancel(id).await
    }

    /// Stop the service: pool first (optionally draining), then sweeper.
    pub async fn shutdown(&self, drain: bool) {
        self.pool.shutdown(drain).await;

        self.sweeper_cancel.cancel();
        let handle = self
            .sweeper_handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = tokio::time::timeout(SWEEPER_STOP_TIMEOUT, handle).await;
        }

        tracing::info!("Separation service shut down");
    }
}
