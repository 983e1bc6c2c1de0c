//! Bounded-concurrency worker pool with device-aware scheduling.
//!
//! A single dispatcher loop pulls task ids off a bounded FIFO queue,
//! acquires a concurrency permit and a device slot, transitions the task to
//! `processing`, and spawns the execution. Each execution runs in its own
//! task under a supervisor, so a panic inside one separation can never take
//! down the pool or touch other in-flight work.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use demix_core::device::Device;
use demix_core::error::CoreError;
use demix_core::types::TaskId;
use demix_db::models::TaskRecord;
use demix_engine::{EngineError, InferenceEngine, ProgressUpdate, SeparationJob};

use crate::orchestrator::{CrashDisposition, TaskOrchestrator, TaskOutcome};

/// Buffer size for the per-execution progress channel.
const PROGRESS_CHANNEL_CAPACITY: usize = 32;

/// How long shutdown waits for cancelled work to stop before giving up.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Worker pool configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Maximum concurrent executions.
    pub workers: usize,
    /// GPU devices to schedule onto. Empty means CPU-only, where `workers`
    /// alone caps concurrency (typically 1 to avoid memory exhaustion --
    /// the pool enforces the configured value, it does not infer one).
    pub devices: Vec<Device>,
    /// Pending queue depth before submissions fail with CapacityExceeded.
    pub queue_depth: usize,
    /// How long a draining shutdown waits before force-cancelling work.
    /// `None` waits indefinitely.
    pub drain_timeout: Option<Duration>,
}

impl WorkerPoolConfig {
    /// Effective concurrency: with GPUs configured, each device runs at
    /// most one execution, so the device count caps the worker count.
    pub fn concurrency(&self) -> usize {
        let workers = self.workers.max(1);
        if self.devices.is_empty() {
            workers
        } else {
            workers.min(self.devices.len())
        }
    }
}

// ---------------------------------------------------------------------------
// Device slot table
// ---------------------------------------------------------------------------

/// Fixed table of device slots with a round-robin cursor.
///
/// Assignment happens at dispatch time, not submit time, so device choice
/// follows the true FIFO order in which executions start.
struct DeviceTable {
    slots: Vec<DeviceSlot>,
    cursor: usize,
}

struct DeviceSlot {
    device: Device,
    busy: bool,
}

impl DeviceTable {
    fn new(config: &WorkerPoolConfig) -> Self {
        let slots = if config.devices.is_empty() {
            (0..config.concurrency())
                .map(|_| DeviceSlot {
                    device: Device::Cpu,
                    busy: false,
                })
                .collect()
        } else {
            config
                .devices
                .iter()
                .map(|&device| DeviceSlot {
                    device,
                    busy: false,
                })
                .collect()
        };
        Self { slots, cursor: 0 }
    }

    /// Take the next free slot, round-robin from the cursor.
    fn acquire(&mut self) -> Option<(usize, Device)> {
        let len = self.slots.len();
        for offset in 0..len {
            let idx = (self.cursor + offset) % len;
            if !self.slots[idx].busy {
                self.slots[idx].busy = true;
                self.cursor = (idx + 1) % len;
                return Some((idx, self.slots[idx].device));
            }
        }
        None
    }

    fn release(&mut self, index: usize) {
        self.slots[index].busy = false;
    }
}

type SharedDevices = Arc<Mutex<DeviceTable>>;

fn lock_devices(devices: &SharedDevices) -> std::sync::MutexGuard<'_, DeviceTable> {
    devices.lock().unwrap_or_else(|e| e.into_inner())
}

// ---------------------------------------------------------------------------
// WorkerPool
// ---------------------------------------------------------------------------

/// Handle to a running worker pool.
pub struct WorkerPool {
    tx: mpsc::Sender<TaskId>,
    shutting_down: AtomicBool,
    /// Stops the dispatcher; queued tasks stay pending for restart resume.
    admission_cancel: CancellationToken,
    /// Master token; cancelling it propagates to every execution.
    cancel: CancellationToken,
    tracker: TaskTracker,
    drain_timeout: Option<Duration>,
}

impl WorkerPool {
    /// Spawn the dispatcher and return a shared pool handle.
    pub fn start(
        config: WorkerPoolConfig,
        engine: Arc<dyn InferenceEngine>,
        orchestrator: Arc<TaskOrchestrator>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(config.queue_depth.max(1));
        let admission_cancel = CancellationToken::new();
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        let dispatcher = Dispatcher {
            rx,
            requeue_tx: tx.clone(),
            engine,
            orchestrator,
            devices: Arc::new(Mutex::new(DeviceTable::new(&config))),
            semaphore: Arc::new(Semaphore::new(config.concurrency())),
            tracker: tracker.clone(),
            admission_cancel: admission_cancel.clone(),
            cancel: cancel.clone(),
        };
        tokio::spawn(dispatcher.run());

        tracing::info!(
            workers = config.concurrency(),
            devices = config.devices.len(),
            queue_depth = config.queue_depth,
            "Worker pool started",
        );

        Arc::new(Self {
            tx,
            shutting_down: AtomicBool::new(false),
            admission_cancel,
            cancel,
            tracker,
            drain_timeout: config.drain_timeout,
        })
    }

    /// Reserve a queue slot, failing fast when the queue is full.
    ///
    /// The caller persists the task record while holding the permit, then
    /// sends the id through it, so a task is never stored without a
    /// guaranteed queue position.
    pub(crate) fn reserve(&self) -> Result<mpsc::Permit<'_, TaskId>, CoreError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(CoreError::Conflict(
                "Worker pool is shutting down".to_string(),
            ));
        }
        self.tx.try_reserve().map_err(|e| match e {
            mpsc::error::TrySendError::Full(()) => CoreError::CapacityExceeded(
                "Task queue is full; retry later".to_string(),
            ),
            mpsc::error::TrySendError::Closed(()) => {
                CoreError::Conflict("Worker pool is shut down".to_string())
            }
        })
    }

    /// Enqueue a task id, waiting for queue capacity. Used by restart
    /// resume, which may requeue more tasks than the queue depth.
    pub(crate) async fn submit_wait(&self, id: TaskId) -> Result<(), CoreError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(CoreError::Conflict(
                "Worker pool is shutting down".to_string(),
            ));
        }
        self.tx
            .send(id)
            .await
            .map_err(|_| CoreError::Conflict("Worker pool is shut down".to_string()))
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Stop the pool.
    ///
    /// With `drain`, waits for in-flight executions to finish (bounded by
    /// the configured drain timeout, after which they are cancelled and
    /// reported as failed with a shutdown reason). Without `drain`,
    /// in-flight work is cancelled immediately. Either way, queued tasks
    /// that never started stay `pending` and are picked up by restart
    /// resume.
    pub async fn shutdown(&self, drain: bool) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            tracing::warn!("Worker pool already shutting down");
            return;
        }
        tracing::info!(drain, "Shutting down worker pool");

        self.admission_cancel.cancel();
        self.tracker.close();

        if drain {
            match self.drain_timeout {
                Some(timeout) => {
                    if tokio::time::timeout(timeout, self.tracker.wait())
                        .await
                        .is_err()
                    {
                        tracing::warn!("Drain timeout elapsed; cancelling in-flight work");
                        self.cancel.cancel();
                        self.wait_with_grace().await;
                    }
                }
                None => self.tracker.wait().await,
            }
        } else {
            self.cancel.cancel();
            self.wait_with_grace().await;
        }

        tracing::info!("Worker pool shut down complete");
    }

    async fn wait_with_grace(&self) {
        if tokio::time::timeout(SHUTDOWN_GRACE, self.tracker.wait())
            .await
            .is_err()
        {
            tracing::error!("In-flight work did not stop within the grace period");
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

struct Dispatcher {
    rx: mpsc::Receiver<TaskId>,
    requeue_tx: mpsc::Sender<TaskId>,
    engine: Arc<dyn InferenceEngine>,
    orchestrator: Arc<TaskOrchestrator>,
    devices: SharedDevices,
    semaphore: Arc<Semaphore>,
    tracker: TaskTracker,
    admission_cancel: CancellationToken,
    cancel: CancellationToken,
}

impl Dispatcher {
    /// Core dispatch loop. Serial by design: starts happen strictly in
    /// queue order, with device assignment at the moment a slot frees up.
    ///
    /// The permit is acquired before the queue is read so a task id never
    /// sits "in hand" outside the queue -- the configured depth is exact.
    async fn run(mut self) {
        loop {
            let permit = tokio::select! {
                _ = self.admission_cancel.cancelled() => break,
                permit = Arc::clone(&self.semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let id = tokio::select! {
                _ = self.admission_cancel.cancelled() => break,
                id = self.rx.recv() => match id {
                    Some(id) => id,
                    None => break,
                },
            };

            let Some((slot, device)) = lock_devices(&self.devices).acquire() else {
                tracing::error!(task_id = %id, "No free device slot despite a free permit");
                continue;
            };

            let (record, token) = match self.orchestrator.begin(id, device, &self.cancel).await {
                Ok(Some(begun)) => begun,
                Ok(None) => {
                    lock_devices(&self.devices).release(slot);
                    continue;
                }
                Err(e) => {
                    tracing::error!(task_id = %id, error = %e, "Failed to dispatch task");
                    lock_devices(&self.devices).release(slot);
                    continue;
                }
            };

            let handle = tokio::spawn(execute(
                Arc::clone(&self.engine),
                Arc::clone(&self.orchestrator),
                record,
                device,
                token,
                self.cancel.clone(),
            ));
            self.tracker.spawn(supervise(Supervised {
                handle,
                id,
                slot,
                permit,
                devices: Arc::clone(&self.devices),
                orchestrator: Arc::clone(&self.orchestrator),
                requeue_tx: self.requeue_tx.clone(),
            }));
        }
        tracing::info!("Dispatcher stopped");
    }
}

// ---------------------------------------------------------------------------
// Execution and supervision
// ---------------------------------------------------------------------------

/// Run one separation and report its terminal outcome.
///
/// Engine failure is an explicit `Err` branch here; only a panic escapes
/// this function, and the supervisor treats that as a worker crash.
async fn execute(
    engine: Arc<dyn InferenceEngine>,
    orchestrator: Arc<TaskOrchestrator>,
    record: TaskRecord,
    device: Device,
    token: CancellationToken,
    pool_cancel: CancellationToken,
) {
    let id = record.id;

    let (progress_tx, mut progress_rx) = mpsc::channel::<ProgressUpdate>(PROGRESS_CHANNEL_CAPACITY);
    let forwarder = tokio::spawn({
        let orchestrator = Arc::clone(&orchestrator);
        async move {
            while let Some(update) = progress_rx.recv().await {
                let stage = if update.stage.is_empty() {
                    None
                } else {
                    Some(update.stage.as_str())
                };
                orchestrator.report_progress(id, update.percent, stage).await;
            }
        }
    });

    let job = SeparationJob {
        task_id: id,
        input_path: record.input_path,
        output_dir: record.output_dir,
        device,
        request: record.request,
    };
    let result = engine.separate(&job, progress_tx, token).await;

    // Drain remaining progress before the terminal report so late updates
    // are not logged as stale.
    let _ = forwarder.await;

    let outcome = match result {
        Ok(outputs) => TaskOutcome::Completed(outputs),
        Err(EngineError::Cancelled) => {
            let user_requested = match orchestrator.get(id).await {
                Ok(record) => record.cancel_requested,
                Err(_) => false,
            };
            if user_requested {
                TaskOutcome::Cancelled
            } else if pool_cancel.is_cancelled() {
                TaskOutcome::Failed("Service shut down before completion".to_string())
            } else {
                TaskOutcome::Cancelled
            }
        }
        Err(e) => TaskOutcome::Failed(e.to_string()),
    };
    orchestrator.report_terminal(id, outcome).await;
}

struct Supervised {
    handle: JoinHandle<()>,
    id: TaskId,
    slot: usize,
    permit: tokio::sync::OwnedSemaphorePermit,
    devices: SharedDevices,
    orchestrator: Arc<TaskOrchestrator>,
    requeue_tx: mpsc::Sender<TaskId>,
}

/// Watch one execution, reclaim its slot, and apply crash recovery if the
/// worker panicked.
async fn supervise(ctx: Supervised) {
    let result = ctx.handle.await;

    lock_devices(&ctx.devices).release(ctx.slot);
    drop(ctx.permit);
    ctx.orchestrator.unregister_cancellation(ctx.id);

    match result {
        Ok(()) => {}
        Err(e) if e.is_panic() => {
            tracing::error!(task_id = %ctx.id, "Worker crashed during execution");
            match ctx.orchestrator.handle_worker_crash(ctx.id).await {
                CrashDisposition::Requeue => {
                    if ctx.requeue_tx.try_send(ctx.id).is_err() {
                        tracing::warn!(
                            task_id = %ctx.id,
                            "Could not requeue crashed task; it stays pending for restart resume",
                        );
                    }
                }
                CrashDisposition::Abandon => {}
            }
        }
        Err(e) => {
            tracing::error!(task_id = %ctx.id, error = %e, "Worker task aborted");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn config(workers: usize, devices: Vec<Device>) -> WorkerPoolConfig {
        WorkerPoolConfig {
            workers,
            devices,
            queue_depth: 8,
            drain_timeout: None,
        }
    }

    // -- WorkerPoolConfig::concurrency ---------------------------------------

    #[test]
    fn cpu_only_concurrency_is_worker_count() {
        assert_eq!(config(3, vec![]).concurrency(), 3);
    }

    #[test]
    fn device_count_caps_concurrency() {
        assert_eq!(
            config(4, vec![Device::Cuda(0), Device::Cuda(1)]).concurrency(),
            2
        );
    }

    #[test]
    fn worker_count_caps_devices() {
        let devices = vec![Device::Cuda(0), Device::Cuda(1), Device::Cuda(2)];
        assert_eq!(config(2, devices).concurrency(), 2);
    }

    #[test]
    fn zero_workers_rounds_up_to_one() {
        assert_eq!(config(0, vec![]).concurrency(), 1);
    }

    // -- DeviceTable ----------------------------------------------------------

    #[test]
    fn round_robin_alternates_devices() {
        let mut table = DeviceTable::new(&config(2, vec![Device::Cuda(0), Device::Cuda(1)]));

        let (slot_a, device_a) = table.acquire().unwrap();
        assert_eq!(device_a, Device::Cuda(0));
        let (_, device_b) = table.acquire().unwrap();
        assert_eq!(device_b, Device::Cuda(1));
        assert!(table.acquire().is_none());

        // Releasing the first device makes it available again, and the
        // cursor keeps rotating from where it left off.
        table.release(slot_a);
        let (_, device_c) = table.acquire().unwrap();
        assert_eq!(device_c, Device::Cuda(0));
    }

    #[test]
    fn at_most_one_execution_per_device() {
        let mut table = DeviceTable::new(&config(4, vec![Device::Cuda(0), Device::Cuda(1)]));
        assert!(table.acquire().is_some());
        assert!(table.acquire().is_some());
        assert!(table.acquire().is_none());
    }

    #[test]
    fn cpu_only_table_has_worker_slots() {
        let mut table = DeviceTable::new(&config(2, vec![]));
        let (_, a) = table.acquire().unwrap();
        let (_, b) = table.acquire().unwrap();
        assert_eq!(a, Device::Cpu);
        assert_eq!(b, Device::Cpu);
        assert!(table.acquire().is_none());
    }

    #[test]
    fn cursor_rotates_after_release() {
        let mut table =
            DeviceTable::new(&config(3, vec![Device::Cuda(0), Device::Cuda(1), Device::Cuda(2)]));
        let (slot_a, _) = table.acquire().unwrap();
        table.release(slot_a);
        // Cursor moved past device 0, so the next acquire picks device 1.
        let (_, device) = table.acquire().unwrap();
        assert_eq!(device, Device::Cuda(1));
    }
}
