//! Orchestration core for the separation service.
//!
//! Wires the task orchestrator, the device-aware worker pool, and the
//! retention sweeper over a shared record store. The excluded HTTP layer
//! embeds [`SeparationService`] and translates its results into responses;
//! nothing in this crate knows about transports.

pub mod config;
pub mod orchestrator;
pub mod pool;
pub mod service;
pub mod sweeper;

pub use config::ServiceConfig;
pub use orchestrator::{CrashDisposition, TaskOrchestrator, TaskOutcome};
pub use pool::{WorkerPool, WorkerPoolConfig};
pub use service::SeparationService;
pub use sweeper::{RetentionConfig, RetentionSweeper, SweepReport};
