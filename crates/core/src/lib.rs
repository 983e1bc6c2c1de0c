//! Pure domain logic for the demix separation service.
//!
//! This crate has zero internal dependencies: it is consumed by every other
//! workspace member and must stay free of persistence, networking, and
//! runtime concerns. It provides the error taxonomy, the task status state
//! machine, separation request validation, compute device types, and the
//! sliding-window rate limiter.

pub mod device;
pub mod error;
pub mod rate_limit;
pub mod separation;
pub mod task;
pub mod types;
