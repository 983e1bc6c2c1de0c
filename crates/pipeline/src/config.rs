//! Service configuration loaded from environment variables.
//!
//! All fields have defaults suitable for local development. Configuration is
//! read once at startup; changing a value requires a restart.

use std::time::Duration;

use demix_core::device::{parse_device_ids, Device};
use demix_core::rate_limit::{RateLimiter, DEFAULT_WINDOW};

/// Task cleanup / retention settings.
#[derive(Debug, Clone)]
pub struct CleanupConfig {
    /// Whether the retention sweeper runs at all.
    pub enabled: bool,
    /// Sweep period in seconds.
    pub interval_secs: u64,
    /// Hours to retain a completed task's artifacts.
    pub completed_retention_hours: i64,
    /// Hours to retain a failed (or cancelled) task's artifacts.
    pub failed_retention_hours: i64,
    /// Days to retain task metadata after the task finished.
    pub metadata_retention_days: i64,
}

/// Rate limiting settings.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub requests_per_hour: usize,
}

/// Complete service configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Maximum concurrent separations (default: `1`).
    pub workers: usize,
    /// GPU device ids to schedule onto; empty means CPU-only.
    pub device_ids: Vec<u32>,
    /// Pending queue depth before submissions are rejected (default: `64`).
    pub queue_depth: usize,
    /// Directory uploads are staged into.
    pub upload_dir: String,
    /// Root directory separated stems are written under (one subdirectory
    /// per task).
    pub output_dir: String,
    /// How long a draining shutdown waits before force-cancelling work.
    pub drain_timeout_secs: u64,
    pub cleanup: CleanupConfig,
    pub rate_limit: RateLimitConfig,
}

impl ServiceConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                     | Default          |
    /// |-----------------------------|------------------|
    /// | `WORKERS`                   | `1`              |
    /// | `DEVICE_IDS`                | `` (CPU-only)    |
    /// | `QUEUE_DEPTH`               | `64`             |
    /// | `UPLOAD_DIR`                | `./api_uploads`  |
    /// | `OUTPUT_DIR`                | `./api_outputs`  |
    /// | `DRAIN_TIMEOUT_SECS`        | `30`             |
    /// | `CLEANUP_ENABLED`           | `true`           |
    /// | `CLEANUP_INTERVAL_SECS`     | `3600`           |
    /// | `COMPLETED_RETENTION_HOURS` | `24`             |
    /// | `FAILED_RETENTION_HOURS`    | `24`             |
    /// | `METADATA_RETENTION_DAYS`   | `7`              |
    /// | `RATE_LIMIT_ENABLED`        | `false`          |
    /// | `RATE_LIMIT_PER_HOUR`       | `100`            |
    pub fn from_env() -> Self {
        let workers: usize = env_or("WORKERS", "1")
            .parse()
            .expect("WORKERS must be a valid usize");

        let device_ids =
            parse_device_ids(&env_or("DEVICE_IDS", "")).expect("DEVICE_IDS must be a comma-separated list of GPU ids");

        let queue_depth: usize = env_or("QUEUE_DEPTH", "64")
            .parse()
            .expect("QUEUE_DEPTH must be a valid usize");

        let drain_timeout_secs: u64 = env_or("DRAIN_TIMEOUT_SECS", "30")
            .parse()
            .expect("DRAIN_TIMEOUT_SECS must be a valid u64");

        let cleanup = CleanupConfig {
            enabled: env_or("CLEANUP_ENABLED", "true")
                .parse()
                .expect("CLEANUP_ENABLED must be true or false"),
            interval_secs: env_or("CLEANUP_INTERVAL_SECS", "3600")
                .parse()
                .expect("CLEANUP_INTERVAL_SECS must be a valid u64"),
            completed_retention_hours: env_or("COMPLETED_RETENTION_HOURS", "24")
                .parse()
                .expect("COMPLETED_RETENTION_HOURS must be a valid i64"),
            failed_retention_hours: env_or("FAILED_RETENTION_HOURS", "24")
                .parse()
                .expect("FAILED_RETENTION_HOURS must be a valid i64"),
            metadata_retention_days: env_or("METADATA_RETENTION_DAYS", "7")
                .parse()
                .expect("METADATA_RETENTION_DAYS must be a valid i64"),
        };

        let rate_limit = RateLimitConfig {
            enabled: env_or("RATE_LIMIT_ENABLED", "false")
                .parse()
                .expect("RATE_LIMIT_ENABLED must be true or false"),
            requests_per_hour: env_or("RATE_LIMIT_PER_HOUR", "100")
                .parse()
                .expect("RATE_LIMIT_PER_HOUR must be a valid usize"),
        };

        Self {
            workers,
            device_ids,
            queue_depth,
            upload_dir: env_or("UPLOAD_DIR", "./api_uploads"),
            output_dir: env_or("OUTPUT_DIR", "./api_outputs"),
            drain_timeout_secs,
            cleanup,
            rate_limit,
        }
    }

    /// The configured GPU devices, in scheduling order.
    pub fn devices(&self) -> Vec<Device> {
        self.device_ids.iter().map(|&id| Device::Cuda(id)).collect()
    }

    /// Build the admission limiter this configuration describes.
    pub fn rate_limiter(&self) -> RateLimiter {
        if self.rate_limit.enabled {
            RateLimiter::new(self.rate_limit.requests_per_hour, DEFAULT_WINDOW)
        } else {
            RateLimiter::disabled()
        }
    }

    /// Drain timeout as a [`Duration`].
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            device_ids: Vec::new(),
            queue_depth: 64,
            upload_dir: "./api_uploads".to_string(),
            output_dir: "./api_outputs".to_string(),
            drain_timeout_secs: 30,
            cleanup: CleanupConfig {
                enabled: true,
                interval_secs: 3600,
                completed_retention_hours: 24,
                failed_retention_hours: 24,
                metadata_retention_days: 7,
            },
            rate_limit: RateLimitConfig {
                enabled: false,
                requests_per_hour: 100,
            },
        }
    }
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}
