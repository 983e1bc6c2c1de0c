//! Sliding-window admission control keyed by caller identity.
//!
//! The limiter counts admitted requests inside a trailing window per key.
//! It is an explicitly owned instance: constructed at startup, injected
//! into the service, torn down with it. State is process-local; a
//! multi-process deployment would back the same interface with a shared
//! counter store.
//!
//! Locking is fine-grained: a shared read lock finds the per-key window,
//! and each window has its own mutex, so distinct keys never contend.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

/// Default trailing window length.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(3600);

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Whether the request is admitted.
    pub allowed: bool,
    /// When denied, seconds until the oldest request leaves the window.
    pub retry_after_secs: Option<u64>,
}

impl Decision {
    fn allowed() -> Self {
        Self {
            allowed: true,
            retry_after_secs: None,
        }
    }

    fn denied(retry_after_secs: u64) -> Self {
        Self {
            allowed: false,
            retry_after_secs: Some(retry_after_secs),
        }
    }
}

type Window = Arc<Mutex<VecDeque<Instant>>>;

/// Per-key sliding-window rate limiter.
pub struct RateLimiter {
    enabled: bool,
    limit: usize,
    window: Duration,
    keys: RwLock<HashMap<String, Window>>,
}

impl RateLimiter {
    /// Create an enabled limiter allowing `limit` requests per `window`.
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            enabled: true,
            limit,
            window,
            keys: RwLock::new(HashMap::new()),
        }
    }

    /// Create a limiter that always admits and keeps no state.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            limit: 0,
            window: Duration::ZERO,
            keys: RwLock::new(HashMap::new()),
        }
    }

    /// Whether this limiter actually enforces a limit.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Check and record an admission for `key`.
    pub fn check(&self, key: &str) -> Decision {
        if !self.enabled {
            return Decision::allowed();
        }
        self.check_at(key, Instant::now())
    }

    /// Clear all per-key counters.
    pub fn reset(&self) {
        self.keys
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    // ---- internals ----

    fn window_for(&self, key: &str) -> Window {
        if let Some(window) = self
            .keys
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
        {
            return Arc::clone(window);
        }
        let mut keys = self.keys.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(keys.entry(key.to_string()).or_default())
    }

    fn check_at(&self, key: &str, now: Instant) -> Decision {
        let window = self.window_for(key);
        let mut events = window.lock().unwrap_or_else(|e| e.into_inner());

        // Expire events that have slid out of the trailing window.
        while let Some(&oldest) = events.front() {
            if now.duration_since(oldest) >= self.window {
                events.pop_front();
            } else {
                break;
            }
        }

        if events.len() < self.limit {
            events.push_back(now);
            return Decision::allowed();
        }

        // Full window: compute seconds until the oldest event expires.
        let retry_after = match events.front() {
            Some(&oldest) => {
                let elapsed = now.duration_since(oldest);
                let remaining = self.window.saturating_sub(elapsed);
                // Round up so callers never retry too early.
                remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0)
            }
            None => 0,
        };
        Decision::denied(retry_after.max(1))
    }
}
