//! Compute device identifiers for worker scheduling.
//!
//! A device is either the shared CPU or a single CUDA GPU. The worker pool
//! binds at most one concurrent execution to each device to avoid memory
//! exhaustion on the card.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// A compute device a task can be dispatched onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Device {
    Cpu,
    Cuda(u32),
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cpu => f.write_str("cpu"),
            Self::Cuda(id) => write!(f, "cuda:{id}"),
        }
    }
}

impl Device {
    /// Parse a device string (`cpu` or `cuda:<id>`).
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        if s == "cpu" {
            return Ok(Self::Cpu);
        }
        if let Some(id) = s.strip_prefix("cuda:") {
            let id: u32 = id.parse().map_err(|_| {
                CoreError::Validation(format!("Invalid CUDA device id in '{s}'"))
            })?;
            return Ok(Self::Cuda(id));
        }
        Err(CoreError::Validation(format!(
            "Unknown device '{s}'. Expected 'cpu' or 'cuda:<id>'"
        )))
    }
}

/// Parse a comma-separated list of GPU device ids (e.g. `"0,1"`).
///
/// An empty string yields an empty list, which means CPU-only operation.
pub fn parse_device_ids(csv: &str) -> Result<Vec<u32>, CoreError> {
    let mut ids = Vec::new();
    for part in csv.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let id: u32 = part.parse().map_err(|_| {
            CoreError::Validation(format!("Invalid device id '{part}' in device list"))
        })?;
        if ids.contains(&id) {
            return Err(CoreError::Validation(format!(
                "Duplicate device id {id} in device list"
            )));
        }
        ids.push(id);
    }
    Ok(ids)
}
