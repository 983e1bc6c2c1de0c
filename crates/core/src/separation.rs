//! Separation request parameters and structural validation.
//!
//! Validation here is structural only (lengths, character sets, closed
//! enums, duplicates). Whether a model type actually exists is the model
//! registry's concern and is checked by that collaborator, not here.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

/// Maximum length of a model type identifier.
pub const MAX_MODEL_TYPE_LEN: usize = 128;

/// Maximum number of instruments a request may ask for.
pub const MAX_INSTRUMENTS: usize = 16;

/// Maximum length of a single instrument name.
pub const MAX_INSTRUMENT_LEN: usize = 64;

// ---------------------------------------------------------------------------
// OutputFormat
// ---------------------------------------------------------------------------

/// Audio container format for separated stems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Wav,
    Flac,
}

impl OutputFormat {
    /// Return the string representation (also the file extension).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Wav => "wav",
            Self::Flac => "flac",
        }
    }

    /// Parse from a string, returning an error for unknown formats.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "wav" => Ok(Self::Wav),
            "flac" => Ok(Self::Flac),
            other => Err(CoreError::Validation(format!(
                "Unknown output format: '{other}'. Valid formats: wav, flac"
            ))),
        }
    }
}

impl Default for OutputFormat {
    fn default() -> Self {
        Self::Wav
    }
}

// ---------------------------------------------------------------------------
// PcmType
// ---------------------------------------------------------------------------

/// PCM sample encoding for output files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PcmType {
    #[serde(rename = "PCM_16")]
    Pcm16,
    #[serde(rename = "PCM_24")]
    Pcm24,
}

impl PcmType {
    /// Return the string representation used in storage and APIs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pcm16 => "PCM_16",
            Self::Pcm24 => "PCM_24",
        }
    }

    /// Parse from a string, returning an error for unknown types.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "PCM_16" => Ok(Self::Pcm16),
            "PCM_24" => Ok(Self::Pcm24),
            other => Err(CoreError::Validation(format!(
                "Unknown PCM type: '{other}'. Valid types: PCM_16, PCM_24"
            ))),
        }
    }
}

impl Default for PcmType {
    fn default() -> Self {
        Self::Pcm24
    }
}

// ---------------------------------------------------------------------------
// SeparationRequest
// ---------------------------------------------------------------------------

/// Immutable parameters of a separation task, fixed at creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeparationRequest {
    /// Model type identifier (e.g. `mdx23c`).
    pub model_type: String,
    /// Instruments to separate (e.g. `vocals`, `drums`).
    pub instruments: Vec<String>,
    /// Apply test-time augmentation (slower, slightly better quality).
    #[serde(default)]
    pub use_tta: bool,
    /// Additionally derive an instrumental stem from the mix.
    #[serde(default)]
    pub extract_instrumental: bool,
    /// Output container format.
    #[serde(default)]
    pub output_format: OutputFormat,
    /// PCM encoding for output files.
    #[serde(default)]
    pub pcm_type: PcmType,
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a model type identifier.
///
/// Rules:
/// - Must not be empty.
/// - Must not exceed `MAX_MODEL_TYPE_LEN` characters.
/// - Must contain only alphanumeric, hyphen, underscore, or dot characters.
pub fn validate_model_type(model_type: &str) -> Result<(), CoreError> {
    if model_type.is_empty() {
        return Err(CoreError::Validation(
            "Model type must not be empty".to_string(),
        ));
    }
    if model_type.len() > MAX_MODEL_TYPE_LEN {
        return Err(CoreError::Validation(format!(
            "Model type must not exceed {MAX_MODEL_TYPE_LEN} characters"
        )));
    }
    if !model_type
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(CoreError::Validation(
            "Model type may only contain alphanumeric, hyphen, underscore, or dot characters"
                .to_string(),
        ));
    }
    Ok(())
}

/// Validate a requested instrument list.
///
/// Rules:
/// - At least one instrument.
/// - At most `MAX_INSTRUMENTS` instruments.
/// - Each name must not be empty and must not exceed `MAX_INSTRUMENT_LEN`
///   characters.
/// - No duplicates.
pub fn validate_instruments(instruments: &[String]) -> Result<(), CoreError> {
    if instruments.is_empty() {
        return Err(CoreError::Validation(
            "At least one instrument must be requested".to_string(),
        ));
    }
    if instruments.len() > MAX_INSTRUMENTS {
        return Err(CoreError::Validation(format!(
            "A request may ask for at most {MAX_INSTRUMENTS} instruments"
        )));
    }
    for (i, name) in instruments.iter().enumerate() {
        if name.is_empty() {
            return Err(CoreError::Validation(format!(
                "Instrument at index {i} must not be empty"
            )));
        }
        if name.len() > MAX_INSTRUMENT_LEN {
            return Err(CoreError::Validation(format!(
                "Instrument at index {i} exceeds {MAX_INSTRUMENT_LEN} characters"
            )));
        }
    }

    let mut seen = std::collections::HashSet::with_capacity(instruments.len());
    for name in instruments {
        if !seen.insert(name.as_str()) {
            return Err(CoreError::Validation(format!(
                "Duplicate instrument: \"{name}\""
            )));
        }
    }

    Ok(())
}

/// Validate a full separation request structurally.
pub fn validate_request(request: &SeparationRequest) -> Result<(), CoreError> {
    validate_model_type(&request.model_type)?;
    validate_instruments(&request.instruments)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
