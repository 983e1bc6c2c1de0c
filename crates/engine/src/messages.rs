//! Engine sidecar NDJSON message types and parser.
//!
//! The sidecar streams one JSON object per line with the shape
//! `{"type": "<kind>", "data": {...}}`. This module deserializes them into
//! a strongly-typed [`EngineMessage`] enum.

use serde::Deserialize;

use crate::OutputFiles;

/// All known engine stream message types.
///
/// Deserialized via the internally-tagged `"type"` field with associated
/// `"data"` content.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum EngineMessage {
    /// Progress update from a long-running separation stage.
    #[serde(rename = "progress")]
    Progress(ProgressData),

    /// Separation finished; output files are final.
    #[serde(rename = "completed")]
    Completed(CompletedData),

    /// Separation failed.
    #[serde(rename = "error")]
    Error(ErrorData),
}

/// Payload for `progress` messages.
#[derive(Debug, Clone, Deserialize)]
pub struct ProgressData {
    /// Overall progress in `[0, 100]`.
    pub percent: f32,
    /// Free-text stage label.
    #[serde(default)]
    pub stage: String,
}

/// Payload for `completed` messages.
#[derive(Debug, Clone, Deserialize)]
pub struct CompletedData {
    /// Output label -> file path written by the engine.
    pub outputs: OutputFiles,
}

/// Payload for `error` messages.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorData {
    pub message: String,
}

/// Parse one NDJSON line into a typed message.
///
/// Returns `Err` for malformed JSON or unknown `type` values. Callers
/// should log unknown types and continue reading the stream.
pub fn parse_message(text: &str) -> Result<EngineMessage, serde_json::Error> {
    serde_json::from_str(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_progress() {
        let msg =
            parse_message(r#"{"type":"progress","data":{"percent":35.5,"stage":"Demixing"}}"#)
                .unwrap();
        match msg {
            EngineMessage::Progress(data) => {
                assert!((data.percent - 35.5).abs() < f32::EPSILON);
                assert_eq!(data.stage, "Demixing");
            }
            other => panic!("expected progress, got {other:?}"),
        }
    }

    #[test]
    fn parses_progress_without_stage() {
        let msg = parse_message(r#"{"type":"progress","data":{"percent":10.0}}"#).unwrap();
        match msg {
            EngineMessage::Progress(data) => assert!(data.stage.is_empty()),
            other => panic!("expected progress, got {other:?}"),
        }
    }

    #[test]
    fn parses_completed() {
        let msg = parse_message(
            r#"{"type":"completed","data":{"outputs":{"vocals":"/out/vocals.wav","drums":"/out/drums.wav"}}}"#,
        )
        .unwrap();
        match msg {
            EngineMessage::Completed(data) => {
                assert_eq!(data.outputs.len(), 2);
                assert_eq!(data.outputs["vocals"], "/out/vocals.wav");
            }
            other => panic!("expected completed, got {other:?}"),
        }
    }

    #[test]
    fn parses_error() {
        let msg =
            parse_message(r#"{"type":"error","data":{"message":"Cannot read audio file"}}"#)
                .unwrap();
        match msg {
            EngineMessage::Error(data) => assert_eq!(data.message, "Cannot read audio file"),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_type() {
        assert!(parse_message(r#"{"type":"heartbeat","data":{}}"#).is_err());
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(parse_message("not json").is_err());
        assert!(parse_message("").is_err());
    }
}
