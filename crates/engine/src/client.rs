//! HTTP client for a remote separation engine sidecar.
//!
//! [`RemoteEngine`] submits a job with `POST /v1/separate` and reads the
//! response body as an NDJSON event stream (`progress` / `completed` /
//! `error`). Cancellation stops reading and fires a best-effort
//! `POST /v1/interrupt`; the sidecar is free to ignore it.

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use demix_core::types::TaskId;

use crate::messages::{parse_message, EngineMessage};
use crate::{EngineError, InferenceEngine, OutputFiles, ProgressUpdate, SeparationJob};

/// HTTP client for a single engine sidecar.
pub struct RemoteEngine {
    client: reqwest::Client,
    api_url: String,
}

impl RemoteEngine {
    /// Create a new client.
    ///
    /// * `api_url` - Base HTTP URL, e.g. `http://host:9188`.
    pub fn new(api_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url,
        }
    }

    /// Create a client reusing an existing [`reqwest::Client`] (useful for
    /// connection pooling across several sidecars).
    pub fn with_client(client: reqwest::Client, api_url: String) -> Self {
        Self { client, api_url }
    }

    /// Base HTTP API URL.
    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Ask the sidecar to interrupt a running separation. Best-effort: a
    /// failure here only means the engine keeps running to completion.
    async fn interrupt(&self, task_id: TaskId) {
        let body = serde_json::json!({ "task_id": task_id });
        let result = self
            .client
            .post(format!("{}/v1/interrupt", self.api_url))
            .json(&body)
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => {
                tracing::info!(task_id = %task_id, "Engine interrupt requested");
            }
            Ok(response) => {
                tracing::warn!(
                    task_id = %task_id,
                    status = response.status().as_u16(),
                    "Engine interrupt rejected",
                );
            }
            Err(e) => {
                tracing::warn!(task_id = %task_id, error = %e, "Engine interrupt failed");
            }
        }
    }
}

/// Pop one complete line from the front of `buf`, if any.
fn take_line(buf: &mut Vec<u8>) -> Option<String> {
    let pos = buf.iter().position(|&b| b == b'\n')?;
    let line: Vec<u8> = buf.drain(..=pos).collect();
    Some(String::from_utf8_lossy(&line).trim().to_string())
}

#[async_trait::async_trait]
impl InferenceEngine for RemoteEngine {
    async fn separate(
        &self,
        job: &SeparationJob,
        progress: mpsc::Sender<ProgressUpdate>,
        cancel: CancellationToken,
    ) -> Result<OutputFiles, EngineError> {
        let body = serde_json::json!({
            "task_id": job.task_id,
            "input_path": job.input_path,
            "output_dir": job.output_dir,
            "device": job.device.to_string(),
            "model_type": job.request.model_type,
            "instruments": job.request.instruments,
            "use_tta": job.request.use_tta,
            "extract_instrumental": job.request.extract_instrumental,
            "output_format": job.request.output_format.as_str(),
            "pcm_type": job.request.pcm_type.as_str(),
        });

        let response = self
            .client
            .post(format!("{}/v1/separate", self.api_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::Connection(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(EngineError::Failed(format!(
                "engine rejected job ({status}): {body}"
            )));
        }

        let mut stream = response.bytes_stream();
        let mut buf: Vec<u8> = Vec::new();

        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => {
                    self.interrupt(job.task_id).await;
                    return Err(EngineError::Cancelled);
                }
                chunk = stream.next() => chunk,
            };

            let Some(chunk) = chunk else {
                break;
            };
            let chunk = chunk.map_err(|e| EngineError::Connection(e.to_string()))?;
            buf.extend_from_slice(&chunk);

            while let Some(line) = take_line(&mut buf) {
                if line.is_empty() {
                    continue;
                }
                match parse_message(&line) {
                    Ok(EngineMessage::Progress(data)) => {
                        let _ = progress
                            .send(ProgressUpdate {
                                percent: data.percent,
                                stage: data.stage,
                            })
                            .await;
                    }
                    Ok(EngineMessage::Completed(data)) => {
                        return Ok(data.outputs);
                    }
                    Ok(EngineMessage::Error(data)) => {
                        return Err(EngineError::Failed(data.message));
                    }
                    Err(e) => {
                        tracing::warn!(
                            task_id = %job.task_id,
                            error = %e,
                            raw_message = %line,
                            "Failed to parse engine message",
                        );
                    }
                }
            }
        }

        Err(EngineError::Protocol(
            "engine stream ended without a terminal message".to_string(),
        ))
    }
}
