// SPDX-License-Identifier: MIT
// Hosted Sweep autocomplete client: Brotli-compressed JSON over HTTPS with
// bounded retry on transient failures.

use std::io::Write;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const DEFAULT_AUTOCOMPLETE_PATH: &str = "/backend/next_edit_autocomplete";
pub const DEFAULT_METRICS_PATH: &str = "/backend/track_autocomplete_metrics";

const MAX_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(150);

// Brotli parameters match what the hosted endpoint expects.
const BROTLI_QUALITY: u32 = 1;
const BROTLI_LGWIN: u32 = 22;

/// Request body for the autocomplete endpoint.
#[derive(Debug, Clone, Serialize, Default)]
pub struct AutocompleteRequest {
    pub debug_info: String,
    pub repo_name: String,
    pub branch: Option<String>,
    pub file_path: String,
    pub file_contents: String,
    pub recent_changes: String,
    pub cursor_position: usize,
    pub original_file_contents: String,
    pub file_chunks: Vec<FileChunk>,
    pub retrieval_chunks: Vec<FileChunk>,
    pub recent_user_actions: Vec<UserAction>,
    pub multiple_suggestions: bool,
    pub privacy_mode_enabled: bool,
    pub changes_above_cursor: bool,
    pub use_bytes: bool,
}

/// A chunk of file content supplied as context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileChunk {
    pub file_path: String,
    pub start_line: usize,
    pub end_line: usize,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

/// A recorded user action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserAction {
    pub action_type: String,
    pub line_number: usize,
    pub offset: usize,
    pub file_path: String,
    pub timestamp: u64,
}

/// Response from the autocomplete endpoint.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AutocompleteResponse {
    #[serde(default)]
    pub autocomplete_id: String,
    #[serde(default)]
    pub start_index: usize,
    #[serde(default)]
    pub end_index: usize,
    #[serde(default)]
    pub completion: String,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub finish_reason: Option<String>,
    #[serde(default)]
    pub elapsed_time_ms: u64,
}

/// Request body for the fire-and-forget metrics endpoint.
#[derive(Debug, Clone, Serialize, Default)]
pub struct MetricsRequest {
    pub event_type: String,
    pub suggestion_type: String,
    pub additions: usize,
    pub deletions: usize,
    pub autocomplete_id: String,
    pub edit_tracking: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edit_tracking_line: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lifespan: Option<u64>,
    pub debug_info: String,
    pub device_id: String,
    pub privacy_mode_enabled: bool,
}

/// Client for the hosted Sweep API.
#[derive(Debug, Clone)]
pub struct SweepClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl SweepClient {
    /// Build a client; fails when no API key can be resolved.
    pub fn new(base_url: impl Into<String>, api_key: String) -> Result<Self> {
        if api_key.is_empty() {
            return Err(anyhow!("sweep API key must not be empty"));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            api_key,
        })
    }

    /// Send an autocomplete request, retrying transient failures with a
    /// small linear backoff. Cancellation is never retried.
    pub async fn do_autocomplete(
        &self,
        cancel: &CancellationToken,
        req: &AutocompleteRequest,
    ) -> Result<AutocompleteResponse> {
        let body = serde_json::to_vec(req).context("failed to marshal autocomplete request")?;
        let compressed = compress_brotli(&body)?;
        let url = format!("{}{}", self.base_url, DEFAULT_AUTOCOMPLETE_PATH);

        debug!(
            file_path = %req.file_path,
            body_len = body.len(),
            compressed_len = compressed.len(),
            "sweep autocomplete request"
        );

        let mut last_err: Option<anyhow::Error> = None;
        for attempt in 1..=MAX_ATTEMPTS {
            if attempt > 1 {
                let backoff = RETRY_BACKOFF * (attempt - 1);
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = cancel.cancelled() => return Err(anyhow!("autocomplete request cancelled")),
                }
            }

            let send = self
                .http
                .post(&url)
                .header("Content-Type", "application/json")
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Encoding", "br")
                .body(compressed.clone())
                .send();

            let resp = tokio::select! {
                resp = send => resp,
                _ = cancel.cancelled() => return Err(anyhow!("autocomplete request cancelled")),
            };

            let resp = match resp {
                Ok(resp) => resp,
                Err(err) => {
                    if attempt < MAX_ATTEMPTS && is_retryable_transport_error(&err) {
                        debug!(attempt, "sweep autocomplete transient transport error");
                        last_err = Some(err.into());
                        continue;
                    }
                    return Err(anyhow::Error::from(err)
                        .context("failed to send autocomplete request"));
                }
            };

            let status = resp.status();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                let err = anyhow!("autocomplete request failed with status {status}: {body}");
                if attempt < MAX_ATTEMPTS && is_retryable_status(status) {
                    debug!(attempt, %status, "sweep autocomplete transient response error");
                    last_err = Some(err);
                    continue;
                }
                return Err(err);
            }

            let bytes = match resp.bytes().await {
                Ok(bytes) => bytes,
                Err(err) => {
                    // Mid-body failures on a 200 are retried too.
                    if attempt < MAX_ATTEMPTS {
                        debug!(attempt, "sweep autocomplete body read error");
                        last_err = Some(err.into());
                        continue;
                    }
                    return Err(anyhow::Error::from(err)
                        .context("failed to read autocomplete response"));
                }
            };

            let parsed: AutocompleteResponse =
                serde_json::from_slice(&bytes).context("failed to decode autocomplete response")?;
            debug!(
                id = %parsed.autocomplete_id,
                start = parsed.start_index,
                end = parsed.end_index,
                completion_len = parsed.completion.len(),
                "sweep autocomplete response"
            );
            return Ok(parsed);
        }

        Err(last_err
            .unwrap_or_else(|| anyhow!("no attempts made"))
            .context(format!("failed to complete request after {MAX_ATTEMPTS} attempts")))
    }

    /// Fire-and-forget metrics upload.
    pub fn send_metrics(&self, req: &MetricsRequest) {
        let Ok(body) = serde_json::to_vec(req) else {
            return;
        };
        let http = self.http.clone();
        let url = format!("{}{}", self.base_url, DEFAULT_METRICS_PATH);
        let auth = format!("Bearer {}", self.api_key);

        tokio::spawn(async move {
            let result = http
                .post(&url)
                .header("Content-Type", "application/json")
                .header("Authorization", auth)
                .body(body)
                .send()
                .await;
            match result {
                Ok(resp) if !resp.status().is_success() => {
                    debug!(status = %resp.status(), "sweep metrics request failed");
                }
                Err(err) => debug!(error = %err, "sweep metrics send failed"),
                _ => {}
            }
        });
    }
}

fn compress_brotli(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    {
        let mut writer =
            brotli::CompressorWriter::new(&mut out, 4096, BROTLI_QUALITY, BROTLI_LGWIN);
        writer
            .write_all(data)
            .context("failed to compress request body")?;
        writer.flush().context("failed to flush compressed body")?;
    }
    Ok(out)
}

fn is_retryable_status(status: reqwest::StatusCode) -> bool {
    status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn is_retryable_transport_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_body() || err.is_decode()
}
