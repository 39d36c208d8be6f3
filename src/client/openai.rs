// SPDX-License-Identifier: MIT
// OpenAI-compatible /v1/completions client with SSE line and token streams.

use anyhow::{anyhow, Context, Result};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Wire request matching the OpenAI completion API.
#[derive(Debug, Clone, Serialize, Default)]
pub struct CompletionRequest {
    pub model: String,
    pub prompt: String,
    pub temperature: f64,
    pub max_tokens: usize,
    #[serde(skip_serializing_if = "is_zero")]
    pub top_k: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
    pub n: usize,
    pub echo: bool,
    pub stream: bool,
}

fn is_zero(v: &usize) -> bool {
    *v == 0
}

/// Wire response matching the OpenAI completion API.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct CompletionResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub usage: Usage,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Choice {
    #[serde(default)]
    pub index: usize,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub finish_reason: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: usize,
    #[serde(default)]
    pub completion_tokens: usize,
    #[serde(default)]
    pub total_tokens: usize,
}

/// A single SSE chunk of a streaming response.
#[derive(Debug, Clone, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    text: String,
    #[serde(default)]
    finish_reason: String,
}

/// Terminal result of a streaming completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamResult {
    pub text: String,
    pub finish_reason: String,
    pub stopped_early: bool,
    /// Byte replacement range, set only by byte-offset edit backends.
    pub byte_range: Option<(usize, usize)>,
}

/// Handle to an in-flight stream.
///
/// `chunks` carries complete lines (line streams) or the cumulative text so
/// far (token streams, idempotent for UI rendering). The terminal
/// [`StreamResult`] arrives on `done` after `chunks` closes. `cancel` is
/// idempotent and safe to call while a consumer reads.
pub struct StreamHandle {
    pub chunks: mpsc::Receiver<String>,
    pub done: oneshot::Receiver<StreamResult>,
    cancel: CancellationToken,
}

impl StreamHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Reusable OpenAI-compatible API client.
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    http: reqwest::Client,
    pub url: String,
    pub completion_path: String,
}

impl OpenAiClient {
    pub fn new(url: impl Into<String>, completion_path: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: url.into(),
            completion_path: completion_path.into(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}{}", self.url, self.completion_path)
    }

    /// Send a non-streaming completion request.
    pub async fn do_completion(
        &self,
        cancel: &CancellationToken,
        req: &CompletionRequest,
    ) -> Result<CompletionResponse> {
        let mut req = req.clone();
        req.stream = false;

        let send = self.http.post(self.endpoint()).json(&req).send();
        let resp = tokio::select! {
            resp = send => resp.context("failed to send completion request")?,
            _ = cancel.cancelled() => return Err(anyhow!("completion request cancelled")),
        };

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("completion request failed with status {status}: {body}"));
        }

        let body = tokio::select! {
            body = resp.bytes() => body.context("failed to read completion response")?,
            _ = cancel.cancelled() => return Err(anyhow!("completion request cancelled")),
        };
        serde_json::from_slice(&body).context("failed to decode completion response")
    }

    /// Start a streaming request that emits complete lines as they land.
    /// `max_lines` stops the stream early (0 = no limit).
    pub fn do_line_stream(
        &self,
        parent: &CancellationToken,
        req: &CompletionRequest,
        max_lines: usize,
        stop_tokens: Vec<String>,
    ) -> StreamHandle {
        self.spawn_stream(parent, req, StreamShape::Lines { max_lines }, stop_tokens)
    }

    /// Start a streaming request that emits the cumulative text after every
    /// chunk. `max_chars` stops the stream early (0 = no limit).
    pub fn do_token_stream(
        &self,
        parent: &CancellationToken,
        req: &CompletionRequest,
        max_chars: usize,
        stop_tokens: Vec<String>,
    ) -> StreamHandle {
        self.spawn_stream(parent, req, StreamShape::Tokens { max_chars }, stop_tokens)
    }

    fn spawn_stream(
        &self,
        parent: &CancellationToken,
        req: &CompletionRequest,
        shape: StreamShape,
        stop_tokens: Vec<String>,
    ) -> StreamHandle {
        let (chunk_tx, chunk_rx) = mpsc::channel(100);
        let (done_tx, done_rx) = oneshot::channel();
        let cancel = parent.child_token();

        let client = self.clone();
        let mut req = req.clone();
        req.stream = true;
        let task_cancel = cancel.clone();

        tokio::spawn(async move {
            let result = client
                .run_stream(&task_cancel, req, shape, stop_tokens, chunk_tx)
                .await;
            let _ = done_tx.send(result);
        });

        StreamHandle {
            chunks: chunk_rx,
            done: done_rx,
            cancel,
        }
    }

    async fn run_stream(
        &self,
        cancel: &CancellationToken,
        req: CompletionRequest,
        shape: StreamShape,
        stop_tokens: Vec<String>,
        chunks: mpsc::Sender<String>,
    ) -> StreamResult {
        let send = self
            .http
            .post(self.endpoint())
            .header("Accept", "text/event-stream")
            .json(&req)
            .send();

        let resp = tokio::select! {
            resp = send => match resp {
                Ok(resp) => resp,
                Err(err) => {
                    error!(error = %err, "stream: failed to send request");
                    return StreamResult { finish_reason: "error".into(), ..StreamResult::default() };
                }
            },
            _ = cancel.cancelled() => {
                return StreamResult { finish_reason: "cancelled".into(), stopped_early: true, ..StreamResult::default() };
            }
        };

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            error!(%status, body = %body, "stream: request failed");
            return StreamResult {
                finish_reason: "error".into(),
                ..StreamResult::default()
            };
        }

        let mut assembler = StreamAssembler::new(shape, stop_tokens);
        let mut framing = SseFraming::default();
        let mut body = resp.bytes_stream();

        loop {
            let chunk = tokio::select! {
                chunk = body.next() => chunk,
                _ = cancel.cancelled() => {
                    return assembler.finish_cancelled();
                }
            };

            let bytes = match chunk {
                Some(Ok(bytes)) => bytes,
                Some(Err(err)) => {
                    debug!(error = %err, "stream: body error");
                    break;
                }
                None => break,
            };

            for payload in framing.push(&bytes) {
                if payload == "[DONE]" {
                    // A truncated stream can leave a final unterminated line.
                    if let Some(rest) = assembler.flush_partial() {
                        let _ = chunks.send(rest).await;
                    }
                    return assembler.finish();
                }
                let parsed: StreamChunk = match serde_json::from_str(&payload) {
                    Ok(parsed) => parsed,
                    Err(err) => {
                        debug!(error = %err, "stream: failed to parse chunk");
                        continue;
                    }
                };
                let Some(choice) = parsed.choices.first() else {
                    continue;
                };

                match assembler.push_text(&choice.text, &choice.finish_reason) {
                    StreamStep::Continue(emit) => {
                        for item in emit {
                            if send_or_cancelled(&chunks, cancel, item).await {
                                return assembler.finish_cancelled();
                            }
                        }
                    }
                    StreamStep::Finished(emit) => {
                        for item in emit {
                            if send_or_cancelled(&chunks, cancel, item).await {
                                return assembler.finish_cancelled();
                            }
                        }
                        return assembler.finish();
                    }
                }
            }
        }

        // Flush a final partial line (covers truncated streams).
        if let Some(rest) = assembler.flush_partial() {
            let _ = chunks.send(rest).await;
        }
        assembler.finish()
    }
}

async fn send_or_cancelled(
    chunks: &mpsc::Sender<String>,
    cancel: &CancellationToken,
    item: String,
) -> bool {
    tokio::select! {
        sent = chunks.send(item) => sent.is_err(),
        _ = cancel.cancelled() => true,
    }
}

/// Incremental SSE framing: feed raw bytes, get complete `data:` payloads.
#[derive(Debug, Default)]
struct SseFraming {
    buffer: String,
}

impl SseFraming {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.push_str(&String::from_utf8_lossy(bytes));

        let mut payloads = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            if line.is_empty() || line.starts_with(':') {
                continue;
            }
            if let Some(payload) = line.strip_prefix("data: ") {
                payloads.push(payload.to_string());
            }
        }
        payloads
    }
}

#[derive(Debug, Clone, Copy)]
enum StreamShape {
    Lines { max_lines: usize },
    Tokens { max_chars: usize },
}

enum StreamStep {
    Continue(Vec<String>),
    Finished(Vec<String>),
}

/// Accumulates streamed text, applies stop tokens and early-stop limits, and
/// produces the per-shape emissions.
struct StreamAssembler {
    shape: StreamShape,
    stop_tokens: Vec<String>,
    text: String,
    line_buffer: String,
    line_count: usize,
    finish_reason: String,
    stopped_early: bool,
}

impl StreamAssembler {
    fn new(shape: StreamShape, stop_tokens: Vec<String>) -> Self {
        Self {
            shape,
            stop_tokens,
            text: String::new(),
            line_buffer: String::new(),
            line_count: 0,
            finish_reason: String::new(),
            stopped_early: false,
        }
    }

    fn push_text(&mut self, text: &str, finish_reason: &str) -> StreamStep {
        let mut text = text.to_string();
        let mut hit_stop = false;
        for token in &self.stop_tokens {
            if let Some(idx) = text.find(token.as_str()) {
                text.truncate(idx);
                hit_stop = true;
                break;
            }
        }

        let mut emit = Vec::new();
        match self.shape {
            StreamShape::Lines { max_lines } => {
                for ch in text.chars() {
                    self.text.push(ch);
                    if ch == '\n' {
                        emit.push(std::mem::take(&mut self.line_buffer));
                        self.line_count += 1;
                        if max_lines > 0 && self.line_count >= max_lines {
                            debug!(lines = self.line_count, "stream: stopping early at line limit");
                            self.finish_reason = "length".into();
                            self.stopped_early = true;
                            return StreamStep::Finished(emit);
                        }
                    } else {
                        self.line_buffer.push(ch);
                    }
                }
                if hit_stop {
                    self.finish_reason = "stop".into();
                    if !self.line_buffer.is_empty() {
                        emit.push(std::mem::take(&mut self.line_buffer));
                    }
                    return StreamStep::Finished(emit);
                }
            }
            StreamShape::Tokens { max_chars } => {
                self.text.push_str(&text);
                if hit_stop {
                    self.finish_reason = "stop".into();
                    if !self.text.is_empty() {
                        emit.push(self.text.clone());
                    }
                    return StreamStep::Finished(emit);
                }
                if max_chars > 0 && self.text.len() >= max_chars {
                    debug!(chars = self.text.len(), "stream: stopping early at char limit");
                    self.finish_reason = "length".into();
                    self.stopped_early = true;
                    emit.push(self.text.clone());
                    return StreamStep::Finished(emit);
                }
                emit.push(self.text.clone());
            }
        }

        if !finish_reason.is_empty() {
            self.finish_reason = finish_reason.to_string();
        }
        StreamStep::Continue(emit)
    }

    fn flush_partial(&mut self) -> Option<String> {
        if matches!(self.shape, StreamShape::Lines { .. }) && !self.line_buffer.is_empty() {
            Some(std::mem::take(&mut self.line_buffer))
        } else {
            None
        }
    }

    fn finish(&self) -> StreamResult {
        StreamResult {
            text: self.text.clone(),
            finish_reason: self.finish_reason.clone(),
            stopped_early: self.stopped_early,
            byte_range: None,
        }
    }

    fn finish_cancelled(&self) -> StreamResult {
        StreamResult {
            text: self.text.clone(),
            finish_reason: "cancelled".into(),
            stopped_early: true,
            byte_range: None,
        }
    }
}
