// SPDX-License-Identifier: MIT
// Provider pipeline: a configured provider is a record of preprocessors, a
// prompt builder, a transport client, and postprocessors. The executor here
// runs the chain; the concrete providers only supply the pieces.

pub mod fim;
pub mod inline;
pub mod sweep;
pub mod zeta;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::client::openai::{self, OpenAiClient, StreamHandle, StreamResult};
use crate::config::{DaemonConfig, ProviderConfig, ProviderKind};
use crate::text::trim_content_around_cursor;
use crate::types::{Completion, CompletionRequest, CompletionResponse, FileDiffHistory};

/// How a provider streams its output to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamingMode {
    None,
    /// Cumulative text after every chunk.
    Tokens,
    /// Complete lines as they land.
    Lines,
}

/// Per-attempt pipeline state, threaded through the processors.
#[derive(Debug, Clone)]
pub struct Context {
    pub request: Arc<CompletionRequest>,
    pub trimmed_lines: Vec<String>,
    /// Cursor line, 0-indexed into `trimmed_lines`.
    pub cursor_line: usize,
    /// Trim offsets, 0-indexed half-open into the request lines.
    pub window_start: usize,
    pub window_end: usize,
    /// The model's result; set by the executor before postprocessing.
    pub result: StreamResult,
    /// Inclusive 1-indexed end line, set by truncation handling (0 = unset).
    pub end_line_inc: usize,
}

impl Context {
    pub fn new(request: Arc<CompletionRequest>) -> Self {
        let window_end = request.lines.len();
        Self {
            request,
            trimmed_lines: Vec::new(),
            cursor_line: 0,
            window_start: 0,
            window_end,
            result: StreamResult::default(),
            end_line_inc: 0,
        }
    }

    /// Window of the original (pre-trim) lines this attempt looks at.
    pub fn window_lines(&self) -> &[String] {
        let start = self.window_start.min(self.request.lines.len());
        let end = self.window_end.min(self.request.lines.len());
        &self.request.lines[start..end.max(start)]
    }
}

/// Preprocessor outcome: skip drops the attempt silently.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("completion skipped")]
    Skip,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Preprocessor = Box<dyn Fn(&Provider, &mut Context) -> Result<(), PipelineError> + Send + Sync>;
pub type PromptBuilder = fn(&Provider, &Context) -> openai::CompletionRequest;
/// Returns `Some` to terminate the chain (possibly with an empty response),
/// `None` to pass the context to the next postprocessor.
pub type Postprocessor = Box<dyn Fn(&Provider, &mut Context) -> Option<CompletionResponse> + Send + Sync>;

/// Transport seam between the pipeline and a model backend.
#[async_trait]
pub trait TransportClient: Send + Sync {
    async fn do_completion(
        &self,
        cancel: &CancellationToken,
        req: &openai::CompletionRequest,
    ) -> Result<StreamResult>;

    /// Open a streaming request; `None` when the backend cannot stream.
    fn open_stream(
        &self,
        cancel: &CancellationToken,
        req: &openai::CompletionRequest,
        mode: StreamingMode,
        stop_tokens: Vec<String>,
        max_lines: usize,
    ) -> Option<StreamHandle>;
}

#[async_trait]
impl TransportClient for OpenAiClient {
    async fn do_completion(
        &self,
        cancel: &CancellationToken,
        req: &openai::CompletionRequest,
    ) -> Result<StreamResult> {
        let resp = OpenAiClient::do_completion(self, cancel, req).await?;
        let Some(choice) = resp.choices.into_iter().next() else {
            return Ok(StreamResult::default());
        };
        Ok(StreamResult {
            text: choice.text,
            finish_reason: choice.finish_reason,
            stopped_early: false,
            byte_range: None,
        })
    }

    fn open_stream(
        &self,
        cancel: &CancellationToken,
        req: &openai::CompletionRequest,
        mode: StreamingMode,
        stop_tokens: Vec<String>,
        max_lines: usize,
    ) -> Option<StreamHandle> {
        match mode {
            StreamingMode::Lines => Some(self.do_line_stream(cancel, req, max_lines, stop_tokens)),
            StreamingMode::Tokens => Some(self.do_token_stream(cancel, req, 0, stop_tokens)),
            StreamingMode::None => None,
        }
    }
}

/// A fully configured completion provider.
pub struct Provider {
    pub name: &'static str,
    pub config: ProviderConfig,
    pub client: Arc<dyn TransportClient>,
    pub streaming: StreamingMode,
    pub stop_tokens: Vec<String>,
    /// Line-stream limit (0 = unlimited).
    pub max_stream_lines: usize,
    pub preprocessors: Vec<Preprocessor>,
    pub prompt_builder: PromptBuilder,
    pub postprocessors: Vec<Postprocessor>,
}

/// One chunk of streamed provider output, as the engine sees it.
#[derive(Debug, Clone)]
pub enum StreamPayload {
    /// A complete line from a line stream.
    Line(String),
    /// The cumulative text so far from a token stream.
    CumulativeText(String),
}

/// The narrow interface the engine drives.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    fn streaming_mode(&self) -> StreamingMode {
        StreamingMode::None
    }

    async fn get_completion(
        &self,
        cancel: &CancellationToken,
        req: Arc<CompletionRequest>,
    ) -> Result<CompletionResponse>;

    /// Run a completion, forwarding chunks through `chunks` as they arrive,
    /// and return the final postprocessed response. Non-streaming providers
    /// fall through to [`CompletionProvider::get_completion`].
    async fn stream_completion(
        &self,
        cancel: &CancellationToken,
        req: Arc<CompletionRequest>,
        chunks: mpsc::UnboundedSender<StreamPayload>,
    ) -> Result<CompletionResponse> {
        let _ = chunks;
        self.get_completion(cancel, req).await
    }
}

impl Provider {
    pub fn empty_response(&self) -> CompletionResponse {
        CompletionResponse::empty()
    }

    /// Run the preprocessors and build the wire request.
    /// `Ok(None)` means a preprocessor skipped the attempt.
    fn prepare(
        &self,
        req: Arc<CompletionRequest>,
    ) -> Result<Option<(Context, openai::CompletionRequest)>> {
        let mut ctx = Context::new(req);
        for pre in &self.preprocessors {
            match pre(self, &mut ctx) {
                Ok(()) => {}
                Err(PipelineError::Skip) => {
                    debug!(provider = self.name, "preprocessor skipped completion");
                    return Ok(None);
                }
                Err(PipelineError::Other(err)) => return Err(err),
            }
        }
        let wire = (self.prompt_builder)(self, &ctx);
        Ok(Some((ctx, wire)))
    }

    /// Run the postprocessor chain over a finished context.
    pub fn postprocess(&self, ctx: &mut Context) -> CompletionResponse {
        for post in &self.postprocessors {
            if let Some(resp) = post(self, ctx) {
                return resp;
            }
        }
        self.empty_response()
    }

    /// Build a completion, rejecting no-op replacements against the current
    /// buffer content. Pure insertions (`end_line_inc == start_line - 1`)
    /// compare against an empty old slice, so inserting only blank lines is
    /// still a no-op.
    pub fn build_completion(
        &self,
        ctx: &Context,
        start_line: usize,
        end_line_inc: usize,
        lines: Vec<String>,
    ) -> CompletionResponse {
        let req = &ctx.request;
        if start_line >= 1 && end_line_inc + 1 >= start_line && end_line_inc <= req.lines.len() {
            let old = &req.lines[start_line - 1..end_line_inc];
            if is_no_op_replacement(&lines, old) {
                debug!(provider = self.name, "no-op replacement rejected");
                return self.empty_response();
            }
        }
        CompletionResponse {
            completions: vec![Completion {
                start_line,
                end_line_inc,
                lines,
            }],
            cursor_target: None,
        }
    }
}

#[async_trait]
impl CompletionProvider for Provider {
    fn streaming_mode(&self) -> StreamingMode {
        self.streaming
    }

    async fn get_completion(
        &self,
        cancel: &CancellationToken,
        req: Arc<CompletionRequest>,
    ) -> Result<CompletionResponse> {
        let Some((mut ctx, wire)) = self.prepare(req)? else {
            return Ok(self.empty_response());
        };
        ctx.result = self.client.do_completion(cancel, &wire).await?;
        Ok(self.postprocess(&mut ctx))
    }

    async fn stream_completion(
        &self,
        cancel: &CancellationToken,
        req: Arc<CompletionRequest>,
        chunks: mpsc::UnboundedSender<StreamPayload>,
    ) -> Result<CompletionResponse> {
        if self.streaming == StreamingMode::None {
            return self.get_completion(cancel, req).await;
        }
        let Some((mut ctx, wire)) = self.prepare(req)? else {
            return Ok(self.empty_response());
        };
        let Some(mut handle) = self.client.open_stream(
            cancel,
            &wire,
            self.streaming,
            self.stop_tokens.clone(),
            self.max_stream_lines,
        ) else {
            // Backend cannot stream; run the plain request instead.
            ctx.result = self.client.do_completion(cancel, &wire).await?;
            return Ok(self.postprocess(&mut ctx));
        };

        while let Some(chunk) = handle.chunks.recv().await {
            let payload = match self.streaming {
                StreamingMode::Tokens => StreamPayload::CumulativeText(chunk),
                _ => StreamPayload::Line(chunk),
            };
            if chunks.send(payload).is_err() {
                break;
            }
        }
        ctx.result = handle.done.await.unwrap_or_default();
        Ok(self.postprocess(&mut ctx))
    }
}

/// Construct the configured provider.
pub fn new_provider(config: &DaemonConfig) -> Result<Provider> {
    match config.provider_type {
        ProviderKind::Inline => Ok(inline::new_provider(config.provider.clone())),
        ProviderKind::Fim => Ok(fim::new_provider(config.provider.clone())),
        ProviderKind::Sweep => sweep::new_provider(config.provider.clone()),
        ProviderKind::Zeta => Ok(zeta::new_provider(config.provider.clone())),
    }
}

// ─── Preprocessors ────────────────────────────────────────────────────────────

/// Trim the buffer to the provider's token budget around the cursor.
pub fn trim_content() -> Preprocessor {
    Box::new(|provider, ctx| {
        let req = ctx.request.clone();
        let cursor_line = req.cursor_row.saturating_sub(1);
        let trimmed = trim_content_around_cursor(
            &req.lines,
            cursor_line,
            provider.config.provider_max_tokens,
        );
        ctx.trimmed_lines = trimmed.lines;
        ctx.cursor_line = trimmed.cursor_line;
        ctx.window_start = trimmed.window_start;
        ctx.window_end = trimmed.window_end;
        Ok(())
    })
}

/// Skip the attempt when the current line has text after the cursor.
pub fn skip_if_text_after_cursor() -> Preprocessor {
    Box::new(|_, ctx| {
        let line = ctx.request.current_line();
        if ctx.request.cursor_col < line.len() {
            return Err(PipelineError::Skip);
        }
        Ok(())
    })
}

// ─── Postprocessors ───────────────────────────────────────────────────────────

/// Terminate with an empty response when the generated text trims to empty.
pub fn reject_empty() -> Postprocessor {
    Box::new(|provider, ctx| {
        if ctx.result.text.trim().is_empty() {
            return Some(provider.empty_response());
        }
        None
    })
}

/// Terminate with an empty response when the model ran out of tokens.
pub fn reject_truncated() -> Postprocessor {
    Box::new(|provider, ctx| {
        if ctx.result.finish_reason == "length" {
            debug!(provider = provider.name, "truncated completion rejected");
            return Some(provider.empty_response());
        }
        None
    })
}

/// On truncation, drop the (presumed incomplete) last line of a multi-line
/// result; reject a truncated single line outright.
pub fn drop_last_line_if_truncated() -> Postprocessor {
    Box::new(|provider, ctx| {
        if !ctx.result.stopped_early && ctx.result.finish_reason != "length" {
            return None;
        }
        let mut lines: Vec<&str> = ctx.result.text.split('\n').collect();
        if lines.len() <= 1 {
            debug!(provider = provider.name, "truncated single line rejected");
            return Some(provider.empty_response());
        }
        lines.pop();
        let kept = lines.len();
        let joined = lines.join("\n");
        ctx.result.text = joined;
        ctx.end_line_inc = ctx.window_start + kept;
        None
    })
}

/// Reject results whose first line anchors too far into the window.
/// Windows under 10 lines skip validation.
pub fn validate_anchor_position(max_ratio: f64) -> Postprocessor {
    Box::new(move |provider, ctx| {
        let first_line = ctx.result.text.split('\n').next().unwrap_or("");
        match validate_first_line_anchor(ctx, first_line, max_ratio) {
            Ok(()) => None,
            Err(position) => {
                debug!(
                    provider = provider.name,
                    position, "anchor position too far from window start"
                );
                Some(provider.empty_response())
            }
        }
    })
}

/// Check that `first_line` anchors within `max_ratio` of the window length.
/// Returns the offending position on failure.
pub fn validate_first_line_anchor(
    ctx: &Context,
    first_line: &str,
    max_ratio: f64,
) -> std::result::Result<(), usize> {
    let window = ctx.window_lines();
    if window.len() < 10 {
        return Ok(());
    }
    let idx = find_anchor_line(first_line, window, 0);
    if idx >= 0 && (idx as f64) > max_ratio * window.len() as f64 {
        return Err(idx as usize);
    }
    Ok(())
}

/// When truncated but enough lines survive (≥ `ratio` of the window), accept
/// the prefix; otherwise reject.
pub fn anchor_truncation(ratio: f64) -> Postprocessor {
    Box::new(move |provider, ctx| {
        if !ctx.result.stopped_early && ctx.result.finish_reason != "length" {
            return None;
        }
        let mut lines: Vec<&str> = ctx.result.text.split('\n').collect();
        let window_len = ctx.window_lines().len();
        let surviving = lines.len().saturating_sub(1);
        if (surviving as f64) < ratio * window_len as f64 {
            debug!(
                provider = provider.name,
                surviving, window_len, "truncated completion too short to anchor"
            );
            return Some(provider.empty_response());
        }
        lines.pop();
        let kept = lines.len();
        let joined = lines.join("\n");
        ctx.result.text = joined;
        ctx.end_line_inc = ctx.window_start + kept;
        None
    })
}

// ─── Anchoring and no-op helpers ──────────────────────────────────────────────

const ANCHOR_SLACK: usize = 5;
const ANCHOR_TOKEN_OVERLAP: f64 = 0.6;

/// Find the best match for `needle` in `old_lines`, searching a restricted
/// window around `expected_pos` first, then the whole slice. Returns −1 when
/// nothing matches.
pub fn find_anchor_line(needle: &str, old_lines: &[String], expected_pos: usize) -> i64 {
    let start = expected_pos.saturating_sub(ANCHOR_SLACK);
    let end = (expected_pos + ANCHOR_SLACK + 1).min(old_lines.len());
    for (i, line) in old_lines.iter().enumerate().take(end).skip(start) {
        if lines_match(needle, line) {
            return i as i64;
        }
    }
    find_anchor_line_full_search(needle, old_lines)
}

/// Full-slice anchor search.
pub fn find_anchor_line_full_search(needle: &str, old_lines: &[String]) -> i64 {
    for (i, line) in old_lines.iter().enumerate() {
        if lines_match(needle, line) {
            return i as i64;
        }
    }
    -1
}

/// A line matches when it equals the needle or shares ≥ 60% of its tokens.
fn lines_match(needle: &str, line: &str) -> bool {
    if needle == line {
        return true;
    }
    let needle_tokens = tokenize(needle);
    let line_tokens = tokenize(line);
    if needle_tokens.is_empty() || line_tokens.is_empty() {
        return false;
    }
    let shared = needle_tokens
        .iter()
        .filter(|t| line_tokens.contains(*t))
        .count();
    shared as f64 / needle_tokens.len().max(line_tokens.len()) as f64 >= ANCHOR_TOKEN_OVERLAP
}

fn tokenize(line: &str) -> Vec<&str> {
    line.split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| !t.is_empty())
        .collect()
}

/// Whether replacing `old_lines` with `new_lines` changes nothing, comparing
/// right-trimmed joins.
pub fn is_no_op_replacement(new_lines: &[String], old_lines: &[String]) -> bool {
    new_lines.join("\n").trim_end() == old_lines.join("\n").trim_end()
}

// ─── Diff history rendering ───────────────────────────────────────────────────

/// Render a diff entry as a minimal unified diff: one hunk header, all old
/// lines minus, all new lines plus. Empty for unchanged entries.
pub fn diff_entry_to_unified_diff(original: &str, updated: &str) -> String {
    if original == updated {
        return String::new();
    }
    let old_lines: Vec<&str> = original.split('\n').collect();
    let new_lines: Vec<&str> = updated.split('\n').collect();

    let mut out = format!("@@ -1,{} +1,{} @@\n", old_lines.len(), new_lines.len());
    for line in &old_lines {
        out.push('-');
        out.push_str(line);
        out.push('\n');
    }
    for line in &new_lines {
        out.push('+');
        out.push_str(line);
        out.push('\n');
    }
    out.truncate(out.trim_end_matches('\n').len());
    out
}

/// Formatting knobs for [`format_diff_history`].
pub struct DiffHistoryOptions {
    pub header: fn(&str) -> String,
    pub prefix: &'static str,
    pub suffix: &'static str,
    pub separator: &'static str,
}

/// Render per-file diff histories as unified diffs with configurable framing.
pub fn format_diff_history(histories: &[FileDiffHistory], opts: &DiffHistoryOptions) -> String {
    let mut out = String::new();
    let mut first = true;

    for history in histories {
        for entry in &history.diff_history {
            let unified = diff_entry_to_unified_diff(&entry.original, &entry.updated);
            if unified.is_empty() {
                continue;
            }
            if !first {
                out.push_str(opts.separator);
            }
            first = false;
            out.push_str(&(opts.header)(&history.file_name));
            out.push_str(opts.prefix);
            out.push_str(&unified);
            out.push_str(opts.suffix);
        }
    }
    out
}

/// Render per-file diff histories as original/updated sections.
pub fn format_diff_history_original_updated(
    histories: &[FileDiffHistory],
    header: fn(&str) -> String,
) -> String {
    let mut out = String::new();
    for history in histories {
        for entry in &history.diff_history {
            if entry.original == entry.updated {
                continue;
            }
            out.push_str(&header(&history.file_name));
            out.push_str("original:\n");
            out.push_str(&entry.original);
            out.push_str("\nupdated:\n");
            out.push_str(&entry.updated);
            out.push('\n');
        }
    }
    out
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::types::DiffEntry;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn unified_diff_formats() {
        assert_eq!(diff_entry_to_unified_diff("same", "same"), "");
        assert_eq!(
            diff_entry_to_unified_diff("old", "new"),
            "@@ -1,1 +1,1 @@\n-old\n+new"
        );
        assert_eq!(
            diff_entry_to_unified_diff("line 1\nline 2", "line 1\nmodified"),
            "@@ -1,2 +1,2 @@\n-line 1\n-line 2\n+line 1\n+modified"
        );
    }

    #[test]
    fn format_diff_history_unified() {
        let histories = vec![FileDiffHistory {
            file_name: "test.rs".into(),
            diff_history: vec![DiffEntry {
                original: "old line".into(),
                updated: "new line".into(),
            }],
        }];
        let opts = DiffHistoryOptions {
            header: |name| format!("User edited {name:?}:\n"),
            prefix: "```diff\n",
            suffix: "\n```",
            separator: "\n\n",
        };

        let rendered = format_diff_history(&histories, &opts);
        assert!(rendered.contains("User edited \"test.rs\""));
        assert!(rendered.contains("```diff"));
        assert!(rendered.contains("-old line"));
        assert!(rendered.contains("+new line"));
    }

    #[test]
    fn format_diff_history_file_separator() {
        let histories = vec![FileDiffHistory {
            file_name: "test.rs".into(),
            diff_history: vec![DiffEntry {
                original: "old line".into(),
                updated: "new line".into(),
            }],
        }];
        let opts = DiffHistoryOptions {
            header: |name| format!("<|file_sep|>{name}.diff\n"),
            prefix: "",
            suffix: "\n",
            separator: "",
        };

        let rendered = format_diff_history(&histories, &opts);
        assert!(rendered.contains("<|file_sep|>test.rs.diff"));
        assert!(rendered.contains("-old line"));
        assert!(rendered.contains("+new line"));
    }

    #[test]
    fn format_original_updated_sections() {
        let histories = vec![FileDiffHistory {
            file_name: "test.rs".into(),
            diff_history: vec![DiffEntry {
                original: "old line".into(),
                updated: "new line".into(),
            }],
        }];

        let rendered =
            format_diff_history_original_updated(&histories, |name| format!("<|file_sep|>{name}.diff\n"));
        assert!(rendered.contains("<|file_sep|>test.rs.diff"));
        assert!(rendered.contains("original:\nold line"));
        assert!(rendered.contains("updated:\nnew line"));
    }

    #[test]
    fn format_original_updated_skips_unchanged() {
        let histories = vec![FileDiffHistory {
            file_name: "test.rs".into(),
            diff_history: vec![DiffEntry {
                original: "same content".into(),
                updated: "same content".into(),
            }],
        }];

        let rendered =
            format_diff_history_original_updated(&histories, |name| format!("<|file_sep|>{name}.diff\n"));
        assert_eq!(rendered, "");
    }

    #[test]
    fn trim_content_small_file() {
        let provider = test_provider(
            "test",
            ProviderConfig {
                provider_max_tokens: 1000,
                ..ProviderConfig::default()
            },
        );
        let mut ctx = Context::new(request(&["line 1", "line 2", "line 3"], 2, 5));

        trim_content()(&provider, &mut ctx).unwrap();

        assert_eq!(ctx.trimmed_lines.len(), 3);
        assert_eq!(ctx.cursor_line, 1);
    }

    #[test]
    fn trim_content_large_file() {
        let provider = test_provider(
            "test",
            ProviderConfig {
                provider_max_tokens: 50,
                ..ProviderConfig::default()
            },
        );
        let lines: Vec<String> = (0..100)
            .map(|_| "this is a long line with some content".to_string())
            .collect();
        let line_refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        let mut ctx = Context::new(request(&line_refs, 50, 0));

        trim_content()(&provider, &mut ctx).unwrap();

        assert!(ctx.trimmed_lines.len() < 100);
    }

    #[test]
    fn skip_if_text_after_cursor_cases() {
        let provider = test_provider("test", ProviderConfig::default());
        let cases = [
            (vec!["hello world"], 1, 5, true),
            (vec!["hello"], 1, 5, false),
            (vec!["hi"], 1, 10, false),
            (vec![""], 1, 0, false),
        ];

        for (lines, row, col, want_skip) in cases {
            let mut ctx = Context::new(request(&lines, row, col));
            let outcome = skip_if_text_after_cursor()(&provider, &mut ctx);
            let skipped = matches!(outcome, Err(PipelineError::Skip));
            assert_eq!(skipped, want_skip, "lines={lines:?} col={col}");
        }
    }

    #[test]
    fn reject_empty_cases() {
        let provider = test_provider("test", ProviderConfig::default());
        let cases = [
            ("", true),
            ("   \n\t  ", true),
            ("hello", false),
            ("  hello  ", false),
        ];

        for (text, want_done) in cases {
            let mut ctx = context_with_result(
                request(&["x"], 1, 0),
                StreamResult {
                    text: text.into(),
                    ..StreamResult::default()
                },
            );
            let done = reject_empty()(&provider, &mut ctx).is_some();
            assert_eq!(done, want_done, "text={text:?}");
        }
    }

    #[test]
    fn reject_truncated_cases() {
        let provider = test_provider("test", ProviderConfig::default());
        for (finish_reason, want_done) in [("length", true), ("stop", false), ("", false)] {
            let mut ctx = context_with_result(
                request(&["x"], 1, 0),
                StreamResult {
                    text: "some content".into(),
                    finish_reason: finish_reason.into(),
                    ..StreamResult::default()
                },
            );
            let done = reject_truncated()(&provider, &mut ctx).is_some();
            assert_eq!(done, want_done, "finish_reason={finish_reason:?}");
        }
    }

    #[test]
    fn drop_last_line_if_truncated_cases() {
        let provider = test_provider("test", ProviderConfig::default());

        // Not truncated: unchanged.
        let mut ctx = context_with_result(
            request(&["x"], 1, 0),
            StreamResult {
                text: "line 1\nline 2".into(),
                finish_reason: "stop".into(),
                ..StreamResult::default()
            },
        );
        assert!(drop_last_line_if_truncated()(&provider, &mut ctx).is_none());
        assert_eq!(ctx.result.text, "line 1\nline 2");

        // Truncated multi-line: last line dropped, end line set.
        let mut ctx = context_with_result(
            request(&["x"], 1, 0),
            StreamResult {
                text: "line 1\nline 2\nincomplete".into(),
                finish_reason: "length".into(),
                ..StreamResult::default()
            },
        );
        ctx.window_start = 0;
        assert!(drop_last_line_if_truncated()(&provider, &mut ctx).is_none());
        assert_eq!(ctx.result.text, "line 1\nline 2");
        assert_eq!(ctx.end_line_inc, 2);

        // Truncated single line: rejected.
        let mut ctx = context_with_result(
            request(&["x"], 1, 0),
            StreamResult {
                text: "incomplete line".into(),
                finish_reason: "length".into(),
                ..StreamResult::default()
            },
        );
        assert!(drop_last_line_if_truncated()(&provider, &mut ctx).is_some());

        // Stopped early behaves like truncation.
        let mut ctx = context_with_result(
            request(&["x"], 1, 0),
            StreamResult {
                text: "line 1\nline 2\nincomplete".into(),
                stopped_early: true,
                ..StreamResult::default()
            },
        );
        assert!(drop_last_line_if_truncated()(&provider, &mut ctx).is_none());
        assert_eq!(ctx.result.text, "line 1\nline 2");
        assert_eq!(ctx.end_line_inc, 2);
    }

    #[test]
    fn is_no_op_replacement_cases() {
        let cases: &[(&[&str], &[&str], bool)] = &[
            (&["line 1", "line 2"], &["line 1", "line 2"], true),
            (&["line 1", "modified"], &["line 1", "line 2"], false),
            (&["line 1  "], &["line 1"], true),
            (&["line 1", ""], &["line 1"], true),
            (&["line 1", "line 2", "line 3"], &["line 1", "line 2"], false),
        ];

        for (new, old, want) in cases {
            assert_eq!(
                is_no_op_replacement(&strings(new), &strings(old)),
                *want,
                "new={new:?} old={old:?}"
            );
        }
    }

    #[test]
    fn find_anchor_line_cases() {
        let old_lines = strings(&[
            "fn main() {",
            "    println!(\"hello {}\", name);",
            "    let x = 42;",
            "    return x;",
            "}",
        ]);

        assert_eq!(
            find_anchor_line("    println!(\"hello {}\", name);", &old_lines, 1),
            1
        );
        // Similar line: two of three tokens shared.
        assert_eq!(
            find_anchor_line("    println!(\"world {}\", name);", &old_lines, 1),
            1
        );
        assert_eq!(find_anchor_line("completely different content", &old_lines, 2), -1);
    }

    #[test]
    fn find_anchor_line_full_search_cases() {
        let old_lines = strings(&["line 0", "line 1", "unique anchor here", "line 3", "line 4"]);

        assert_eq!(find_anchor_line_full_search("unique anchor here", &old_lines), 2);
        assert_eq!(find_anchor_line_full_search("not in file", &old_lines), -1);
    }

    #[test]
    fn anchor_truncation_cases() {
        let provider = test_provider("test", ProviderConfig::default());
        let old_lines: Vec<String> = (0..20).map(|_| "original line content".to_string()).collect();
        let line_refs: Vec<&str> = old_lines.iter().map(String::as_str).collect();

        // Not truncated: passes through.
        let mut ctx = context_with_result(
            request(&line_refs, 1, 0),
            StreamResult {
                text: "line 1\nline 2".into(),
                finish_reason: "stop".into(),
                ..StreamResult::default()
            },
        );
        assert!(anchor_truncation(0.75)(&provider, &mut ctx).is_none());

        // Truncated but enough surviving lines: prefix accepted.
        let text: String = (1..=15)
            .map(|i| format!("line {i}\n"))
            .collect::<String>()
            + "incomplete";
        let mut ctx = context_with_result(
            request(&line_refs, 1, 0),
            StreamResult {
                text,
                finish_reason: "length".into(),
                ..StreamResult::default()
            },
        );
        assert!(anchor_truncation(0.75)(&provider, &mut ctx).is_none());
        assert_eq!(ctx.end_line_inc, 15);

        // Truncated with too few lines: rejected.
        let mut ctx = context_with_result(
            request(&line_refs, 1, 0),
            StreamResult {
                text: "line 1\nline 2\nincomplete".into(),
                finish_reason: "length".into(),
                ..StreamResult::default()
            },
        );
        assert!(anchor_truncation(0.75)(&provider, &mut ctx).is_some());
    }

    #[test]
    fn validate_anchor_position_cases() {
        let provider = test_provider("test", ProviderConfig::default());
        // 20 unique lines with no shared tokens.
        let old_lines: Vec<String> = (0..20)
            .map(|i| format!("word{:02}{}", i, char::from(b'A' + i as u8)))
            .collect();
        let line_refs: Vec<&str> = old_lines.iter().map(String::as_str).collect();

        // First line anchors at the window start: valid.
        let mut ctx = context_with_result(
            request(&line_refs, 1, 0),
            StreamResult {
                text: format!("{}\nmore content", old_lines[0]),
                ..StreamResult::default()
            },
        );
        assert!(validate_anchor_position(0.25)(&provider, &mut ctx).is_none());

        // First line anchors far into the window: rejected.
        let mut ctx = context_with_result(
            request(&line_refs, 1, 0),
            StreamResult {
                text: format!("{}\nmore content", old_lines[14]),
                ..StreamResult::default()
            },
        );
        assert!(validate_anchor_position(0.25)(&provider, &mut ctx).is_some());
    }

    #[test]
    fn validate_anchor_skips_small_windows() {
        let ctx = Context::new(request(&["line 1", "line 2", "line 3"], 1, 0));
        assert!(validate_first_line_anchor(&ctx, "completely different", 0.25).is_ok());
    }

    #[test]
    fn build_completion_rejects_no_op() {
        let provider = test_provider("test", ProviderConfig::default());
        let ctx = Context::new(request(&["a", "b", "c"], 1, 0));

        let resp = provider.build_completion(&ctx, 2, 2, strings(&["b"]));
        assert!(resp.completions.is_empty());

        let resp = provider.build_completion(&ctx, 2, 2, strings(&["B2"]));
        assert_eq!(resp.completions.len(), 1);
        assert_eq!(resp.completions[0].start_line, 2);
    }

    #[test]
    fn build_completion_validates_pure_insertions() {
        let provider = test_provider("test", ProviderConfig::default());
        let ctx = Context::new(request(&["a", "b", "c"], 1, 0));

        // end_line_inc == start_line - 1 inserts before line 2; blank-only
        // content compares equal to the empty old slice and is a no-op.
        let resp = provider.build_completion(&ctx, 2, 1, strings(&["", "   "]));
        assert!(resp.completions.is_empty());

        // Real content at the same insertion point passes through.
        let resp = provider.build_completion(&ctx, 2, 1, strings(&["inserted"]));
        assert_eq!(resp.completions.len(), 1);
        assert_eq!(resp.completions[0].start_line, 2);
        assert_eq!(resp.completions[0].end_line_inc, 1);
    }

    #[test]
    fn context_window_lines_clamps() {
        let mut ctx = Context::new(request(&["a", "b", "c"], 1, 0));
        ctx.window_start = 1;
        ctx.window_end = 99;
        assert_eq!(ctx.window_lines(), &["b".to_string(), "c".to_string()][..]);
    }

    #[tokio::test]
    async fn skip_preprocessor_yields_empty_response() {
        let mut provider = test_provider("test", ProviderConfig::default());
        provider.preprocessors = vec![skip_if_text_after_cursor()];

        let cancel = CancellationToken::new();
        let resp = provider
            .get_completion(&cancel, request(&["hello world"], 1, 5))
            .await
            .unwrap();
        assert!(resp.is_empty());
    }
}
