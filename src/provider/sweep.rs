// SPDX-License-Identifier: MIT
// Sweep provider. Two dialects share the pipeline: a local OpenAI-compatible
// server fed file-separator sections, and the hosted byte-offset edit
// endpoint. The URL decides which one runs (localhost means local).

use std::sync::Arc;

use anyhow::{anyhow, Context as _, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::client::openai;
use crate::client::openai::StreamResult;
use crate::client::sweep::{AutocompleteRequest, SweepClient};
use crate::config::ProviderConfig;
use crate::provider::{
    anchor_truncation, format_diff_history_original_updated, reject_empty, trim_content,
    validate_anchor_position, Context, Provider, StreamingMode, TransportClient,
};
use crate::types::{CompletionRequest, CompletionResponse};

const MAX_ANCHOR_RATIO: f64 = 0.25;
const TRUNCATION_RATIO: f64 = 0.75;

fn is_hosted_sweep(url: &str) -> bool {
    !url.contains("localhost") && !url.contains("127.0.0.1")
}

pub fn new_provider(config: ProviderConfig) -> Result<Provider> {
    if is_hosted_sweep(&config.provider_url) {
        new_hosted_provider(config)
    } else {
        Ok(new_local_provider(config))
    }
}

// ─── Local dialect ────────────────────────────────────────────────────────────

fn new_local_provider(config: ProviderConfig) -> Provider {
    let client = openai::OpenAiClient::new(
        config.provider_url.clone(),
        config.completion_path.clone(),
    );
    Provider {
        name: "sweep-local",
        client: Arc::new(client),
        streaming: StreamingMode::Lines,
        stop_tokens: vec!["<|file_sep|>".into(), "</s>".into()],
        max_stream_lines: 0,
        preprocessors: vec![trim_content()],
        prompt_builder: build_local_prompt,
        postprocessors: vec![
            reject_empty(),
            validate_anchor_position(MAX_ANCHOR_RATIO),
            anchor_truncation(TRUNCATION_RATIO),
            Box::new(|p, ctx| Some(parse_local_completion(p, ctx))),
        ],
        config,
    }
}

/// Prompt = optional diff section, then `original/`, `current/`, and an open
/// `updated/` section the model completes.
fn build_local_prompt(provider: &Provider, ctx: &Context) -> openai::CompletionRequest {
    let req = &ctx.request;
    let mut prompt = String::new();

    if req.lines.is_empty() {
        prompt.push_str(&format!("<|file_sep|>original/{}\n\n", req.file_path));
        prompt.push_str(&format!("<|file_sep|>current/{}\n\n", req.file_path));
        prompt.push_str(&format!("<|file_sep|>updated/{}\n", req.file_path));
    } else {
        let diff_section = format_diff_history_original_updated(&req.file_diff_histories, |name| {
            format!("<|file_sep|>{name}.diff\n")
        });
        prompt.push_str(&diff_section);

        let original = trimmed_original_content(req, ctx.window_start, ctx.trimmed_lines.len());
        prompt.push_str(&format!("<|file_sep|>original/{}\n", req.file_path));
        prompt.push_str(&original.join("\n"));
        prompt.push('\n');
        prompt.push_str(&format!("<|file_sep|>current/{}\n", req.file_path));
        prompt.push_str(&ctx.trimmed_lines.join("\n"));
        prompt.push('\n');
        prompt.push_str(&format!("<|file_sep|>updated/{}\n", req.file_path));
    }

    openai::CompletionRequest {
        model: provider.config.provider_model.clone(),
        prompt,
        temperature: provider.config.provider_temperature,
        max_tokens: provider.config.provider_max_tokens,
        top_k: provider.config.provider_top_k,
        stop: vec!["<|file_sep|>".into(), "</s>".into()],
        n: 1,
        echo: false,
        stream: false,
    }
}

/// The pre-edit content for the same window the trim pass selected.
fn trimmed_original_content(
    req: &CompletionRequest,
    window_start: usize,
    line_count: usize,
) -> Vec<String> {
    let source = if req.previous_lines.is_empty() {
        &req.lines
    } else {
        &req.previous_lines
    };

    if window_start >= source.len() {
        return Vec::new();
    }
    let window_end = (window_start + line_count).min(source.len());
    source[window_start..window_end].to_vec()
}

/// The model rewrites the window; diff it against the old window content.
fn parse_local_completion(provider: &Provider, ctx: &mut Context) -> CompletionResponse {
    let req = ctx.request.clone();
    let mut text = ctx.result.text.as_str();
    text = text.strip_suffix("<|file_sep|>").unwrap_or(text);
    text = text.strip_suffix("</s>").unwrap_or(text);
    let text = text.trim_end_matches([' ', '\t', '\n', '\r']);

    let window_start = ctx.window_start.min(req.lines.len());
    let window_end = ctx.window_end.min(req.lines.len());
    if window_start >= window_end {
        return provider.empty_response();
    }

    let old_lines = &req.lines[window_start..window_end];
    let old_text_joined = old_lines.join("\n");
    let old_text = old_text_joined.trim_end_matches([' ', '\t', '\n', '\r']);
    if text == old_text {
        return provider.empty_response();
    }

    let new_lines: Vec<String> = text.split('\n').map(str::to_string).collect();
    let end_line_inc = if ctx.end_line_inc != 0 {
        ctx.end_line_inc
    } else {
        (window_start + new_lines.len()).min(window_end)
    };

    provider.build_completion(ctx, window_start + 1, end_line_inc, new_lines)
}

// ─── Hosted dialect ───────────────────────────────────────────────────────────

fn new_hosted_provider(config: ProviderConfig) -> Result<Provider> {
    let api_key = config.resolve_api_key().ok_or_else(|| {
        anyhow!(
            "hosted Sweep requires an API key: set {} or provide apiKey in config",
            config.api_key_env_name()
        )
    })?;
    let client = SweepClient::new(config.provider_url.clone(), api_key)
        .context("failed to create sweep client")?;

    Ok(Provider {
        name: "sweep-hosted",
        client: Arc::new(HostedSweepTransport { client }),
        streaming: StreamingMode::None,
        stop_tokens: vec![],
        max_stream_lines: 0,
        preprocessors: vec![trim_content()],
        prompt_builder: build_hosted_prompt,
        postprocessors: vec![
            reject_empty(),
            validate_anchor_position(MAX_ANCHOR_RATIO),
            anchor_truncation(TRUNCATION_RATIO),
            Box::new(|p, ctx| Some(parse_hosted_completion(p, ctx))),
        ],
        config,
    })
}

/// Structured request context carried through the prompt field as JSON; the
/// hosted transport decodes it into the wire request.
#[derive(Debug, Serialize, Deserialize, Default)]
struct HostedPromptContext {
    file_path: String,
    file_contents: String,
    original_file_contents: String,
    cursor_position: usize,
    recent_changes: String,
    repo_name: String,
}

fn build_hosted_prompt(provider: &Provider, ctx: &Context) -> openai::CompletionRequest {
    let req = &ctx.request;
    let file_contents = ctx.trimmed_lines.join("\n");
    let original_contents = if req.previous_lines.is_empty() {
        file_contents.clone()
    } else {
        req.previous_lines.join("\n")
    };

    // Cursor as a byte offset into the trimmed content.
    let mut cursor_position = 0;
    for (i, line) in ctx.trimmed_lines.iter().enumerate() {
        if i < ctx.cursor_line {
            cursor_position += line.len() + 1;
        } else {
            cursor_position += req.cursor_col.min(line.len());
            break;
        }
    }

    let context = HostedPromptContext {
        file_path: req.file_path.clone(),
        file_contents,
        original_file_contents: original_contents,
        cursor_position,
        recent_changes: build_recent_changes(req),
        repo_name: extract_repo_name(&req.file_path),
    };

    openai::CompletionRequest {
        model: "sweep".into(),
        prompt: serde_json::to_string(&context).unwrap_or_default(),
        temperature: provider.config.provider_temperature,
        max_tokens: provider.config.provider_max_tokens,
        top_k: provider.config.provider_top_k,
        stop: vec![],
        n: 1,
        echo: false,
        stream: false,
    }
}

/// Recent edits as paired -/+ lines per file.
fn build_recent_changes(req: &CompletionRequest) -> String {
    let mut out = String::new();
    for history in &req.file_diff_histories {
        for entry in &history.diff_history {
            if entry.original.is_empty() && entry.updated.is_empty() {
                continue;
            }
            out.push_str(&format!("File: {}:\n", history.file_name));
            if !entry.original.is_empty() {
                out.push_str(&format!("-{}\n", entry.original));
            }
            if !entry.updated.is_empty() {
                out.push_str(&format!("+{}\n", entry.updated));
            }
        }
    }
    out
}

/// Repository name heuristic: the directory above `src`/`lib`/`app`/`pkg`,
/// else the file's parent directory.
fn extract_repo_name(file_path: &str) -> String {
    let parts: Vec<&str> = file_path.split('/').collect();
    for (i, part) in parts.iter().enumerate() {
        if matches!(*part, "src" | "lib" | "app" | "pkg") && i > 0 {
            return parts[i - 1].to_string();
        }
    }
    if parts.len() >= 2 {
        return parts[parts.len() - 2].to_string();
    }
    "unknown".to_string()
}

/// Adapts the Sweep wire client to the pipeline transport seam.
struct HostedSweepTransport {
    client: SweepClient,
}

#[async_trait]
impl TransportClient for HostedSweepTransport {
    async fn do_completion(
        &self,
        cancel: &CancellationToken,
        req: &openai::CompletionRequest,
    ) -> Result<StreamResult> {
        let context: HostedPromptContext =
            serde_json::from_str(&req.prompt).unwrap_or_default();

        let wire = AutocompleteRequest {
            debug_info: "tabd".into(),
            repo_name: context.repo_name,
            branch: None,
            file_path: context.file_path,
            file_contents: context.file_contents,
            recent_changes: context.recent_changes,
            cursor_position: context.cursor_position,
            original_file_contents: context.original_file_contents,
            file_chunks: vec![],
            retrieval_chunks: vec![],
            recent_user_actions: vec![],
            multiple_suggestions: false,
            privacy_mode_enabled: false,
            changes_above_cursor: true,
            use_bytes: true,
        };

        let resp = self.client.do_autocomplete(cancel, &wire).await?;
        Ok(StreamResult {
            text: resp.completion,
            finish_reason: resp.finish_reason.unwrap_or_else(|| "stop".into()),
            stopped_early: false,
            byte_range: Some((resp.start_index, resp.end_index)),
        })
    }

    fn open_stream(
        &self,
        _cancel: &CancellationToken,
        _req: &openai::CompletionRequest,
        _mode: StreamingMode,
        _stop_tokens: Vec<String>,
        _max_lines: usize,
    ) -> Option<openai::StreamHandle> {
        None
    }
}

/// Apply the `[start, end)` byte edit, line-diff against the old content, and
/// emit a completion covering exactly the changed line range.
fn parse_hosted_completion(provider: &Provider, ctx: &mut Context) -> CompletionResponse {
    let completion_text = ctx.result.text.clone();
    if completion_text.is_empty() {
        return provider.empty_response();
    }
    let Some((start, end)) = ctx.result.byte_range else {
        return parse_local_completion(provider, ctx);
    };

    let req = ctx.request.clone();
    let file_contents = req.lines.join("\n");

    let mut start = clamp_to_char_boundary(&file_contents, start);
    let end = clamp_to_char_boundary(&file_contents, end);
    if start > end {
        start = end;
    }

    let old_text = &file_contents[start..end];
    if completion_text == old_text {
        return provider.empty_response();
    }

    let new_contents = format!(
        "{}{}{}",
        &file_contents[..start],
        completion_text,
        &file_contents[end..]
    );
    let new_lines: Vec<String> = new_contents.split('\n').map(str::to_string).collect();
    let old_lines = &req.lines;

    // Locate the changed line range from both ends.
    let mut first = 0;
    while first < old_lines.len()
        && first < new_lines.len()
        && old_lines[first] == new_lines[first]
    {
        first += 1;
    }
    if first == old_lines.len() && first == new_lines.len() {
        return provider.empty_response();
    }

    let max_suffix = old_lines.len().min(new_lines.len()) - first;
    let mut suffix = 0;
    while suffix < max_suffix
        && old_lines[old_lines.len() - 1 - suffix] == new_lines[new_lines.len() - 1 - suffix]
    {
        suffix += 1;
    }

    let start_line = first + 1;
    let old_end = old_lines.len() - suffix;
    let new_end = new_lines.len() - suffix;
    let replacement: Vec<String> = new_lines[first..new_end].to_vec();

    provider.build_completion(ctx, start_line, old_end, replacement)
}

fn clamp_to_char_boundary(text: &str, mut idx: usize) -> usize {
    idx = idx.min(text.len());
    while idx > 0 && !text.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::test_support::{context_with_result, request};
    use crate::provider::CompletionProvider;
    use crate::types::{DiffEntry, FileDiffHistory};

    #[test]
    fn hosted_detection() {
        assert!(is_hosted_sweep("https://autocomplete.sweep.dev"));
        assert!(!is_hosted_sweep("http://localhost:8000"));
        assert!(!is_hosted_sweep("http://127.0.0.1:8000"));
    }

    #[test]
    fn recent_changes_format() {
        let mut req = (*request(&["a"], 1, 0)).clone();
        req.file_diff_histories = vec![FileDiffHistory {
            file_name: "other.rs".into(),
            diff_history: vec![DiffEntry {
                original: "old".into(),
                updated: "new".into(),
            }],
        }];

        assert_eq!(build_recent_changes(&req), "File: other.rs:\n-old\n+new\n");
    }

    #[test]
    fn repo_name_heuristic() {
        assert_eq!(extract_repo_name("/home/me/repo/src/main.rs"), "repo");
        assert_eq!(extract_repo_name("/home/me/repo/lib/x.rs"), "repo");
        assert_eq!(extract_repo_name("/home/me/repo/pkg/x.rs"), "repo");
        assert_eq!(extract_repo_name("/home/me/repo/main.rs"), "repo");
        assert_eq!(extract_repo_name("lone.rs"), "unknown");
    }

    #[test]
    fn local_prompt_has_three_sections() {
        let provider = new_local_provider(ProviderConfig {
            provider_model: "sweep-small".into(),
            ..ProviderConfig::default()
        });
        let mut ctx = Context::new(request(&["line 1", "line 2"], 1, 0));
        ctx.trimmed_lines = vec!["line 1".into(), "line 2".into()];
        ctx.window_end = 2;

        let wire = (provider.prompt_builder)(&provider, &ctx);
        let original = wire.prompt.find("<|file_sep|>original/test.rs").unwrap();
        let current = wire.prompt.find("<|file_sep|>current/test.rs").unwrap();
        let updated = wire.prompt.find("<|file_sep|>updated/test.rs").unwrap();
        assert!(original < current && current < updated);
        assert_eq!(wire.stop, vec!["<|file_sep|>".to_string(), "</s>".to_string()]);
    }

    #[test]
    fn local_prompt_includes_diff_section() {
        let provider = new_local_provider(ProviderConfig::default());
        let mut req = (*request(&["line 1"], 1, 0)).clone();
        req.file_diff_histories = vec![FileDiffHistory {
            file_name: "other.rs".into(),
            diff_history: vec![DiffEntry {
                original: "old line".into(),
                updated: "new line".into(),
            }],
        }];
        let mut ctx = Context::new(Arc::new(req));
        ctx.trimmed_lines = vec!["line 1".into()];

        let wire = (provider.prompt_builder)(&provider, &ctx);
        assert!(wire.prompt.contains("<|file_sep|>other.rs.diff"));
        assert!(wire.prompt.contains("original:\nold line"));
        assert!(wire.prompt.contains("updated:\nnew line"));
    }

    #[test]
    fn parse_local_rewrites_window() {
        let provider = new_local_provider(ProviderConfig::default());
        let mut ctx = context_with_result(
            request(&["fn a() {}", "fn b() {}"], 1, 0),
            StreamResult {
                text: "fn a() { body() }\nfn b() {}".into(),
                ..StreamResult::default()
            },
        );
        ctx.window_start = 0;
        ctx.window_end = 2;

        let resp = parse_local_completion(&provider, &mut ctx);
        let completion = &resp.completions[0];
        assert_eq!(completion.start_line, 1);
        assert_eq!(completion.end_line_inc, 2);
        assert_eq!(completion.lines[0], "fn a() { body() }");
    }

    #[test]
    fn parse_local_no_op_window() {
        let provider = new_local_provider(ProviderConfig::default());
        let mut ctx = context_with_result(
            request(&["fn a() {}"], 1, 0),
            StreamResult {
                text: "fn a() {}<|file_sep|>".into(),
                ..StreamResult::default()
            },
        );
        ctx.window_start = 0;
        ctx.window_end = 1;

        let resp = parse_local_completion(&provider, &mut ctx);
        assert!(resp.completions.is_empty());
    }

    #[test]
    fn parse_hosted_replaces_byte_range() {
        let provider = new_local_provider(ProviderConfig::default());
        let mut ctx = context_with_result(
            request(&["a", "b", "c"], 2, 0),
            StreamResult {
                text: "B2".into(),
                byte_range: Some((2, 3)),
                ..StreamResult::default()
            },
        );

        let resp = parse_hosted_completion(&provider, &mut ctx);
        let completion = &resp.completions[0];
        assert_eq!(completion.start_line, 2);
        assert_eq!(completion.end_line_inc, 2);
        assert_eq!(completion.lines, vec!["B2".to_string()]);
    }

    #[test]
    fn parse_hosted_no_op_returns_empty() {
        let provider = new_local_provider(ProviderConfig::default());
        let mut ctx = context_with_result(
            request(&["a", "b", "c"], 1, 0),
            StreamResult {
                text: "b".into(),
                byte_range: Some((2, 3)),
                ..StreamResult::default()
            },
        );

        let resp = parse_hosted_completion(&provider, &mut ctx);
        assert!(resp.completions.is_empty());
    }

    #[test]
    fn parse_hosted_clamps_out_of_range_indices() {
        let provider = new_local_provider(ProviderConfig::default());
        let mut ctx = context_with_result(
            request(&["ab"], 1, 0),
            StreamResult {
                text: "xy".into(),
                byte_range: Some((100, 200)),
                ..StreamResult::default()
            },
        );

        let resp = parse_hosted_completion(&provider, &mut ctx);
        assert_eq!(resp.completions.len(), 1);
        assert_eq!(resp.completions[0].lines, vec!["abxy".to_string()]);
    }

    #[test]
    fn parse_hosted_pure_insertion_between_lines() {
        let provider = new_local_provider(ProviderConfig::default());
        // Insert "c\n" between "a" and "b": byte range [2, 2).
        let mut ctx = context_with_result(
            request(&["a", "b"], 1, 0),
            StreamResult {
                text: "c\n".into(),
                byte_range: Some((2, 2)),
                ..StreamResult::default()
            },
        );

        let resp = parse_hosted_completion(&provider, &mut ctx);
        let completion = &resp.completions[0];
        assert_eq!(completion.start_line, 2);
        assert_eq!(completion.end_line_inc, 1, "pure insertion before line 2");
        assert_eq!(completion.lines, vec!["c".to_string()]);
    }

    #[test]
    fn parse_hosted_blank_insertion_is_no_op() {
        let provider = new_local_provider(ProviderConfig::default());
        // Inserting only a blank line changes nothing after right-trim.
        let mut ctx = context_with_result(
            request(&["a", "b"], 1, 0),
            StreamResult {
                text: "\n".into(),
                byte_range: Some((2, 2)),
                ..StreamResult::default()
            },
        );

        let resp = parse_hosted_completion(&provider, &mut ctx);
        assert!(resp.completions.is_empty());
    }

    #[test]
    fn parse_hosted_multi_line_replacement() {
        let provider = new_local_provider(ProviderConfig::default());
        // Replace "b" (bytes 2..3) with two lines.
        let mut ctx = context_with_result(
            request(&["a", "b", "c"], 2, 0),
            StreamResult {
                text: "b1\nb2".into(),
                byte_range: Some((2, 3)),
                ..StreamResult::default()
            },
        );

        let resp = parse_hosted_completion(&provider, &mut ctx);
        let completion = &resp.completions[0];
        assert_eq!(completion.start_line, 2);
        assert_eq!(completion.end_line_inc, 2);
        assert_eq!(completion.lines, vec!["b1".to_string(), "b2".to_string()]);
    }

    #[tokio::test]
    async fn hosted_flow_through_stub_transport() {
        struct StubTransport {
            result: StreamResult,
        }

        #[async_trait]
        impl TransportClient for StubTransport {
            async fn do_completion(
                &self,
                _cancel: &CancellationToken,
                req: &openai::CompletionRequest,
            ) -> Result<StreamResult> {
                // The prompt must decode as the hosted context.
                let context: HostedPromptContext = serde_json::from_str(&req.prompt)?;
                assert_eq!(context.repo_name, "repo");
                Ok(self.result.clone())
            }

            fn open_stream(
                &self,
                _cancel: &CancellationToken,
                _req: &openai::CompletionRequest,
                _mode: StreamingMode,
                _stop_tokens: Vec<String>,
                _max_lines: usize,
            ) -> Option<openai::StreamHandle> {
                None
            }
        }

        let mut provider = new_local_provider(ProviderConfig::default());
        provider.name = "sweep-hosted";
        provider.prompt_builder = build_hosted_prompt;
        provider.postprocessors = vec![
            reject_empty(),
            Box::new(|p, ctx| Some(parse_hosted_completion(p, ctx))),
        ];
        provider.client = Arc::new(StubTransport {
            result: StreamResult {
                text: "B2".into(),
                finish_reason: "stop".into(),
                byte_range: Some((2, 3)),
                ..StreamResult::default()
            },
        });

        let cancel = CancellationToken::new();
        let mut req = (*request(&["a", "b", "c"], 2, 0)).clone();
        req.file_path = "/home/me/repo/src/main.rs".into();

        let resp = provider
            .get_completion(&cancel, Arc::new(req))
            .await
            .unwrap();
        assert_eq!(resp.completions.len(), 1);
        assert_eq!(resp.completions[0].start_line, 2);
        assert_eq!(resp.completions[0].lines, vec!["B2".to_string()]);
    }

    #[test]
    fn hosted_provider_requires_api_key() {
        let config = ProviderConfig {
            provider_url: "https://autocomplete.sweep.dev".into(),
            api_key: String::new(),
            api_key_env: "TABD_TEST_MISSING_KEY".into(),
            ..ProviderConfig::default()
        };
        assert!(new_provider(config).is_err());
    }

    #[test]
    fn local_provider_shape() {
        let provider = new_local_provider(ProviderConfig::default());
        assert_eq!(provider.name, "sweep-local");
        assert_eq!(provider.streaming, StreamingMode::Lines);
        assert_eq!(provider.postprocessors.len(), 4);
    }
}
