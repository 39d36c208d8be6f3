// SPDX-License-Identifier: MIT
// Zeta provider: rewrite-with-markers. The model receives an instruction, the
// user's recent edits as unified diffs, optional diagnostics, and an excerpt
// whose editable region is fenced with special tokens; it answers with a
// rewritten region.

use std::sync::Arc;

use crate::client::openai;
use crate::config::ProviderConfig;
use crate::provider::{
    format_diff_history, reject_empty, Context, DiffHistoryOptions, Provider, StreamingMode,
};
use crate::types::{Completion, CompletionRequest, CompletionResponse};

pub const START_OF_FILE_TOKEN: &str = "<|start_of_file|>";
pub const EDITABLE_REGION_START: &str = "<|editable_region_start|>";
pub const EDITABLE_REGION_END: &str = "<|editable_region_end|>";
pub const CURSOR_TOKEN: &str = "<|user_cursor_is_here|>";

/// Editable window around the cursor, in lines. Heuristic stand-in for the
/// upstream token-based limits.
const EDITABLE_LINES: usize = 10;
/// Extra context lines around the editable window.
const CONTEXT_LINES: usize = 5;

pub fn new_provider(config: ProviderConfig) -> Provider {
    let client = openai::OpenAiClient::new(
        config.provider_url.clone(),
        config.completion_path.clone(),
    );
    Provider {
        name: "zeta",
        client: Arc::new(client),
        streaming: StreamingMode::None,
        stop_tokens: vec![format!("\n{EDITABLE_REGION_END}")],
        max_stream_lines: 0,
        preprocessors: vec![],
        prompt_builder: build_prompt,
        postprocessors: vec![
            reject_empty(),
            Box::new(|p, ctx| Some(parse_completion(p, ctx))),
        ],
        config,
    }
}

fn build_prompt(provider: &Provider, ctx: &Context) -> openai::CompletionRequest {
    let req = &ctx.request;
    let user_edits = build_user_edits(req);
    let diagnostics = format_diagnostics(req);
    let excerpt = build_excerpt(req);

    let mut prompt = String::new();
    prompt.push_str("### Instruction:\n");
    prompt.push_str(
        "You are a code completion assistant and your task is to analyze user edits and then \
         rewrite an excerpt that the user provides, suggesting the appropriate edits within the \
         excerpt, taking into account the cursor location.\n\n",
    );
    prompt.push_str("### User Edits:\n\n");
    prompt.push_str(&user_edits);
    prompt.push_str("\n\n");
    if !diagnostics.is_empty() {
        prompt.push_str("### Diagnostics:\n\n");
        prompt.push_str(&diagnostics);
        prompt.push_str("\n\n");
    }
    prompt.push_str("### User Excerpt:\n\n");
    prompt.push_str(&excerpt);
    prompt.push_str("\n\n### Response:\n");

    openai::CompletionRequest {
        model: provider.config.provider_model.clone(),
        prompt,
        temperature: provider.config.provider_temperature,
        max_tokens: provider.config.provider_max_tokens,
        top_k: provider.config.provider_top_k,
        stop: vec![format!("\n{EDITABLE_REGION_END}")],
        n: 1,
        echo: false,
        stream: false,
    }
}

/// Recent edits rendered per file as unified diff blocks.
fn build_user_edits(req: &CompletionRequest) -> String {
    format_diff_history(
        &req.file_diff_histories,
        &DiffHistoryOptions {
            header: |name| format!("User edited {name:?}:\n"),
            prefix: "```diff\n",
            suffix: "\n```",
            separator: "\n\n",
        },
    )
}

/// Linter errors rendered in a fenced block:
/// `line 10: [error] message (source: eslint)`.
fn format_diagnostics(req: &CompletionRequest) -> String {
    let Some(errors) = &req.linter_errors else {
        return String::new();
    };
    if errors.errors.is_empty() {
        return String::new();
    }

    let mut out = String::new();
    out.push_str("Diagnostics in \"");
    out.push_str(&errors.relative_workspace_path);
    out.push_str("\":\n```diagnostics\n");
    for err in &errors.errors {
        if let Some(range) = &err.range {
            out.push_str(&format!("line {}: ", range.start_line));
        }
        out.push_str(&format!("[{}] {}", err.severity, err.message));
        if !err.source.is_empty() {
            out.push_str(&format!(" (source: {})", err.source));
        }
        out.push('\n');
    }
    out.push_str("```");
    out
}

fn editable_window(req: &CompletionRequest) -> (usize, usize) {
    let cursor_line = req.cursor_row.saturating_sub(1);
    let start = cursor_line.saturating_sub(EDITABLE_LINES);
    let end = (cursor_line + EDITABLE_LINES + 1).min(req.lines.len());
    (start, end)
}

/// The excerpt: a code fence named after the file, context lines, the
/// editable region markers, and the cursor token at the caret.
fn build_excerpt(req: &CompletionRequest) -> String {
    let cursor_line = req.cursor_row.saturating_sub(1);
    let cursor_col = req.cursor_col;

    let (editable_start, editable_end) = editable_window(req);
    let context_start = editable_start.saturating_sub(CONTEXT_LINES);
    let context_end = (editable_end + CONTEXT_LINES).min(req.lines.len());

    let mut out = String::new();
    out.push_str("```");
    out.push_str(&req.file_path);
    out.push('\n');

    if context_start == 0 {
        out.push_str(START_OF_FILE_TOKEN);
        out.push('\n');
    }
    for line in &req.lines[context_start..editable_start] {
        out.push_str(line);
        out.push('\n');
    }

    out.push_str(EDITABLE_REGION_START);
    out.push('\n');
    for line in &req.lines[editable_start..cursor_line.min(editable_end)] {
        out.push_str(line);
        out.push('\n');
    }

    if cursor_line < req.lines.len() {
        let current = &req.lines[cursor_line];
        let col = cursor_col.min(current.len());
        out.push_str(&current[..col]);
        out.push_str(CURSOR_TOKEN);
        out.push_str(&current[col..]);
    } else {
        out.push_str(CURSOR_TOKEN);
    }

    for line in req.lines[..editable_end].iter().skip(cursor_line + 1) {
        out.push('\n');
        out.push_str(line);
    }

    out.push('\n');
    out.push_str(EDITABLE_REGION_END);

    for line in &req.lines[editable_end..context_end] {
        out.push('\n');
        out.push_str(line);
    }

    out.push_str("\n```");
    out
}

/// Extract the rewritten editable region and replace the window it covers.
/// Equal old/new text is a no-op. Missing markers fall back to splicing the
/// raw response at the cursor.
fn parse_completion(provider: &Provider, ctx: &mut Context) -> CompletionResponse {
    let req = ctx.request.clone();
    let content = ctx.result.text.replace(CURSOR_TOKEN, "");

    let Some(start_idx) = content.find(EDITABLE_REGION_START) else {
        return parse_simple_completion(provider, &req, &ctx.result.text);
    };
    let content = &content[start_idx..];
    let Some(newline_idx) = content.find('\n') else {
        return provider.empty_response();
    };
    let content = &content[newline_idx + 1..];

    let end_marker = format!("\n{EDITABLE_REGION_END}");
    let new_text = match content.find(&end_marker) {
        Some(end_idx) => &content[..end_idx],
        None => content,
    };

    let (editable_start, editable_end) = editable_window(&req);
    let old_text = req.lines[editable_start..editable_end].join("\n");

    if new_text == old_text {
        return provider.empty_response();
    }

    CompletionResponse {
        completions: vec![Completion {
            start_line: editable_start + 1,
            end_line_inc: editable_end,
            lines: new_text.split('\n').map(str::to_string).collect(),
        }],
        cursor_target: None,
    }
}

/// Marker-free fallback: treat the response as text to splice at the cursor,
/// replacing rows from the cursor down.
fn parse_simple_completion(
    provider: &Provider,
    req: &CompletionRequest,
    text: &str,
) -> CompletionResponse {
    let completion_lines: Vec<&str> = text.split('\n').collect();
    if completion_lines.is_empty() {
        return provider.empty_response();
    }

    let cursor_row = req.cursor_row;
    let mut result_lines = Vec::with_capacity(completion_lines.len());
    if cursor_row >= 1 && cursor_row <= req.lines.len() {
        let current = &req.lines[cursor_row - 1];
        let col = req.cursor_col.min(current.len());
        result_lines.push(format!("{}{}", &current[..col], completion_lines[0]));
    } else {
        result_lines.push(completion_lines[0].to_string());
    }
    for line in &completion_lines[1..] {
        result_lines.push((*line).to_string());
    }

    CompletionResponse {
        completions: vec![Completion {
            start_line: cursor_row,
            end_line_inc: cursor_row + completion_lines.len() - 1,
            lines: result_lines,
        }],
        cursor_target: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::openai::StreamResult;
    use crate::provider::test_support::{context_with_result, request};
    use crate::types::{CursorRange, DiffEntry, FileDiffHistory, LinterError, LinterErrors};

    fn provider() -> Provider {
        new_provider(ProviderConfig {
            provider_model: "zeta-7b".into(),
            ..ProviderConfig::default()
        })
    }

    #[test]
    fn stop_token_is_exact() {
        let p = provider();
        assert_eq!(p.stop_tokens, vec!["\n<|editable_region_end|>".to_string()]);
    }

    #[test]
    fn excerpt_contains_markers_and_cursor() {
        let lines: Vec<String> = (1..=40).map(|i| format!("line {i}")).collect();
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        let req = request(&refs, 20, 3);

        let excerpt = build_excerpt(&req);
        assert!(excerpt.starts_with("```test.rs\n"));
        assert!(excerpt.contains(EDITABLE_REGION_START));
        assert!(excerpt.contains(EDITABLE_REGION_END));
        assert!(excerpt.contains("lin<|user_cursor_is_here|>e 20"));
        assert!(excerpt.ends_with("\n```"));
        // Cursor at line 20 with a ±10 editable window: line 10 opens it and
        // line 9 is the last context line before the marker.
        let start_idx = excerpt.find(EDITABLE_REGION_START).unwrap();
        assert!(excerpt[..start_idx].contains("line 9\n"));
        assert!(excerpt[start_idx..].contains("line 10\n"));
    }

    #[test]
    fn excerpt_marks_start_of_file() {
        let req = request(&["only line"], 1, 0);
        let excerpt = build_excerpt(&req);
        assert!(excerpt.contains(START_OF_FILE_TOKEN));
    }

    #[test]
    fn excerpt_omits_start_of_file_deep_in_buffer() {
        let lines: Vec<String> = (1..=100).map(|i| format!("line {i}")).collect();
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        let req = request(&refs, 60, 0);

        let excerpt = build_excerpt(&req);
        assert!(!excerpt.contains(START_OF_FILE_TOKEN));
    }

    #[test]
    fn prompt_sections_in_order() {
        let p = provider();
        let mut req = (*request(&["fn main() {}"], 1, 0)).clone();
        req.file_diff_histories = vec![FileDiffHistory {
            file_name: "other.rs".into(),
            diff_history: vec![DiffEntry {
                original: "old".into(),
                updated: "new".into(),
            }],
        }];
        let ctx = Context::new(Arc::new(req));

        let wire = (p.prompt_builder)(&p, &ctx);
        let instruction = wire.prompt.find("### Instruction:").unwrap();
        let edits = wire.prompt.find("### User Edits:").unwrap();
        let excerpt = wire.prompt.find("### User Excerpt:").unwrap();
        let response = wire.prompt.find("### Response:").unwrap();
        assert!(instruction < edits && edits < excerpt && excerpt < response);
        assert!(wire.prompt.contains("User edited \"other.rs\":"));
        assert!(wire.prompt.contains("-old"));
        assert!(wire.prompt.contains("+new"));
    }

    #[test]
    fn prompt_includes_diagnostics_block() {
        let p = provider();
        let mut req = (*request(&["fn main() {}"], 1, 0)).clone();
        req.linter_errors = Some(LinterErrors {
            relative_workspace_path: "src/main.rs".into(),
            errors: vec![LinterError {
                message: "unused variable `x`".into(),
                source: "clippy".into(),
                severity: "warning".into(),
                range: Some(CursorRange {
                    start_line: 10,
                    start_character: 0,
                    end_line: 10,
                    end_character: 5,
                }),
            }],
            file_contents: String::new(),
        });
        let ctx = Context::new(Arc::new(req));

        let wire = (p.prompt_builder)(&p, &ctx);
        assert!(wire.prompt.contains("### Diagnostics:"));
        assert!(wire
            .prompt
            .contains("line 10: [warning] unused variable `x` (source: clippy)"));
    }

    #[test]
    fn prompt_omits_empty_diagnostics() {
        let p = provider();
        let ctx = Context::new(request(&["fn main() {}"], 1, 0));
        let wire = (p.prompt_builder)(&p, &ctx);
        assert!(!wire.prompt.contains("### Diagnostics:"));
    }

    #[test]
    fn parse_extracts_editable_region() {
        let p = provider();
        let lines = ["fn add(a: i32) -> i32 {", "    a", "}"];
        let mut ctx = context_with_result(
            request(&lines, 2, 5),
            StreamResult {
                text: format!(
                    "{EDITABLE_REGION_START}\nfn add(a: i32, b: i32) -> i32 {{\n    a + b\n}}\n{EDITABLE_REGION_END}"
                ),
                ..StreamResult::default()
            },
        );

        let resp = parse_completion(&p, &mut ctx);
        let completion = &resp.completions[0];
        assert_eq!(completion.start_line, 1);
        assert_eq!(completion.end_line_inc, 3);
        assert_eq!(
            completion.lines,
            vec![
                "fn add(a: i32, b: i32) -> i32 {".to_string(),
                "    a + b".to_string(),
                "}".to_string()
            ]
        );
    }

    #[test]
    fn parse_strips_cursor_marker() {
        let p = provider();
        let lines = ["let x = 1;"];
        let mut ctx = context_with_result(
            request(&lines, 1, 0),
            StreamResult {
                text: format!(
                    "{EDITABLE_REGION_START}\nlet x = {CURSOR_TOKEN}2;\n{EDITABLE_REGION_END}"
                ),
                ..StreamResult::default()
            },
        );

        let resp = parse_completion(&p, &mut ctx);
        assert_eq!(resp.completions[0].lines, vec!["let x = 2;".to_string()]);
    }

    #[test]
    fn parse_equal_region_is_no_op() {
        let p = provider();
        let lines = ["let x = 1;"];
        let mut ctx = context_with_result(
            request(&lines, 1, 0),
            StreamResult {
                text: format!("{EDITABLE_REGION_START}\nlet x = 1;\n{EDITABLE_REGION_END}"),
                ..StreamResult::default()
            },
        );

        let resp = parse_completion(&p, &mut ctx);
        assert!(resp.completions.is_empty());
    }

    #[test]
    fn parse_without_markers_splices_at_cursor() {
        let p = provider();
        let mut ctx = context_with_result(
            request(&["let x = "], 1, 8),
            StreamResult {
                text: "1;\nlet y = 2;".into(),
                ..StreamResult::default()
            },
        );

        let resp = parse_completion(&p, &mut ctx);
        let completion = &resp.completions[0];
        assert_eq!(completion.start_line, 1);
        assert_eq!(completion.end_line_inc, 2);
        assert_eq!(
            completion.lines,
            vec!["let x = 1;".to_string(), "let y = 2;".to_string()]
        );
    }
}
