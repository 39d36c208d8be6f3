// SPDX-License-Identifier: MIT
// Inline provider: end-of-line completion with token streaming.

use std::sync::Arc;

use crate::client::openai;
use crate::config::ProviderConfig;
use crate::provider::{
    reject_empty, reject_truncated, skip_if_text_after_cursor, trim_content, Context, Provider,
    StreamingMode,
};
use crate::types::{Completion, CompletionResponse};

pub fn new_provider(config: ProviderConfig) -> Provider {
    let client = openai::OpenAiClient::new(
        config.provider_url.clone(),
        config.completion_path.clone(),
    );
    Provider {
        name: "inline",
        client: Arc::new(client),
        streaming: StreamingMode::Tokens,
        stop_tokens: vec!["\n".into()],
        max_stream_lines: 0,
        preprocessors: vec![trim_content(), skip_if_text_after_cursor()],
        prompt_builder: build_prompt,
        postprocessors: vec![
            reject_empty(),
            reject_truncated(),
            Box::new(|p, ctx| Some(parse_completion(p, ctx))),
        ],
        config,
    }
}

/// Prompt = the trimmed window up to the cursor.
fn build_prompt(provider: &Provider, ctx: &Context) -> openai::CompletionRequest {
    let mut prompt = String::new();
    for line in ctx.trimmed_lines.iter().take(ctx.cursor_line) {
        prompt.push_str(line);
        prompt.push('\n');
    }
    if let Some(current) = ctx.trimmed_lines.get(ctx.cursor_line) {
        let col = ctx.request.cursor_col.min(current.len());
        prompt.push_str(&current[..col]);
    }

    openai::CompletionRequest {
        model: provider.config.provider_model.clone(),
        prompt,
        temperature: provider.config.provider_temperature,
        max_tokens: provider.config.provider_max_tokens,
        top_k: provider.config.provider_top_k,
        stop: vec!["\n".into()],
        n: 1,
        echo: false,
        stream: false,
    }
}

/// Splice the generated text after the before-cursor prefix, replacing only
/// the current row. Generating exactly what already follows the cursor is a
/// no-op.
fn parse_completion(provider: &Provider, ctx: &mut Context) -> CompletionResponse {
    let req = &ctx.request;
    let current_line = req.current_line();
    let col = req.cursor_col.min(current_line.len());
    let before_cursor = &current_line[..col];
    let after_cursor = &current_line[col..];

    if ctx.result.text == after_cursor {
        return provider.empty_response();
    }

    CompletionResponse {
        completions: vec![Completion {
            start_line: req.cursor_row,
            end_line_inc: req.cursor_row,
            lines: vec![format!("{before_cursor}{}", ctx.result.text)],
        }],
        cursor_target: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::openai::StreamResult;
    use crate::provider::test_support::{context_with_result, request};

    fn provider() -> Provider {
        new_provider(ProviderConfig {
            provider_url: "http://localhost:8080".into(),
            provider_model: "test-model".into(),
            provider_temperature: 0.7,
            provider_max_tokens: 100,
            ..ProviderConfig::default()
        })
    }

    #[test]
    fn provider_shape() {
        let p = provider();
        assert_eq!(p.name, "inline");
        assert_eq!(p.streaming, StreamingMode::Tokens);
        assert_eq!(p.preprocessors.len(), 2);
        assert_eq!(p.postprocessors.len(), 3);
        assert_eq!(p.stop_tokens, vec!["\n".to_string()]);
    }

    #[test]
    fn prompt_empty_lines() {
        let p = provider();
        let ctx = Context::new(request(&[], 1, 0));

        let wire = (p.prompt_builder)(&p, &ctx);
        assert_eq!(wire.prompt, "");
        assert_eq!(wire.model, "test-model");
        assert_eq!(wire.temperature, 0.7);
        assert_eq!(wire.max_tokens, 100);
    }

    #[test]
    fn prompt_single_line_cuts_at_cursor() {
        let p = provider();
        let mut ctx = Context::new(request(&["hello world"], 1, 5));
        ctx.trimmed_lines = vec!["hello world".into()];
        ctx.cursor_line = 0;

        let wire = (p.prompt_builder)(&p, &ctx);
        assert_eq!(wire.prompt, "hello");
    }

    #[test]
    fn prompt_multi_line() {
        let p = provider();
        let mut ctx = Context::new(request(&["line 1", "line 2", "line 3"], 3, 4));
        ctx.trimmed_lines = vec!["line 1".into(), "line 2".into(), "line 3".into()];
        ctx.cursor_line = 2;

        let wire = (p.prompt_builder)(&p, &ctx);
        assert_eq!(wire.prompt, "line 1\nline 2\nline");
    }

    #[test]
    fn prompt_cursor_beyond_line_length() {
        let p = provider();
        let mut ctx = Context::new(request(&["short"], 1, 100));
        ctx.trimmed_lines = vec!["short".into()];
        ctx.cursor_line = 0;

        let wire = (p.prompt_builder)(&p, &ctx);
        assert_eq!(wire.prompt, "short");
    }

    #[test]
    fn parse_merges_with_current_line() {
        let p = provider();
        let mut ctx = context_with_result(
            request(&["func main() {"], 1, 13),
            StreamResult {
                text: " fmt.Println()".into(),
                ..StreamResult::default()
            },
        );

        let resp = parse_completion(&p, &mut ctx);
        assert_eq!(resp.completions.len(), 1);
        let completion = &resp.completions[0];
        assert_eq!(completion.start_line, 1);
        assert_eq!(completion.end_line_inc, 1);
        assert_eq!(completion.lines[0], "func main() { fmt.Println()");
    }

    #[test]
    fn parse_clamps_cursor_beyond_line() {
        let p = provider();
        let mut ctx = context_with_result(
            request(&["abc"], 1, 100),
            StreamResult {
                text: "def".into(),
                ..StreamResult::default()
            },
        );

        let resp = parse_completion(&p, &mut ctx);
        assert_eq!(resp.completions[0].lines[0], "abcdef");
    }

    #[test]
    fn parse_rejects_text_already_after_cursor() {
        let p = provider();
        let mut ctx = context_with_result(
            request(&["let x = value;"], 1, 8),
            StreamResult {
                text: "value;".into(),
                ..StreamResult::default()
            },
        );

        let resp = parse_completion(&p, &mut ctx);
        assert!(resp.completions.is_empty());
    }
}
