// SPDX-License-Identifier: MIT
// Fill-in-the-middle provider: multi-line completion between a prefix and
// suffix wrapped in FIM tokens.

use std::sync::Arc;

use crate::client::openai;
use crate::config::ProviderConfig;
use crate::provider::{
    drop_last_line_if_truncated, reject_empty, trim_content, Context, Provider, StreamingMode,
};
use crate::types::{Completion, CompletionResponse};

pub const FIM_PREFIX_TOKEN: &str = "<|fim_prefix|>";
pub const FIM_SUFFIX_TOKEN: &str = "<|fim_suffix|>";
pub const FIM_MIDDLE_TOKEN: &str = "<|fim_middle|>";

pub fn new_provider(config: ProviderConfig) -> Provider {
    let client = openai::OpenAiClient::new(
        config.provider_url.clone(),
        config.completion_path.clone(),
    );
    Provider {
        name: "fim",
        client: Arc::new(client),
        streaming: StreamingMode::None,
        stop_tokens: vec![],
        max_stream_lines: 0,
        preprocessors: vec![trim_content()],
        prompt_builder: build_prompt,
        postprocessors: vec![
            reject_empty(),
            drop_last_line_if_truncated(),
            Box::new(|p, ctx| Some(parse_completion(p, ctx))),
        ],
        config,
    }
}

/// Prompt = `<|fim_prefix|>{prefix}<|fim_suffix|>{suffix}<|fim_middle|>`
/// over the trimmed window, split at the cursor.
fn build_prompt(provider: &Provider, ctx: &Context) -> openai::CompletionRequest {
    let mut prefix = String::new();
    let mut suffix = String::new();

    for line in ctx.trimmed_lines.iter().take(ctx.cursor_line) {
        prefix.push_str(line);
        prefix.push('\n');
    }
    if let Some(current) = ctx.trimmed_lines.get(ctx.cursor_line) {
        let col = ctx.request.cursor_col.min(current.len());
        prefix.push_str(&current[..col]);
        suffix.push_str(&current[col..]);
    }
    for line in ctx.trimmed_lines.iter().skip(ctx.cursor_line + 1) {
        suffix.push('\n');
        suffix.push_str(line);
    }

    openai::CompletionRequest {
        model: provider.config.provider_model.clone(),
        prompt: format!("{FIM_PREFIX_TOKEN}{prefix}{FIM_SUFFIX_TOKEN}{suffix}{FIM_MIDDLE_TOKEN}"),
        temperature: provider.config.provider_temperature,
        max_tokens: provider.config.provider_max_tokens,
        top_k: provider.config.provider_top_k,
        stop: vec![],
        n: 1,
        echo: false,
        stream: false,
    }
}

/// Build a replacement for the current row: the first generated line splices
/// after the before-cursor prefix, the last line carries the after-cursor
/// suffix; middle lines insert as-is.
fn parse_completion(provider: &Provider, ctx: &mut Context) -> CompletionResponse {
    let req = &ctx.request;
    let current_line = req.current_line();
    let col = req.cursor_col.min(current_line.len());
    let before_cursor = &current_line[..col];
    let after_cursor = &current_line[col..];

    let completion_lines: Vec<&str> = ctx.result.text.split('\n').collect();
    let mut result_lines: Vec<String> = Vec::with_capacity(completion_lines.len());
    result_lines.push(format!("{before_cursor}{}", completion_lines[0]));
    for line in &completion_lines[1..] {
        result_lines.push((*line).to_string());
    }
    if let Some(last) = result_lines.last_mut() {
        last.push_str(after_cursor);
    }

    if result_lines.len() == 1 && result_lines[0] == current_line {
        return provider.empty_response();
    }

    CompletionResponse {
        completions: vec![Completion {
            start_line: req.cursor_row,
            end_line_inc: req.cursor_row,
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
    use crate::provider::CompletionProvider;
    use tokio_util::sync::CancellationToken;

    fn provider() -> Provider {
        new_provider(ProviderConfig {
            provider_model: "fim-model".into(),
            provider_max_tokens: 200,
            ..ProviderConfig::default()
        })
    }

    #[test]
    fn provider_shape() {
        let p = provider();
        assert_eq!(p.name, "fim");
        assert_eq!(p.streaming, StreamingMode::None);
        assert_eq!(p.preprocessors.len(), 1);
        assert_eq!(p.postprocessors.len(), 3);
    }

    #[test]
    fn prompt_wraps_prefix_and_suffix() {
        let p = provider();
        let mut ctx = Context::new(request(&["fn foo() {", "", "}"], 2, 0));
        ctx.trimmed_lines = vec!["fn foo() {".into(), "".into(), "}".into()];
        ctx.cursor_line = 1;

        let wire = (p.prompt_builder)(&p, &ctx);
        assert_eq!(
            wire.prompt,
            "<|fim_prefix|>fn foo() {\n<|fim_suffix|>\n}<|fim_middle|>"
        );
    }

    #[test]
    fn prompt_token_order() {
        let p = provider();
        let mut ctx = Context::new(request(&["prefix line", "suffix line"], 1, 11));
        ctx.trimmed_lines = vec!["prefix line".into(), "suffix line".into()];
        ctx.cursor_line = 0;

        let wire = (p.prompt_builder)(&p, &ctx);
        let pi = wire.prompt.find(FIM_PREFIX_TOKEN).unwrap();
        let si = wire.prompt.find(FIM_SUFFIX_TOKEN).unwrap();
        let mi = wire.prompt.find(FIM_MIDDLE_TOKEN).unwrap();
        assert!(pi < si && si < mi);
    }

    #[test]
    fn parse_splices_multi_line() {
        let p = provider();
        let mut ctx = context_with_result(
            request(&["fn foo() {", "", "}"], 2, 0),
            StreamResult {
                text: "    return 1\n    return 2".into(),
                ..StreamResult::default()
            },
        );

        let resp = parse_completion(&p, &mut ctx);
        let completion = &resp.completions[0];
        assert_eq!(completion.start_line, 2);
        assert_eq!(completion.end_line_inc, 2, "replaces the current row only");
        assert_eq!(
            completion.lines,
            vec!["    return 1".to_string(), "    return 2".to_string()]
        );
    }

    #[test]
    fn parse_carries_text_around_cursor() {
        let p = provider();
        let mut ctx = context_with_result(
            request(&["let v = [];"], 1, 9),
            StreamResult {
                text: "1, 2".into(),
                ..StreamResult::default()
            },
        );

        let resp = parse_completion(&p, &mut ctx);
        assert_eq!(resp.completions[0].lines, vec!["let v = [1, 2];".to_string()]);
    }

    #[test]
    fn parse_rejects_single_line_no_op() {
        let p = provider();
        let mut ctx = context_with_result(
            request(&["done"], 1, 4),
            StreamResult {
                text: "".into(),
                ..StreamResult::default()
            },
        );

        let resp = parse_completion(&p, &mut ctx);
        assert!(resp.completions.is_empty());
    }

    /// The seed scenario: truncated multi-line output drops its last line and
    /// still replaces only the cursor row.
    #[tokio::test]
    async fn truncated_multi_line_drops_last_line() {
        struct FixedClient;

        #[async_trait::async_trait]
        impl crate::provider::TransportClient for FixedClient {
            async fn do_completion(
                &self,
                _cancel: &CancellationToken,
                _req: &openai::CompletionRequest,
            ) -> anyhow::Result<StreamResult> {
                Ok(StreamResult {
                    text: "    return 1\n    return 2\n    retu".into(),
                    finish_reason: "length".into(),
                    ..StreamResult::default()
                })
            }

            fn open_stream(
                &self,
                _cancel: &CancellationToken,
                _req: &openai::CompletionRequest,
                _mode: StreamingMode,
                _stop_tokens: Vec<String>,
                _max_lines: usize,
            ) -> Option<crate::client::openai::StreamHandle> {
                None
            }
        }

        let mut p = provider();
        p.client = Arc::new(FixedClient);

        let cancel = CancellationToken::new();
        let resp = p
            .get_completion(&cancel, request(&["fn foo() {", "", "}"], 2, 0))
            .await
            .unwrap();

        let completion = &resp.completions[0];
        assert_eq!(completion.start_line, 2);
        assert_eq!(completion.end_line_inc, 2);
        assert_eq!(
            completion.lines,
            vec!["    return 1".to_string(), "    return 2".to_string()],
            "the incomplete trailing line is dropped"
        );
    }
}
