// SPDX-License-Identifier: MIT
// Core data model shared between the engine, the text layer, and providers.

use serde::{Deserialize, Serialize};

/// A replacement instruction: swap the 1-indexed inclusive line range
/// `[start_line, end_line_inc]` for `lines`.
///
/// An empty `lines` with a non-empty range is a deletion.
/// `end_line_inc == start_line - 1` is a pure insertion before `start_line`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub start_line: usize,
    pub end_line_inc: usize,
    pub lines: Vec<String>,
}

/// What triggered a completion request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionSource {
    Typing,
    Idle,
}

/// A predicted cursor-jump location.
///
/// `should_retrigger` marks targets whose acceptance must issue a fresh
/// completion request instead of consuming prefetched data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorTarget {
    pub relative_path: String,
    pub line_number: i32, // 1-indexed
    pub expected_content: String,
    pub should_retrigger: bool,
}

/// One stage of a multi-stage completion plan.
#[derive(Debug, Clone)]
pub struct CompletionStage {
    pub completion: Completion,
    pub cursor_target: CursorTarget,
    pub is_last_stage: bool,
    pub visual_groups: Vec<VisualGroup>,
}

/// Consecutive same-type changes, for UI alignment.
///
/// Coordinates are 1-indexed relative to the stage content, never to the file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VisualGroup {
    #[serde(rename = "type")]
    pub kind: String, // "modification" or "addition"
    #[serde(rename = "startLine")]
    pub start_line: usize,
    #[serde(rename = "endLine")]
    pub end_line: usize,
    pub lines: Vec<String>,
    #[serde(rename = "oldLines")]
    pub old_lines: Vec<String>,
}

/// The queue of pending stages.
///
/// `cumulative_offset` tracks net line-count drift from already-accepted
/// stages so later stages' buffer coordinates stay correct.
#[derive(Debug, Clone, Default)]
pub struct StagedCompletion {
    pub stages: Vec<CompletionStage>,
    pub current_idx: usize,
    pub source_path: String,
    pub cumulative_offset: i64,
}

/// A single recorded edit: the text before and after one change.
///
/// Providers render these in their own prompt formats.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffEntry {
    pub original: String,
    pub updated: String,
}

/// Cumulative diff entries for one file in the workspace.
#[derive(Debug, Clone, Default)]
pub struct FileDiffHistory {
    pub file_name: String,
    pub diff_history: Vec<DiffEntry>,
}

/// Linter diagnostics for the current file, when an LSP is active.
#[derive(Debug, Clone, Default)]
pub struct LinterErrors {
    pub relative_workspace_path: String,
    pub errors: Vec<LinterError>,
    pub file_contents: String,
}

#[derive(Debug, Clone)]
pub struct LinterError {
    pub message: String,
    pub source: String,
    pub severity: String,
    pub range: Option<CursorRange>,
}

/// A range in the file (LSP conventions: 1-indexed lines, 0-indexed columns).
#[derive(Debug, Clone, Copy)]
pub struct CursorRange {
    pub start_line: usize,
    pub start_character: usize,
    pub end_line: usize,
    pub end_character: usize,
}

/// Everything a provider needs to produce a completion.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub source: CompletionSource,
    pub workspace_path: String,
    pub file_path: String,
    pub lines: Vec<String>,
    pub version: u64,
    /// File content before the most recent edit.
    pub previous_lines: Vec<String>,
    /// Per-file diff histories, ordered; current file last.
    pub file_diff_histories: Vec<FileDiffHistory>,
    pub cursor_row: usize, // 1-indexed
    pub cursor_col: usize, // 0-indexed
    /// Only set when staging is disabled (0 = no limit).
    pub viewport_height: usize,
    pub linter_errors: Option<LinterErrors>,
}

impl CompletionRequest {
    pub fn current_line(&self) -> &str {
        if self.cursor_row >= 1 && self.cursor_row <= self.lines.len() {
            &self.lines[self.cursor_row - 1]
        } else {
            ""
        }
    }
}

/// Completions plus an optional cursor prediction target.
#[derive(Debug, Clone, Default)]
pub struct CompletionResponse {
    pub completions: Vec<Completion>,
    pub cursor_target: Option<CursorTarget>,
}

impl CompletionResponse {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.completions.is_empty() && self.cursor_target.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_line_in_bounds() {
        let req = CompletionRequest {
            source: CompletionSource::Typing,
            workspace_path: String::new(),
            file_path: "test.rs".into(),
            lines: vec!["alpha".into(), "beta".into()],
            version: 1,
            previous_lines: vec![],
            file_diff_histories: vec![],
            cursor_row: 2,
            cursor_col: 0,
            viewport_height: 0,
            linter_errors: None,
        };
        assert_eq!(req.current_line(), "beta");
    }

    #[test]
    fn current_line_out_of_bounds_is_empty() {
        let req = CompletionRequest {
            source: CompletionSource::Idle,
            workspace_path: String::new(),
            file_path: "test.rs".into(),
            lines: vec!["alpha".into()],
            version: 1,
            previous_lines: vec![],
            file_diff_histories: vec![],
            cursor_row: 5,
            cursor_col: 0,
            viewport_height: 0,
            linter_errors: None,
        };
        assert_eq!(req.current_line(), "");
    }

    #[test]
    fn visual_group_serializes_with_camel_case_keys() {
        let group = VisualGroup {
            kind: "addition".into(),
            start_line: 1,
            end_line: 2,
            lines: vec!["a".into(), "b".into()],
            old_lines: vec![],
        };
        let json = serde_json::to_value(&group).unwrap();
        assert_eq!(json["type"], "addition");
        assert_eq!(json["startLine"], 1);
        assert_eq!(json["endLine"], 2);
        assert!(json.get("oldLines").is_some());
    }
}
