// SPDX-License-Identifier: MIT
// Line-level diff with per-line change classification and coordinate mapping.

use std::collections::HashMap;

use similar::{capture_diff_slices, Algorithm, DiffOp};

/// How a single line changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Addition,
    Deletion,
    Modification,
    AppendChars,
    DeleteChars,
    ReplaceChars,
    AdditionGroup,
    ModificationGroup,
}

impl ChangeKind {
    pub fn is_group(self) -> bool {
        matches!(self, ChangeKind::AdditionGroup | ChangeKind::ModificationGroup)
    }

    pub fn is_addition(self) -> bool {
        matches!(self, ChangeKind::Addition | ChangeKind::AdditionGroup)
    }
}

/// One changed line (or, for group kinds, a run of lines).
///
/// `old_line_num` / `new_line_num` are 1-indexed; values ≤ 0 mean the
/// coordinate does not exist on that side. Additions inside a delete+insert
/// block carry the block's last old line as their anchor in `old_line_num`;
/// free-standing insertions leave it at −1 and anchor through the mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineChange {
    pub kind: ChangeKind,
    /// The key this change is stored under in `DiffResult::changes`.
    pub line_number: usize,
    /// New content; for deletions, the deleted text.
    pub content: String,
    pub old_content: String,
    pub col_start: usize,
    pub col_end: usize,
    pub old_line_num: i64,
    pub new_line_num: i64,
    /// Group kinds only: last line of the run, in new-line space.
    pub end_line: usize,
}

impl LineChange {
    fn new(kind: ChangeKind, line_number: usize) -> Self {
        Self {
            kind,
            line_number,
            content: String::new(),
            old_content: String::new(),
            col_start: 0,
            col_end: 0,
            old_line_num: 0,
            new_line_num: 0,
            end_line: 0,
        }
    }
}

/// Bidirectional line mapping between the old and new texts.
///
/// Entries are 1-indexed line numbers; −1 marks an unmapped position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineMapping {
    pub new_to_old: Vec<i64>,
    pub old_to_new: Vec<i64>,
}

/// The full result of diffing two texts.
#[derive(Debug, Clone, Default)]
pub struct DiffResult {
    /// Changes keyed by new-line number (old-line number for deletions).
    pub changes: HashMap<usize, LineChange>,
    pub is_only_line_deletion: bool,
    pub last_deletion: i64,
    pub last_addition: i64,
    pub last_line_modification: i64,
    pub last_append_chars: i64,
    pub last_delete_chars: i64,
    pub last_replace_chars: i64,
    /// Nominal caret position after applying the diff; −1 for pure deletions.
    pub cursor_line: i64,
    pub cursor_col: i64,
    pub old_line_count: usize,
    pub new_line_count: usize,
    pub line_mapping: Option<LineMapping>,
}

/// Split text into lines, treating a trailing newline as a terminator rather
/// than a separator. An empty text has zero lines, not one empty line.
pub fn split_lines(text: &str) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    let mut lines: Vec<String> = text.split('\n').map(str::to_string).collect();
    if text.ends_with('\n') {
        lines.pop();
    }
    lines
}

/// Join lines with a newline after every line.
pub fn join_lines(lines: &[String]) -> String {
    let mut out = String::new();
    for line in lines {
        out.push_str(line);
        out.push('\n');
    }
    out
}

/// Diff `old` against `new` and classify every changed line.
pub fn compute_diff(old: &str, new: &str) -> DiffResult {
    let old_lines = split_lines(old);
    let new_lines = split_lines(new);
    compute_diff_lines(&old_lines, &new_lines)
}

/// Line-slice variant of [`compute_diff`].
pub fn compute_diff_lines(old_lines: &[String], new_lines: &[String]) -> DiffResult {
    let ops = capture_diff_slices(Algorithm::Myers, old_lines, new_lines);

    let mut result = DiffResult {
        old_line_count: old_lines.len(),
        new_line_count: new_lines.len(),
        ..DiffResult::default()
    };
    let mut new_to_old = vec![-1i64; new_lines.len()];
    let mut old_to_new = vec![-1i64; old_lines.len()];

    for op in &ops {
        match *op {
            DiffOp::Equal {
                old_index,
                new_index,
                len,
            } => {
                for i in 0..len {
                    new_to_old[new_index + i] = (old_index + i + 1) as i64;
                    old_to_new[old_index + i] = (new_index + i + 1) as i64;
                }
            }
            DiffOp::Delete {
                old_index, old_len, ..
            } => {
                for i in 0..old_len {
                    record_deletion(&mut result, old_index + i, &old_lines[old_index + i]);
                }
            }
            DiffOp::Insert {
                new_index, new_len, ..
            } => {
                for i in 0..new_len {
                    record_addition(&mut result, new_index + i, &new_lines[new_index + i], -1);
                }
            }
            DiffOp::Replace {
                old_index,
                old_len,
                new_index,
                new_len,
            } => {
                let paired = old_len.min(new_len);
                for i in 0..paired {
                    let old_line = &old_lines[old_index + i];
                    let new_line = &new_lines[new_index + i];
                    new_to_old[new_index + i] = (old_index + i + 1) as i64;
                    old_to_new[old_index + i] = (new_index + i + 1) as i64;
                    if old_line == new_line {
                        continue;
                    }
                    record_pair(
                        &mut result,
                        old_index + i,
                        new_index + i,
                        old_line,
                        new_line,
                    );
                }
                // Excess insertions anchor to the last old line of the block
                // so staging keeps the whole block together.
                let anchor = (old_index + old_len) as i64;
                for i in paired..new_len {
                    record_addition(&mut result, new_index + i, &new_lines[new_index + i], anchor);
                }
                for i in paired..old_len {
                    record_deletion(&mut result, old_index + i, &old_lines[old_index + i]);
                }
            }
        }
    }

    result.is_only_line_deletion = !result.changes.is_empty()
        && result
            .changes
            .values()
            .all(|c| c.kind == ChangeKind::Deletion);

    finalize_markers_and_cursor(&mut result);
    result.line_mapping = Some(LineMapping {
        new_to_old,
        old_to_new,
    });
    result
}

fn record_deletion(result: &mut DiffResult, old_index: usize, content: &str) {
    let line = old_index + 1;
    let mut change = LineChange::new(ChangeKind::Deletion, line);
    change.content = content.to_string();
    change.old_line_num = line as i64;
    change.new_line_num = -1;
    result.changes.insert(line, change);
}

fn record_addition(result: &mut DiffResult, new_index: usize, content: &str, anchor: i64) {
    let line = new_index + 1;
    let mut change = LineChange::new(ChangeKind::Addition, line);
    change.content = content.to_string();
    change.old_line_num = anchor;
    change.new_line_num = line as i64;
    result.changes.insert(line, change);
}

fn record_pair(
    result: &mut DiffResult,
    old_index: usize,
    new_index: usize,
    old_line: &str,
    new_line: &str,
) {
    let line = new_index + 1;
    let (kind, col_start, col_end) = categorize_line_change(old_line, new_line);
    let mut change = LineChange::new(kind, line);
    change.content = new_line.to_string();
    change.old_content = old_line.to_string();
    change.col_start = col_start;
    change.col_end = col_end;
    change.old_line_num = (old_index + 1) as i64;
    change.new_line_num = line as i64;
    result.changes.insert(line, change);
}

fn finalize_markers_and_cursor(result: &mut DiffResult) {
    result.last_deletion = -1;
    result.last_addition = -1;
    result.last_line_modification = -1;
    result.last_append_chars = -1;
    result.last_delete_chars = -1;
    result.last_replace_chars = -1;

    for (&line, change) in &result.changes {
        let line = line as i64;
        let marker = match change.kind {
            ChangeKind::Deletion => &mut result.last_deletion,
            ChangeKind::Addition | ChangeKind::AdditionGroup => &mut result.last_addition,
            ChangeKind::Modification | ChangeKind::ModificationGroup => {
                &mut result.last_line_modification
            }
            ChangeKind::AppendChars => &mut result.last_append_chars,
            ChangeKind::DeleteChars => &mut result.last_delete_chars,
            ChangeKind::ReplaceChars => &mut result.last_replace_chars,
        };
        if line > *marker {
            *marker = line;
        }
    }

    // The caret lands on the most downstream non-deletion change; pure
    // deletions leave the caret alone.
    let cursor_line = [
        result.last_addition,
        result.last_line_modification,
        result.last_append_chars,
        result.last_delete_chars,
        result.last_replace_chars,
    ]
    .into_iter()
    .max()
    .unwrap_or(-1);

    if cursor_line <= 0 {
        result.cursor_line = -1;
        result.cursor_col = -1;
    } else {
        result.cursor_line = cursor_line;
        result.cursor_col = result
            .changes
            .get(&(cursor_line as usize))
            .map(|c| c.content.len() as i64)
            .unwrap_or(-1);
    }
}

/// Classify a single-line edit and locate the changed column range.
///
/// Maximal common prefix/suffix stripping isolates the changed region; if the
/// remaining middles still share a run of ≥ 3 characters the change spans
/// multiple regions and the whole line counts as modified.
pub fn categorize_line_change(old: &str, new: &str) -> (ChangeKind, usize, usize) {
    let prefix = common_prefix_bytes(old, new);
    let max_suffix = old.len().min(new.len()) - prefix;
    let suffix = common_suffix_bytes(&old[prefix..], &new[prefix..]).min(max_suffix);

    let old_mid = &old[prefix..old.len() - suffix];
    let new_mid = &new[prefix..new.len() - suffix];

    if old_mid.is_empty() {
        if suffix == 0 {
            (ChangeKind::AppendChars, prefix, new.len())
        } else {
            (ChangeKind::ReplaceChars, prefix, new.len() - suffix)
        }
    } else if new_mid.is_empty() {
        (ChangeKind::DeleteChars, prefix, old.len() - suffix)
    } else if shares_common_run(old_mid, new_mid, 3) {
        (ChangeKind::Modification, 0, 0)
    } else {
        (ChangeKind::ReplaceChars, prefix, new.len() - suffix)
    }
}

fn common_prefix_bytes(a: &str, b: &str) -> usize {
    let mut len = 0;
    for (ca, cb) in a.chars().zip(b.chars()) {
        if ca != cb {
            break;
        }
        len += ca.len_utf8();
    }
    len
}

fn common_suffix_bytes(a: &str, b: &str) -> usize {
    let mut len = 0;
    for (ca, cb) in a.chars().rev().zip(b.chars().rev()) {
        if ca != cb {
            break;
        }
        len += ca.len_utf8();
    }
    len
}

/// Whether `a` and `b` share any substring of at least `min_len` characters.
fn shares_common_run(a: &str, b: &str, min_len: usize) -> bool {
    let a_chars: Vec<char> = a.chars().collect();
    let b_chars: Vec<char> = b.chars().collect();
    if a_chars.len() < min_len || b_chars.len() < min_len {
        return false;
    }
    let grams: std::collections::HashSet<&[char]> = a_chars.windows(min_len).collect();
    b_chars.windows(min_len).any(|w| grams.contains(w))
}

/// Promote runs of ≥ 2 consecutive additions or modifications to group
/// records. Only the staging planner consumes group kinds; the
/// character-level UI always sees the ungrouped diff.
pub fn promote_groups(mut diff: DiffResult) -> DiffResult {
    let mut keys: Vec<usize> = diff.changes.keys().copied().collect();
    keys.sort_unstable();

    let mut runs: Vec<(ChangeKind, Vec<usize>)> = Vec::new();
    for key in keys {
        let kind = diff.changes[&key].kind;
        if !matches!(kind, ChangeKind::Addition | ChangeKind::Modification) {
            runs.push((kind, vec![key]));
            continue;
        }
        match runs.last_mut() {
            Some((run_kind, members))
                if *run_kind == kind && members.last().copied() == Some(key - 1) =>
            {
                members.push(key);
            }
            _ => runs.push((kind, vec![key])),
        }
    }

    for (kind, members) in runs {
        if members.len() < 2 || !matches!(kind, ChangeKind::Addition | ChangeKind::Modification) {
            continue;
        }
        let (Some(&start), Some(&end)) = (members.first(), members.last()) else {
            continue;
        };
        for key in &members[1..] {
            diff.changes.remove(key);
        }
        if let Some(group) = diff.changes.get_mut(&start) {
            group.kind = if kind == ChangeKind::Addition {
                ChangeKind::AdditionGroup
            } else {
                ChangeKind::ModificationGroup
            };
            group.end_line = end;
        }
    }

    diff
}
