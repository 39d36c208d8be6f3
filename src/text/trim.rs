// SPDX-License-Identifier: MIT
// Token-budget window extraction around the cursor.

/// A trimmed view into a line buffer.
///
/// `window_start`/`window_end` are 0-indexed half-open offsets into the
/// source lines; `cursor_line` is the cursor's 0-indexed position inside
/// `lines`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrimResult {
    pub lines: Vec<String>,
    pub cursor_line: usize,
    pub window_start: usize,
    pub window_end: usize,
}

/// Rough token count for a line. Whitespace-only lines still cost one token.
pub fn estimate_tokens(line: &str) -> usize {
    line.len() / 4 + 1
}

/// Extract a window of `lines` around the cursor that fits `token_budget`.
///
/// Grows outward from the cursor line symmetrically, one whole line at a
/// time; lines are never split. A budget of 0 means no limit. The cursor
/// line is always included even when it alone exceeds the budget.
pub fn trim_content_around_cursor(
    lines: &[String],
    cursor_line: usize,
    token_budget: usize,
) -> TrimResult {
    if lines.is_empty() {
        return TrimResult {
            lines: Vec::new(),
            cursor_line: 0,
            window_start: 0,
            window_end: 0,
        };
    }

    let cursor_line = cursor_line.min(lines.len() - 1);
    if token_budget == 0 {
        return TrimResult {
            lines: lines.to_vec(),
            cursor_line,
            window_start: 0,
            window_end: lines.len(),
        };
    }

    let mut start = cursor_line;
    let mut end = cursor_line + 1;
    let mut used = estimate_tokens(&lines[cursor_line]);

    loop {
        // Prefer whichever side is currently shorter so the window stays
        // centered; fall back to the other side when one stops fitting.
        let up_span = cursor_line - start;
        let down_span = end - 1 - cursor_line;
        let grow_down = if start == 0 {
            true
        } else if end == lines.len() {
            false
        } else {
            down_span <= up_span
        };

        if grow_down {
            if end >= lines.len() {
                break;
            }
            let cost = estimate_tokens(&lines[end]);
            if used + cost > token_budget {
                if start > 0 && used + estimate_tokens(&lines[start - 1]) <= token_budget {
                    used += estimate_tokens(&lines[start - 1]);
                    start -= 1;
                    continue;
                }
                break;
            }
            used += cost;
            end += 1;
        } else {
            if start == 0 {
                break;
            }
            let cost = estimate_tokens(&lines[start - 1]);
            if used + cost > token_budget {
                if end < lines.len() && used + estimate_tokens(&lines[end]) <= token_budget {
                    used += estimate_tokens(&lines[end]);
                    end += 1;
                    continue;
                }
                break;
            }
            used += cost;
            start -= 1;
        }
    }

    TrimResult {
        lines: lines[start..end].to_vec(),
        cursor_line: cursor_line - start,
        window_start: start,
        window_end: end,
    }
}
