// SPDX-License-Identifier: MIT
// Staging planner: groups diff changes into tab-acceptable stages ordered by
// viewport visibility and cursor distance.

use std::collections::HashMap;

use crate::text::diff::{ChangeKind, DiffResult, LineChange, LineMapping};
use crate::types::{CursorTarget, VisualGroup};

/// One cluster of nearby changes surfaced as a single tab-accept unit.
#[derive(Debug, Clone, Default)]
pub struct Stage {
    /// Replacement range in 1-indexed buffer coordinates.
    pub buffer_start: i64,
    pub buffer_end: i64,
    /// New content for the stage.
    pub lines: Vec<String>,
    /// Changes re-keyed relative to the stage content (1-indexed).
    pub changes: HashMap<usize, LineChange>,
    /// Visual groups, relative to the stage content.
    pub groups: Vec<VisualGroup>,
    pub cursor_target: Option<CursorTarget>,
    pub is_last_stage: bool,
    /// Cluster bounds in diff key space.
    pub(crate) start_line: usize,
    pub(crate) end_line: usize,
    pub(crate) raw_changes: HashMap<usize, LineChange>,
}

/// The ordered staging plan.
#[derive(Debug, Clone)]
pub struct StagingResult {
    pub stages: Vec<Stage>,
    /// True when the first stage lies outside the viewport or farther than
    /// the proximity threshold from the cursor.
    pub first_needs_navigation: bool,
}

/// Build the staging plan for a diff. Returns `None` when there is nothing
/// to stage. A single cluster still yields a one-stage plan so the UI treats
/// navigation uniformly.
#[allow(clippy::too_many_arguments)]
pub fn create_stages(
    diff: &DiffResult,
    cursor_row: i64,
    viewport_top: i64,
    viewport_bottom: i64,
    base_line_offset: i64,
    proximity_threshold: usize,
    file_path: &str,
    new_lines: &[String],
    old_lines: &[String],
) -> Option<StagingResult> {
    if diff.changes.is_empty() {
        return None;
    }

    // Partition by viewport visibility; a change is visible only when its
    // whole range is inside the viewport. (0, 0) means no viewport info.
    let mut in_view: Vec<usize> = Vec::new();
    let mut out_view: Vec<usize> = Vec::new();
    for (&key, change) in &diff.changes {
        let buffer_line =
            get_buffer_line_for_change(change, key, base_line_offset, diff.line_mapping.as_ref());
        let end_buffer_line = if change.kind.is_group() {
            change.end_line as i64 + base_line_offset - 1
        } else {
            buffer_line
        };

        let visible = (viewport_top == 0 && viewport_bottom == 0)
            || (buffer_line >= viewport_top && end_buffer_line <= viewport_bottom);
        if visible {
            in_view.push(key);
        } else {
            out_view.push(key);
        }
    }
    in_view.sort_unstable();
    out_view.sort_unstable();

    let mut stages = group_changes_into_stages(diff, &in_view, proximity_threshold);
    stages.extend(group_changes_into_stages(diff, &out_view, proximity_threshold));
    if stages.is_empty() {
        return None;
    }

    for stage in &mut stages {
        let (start, end) = get_stage_buffer_range(stage, base_line_offset, diff);
        stage.buffer_start = start;
        stage.buffer_end = end;
    }

    stages.sort_by(|a, b| {
        stage_distance_from_cursor(a, cursor_row)
            .cmp(&stage_distance_from_cursor(b, cursor_row))
            .then(a.start_line.cmp(&b.start_line))
    });

    finalize_stages(&mut stages, new_lines, old_lines, file_path);

    let first_needs_navigation = stage_needs_navigation(
        &stages[0],
        cursor_row,
        viewport_top,
        viewport_bottom,
        proximity_threshold,
    );

    Some(StagingResult {
        stages,
        first_needs_navigation,
    })
}

/// Buffer line for a change: modifications and deletions use their old line,
/// pure additions anchor through the mapping (nearest mapped line at or
/// before the insertion), and anything else falls back to the map key.
pub fn get_buffer_line_for_change(
    change: &LineChange,
    map_key: usize,
    base_line_offset: i64,
    mapping: Option<&LineMapping>,
) -> i64 {
    if change.old_line_num > 0 {
        return change.old_line_num + base_line_offset - 1;
    }

    if let Some(mapping) = mapping {
        let new_line = change.new_line_num;
        if new_line > 0 && (new_line as usize) <= mapping.new_to_old.len() {
            let old_line = mapping.new_to_old[new_line as usize - 1];
            if old_line > 0 {
                return old_line + base_line_offset - 1;
            }
            for i in (0..new_line as usize - 1).rev() {
                if mapping.new_to_old[i] > 0 {
                    return mapping.new_to_old[i] + base_line_offset - 1;
                }
            }
        }
    }

    map_key as i64 + base_line_offset - 1
}

/// Cluster sorted change keys by proximity: a gap wider than the threshold
/// starts a new stage. Group records extend the cluster to their end line.
fn group_changes_into_stages(
    diff: &DiffResult,
    line_numbers: &[usize],
    proximity_threshold: usize,
) -> Vec<Stage> {
    let mut stages: Vec<Stage> = Vec::new();

    for &line_num in line_numbers {
        let change = diff.changes[&line_num].clone();
        let end_line = if change.kind.is_group() {
            change.end_line
        } else {
            line_num
        };

        match stages.last_mut() {
            Some(current) if line_num.saturating_sub(current.end_line) <= proximity_threshold => {
                current.raw_changes.insert(line_num, change);
                if end_line > current.end_line {
                    current.end_line = end_line;
                }
            }
            _ => {
                let mut stage = Stage {
                    start_line: line_num,
                    end_line,
                    ..Stage::default()
                };
                stage.raw_changes.insert(line_num, change);
                stages.push(stage);
            }
        }
    }

    stages
}

fn anchor_for_addition(change: &LineChange, mapping: Option<&LineMapping>) -> Option<i64> {
    if change.old_line_num > 0 {
        return Some(change.old_line_num);
    }
    let mapping = mapping?;
    let new_line = change.new_line_num;
    if new_line > 0 && (new_line as usize) <= mapping.new_to_old.len() {
        for i in (0..new_line as usize - 1).rev() {
            if mapping.new_to_old[i] > 0 {
                return Some(mapping.new_to_old[i]);
            }
        }
    }
    None
}

/// Derive a stage's buffer replacement range.
///
/// Modifications and deletions pin the range via their old lines. A
/// pure-addition stage collapses to its insertion point (anchor + 1).
/// Additions running past end-of-file extend the range to the end of the
/// original buffer so the replacement covers the residual tail.
fn get_stage_buffer_range(stage: &Stage, base_line_offset: i64, diff: &DiffResult) -> (i64, i64) {
    let mapping = diff.line_mapping.as_ref();
    let mut min_old: Option<i64> = None;
    let mut max_old: Option<i64> = None;
    let mut addition_anchor: Option<i64> = None;
    let mut has_non_addition = false;
    let mut max_addition_new: i64 = -1;

    for (&key, change) in &stage.raw_changes {
        if change.kind.is_addition() {
            if let Some(anchor) = anchor_for_addition(change, mapping) {
                addition_anchor =
                    Some(addition_anchor.map_or(anchor, |existing: i64| existing.min(anchor)));
            }
            let new_end = if change.kind.is_group() {
                change.end_line as i64
            } else if change.new_line_num > 0 {
                change.new_line_num
            } else {
                key as i64
            };
            max_addition_new = max_addition_new.max(new_end);
        } else {
            has_non_addition = true;
            if change.old_line_num > 0 {
                min_old = Some(min_old.map_or(change.old_line_num, |v: i64| v.min(change.old_line_num)));
                max_old = Some(max_old.map_or(change.old_line_num, |v: i64| v.max(change.old_line_num)));
            }
            if change.kind == ChangeKind::ModificationGroup {
                let end = change.end_line as i64;
                max_old = Some(max_old.map_or(end, |v: i64| v.max(end)));
            }
        }
    }

    if !has_non_addition {
        let start = match addition_anchor {
            Some(anchor) => anchor + 1,
            None => stage.start_line as i64,
        } + base_line_offset
            - 1;
        return (start, start);
    }

    let start = min_old.unwrap_or(stage.start_line as i64);
    let mut end = max_old.unwrap_or(start);
    let old_count = diff.old_line_count as i64;
    if old_count > 0 && max_addition_new > old_count {
        end = old_count;
    }
    if old_count > 0 && end > old_count {
        end = old_count;
    }
    if end < start {
        end = start;
    }

    (start + base_line_offset - 1, end + base_line_offset - 1)
}

/// New-text line range covered by a stage, for content extraction.
fn get_stage_new_line_range(stage: &Stage) -> (usize, usize) {
    let mut min_new: Option<usize> = None;
    let mut max_new: Option<usize> = None;

    for change in stage.raw_changes.values() {
        if change.new_line_num > 0 {
            let n = change.new_line_num as usize;
            min_new = Some(min_new.map_or(n, |v| v.min(n)));
            max_new = Some(max_new.map_or(n, |v| v.max(n)));
        }
        if change.kind.is_group() && change.end_line > 0 {
            max_new = Some(max_new.map_or(change.end_line, |v| v.max(change.end_line)));
        }
    }

    (
        min_new.unwrap_or(stage.start_line),
        max_new.unwrap_or(stage.end_line),
    )
}

/// Minimum distance from the cursor to a stage's buffer range (0 inside).
pub fn stage_distance_from_cursor(stage: &Stage, cursor_row: i64) -> i64 {
    if cursor_row >= stage.buffer_start && cursor_row <= stage.buffer_end {
        0
    } else if cursor_row < stage.buffer_start {
        stage.buffer_start - cursor_row
    } else {
        cursor_row - stage.buffer_end
    }
}

/// Whether accepting a stage requires navigating first: the stage lies
/// entirely outside the viewport, or farther from the cursor than the
/// proximity threshold.
pub fn stage_needs_navigation(
    stage: &Stage,
    cursor_row: i64,
    viewport_top: i64,
    viewport_bottom: i64,
    proximity_threshold: usize,
) -> bool {
    let has_viewport = viewport_top != 0 || viewport_bottom != 0;
    if has_viewport && (stage.buffer_end < viewport_top || stage.buffer_start > viewport_bottom) {
        return true;
    }
    stage_distance_from_cursor(stage, cursor_row) > proximity_threshold as i64
}

/// Fill in stage content, stage-relative changes, visual groups, and the
/// chained cursor targets.
fn finalize_stages(stages: &mut [Stage], new_lines: &[String], old_lines: &[String], file_path: &str) {
    let count = stages.len();
    let next_starts: Vec<i64> = stages.iter().map(|s| s.buffer_start).collect();

    for (i, stage) in stages.iter_mut().enumerate() {
        let (new_start, new_end) = get_stage_new_line_range(stage);

        let mut lines = Vec::new();
        for l in new_start..=new_end {
            if l >= 1 && l - 1 < new_lines.len() {
                lines.push(new_lines[l - 1].clone());
            }
        }

        let mut changes = HashMap::new();
        for (&key, change) in &stage.raw_changes {
            let line = if change.new_line_num > 0 {
                change.new_line_num
            } else {
                key as i64
            };
            let rel = line - new_start as i64 + 1;
            if rel >= 1 && rel as usize <= lines.len().max(1) {
                let mut relocated = change.clone();
                relocated.line_number = rel as usize;
                if relocated.kind.is_group() && relocated.end_line >= new_start {
                    relocated.end_line = relocated.end_line - new_start + 1;
                }
                changes.insert(rel as usize, relocated);
            }
        }

        let groups = compute_stage_groups(&changes, &lines, old_lines);
        debug_assert!(
            groups
                .iter()
                .all(|g| g.start_line >= 1 && g.end_line >= g.start_line && g.end_line <= lines.len()),
            "stage visual group exceeds stage content"
        );

        let is_last_stage = i == count - 1;
        let cursor_target = if is_last_stage {
            CursorTarget {
                relative_path: file_path.to_string(),
                line_number: stage.buffer_end as i32,
                expected_content: String::new(),
                should_retrigger: true,
            }
        } else {
            CursorTarget {
                relative_path: file_path.to_string(),
                line_number: next_starts[i + 1] as i32,
                expected_content: String::new(),
                should_retrigger: false,
            }
        };

        stage.lines = lines;
        stage.changes = changes;
        stage.groups = groups;
        stage.cursor_target = Some(cursor_target);
        stage.is_last_stage = is_last_stage;
    }
}

/// Coalesce consecutive additions/modifications into visual groups for UI
/// alignment. Character-level changes break a run. Coordinates are relative
/// to the stage content.
fn compute_stage_groups(
    changes: &HashMap<usize, LineChange>,
    lines: &[String],
    old_lines: &[String],
) -> Vec<VisualGroup> {
    let mut keys: Vec<usize> = changes.keys().copied().collect();
    keys.sort_unstable();

    // Old content for a covered line: group records span several lines but
    // carry one old_content, so prefer indexing the old text through the
    // record's old-line coordinate.
    let old_content_for = |change: &LineChange, covered: usize| -> String {
        if change.old_line_num > 0 && change.new_line_num > 0 {
            let shift = covered as i64 - change.line_number as i64;
            let old_idx = change.old_line_num + shift - 1;
            if old_idx >= 0 && (old_idx as usize) < old_lines.len() {
                return old_lines[old_idx as usize].clone();
            }
        }
        change.old_content.clone()
    };

    let mut groups: Vec<VisualGroup> = Vec::new();
    let mut current: Option<VisualGroup> = None;

    for key in keys {
        let change = &changes[&key];
        let kind = match change.kind {
            ChangeKind::Modification | ChangeKind::ModificationGroup => "modification",
            ChangeKind::Addition | ChangeKind::AdditionGroup => "addition",
            _ => {
                if let Some(group) = current.take() {
                    groups.push(group);
                }
                continue;
            }
        };

        let run_end = if change.kind.is_group() {
            change.end_line.max(key).min(lines.len().max(key))
        } else {
            key
        };

        match current.as_mut() {
            Some(group) if group.kind == kind && key == group.end_line + 1 => {
                group.end_line = run_end;
                for l in key..=run_end {
                    if l - 1 < lines.len() {
                        group.lines.push(lines[l - 1].clone());
                    }
                    if kind == "modification" {
                        group.old_lines.push(old_content_for(change, l));
                    }
                }
            }
            _ => {
                if let Some(group) = current.take() {
                    groups.push(group);
                }
                let mut group = VisualGroup {
                    kind: kind.to_string(),
                    start_line: key,
                    end_line: run_end,
                    lines: Vec::new(),
                    old_lines: Vec::new(),
                };
                for l in key..=run_end {
                    if l - 1 < lines.len() {
                        group.lines.push(lines[l - 1].clone());
                    }
                    if kind == "modification" {
                        group.old_lines.push(old_content_for(change, l));
                    }
                }
                current = Some(group);
            }
        }
    }

    if let Some(group) = current.take() {
        groups.push(group);
    }

    groups
}
