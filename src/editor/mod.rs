// SPDX-License-Identifier: MIT
// The narrow boundary the engine requires from an editor frontend. Editor
// plugins implement these traits; the engine never sees anything wider.

use std::time::{Duration, Instant};

use anyhow::Result;

use crate::types::{DiffEntry, LinterErrors, VisualGroup};

/// Result of pulling the editor's latest buffer state.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncResult {
    pub buffer_changed: bool,
}

/// A prepared buffer mutation that the editor applies atomically.
pub trait Batch: Send {
    fn execute(&mut self) -> Result<()>;
}

/// The editor-owned buffer view.
///
/// All methods are called from the engine's event loop only; implementations
/// are free to marshal to the editor's own thread.
pub trait EditorBuffer: Send {
    /// Pull the latest lines, cursor, and viewport from the editor.
    fn sync(&mut self, workspace_path: &str) -> Result<SyncResult>;

    fn lines(&self) -> Vec<String>;
    /// Cursor row, 1-indexed.
    fn row(&self) -> usize;
    /// Cursor column, 0-indexed.
    fn col(&self) -> usize;
    fn path(&self) -> String;
    fn version(&self) -> u64;
    /// Visible line range, 1-indexed inclusive; (0, 0) when unknown.
    fn viewport_bounds(&self) -> (i64, i64);

    /// Content before the most recent edit.
    fn previous_lines(&self) -> Vec<String>;
    /// Content snapshot from when the current file context was installed.
    fn original_lines(&self) -> Vec<String>;
    fn diff_histories(&self) -> Vec<DiffEntry>;
    fn set_file_context(
        &mut self,
        previous: Vec<String>,
        original: Vec<String>,
        diffs: Vec<DiffEntry>,
    );

    /// Whether applying `lines` over the range would change the buffer.
    fn has_changes(&self, start_line: usize, end_line_inc: usize, lines: &[String]) -> bool;

    /// Stage a completion for display; returns the batch that applies it.
    fn prepare_completion(
        &mut self,
        start_line: usize,
        end_line_inc: usize,
        lines: &[String],
        groups: &[VisualGroup],
    ) -> Box<dyn Batch>;

    /// Apply the staged completion.
    fn commit_pending(&mut self);
    /// Flush user edits into the diff history. Returns true when there were
    /// edits to record.
    fn commit_user_edits(&mut self) -> bool;

    fn show_cursor_target(&mut self, line: i64) -> Result<()>;
    fn clear_ui(&mut self) -> Result<()>;
    fn move_cursor(&mut self, line: i64, center: bool, mark: bool) -> Result<()>;

    fn linter_errors(&self) -> Option<LinterErrors>;

    /// Register the callback the editor invokes with event names
    /// (`"text_changed"`, `"tab"`, `"esc"`, ...). The callback only posts
    /// onto the engine's channel; it never reaches into engine state.
    fn register_event_handler(&mut self, handler: Box<dyn Fn(&str) + Send + Sync>) -> Result<()>;
}

/// A cancellable timer returned by [`Clock::after_func`].
pub trait TimerHandle: Send {
    /// Stop the timer; returns whether it was still pending.
    fn stop(&mut self) -> bool;
}

/// Abstract clock so tests can drive timers manually.
pub trait Clock: Send + Sync {
    fn after_func(&self, delay: Duration, f: Box<dyn FnOnce() + Send>) -> Box<dyn TimerHandle>;
    fn now(&self) -> Instant;
}

/// Production clock backed by tokio timers.
pub struct TokioClock;

impl Clock for TokioClock {
    fn after_func(&self, delay: Duration, f: Box<dyn FnOnce() + Send>) -> Box<dyn TimerHandle> {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            f();
        });
        Box::new(TokioTimer {
            handle: Some(handle),
        })
    }

    fn now(&self) -> Instant {
        Instant::now()
    }
}

struct TokioTimer {
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl TimerHandle for TokioTimer {
    fn stop(&mut self) -> bool {
        match self.handle.take() {
            Some(handle) => {
                let was_pending = !handle.is_finished();
                handle.abort();
                was_pending
            }
            None => false,
        }
    }
}
