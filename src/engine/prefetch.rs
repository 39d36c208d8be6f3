// SPDX-License-Identifier: MIT
// Prefetch: speculative completion requests for a predicted cursor position,
// consumed on tab without a fresh round-trip.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use super::{Engine, EngineState, Event};
use crate::text::find_first_changed_line;
use crate::types::{CompletionResponse, CompletionSource, CursorTarget};

/// State of the prefetch slot. At most one prefetch is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefetchState {
    None,
    InFlight,
    /// Tab was pressed before the prefetch landed; its arrival continues the
    /// cursor-target flow.
    WaitingForTab,
    /// A last-stage cursor target is pending; the prefetch decides between
    /// showing the completion and showing a prediction.
    WaitingForCursorPrediction,
    Ready,
}

impl std::fmt::Display for PrefetchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PrefetchState::None => "None",
            PrefetchState::InFlight => "InFlight",
            PrefetchState::WaitingForTab => "WaitingForTab",
            PrefetchState::WaitingForCursorPrediction => "WaitingForCursorPrediction",
            PrefetchState::Ready => "Ready",
        };
        f.write_str(name)
    }
}

impl Engine {
    /// Request a completion for a specific cursor position without changing
    /// the engine state. Supersedes any earlier prefetch.
    pub(crate) fn request_prefetch(
        &mut self,
        source: CompletionSource,
        override_row: usize,
        override_col: usize,
    ) {
        if self.stopped {
            return;
        }
        self.cancel_prefetch();

        let _ = self.buffer.sync(&self.config.workspace_path);

        self.prefetch_seq += 1;
        let prefetch_id = self.prefetch_seq;
        self.current_prefetch_id = prefetch_id;
        let cancel = CancellationToken::new();
        self.prefetch_cancel = Some(cancel.clone());
        self.prefetch_state = PrefetchState::InFlight;

        // build_request snapshots lines by value, so the background task
        // never races the loop.
        let request = self.build_request(source, Some((override_row, override_col)));

        let provider = self.provider.clone();
        let tx: mpsc::UnboundedSender<Event> = self.events_tx.clone();
        let timeout = self.config.completion_timeout;

        tokio::spawn(async move {
            let timeout_cancel = cancel.clone();
            let timeout_guard = tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                timeout_cancel.cancel();
            });

            let result = provider.get_completion(&cancel, Arc::new(request)).await;
            timeout_guard.abort();

            let event = match result {
                Ok(response) => Event::PrefetchReady {
                    prefetch_id,
                    response,
                },
                Err(err) => Event::PrefetchFailed {
                    prefetch_id,
                    error: format!("{err:#}"),
                },
            };
            let _ = tx.send(event);
        });
    }

    pub(crate) fn cancel_prefetch(&mut self) {
        if let Some(cancel) = self.prefetch_cancel.take() {
            cancel.cancel();
        }
        self.current_prefetch_id = 0;
        self.prefetch_state = PrefetchState::None;
    }

    fn clear_prefetched(&mut self) {
        self.prefetched_completions.clear();
        self.prefetched_cursor_target = None;
        self.prefetch_state = PrefetchState::None;
    }

    pub(crate) fn handle_prefetch_ready(&mut self, prefetch_id: u64, response: CompletionResponse) {
        if prefetch_id != self.current_prefetch_id || self.current_prefetch_id == 0 {
            debug!(prefetch_id, "dropping stale prefetch response");
            return;
        }
        self.current_prefetch_id = 0;
        self.prefetch_cancel = None;

        self.prefetched_completions = response.completions;
        self.prefetched_cursor_target = response.cursor_target;
        let previous = self.prefetch_state;
        self.prefetch_state = PrefetchState::Ready;

        match previous {
            PrefetchState::WaitingForTab => self.handle_deferred_cursor_target(),
            PrefetchState::WaitingForCursorPrediction => self.resolve_cursor_prediction(),
            _ => {}
        }
    }

    pub(crate) fn handle_prefetch_failed(&mut self, prefetch_id: u64, error: &str) {
        if prefetch_id != self.current_prefetch_id || self.current_prefetch_id == 0 {
            debug!(prefetch_id, "dropping stale prefetch error");
            return;
        }
        self.current_prefetch_id = 0;
        self.prefetch_cancel = None;

        if error.contains("cancelled") {
            debug!(error, "prefetch cancelled");
        } else {
            error!(error, "prefetch failed");
        }

        let previous = self.prefetch_state;
        self.prefetch_state = PrefetchState::None;

        match previous {
            PrefetchState::WaitingForTab => self.handle_deferred_cursor_target(),
            PrefetchState::WaitingForCursorPrediction => self.handle_cursor_target(),
            _ => {}
        }
    }

    /// A last-stage cursor target is about to show. Prefetch the predicted
    /// position first; the response decides whether to show the completion
    /// in place or a prediction to the far change.
    pub(crate) fn handle_last_stage_cursor_target(&mut self) {
        let Some(target) = self.cursor_target.clone() else {
            self.state = EngineState::Idle;
            return;
        };
        if !self.config.cursor_prediction.enabled {
            self.cursor_target = None;
            self.state = EngineState::Idle;
            return;
        }

        self.request_prefetch(
            CompletionSource::Typing,
            target.line_number.max(1) as usize,
            0,
        );
        self.prefetch_state = PrefetchState::WaitingForCursorPrediction;
    }

    /// The prefetch for a last-stage target landed: show the completion when
    /// its first changed line is near the cursor, otherwise show a cursor
    /// prediction pointing at it.
    fn resolve_cursor_prediction(&mut self) {
        let Some(completion) = self.prefetched_completions.first().cloned() else {
            self.handle_cursor_target();
            return;
        };

        let buffer_lines = self.buffer.lines();
        let start = completion.start_line.max(1);
        let end = completion.end_line_inc.min(buffer_lines.len());
        let old_lines: Vec<String> = if end >= start {
            buffer_lines[start - 1..end].to_vec()
        } else {
            Vec::new()
        };

        let target_line = find_first_changed_line(
            &old_lines,
            &completion.lines,
            completion.start_line.saturating_sub(1),
        );
        if target_line <= 0 {
            self.handle_cursor_target();
            return;
        }

        let distance = (target_line - self.buffer.row() as i64).unsigned_abs() as usize;
        if distance <= self.config.cursor_prediction.dist_threshold {
            self.try_show_prefetched_completion();
            return;
        }

        self.cursor_target = Some(CursorTarget {
            relative_path: self.buffer.path(),
            line_number: target_line as i32,
            expected_content: String::new(),
            // The prefetched data will be consumed on tab.
            should_retrigger: false,
        });
        match self.buffer.show_cursor_target(target_line) {
            Ok(()) => self.state = EngineState::HasCursorTarget,
            Err(err) => {
                error!(error = %err, "failed to show cursor prediction");
                self.cursor_target = None;
                self.state = EngineState::Idle;
            }
        }
    }

    /// Show the prefetched completion right away. Returns whether anything
    /// became visible.
    pub(crate) fn try_show_prefetched_completion(&mut self) -> bool {
        if self.prefetched_completions.is_empty() {
            return false;
        }
        let _ = self.buffer.sync(&self.config.workspace_path);

        let completion = self.prefetched_completions[0].clone();
        let cursor_target = self.prefetched_cursor_target.clone();
        self.clear_prefetched();

        self.process_completion(completion, cursor_target)
    }

    /// Continue a cursor-target acceptance that was deferred while the
    /// prefetch was still in flight.
    pub(crate) fn handle_deferred_cursor_target(&mut self) {
        if self.cursor_target.is_none() {
            return;
        }

        if !self.prefetched_completions.is_empty() {
            let _ = self.buffer.sync(&self.config.workspace_path);

            let completion = self.prefetched_completions[0].clone();
            let cursor_target = self.prefetched_cursor_target.clone();
            self.clear_prefetched();

            if self.process_completion(completion, cursor_target) {
                return;
            }

            debug!("no changes to completion (deferred prefetched)");
            self.handle_cursor_target();
            return;
        }

        let Some(target) = self.cursor_target.take() else {
            return;
        };
        if target.should_retrigger {
            self.request_completion(CompletionSource::Typing);
            return;
        }
        self.state = EngineState::Idle;
    }

    /// Consume prefetched data when a cursor target is accepted. Returns
    /// false when the caller should fall back to a normal request.
    pub(crate) fn use_prefetched_completion(&mut self) -> bool {
        if self.prefetched_completions.is_empty() {
            return false;
        }
        let _ = self.buffer.sync(&self.config.workspace_path);

        let completion = self.prefetched_completions[0].clone();
        let cursor_target = self.prefetched_cursor_target.clone();
        self.clear_prefetched();

        if self.process_completion(completion, cursor_target) {
            return true;
        }

        debug!("no changes to completion (prefetched)");
        self.handle_cursor_target();
        true
    }
}
