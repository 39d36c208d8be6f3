// SPDX-License-Identifier: MIT
// The completion engine: a single-task event loop owning all mutable state.
// Background work (model requests, streams, timers) only ever talks to the
// loop by posting events onto its channel.

mod prefetch;


use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::CursorPredictionConfig;
use crate::editor::{Batch, Clock, EditorBuffer, TimerHandle};
use crate::provider::{CompletionProvider, StreamingMode};
use crate::text::{self, compute_diff_lines, create_stages};
use crate::types::{
    Completion, CompletionRequest, CompletionResponse, CompletionSource, CompletionStage,
    CursorTarget, DiffEntry, FileDiffHistory, StagedCompletion,
};

pub use crate::provider::StreamPayload;
pub use prefetch::PrefetchState;

/// Engine timing and behavior knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub workspace_path: String,
    pub completion_timeout: Duration,
    pub idle_completion_delay: Duration,
    pub text_change_debounce: Duration,
    pub cursor_prediction: CursorPredictionConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workspace_path: String::new(),
            completion_timeout: Duration::from_secs(5),
            idle_completion_delay: Duration::from_millis(500),
            text_change_debounce: Duration::from_millis(150),
            cursor_prediction: CursorPredictionConfig::default(),
        }
    }
}

/// The user-visible state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    PendingCompletion,
    HasCompletion,
    HasCursorTarget,
    StreamingCompletion,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EngineState::Idle => "Idle",
            EngineState::PendingCompletion => "PendingCompletion",
            EngineState::HasCompletion => "HasCompletion",
            EngineState::HasCursorTarget => "HasCursorTarget",
            EngineState::StreamingCompletion => "StreamingCompletion",
        };
        f.write_str(name)
    }
}

/// Everything that can reach the event loop.
#[derive(Debug)]
pub enum Event {
    TextChanged,
    TextChangeTimeout,
    IdleTimeout,
    Tab,
    Esc,
    InsertEnter,
    InsertLeave,
    CompletionReady {
        request_id: u64,
        response: CompletionResponse,
    },
    CompletionFailed {
        request_id: u64,
        error: String,
    },
    StreamChunk {
        stream_id: u64,
        payload: StreamPayload,
    },
    PrefetchReady {
        prefetch_id: u64,
        response: CompletionResponse,
    },
    PrefetchFailed {
        prefetch_id: u64,
        error: String,
    },
    Shutdown,
}

/// Event discriminant used by the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    TextChanged,
    TextChangeTimeout,
    IdleTimeout,
    Tab,
    Esc,
    InsertEnter,
    InsertLeave,
}

impl Event {
    fn ui_kind(&self) -> Option<EventKind> {
        match self {
            Event::TextChanged => Some(EventKind::TextChanged),
            Event::TextChangeTimeout => Some(EventKind::TextChangeTimeout),
            Event::IdleTimeout => Some(EventKind::IdleTimeout),
            Event::Tab => Some(EventKind::Tab),
            Event::Esc => Some(EventKind::Esc),
            Event::InsertEnter => Some(EventKind::InsertEnter),
            Event::InsertLeave => Some(EventKind::InsertLeave),
            _ => None,
        }
    }
}

/// Map an editor-sent event name onto an engine event.
pub fn event_from_name(name: &str) -> Option<Event> {
    match name {
        "esc" => Some(Event::Esc),
        "text_changed" => Some(Event::TextChanged),
        "tab" => Some(Event::Tab),
        "insert_enter" => Some(Event::InsertEnter),
        "insert_leave" => Some(Event::InsertLeave),
        _ => None,
    }
}

/// What [`Engine::clear_state`] should drop.
#[derive(Debug, Clone, Copy)]
pub struct ClearOptions {
    pub clear_staged: bool,
    pub clear_cursor_target: bool,
    pub call_on_reject: bool,
}

/// Token-stream scratchpad: the prefix of the line being completed plus the
/// accumulated model text.
#[derive(Debug, Clone, Default)]
pub struct TokenStreamingState {
    pub accumulated_text: String,
    pub line_prefix: String,
    pub line_num: usize,
}

/// Line-stream scratchpad: lines received so far and where they land.
#[derive(Debug, Clone, Default)]
pub struct LineStreamingState {
    pub lines: Vec<String>,
    pub start_line: usize,
}

/// Per-file snapshot used to rebuild diff histories.
#[derive(Debug, Clone, Default)]
pub struct FileState {
    pub original_lines: Vec<String>,
    pub last_access_ns: i64,
    pub diff_history: Vec<DiffEntry>,
}

const MAX_FILE_STATES: usize = 20;
/// Line-count drift beyond which a file snapshot is considered stale.
const MAX_LINE_DRIFT: usize = 10;
const MAX_DIFF_HISTORY_ENTRIES: usize = 8;
const MAX_DIFF_HISTORY_CHARS: usize = 4000;

pub(crate) fn copy_lines(lines: &[String]) -> Vec<String> {
    lines.to_vec()
}

fn abs_diff(a: usize, b: usize) -> usize {
    a.abs_diff(b)
}

type Handler = fn(&mut Engine, Event);

/// Transition table: which UI events each state accepts.
fn find_transition(state: EngineState, kind: EventKind) -> Option<Handler> {
    use EngineState::*;
    use EventKind::*;
    let handler: Handler = match (state, kind) {
        (Idle, TextChanged) => Engine::do_debounce,
        (Idle, TextChangeTimeout) => Engine::do_request_typing,
        (Idle, IdleTimeout) => Engine::do_request_idle,
        (PendingCompletion, TextChanged) => Engine::do_cancel_and_debounce,
        (PendingCompletion, TextChangeTimeout) => Engine::do_request_typing,
        (PendingCompletion, Esc) => Engine::do_cancel_to_idle,
        (HasCompletion, Tab) => Engine::do_accept,
        (HasCompletion, Esc) => Engine::do_reject,
        (HasCompletion, TextChanged) => Engine::do_typing_check,
        (HasCursorTarget, Tab) => Engine::do_accept_cursor_target,
        (HasCursorTarget, Esc) => Engine::do_reject,
        (HasCursorTarget, TextChanged) => Engine::do_reject_and_debounce,
        (StreamingCompletion, TextChanged) => Engine::do_reject_streaming_and_debounce,
        (StreamingCompletion, Esc) => Engine::do_cancel_streaming_to_idle,
        _ => return None,
    };
    Some(handler)
}

/// The completion engine. Construct with [`Engine::new`], hand the sender to
/// the editor integration, and drive with [`Engine::run`].
pub struct Engine {
    state: EngineState,
    config: EngineConfig,
    buffer: Box<dyn EditorBuffer>,
    provider: Arc<dyn CompletionProvider>,
    clock: Arc<dyn Clock>,

    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: Option<mpsc::UnboundedReceiver<Event>>,

    debounce_timer: Option<Box<dyn TimerHandle>>,
    idle_timer: Option<Box<dyn TimerHandle>>,

    // In-flight request bookkeeping. The request id doubles as the stream
    // identity; chunks with any other id are dropped.
    request_seq: u64,
    current_request_id: u64,
    request_cancel: Option<CancellationToken>,

    completions: Vec<Completion>,
    completion_original_lines: Vec<String>,
    cursor_target: Option<CursorTarget>,
    staged_completion: Option<StagedCompletion>,
    pending_batch: Option<Box<dyn Batch>>,

    token_streaming: Option<TokenStreamingState>,
    line_streaming: Option<LineStreamingState>,

    prefetch_state: PrefetchState,
    prefetch_seq: u64,
    current_prefetch_id: u64,
    prefetch_cancel: Option<CancellationToken>,
    prefetched_completions: Vec<Completion>,
    prefetched_cursor_target: Option<CursorTarget>,

    file_state_store: HashMap<String, FileState>,
    access_counter: i64,

    stopped: bool,
}

impl Engine {
    pub fn new(
        provider: Arc<dyn CompletionProvider>,
        mut buffer: Box<dyn EditorBuffer>,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        // Editor callbacks only ever post events; the loop owns all state.
        let handler_tx = events_tx.clone();
        if let Err(err) = buffer.register_event_handler(Box::new(move |name| {
            if let Some(event) = event_from_name(name) {
                let _ = handler_tx.send(event);
            }
        })) {
            warn!(error = %err, "failed to register buffer event handler");
        }

        Self {
            state: EngineState::Idle,
            config,
            buffer,
            provider,
            clock,
            events_tx,
            events_rx: Some(events_rx),
            debounce_timer: None,
            idle_timer: None,
            request_seq: 0,
            current_request_id: 0,
            request_cancel: None,
            completions: Vec::new(),
            completion_original_lines: Vec::new(),
            cursor_target: None,
            staged_completion: None,
            pending_batch: None,
            token_streaming: None,
            line_streaming: None,
            prefetch_state: PrefetchState::None,
            prefetch_seq: 0,
            current_prefetch_id: 0,
            prefetch_cancel: None,
            prefetched_completions: Vec::new(),
            prefetched_cursor_target: None,
            file_state_store: HashMap::new(),
            access_counter: 0,
            stopped: false,
        }
    }

    /// Sender the editor integration posts events through.
    pub fn sender(&self) -> mpsc::UnboundedSender<Event> {
        self.events_tx.clone()
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Run the event loop until shutdown.
    pub async fn run(mut self) {
        let Some(mut events_rx) = self.events_rx.take() else {
            return;
        };
        while let Some(event) = events_rx.recv().await {
            if matches!(event, Event::Shutdown) {
                break;
            }
            self.handle_event(event);
            if self.stopped {
                break;
            }
        }
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stopped = true;
        self.cancel_request();
        self.cancel_prefetch();
        self.stop_timers();
        debug!("engine stopped");
    }

    /// Process one event. Internal events are accepted in any state; UI
    /// events go through the transition table.
    pub fn handle_event(&mut self, event: Event) {
        match event {
            Event::CompletionReady {
                request_id,
                response,
            } => self.handle_completion_ready(request_id, response),
            Event::CompletionFailed { request_id, error } => {
                self.handle_completion_failed(request_id, &error)
            }
            Event::StreamChunk { stream_id, payload } => {
                self.handle_stream_chunk(stream_id, payload)
            }
            Event::PrefetchReady {
                prefetch_id,
                response,
            } => self.handle_prefetch_ready(prefetch_id, response),
            Event::PrefetchFailed { prefetch_id, error } => {
                self.handle_prefetch_failed(prefetch_id, &error)
            }
            Event::InsertEnter => self.do_insert_enter(),
            Event::InsertLeave => self.do_insert_leave(),
            other => {
                self.dispatch(other);
            }
        }
    }

    /// Route a UI event through the transition table. Returns whether a
    /// transition existed.
    fn dispatch(&mut self, event: Event) -> bool {
        let Some(kind) = event.ui_kind() else {
            return false;
        };
        let Some(handler) = find_transition(self.state, kind) else {
            debug!(state = %self.state, ?kind, "no transition");
            return false;
        };
        handler(self, event);
        true
    }

    // ── Timers ────────────────────────────────────────────────────────────

    fn arm_debounce(&mut self) {
        if let Some(mut timer) = self.debounce_timer.take() {
            timer.stop();
        }
        let tx = self.events_tx.clone();
        self.debounce_timer = Some(self.clock.after_func(
            self.config.text_change_debounce,
            Box::new(move || {
                let _ = tx.send(Event::TextChangeTimeout);
            }),
        ));
    }

    fn arm_idle_timer(&mut self) {
        if let Some(mut timer) = self.idle_timer.take() {
            timer.stop();
        }
        let tx = self.events_tx.clone();
        self.idle_timer = Some(self.clock.after_func(
            self.config.idle_completion_delay,
            Box::new(move || {
                let _ = tx.send(Event::IdleTimeout);
            }),
        ));
    }

    fn stop_timers(&mut self) {
        if let Some(mut timer) = self.debounce_timer.take() {
            timer.stop();
        }
        if let Some(mut timer) = self.idle_timer.take() {
            timer.stop();
        }
    }

    // ── UI event handlers ─────────────────────────────────────────────────

    fn do_debounce(&mut self, _event: Event) {
        self.buffer.commit_user_edits();
        self.arm_debounce();
    }

    fn do_request_typing(&mut self, _event: Event) {
        self.request_completion(CompletionSource::Typing);
    }

    fn do_request_idle(&mut self, _event: Event) {
        self.request_completion(CompletionSource::Idle);
    }

    fn do_cancel_and_debounce(&mut self, _event: Event) {
        self.cancel_request();
        self.state = EngineState::Idle;
        self.arm_debounce();
    }

    fn do_cancel_to_idle(&mut self, _event: Event) {
        self.cancel_request();
        self.state = EngineState::Idle;
    }

    fn do_reject(&mut self, _event: Event) {
        self.reject();
    }

    fn do_reject_and_debounce(&mut self, _event: Event) {
        self.reject();
        self.arm_debounce();
    }

    fn do_insert_enter(&mut self) {
        let _ = self.buffer.sync(&self.config.workspace_path);
        if self.state == EngineState::Idle {
            self.arm_idle_timer();
        }
    }

    fn do_insert_leave(&mut self) {
        self.stop_timers();
        self.cancel_request();
        if self.state != EngineState::Idle {
            self.reject();
        }
    }

    /// Typing while a completion is visible: hold it while the buffer stays
    /// a per-line prefix of the prediction, drop cleanly once fully typed,
    /// reject on divergence.
    fn do_typing_check(&mut self, _event: Event) {
        let _ = self.buffer.sync(&self.config.workspace_path);
        let (matches, has_remaining) = self.check_typing_matches_prediction();
        if matches && has_remaining {
            return;
        }
        if matches {
            self.clear_state(ClearOptions {
                clear_staged: true,
                clear_cursor_target: true,
                call_on_reject: false,
            });
            self.state = EngineState::Idle;
            return;
        }
        self.reject();
        self.arm_debounce();
    }

    /// Typing during streaming. Token streams may keep their partial result
    /// when the user typed exactly what was predicted so far; line streams
    /// always reject.
    fn do_reject_streaming_and_debounce(&mut self, _event: Event) {
        if self.token_streaming.is_some() {
            let _ = self.buffer.sync(&self.config.workspace_path);
            let (matches, has_remaining) = self.check_typing_matches_prediction();
            if matches && has_remaining {
                self.cancel_token_streaming_keep_partial();
                self.state = EngineState::HasCompletion;
                return;
            }
            if matches {
                self.cancel_token_streaming_keep_partial();
                self.clear_state(ClearOptions {
                    clear_staged: true,
                    clear_cursor_target: true,
                    call_on_reject: false,
                });
                self.state = EngineState::Idle;
                return;
            }
        }
        self.cancel_streaming();
        self.reject();
        self.arm_debounce();
    }

    fn do_cancel_streaming_to_idle(&mut self, _event: Event) {
        self.cancel_streaming();
        self.reject();
    }

    // ── Accept / reject ───────────────────────────────────────────────────

    /// Tab on a visible completion: apply the current stage, then advance
    /// the plan or surface the cursor-target flow.
    fn do_accept(&mut self, _event: Event) {
        if let Some(mut batch) = self.pending_batch.take() {
            if let Err(err) = batch.execute() {
                error!(error = %err, "failed to apply completion batch");
            }
        }
        self.buffer.commit_pending();

        let Some(mut staged) = self.staged_completion.take() else {
            // Plain single completion.
            self.completions.clear();
            self.completion_original_lines.clear();
            if self.cursor_target.is_some() {
                self.handle_cursor_target();
            } else {
                self.state = EngineState::Idle;
            }
            return;
        };

        let idx = staged.current_idx;
        let Some(stage) = staged.stages.get(idx).cloned() else {
            self.state = EngineState::Idle;
            return;
        };

        // Track line drift so later stages land where they should.
        let replaced = if stage.completion.end_line_inc >= stage.completion.start_line {
            (stage.completion.end_line_inc - stage.completion.start_line + 1) as i64
        } else {
            0
        };
        staged.cumulative_offset += stage.completion.lines.len() as i64 - replaced;

        self.completions.clear();
        self.completion_original_lines.clear();

        let mut target = stage.cursor_target.clone();
        target.line_number += staged.cumulative_offset as i32;

        if stage.is_last_stage {
            self.staged_completion = None;
            self.cursor_target = Some(target);
            self.handle_last_stage_cursor_target();
            return;
        }

        staged.current_idx = idx + 1;
        self.staged_completion = Some(staged);
        self.cursor_target = Some(target.clone());

        if self.buffer.show_cursor_target(target.line_number as i64).is_ok() {
            self.state = EngineState::HasCursorTarget;
        } else {
            self.state = EngineState::Idle;
        }
    }

    /// Tab on a cursor target: jump there, then show the next stage, consume
    /// the prefetch, or retrigger.
    fn do_accept_cursor_target(&mut self, _event: Event) {
        let Some(target) = self.cursor_target.clone() else {
            self.state = EngineState::Idle;
            return;
        };
        let _ = self.buffer.move_cursor(target.line_number as i64, true, true);
        let _ = self.buffer.clear_ui();

        if self
            .staged_completion
            .as_ref()
            .is_some_and(|s| s.current_idx < s.stages.len())
        {
            self.cursor_target = None;
            self.show_current_stage();
            return;
        }

        match self.prefetch_state {
            PrefetchState::InFlight => {
                // Defer: the prefetch response continues this flow.
                self.prefetch_state = PrefetchState::WaitingForTab;
            }
            PrefetchState::Ready => {
                self.cursor_target = None;
                if !self.use_prefetched_completion() {
                    if target.should_retrigger {
                        self.request_completion(CompletionSource::Typing);
                    } else {
                        self.state = EngineState::Idle;
                    }
                }
            }
            _ => {
                self.cursor_target = None;
                if target.should_retrigger {
                    self.request_completion(CompletionSource::Typing);
                } else {
                    self.state = EngineState::Idle;
                }
            }
        }
    }

    /// Clear everything user-visible and return to Idle.
    fn reject(&mut self) {
        self.cancel_request();
        self.clear_state(ClearOptions {
            clear_staged: true,
            clear_cursor_target: true,
            call_on_reject: true,
        });
        self.state = EngineState::Idle;
    }

    fn clear_state(&mut self, opts: ClearOptions) {
        self.completions.clear();
        self.completion_original_lines.clear();
        self.pending_batch = None;
        self.token_streaming = None;
        self.line_streaming = None;
        if opts.clear_staged {
            self.staged_completion = None;
        }
        if opts.clear_cursor_target {
            self.cursor_target = None;
        }
        if opts.call_on_reject {
            let _ = self.buffer.clear_ui();
        }
    }

    // ── Request dispatch ──────────────────────────────────────────────────

    fn request_completion(&mut self, source: CompletionSource) {
        self.request_completion_at(source, None);
    }

    /// Dispatch a completion request, superseding any in-flight one. An
    /// override position requests a completion for a predicted cursor spot
    /// without moving the real cursor.
    fn request_completion_at(
        &mut self,
        source: CompletionSource,
        override_pos: Option<(usize, usize)>,
    ) {
        if self.stopped {
            return;
        }
        let _ = self.buffer.sync(&self.config.workspace_path);
        self.ensure_file_state();
        self.cancel_request();

        self.request_seq += 1;
        let request_id = self.request_seq;
        self.current_request_id = request_id;
        let cancel = CancellationToken::new();
        self.request_cancel = Some(cancel.clone());

        let request = Arc::new(self.build_request(source, override_pos));
        let provider = self.provider.clone();
        let tx = self.events_tx.clone();
        let timeout = self.config.completion_timeout;
        let streaming = provider.streaming_mode();

        debug!(request_id, ?source, streaming = ?streaming, "dispatching completion request");
        self.state = EngineState::PendingCompletion;

        tokio::spawn(async move {
            let timeout_cancel = cancel.clone();
            let timeout_guard = tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                timeout_cancel.cancel();
            });

            let result = if streaming == StreamingMode::None {
                provider.get_completion(&cancel, request).await
            } else {
                let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel();
                let chunk_events = tx.clone();
                let pump = tokio::spawn(async move {
                    while let Some(payload) = chunk_rx.recv().await {
                        let _ = chunk_events.send(Event::StreamChunk {
                            stream_id: request_id,
                            payload,
                        });
                    }
                });
                let result = provider.stream_completion(&cancel, request, chunk_tx).await;
                let _ = pump.await;
                result
            };
            timeout_guard.abort();

            let event = match result {
                Ok(response) => Event::CompletionReady {
                    request_id,
                    response,
                },
                Err(err) => Event::CompletionFailed {
                    request_id,
                    error: format!("{err:#}"),
                },
            };
            let _ = tx.send(event);
        });
    }

    fn cancel_request(&mut self) {
        if let Some(cancel) = self.request_cancel.take() {
            cancel.cancel();
        }
        self.current_request_id = 0;
        self.token_streaming = None;
        self.line_streaming = None;
    }

    fn build_request(
        &mut self,
        source: CompletionSource,
        override_pos: Option<(usize, usize)>,
    ) -> CompletionRequest {
        let lines = copy_lines(&self.buffer.lines());
        let path = self.buffer.path();
        let (cursor_row, cursor_col) = match override_pos {
            Some((row, col)) => (row, col),
            None => (self.buffer.row(), self.buffer.col()),
        };

        let previous_lines = {
            let from_buffer = self.buffer.previous_lines();
            if from_buffer.is_empty() {
                self.file_state_store
                    .get(&path)
                    .map(|s| copy_lines(&s.original_lines))
                    .unwrap_or_default()
            } else {
                copy_lines(&from_buffer)
            }
        };

        CompletionRequest {
            source,
            workspace_path: self.config.workspace_path.clone(),
            file_path: path,
            lines,
            version: self.buffer.version(),
            previous_lines,
            file_diff_histories: self.all_file_diff_histories(),
            cursor_row,
            cursor_col,
            viewport_height: self.viewport_height_constraint(),
            linter_errors: self.buffer.linter_errors(),
        }
    }

    fn viewport_height_constraint(&self) -> usize {
        if self.config.cursor_prediction.enabled {
            return 0;
        }
        let (top, bottom) = self.buffer.viewport_bounds();
        if bottom >= top && top > 0 {
            (bottom - top + 1) as usize
        } else {
            0
        }
    }

    // ── Response handling ─────────────────────────────────────────────────

    fn handle_completion_ready(&mut self, request_id: u64, response: CompletionResponse) {
        if request_id != self.current_request_id || self.current_request_id == 0 {
            debug!(request_id, "dropping stale completion response");
            return;
        }
        self.current_request_id = 0;
        self.request_cancel = None;
        self.token_streaming = None;
        self.line_streaming = None;

        if !matches!(
            self.state,
            EngineState::PendingCompletion | EngineState::StreamingCompletion
        ) {
            debug!(state = %self.state, "completion arrived in non-pending state");
            return;
        }

        self.apply_completion_response(response);
    }

    fn apply_completion_response(&mut self, response: CompletionResponse) {
        let Some(completion) = response.completions.first().cloned() else {
            if response.cursor_target.is_some() {
                self.cursor_target = response.cursor_target;
                self.handle_cursor_target();
            } else {
                self.clear_state(ClearOptions {
                    clear_staged: true,
                    clear_cursor_target: false,
                    call_on_reject: true,
                });
                self.state = EngineState::Idle;
            }
            return;
        };

        if !self.process_completion(completion, response.cursor_target.clone()) {
            debug!("completion produced no changes");
            self.cursor_target = response.cursor_target;
            self.handle_cursor_target();
        }
    }

    fn handle_completion_failed(&mut self, request_id: u64, error: &str) {
        if request_id != self.current_request_id || self.current_request_id == 0 {
            debug!(request_id, "dropping stale completion error");
            return;
        }
        self.current_request_id = 0;
        self.request_cancel = None;

        if error.contains("cancelled") {
            debug!(error, "completion cancelled");
        } else {
            warn!(error, "completion request failed");
        }

        let was_streaming = self.state == EngineState::StreamingCompletion;
        self.token_streaming = None;
        self.line_streaming = None;
        if matches!(
            self.state,
            EngineState::PendingCompletion | EngineState::StreamingCompletion
        ) {
            if was_streaming {
                let _ = self.buffer.clear_ui();
            }
            self.state = EngineState::Idle;
        }
    }

    /// Turn a completion into visible state. Returns false when it changes
    /// nothing in the buffer.
    pub(crate) fn process_completion(
        &mut self,
        completion: Completion,
        cursor_target: Option<CursorTarget>,
    ) -> bool {
        let _ = self.buffer.sync(&self.config.workspace_path);
        if !self.buffer.has_changes(
            completion.start_line,
            completion.end_line_inc,
            &completion.lines,
        ) {
            return false;
        }

        let lines = self.buffer.lines();
        let start = completion.start_line.max(1);
        let end = completion.end_line_inc.min(lines.len());
        let old_slice: Vec<String> = if end >= start {
            lines[start - 1..end].to_vec()
        } else {
            Vec::new()
        };

        let staging = if self.config.cursor_prediction.enabled {
            let diff = compute_diff_lines(&old_slice, &completion.lines);
            let (top, bottom) = self.buffer.viewport_bounds();
            create_stages(
                &diff,
                self.buffer.row() as i64,
                top,
                bottom,
                completion.start_line as i64,
                self.config.cursor_prediction.proximity_threshold,
                &self.buffer.path(),
                &completion.lines,
                &old_slice,
            )
        } else {
            None
        };

        match staging {
            Some(result) if result.stages.len() > 1 => {
                let stages: Vec<CompletionStage> =
                    result.stages.iter().map(stage_to_completion_stage).collect();
                self.staged_completion = Some(StagedCompletion {
                    stages,
                    current_idx: 0,
                    source_path: self.buffer.path(),
                    cumulative_offset: 0,
                });
                self.cursor_target = cursor_target;
                self.show_current_stage();
            }
            Some(result) => {
                // Single stage: show it directly, with its visual groups.
                let Some(stage) = result.stages.first() else {
                    return false;
                };
                let stage = stage_to_completion_stage(stage);
                self.staged_completion = None;
                self.cursor_target = cursor_target;
                self.show_completion(&stage.completion, &stage.visual_groups);
            }
            None => {
                self.staged_completion = None;
                self.cursor_target = cursor_target;
                self.show_completion(&completion, &[]);
            }
        }
        true
    }

    fn show_completion(&mut self, completion: &Completion, groups: &[crate::types::VisualGroup]) {
        let lines = self.buffer.lines();
        let start = completion.start_line.max(1);
        let end = completion.end_line_inc.min(lines.len());
        self.completion_original_lines = if end >= start {
            lines[start - 1..end].to_vec()
        } else {
            Vec::new()
        };

        self.pending_batch = Some(self.buffer.prepare_completion(
            completion.start_line,
            completion.end_line_inc,
            &completion.lines,
            groups,
        ));
        self.completions = vec![completion.clone()];
        self.state = EngineState::HasCompletion;
    }

    /// Show the staged plan's current stage, shifted by the accumulated line
    /// drift from earlier accepts.
    fn show_current_stage(&mut self) {
        let Some(staged) = self.staged_completion.as_ref() else {
            self.state = EngineState::Idle;
            return;
        };
        let offset = staged.cumulative_offset;
        let Some(stage) = staged.stages.get(staged.current_idx).cloned() else {
            self.staged_completion = None;
            self.state = EngineState::Idle;
            return;
        };

        let start = (stage.completion.start_line as i64 + offset).max(1) as usize;
        let end_signed = stage.completion.end_line_inc as i64 + offset;
        let end = end_signed.max(0) as usize;
        let shifted = Completion {
            start_line: start,
            end_line_inc: end,
            lines: stage.completion.lines.clone(),
        };
        self.show_completion(&shifted, &stage.visual_groups);
    }

    // ── Streaming ─────────────────────────────────────────────────────────

    fn handle_stream_chunk(&mut self, stream_id: u64, payload: StreamPayload) {
        // Stream contamination check: only the active stream may touch state.
        if stream_id != self.current_request_id || self.current_request_id == 0 {
            debug!(stream_id, "dropping chunk from superseded stream");
            return;
        }
        if !matches!(
            self.state,
            EngineState::PendingCompletion | EngineState::StreamingCompletion
        ) {
            return;
        }
        self.state = EngineState::StreamingCompletion;

        match payload {
            StreamPayload::CumulativeText(text) => self.handle_token_chunk(text),
            StreamPayload::Line(line) => self.handle_line_chunk(line),
        }
    }

    fn handle_token_chunk(&mut self, text: String) {
        if self.token_streaming.is_none() {
            let row = self.buffer.row().max(1);
            let lines = self.buffer.lines();
            let current = lines.get(row - 1).cloned().unwrap_or_default();
            let col = self.buffer.col().min(current.len());
            self.completion_original_lines = vec![current.clone()];
            self.token_streaming = Some(TokenStreamingState {
                accumulated_text: String::new(),
                line_prefix: current[..col].to_string(),
                line_num: row,
            });
        }

        let Some(streaming) = self.token_streaming.as_mut() else {
            return;
        };
        streaming.accumulated_text = text;
        let full_line = format!("{}{}", streaming.line_prefix, streaming.accumulated_text);
        let line_num = streaming.line_num;

        let completion = Completion {
            start_line: line_num,
            end_line_inc: line_num,
            lines: vec![full_line],
        };
        self.pending_batch = Some(self.buffer.prepare_completion(
            completion.start_line,
            completion.end_line_inc,
            &completion.lines,
            &[],
        ));
        self.completions = vec![completion];
    }

    fn handle_line_chunk(&mut self, line: String) {
        if self.line_streaming.is_none() {
            self.line_streaming = Some(LineStreamingState {
                lines: Vec::new(),
                start_line: self.buffer.row().max(1),
            });
        }
        let Some(streaming) = self.line_streaming.as_mut() else {
            return;
        };
        streaming.lines.push(line);
        let start_line = streaming.start_line;
        let lines = streaming.lines.clone();

        self.pending_batch = Some(self.buffer.prepare_completion(
            start_line,
            start_line + lines.len().saturating_sub(1),
            &lines,
            &[],
        ));
    }

    fn cancel_streaming(&mut self) {
        self.cancel_request();
    }

    /// Cancel a token stream but keep the partial completion visible; the
    /// user has typed into it and it still matches.
    fn cancel_token_streaming_keep_partial(&mut self) {
        if let Some(cancel) = self.request_cancel.take() {
            cancel.cancel();
        }
        self.current_request_id = 0;
        self.token_streaming = None;
        // completions and completion_original_lines survive on purpose.
    }

    // ── Predictive typing ─────────────────────────────────────────────────

    /// Check that the buffer's content in the completion range is a per-line
    /// prefix of the prediction. Returns (matches, has_remaining).
    pub(crate) fn check_typing_matches_prediction(&self) -> (bool, bool) {
        let Some(completion) = self.completions.first() else {
            return (false, false);
        };
        // Deletions cannot be typed through.
        if completion.lines.len() < self.completion_original_lines.len() {
            return (false, false);
        }

        let buffer_lines = self.buffer.lines();
        let mut has_remaining = false;
        for (i, target) in completion.lines.iter().enumerate() {
            let idx = completion.start_line.saturating_sub(1) + i;
            let current = buffer_lines.get(idx).map(String::as_str).unwrap_or("");
            if !target.starts_with(current) {
                return (false, false);
            }
            if current.len() < target.len() {
                has_remaining = true;
            }
        }
        (true, has_remaining)
    }

    // ── Cursor targets ────────────────────────────────────────────────────

    /// Surface the pending cursor target, or drop it when prediction is
    /// disabled or the target is too close to matter.
    pub(crate) fn handle_cursor_target(&mut self) {
        let Some(target) = self.cursor_target.clone() else {
            self.state = EngineState::Idle;
            return;
        };
        if !self.config.cursor_prediction.enabled {
            self.cursor_target = None;
            self.state = EngineState::Idle;
            return;
        }

        let distance = abs_diff(target.line_number.max(0) as usize, self.buffer.row());
        if distance <= self.config.cursor_prediction.proximity_threshold {
            self.cursor_target = None;
            self.state = EngineState::Idle;
            return;
        }

        match self.buffer.show_cursor_target(target.line_number as i64) {
            Ok(()) => {
                self.state = EngineState::HasCursorTarget;
                // Speculate on the jump being accepted.
                self.request_prefetch(
                    CompletionSource::Typing,
                    target.line_number.max(1) as usize,
                    0,
                );
            }
            Err(err) => {
                warn!(error = %err, "failed to show cursor target");
                self.cursor_target = None;
                self.state = EngineState::Idle;
            }
        }
    }

    // ── File state store ──────────────────────────────────────────────────

    fn is_file_state_valid(&self, state: &FileState, current_lines: &[String]) -> bool {
        if state.original_lines.is_empty() {
            return false;
        }
        abs_diff(state.original_lines.len(), current_lines.len()) <= MAX_LINE_DRIFT
    }

    /// Snapshot the current file if needed and fold the latest edit into its
    /// diff history.
    fn ensure_file_state(&mut self) {
        let path = self.buffer.path();
        let lines = self.buffer.lines();
        self.access_counter += 1;
        let now = self.access_counter;

        let valid = self
            .file_state_store
            .get(&path)
            .map(|s| self.is_file_state_valid(s, &lines))
            .unwrap_or(false);

        if !valid {
            self.file_state_store.insert(
                path,
                FileState {
                    original_lines: copy_lines(&lines),
                    last_access_ns: now,
                    diff_history: Vec::new(),
                },
            );
        } else if let Some(state) = self.file_state_store.get_mut(&path) {
            state.last_access_ns = now;
            if state.original_lines != lines {
                let entry = DiffEntry {
                    original: state.original_lines.join("\n"),
                    updated: lines.join("\n"),
                };
                match state.diff_history.last_mut() {
                    Some(last) if last.original == entry.original => *last = entry,
                    _ => state.diff_history.push(entry),
                }
                trim_diff_history(&mut state.diff_history);
            }
        }

        self.trim_file_state_store(MAX_FILE_STATES);
    }

    /// Keep only the `max` most recently accessed file states.
    fn trim_file_state_store(&mut self, max: usize) {
        if self.file_state_store.len() <= max {
            return;
        }
        let mut entries: Vec<(String, i64)> = self
            .file_state_store
            .iter()
            .map(|(path, state)| (path.clone(), state.last_access_ns))
            .collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1));
        for (path, _) in entries.into_iter().skip(max) {
            self.file_state_store.remove(&path);
        }
    }

    /// All known per-file diff histories, least recently touched first; the
    /// current file ends up last.
    fn all_file_diff_histories(&self) -> Vec<FileDiffHistory> {
        let mut entries: Vec<(&String, &FileState)> = self
            .file_state_store
            .iter()
            .filter(|(_, state)| !state.diff_history.is_empty())
            .collect();
        entries.sort_by_key(|(_, state)| state.last_access_ns);
        entries
            .into_iter()
            .map(|(path, state)| FileDiffHistory {
                file_name: path.clone(),
                diff_history: state.diff_history.clone(),
            })
            .collect()
    }
}

/// Bound a diff history by entry count and total size, oldest first.
fn trim_diff_history(history: &mut Vec<DiffEntry>) {
    while history.len() > MAX_DIFF_HISTORY_ENTRIES {
        history.remove(0);
    }
    let mut total: usize = history
        .iter()
        .map(|e| e.original.len() + e.updated.len())
        .sum();
    while total > MAX_DIFF_HISTORY_CHARS && history.len() > 1 {
        let removed = history.remove(0);
        total -= removed.original.len() + removed.updated.len();
    }
}

fn stage_to_completion_stage(stage: &text::Stage) -> CompletionStage {
    CompletionStage {
        completion: Completion {
            start_line: stage.buffer_start.max(1) as usize,
            end_line_inc: stage.buffer_end.max(0) as usize,
            lines: stage.lines.clone(),
        },
        cursor_target: stage.cursor_target.clone().unwrap_or_else(|| CursorTarget {
            relative_path: String::new(),
            line_number: stage.buffer_end.max(0) as i32,
            expected_content: String::new(),
            should_retrigger: true,
        }),
        is_last_stage: stage.is_last_stage,
        visual_groups: stage.groups.clone(),
    }
}
