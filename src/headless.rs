//! Headless (agent conversation) session state machine.
//!
//! ```text
//!          start            session_info           prompt
//!   Idle ────────► Starting ────────────► Active ────────► Running
//!                                           ▲                 │
//!                                           └─ turn_complete ─┘
//!                                              / error
//! ```
//!
//! Callers never have to wait for the channel or the session: a prompt
//! submitted before either is ready is held in a single pending slot and
//! flushed once `session_info` arrives on a connected channel. A prompt
//! submitted with no session at all starts one first.
//!
//! Cancel does not finish the turn locally. The server answers with
//! `turn_complete` or `error` and that is what moves the machine back to
//! `Active`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::channel::{ChannelLink, ConnectionState};
use crate::constants::HISTORY_PAGE_SIZE;
use crate::protocol::headless::{
    ErrorPayload, HistoryPage, ModeSwitched, SessionInfo, SessionMode, StreamEvent, TurnComplete,
    TurnMetrics, TurnRecord, TurnStarted,
};
use crate::protocol::{HeadlessCommand, HeadlessEnvelope, WireFrame};

/// Conversation-level state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HeadlessState {
    /// No session.
    #[default]
    Idle,
    /// Start requested, waiting for `session_info`.
    Starting,
    /// Ready for a prompt.
    Active,
    /// A turn is executing.
    Running,
}

/// How to treat an existing conversation on connect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AttachMode {
    /// Attach as-is.
    #[default]
    Resume,
    /// Attach, then start a fresh session.
    StartFresh,
}

/// Lifecycle of one turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    /// Prompt sent, server has not opened the turn yet.
    Pending,
    /// Agent is working.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Error,
}

impl TurnState {
    fn from_status(status: Option<&str>) -> Self {
        match status {
            Some("pending") => Self::Pending,
            Some("running" | "in_progress") => Self::Running,
            Some("error" | "failed" | "cancelled") => Self::Error,
            _ => Self::Completed,
        }
    }

    /// Whether the turn can still change.
    pub fn is_open(self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }
}

/// One prompt/response unit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Turn {
    /// Turn id. Local placeholder until the server assigns one.
    pub id: String,
    /// Position in the conversation.
    pub index: u32,
    /// Prompt text.
    pub prompt: String,
    /// Streamed agent events, in arrival order.
    pub events: Vec<serde_json::Value>,
    /// Lifecycle state.
    pub state: TurnState,
    /// Usage reported on completion.
    pub metrics: TurnMetrics,
    /// Server-reported failure for this turn.
    pub error: Option<String>,
    /// When this client first saw the turn.
    pub started_at: DateTime<Utc>,
    /// When the turn reached a final state.
    pub finished_at: Option<DateTime<Utc>>,
}

impl Turn {
    fn local(index: u32, prompt: String) -> Self {
        Self {
            id: format!("local-{}", uuid::Uuid::new_v4()),
            index,
            prompt,
            events: Vec::new(),
            state: TurnState::Pending,
            metrics: TurnMetrics::default(),
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    fn from_record(record: TurnRecord) -> Self {
        let state = TurnState::from_status(record.status.as_deref());
        let now = Utc::now();
        Self {
            id: record.id,
            index: record.index,
            prompt: record.prompt,
            events: record.events,
            state,
            metrics: record.metrics,
            error: record.error,
            started_at: now,
            finished_at: (!state.is_open()).then_some(now),
        }
    }

    fn finish(&mut self, state: TurnState) {
        self.state = state;
        self.finished_at = Some(Utc::now());
    }
}

/// Rejected headless operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeadlessError {
    /// The operation is not valid in this state.
    InvalidState {
        /// Operation attempted.
        operation: &'static str,
        /// State at the time.
        state: HeadlessState,
    },
    /// A turn is already executing.
    TurnInProgress,
    /// A prompt is already waiting to be sent.
    PromptPending,
    /// The server reported no older turns.
    NoMoreHistory,
}

impl std::fmt::Display for HeadlessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidState { operation, state } => {
                write!(f, "Cannot {operation} while {state:?}")
            }
            Self::TurnInProgress => write!(f, "A turn is already running"),
            Self::PromptPending => write!(f, "A prompt is already waiting to be sent"),
            Self::NoMoreHistory => write!(f, "No older turns available"),
        }
    }
}

impl std::error::Error for HeadlessError {}

/// Something the front-end should render or react to.
#[derive(Debug, Clone, PartialEq)]
pub enum HeadlessUpdate {
    /// Conversation state changed.
    State(HeadlessState),
    /// Session started or attached.
    Session {
        /// Agent session id.
        session_id: Option<String>,
        /// Conversation id.
        conversation_id: Option<String>,
    },
    /// Turns were added or replaced.
    TurnsChanged,
    /// A turn received a streamed event.
    TurnEvent {
        /// Turn id.
        turn_id: String,
        /// The event.
        event: serde_json::Value,
    },
    /// A turn reached a final state.
    TurnFinished {
        /// Turn id.
        turn_id: String,
        /// Final state.
        state: TurnState,
    },
    /// An older page of history was prepended.
    HistoryPrepended {
        /// Turns added.
        count: usize,
        /// Whether more pages remain.
        has_more: bool,
    },
    /// Mode switch acknowledged.
    ModeSwitched {
        /// New mode.
        mode: SessionMode,
        /// Interactive sessions the server closed as a side effect.
        closed_sessions: u32,
    },
    /// The front-end should move to the terminal view.
    ShowTerminal,
    /// Error not attached to any turn.
    Error {
        /// Error code, if any.
        code: Option<String>,
        /// Message.
        message: String,
    },
    /// Unstructured frame.
    RawOutput(String),
}

#[derive(Debug, Clone)]
struct PendingPrompt {
    prompt: String,
    source: String,
    model: Option<String>,
}

/// Turn-based conversation driven over a [`ChannelLink`].
#[derive(Debug)]
pub struct HeadlessSession<L> {
    link: L,
    state: HeadlessState,
    attach: AttachMode,
    work_dir: Option<String>,
    session_id: Option<String>,
    conversation_id: Option<String>,
    turns: Vec<Turn>,
    pending: Option<PendingPrompt>,
    has_more: bool,
    loading_more: bool,
    fresh_start_done: bool,
    /// `session_info` received on the current connection.
    attached: bool,
}

impl<L: ChannelLink> HeadlessSession<L> {
    /// New idle conversation.
    pub fn new(link: L, attach: AttachMode) -> Self {
        Self {
            link,
            state: HeadlessState::Idle,
            attach,
            work_dir: None,
            session_id: None,
            conversation_id: None,
            turns: Vec::new(),
            pending: None,
            has_more: false,
            loading_more: false,
            fresh_start_done: false,
            attached: false,
        }
    }

    /// Working directory for sessions started implicitly.
    #[must_use]
    pub fn with_work_dir(mut self, work_dir: Option<String>) -> Self {
        self.work_dir = work_dir;
        self
    }

    /// The channel link.
    pub fn link(&self) -> &L {
        &self.link
    }

    /// Conversation state.
    pub fn state(&self) -> HeadlessState {
        self.state
    }

    /// Agent session id.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Conversation id.
    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    /// Turns, oldest first.
    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    /// Whether older turns can be requested.
    pub fn has_more(&self) -> bool {
        self.has_more
    }

    /// Whether a prompt is waiting to be sent.
    pub fn has_pending_prompt(&self) -> bool {
        self.pending.is_some()
    }

    /// Request a new agent session.
    ///
    /// Valid from `Idle`, or from `Active` when no session exists yet.
    pub fn start_session(&mut self, work_dir: Option<String>) -> Result<(), HeadlessError> {
        let allowed = match self.state {
            HeadlessState::Idle => true,
            HeadlessState::Active => self.session_id.is_none(),
            HeadlessState::Starting | HeadlessState::Running => false,
        };
        if !allowed {
            return Err(HeadlessError::InvalidState {
                operation: "start a session",
                state: self.state,
            });
        }

        if work_dir.is_some() {
            self.work_dir = work_dir;
        }
        self.state = HeadlessState::Starting;
        self.fresh_start_done = true;
        self.send_start();
        Ok(())
    }

    /// Submit a prompt.
    ///
    /// Buffers the prompt until a session is acknowledged and the channel is
    /// connected. When no session exists one is started, except that a
    /// resuming conversation first waits for the server's `session_info`:
    /// attaching may reveal a live session, and only an attach without one
    /// starts a new session.
    pub fn send_prompt(
        &mut self,
        prompt: impl Into<String>,
        source: impl Into<String>,
        model: Option<String>,
    ) -> Result<Vec<HeadlessUpdate>, HeadlessError> {
        if self.state == HeadlessState::Running {
            return Err(HeadlessError::TurnInProgress);
        }
        if self.pending.is_some() {
            return Err(HeadlessError::PromptPending);
        }

        let mut updates = Vec::new();
        let awaiting_attach = self.attach == AttachMode::Resume && !self.attached;
        if self.session_id.is_none() && self.state != HeadlessState::Starting && !awaiting_attach {
            self.start_session(None)?;
            updates.push(HeadlessUpdate::State(self.state));
        }

        self.pending = Some(PendingPrompt {
            prompt: prompt.into(),
            source: source.into(),
            model,
        });
        self.flush_pending(&mut updates);
        Ok(updates)
    }

    /// Ask the server to cancel the running turn.
    pub fn cancel(&mut self) -> Result<(), HeadlessError> {
        if self.state != HeadlessState::Running {
            return Err(HeadlessError::InvalidState {
                operation: "cancel",
                state: self.state,
            });
        }
        log::info!("[Headless] Cancelling running turn");
        self.link.send_text(HeadlessCommand::HeadlessCancel.encode());
        Ok(())
    }

    /// Switch the container's presentation mode.
    pub fn switch_mode(&mut self, mode: SessionMode) {
        log::info!("[Headless] Requesting mode switch to {}", mode);
        self.link
            .send_text(HeadlessCommand::ModeSwitch { mode }.encode());
    }

    /// Request the page of turns before the oldest one held.
    ///
    /// `None` asks for [`HISTORY_PAGE_SIZE`] turns.
    pub fn load_more(&mut self, limit: Option<u32>) -> Result<(), HeadlessError> {
        if !self.has_more {
            return Err(HeadlessError::NoMoreHistory);
        }
        let Some(oldest) = self.turns.first() else {
            return Err(HeadlessError::NoMoreHistory);
        };
        if self.loading_more {
            return Ok(());
        }
        self.loading_more = true;
        self.link.send_text(
            HeadlessCommand::LoadMore {
                before_turn_id: oldest.id.clone(),
                limit: limit.unwrap_or(HISTORY_PAGE_SIZE),
            }
            .encode(),
        );
        Ok(())
    }

    /// The channel changed state.
    pub fn on_connection(&mut self, state: ConnectionState) -> Vec<HeadlessUpdate> {
        let mut updates = Vec::new();
        match state {
            ConnectionState::Connected => {
                if self.state == HeadlessState::Starting {
                    // The start may have been dropped while the socket was down.
                    self.send_start();
                } else if self.attach == AttachMode::StartFresh
                    && !self.fresh_start_done
                    && self.state == HeadlessState::Idle
                {
                    self.fresh_start_done = true;
                    self.state = HeadlessState::Starting;
                    self.send_start();
                    updates.push(HeadlessUpdate::State(self.state));
                }
                self.flush_pending(&mut updates);
            }
            ConnectionState::Reconnecting | ConnectionState::Disconnected => {
                self.loading_more = false;
                self.attached = false;
            }
            ConnectionState::Connecting | ConnectionState::Closing => {}
        }
        updates
    }

    /// Handle one inbound frame.
    pub fn handle_frame(&mut self, frame: &WireFrame) -> Vec<HeadlessUpdate> {
        let mut updates = Vec::new();
        match HeadlessEnvelope::decode(frame) {
            HeadlessEnvelope::SessionInfo(info) => self.on_session_info(info, &mut updates),
            HeadlessEnvelope::History(page) => self.on_history(page, &mut updates),
            HeadlessEnvelope::StreamEvent(event) => self.on_stream_event(event, &mut updates),
            HeadlessEnvelope::TurnStarted(started) => self.on_turn_started(started, &mut updates),
            HeadlessEnvelope::TurnComplete(done) => self.on_turn_complete(done, &mut updates),
            HeadlessEnvelope::Error(error) => self.on_error(error, &mut updates),
            HeadlessEnvelope::ModeSwitched(ModeSwitched {
                mode,
                closed_sessions,
            }) => {
                log::info!(
                    "[Headless] Mode switched to {} ({} session(s) closed)",
                    mode,
                    closed_sessions
                );
                updates.push(HeadlessUpdate::ModeSwitched {
                    mode,
                    closed_sessions,
                });
                if mode == SessionMode::Terminal {
                    updates.push(HeadlessUpdate::ShowTerminal);
                }
            }
            HeadlessEnvelope::RawOutput(text) => updates.push(HeadlessUpdate::RawOutput(text)),
            HeadlessEnvelope::Pong | HeadlessEnvelope::Unknown => {}
        }
        updates
    }

    fn on_session_info(&mut self, info: SessionInfo, updates: &mut Vec<HeadlessUpdate>) {
        self.attached = true;
        if info.conversation_id.is_some() {
            self.conversation_id = info.conversation_id;
        }
        if info.session_id.is_some() {
            self.session_id = info.session_id;
        }
        log::info!(
            "[Headless] Session {:?} (conversation {:?}, status {:?})",
            self.session_id,
            self.conversation_id,
            info.status
        );
        updates.push(HeadlessUpdate::Session {
            session_id: self.session_id.clone(),
            conversation_id: self.conversation_id.clone(),
        });

        let next = match self.state {
            HeadlessState::Starting if self.session_id.is_none() => HeadlessState::Starting,
            HeadlessState::Idle | HeadlessState::Starting => HeadlessState::Active,
            other => other,
        };
        self.set_state(next, updates);

        if self.session_id.is_none() && self.pending.is_some() && self.state != HeadlessState::Starting
        {
            log::debug!("[Headless] Attached without a live session, starting one");
            if self.start_session(None).is_ok() {
                updates.push(HeadlessUpdate::State(self.state));
            }
        }
        self.flush_pending(updates);
    }

    fn on_history(&mut self, page: HistoryPage, updates: &mut Vec<HeadlessUpdate>) {
        let older: Vec<Turn> = page.turns.into_iter().map(Turn::from_record).collect();
        self.has_more = page.has_more;

        if self.loading_more {
            self.loading_more = false;
            let count = older.len();
            let mut merged = older;
            merged.append(&mut self.turns);
            self.turns = merged;
            updates.push(HeadlessUpdate::HistoryPrepended {
                count,
                has_more: self.has_more,
            });
            return;
        }

        // Keep locally started turns the server has not echoed yet.
        let local: Vec<Turn> = self
            .turns
            .drain(..)
            .filter(|t| t.state == TurnState::Pending)
            .collect();
        self.turns = older;
        self.turns.extend(local);

        if self.state == HeadlessState::Active
            && self.turns.iter().any(|t| t.state == TurnState::Running)
        {
            self.set_state(HeadlessState::Running, updates);
        }
        updates.push(HeadlessUpdate::TurnsChanged);
    }

    fn on_stream_event(&mut self, stream: StreamEvent, updates: &mut Vec<HeadlessUpdate>) {
        let Some(turn) = self.find_turn_mut(stream.turn_id.as_deref()) else {
            log::debug!("[Headless] Stream event for unknown turn {:?}", stream.turn_id);
            return;
        };
        if turn.state == TurnState::Pending {
            turn.state = TurnState::Running;
        }
        turn.events.push(stream.event.clone());
        updates.push(HeadlessUpdate::TurnEvent {
            turn_id: turn.id.clone(),
            event: stream.event,
        });
    }

    fn on_turn_started(&mut self, started: TurnStarted, updates: &mut Vec<HeadlessUpdate>) {
        let next_index = self.next_index();
        if let Some(turn) = self.turns.iter_mut().rev().find(|t| t.state == TurnState::Pending) {
            log::debug!("[Headless] Turn {} is now {}", turn.id, started.turn_id);
            turn.id = started.turn_id;
            turn.state = TurnState::Running;
            if let Some(index) = started.index {
                turn.index = index;
            }
        } else {
            // Started by another client.
            let mut turn = Turn::local(started.index.unwrap_or(next_index), String::new());
            turn.id = started.turn_id;
            turn.state = TurnState::Running;
            self.turns.push(turn);
        }
        self.set_state(HeadlessState::Running, updates);
        updates.push(HeadlessUpdate::TurnsChanged);
    }

    fn on_turn_complete(&mut self, done: TurnComplete, updates: &mut Vec<HeadlessUpdate>) {
        if let Some(turn) = self.find_turn_mut(done.turn_id.as_deref()) {
            turn.metrics = done.metrics;
            turn.finish(TurnState::Completed);
            log::info!(
                "[Headless] Turn {} complete ({} in / {} out tokens, {}ms)",
                turn.id,
                turn.metrics.input_tokens,
                turn.metrics.output_tokens,
                turn.metrics.duration_ms
            );
            updates.push(HeadlessUpdate::TurnFinished {
                turn_id: turn.id.clone(),
                state: TurnState::Completed,
            });
        }
        if self.state == HeadlessState::Running {
            self.set_state(HeadlessState::Active, updates);
        }
        self.flush_pending(updates);
    }

    fn on_error(&mut self, error: ErrorPayload, updates: &mut Vec<HeadlessUpdate>) {
        log::warn!(
            "[Headless] Server error {:?}: {}",
            error.code,
            error.message
        );

        if self.state == HeadlessState::Running || error.turn_id.is_some() {
            if let Some(turn) = self.find_turn_mut(error.turn_id.as_deref()) {
                turn.error = Some(error.message);
                turn.finish(TurnState::Error);
                updates.push(HeadlessUpdate::TurnFinished {
                    turn_id: turn.id.clone(),
                    state: TurnState::Error,
                });
                if self.state == HeadlessState::Running {
                    self.set_state(HeadlessState::Active, updates);
                }
                self.flush_pending(updates);
                return;
            }
        }

        // Whatever the error answered, a history page is no longer coming.
        self.loading_more = false;

        if matches!(self.state, HeadlessState::Starting | HeadlessState::Idle) {
            // The start or attach was refused; drop the prompt waiting on it.
            self.pending = None;
            self.set_state(HeadlessState::Idle, updates);
        } else if self.state == HeadlessState::Running {
            self.set_state(HeadlessState::Active, updates);
        }
        updates.push(HeadlessUpdate::Error {
            code: error.code,
            message: error.message,
        });
    }

    /// Turn by id, or the newest open turn when no id is given.
    fn find_turn_mut(&mut self, turn_id: Option<&str>) -> Option<&mut Turn> {
        match turn_id {
            Some(id) => self.turns.iter_mut().rev().find(|t| t.id == id),
            None => self.turns.iter_mut().rev().find(|t| t.state.is_open()),
        }
    }

    fn next_index(&self) -> u32 {
        self.turns.iter().map(|t| t.index + 1).max().unwrap_or(0)
    }

    fn flush_pending(&mut self, updates: &mut Vec<HeadlessUpdate>) {
        if self.state != HeadlessState::Active
            || self.session_id.is_none()
            || !self.link.is_connected()
        {
            return;
        }
        let Some(pending) = self.pending.take() else {
            return;
        };

        log::debug!("[Headless] Sending prompt ({} chars)", pending.prompt.len());
        let turn = Turn::local(self.next_index(), pending.prompt.clone());
        self.turns.push(turn);
        self.link.send_text(
            HeadlessCommand::HeadlessPrompt {
                prompt: pending.prompt,
                source: pending.source,
                model: pending.model,
            }
            .encode(),
        );
        self.set_state(HeadlessState::Running, updates);
        updates.push(HeadlessUpdate::TurnsChanged);
    }

    fn send_start(&self) {
        self.link.send_text(
            HeadlessCommand::HeadlessStart {
                work_dir: self.work_dir.clone(),
            }
            .encode(),
        );
    }

    fn set_state(&mut self, next: HeadlessState, updates: &mut Vec<HeadlessUpdate>) {
        if self.state != next {
            log::debug!("[Headless] {:?} -> {:?}", self.state, next);
            self.state = next;
            updates.push(HeadlessUpdate::State(next));
        }
    }
}

/// Which channel currently serves each conversation.
#[derive(Debug, Default)]
pub struct ConversationBindings {
    bindings: HashMap<String, String>,
}

impl ConversationBindings {
    /// Empty bindings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a conversation to a channel, returning the channel it replaced.
    pub fn bind(&mut self, conversation_id: &str, channel_id: &str) -> Option<String> {
        let previous = self
            .bindings
            .insert(conversation_id.to_string(), channel_id.to_string());
        if let Some(previous) = previous.as_deref().filter(|p| *p != channel_id) {
            log::debug!(
                "[Headless] Conversation {} moved from channel {} to {}",
                conversation_id,
                previous,
                channel_id
            );
        }
        previous
    }

    /// Channel serving a conversation.
    pub fn channel_for(&self, conversation_id: &str) -> Option<&str> {
        self.bindings.get(conversation_id).map(String::as_str)
    }

    /// Drop a conversation's binding.
    pub fn unbind(&mut self, conversation_id: &str) -> Option<String> {
        self.bindings.remove(conversation_id)
    }

    /// Drop every binding served by a channel, e.g. after it was torn down.
    pub fn release_channel(&mut self, channel_id: &str) -> Vec<String> {
        let released: Vec<String> = self
            .bindings
            .iter()
            .filter(|(_, channel)| channel.as_str() == channel_id)
            .map(|(conversation, _)| conversation.clone())
            .collect();
        for conversation in &released {
            self.bindings.remove(conversation);
        }
        released
    }

    /// Number of bound conversations.
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    /// Whether nothing is bound.
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}
