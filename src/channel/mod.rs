//! Realtime session channels.
//!
//! A channel is one physical WebSocket serving one terminal tab or one
//! headless conversation. The lifecycle logic lives in a socket-free state
//! machine; a tokio task owns the socket and executes what the state machine
//! asks for.
//!
//! # Architecture
//!
//! ```text
//!   ChannelHandle (ChannelLink)          ChannelEvent { channel_id, kind }
//!         │  send_text / disconnect             ▲
//!         ▼                                     │
//!   socket task ──► ConnectionManager ──► Effect::{Open, Transmit, Close,
//!     (ws.rs)         (manager.rs)          StartKeepalive, ScheduleReconnect,
//!         ▲                                 CheckExistence, Emit, ...}
//!         │
//!   TargetProbe (api.rs) ── existence check before every retry
//! ```
//!
//! # Endpoints
//!
//! The mode is selected by which endpoint is dialed:
//!
//! - `/ws/containers/{id}/terminal` - PTY session
//! - `/ws/containers/{id}/headless` - create-or-attach agent session
//! - `/ws/conversations/{id}` - attach to one existing conversation

pub mod manager;
pub mod socket;

use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Url;

use crate::constants;
use crate::protocol::WireFrame;

pub use manager::{ConnectionManager, Effect, TargetStatus};
pub use socket::{spawn_channel, ChannelHandle};

/// Which endpoint family a channel dials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelMode {
    /// Interactive PTY for a container.
    Terminal,
    /// Create-or-attach agent session for a container.
    HeadlessContainer,
    /// One specific existing conversation.
    HeadlessConversation,
}

/// What a channel connects to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Endpoint family.
    pub mode: ChannelMode,
    /// Container id, or conversation id for [`ChannelMode::HeadlessConversation`].
    pub id: String,
    /// Terminal session to reattach to on (re)connect.
    pub session_id: Option<String>,
}

impl Target {
    /// Terminal endpoint for a container.
    pub fn terminal(container_id: impl Into<String>) -> Self {
        Self {
            mode: ChannelMode::Terminal,
            id: container_id.into(),
            session_id: None,
        }
    }

    /// Create-or-attach headless endpoint for a container.
    pub fn headless(container_id: impl Into<String>) -> Self {
        Self {
            mode: ChannelMode::HeadlessContainer,
            id: container_id.into(),
            session_id: None,
        }
    }

    /// Endpoint for an existing conversation.
    pub fn conversation(conversation_id: impl Into<String>) -> Self {
        Self {
            mode: ChannelMode::HeadlessConversation,
            id: conversation_id.into(),
            session_id: None,
        }
    }

    /// Attach to a known terminal session.
    #[must_use]
    pub fn with_session(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id;
        self
    }

    /// Path component of the endpoint.
    pub fn endpoint_path(&self) -> String {
        match self.mode {
            ChannelMode::Terminal => format!("/ws/containers/{}/terminal", self.id),
            ChannelMode::HeadlessContainer => format!("/ws/containers/{}/headless", self.id),
            ChannelMode::HeadlessConversation => format!("/ws/conversations/{}", self.id),
        }
    }

    /// Full WebSocket URL for this target.
    ///
    /// The bearer token is appended as `token` only when one is available;
    /// the server falls back to its own cookie auth otherwise.
    pub fn endpoint_url(&self, server_url: &str, token: Option<&str>) -> Result<String> {
        let base = crate::ws::http_to_ws_scheme(server_url);
        let mut url = Url::parse(base.trim_end_matches('/'))
            .with_context(|| format!("invalid server URL: {server_url}"))?;
        url.set_path(&self.endpoint_path());
        {
            let mut query = url.query_pairs_mut();
            if let Some(token) = token.filter(|t| !t.is_empty()) {
                query.append_pair("token", token);
            }
            if self.mode == ChannelMode::Terminal {
                if let Some(session_id) = &self.session_id {
                    query.append_pair("session_id", session_id);
                }
            }
        }
        if url.query() == Some("") {
            url.set_query(None);
        }
        Ok(url.to_string())
    }

    /// Short label for logs.
    pub fn label(&self) -> String {
        match self.mode {
            ChannelMode::Terminal => format!("terminal:{}", self.id),
            ChannelMode::HeadlessContainer => format!("headless:{}", self.id),
            ChannelMode::HeadlessConversation => format!("conversation:{}", self.id),
        }
    }
}

/// Tunables for one channel.
#[derive(Debug, Clone)]
pub struct ChannelSettings {
    /// HTTP(S) or WS(S) base URL of the server.
    pub server_url: String,
    /// Bearer token for the `token` query parameter.
    pub token: Option<String>,
    /// Keepalive ping interval.
    pub keepalive_interval: Duration,
    /// First reconnect delay.
    pub reconnect_base_delay: Duration,
    /// Reconnect attempts before giving up.
    pub max_reconnect_attempts: u32,
    /// Bound on the existence check.
    pub existence_check_timeout: Duration,
}

impl ChannelSettings {
    /// Settings with default timings for a server.
    pub fn new(server_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            server_url: server_url.into(),
            token,
            keepalive_interval: constants::KEEPALIVE_INTERVAL,
            reconnect_base_delay: constants::RECONNECT_BASE_DELAY,
            max_reconnect_attempts: constants::MAX_RECONNECT_ATTEMPTS,
            existence_check_timeout: constants::EXISTENCE_CHECK_TIMEOUT,
        }
    }

    /// Delay before reconnect attempt `attempt` (1-indexed).
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.reconnect_base_delay.saturating_mul(1u32 << exponent)
    }
}

/// Connection state of a channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket.
    #[default]
    Disconnected,
    /// Socket opening for the first time.
    Connecting,
    /// Socket open.
    Connected,
    /// Socket lost; existence check or retry pending.
    Reconnecting,
    /// Intentional teardown in progress.
    Closing,
}

/// What a connection indicator should show.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Indicator {
    /// First connect in flight.
    Connecting,
    /// Live.
    Connected,
    /// Down; a retry may still be pending.
    Disconnected,
    /// Down for good; no reconnect affordance.
    Disabled,
}

impl Indicator {
    /// Map a state and the last channel error to an indicator.
    pub fn from_state(state: ConnectionState, last_error: Option<&ChannelError>) -> Self {
        if last_error.is_some_and(ChannelError::is_fatal) {
            return Self::Disabled;
        }
        match state {
            ConnectionState::Connecting => Self::Connecting,
            ConnectionState::Connected => Self::Connected,
            ConnectionState::Reconnecting
            | ConnectionState::Closing
            | ConnectionState::Disconnected => Self::Disconnected,
        }
    }
}

/// Errors surfaced by a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// Socket open, close or error.
    Transport(String),
    /// The container or conversation no longer exists.
    TargetGone(String),
    /// Retry ceiling reached while the target still appeared to exist.
    ExhaustedRetries {
        /// Attempts made.
        attempts: u32,
    },
}

impl ChannelError {
    /// Whether reconnection has been abandoned.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::TargetGone(_) | Self::ExhaustedRetries { .. })
    }
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(msg) => write!(f, "Connection error: {msg}"),
            Self::TargetGone(target) => write!(f, "{target} no longer exists"),
            Self::ExhaustedRetries { attempts } => {
                write!(f, "Connection lost after {attempts} reconnect attempts")
            }
        }
    }
}

impl std::error::Error for ChannelError {}

/// Event delivered by a channel task.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelEvent {
    /// Channel that produced this event.
    pub channel_id: String,
    /// The event payload.
    pub kind: ChannelEventKind,
}

/// Discriminant for [`ChannelEvent`].
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEventKind {
    /// State transition.
    State(ConnectionState),
    /// Inbound frame, in arrival order.
    Frame(WireFrame),
    /// Error for the consuming surface.
    Failed(ChannelError),
}

/// The seam between session adapters and a channel.
///
/// Implemented by [`ChannelHandle`]; tests substitute a recording fake.
pub trait ChannelLink {
    /// Whether the socket is currently open.
    fn is_connected(&self) -> bool;

    /// Send a text frame. A silent no-op unless connected.
    fn send_text(&self, frame: String);

    /// Remember the terminal session to reattach to on reconnect.
    fn bind_session(&self, session_id: &str);

    /// Tear the channel down without reconnecting.
    fn disconnect(&self);
}

/// Connection state observable from outside the channel task.
#[derive(Debug, Default)]
pub struct SharedConnectionState {
    state: RwLock<ConnectionState>,
    last_error: RwLock<Option<ChannelError>>,
}

impl SharedConnectionState {
    /// Create new shared state.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Get the current state.
    pub fn get(&self) -> ConnectionState {
        self.state.read().map_or(ConnectionState::Disconnected, |s| *s)
    }

    /// Set the state.
    pub fn set(&self, new_state: ConnectionState) {
        if let Ok(mut state) = self.state.write() {
            *state = new_state;
        }
    }

    /// Record the last error.
    pub fn set_error(&self, error: Option<ChannelError>) {
        if let Ok(mut last) = self.last_error.write() {
            *last = error;
        }
    }

    /// Last error, if any.
    pub fn last_error(&self) -> Option<ChannelError> {
        self.last_error.read().ok().and_then(|e| e.clone())
    }

    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        self.get() == ConnectionState::Connected
    }

    /// Indicator for the current state.
    pub fn indicator(&self) -> Indicator {
        Indicator::from_state(self.get(), self.last_error().as_ref())
    }
}
