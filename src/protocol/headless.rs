//! Envelopes for headless (agent conversation) endpoints.
//!
//! Outbound commands are flat `{"type": ...}` objects. Inbound messages carry
//! their data under `payload`:
//!
//! ```text
//! {"type":"session_info","payload":{"session_id":"s-1","conversation_id":"c-9"}}
//! {"type":"stream_event","payload":{"turn_id":"t-3","event":{...}}}
//! {"type":"turn_complete","payload":{"turn_id":"t-3","output_tokens":812}}
//! ```
//!
//! Inbound decoding is two-step: the `type` tag is read into [`HeadlessKind`]
//! alongside the raw payload, then the payload is parsed for that variant.
//! Unknown tags map to [`HeadlessEnvelope::Unknown`]; anything that is not an
//! envelope at all becomes [`HeadlessEnvelope::RawOutput`].

use serde::{Deserialize, Serialize};

use super::{encode_json, preview, WireFrame};

/// Which surface a container session is presented through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    /// Interactive PTY tabs.
    Terminal,
    /// Turn-based agent conversation.
    Headless,
}

impl std::fmt::Display for SessionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Terminal => write!(f, "terminal"),
            Self::Headless => write!(f, "headless"),
        }
    }
}

/// Outbound headless command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HeadlessCommand {
    /// Start an agent session.
    HeadlessStart {
        /// Working directory inside the container.
        #[serde(skip_serializing_if = "Option::is_none")]
        work_dir: Option<String>,
    },
    /// Submit a prompt.
    HeadlessPrompt {
        /// Prompt text.
        prompt: String,
        /// Where the prompt came from (e.g. `user`).
        source: String,
        /// Model override.
        #[serde(skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },
    /// Cancel the running turn.
    HeadlessCancel,
    /// Request older turns.
    LoadMore {
        /// Oldest turn currently held by the client.
        before_turn_id: String,
        /// Page size.
        limit: u32,
    },
    /// Switch the container between terminal and headless presentation.
    ModeSwitch {
        /// Requested mode.
        mode: SessionMode,
    },
    /// Keepalive.
    Ping,
}

impl HeadlessCommand {
    /// Serialize to a text frame.
    pub fn encode(&self) -> String {
        encode_json(self)
    }
}

/// Token and timing metrics reported for a finished turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnMetrics {
    /// Prompt tokens.
    #[serde(default)]
    pub input_tokens: u64,
    /// Completion tokens.
    #[serde(default)]
    pub output_tokens: u64,
    /// Cost in US dollars.
    #[serde(default)]
    pub cost_usd: f64,
    /// Wall-clock duration.
    #[serde(default)]
    pub duration_ms: u64,
}

/// `session_info` payload.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SessionInfo {
    /// Live agent session, absent when attached to an idle conversation.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Conversation served by this channel.
    #[serde(default)]
    pub conversation_id: Option<String>,
    /// Server-side session status string.
    #[serde(default)]
    pub status: Option<String>,
}

/// A turn as stored server-side.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TurnRecord {
    /// Turn identifier.
    pub id: String,
    /// Position in the conversation.
    #[serde(default)]
    pub index: u32,
    /// Prompt text.
    #[serde(default)]
    pub prompt: String,
    /// Recorded stream events.
    #[serde(default)]
    pub events: Vec<serde_json::Value>,
    /// `completed`, `error`, `running`...
    #[serde(default)]
    pub status: Option<String>,
    /// Final metrics.
    #[serde(default)]
    pub metrics: TurnMetrics,
    /// Failure message for errored turns.
    #[serde(default)]
    pub error: Option<String>,
}

/// `history` payload: one page of turns, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct HistoryPage {
    /// Turns in ascending index order.
    #[serde(default)]
    pub turns: Vec<TurnRecord>,
    /// Whether older turns exist.
    #[serde(default)]
    pub has_more: bool,
}

/// `stream_event` payload.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct StreamEvent {
    /// Turn the event belongs to.
    #[serde(default)]
    pub turn_id: Option<String>,
    /// Agent event (text delta, tool call, ...), kept opaque.
    #[serde(default)]
    pub event: serde_json::Value,
}

/// `turn_started` payload.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TurnStarted {
    /// Server-assigned turn identifier.
    pub turn_id: String,
    /// Server-assigned position.
    #[serde(default)]
    pub index: Option<u32>,
}

/// `turn_complete` payload.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TurnComplete {
    /// Finished turn.
    #[serde(default)]
    pub turn_id: Option<String>,
    /// Final metrics, flattened into the payload.
    #[serde(flatten)]
    pub metrics: TurnMetrics,
}

/// `error` payload.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ErrorPayload {
    /// Machine-readable code.
    #[serde(default)]
    pub code: Option<String>,
    /// Human-readable message.
    #[serde(default)]
    pub message: String,
    /// Turn the failure belongs to, if any.
    #[serde(default)]
    pub turn_id: Option<String>,
}

/// `mode_switched` payload.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ModeSwitched {
    /// Mode now in effect.
    pub mode: SessionMode,
    /// Interactive sessions the server closed as a side effect.
    #[serde(default)]
    pub closed_sessions: u32,
}

/// Inbound headless envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum HeadlessEnvelope {
    /// Session started or attached.
    SessionInfo(SessionInfo),
    /// A page of turn history.
    History(HistoryPage),
    /// Streamed agent event.
    StreamEvent(StreamEvent),
    /// Server accepted a prompt and opened a turn.
    TurnStarted(TurnStarted),
    /// Turn finished successfully.
    TurnComplete(TurnComplete),
    /// Server-reported failure.
    Error(ErrorPayload),
    /// Mode switch acknowledged.
    ModeSwitched(ModeSwitched),
    /// Keepalive answer.
    Pong,
    /// Unstructured frame, passed through verbatim.
    RawOutput(String),
    /// Recognized envelope shape with a type this client does not know.
    Unknown,
}

/// Inbound `type` tag.
///
/// A unit `other` variant cannot absorb an object payload, so the tag is
/// typed on its own and the payload is parsed per variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeadlessKind {
    /// `session_info`
    SessionInfo,
    /// `history`
    History,
    /// `stream_event`
    StreamEvent,
    /// `turn_started`
    TurnStarted,
    /// `turn_complete`
    TurnComplete,
    /// `error`
    Error,
    /// `mode_switched`
    ModeSwitched,
    /// `pong`
    Pong,
    /// Any tag this client does not know.
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: HeadlessKind,
    #[serde(default)]
    payload: serde_json::Value,
}

impl HeadlessEnvelope {
    /// Decode a socket frame. Never fails.
    pub fn decode(frame: &WireFrame) -> Self {
        let text = frame.as_text();
        let raw = match serde_json::from_str::<RawEnvelope>(&text) {
            Ok(raw) => raw,
            Err(e) => {
                log::debug!(
                    "[Codec] Unstructured headless frame ({}), passing through: {}",
                    e,
                    preview(&text)
                );
                return Self::RawOutput(text.into_owned());
            }
        };

        let payload = if raw.payload.is_null() {
            serde_json::Value::Object(serde_json::Map::new())
        } else {
            raw.payload
        };

        let parsed = match raw.kind {
            HeadlessKind::SessionInfo => serde_json::from_value(payload).map(Self::SessionInfo),
            HeadlessKind::History => serde_json::from_value(payload).map(Self::History),
            HeadlessKind::StreamEvent => serde_json::from_value(payload).map(Self::StreamEvent),
            HeadlessKind::TurnStarted => serde_json::from_value(payload).map(Self::TurnStarted),
            HeadlessKind::TurnComplete => serde_json::from_value(payload).map(Self::TurnComplete),
            HeadlessKind::Error => serde_json::from_value(payload).map(Self::Error),
            HeadlessKind::ModeSwitched => serde_json::from_value(payload).map(Self::ModeSwitched),
            HeadlessKind::Pong => Ok(Self::Pong),
            HeadlessKind::Unknown => {
                log::trace!("[Codec] Dropping unknown headless type");
                Ok(Self::Unknown)
            }
        };

        parsed.unwrap_or_else(|e| {
            log::debug!(
                "[Codec] Malformed {:?} payload ({}), passing through",
                raw.kind,
                e
            );
            Self::RawOutput(text.into_owned())
        })
    }
}
