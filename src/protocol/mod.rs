//! Message codec for the session channel.
//!
//! Every frame exchanged over a channel is a JSON object with a `type` tag.
//! Terminal endpoints use flat envelopes (`{"type":"output","data":"..."}`),
//! headless endpoints answer with `{"type": ..., "payload": {...}}`.
//!
//! # Modules
//!
//! - [`terminal`] - PTY session envelopes
//! - [`headless`] - agent conversation envelopes
//!
//! # Decoding guarantees
//!
//! Decoding never fails. A frame that does not parse as a structured
//! envelope is wrapped as raw output so legacy or unstructured server output
//! is never lost, and a well-formed envelope with an unrecognized `type`
//! decodes to an `Unknown` variant which the consumer drops.

pub mod headless;
pub mod terminal;

pub use headless::{HeadlessCommand, HeadlessEnvelope};
pub use terminal::{TerminalCommand, TerminalEnvelope};

/// A raw frame as delivered by the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    /// UTF-8 text frame.
    Text(String),
    /// Binary frame.
    Binary(Vec<u8>),
}

impl WireFrame {
    /// Frame contents as text. Binary frames are decoded lossily.
    pub fn as_text(&self) -> std::borrow::Cow<'_, str> {
        match self {
            Self::Text(text) => std::borrow::Cow::Borrowed(text.as_str()),
            Self::Binary(data) => String::from_utf8_lossy(data),
        }
    }
}

/// Encode an application-level keepalive ping.
///
/// Both endpoint families accept the same `{"type":"ping"}` frame.
pub fn encode_ping() -> String {
    r#"{"type":"ping"}"#.to_string()
}

/// Serialize an outbound command.
///
/// Commands are plain data structs, so serialization cannot fail in practice;
/// a failure is logged and yields an empty frame that the server ignores.
fn encode_json<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|e| {
        log::error!("[Codec] Failed to encode command: {}", e);
        String::new()
    })
}

/// Truncate a frame for log output.
fn preview(text: &str) -> &str {
    let mut end = text.len().min(120);
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_frame() {
        let value: serde_json::Value = serde_json::from_str(&encode_ping()).unwrap();
        assert_eq!(value["type"], "ping");
    }

    #[test]
    fn test_binary_frame_as_text_is_lossy() {
        let frame = WireFrame::Binary(vec![b'h', b'i', 0xff]);
        assert_eq!(frame.as_text(), "hi\u{fffd}");
    }

    #[test]
    fn test_preview_respects_char_boundaries() {
        let text = "é".repeat(100);
        let cut = preview(&text);
        assert!(cut.len() <= 120);
        assert!(text.starts_with(cut));
    }
}
