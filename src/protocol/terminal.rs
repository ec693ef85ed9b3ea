//! Envelopes for terminal (PTY) endpoints.
//!
//! # Wire format
//!
//! ```text
//! client → server   {"type":"input","data":"ls\r"}
//!                   {"type":"resize","cols":120,"rows":40}
//!                   {"type":"close","session_id":"abc123"}
//! server → client   {"type":"session","session_id":"abc123"}
//!                   {"type":"history_start","total_size":1024,"total_chunks":4}
//!                   {"type":"history","data":"...","chunk_index":0}
//!                   {"type":"history_end"}
//!                   {"type":"output","data":"..."}
//! ```

use serde::{Deserialize, Serialize};

use super::{encode_json, preview, WireFrame};

/// Outbound terminal command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TerminalCommand {
    /// Keystrokes for the remote shell.
    Input {
        /// Raw input bytes as text.
        data: String,
    },
    /// Terminal geometry change.
    Resize {
        /// Columns.
        cols: u16,
        /// Rows.
        rows: u16,
    },
    /// Terminate the remote session.
    Close {
        /// Session being closed.
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    /// Ask the server to start a shell.
    Start {
        /// Working directory for the shell.
        #[serde(skip_serializing_if = "Option::is_none")]
        work_dir: Option<String>,
    },
    /// Keepalive.
    Ping,
}

impl TerminalCommand {
    /// Serialize to a text frame.
    pub fn encode(&self) -> String {
        encode_json(self)
    }
}

/// Inbound terminal envelope.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TerminalEnvelope {
    /// Live shell output.
    Output {
        /// Output text.
        #[serde(default)]
        data: String,
    },
    /// One chunk of replayed scrollback.
    History {
        /// Chunk contents.
        #[serde(default)]
        data: String,
        /// Zero-based chunk position, informational only.
        #[serde(default)]
        chunk_index: Option<u32>,
        /// Total chunk count, informational only.
        #[serde(default)]
        total_chunks: Option<u32>,
    },
    /// Scrollback replay begins.
    HistoryStart {
        /// Total replay size in bytes.
        #[serde(default)]
        total_size: u64,
        /// Number of `history` chunks that follow.
        #[serde(default)]
        total_chunks: u32,
    },
    /// Scrollback replay finished.
    HistoryEnd,
    /// Server assigned (or confirmed) the session for this channel.
    Session {
        /// Session identifier.
        session_id: String,
    },
    /// Server-side error report.
    Error {
        /// Error description.
        #[serde(default)]
        error: String,
    },
    /// Remote session was closed.
    Close {
        /// Session that closed.
        #[serde(default)]
        session_id: Option<String>,
    },
    /// Monitoring status update.
    MonitoringStatus {
        /// Opaque monitoring payload.
        #[serde(default)]
        monitoring: serde_json::Value,
    },
    /// Task progress update.
    TaskUpdate {
        /// Opaque task payload.
        #[serde(default)]
        task: serde_json::Value,
    },
    /// A server-side strategy fired.
    StrategyTriggered {
        /// Opaque strategy payload.
        #[serde(default)]
        strategy: serde_json::Value,
    },
    /// Echoed input (recognized, ignored by clients).
    Input {
        /// Input text.
        #[serde(default)]
        data: String,
    },
    /// Echoed resize (recognized, ignored by clients).
    Resize {
        /// Columns.
        #[serde(default)]
        cols: u16,
        /// Rows.
        #[serde(default)]
        rows: u16,
    },
    /// Server ping.
    Ping,
    /// Keepalive answer.
    Pong,
    /// Shell start acknowledgement.
    Start,
    /// Any type this client does not know.
    #[serde(other)]
    Unknown,
}

impl TerminalEnvelope {
    /// Decode a socket frame.
    ///
    /// Never fails: anything that is not a structured envelope becomes
    /// [`TerminalEnvelope::Output`] carrying the raw frame text.
    pub fn decode(frame: &WireFrame) -> Self {
        let text = frame.as_text();
        match serde_json::from_str::<Self>(&text) {
            Ok(envelope) => envelope,
            Err(e) => {
                log::debug!(
                    "[Codec] Unstructured terminal frame ({}), passing through: {}",
                    e,
                    preview(&text)
                );
                Self::Output {
                    data: text.into_owned(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(text: &str) -> TerminalEnvelope {
        TerminalEnvelope::decode(&WireFrame::Text(text.to_string()))
    }

    #[test]
    fn test_encode_input() {
        let json = TerminalCommand::Input {
            data: "ls\r".to_string(),
        }
        .encode();
        assert_eq!(json, r#"{"type":"input","data":"ls\r"}"#);
    }

    #[test]
    fn test_encode_resize() {
        let json = TerminalCommand::Resize { cols: 120, rows: 40 }.encode();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "resize");
        assert_eq!(value["cols"], 120);
        assert_eq!(value["rows"], 40);
    }

    #[test]
    fn test_encode_close_with_and_without_session() {
        let with = TerminalCommand::Close {
            session_id: Some("abc123".to_string()),
        }
        .encode();
        assert_eq!(with, r#"{"type":"close","session_id":"abc123"}"#);

        let without = TerminalCommand::Close { session_id: None }.encode();
        assert_eq!(without, r#"{"type":"close"}"#);
    }

    #[test]
    fn test_encode_start_omits_missing_work_dir() {
        assert_eq!(
            TerminalCommand::Start { work_dir: None }.encode(),
            r#"{"type":"start"}"#
        );
    }

    #[test]
    fn test_decode_session() {
        assert_eq!(
            decode(r#"{"type":"session","session_id":"abc123"}"#),
            TerminalEnvelope::Session {
                session_id: "abc123".to_string()
            }
        );
    }

    #[test]
    fn test_decode_history_markers() {
        assert_eq!(
            decode(r#"{"type":"history_start","total_size":1024,"total_chunks":4}"#),
            TerminalEnvelope::HistoryStart {
                total_size: 1024,
                total_chunks: 4
            }
        );
        assert_eq!(decode(r#"{"type":"history_end"}"#), TerminalEnvelope::HistoryEnd);
    }

    #[test]
    fn test_decode_history_chunk() {
        match decode(r#"{"type":"history","data":"$ ls\r\n","chunk_index":2,"total_chunks":4}"#) {
            TerminalEnvelope::History {
                data, chunk_index, ..
            } => {
                assert_eq!(data, "$ ls\r\n");
                assert_eq!(chunk_index, Some(2));
            }
            other => panic!("unexpected envelope: {other:?}"),
        }
    }

    #[test]
    fn test_decode_unit_marker_with_extra_fields() {
        assert_eq!(
            decode(r#"{"type":"history_end","total_size":10}"#),
            TerminalEnvelope::HistoryEnd
        );
    }

    #[test]
    fn test_decode_unknown_type_is_dropped_not_output() {
        assert_eq!(
            decode(r#"{"type":"telemetry","data":"x"}"#),
            TerminalEnvelope::Unknown
        );
    }

    #[test]
    fn test_decode_plain_text_becomes_output() {
        assert_eq!(
            decode("plain shell bytes\r\n"),
            TerminalEnvelope::Output {
                data: "plain shell bytes\r\n".to_string()
            }
        );
    }

    #[test]
    fn test_decode_malformed_envelope_becomes_output() {
        let raw = r#"{"type":"session"}"#;
        assert_eq!(
            decode(raw),
            TerminalEnvelope::Output {
                data: raw.to_string()
            }
        );
    }

    #[test]
    fn test_decode_binary_frame() {
        let frame = WireFrame::Binary(b"\x1b[32mok\x1b[0m".to_vec());
        assert_eq!(
            TerminalEnvelope::decode(&frame),
            TerminalEnvelope::Output {
                data: "\x1b[32mok\x1b[0m".to_string()
            }
        );
    }

    #[test]
    fn test_decode_monitoring_payload() {
        match decode(r#"{"type":"monitoring_status","monitoring":{"cpu":0.5}}"#) {
            TerminalEnvelope::MonitoringStatus { monitoring } => {
                assert_eq!(monitoring["cpu"], 0.5);
            }
            other => panic!("unexpected envelope: {other:?}"),
        }
    }
}
