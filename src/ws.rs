//! WebSocket transport.
//!
//! Thin wrapper around `tokio-tungstenite` giving the channel driver
//! separate reader and writer halves. Inbound messages are reduced to what
//! the session protocol cares about: data frames, control pings, and the
//! close that ends the socket.

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite;

use crate::protocol::WireFrame;

/// Concrete WebSocket stream type.
type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Something read from the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Text or binary data frame.
    Frame(WireFrame),
    /// Transport-level ping that must be answered with a pong.
    Ping(Vec<u8>),
    /// Transport-level pong.
    Pong,
    /// Peer closed the socket.
    Closed {
        /// WebSocket close code (1000 = normal, 1005 = no code).
        code: u16,
        /// Human-readable close reason.
        reason: String,
    },
}

/// Write half of a WebSocket connection.
#[derive(Debug)]
pub struct WsWriter {
    sink: futures_util::stream::SplitSink<WsStream, tungstenite::Message>,
}

impl WsWriter {
    /// Send a UTF-8 text frame.
    pub async fn send_text(&mut self, text: &str) -> Result<()> {
        self.sink
            .send(tungstenite::Message::Text(text.to_string()))
            .await
            .context("WebSocket send_text failed")
    }

    /// Answer a transport ping.
    pub async fn send_pong(&mut self, data: Vec<u8>) -> Result<()> {
        self.sink
            .send(tungstenite::Message::Pong(data))
            .await
            .context("WebSocket send_pong failed")
    }

    /// Send a close frame and shut the sink.
    pub async fn close(&mut self) -> Result<()> {
        // The peer may already be gone; the close frame is best effort.
        let _ = self.sink.send(tungstenite::Message::Close(None)).await;
        self.sink.close().await.context("WebSocket close failed")
    }
}

/// Read half of a WebSocket connection.
#[derive(Debug)]
pub struct WsReader {
    stream: futures_util::stream::SplitStream<WsStream>,
}

impl WsReader {
    /// Receive the next message, returning `None` when the stream ends.
    pub async fn recv(&mut self) -> Option<Result<Inbound>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(anyhow::anyhow!("WebSocket read error: {e}"))),
            };
            let inbound = match message {
                tungstenite::Message::Text(text) => Inbound::Frame(WireFrame::Text(text.to_string())),
                tungstenite::Message::Binary(data) => Inbound::Frame(WireFrame::Binary(data.to_vec())),
                tungstenite::Message::Ping(data) => Inbound::Ping(data.to_vec()),
                tungstenite::Message::Pong(_) => Inbound::Pong,
                tungstenite::Message::Close(frame) => {
                    let (code, reason) = frame
                        .map(|cf| (cf.code.into(), cf.reason.to_string()))
                        .unwrap_or((1005, String::new()));
                    Inbound::Closed { code, reason }
                }
                tungstenite::Message::Frame(_) => continue,
            };
            return Some(Ok(inbound));
        }
    }
}

/// Open a WebSocket.
///
/// Authentication travels in the URL query, so no extra headers are set.
pub async fn connect(url: &str) -> Result<(WsWriter, WsReader)> {
    let (ws_stream, _response) = tokio_tungstenite::connect_async(url)
        .await
        .with_context(|| format!("WebSocket connect failed: {}", redact(url)))?;

    let (sink, stream) = ws_stream.split();
    Ok((WsWriter { sink }, WsReader { stream }))
}

/// Convert an HTTP(S) URL to WS(S) scheme.
///
/// Passes `ws://` and `wss://` through unchanged.
#[must_use]
pub fn http_to_ws_scheme(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        url.to_string()
    }
}

/// Strip the query string so tokens never reach the logs.
pub fn redact(url: &str) -> &str {
    url.split_once('?').map_or(url, |(base, _)| base)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_to_ws_scheme() {
        assert_eq!(http_to_ws_scheme("https://example.com"), "wss://example.com");
        assert_eq!(http_to_ws_scheme("http://localhost:3000"), "ws://localhost:3000");
        assert_eq!(http_to_ws_scheme("wss://example.com/x"), "wss://example.com/x");
    }

    #[test]
    fn test_scheme_only_rewritten_at_start() {
        assert_eq!(
            http_to_ws_scheme("https://example.com/?next=http://other"),
            "wss://example.com/?next=http://other"
        );
    }

    #[test]
    fn test_redact_drops_query() {
        assert_eq!(
            redact("wss://example.com/ws/containers/c1/terminal?token=secret"),
            "wss://example.com/ws/containers/c1/terminal"
        );
        assert_eq!(redact("ws://localhost/x"), "ws://localhost/x");
    }

    #[tokio::test]
    async fn test_connect_unreachable_host_returns_error() {
        let result = connect("ws://127.0.0.1:1/ws/containers/c1/terminal").await;
        assert!(result.is_err());
    }
}
