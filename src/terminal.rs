//! Terminal session adapter.
//!
//! Binds one tab's byte I/O to its channel. Keystrokes and geometry go out
//! as `input` / `resize` envelopes; output and replayed scrollback come back
//! into a [`TerminalSink`].
//!
//! There is no handshake on a fresh connect: the server pushes a `session`
//! envelope, which the adapter records, binds to the channel for future
//! reattachment and reports to its owner so the registry can be rewritten.
//!
//! Closing a tab comes in two flavours and the difference matters:
//! [`TerminalAdapter::close`] kills the remote shell with a `close`
//! envelope, [`TerminalAdapter::detach`] only drops the socket so the shell
//! stays alive for a later reattach.

use crate::channel::{ChannelLink, ConnectionState};
use crate::history::{HistoryAssembler, HistoryProgress, HistoryStep};
use crate::protocol::{TerminalCommand, TerminalEnvelope, WireFrame};

/// Rendering surface for one tab.
pub trait TerminalSink {
    /// Append output.
    fn write(&mut self, data: &str);

    /// Clear the surface before a scrollback replay.
    fn clear(&mut self);

    /// Replay progress changed.
    fn history_progress(&mut self, progress: &HistoryProgress);
}

/// Lifecycle of the remote terminal session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SessionState {
    /// No session known and none requested yet.
    #[default]
    None,
    /// Waiting for the server to assign or confirm a session.
    Requested,
    /// Session assigned.
    Active,
    /// Session ended, locally or by the server.
    Closed,
}

/// Something the adapter's owner needs to act on.
#[derive(Debug, Clone, PartialEq)]
pub enum TerminalEvent {
    /// The server assigned (or confirmed) a session id.
    SessionAssigned(String),
    /// The server closed the session.
    SessionClosed(Option<String>),
    /// Server-reported error.
    Error(String),
    /// Monitoring status changed.
    Monitoring(serde_json::Value),
    /// Task progress update.
    TaskUpdate(serde_json::Value),
    /// A server-side strategy fired.
    StrategyTriggered(serde_json::Value),
}

/// One tab's terminal session on top of a [`ChannelLink`].
#[derive(Debug)]
pub struct TerminalAdapter<L> {
    link: L,
    session_id: Option<String>,
    session_state: SessionState,
    geometry: Option<(u16, u16)>,
    sent_geometry: Option<(u16, u16)>,
    history: HistoryAssembler,
    close_sent: bool,
}

impl<L: ChannelLink> TerminalAdapter<L> {
    /// Adapter for a fresh tab, or for a restored tab when `session_id` is set.
    pub fn new(link: L, session_id: Option<String>) -> Self {
        let session_state = if session_id.is_some() {
            SessionState::Requested
        } else {
            SessionState::None
        };
        Self {
            link,
            session_id,
            session_state,
            geometry: None,
            sent_geometry: None,
            history: HistoryAssembler::new(),
            close_sent: false,
        }
    }

    /// The channel link.
    pub fn link(&self) -> &L {
        &self.link
    }

    /// Current remote session id.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Session lifecycle state.
    pub fn session_state(&self) -> SessionState {
        self.session_state
    }

    /// Whether the channel is open.
    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    /// Scrollback replay progress.
    pub fn history_progress(&self) -> HistoryProgress {
        self.history.progress()
    }

    /// Forward keystrokes. Dropped silently while not connected.
    pub fn send_input(&mut self, data: &str) {
        if data.is_empty() || !self.link.is_connected() {
            return;
        }
        self.link.send_text(
            TerminalCommand::Input {
                data: data.to_string(),
            }
            .encode(),
        );
    }

    /// Report the tab's geometry. Unchanged geometry is not resent.
    pub fn resize(&mut self, cols: u16, rows: u16) {
        if cols == 0 || rows == 0 {
            return;
        }
        self.geometry = Some((cols, rows));
        self.flush_geometry();
    }

    /// The channel changed state.
    pub fn on_connection(&mut self, state: ConnectionState) {
        match state {
            ConnectionState::Connected => {
                if self.session_state == SessionState::None {
                    self.session_state = SessionState::Requested;
                }
                // A new socket means a new PTY attachment; push geometry again.
                self.sent_geometry = None;
                self.flush_geometry();
            }
            ConnectionState::Reconnecting | ConnectionState::Disconnected => {
                if self.history.is_loading() {
                    self.history.abandon();
                }
            }
            ConnectionState::Connecting | ConnectionState::Closing => {}
        }
    }

    /// Handle one inbound frame.
    pub fn handle_frame(
        &mut self,
        frame: &WireFrame,
        sink: &mut dyn TerminalSink,
    ) -> Option<TerminalEvent> {
        match TerminalEnvelope::decode(frame) {
            TerminalEnvelope::Output { data } => {
                sink.write(&data);
                None
            }
            TerminalEnvelope::HistoryStart {
                total_size,
                total_chunks,
            } => {
                render(self.history.start(total_size, total_chunks), sink);
                None
            }
            TerminalEnvelope::History { data, .. } => {
                render(self.history.chunk(data), sink);
                None
            }
            TerminalEnvelope::HistoryEnd => {
                render(self.history.end(), sink);
                None
            }
            TerminalEnvelope::Session { session_id } => Some(self.assign_session(session_id)),
            TerminalEnvelope::Close { session_id } => {
                log::info!("[Terminal] Server closed session {:?}", session_id);
                self.session_state = SessionState::Closed;
                Some(TerminalEvent::SessionClosed(session_id))
            }
            TerminalEnvelope::Error { error } => {
                log::warn!("[Terminal] Server error: {}", error);
                Some(TerminalEvent::Error(error))
            }
            TerminalEnvelope::MonitoringStatus { monitoring } => {
                Some(TerminalEvent::Monitoring(monitoring))
            }
            TerminalEnvelope::TaskUpdate { task } => Some(TerminalEvent::TaskUpdate(task)),
            TerminalEnvelope::StrategyTriggered { strategy } => {
                Some(TerminalEvent::StrategyTriggered(strategy))
            }
            TerminalEnvelope::Input { .. }
            | TerminalEnvelope::Resize { .. }
            | TerminalEnvelope::Start
            | TerminalEnvelope::Ping
            | TerminalEnvelope::Pong => None,
            TerminalEnvelope::Unknown => None,
        }
    }

    /// Explicit close: end the remote session, then drop the channel.
    ///
    /// Sends exactly one `close` envelope per adapter, carrying the current
    /// session id.
    pub fn close(&mut self) {
        if !self.close_sent {
            self.close_sent = true;
            log::info!("[Terminal] Closing session {:?}", self.session_id);
            self.link.send_text(
                TerminalCommand::Close {
                    session_id: self.session_id.clone(),
                }
                .encode(),
            );
        }
        self.session_state = SessionState::Closed;
        self.link.disconnect();
    }

    /// Implicit removal: drop the channel and leave the remote session alive.
    pub fn detach(&mut self) {
        log::debug!("[Terminal] Detaching from session {:?}", self.session_id);
        self.link.disconnect();
    }

    fn assign_session(&mut self, session_id: String) -> TerminalEvent {
        if self.session_id.as_deref() != Some(session_id.as_str()) {
            log::info!("[Terminal] Session assigned: {}", session_id);
        }
        self.link.bind_session(&session_id);
        self.session_id = Some(session_id.clone());
        self.session_state = SessionState::Active;
        TerminalEvent::SessionAssigned(session_id)
    }

    fn flush_geometry(&mut self) {
        let Some((cols, rows)) = self.geometry else {
            return;
        };
        if self.sent_geometry == Some((cols, rows)) || !self.link.is_connected() {
            return;
        }
        self.link
            .send_text(TerminalCommand::Resize { cols, rows }.encode());
        self.sent_geometry = Some((cols, rows));
    }
}

fn render(step: HistoryStep, sink: &mut dyn TerminalSink) {
    match step {
        HistoryStep::Begin(progress) => {
            sink.clear();
            sink.history_progress(&progress);
        }
        HistoryStep::Chunk { data, progress } => {
            sink.write(&data);
            sink.history_progress(&progress);
        }
        HistoryStep::Live(data) => sink.write(&data),
        HistoryStep::Finish(progress) => sink.history_progress(&progress),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Recording [`ChannelLink`] shared with the test body.
    #[derive(Debug, Clone, Default)]
    pub(crate) struct FakeLink {
        pub(crate) inner: Rc<RefCell<FakeLinkState>>,
    }

    #[derive(Debug, Default)]
    pub(crate) struct FakeLinkState {
        pub(crate) connected: bool,
        pub(crate) sent: Vec<String>,
        pub(crate) bound: Option<String>,
        pub(crate) disconnects: u32,
        /// Frames sent before the first disconnect.
        pub(crate) sent_before_disconnect: Option<usize>,
    }

    impl FakeLink {
        pub(crate) fn connected() -> Self {
            let link = Self::default();
            link.inner.borrow_mut().connected = true;
            link
        }

        pub(crate) fn set_connected(&self, connected: bool) {
            self.inner.borrow_mut().connected = connected;
        }

        pub(crate) fn sent(&self) -> Vec<String> {
            self.inner.borrow().sent.clone()
        }

        pub(crate) fn disconnects(&self) -> u32 {
            self.inner.borrow().disconnects
        }
    }

    impl ChannelLink for FakeLink {
        fn is_connected(&self) -> bool {
            self.inner.borrow().connected
        }

        fn send_text(&self, frame: String) {
            let mut inner = self.inner.borrow_mut();
            if inner.connected {
                inner.sent.push(frame);
            }
        }

        fn bind_session(&self, session_id: &str) {
            self.inner.borrow_mut().bound = Some(session_id.to_string());
        }

        fn disconnect(&self) {
            let mut inner = self.inner.borrow_mut();
            if inner.sent_before_disconnect.is_none() {
                inner.sent_before_disconnect = Some(inner.sent.len());
            }
            inner.disconnects += 1;
            inner.connected = false;
        }
    }

    /// Sink that records everything it is given.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingSink {
        pub(crate) output: String,
        pub(crate) clears: u32,
        pub(crate) progress: Vec<HistoryProgress>,
    }

    impl TerminalSink for RecordingSink {
        fn write(&mut self, data: &str) {
            self.output.push_str(data);
        }

        fn clear(&mut self) {
            self.clears += 1;
            self.output.clear();
        }

        fn history_progress(&mut self, progress: &HistoryProgress) {
            self.progress.push(*progress);
        }
    }

    fn text(s: &str) -> WireFrame {
        WireFrame::Text(s.to_string())
    }

    #[test]
    fn test_input_while_disconnected_is_noop() {
        let link = FakeLink::default();
        let mut adapter = TerminalAdapter::new(link.clone(), Some("s1".to_string()));
        adapter.send_input("ls\r");
        assert!(link.sent().is_empty());
        assert_eq!(adapter.session_state(), SessionState::Requested);
        assert_eq!(adapter.session_id(), Some("s1"));
    }

    #[test]
    fn test_input_while_connected_is_sent() {
        let link = FakeLink::connected();
        let mut adapter = TerminalAdapter::new(link.clone(), None);
        adapter.send_input("ls\r");
        assert_eq!(link.sent(), vec![r#"{"type":"input","data":"ls\r"}"#]);
    }

    #[test]
    fn test_unchanged_geometry_is_not_resent() {
        let link = FakeLink::connected();
        let mut adapter = TerminalAdapter::new(link.clone(), None);
        adapter.resize(80, 24);
        adapter.resize(80, 24);
        adapter.resize(120, 40);
        assert_eq!(
            link.sent(),
            vec![
                r#"{"type":"resize","cols":80,"rows":24}"#,
                r#"{"type":"resize","cols":120,"rows":40}"#,
            ]
        );
    }

    #[test]
    fn test_geometry_is_pushed_again_after_reconnect() {
        let link = FakeLink::default();
        let mut adapter = TerminalAdapter::new(link.clone(), None);
        adapter.resize(100, 30);
        assert!(link.sent().is_empty());

        link.set_connected(true);
        adapter.on_connection(ConnectionState::Connected);
        link.set_connected(false);
        adapter.on_connection(ConnectionState::Reconnecting);
        link.set_connected(true);
        adapter.on_connection(ConnectionState::Connected);
        assert_eq!(link.sent().len(), 2);
        assert_eq!(adapter.session_state(), SessionState::Requested);
    }

    #[test]
    fn test_session_assignment_binds_channel() {
        let link = FakeLink::connected();
        let mut adapter = TerminalAdapter::new(link.clone(), None);
        let mut sink = RecordingSink::default();
        let event = adapter.handle_frame(&text(r#"{"type":"session","session_id":"abc123"}"#), &mut sink);
        assert_eq!(event, Some(TerminalEvent::SessionAssigned("abc123".to_string())));
        assert_eq!(adapter.session_state(), SessionState::Active);
        assert_eq!(link.inner.borrow().bound.as_deref(), Some("abc123"));
    }

    #[test]
    fn test_output_and_plain_text_reach_sink() {
        let mut adapter = TerminalAdapter::new(FakeLink::connected(), None);
        let mut sink = RecordingSink::default();
        adapter.handle_frame(&text(r#"{"type":"output","data":"hi "}"#), &mut sink);
        adapter.handle_frame(&text("legacy"), &mut sink);
        assert_eq!(sink.output, "hi legacy");
    }

    #[test]
    fn test_history_replay_clears_and_reports_progress() {
        let mut adapter = TerminalAdapter::new(FakeLink::connected(), None);
        let mut sink = RecordingSink::default();
        sink.output.push_str("stale");

        adapter.handle_frame(
            &text(r#"{"type":"history_start","total_size":1024,"total_chunks":4}"#),
            &mut sink,
        );
        for i in 0..4 {
            adapter.handle_frame(
                &text(&format!(r#"{{"type":"history","data":"{i}","chunk_index":{i},"total_chunks":4}}"#)),
                &mut sink,
            );
        }
        adapter.handle_frame(&text(r#"{"type":"history_end"}"#), &mut sink);

        assert_eq!(sink.clears, 1);
        assert_eq!(sink.output, "0123");
        let percents: Vec<u8> = sink.progress.iter().skip(1).map(|p| p.percent).collect();
        let loading: Vec<bool> = sink.progress.iter().skip(1).map(|p| p.loading).collect();
        assert_eq!(percents, vec![25, 50, 75, 100, 100]);
        assert_eq!(loading, vec![true, true, true, true, false]);
    }

    #[test]
    fn test_explicit_close_sends_one_close_then_disconnects() {
        let link = FakeLink::connected();
        let mut adapter = TerminalAdapter::new(link.clone(), None);
        let mut sink = RecordingSink::default();
        adapter.handle_frame(&text(r#"{"type":"session","session_id":"abc123"}"#), &mut sink);

        adapter.close();
        adapter.close();

        let sent = link.sent();
        let closes: Vec<_> = sent.iter().filter(|f| f.contains(r#""type":"close""#)).collect();
        assert_eq!(closes, vec![r#"{"type":"close","session_id":"abc123"}"#]);
        assert_eq!(link.inner.borrow().sent_before_disconnect, Some(1));
        assert_eq!(adapter.session_state(), SessionState::Closed);
    }

    #[test]
    fn test_implicit_removal_sends_no_close() {
        let link = FakeLink::connected();
        let mut adapter = TerminalAdapter::new(link.clone(), Some("abc123".to_string()));
        adapter.detach();
        assert!(link.sent().is_empty());
        assert_eq!(link.disconnects(), 1);
        assert_eq!(adapter.session_state(), SessionState::Requested);
    }

    #[test]
    fn test_server_close_and_error_are_reported() {
        let mut adapter = TerminalAdapter::new(FakeLink::connected(), Some("s1".to_string()));
        let mut sink = RecordingSink::default();
        assert_eq!(
            adapter.handle_frame(&text(r#"{"type":"error","error":"pty died"}"#), &mut sink),
            Some(TerminalEvent::Error("pty died".to_string()))
        );
        assert_eq!(
            adapter.handle_frame(&text(r#"{"type":"close","session_id":"s1"}"#), &mut sink),
            Some(TerminalEvent::SessionClosed(Some("s1".to_string())))
        );
        assert_eq!(adapter.session_state(), SessionState::Closed);
    }

    #[test]
    fn test_unknown_and_control_frames_are_dropped() {
        let mut adapter = TerminalAdapter::new(FakeLink::connected(), None);
        let mut sink = RecordingSink::default();
        assert_eq!(adapter.handle_frame(&text(r#"{"type":"pong"}"#), &mut sink), None);
        assert_eq!(adapter.handle_frame(&text(r#"{"type":"brand_new"}"#), &mut sink), None);
        assert!(sink.output.is_empty());
    }
}
