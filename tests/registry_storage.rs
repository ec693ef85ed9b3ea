//! Tab registry persistence across process restarts.
//!
//! Uses the file-backed storage the CLI uses, with a fresh registry and
//! multiplexer for every "session" of the front-end.

use std::cell::RefCell;
use std::rc::Rc;

use sessionwire::channel::{ChannelLink, ChannelMode, Target};
use sessionwire::history::HistoryProgress;
use sessionwire::multiplexer::{LinkFactory, Multiplexer, Removal};
use sessionwire::protocol::WireFrame;
use sessionwire::registry::{FileStorage, SessionRegistry, Storage, TabRecord};
use sessionwire::terminal::{TerminalEvent, TerminalSink};
use tempfile::TempDir;

/// Link that is always connected and records what it was asked to send.
#[derive(Debug, Clone, Default)]
struct RecordingLink {
    sent: Rc<RefCell<Vec<String>>>,
}

impl ChannelLink for RecordingLink {
    fn is_connected(&self) -> bool {
        true
    }

    fn send_text(&self, frame: String) {
        self.sent.borrow_mut().push(frame);
    }

    fn bind_session(&self, _session_id: &str) {}

    fn disconnect(&self) {}
}

#[derive(Debug, Default)]
struct Factory {
    targets: Rc<RefCell<Vec<(String, Target)>>>,
    links: Rc<RefCell<Vec<(String, RecordingLink)>>>,
}

impl LinkFactory for Factory {
    type Link = RecordingLink;

    fn open(&mut self, tab_key: &str, target: Target) -> RecordingLink {
        let link = RecordingLink::default();
        self.targets
            .borrow_mut()
            .push((tab_key.to_string(), target));
        self.links
            .borrow_mut()
            .push((tab_key.to_string(), link.clone()));
        link
    }
}

#[derive(Default)]
struct NullSink;

impl TerminalSink for NullSink {
    fn write(&mut self, _data: &str) {}
    fn clear(&mut self) {}
    fn history_progress(&mut self, _progress: &HistoryProgress) {}
}

fn registry(dir: &TempDir, window: Option<&str>) -> SessionRegistry<FileStorage> {
    SessionRegistry::new(FileStorage::new(dir.path().join("sessions")))
        .with_window(window.map(str::to_string))
}

fn assign(mux: &mut Multiplexer<Factory, FileStorage>, key: &str, session_id: &str) {
    let frame = WireFrame::Text(format!(r#"{{"type":"session","session_id":"{session_id}"}}"#));
    let event = mux.route_frame(key, &frame, &mut NullSink);
    assert_eq!(event, Some(TerminalEvent::SessionAssigned(session_id.to_string())));
}

#[test]
fn test_tabs_survive_restart() {
    let dir = TempDir::new().unwrap();

    // First run: two tabs, both get sessions.
    {
        let mut mux = Multiplexer::new("c1", Factory::default(), registry(&dir, None));
        assert_eq!(mux.init(), vec!["tab-1".to_string()]);
        let second = mux.create_tab();
        assert_eq!(second, "tab-2");
        assign(&mut mux, "tab-1", "abc123");
        assign(&mut mux, "tab-2", "def456");
        mux.detach_all();
    }

    assert_eq!(
        registry(&dir, None).load("c1"),
        vec![
            TabRecord::new("tab-1", "abc123"),
            TabRecord::new("tab-2", "def456"),
        ]
    );

    // Second run: both tabs come back attached to their sessions.
    let factory = Factory::default();
    let targets = Rc::clone(&factory.targets);
    let mut mux = Multiplexer::new("c1", factory, registry(&dir, None));
    assert_eq!(mux.init(), vec!["tab-1".to_string(), "tab-2".to_string()]);
    assert_eq!(mux.active_key(), Some("tab-1"));

    let opened = targets.borrow();
    assert_eq!(opened.len(), 2);
    for ((key, target), expected) in opened.iter().zip(["abc123", "def456"]) {
        assert_eq!(target.mode, ChannelMode::Terminal);
        assert_eq!(target.id, "c1");
        assert_eq!(target.session_id.as_deref(), Some(expected), "{key}");
    }
    drop(opened);

    // New tabs continue the sequence instead of reusing a restored key.
    assert_eq!(mux.create_tab(), "tab-3");
}

#[test]
fn test_explicit_close_is_forgotten_across_restart() {
    let dir = TempDir::new().unwrap();

    {
        let factory = Factory::default();
        let links = Rc::clone(&factory.links);
        let mut mux = Multiplexer::new("c1", factory, registry(&dir, None));
        mux.init();
        mux.create_tab();
        assign(&mut mux, "tab-1", "abc123");
        assign(&mut mux, "tab-2", "def456");

        assert!(mux.remove("tab-2", Removal::Explicit));
        let links = links.borrow();
        let (_, closed) = links.iter().find(|(key, _)| key == "tab-2").unwrap();
        assert!(closed
            .sent
            .borrow()
            .iter()
            .any(|frame| frame == r#"{"type":"close","session_id":"def456"}"#));
    }

    let mut mux = Multiplexer::new("c1", Factory::default(), registry(&dir, None));
    assert_eq!(mux.init(), vec!["tab-1".to_string()]);
    assert_eq!(
        mux.tab("tab-1").and_then(|t| t.adapter().session_id()),
        Some("abc123")
    );
}

#[test]
fn test_windows_do_not_share_tabs() {
    let dir = TempDir::new().unwrap();
    let left = registry(&dir, Some("w-left"));
    let right = registry(&dir, Some("w-right"));
    let shared = registry(&dir, None);

    left.save("c1", [("tab-1", Some("left-session"))]).unwrap();
    right.save("c1", [("tab-1", Some("right-session"))]).unwrap();

    assert_eq!(left.load("c1"), vec![TabRecord::new("tab-1", "left-session")]);
    assert_eq!(right.load("c1"), vec![TabRecord::new("tab-1", "right-session")]);
    assert!(shared.load("c1").is_empty());

    left.clear("c1").unwrap();
    assert!(left.load("c1").is_empty());
    assert_eq!(right.load("c1").len(), 1);
}

#[test]
fn test_corrupt_file_is_ignored_and_overwritten() {
    let dir = TempDir::new().unwrap();
    let registry = registry(&dir, None);
    let key = registry.key("c1");
    registry.storage().set(&key, "{not json").unwrap();

    assert!(registry.load("c1").is_empty());

    registry.save("c1", [("tab-1", Some("abc123"))]).unwrap();
    assert_eq!(registry.load("c1"), vec![TabRecord::new("tab-1", "abc123")]);
}

#[test]
fn test_saving_nothing_removes_the_file() {
    let dir = TempDir::new().unwrap();
    let registry = registry(&dir, None);

    registry.save("c1", [("tab-1", Some("abc123"))]).unwrap();
    let files = std::fs::read_dir(dir.path().join("sessions")).unwrap().count();
    assert_eq!(files, 1);

    registry.save("c1", [("tab-1", None)]).unwrap();
    let files = std::fs::read_dir(dir.path().join("sessions")).unwrap().count();
    assert_eq!(files, 0);
}
