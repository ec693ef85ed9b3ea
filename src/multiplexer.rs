//! Tab multiplexer for one container.
//!
//! Owns the set of terminal tabs, keeps exactly one of them active, routes
//! each channel's frames to its tab and keeps the session registry in step
//! with every session assignment and removal.
//!
//! Layout changes are debounced: callers report them as they happen and
//! call [`Multiplexer::poll`] from their event loop; the refit reaches
//! every tab once the layout has been quiet for the debounce period.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::api::TargetProbe;
use crate::channel::{
    spawn_channel, ChannelEvent, ChannelHandle, ChannelLink, ChannelSettings, ConnectionState,
    Target,
};
use crate::constants::REFIT_DEBOUNCE;
use crate::protocol::WireFrame;
use crate::registry::{SessionRegistry, Storage};
use crate::terminal::{TerminalAdapter, TerminalEvent, TerminalSink};

/// Opens the channel behind a tab.
pub trait LinkFactory {
    /// Link type produced.
    type Link: ChannelLink;

    /// Open a channel whose events are tagged with `tab_key`.
    fn open(&mut self, tab_key: &str, target: Target) -> Self::Link;
}

/// [`LinkFactory`] spawning real socket channels.
pub struct ChannelFactory {
    settings: ChannelSettings,
    probe: Arc<dyn TargetProbe>,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

impl std::fmt::Debug for ChannelFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelFactory")
            .field("server_url", &self.settings.server_url)
            .finish_non_exhaustive()
    }
}

impl ChannelFactory {
    /// Factory delivering every channel's events on `events`.
    pub fn new(
        settings: ChannelSettings,
        probe: Arc<dyn TargetProbe>,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Self {
        Self {
            settings,
            probe,
            events,
        }
    }
}

impl LinkFactory for ChannelFactory {
    type Link = ChannelHandle;

    fn open(&mut self, tab_key: &str, target: Target) -> ChannelHandle {
        spawn_channel(
            tab_key,
            target,
            self.settings.clone(),
            Arc::clone(&self.probe),
            self.events.clone(),
        )
    }
}

/// Mints local tab keys (`tab-1`, `tab-2`, ...).
///
/// Owned per multiplexer; restored keys advance it so new tabs never reuse
/// a saved key.
#[derive(Debug, Clone)]
pub struct TabKeySequence {
    next: u64,
}

impl Default for TabKeySequence {
    fn default() -> Self {
        Self { next: 1 }
    }
}

impl TabKeySequence {
    /// Sequence starting at `tab-1`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Next unused key.
    pub fn next_key(&mut self) -> String {
        let key = format!("tab-{}", self.next);
        self.next += 1;
        key
    }

    /// Account for an existing key.
    pub fn observe(&mut self, key: &str) {
        if let Some(n) = key
            .strip_prefix("tab-")
            .and_then(|n| n.parse::<u64>().ok())
        {
            self.next = self.next.max(n.saturating_add(1));
        }
    }
}

/// How a tab is going away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// The user closed the tab: the remote session is ended.
    Explicit,
    /// The tab was dropped from the view: the remote session stays alive.
    Implicit,
}

/// A terminal slot.
#[derive(Debug)]
pub struct Tab<L> {
    key: String,
    adapter: TerminalAdapter<L>,
}

impl<L: ChannelLink> Tab<L> {
    /// Local tab key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The tab's terminal adapter.
    pub fn adapter(&self) -> &TerminalAdapter<L> {
        &self.adapter
    }
}

/// The tab set for one container.
#[derive(Debug)]
pub struct Multiplexer<F: LinkFactory, S> {
    container_id: String,
    factory: F,
    registry: SessionRegistry<S>,
    tabs: Vec<Tab<F::Link>>,
    active: Option<String>,
    keys: TabKeySequence,
    viewport: Option<(u16, u16)>,
    refit_at: Option<Instant>,
    debounce: Duration,
}

impl<F, S> Multiplexer<F, S>
where
    F: LinkFactory,
    S: Storage,
{
    /// Empty multiplexer. Call [`Multiplexer::init`] to populate it.
    pub fn new(container_id: impl Into<String>, factory: F, registry: SessionRegistry<S>) -> Self {
        Self {
            container_id: container_id.into(),
            factory,
            registry,
            tabs: Vec::new(),
            active: None,
            keys: TabKeySequence::new(),
            viewport: None,
            refit_at: None,
            debounce: REFIT_DEBOUNCE,
        }
    }

    /// Override the refit debounce.
    #[must_use]
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Container served.
    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    /// Registry backing this multiplexer.
    pub fn registry(&self) -> &SessionRegistry<S> {
        &self.registry
    }

    /// Tabs in display order.
    pub fn tabs(&self) -> &[Tab<F::Link>] {
        &self.tabs
    }

    /// Tab by key.
    pub fn tab(&self, key: &str) -> Option<&Tab<F::Link>> {
        self.tabs.iter().find(|t| t.key == key)
    }

    /// Key of the active tab.
    pub fn active_key(&self) -> Option<&str> {
        self.active.as_deref()
    }

    /// Recreate saved tabs in saved order, or open one fresh tab.
    ///
    /// Returns the keys of the tabs now open. The first tab is active.
    pub fn init(&mut self) -> Vec<String> {
        if !self.tabs.is_empty() {
            return self.tabs.iter().map(|t| t.key.clone()).collect();
        }

        let records = self.registry.load(&self.container_id);
        if records.is_empty() {
            log::info!("[Tabs] No saved tabs for {}, opening one", self.container_id);
            self.create_tab();
        } else {
            log::info!(
                "[Tabs] Restoring {} tab(s) for {}",
                records.len(),
                self.container_id
            );
            for record in records {
                self.keys.observe(&record.tab_key);
                self.open_tab(record.tab_key, Some(record.session_id));
            }
        }

        if let Some(first) = self.tabs.first().map(|t| t.key.clone()) {
            self.activate(&first);
        }
        self.tabs.iter().map(|t| t.key.clone()).collect()
    }

    /// Open a fresh tab and make it active.
    pub fn create_tab(&mut self) -> String {
        let key = self.keys.next_key();
        self.open_tab(key.clone(), None);
        self.activate(&key);
        key
    }

    /// Make a tab active. Returns `false` for an unknown key.
    pub fn activate(&mut self, key: &str) -> bool {
        if self.tab(key).is_none() {
            return false;
        }
        if self.active.as_deref() != Some(key) {
            log::debug!("[Tabs] Active tab -> {}", key);
            self.active = Some(key.to_string());
        }
        true
    }

    /// Remove a tab.
    ///
    /// An explicit removal ends the remote session; an implicit one only
    /// drops the channel. Either way the tab leaves the registry.
    pub fn remove(&mut self, key: &str, removal: Removal) -> bool {
        let Some(position) = self.tabs.iter().position(|t| t.key == key) else {
            return false;
        };
        let mut tab = self.tabs.remove(position);
        match removal {
            Removal::Explicit => tab.adapter.close(),
            Removal::Implicit => tab.adapter.detach(),
        }
        log::info!("[Tabs] Removed {} ({:?})", key, removal);

        if self.active.as_deref() == Some(key) {
            let neighbour = position.saturating_sub(1).min(self.tabs.len().saturating_sub(1));
            self.active = self.tabs.get(neighbour).map(|t| t.key.clone());
        }
        self.persist();
        true
    }

    /// Detach from every tab without touching the registry.
    ///
    /// Used when the whole view goes away; the saved tabs are reattached
    /// on the next [`Multiplexer::init`].
    pub fn detach_all(&mut self) {
        for tab in &mut self.tabs {
            tab.adapter.detach();
        }
        self.tabs.clear();
        self.active = None;
    }

    /// Send text to the active tab. A no-op unless it is connected.
    pub fn insert_text(&mut self, text: &str) -> bool {
        let Some(tab) = self.active_tab_mut() else {
            return false;
        };
        if !tab.adapter.is_connected() {
            log::trace!("[Tabs] Dropping insert, {} not connected", tab.key);
            return false;
        }
        tab.adapter.send_input(text);
        true
    }

    /// A channel changed state.
    pub fn on_channel_state(&mut self, key: &str, state: ConnectionState) {
        if let Some(tab) = self.tab_mut(key) {
            tab.adapter.on_connection(state);
        }
    }

    /// Route a frame to the tab that owns the channel.
    pub fn route_frame(
        &mut self,
        key: &str,
        frame: &WireFrame,
        sink: &mut dyn TerminalSink,
    ) -> Option<TerminalEvent> {
        let Some(tab) = self.tab_mut(key) else {
            log::debug!("[Tabs] Frame for unknown tab {}", key);
            return None;
        };
        let event = tab.adapter.handle_frame(frame, sink);
        if let Some(TerminalEvent::SessionAssigned(_)) = &event {
            self.persist();
        }
        event
    }

    /// The viewport size changed.
    pub fn set_viewport(&mut self, cols: u16, rows: u16, now: Instant) {
        if self.viewport != Some((cols, rows)) {
            self.viewport = Some((cols, rows));
            self.layout_changed(now);
        }
    }

    /// Something affecting layout happened; schedule a refit.
    pub fn layout_changed(&mut self, now: Instant) {
        self.refit_at = Some(now + self.debounce);
    }

    /// When the pending refit is due, if any.
    pub fn refit_deadline(&self) -> Option<Instant> {
        self.refit_at
    }

    /// Run the refit once the layout has been quiet. Returns whether it ran.
    pub fn poll(&mut self, now: Instant) -> bool {
        match self.refit_at {
            Some(at) if now >= at => {
                self.refit_at = None;
                self.refit();
                true
            }
            _ => false,
        }
    }

    fn refit(&mut self) {
        let Some((cols, rows)) = self.viewport else {
            return;
        };
        log::debug!("[Tabs] Refit {} tab(s) to {}x{}", self.tabs.len(), cols, rows);
        for tab in &mut self.tabs {
            tab.adapter.resize(cols, rows);
        }
    }

    fn open_tab(&mut self, key: String, session_id: Option<String>) {
        let target = Target::terminal(self.container_id.clone()).with_session(session_id.clone());
        let link = self.factory.open(&key, target);
        let mut adapter = TerminalAdapter::new(link, session_id);
        if let Some((cols, rows)) = self.viewport {
            adapter.resize(cols, rows);
        }
        self.tabs.push(Tab { key, adapter });
    }

    fn active_tab_mut(&mut self) -> Option<&mut Tab<F::Link>> {
        let key = self.active.clone()?;
        self.tab_mut(&key)
    }

    fn tab_mut(&mut self, key: &str) -> Option<&mut Tab<F::Link>> {
        self.tabs.iter_mut().find(|t| t.key == key)
    }

    fn persist(&self) {
        let entries = self
            .tabs
            .iter()
            .map(|t| (t.key.as_str(), t.adapter.session_id()));
        if let Err(e) = self.registry.save(&self.container_id, entries) {
            log::warn!("[Tabs] Failed to save tabs for {}: {:#}", self.container_id, e);
        }
    }
}
