//! Tokio driver for a [`ConnectionManager`].
//!
//! Each channel runs on its own task. The task owns the socket, the
//! keepalive ticker, the reconnect timer and the in-flight existence check,
//! and feeds every completion back into the state machine one at a time.
//! Consumers talk to the task through a [`ChannelHandle`] and receive
//! [`ChannelEvent`]s on a shared queue tagged with the channel id, so one
//! event loop can serve many channels.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep};

use super::manager::{event, ConnectionManager, Effect, TargetStatus};
use super::{
    ChannelEvent, ChannelEventKind, ChannelLink, ChannelSettings, ConnectionState, Indicator,
    SharedConnectionState, Target,
};
use crate::api::TargetProbe;
use crate::ws::{self, Inbound, WsReader, WsWriter};

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Request from a handle to its channel task.
#[derive(Debug)]
enum Command {
    Send(String),
    BindSession(String),
    Connect,
    Disconnect,
}

/// Owner-side handle for a running channel.
///
/// The channel task outlives a [`ChannelLink::disconnect`] so the channel can
/// be reopened with [`ChannelHandle::reconnect`]. Dropping every clone of the
/// handle tears the channel down and ends the task.
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    channel_id: String,
    commands: mpsc::UnboundedSender<Command>,
    state: Arc<SharedConnectionState>,
}

impl ChannelHandle {
    /// Identifier carried by this channel's events.
    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// Indicator for the current state.
    pub fn indicator(&self) -> Indicator {
        self.state.indicator()
    }

    /// Shared state for external observation.
    pub fn shared_state(&self) -> Arc<SharedConnectionState> {
        Arc::clone(&self.state)
    }

    /// Start over after a fatal error or a manual disconnect.
    ///
    /// A no-op while the channel is already connecting or connected.
    pub fn reconnect(&self) {
        if self.commands.send(Command::Connect).is_err() {
            log::warn!("[Channel] {} task is gone, cannot reconnect", self.channel_id);
        }
    }
}

impl ChannelLink for ChannelHandle {
    fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    fn send_text(&self, frame: String) {
        let _ = self.commands.send(Command::Send(frame));
    }

    fn bind_session(&self, session_id: &str) {
        let _ = self.commands.send(Command::BindSession(session_id.to_string()));
    }

    fn disconnect(&self) {
        let _ = self.commands.send(Command::Disconnect);
    }
}

/// Spawn a channel task and start connecting.
///
/// Events for this channel are delivered on `events` tagged with
/// `channel_id`, in the order the socket produced them.
pub fn spawn_channel(
    channel_id: impl Into<String>,
    target: Target,
    settings: ChannelSettings,
    probe: Arc<dyn TargetProbe>,
    events: mpsc::UnboundedSender<ChannelEvent>,
) -> ChannelHandle {
    let channel_id = channel_id.into();
    let (commands, command_rx) = mpsc::unbounded_channel();
    let state = SharedConnectionState::new();

    let driver = Driver {
        channel_id: channel_id.clone(),
        settings: settings.clone(),
        probe,
        events,
        state: Arc::clone(&state),
        writer: None,
        reader: None,
        connecting: None,
        keepalive: None,
        reconnect: None,
        existence: None,
    };
    let manager = ConnectionManager::new(target, settings);
    tokio::spawn(driver.run(manager, command_rx));

    ChannelHandle {
        channel_id,
        commands,
        state,
    }
}

struct Driver {
    channel_id: String,
    settings: ChannelSettings,
    probe: Arc<dyn TargetProbe>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    state: Arc<SharedConnectionState>,
    writer: Option<WsWriter>,
    reader: Option<WsReader>,
    connecting: Option<BoxFuture<Result<(WsWriter, WsReader)>>>,
    keepalive: Option<Interval>,
    reconnect: Option<Pin<Box<Sleep>>>,
    existence: Option<BoxFuture<TargetStatus>>,
}

impl Driver {
    async fn run(
        mut self,
        mut manager: ConnectionManager,
        mut commands: mpsc::UnboundedReceiver<Command>,
    ) {
        let effects = manager.connect();
        self.apply(effects, &manager).await;

        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else {
                        log::debug!("[Channel] {} handle dropped", self.channel_id);
                        let effects = manager.disconnect();
                        self.apply(effects, &manager).await;
                        break;
                    };
                    match command {
                        Command::Send(frame) => {
                            if let Some(effect) = manager.send(frame) {
                                self.apply(vec![effect], &manager).await;
                            }
                        }
                        Command::BindSession(session_id) => manager.bind_session(&session_id),
                        Command::Connect => {
                            let effects = manager.connect();
                            self.apply(effects, &manager).await;
                        }
                        Command::Disconnect => {
                            let effects = manager.disconnect();
                            self.apply(effects, &manager).await;
                        }
                    }
                }

                result = poll_slot(&mut self.connecting) => {
                    self.connecting = None;
                    let effects = match result {
                        Ok((writer, reader)) => {
                            self.writer = Some(writer);
                            self.reader = Some(reader);
                            manager.on_open()
                        }
                        Err(e) => manager.on_error(&format!("{e:#}")),
                    };
                    self.apply(effects, &manager).await;
                }

                inbound = next_inbound(&mut self.reader) => {
                    let effects = match inbound {
                        Some(Ok(Inbound::Frame(frame))) => {
                            self.emit(ChannelEventKind::Frame(frame));
                            Vec::new()
                        }
                        Some(Ok(Inbound::Ping(data))) => {
                            if let Some(writer) = self.writer.as_mut() {
                                let _ = writer.send_pong(data).await;
                            }
                            Vec::new()
                        }
                        Some(Ok(Inbound::Pong)) => Vec::new(),
                        Some(Ok(Inbound::Closed { code, reason })) => {
                            self.drop_socket();
                            manager.on_close(code, &reason)
                        }
                        Some(Err(e)) => {
                            self.drop_socket();
                            manager.on_error(&format!("{e:#}"))
                        }
                        None => {
                            self.drop_socket();
                            manager.on_close(1006, "stream ended")
                        }
                    };
                    self.apply(effects, &manager).await;
                }

                () = tick_slot(&mut self.keepalive) => {
                    if let Some(effect) = manager.on_keepalive() {
                        self.apply(vec![effect], &manager).await;
                    }
                }

                () = poll_slot(&mut self.reconnect) => {
                    self.reconnect = None;
                    let effects = manager.on_reconnect_timer();
                    self.apply(effects, &manager).await;
                }

                status = poll_slot(&mut self.existence) => {
                    self.existence = None;
                    let effects = manager.on_existence(status);
                    self.apply(effects, &manager).await;
                }
            }
        }
    }

    async fn apply(&mut self, effects: Vec<Effect>, manager: &ConnectionManager) {
        for effect in effects {
            match effect {
                Effect::Open(url) => {
                    log::info!("[Channel] Connecting to {}", ws::redact(&url));
                    self.drop_socket();
                    self.connecting = Some(Box::pin(async move { ws::connect(&url).await }));
                }
                Effect::Transmit(frame) => {
                    if let Some(writer) = self.writer.as_mut() {
                        if let Err(e) = writer.send_text(&frame).await {
                            // The reader observes the broken socket and drives recovery.
                            log::warn!("[Channel] {} send failed: {:#}", self.channel_id, e);
                        }
                    }
                }
                Effect::Close => {
                    self.connecting = None;
                    if let Some(mut writer) = self.writer.take() {
                        let _ = writer.close().await;
                    }
                    self.reader = None;
                }
                Effect::StartKeepalive(period) => {
                    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
                    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    self.keepalive = Some(interval);
                }
                Effect::StopKeepalive => self.keepalive = None,
                Effect::ScheduleReconnect(delay) => {
                    self.reconnect = Some(Box::pin(tokio::time::sleep(delay)));
                }
                Effect::CancelReconnect => self.reconnect = None,
                Effect::CheckExistence => {
                    let probe = Arc::clone(&self.probe);
                    let target = manager.target().clone();
                    let timeout = self.settings.existence_check_timeout;
                    self.existence = Some(Box::pin(async move {
                        check_existence(probe.as_ref(), &target, timeout).await
                    }));
                }
                Effect::Emit(kind) => self.emit(kind),
            }
        }

        self.state.set(manager.state());
        self.state.set_error(manager.last_error().cloned());
    }

    fn emit(&self, kind: ChannelEventKind) {
        if let ChannelEventKind::State(state) = &kind {
            self.state.set(*state);
        }
        if self.events.send(event(&self.channel_id, kind)).is_err() {
            log::trace!("[Channel] {} event receiver dropped", self.channel_id);
        }
    }

    fn drop_socket(&mut self) {
        self.writer = None;
        self.reader = None;
    }
}

/// Run the existence probe with a bound. Errors and timeouts are inconclusive.
async fn check_existence(
    probe: &dyn TargetProbe,
    target: &Target,
    timeout: std::time::Duration,
) -> TargetStatus {
    match tokio::time::timeout(timeout, probe.exists(target)).await {
        Ok(Ok(true)) => TargetStatus::Exists,
        Ok(Ok(false)) => TargetStatus::Gone,
        Ok(Err(e)) => {
            log::warn!("[Channel] Existence check for {} failed: {:#}", target.label(), e);
            TargetStatus::Unknown
        }
        Err(_) => {
            log::warn!(
                "[Channel] Existence check for {} timed out after {}s",
                target.label(),
                timeout.as_secs()
            );
            TargetStatus::Unknown
        }
    }
}

async fn poll_slot<F: Future + Unpin>(slot: &mut Option<F>) -> F::Output {
    match slot.as_mut() {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

async fn next_inbound(reader: &mut Option<WsReader>) -> Option<Result<Inbound>> {
    match reader.as_mut() {
        Some(reader) => reader.recv().await,
        None => std::future::pending().await,
    }
}

async fn tick_slot(interval: &mut Option<Interval>) {
    match interval.as_mut() {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
