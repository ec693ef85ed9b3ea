//! Connection lifecycle state machine.
//!
//! [`ConnectionManager`] owns one channel's state but no socket and no
//! timers. Each input (a call from the owner, a socket event, a timer firing,
//! an existence-check result) returns the [`Effect`]s the driver must carry
//! out. Every transition therefore happens in response to exactly one event,
//! and the whole lifecycle can be exercised without a network.
//!
//! # Lifecycle
//!
//! ```text
//!  connect()          on_open()
//! Disconnected ──► Connecting ──────► Connected ◄────────────┐
//!                      │                  │ close / error     │ on_open()
//!                      │ close / error    ▼                   │
//!                      └────────────► Reconnecting ── timer ──┘
//!                                         │ CheckExistence
//!                        Gone / attempts > max
//!                                         ▼
//!                                   Disconnected (fatal error)
//! ```
//!
//! `disconnect()` moves to `Closing` then `Disconnected` from any state,
//! cancels the pending retry timer and makes every later event a no-op.

use std::time::Duration;

use super::{ChannelError, ChannelEvent, ChannelEventKind, ChannelSettings, ConnectionState, Target};
use crate::protocol;

/// Outcome of the existence lookup run before each retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetStatus {
    /// Lookup confirmed the target.
    Exists,
    /// Lookup confirmed the target was deleted.
    Gone,
    /// Lookup failed or timed out. Treated as [`TargetStatus::Exists`].
    Unknown,
}

/// Work the driver must perform on behalf of the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Open a socket to this URL.
    Open(String),
    /// Write a text frame to the open socket.
    Transmit(String),
    /// Close the socket.
    Close,
    /// Start the keepalive ticker.
    StartKeepalive(Duration),
    /// Stop the keepalive ticker.
    StopKeepalive,
    /// Arm the reconnect timer.
    ScheduleReconnect(Duration),
    /// Disarm the reconnect timer.
    CancelReconnect,
    /// Run the existence lookup and report via [`ConnectionManager::on_existence`].
    CheckExistence,
    /// Deliver an event to the consumer.
    Emit(ChannelEventKind),
}

/// What the machine is waiting on while not connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    ExistenceCheck,
    ReconnectTimer,
}

/// Socket-free connection lifecycle for one channel.
#[derive(Debug)]
pub struct ConnectionManager {
    target: Target,
    settings: ChannelSettings,
    state: ConnectionState,
    attempt: u32,
    manual_close: bool,
    keepalive_active: bool,
    pending: Option<Pending>,
    last_error: Option<ChannelError>,
}

impl ConnectionManager {
    /// Create a manager in the `Disconnected` state.
    pub fn new(target: Target, settings: ChannelSettings) -> Self {
        Self {
            target,
            settings,
            state: ConnectionState::Disconnected,
            attempt: 0,
            manual_close: false,
            keepalive_active: false,
            pending: None,
            last_error: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Reconnect attempts made since the last successful open.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Target this channel dials.
    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Last error reported to the consumer.
    pub fn last_error(&self) -> Option<&ChannelError> {
        self.last_error.as_ref()
    }

    /// Whether `disconnect()` was called.
    pub fn is_manually_closed(&self) -> bool {
        self.manual_close
    }

    /// Whether the keepalive ticker should be running.
    pub fn keepalive_active(&self) -> bool {
        self.keepalive_active
    }

    /// Whether the machine will never act again without a new `connect()`.
    pub fn is_finished(&self) -> bool {
        self.state == ConnectionState::Disconnected && self.pending.is_none()
    }

    /// Use this session id for every future open.
    pub fn bind_session(&mut self, session_id: &str) {
        if self.target.session_id.as_deref() != Some(session_id) {
            log::debug!("[Channel] {} bound to session {}", self.target.label(), session_id);
            self.target.session_id = Some(session_id.to_string());
        }
    }

    /// Open the channel.
    ///
    /// A no-op while already connecting or connected.
    pub fn connect(&mut self) -> Vec<Effect> {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Connected => {
                log::debug!("[Channel] {} already {:?}", self.target.label(), self.state);
                return Vec::new();
            }
            ConnectionState::Reconnecting
            | ConnectionState::Closing
            | ConnectionState::Disconnected => {}
        }

        let mut effects = Vec::new();
        if self.pending.take() == Some(Pending::ReconnectTimer) {
            effects.push(Effect::CancelReconnect);
        }
        self.manual_close = false;
        self.attempt = 0;
        self.last_error = None;
        self.transition(ConnectionState::Connecting, &mut effects);
        self.open(&mut effects);
        effects
    }

    /// The socket finished opening.
    pub fn on_open(&mut self) -> Vec<Effect> {
        if self.manual_close {
            return vec![Effect::Close];
        }

        log::info!("[Channel] {} connected", self.target.label());
        let mut effects = Vec::new();
        self.attempt = 0;
        self.pending = None;
        self.last_error = None;
        self.transition(ConnectionState::Connected, &mut effects);
        self.keepalive_active = true;
        effects.push(Effect::StartKeepalive(self.settings.keepalive_interval));
        effects
    }

    /// The socket closed without `disconnect()` having been called.
    pub fn on_close(&mut self, code: u16, reason: &str) -> Vec<Effect> {
        if self.manual_close {
            self.state = ConnectionState::Disconnected;
            return Vec::new();
        }
        log::warn!(
            "[Channel] {} closed (code={}, reason={:?})",
            self.target.label(),
            code,
            reason
        );
        self.begin_recovery(None)
    }

    /// The socket reported an error.
    ///
    /// Runs the same existence check as an unexpected close; the close that
    /// usually follows an error joins the same recovery cycle.
    pub fn on_error(&mut self, message: &str) -> Vec<Effect> {
        if self.manual_close {
            return Vec::new();
        }
        log::warn!("[Channel] {} socket error: {}", self.target.label(), message);
        self.begin_recovery(Some(ChannelError::Transport(message.to_string())))
    }

    /// Result of the existence lookup.
    pub fn on_existence(&mut self, status: TargetStatus) -> Vec<Effect> {
        if self.manual_close || self.pending != Some(Pending::ExistenceCheck) {
            log::debug!("[Channel] Ignoring stale existence result {:?}", status);
            return Vec::new();
        }
        self.pending = None;

        let mut effects = Vec::new();
        if status == TargetStatus::Gone {
            log::error!(
                "[Channel] {} no longer exists, abandoning reconnection",
                self.target.label()
            );
            self.fail(ChannelError::TargetGone(self.target.label()), &mut effects);
            return effects;
        }

        if status == TargetStatus::Unknown {
            log::warn!(
                "[Channel] Existence check for {} inconclusive, assuming it still exists",
                self.target.label()
            );
        }

        self.attempt += 1;
        if self.attempt > self.settings.max_reconnect_attempts {
            log::error!(
                "[Channel] {} giving up after {} attempts",
                self.target.label(),
                self.settings.max_reconnect_attempts
            );
            self.fail(
                ChannelError::ExhaustedRetries {
                    attempts: self.settings.max_reconnect_attempts,
                },
                &mut effects,
            );
            return effects;
        }

        let delay = self.settings.reconnect_delay(self.attempt);
        log::info!(
            "[Channel] Reconnecting {} in {}ms (attempt {}/{})",
            self.target.label(),
            delay.as_millis(),
            self.attempt,
            self.settings.max_reconnect_attempts
        );
        self.pending = Some(Pending::ReconnectTimer);
        effects.push(Effect::ScheduleReconnect(delay));
        effects
    }

    /// The reconnect timer fired.
    pub fn on_reconnect_timer(&mut self) -> Vec<Effect> {
        if self.manual_close || self.pending != Some(Pending::ReconnectTimer) {
            log::debug!("[Channel] Ignoring stale reconnect timer");
            return Vec::new();
        }
        self.pending = None;
        let mut effects = Vec::new();
        self.open(&mut effects);
        effects
    }

    /// The keepalive ticker fired.
    pub fn on_keepalive(&mut self) -> Option<Effect> {
        (self.state == ConnectionState::Connected && self.keepalive_active)
            .then(|| Effect::Transmit(protocol::encode_ping()))
    }

    /// Queue a frame for the socket.
    ///
    /// Returns `None` when not connected: frames are never buffered.
    pub fn send(&mut self, frame: String) -> Option<Effect> {
        if self.state == ConnectionState::Connected {
            Some(Effect::Transmit(frame))
        } else {
            log::trace!(
                "[Channel] Dropping frame for {} while {:?}",
                self.target.label(),
                self.state
            );
            None
        }
    }

    /// Intentional teardown. Suppresses every future reconnect.
    pub fn disconnect(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        self.manual_close = true;

        if self.keepalive_active {
            self.keepalive_active = false;
            effects.push(Effect::StopKeepalive);
        }
        if self.pending.take() == Some(Pending::ReconnectTimer) {
            effects.push(Effect::CancelReconnect);
        }

        if self.state == ConnectionState::Disconnected {
            return effects;
        }

        log::info!("[Channel] Disconnecting {}", self.target.label());
        self.transition(ConnectionState::Closing, &mut effects);
        effects.push(Effect::Close);
        self.transition(ConnectionState::Disconnected, &mut effects);
        effects
    }

    fn begin_recovery(&mut self, error: Option<ChannelError>) -> Vec<Effect> {
        let mut effects = Vec::new();

        if self.pending.is_some() {
            log::debug!("[Channel] {} recovery already in progress", self.target.label());
            return effects;
        }
        if self.state == ConnectionState::Disconnected {
            return effects;
        }

        if self.keepalive_active {
            self.keepalive_active = false;
            effects.push(Effect::StopKeepalive);
        }
        self.transition(ConnectionState::Reconnecting, &mut effects);
        if let Some(error) = error {
            self.last_error = Some(error.clone());
            effects.push(Effect::Emit(ChannelEventKind::Failed(error)));
        }
        self.pending = Some(Pending::ExistenceCheck);
        effects.push(Effect::CheckExistence);
        effects
    }

    fn open(&mut self, effects: &mut Vec<Effect>) {
        let token = self.settings.token.as_deref();
        match self.target.endpoint_url(&self.settings.server_url, token) {
            Ok(url) => effects.push(Effect::Open(url)),
            Err(e) => {
                log::error!("[Channel] Cannot build URL for {}: {:#}", self.target.label(), e);
                self.fail(ChannelError::Transport(format!("{e:#}")), effects);
            }
        }
    }

    fn fail(&mut self, error: ChannelError, effects: &mut Vec<Effect>) {
        self.pending = None;
        if self.keepalive_active {
            self.keepalive_active = false;
            effects.push(Effect::StopKeepalive);
        }
        self.transition(ConnectionState::Disconnected, effects);
        self.last_error = Some(error.clone());
        effects.push(Effect::Emit(ChannelEventKind::Failed(error)));
    }

    fn transition(&mut self, next: ConnectionState, effects: &mut Vec<Effect>) {
        if self.state != next {
            log::debug!(
                "[Channel] {} {:?} -> {:?}",
                self.target.label(),
                self.state,
                next
            );
            self.state = next;
            effects.push(Effect::Emit(ChannelEventKind::State(next)));
        }
    }
}

/// Wrap an event kind for a given channel.
pub fn event(channel_id: &str, kind: ChannelEventKind) -> ChannelEvent {
    ChannelEvent {
        channel_id: channel_id.to_string(),
        kind,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> ConnectionManager {
        ConnectionManager::new(
            Target::terminal("c1"),
            ChannelSettings::new("http://localhost:3000", None),
        )
    }

    fn connected() -> ConnectionManager {
        let mut m = manager();
        m.connect();
        m.on_open();
        m
    }

    fn scheduled(effects: &[Effect]) -> Option<Duration> {
        effects.iter().find_map(|e| match e {
            Effect::ScheduleReconnect(d) => Some(*d),
            _ => None,
        })
    }

    fn failed(effects: &[Effect]) -> Option<ChannelError> {
        effects.iter().find_map(|e| match e {
            Effect::Emit(ChannelEventKind::Failed(err)) => Some(err.clone()),
            _ => None,
        })
    }

    #[test]
    fn test_connect_opens_endpoint() {
        let mut m = manager();
        let effects = m.connect();
        assert_eq!(m.state(), ConnectionState::Connecting);
        assert!(effects.contains(&Effect::Open(
            "ws://localhost:3000/ws/containers/c1/terminal".to_string()
        )));
    }

    #[test]
    fn test_connect_twice_is_noop() {
        let mut m = manager();
        m.connect();
        assert!(m.connect().is_empty());
    }

    #[test]
    fn test_open_starts_keepalive_and_resets_attempts() {
        let mut m = manager();
        m.connect();
        let effects = m.on_open();
        assert_eq!(m.state(), ConnectionState::Connected);
        assert!(effects.contains(&Effect::StartKeepalive(Duration::from_secs(30))));
        assert_eq!(m.attempt(), 0);
    }

    #[test]
    fn test_keepalive_sends_ping_only_when_connected() {
        let mut m = connected();
        assert_eq!(
            m.on_keepalive(),
            Some(Effect::Transmit(r#"{"type":"ping"}"#.to_string()))
        );
        m.on_close(1006, "");
        assert_eq!(m.on_keepalive(), None);
    }

    #[test]
    fn test_send_while_disconnected_is_silent_noop() {
        let mut m = manager();
        assert_eq!(m.send("x".to_string()), None);
        assert_eq!(m.state(), ConnectionState::Disconnected);

        m.connect();
        assert_eq!(m.send("x".to_string()), None);
        assert_eq!(m.state(), ConnectionState::Connecting);
    }

    #[test]
    fn test_send_while_connected_transmits() {
        let mut m = connected();
        assert_eq!(
            m.send("x".to_string()),
            Some(Effect::Transmit("x".to_string()))
        );
    }

    #[test]
    fn test_unexpected_close_checks_existence_first() {
        let mut m = connected();
        let effects = m.on_close(1006, "abnormal");
        assert_eq!(m.state(), ConnectionState::Reconnecting);
        assert!(effects.contains(&Effect::StopKeepalive));
        assert!(effects.contains(&Effect::CheckExistence));
        assert_eq!(scheduled(&effects), None);
    }

    #[test]
    fn test_target_gone_abandons_reconnection() {
        let mut m = connected();
        m.on_close(1006, "");
        let effects = m.on_existence(TargetStatus::Gone);
        assert_eq!(
            failed(&effects),
            Some(ChannelError::TargetGone("terminal:c1".to_string()))
        );
        assert_eq!(scheduled(&effects), None);
        assert_eq!(m.state(), ConnectionState::Disconnected);
        assert!(m.is_finished());
        assert!(m.on_reconnect_timer().is_empty());
    }

    #[test]
    fn test_inconclusive_check_is_fail_open() {
        let mut m = connected();
        m.on_error("connection reset");
        let effects = m.on_existence(TargetStatus::Unknown);
        assert_eq!(scheduled(&effects), Some(Duration::from_millis(1000)));
    }

    #[test]
    fn test_error_then_close_is_one_recovery_cycle() {
        let mut m = connected();
        let first = m.on_error("reset");
        assert!(first.contains(&Effect::CheckExistence));
        assert!(matches!(failed(&first), Some(ChannelError::Transport(_))));
        let second = m.on_close(1006, "");
        assert!(second.is_empty());
    }

    #[test]
    fn test_six_consecutive_closes_exhaust_retries() {
        let mut m = connected();
        let mut delays = Vec::new();

        for _ in 0..6 {
            let close = m.on_close(1006, "");
            assert!(close.contains(&Effect::CheckExistence));
            let effects = m.on_existence(TargetStatus::Exists);
            match scheduled(&effects) {
                Some(delay) => {
                    delays.push(delay.as_millis());
                    let reopen = m.on_reconnect_timer();
                    assert!(matches!(reopen.first(), Some(Effect::Open(_))));
                }
                None => {
                    assert_eq!(
                        failed(&effects),
                        Some(ChannelError::ExhaustedRetries { attempts: 5 })
                    );
                }
            }
        }

        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000]);
        assert_eq!(m.state(), ConnectionState::Disconnected);
        assert!(m.is_finished());
        assert!(m.on_reconnect_timer().is_empty());
    }

    #[test]
    fn test_successful_reopen_resets_backoff() {
        let mut m = connected();
        m.on_close(1006, "");
        m.on_existence(TargetStatus::Exists);
        m.on_reconnect_timer();
        m.on_open();
        assert_eq!(m.attempt(), 0);

        m.on_close(1006, "");
        let effects = m.on_existence(TargetStatus::Exists);
        assert_eq!(scheduled(&effects), Some(Duration::from_millis(1000)));
    }

    #[test]
    fn test_disconnect_cancels_pending_timer() {
        let mut m = connected();
        m.on_close(1006, "");
        m.on_existence(TargetStatus::Exists);

        let effects = m.disconnect();
        assert!(effects.contains(&Effect::CancelReconnect));
        assert!(m.is_manually_closed());
        assert_eq!(m.state(), ConnectionState::Disconnected);

        assert!(m.on_reconnect_timer().is_empty());
        assert!(m.on_existence(TargetStatus::Exists).is_empty());
    }

    #[test]
    fn test_disconnect_while_connected_closes_socket() {
        let mut m = connected();
        let effects = m.disconnect();
        assert!(effects.contains(&Effect::StopKeepalive));
        assert!(effects.contains(&Effect::Close));
        assert!(effects.contains(&Effect::Emit(ChannelEventKind::State(
            ConnectionState::Closing
        ))));
        assert!(m.on_close(1000, "").is_empty());
        assert!(m.on_error("late").is_empty());
    }

    #[test]
    fn test_existence_result_during_check_then_disconnect_is_ignored() {
        let mut m = connected();
        m.on_close(1006, "");
        m.disconnect();
        assert!(m.on_existence(TargetStatus::Exists).is_empty());
        assert!(m.is_finished());
    }

    #[test]
    fn test_bound_session_is_used_on_reopen() {
        let mut m = connected();
        m.bind_session("abc123");
        m.on_close(1006, "");
        m.on_existence(TargetStatus::Exists);
        let effects = m.on_reconnect_timer();
        assert_eq!(
            effects,
            vec![Effect::Open(
                "ws://localhost:3000/ws/containers/c1/terminal?session_id=abc123".to_string()
            )]
        );
    }

    #[test]
    fn test_reconnect_after_fatal_error_starts_fresh() {
        let mut m = connected();
        m.on_close(1006, "");
        m.on_existence(TargetStatus::Gone);
        let effects = m.connect();
        assert!(matches!(effects.last(), Some(Effect::Open(_))));
        assert!(m.last_error().is_none());
        assert_eq!(m.attempt(), 0);
    }

    #[test]
    fn test_open_after_disconnect_closes_immediately() {
        let mut m = manager();
        m.connect();
        m.disconnect();
        assert_eq!(m.on_open(), vec![Effect::Close]);
    }
}
