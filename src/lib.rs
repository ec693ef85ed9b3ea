//! Sessionwire - realtime session channels for remote containers.
//!
//! This crate is the client side of the realtime channel between a
//! front-end and the shells and agent conversations running in managed
//! containers. It opens and maintains the sockets, survives disconnects,
//! replays scrollback and turn history, and remembers which terminal
//! sessions each tab was attached to.
//!
//! # Architecture
//!
//! ```text
//!  Multiplexer ──► TerminalAdapter ─┐
//!                                   ├─► protocol ─► ChannelHandle ─► socket task
//!  HeadlessSession ─────────────────┘                    ▲      (ConnectionManager)
//!                                                        │
//!  SessionRegistry ◄── session assignments      ChannelEvent queue
//! ```
//!
//! # Modules
//!
//! - [`channel`] - Connection lifecycle, reconnect policy and socket driver
//! - [`protocol`] - Terminal and headless envelopes
//! - [`registry`] - Tab to session persistence
//! - [`history`] - Scrollback replay progress
//! - [`terminal`] - One tab's terminal session
//! - [`headless`] - Turn-based agent conversations
//! - [`multiplexer`] - The tab set for one container
//! - [`api`] - Existence lookups against the REST API
//! - [`config`] - Configuration loading/saving

pub mod api;
pub mod auth;
pub mod channel;
pub mod config;
pub mod constants;
pub mod headless;
pub mod history;
pub mod multiplexer;
pub mod protocol;
pub mod registry;
pub mod terminal;
pub mod ws;

// Re-export commonly used types
pub use api::{ApiClient, ApiProbe, TargetProbe};
pub use channel::{
    spawn_channel, ChannelError, ChannelEvent, ChannelEventKind, ChannelHandle, ChannelLink,
    ChannelSettings, ConnectionState, Indicator, Target,
};
pub use config::Config;
pub use headless::{AttachMode, HeadlessSession, HeadlessState, HeadlessUpdate};
pub use multiplexer::{ChannelFactory, Multiplexer, Removal};
pub use registry::{FileStorage, MemoryStorage, SessionRegistry};
pub use terminal::{TerminalAdapter, TerminalEvent, TerminalSink};
