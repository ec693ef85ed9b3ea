//! Protocol constants for the session channel.
//!
//! Centralizes the timing and retry numbers shared by the connection manager,
//! the multiplexer and the front-end so they can be found in one place.
//!
//! # Categories
//!
//! - **Keepalive**: ping cadence on an open channel
//! - **Reconnect**: backoff base, attempt ceiling and existence-check bound
//! - **Layout**: refit debounce for the tab multiplexer
//! - **History**: headless pagination page size
//! - **Storage**: durable key prefix for the session registry

use std::time::Duration;

// ============================================================================
// Keepalive
// ============================================================================

/// Interval between application-level `ping` envelopes on a connected channel.
///
/// There is no pong deadline; a dead socket is detected by the transport's
/// own close event.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

// ============================================================================
// Reconnect
// ============================================================================

/// Delay before the first reconnect attempt. Attempt `k` waits
/// `RECONNECT_BASE_DELAY * 2^(k-1)`.
pub const RECONNECT_BASE_DELAY: Duration = Duration::from_millis(1000);

/// Number of reconnect attempts before the channel gives up.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Upper bound on the container / conversation existence lookup.
///
/// An inconclusive lookup counts as "still exists".
pub const EXISTENCE_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP request timeout for collaborator REST calls.
pub const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Layout
// ============================================================================

/// Quiet period after a layout change before every tab is refit.
pub const REFIT_DEBOUNCE: Duration = Duration::from_millis(150);

// ============================================================================
// History
// ============================================================================

/// Turns requested per headless `load_more` page when no limit is given.
pub const HISTORY_PAGE_SIZE: u32 = 20;

// ============================================================================
// Storage
// ============================================================================

/// Namespace prefix for every durable storage key written by this crate.
pub const STORAGE_PREFIX: &str = "sessionwire";

