//! Centralized default constants for the praxis system.
//!
//! **This module is the single source of truth** for all shared default
//! values. All crates reference these constants instead of defining their
//! own magic numbers.
//!
//! Organized by domain area. When adding new constants, place them in the
//! appropriate section and document the rationale for the chosen value.

// =============================================================================
// EVENT BUS
// =============================================================================

/// Default event bus broadcast channel capacity.
///
/// A subscriber that falls more than this many events behind is lagged and
/// misses events; consumers reconcile by re-fetching state. 256 absorbs any
/// realistic burst of row mutations while keeping per-subscriber memory
/// bounded.
pub const EVENT_BUS_CAPACITY: usize = 256;

// =============================================================================
// STREAM SERVER
// =============================================================================

/// Default HTTP server port.
pub const SERVER_PORT: u16 = 3030;

/// Default CORS max-age in seconds (1 hour).
pub const CORS_MAX_AGE_SECS: u64 = 3600;

/// Per-connection outbound buffer in frames.
///
/// A client that cannot drain this many frames is considered dead and is
/// scheduled for removal; delivery to other connections is unaffected.
pub const CONNECTION_BUFFER: usize = 64;

/// Interval between server-initiated pings on streaming connections.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// Window without a heartbeat ack before a connection is pruned.
///
/// Three missed pings: half-open transports are detected within ~90s while
/// a single delayed ack never kills a healthy connection.
pub const HEARTBEAT_TIMEOUT_SECS: u64 = 90;

/// Interval between SSE keep-alive comments.
pub const SSE_KEEPALIVE_SECS: u64 = 15;

// =============================================================================
// UPSTREAM LISTENER
// =============================================================================

/// Base delay between upstream reconnect attempts in milliseconds.
///
/// Attempt N waits `N * base`, capped at [`LISTENER_BACKOFF_CAP_SECS`].
/// The upstream LISTEN connection is the only event source for the whole
/// process, so the first retries come fast.
pub const LISTENER_BACKOFF_BASE_MS: u64 = 500;

/// Ceiling on the upstream reconnect delay in seconds.
pub const LISTENER_BACKOFF_CAP_SECS: u64 = 30;

// =============================================================================
// CLIENT TRANSPORT
// =============================================================================

/// Default maximum client reconnect attempts before reporting a terminal
/// disconnected state.
pub const CLIENT_MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Base client reconnect delay in milliseconds.
///
/// Linear backoff: attempt N waits `N * base`. With the default attempt
/// bound this gives up after roughly a minute of cumulative waiting.
pub const CLIENT_RECONNECT_BASE_MS: u64 = 1000;

/// Client-side outbound send buffer in messages.
///
/// Outbound traffic is sparse (the stream is server-to-client); this only
/// has to absorb a short burst while the socket flushes.
pub const CLIENT_SEND_BUFFER: usize = 16;
