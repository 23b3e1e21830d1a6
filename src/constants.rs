//! Application-wide constants for autowire.
//!
//! Centralizes the default delays, timeouts, queue sizes and socket paths so
//! the config layer and the tests agree on them.

use std::time::Duration;

// ============================================================================
// Addresses
// ============================================================================

/// Backend address used when no base URL is configured and the page origin is local.
pub const DEFAULT_BASE_URL: &str = "http://localhost:8000";

/// Path of the shared RPC/event socket.
pub const DEFAULT_RPC_PATH: &str = "/ws";

/// Path template of a terminal session's dedicated stream socket.
pub const DEFAULT_TERMINAL_WS_PATH: &str = "/ws/terminal/{id}";

/// Path template of the terminal provisioning endpoint.
pub const DEFAULT_TERMINAL_API_PATH: &str = "/api/terminal/{id}";

// ============================================================================
// Timeouts & delays
// ============================================================================

/// Delay before reconnecting after an unexpected close (default policy retries
/// forever at this interval).
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// How long `create` waits for a session stream to reach the open state.
pub const SESSION_OPEN_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP timeout for provisioning calls.
pub const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Channel capacities
// ============================================================================

/// Frames a connection queues for its socket before `send_text` fails with
/// `QueueFull`.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Connection events buffered ahead of a slow consumer. A full queue pauses
/// reading from the socket.
pub const EVENT_QUEUE_CAPACITY: usize = 256;

// ============================================================================
// Terminal defaults
// ============================================================================

/// Default terminal width sent with a new session.
pub const DEFAULT_COLS: u16 = 80;

/// Default terminal height sent with a new session.
pub const DEFAULT_ROWS: u16 = 24;
