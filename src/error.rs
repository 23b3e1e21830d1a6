//! Error taxonomy for the transport core.
//!
//! Transport-level failures (`NotConnected`, `Disconnected`, `Timeout`,
//! `Cancelled`) are local to the call they reject. `Remote` carries the
//! backend's message text untouched. `MalformedFrame` exists so parsers can
//! report what went wrong, but the connection only ever logs it.

use std::time::Duration;

/// Errors surfaced by the transport, RPC and terminal layers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// A frame was submitted while the socket was not open.
    #[error("not connected")]
    NotConnected,

    /// The connection dropped while the request was pending.
    #[error("connection lost before a response arrived")]
    Disconnected,

    /// The caller-supplied deadline elapsed with no response.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The caller cancelled the request before a response arrived.
    #[error("request cancelled")]
    Cancelled,

    /// The response envelope carried an `error` field.
    #[error("{0}")]
    Remote(String),

    /// An inbound frame could not be parsed.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// A topic template or regex failed to compile.
    #[error("invalid topic pattern: {0}")]
    InvalidPattern(String),

    /// `create` was called for a session id that is already registered.
    #[error("terminal session '{0}' already exists")]
    SessionExists(String),

    /// No open session is registered under this id.
    #[error("unknown terminal session '{0}'")]
    UnknownSession(String),

    /// The provisioning side channel rejected or failed the request.
    #[error("terminal provisioning failed: {0}")]
    Provisioning(String),

    /// The session's dedicated stream never reached the open state.
    #[error("terminal session '{id}' failed to open: {reason}")]
    SessionOpenFailed {
        /// Session that failed.
        id: String,
        /// Why the stream did not open.
        reason: String,
    },

    /// The connection's outbound queue is full; the frame was not accepted.
    #[error("outbound queue full")]
    QueueFull,

    /// An outbound frame could not be serialized.
    #[error("failed to encode frame: {0}")]
    Encode(String),
}

impl Error {
    /// Whether this error came from the transport rather than the backend.
    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::NotConnected | Self::Disconnected | Self::Timeout(_) | Self::Cancelled
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Encode(e.to_string())
    }
}

/// Result alias used throughout the library.
pub type Result<T, E = Error> = std::result::Result<T, E>;
