//! Autowire - real-time transport core for the dev-automation client.
//!
//! One multiplexed socket to the backend carries request/response RPC and
//! server-pushed events. Interactive terminals each get a dedicated socket.
//!
//! # Architecture
//!
//! - **Connection** - one physical socket with liveness and reconnection
//! - **RPC** - correlation table and the `call`/`notify` façade
//! - **Events** - topic router with exact, wildcard and parameterized filters
//! - **Terminal** - session multiplexer over per-session stream sockets
//! - **Transport** - service object composing the above with `start`/`stop`
//!
//! # Modules
//!
//! - [`connection`] - socket lifecycle and reconnect policy
//! - [`rpc`] - request correlation and the RPC façade
//! - [`events`] - event routing and topic patterns
//! - [`terminal`] - terminal sessions and provisioning
//! - [`config`] - configuration loading/saving

pub mod config;
pub mod connection;
pub mod constants;
pub mod envelope;
pub mod error;
pub mod events;
pub mod listeners;
pub mod rpc;
pub mod terminal;
pub mod transport;
pub mod ws;

// Re-export commonly used types
pub use config::Config;
pub use connection::{ConnectOptions, Connection, ConnectionEvent, ConnectionState, ReconnectPolicy};
pub use envelope::{CorrelationId, Envelope, EnvelopeKind};
pub use error::{Error, Result};
pub use events::{Event, EventRouter, TopicFilter, TopicPattern};
pub use listeners::Subscription;
pub use rpc::{CallOptions, RpcClient};
pub use terminal::{SessionInfo, SessionOptions, TerminalMux};
pub use transport::Transport;
