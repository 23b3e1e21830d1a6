//! Interactive terminal sessions.
//!
//! Each session has its own stream socket, separate from the shared RPC
//! socket, and a remote process started through the provisioning channel.

pub mod frames;
pub mod mux;
pub mod provision;

pub use frames::{ClientFrame, ServerFrame, CLAUDE_SESSION, OAUTH_TOKEN, RATE_LIMIT};
pub use mux::{SessionInfo, TerminalMux};
pub use provision::{HttpProvisioner, Provisioner, SessionOptions};
