//! Request/response over the shared socket.
//!
//! - [`pending`]: the correlation table
//! - [`client`]: the façade every domain module calls

pub mod client;
pub mod pending;

pub use client::{CallOptions, NotifyErrorHook, RpcClient, RpcClientBuilder};
pub use pending::PendingTable;
