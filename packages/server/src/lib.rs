//! Hiroba relay server.
//!
//! Accepts any number of TCP connections and fans every message received on
//! any of them out to all currently registered connections, the sender
//! included.
//!
//! Module overview:
//! - `registry`: concurrency-safe set of live connections with snapshot
//!   broadcast.
//! - `handler`: per-connection read loop and writer task.
//! - `network`: address the relay is reachable at.
//! - `server`: listening endpoint, accept loop and shutdown.
//! - `signal`: Ctrl+C / SIGTERM handling for the operator console.

pub mod error;
pub mod handler;
pub mod network;
pub mod registry;
pub mod server;
pub mod signal;

pub use error::{PushError, ServerError};
pub use registry::{ConnectionEntry, ConnectionId, Registry};
pub use server::{RelayServer, ServerConfig};
