//! Error types for the relay server.

use std::io;

use thiserror::Error;

/// Server-specific errors
#[derive(Debug, Error)]
pub enum ServerError {
    /// The listening endpoint could not be bound (port in use, bad address)
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// `start()` was called while the server is already listening
    #[error("Server is already running")]
    AlreadyRunning,
}

/// Failure to hand a message to one connection's writer
#[derive(Debug, Error)]
pub enum PushError {
    /// The connection's writer has already stopped
    #[error("Connection {0} is closed")]
    Closed(crate::registry::ConnectionId),
}
