//! Error types for the relay client.

use std::io;

use thiserror::Error;

/// Client-specific errors
#[derive(Debug, Error)]
pub enum ClientError {
    /// The relay could not be reached
    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// A message was sent while no connection is open
    #[error("Not connected to a relay")]
    NotConnected,

    /// The transport rejected the write
    #[error("Failed to send message: {0}")]
    Write(#[source] io::Error),

    /// The relay closed the connection while the session was active
    #[error("Connection closed by the relay")]
    ConnectionLost,
}
