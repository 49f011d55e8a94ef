//! Hiroba relay client.
//!
//! [`RelayClient`] opens one connection to a relay, delivers every message
//! the relay sends to a [`MessageListener`] from a background task, and lets
//! the caller send messages of its own.

pub mod client;
pub mod error;
pub mod formatter;
pub mod listener;
pub mod session;
pub mod ui;

pub use client::RelayClient;
pub use error::ClientError;
pub use listener::MessageListener;
