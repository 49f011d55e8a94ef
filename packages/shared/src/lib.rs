//! Shared building blocks for the Hiroba relay.
//!
//! Both the relay server and the client speak the same wire format, so the
//! message model and its codec live here together with the logging setup
//! used by the binaries.

pub mod codec;
pub mod logger;
pub mod message;
pub mod time;

pub use codec::{DecodeError, MAX_FRAME_LEN, MessageReader, MessageWriter, encode};
pub use message::{ChatMessage, SYSTEM_SENDER};
