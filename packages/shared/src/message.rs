//! Chat message model.

use serde::{Deserialize, Serialize};

/// Sender name reserved for notices authored by the relay itself.
pub const SYSTEM_SENDER: &str = "Server";

/// The unit of communication relayed between participants.
///
/// Messages carry no identity beyond their fields: two messages with the
/// same sender and body are indistinguishable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub sender: String,
    pub body: String,
}

impl ChatMessage {
    pub fn new(sender: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            body: body.into(),
        }
    }

    /// Build a notice authored by the relay (join / shutdown announcements).
    pub fn system(body: impl Into<String>) -> Self {
        Self::new(SYSTEM_SENDER, body)
    }

    pub fn is_system(&self) -> bool {
        self.sender == SYSTEM_SENDER
    }
}
