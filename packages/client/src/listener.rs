//! Message delivery callback.

use hiroba_shared::ChatMessage;

/// Receives every message the relay delivers to a [`crate::RelayClient`].
///
/// Called on the client's receive task, never on the caller's task, one
/// message at a time in arrival order. Any `Fn(ChatMessage)` closure that is
/// `Send + Sync + 'static` is a listener.
#[cfg_attr(test, mockall::automock)]
pub trait MessageListener: Send + Sync + 'static {
    fn on_message(&self, message: ChatMessage);
}

impl<F> MessageListener for F
where
    F: Fn(ChatMessage) + Send + Sync + 'static,
{
    fn on_message(&self, message: ChatMessage) {
        self(message)
    }
}
