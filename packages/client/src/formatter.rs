//! Message formatting utilities for client display.

use chrono::{DateTime, FixedOffset};
use hiroba_shared::{ChatMessage, time::format_time_of_day};

/// Message formatter for client display
pub struct MessageFormatter;

impl MessageFormatter {
    /// Format a received message as `[HH:MM:SS] sender: body`.
    ///
    /// Notices authored by the relay are marked with `*` instead of a sender.
    pub fn format_message(message: &ChatMessage, received_at: &DateTime<FixedOffset>) -> String {
        let time = format_time_of_day(received_at);
        if message.is_system() {
            format!("\n[{}] * {}\n", time, message.body)
        } else {
            format!("\n[{}] {}: {}\n", time, message.sender, message.body)
        }
    }

    /// Format the banner shown once the connection is established.
    pub fn format_welcome(name: &str, host: &str, port: u16) -> String {
        format!(
            "\n============================================================\n\
             Connected to {}:{} as '{}'.\n\
             Type messages and press Enter to send. Press Ctrl+C to exit.\n\
             ============================================================\n",
            host, port, name
        )
    }

    /// Format the notice shown when the relay closes the connection.
    pub fn format_connection_lost() -> String {
        "\n- Connection closed by the relay\n".to_string()
    }
}
