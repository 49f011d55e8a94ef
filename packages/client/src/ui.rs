//! UI utilities for the client.

use std::io::Write;

/// Redisplay the prompt after printing a received message
pub fn redisplay_prompt(name: &str) {
    print!("{}> ", name);
    std::io::stdout().flush().ok();
}
