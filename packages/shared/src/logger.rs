//! Logging setup utilities for the Hiroba binaries.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Library crates whose spans and events are enabled at the default level.
const WORKSPACE_CRATES: [&str; 3] = ["hiroba_shared", "hiroba_server", "hiroba_client"];

/// Build the filter directive used when `RUST_LOG` is not set.
///
/// Every workspace crate and the binary itself are enabled at
/// `default_log_level`; everything else stays at the subscriber default.
pub fn default_filter(binary_name: &str, default_log_level: &str) -> String {
    let binary_target = binary_name.replace('-', "_");
    let mut directives: Vec<String> = WORKSPACE_CRATES
        .iter()
        .map(|krate| format!("{}={}", krate, default_log_level))
        .collect();
    if !WORKSPACE_CRATES.contains(&binary_target.as_str()) {
        directives.push(format!("{}={}", binary_target, default_log_level));
    }
    directives.join(",")
}

/// Initialize the tracing subscriber with the specified default log level.
///
/// The log level can be overridden using the `RUST_LOG` environment variable.
///
/// # Arguments
///
/// * `binary_name` - The name of the binary (e.g., "hiroba-server")
/// * `default_log_level` - The default log level (e.g., "debug", "info")
///
/// # Examples
///
/// ```no_run
/// use hiroba_shared::logger::setup_logger;
///
/// setup_logger("hiroba-server", "debug");
/// ```
pub fn setup_logger(binary_name: &str, default_log_level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter(binary_name, default_log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
