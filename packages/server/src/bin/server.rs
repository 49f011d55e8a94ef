//! Hiroba relay server (operator console).
//!
//! Accepts TCP connections and broadcasts every message it receives to all
//! connected clients, the sender included.
//!
//! Run with:
//! ```not_rust
//! cargo run --bin hiroba-server
//! cargo run --bin hiroba-server -- --host 127.0.0.1 --port 12345
//! ```

use std::time::Duration;

use clap::Parser;

use hiroba_server::{RelayServer, ServerConfig, network::reachable_addr, signal::shutdown_signal};
use hiroba_shared::logger::setup_logger;

#[derive(Parser, Debug)]
#[command(name = "hiroba-server")]
#[command(about = "TCP chat relay that broadcasts every message to every client", long_about = None)]
struct Args {
    /// Host address to bind the server to
    #[arg(short = 'H', long, default_value = "0.0.0.0")]
    host: String,

    /// Port number to bind the server to
    #[arg(short = 'p', long, default_value_t = 8080, value_parser = clap::value_parser!(u16).range(1..))]
    port: u16,

    /// Do not announce newly connected participants
    #[arg(long)]
    no_join_notice: bool,

    /// Seconds between connected-client reports (0 disables them)
    #[arg(long, default_value_t = 10)]
    status_interval: u64,
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    setup_logger(env!("CARGO_BIN_NAME"), "debug");

    let args = Args::parse();

    let server = RelayServer::new(ServerConfig {
        host: args.host,
        announce_joins: !args.no_join_notice,
    });

    let bound = match server.start(args.port).await {
        Ok(bound) => bound,
        Err(e) => {
            tracing::error!("Server error: {}", e);
            std::process::exit(1);
        }
    };
    tracing::info!("Clients can connect to {}", reachable_addr(bound));
    tracing::info!("Press Ctrl+C to shutdown gracefully");

    tokio::select! {
        _ = shutdown_signal() => {}
        _ = report_status(&server, Duration::from_secs(args.status_interval)) => {}
    }

    server.stop().await;
    tracing::info!("Server shutdown complete");
}

/// Log the connected-client count whenever it changes.
async fn report_status(server: &RelayServer, every: Duration) {
    if every.is_zero() {
        std::future::pending::<()>().await;
    }

    let mut ticker = tokio::time::interval(every);
    let mut last_reported = None;
    loop {
        ticker.tick().await;
        let count = server.connected_clients().await;
        if last_reported != Some(count) {
            tracing::info!("Connected clients: {}", count);
            last_reported = Some(count);
        }
    }
}
