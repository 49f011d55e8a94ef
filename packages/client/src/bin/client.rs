//! Hiroba chat client (end-user console).
//!
//! Connects to a Hiroba relay, prints every message the relay broadcasts and
//! sends each line typed on stdin under the given name.
//!
//! Run with:
//! ```not_rust
//! cargo run --bin hiroba-client -- --name alice
//! cargo run --bin hiroba-client -- -H 192.168.0.10 -p 12345 -n bob
//! ```

use clap::Parser;

use hiroba_client::session::run_client_session;
use hiroba_shared::logger::setup_logger;

#[derive(Parser, Debug)]
#[command(name = "hiroba-client")]
#[command(about = "Chat client for the Hiroba TCP broadcast relay", long_about = None)]
struct Args {
    /// Name shown as the sender of your messages
    #[arg(short = 'n', long, value_parser = parse_name)]
    name: String,

    /// Relay host
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Relay port
    #[arg(short = 'p', long, default_value_t = 8080, value_parser = clap::value_parser!(u16).range(1..))]
    port: u16,
}

fn parse_name(raw: &str) -> Result<String, String> {
    let name = raw.trim();
    if name.is_empty() {
        return Err("name must not be empty".to_string());
    }
    Ok(name.to_string())
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    setup_logger(env!("CARGO_BIN_NAME"), "info");

    let args = Args::parse();

    if let Err(e) = run_client_session(&args.host, args.port, &args.name).await {
        tracing::error!("Client error: {}", e);
        std::process::exit(1);
    }
}
