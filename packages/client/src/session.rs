//! Interactive console session.

use hiroba_shared::{ChatMessage, time::now_local};
use rustyline::{DefaultEditor, error::ReadlineError};
use tokio::sync::mpsc;

use crate::{
    client::RelayClient, error::ClientError, formatter::MessageFormatter, ui::redisplay_prompt,
};

/// Run an interactive session: print every relayed message and send every
/// line typed by the user as `name`.
///
/// Returns `Ok(())` when the user ends input (Ctrl+C / Ctrl+D) and
/// `Err(ClientError::ConnectionLost)` when the relay closes the connection.
pub async fn run_client_session(host: &str, port: u16, name: &str) -> Result<(), ClientError> {
    let prompt_name = name.to_string();
    let client = RelayClient::connect(host, port, move |message: ChatMessage| {
        print!(
            "{}",
            MessageFormatter::format_message(&message, &now_local())
        );
        redisplay_prompt(&prompt_name);
    })
    .await?;

    print!("{}", MessageFormatter::format_welcome(name, host, port));
    redisplay_prompt(name);

    let mut input_rx = spawn_readline(name.to_string());

    loop {
        tokio::select! {
            line = input_rx.recv() => match line {
                Some(line) => {
                    if let Err(e) = client.send_message(name, &line).await {
                        tracing::warn!("Failed to send message: {}", e);
                        client.disconnect().await;
                        return Err(e);
                    }
                }
                None => {
                    client.disconnect().await;
                    return Ok(());
                }
            },
            _ = client.closed() => {
                print!("{}", MessageFormatter::format_connection_lost());
                return Err(ClientError::ConnectionLost);
            }
        }
    }
}

/// Read lines on a dedicated thread (rustyline is synchronous) and forward
/// every non-empty trimmed line. The channel closes when input ends.
fn spawn_readline(name: String) -> mpsc::UnboundedReceiver<String> {
    let (input_tx, input_rx) = mpsc::unbounded_channel::<String>();

    std::thread::spawn(move || {
        let mut rl = match DefaultEditor::new() {
            Ok(rl) => rl,
            Err(e) => {
                tracing::error!("Failed to initialize readline: {}", e);
                return;
            }
        };

        let prompt = format!("{}> ", name);

        loop {
            match rl.readline(&prompt) {
                Ok(line) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    rl.add_history_entry(line).ok();
                    if input_tx.send(line.to_string()).is_err() {
                        // Session ended
                        break;
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    tracing::info!("Interrupted");
                    break;
                }
                Err(ReadlineError::Eof) => {
                    tracing::info!("EOF");
                    break;
                }
                Err(err) => {
                    tracing::error!("Readline error: {}", err);
                    break;
                }
            }
        }
    });

    input_rx
}
