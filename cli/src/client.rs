use std::time::Duration;

use clap::Args;
use haru_ws::{client, close::CloseCode, Connection, Message, Options, WebSocketError};
use rustyline::ExternalPrinter;
use tokio::{
    runtime,
    sync::mpsc::{unbounded_channel, UnboundedReceiver},
};
use url::Url;

/// Command to connect and interact with a WebSocket server.
///
/// This command establishes a WebSocket client connection to a server and allows sending
/// messages and receiving responses interactively. Only plaintext WebSocket (ws://) URLs
/// are supported.
#[derive(Args)]
#[command(alias = "c")]
pub struct Cmd {
    /// Maximum duration to wait when establishing the connection.
    /// Accepts human-readable formats like "5s", "1m", "500ms".
    #[arg(short, long, value_parser = humantime::parse_duration, default_value = "5s")]
    timeout: Duration,

    /// When enabled, validates and pretty-prints received messages as JSON.
    #[arg(long)]
    input_as_json: bool,

    /// Largest message accepted from the server, in bytes.
    #[arg(long, default_value_t = haru_ws::MAX_MESSAGE_SIZE)]
    max_message_size: usize,

    /// The WebSocket URL to connect to (ws://)
    url: Url,
}

pub fn run(cmd: Cmd) -> anyhow::Result<()> {
    let history_path = home::home_dir()
        .ok_or(anyhow::anyhow!("unable to determine home path"))?
        .join(".hwsc_history");

    // Handle user input with history
    let mut rl = rustyline::DefaultEditor::with_config(
        rustyline::Config::builder()
            .auto_add_history(true)
            .completion_type(rustyline::CompletionType::List)
            .max_history_size(1000)?
            .build(),
    )?;
    // ignore the error
    let _ = rl.load_history(&history_path);
    let printer = rl.create_external_printer()?;

    let runtime = runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let _guard = runtime.enter();

    let (tx, rx) = unbounded_channel();

    let options = Options::default()
        .with_handshake_timeout(cmd.timeout)
        .with_max_message_size(cmd.max_message_size);
    let ws = runtime.block_on(client::connect(cmd.url.clone(), options))?;

    println!("> Connected to {}", cmd.url);

    let opts = Opts {
        input_as_json: cmd.input_as_json,
    };

    runtime.spawn_blocking(move || loop {
        let readline = rl.readline("> ");
        match readline {
            Ok(mut line) => {
                let _ = rl.add_history_entry(line.as_str());
                // commented line
                if let Some(pos) = line.rfind("//") {
                    let _ = line.split_off(pos);
                }

                if tx.send(line).is_err() {
                    break;
                }
            }
            Err(_) => {
                if let Err(err) = rl.save_history(&history_path) {
                    eprintln!("unable to save history: {err}");
                }
                break;
            }
        }
    });
    runtime.block_on(handle_websocket(ws, rx, printer, opts));

    runtime.shutdown_background();

    Ok(())
}

struct Opts {
    input_as_json: bool,
}

async fn handle_websocket(
    ws: Connection,
    mut rx: UnboundedReceiver<String>,
    mut printer: impl ExternalPrinter,
    opts: Opts,
) {
    loop {
        tokio::select! {
            line = rx.recv() => {
                let Some(line) = line else {
                    break;
                };

                if let Err(err) = ws.send(line).await {
                    let _ = printer.print(format!("unable to write: {err}"));
                }
            }
            message = ws.recv(None) => {
                let message = match message {
                    Ok(message) => message,
                    Err(WebSocketError::ConnectionClosed { code, reason }) => {
                        let _ = printer.print(format!(
                            "<Disconnected: {} {}>",
                            code.unwrap_or(1006),
                            reason.unwrap_or_default()
                        ));
                        break;
                    }
                    Err(err) => {
                        let _ = printer.print(format!("<Error: {err}>"));
                        break;
                    }
                };

                match message {
                    Message::Text(text) if opts.input_as_json => {
                        match serde_json::from_str::<serde_json::Value>(&text) {
                            Ok(ok) => {
                                let _ = printer.print(format!("{:#}", ok));
                            }
                            Err(err) => {
                                let _ = printer.print(format!("parsing json: {}", err));
                            }
                        }
                    }
                    Message::Text(text) => {
                        let _ = printer.print(text);
                    }
                    Message::Binary(data) => {
                        let _ = printer.print(format!("<Binary, {} bytes>", data.len()));
                    }
                }
            }
        }
    }

    let _ = ws.close(CloseCode::Normal, "").await;
}
