use std::{net::SocketAddr, time::Duration};

use clap::Args;
use haru_ws::{Connection, Options, RateLimit, Server, ServerConfig};
use tokio::runtime;

/// Runs an echo server.
///
/// Every text or binary message is sent back unchanged. Ctrl+C closes all connections
/// with 1001 and stops the server.
#[derive(Args)]
#[command(alias = "s")]
pub struct Cmd {
    /// Address to listen on.
    #[arg(short, long, default_value = "127.0.0.1:8765")]
    addr: SocketAddr,

    /// Only accept connections to this path. Every path is accepted when omitted.
    #[arg(short, long)]
    path: Option<String>,

    /// Maximum number of concurrent connections.
    #[arg(long, default_value_t = haru_ws::MAX_CONNECTIONS)]
    max_connections: usize,

    /// Largest message accepted from a client, in bytes.
    #[arg(long, default_value_t = haru_ws::MAX_MESSAGE_SIZE)]
    max_message_size: usize,

    /// Time allowed for the opening handshake, e.g. "10s".
    #[arg(long, value_parser = humantime::parse_duration, default_value = "30s")]
    handshake_timeout: Duration,

    /// Time given to open connections on shutdown, e.g. "5s".
    #[arg(long, value_parser = humantime::parse_duration, default_value = "5s")]
    shutdown_timeout: Duration,

    /// Maximum messages each connection may send per second.
    #[arg(long)]
    rate_limit: Option<u32>,
}

pub fn run(cmd: Cmd) -> anyhow::Result<()> {
    let runtime = runtime::Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(serve(cmd))
}

async fn serve(cmd: Cmd) -> anyhow::Result<()> {
    let mut options = Options::default()
        .with_max_message_size(cmd.max_message_size)
        .with_handshake_timeout(cmd.handshake_timeout);
    if let Some(messages) = cmd.rate_limit {
        options = options.with_rate_limit(RateLimit::new(messages, Duration::from_secs(1)));
    }
    let config = ServerConfig::default()
        .with_options(options)
        .with_max_connections(cmd.max_connections)
        .with_shutdown_timeout(cmd.shutdown_timeout);

    let server = Server::bind(cmd.addr, config).await?;
    let server = match cmd.path {
        Some(path) => server.route(path, echo),
        None => server.fallback(echo),
    };

    let handle = server.handle();
    println!("> Listening on ws://{}", server.local_addr());
    let running = tokio::spawn(server.run());

    tokio::signal::ctrl_c().await?;
    println!("> Shutting down ({} connections)", handle.connection_count());
    handle.shutdown().await;
    running.await??;

    Ok(())
}

async fn echo(ws: Connection) -> haru_ws::Result<()> {
    loop {
        let message = ws.recv(None).await?;
        ws.send(message).await?;
    }
}
