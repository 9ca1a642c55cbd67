use clap::{Parser, Subcommand};

mod client;
mod server;

/// WebSocket client/server CLI tool built on haru-ws
///
/// Client input supports inline comments using // for documenting messages.
/// Comments can be searched with ctrl+r in history.
///
/// Examples:
///   {"type": "ping"} // Heartbeat
///
#[derive(Parser)]
#[command(author, version)]
struct Cli {
    /// Log level for the haru-ws internals (error, warn, info, debug, trace).
    #[arg(long, global = true, default_value = "warn")]
    log_level: log::LevelFilter,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Client(client::Cmd),
    Serve(server::Cmd),
}

fn main() {
    let args = Cli::parse();
    if let Err(err) = simple_logger::SimpleLogger::new()
        .with_level(args.log_level)
        .init()
    {
        eprintln!("unable to install logger: {err}");
    }

    let res = match args.command {
        Commands::Client(cmd) => client::run(cmd),
        Commands::Serve(cmd) => server::run(cmd),
    };
    if let Err(err) = res {
        eprintln!("{:?}", err);
    }
}
