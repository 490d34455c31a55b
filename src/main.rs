use std::path::PathBuf;

use clap::Parser;

#[derive(Parser)]
#[command(name = "cowatch", about = "Watch together: synced playback and a P2P voice mesh")]
struct Cli {
    /// Room code to join; a fresh one is generated when hosting without it
    #[arg(long)]
    room: Option<String>,

    /// Display name shown to other members
    #[arg(long, default_value = "guest")]
    name: String,

    /// Join as the host (may close the room)
    #[arg(long)]
    host: bool,

    /// API server port (overrides the config file)
    #[arg(long)]
    port: Option<u16>,

    /// Config file path
    #[arg(long)]
    config: Option<PathBuf>,

    /// Extra multiaddrs to dial at startup
    #[arg(long)]
    dial: Vec<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    cowatch_lib::init_tracing();

    let opts = cowatch_lib::RunOptions {
        room: cli.room,
        name: cli.name,
        host: cli.host,
        port: cli.port,
        config: cli.config,
        dial: cli.dial,
    };
    if let Err(e) = cowatch_lib::run_headless(opts).await {
        tracing::error!("cowatch failed: {}", e);
        std::process::exit(1);
    }
}
