//! unity-relay-server - relay broker between CLI clients and Unity instances

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tokio::sync::mpsc;
use unity_relay::config::Config;
use unity_relay::logging;
use unity_relay::server::RelayServer;

#[derive(Parser)]
#[command(name = "unity-relay-server")]
#[command(about = "Relay broker routing commands to Unity editor instances")]
#[command(version)]
struct Cli {
    /// Bind host
    #[arg(long)]
    host: Option<String>,

    /// Bind port
    #[arg(short, long)]
    port: Option<u16>,

    /// Default request timeout in milliseconds
    #[arg(long)]
    request_timeout_ms: Option<u64>,

    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Log to stderr only
    #[arg(long)]
    no_log_file: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(timeout_ms) = cli.request_timeout_ms {
        config.server.request_timeout_ms = timeout_ms;
    }
    config.validate()?;

    if let Some(path) = logging::init(&config.logging, cli.debug, !cli.no_log_file)? {
        tracing::debug!("Logging to {}", path.display());
    }

    let server = RelayServer::bind(config.server.clone()).await?;
    tracing::info!(
        "Starting relay server {} on {}",
        unity_relay::protocol::RELAY_VERSION,
        server.local_addr()?
    );

    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(()).await;
        }
    });

    server.run(shutdown_rx).await?;
    tracing::info!("Relay server stopped");
    Ok(())
}
