use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use huddle_core::logging::{self, LogConfig, LogLevel};
use huddle_relay::{ROOM_PATH, RelayConfig, Room};
use tokio::net::TcpListener;

#[derive(Parser, Debug)]
#[command(name = "huddle-relay")]
#[command(about = "Broadcast signaling relay for huddle calls")]
struct Cli {
    /// Port to listen on (defaults to HUDDLE_RELAY_PORT or 8000)
    #[arg(long)]
    port: Option<u16>,

    /// Address to bind (defaults to HUDDLE_RELAY_HOST or 0.0.0.0)
    #[arg(long)]
    host: Option<IpAddr>,

    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,

    /// Write logs to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&LogConfig {
        level: cli.log_level,
        file: cli.log_file,
    })?;

    let mut config = RelayConfig::from_env();
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(host) = cli.host {
        config.host = host;
    }

    let addr = config.addr();
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(target = "huddle::relay", %addr, path = ROOM_PATH, "relay listening");

    huddle_relay::serve(listener, Room::new(), shutdown_signal()).await?;
    tracing::info!(target = "huddle::relay", "relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(target = "huddle::relay", error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
