use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use meshplane::config::MeshConfig;
use meshplane::orchestrator::Orchestrator;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "meshplane")]
#[command(version = "0.1.0")]
#[command(about = "Control plane for a wireless mesh channel-planning pipeline")]
struct Args {
    /// Path to a MeshConfig TOML file. Defaults are used for anything omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Bind address for the dashboard WebSocket fan-out bridge. Omit to
    /// disable the bridge entirely.
    #[arg(long)]
    dashboard_addr: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => MeshConfig::load(path)?,
        None => MeshConfig::default(),
    };

    tracing::info!(target: "meshplane::main", dashboard = args.dashboard_addr.is_some(), "starting meshplane");

    let handles = Orchestrator::new(config).spawn(args.dashboard_addr);

    tokio::signal::ctrl_c().await?;
    tracing::info!(target: "meshplane::main", "ctrl-c received, shutting down");
    handles.shutdown().await;

    Ok(())
}
