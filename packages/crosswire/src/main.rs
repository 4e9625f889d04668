use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

mod channel;
mod config;
mod endpoint;
mod metrics;
mod protocol;
mod registry;
mod relay;
mod router;

#[cfg(test)]
mod test_helpers;

use crate::config::{BusKind, CrosswireConfig, FileConfig, load_config};
use crate::endpoint::{Supervisor, bind_all};
use crate::metrics::ServerMetrics;
use crate::relay::Relay;
use crate::relay::bus::{Bus, MemoryBus};
use crate::relay::redis_bus::RedisBus;

#[derive(Parser)]
#[command(name = "crosswire")]
#[command(about = "WebSocket message relay with cross-process direct messages")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Directory holding config.toml and relative certificate paths
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay server in the foreground (the default)
    Serve(ServeArgs),

    /// Print the resolved configuration as TOML and exit
    CheckConfig,
}

#[derive(Parser, Default)]
struct ServeArgs {
    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::CheckConfig) => check_config(cli.config_dir),
        Some(Commands::Serve(args)) => run_server(args, cli.config_dir).await,
        None => run_server(ServeArgs::default(), cli.config_dir).await,
    }
}

fn check_config(config_dir: Option<PathBuf>) -> Result<()> {
    let config_dir = config_dir.unwrap_or_else(|| PathBuf::from("."));
    let fc: FileConfig = load_config(&config_dir)
        .extract()
        .with_context(|| format!("invalid configuration in {}", config_dir.display()))?;
    // Reject what the server would reject at startup
    CrosswireConfig::from_file(config_dir, &fc)?;
    print!("{}", toml::to_string_pretty(&fc)?);
    Ok(())
}

async fn run_server(args: ServeArgs, config_dir: Option<PathBuf>) -> Result<()> {
    // Setup logging
    let default_directive = if args.debug {
        "crosswire=debug,tower_http=debug,info"
    } else {
        "crosswire=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    info!("Starting crosswire relay");

    let config = CrosswireConfig::load(config_dir)?;
    if !config.config_toml_path().exists() {
        info!(
            "No config file at {}, using defaults and environment",
            config.config_toml_path().display()
        );
    }

    let endpoints = bind_all(&config.server).await?;
    for endpoint in &endpoints {
        info!(
            endpoint = endpoint.id(),
            secure = endpoint.is_secure(),
            "endpoint bound"
        );
    }

    let bus: Arc<dyn Bus> = match config.bus.kind {
        BusKind::Redis => {
            info!(url = %config.bus.url, "Using redis bus");
            Arc::new(RedisBus::open(&config.bus.url).context("invalid redis URL")?)
        }
        BusKind::Memory => {
            warn!("Using in-process bus; direct messages will not reach other processes");
            Arc::new(MemoryBus::new())
        }
    };

    let metrics = Arc::new(ServerMetrics::new());
    let relay = Arc::new(Relay::new(
        bus,
        config.bus.topic.clone(),
        config.bus.backoff,
        Supervisor::registries(&endpoints),
        metrics.clone(),
    ));

    let cancel = CancellationToken::new();
    let subscriber = relay.start(cancel.clone()).await;

    // Create shutdown signal handler
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            return;
        }
        info!("Received shutdown signal, cleaning up...");
        shutdown.cancel();
    });

    let supervisor = Supervisor::new(
        endpoints,
        relay.clone(),
        metrics.clone(),
        config.server.outbound_queue,
    );
    supervisor.run(cancel.clone()).await?;

    // Every endpoint stopped; make sure the subscriber does too
    cancel.cancel();
    if let Err(e) = subscriber.await {
        warn!("Relay subscriber task failed: {}", e);
    }

    info!("Server shutdown complete");
    Ok(())
}
