//! urcell - sorting cell console
//!
//! Loads the cell configuration, starts the robot event listener and hands
//! stdin to the operator console. Cell events are printed to stdout, logs go
//! to stderr.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use urcell::console::Console;
use urcell::json_output::emit;
use urcell::{CellService, Config};

const DEFAULT_CONFIG_PATH: &str = "config/urcell.yaml";

#[derive(Parser)]
#[command(name = "urcell")]
#[command(about = "Sorting cell controller for Universal Robots arms")]
#[command(version)]
struct Args {
    /// Path to the cell configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Print cell events as JSON lines
    #[arg(long)]
    json: bool,

    /// Operator recorded with runs and emergency stops
    #[arg(short, long)]
    operator: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Port for robot event notifications (overrides events.port)
    #[arg(long)]
    listen: Option<u16>,
}

impl Args {
    fn load_config(&self) -> Result<Config> {
        let explicit = self
            .config
            .clone()
            .or_else(|| std::env::var("URCELL_CONFIG").ok());

        match explicit {
            Some(path) => {
                info!("Using config: {}", path);
                Config::load_from_path(&path).with_context(|| format!("Failed to load {}", path))
            }
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                info!("Using config: {}", DEFAULT_CONFIG_PATH);
                Config::load_from_path(DEFAULT_CONFIG_PATH)
                    .with_context(|| format!("Failed to load {}", DEFAULT_CONFIG_PATH))
            }
            None => {
                warn!("No config file found, using defaults");
                Ok(Config::default())
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose { "urcell=debug" } else { "urcell=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .with_writer(std::io::stderr)
        .init();

    info!("Sorting cell controller");
    info!("{}", "=".repeat(50));

    let mut config = args.load_config()?;
    if let Some(port) = args.listen {
        config.events.enabled = true;
        config.events.port = port;
    }
    if args.operator.is_some() {
        config.operators.default_operator = args.operator.clone();
    }

    let service = Arc::new(CellService::new(config));

    let mut events = service.orchestrator().subscribe();
    let json = args.json;
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => emit(&event, json),
                Err(RecvError::Lagged(missed)) => warn!("Dropped {} cell events", missed),
                Err(RecvError::Closed) => break,
            }
        }
    });

    if service.config().events.enabled {
        let port = service.config().events.port;
        match service.start_events(port).await {
            Ok(addr) => info!("Waiting for robot notifications on {}", addr),
            Err(e) => error!("Event listener unavailable: {}", e),
        }
    }

    let console = Console::new(Arc::clone(&service), json);
    let outcome = console.run().await;

    info!("Performing graceful shutdown");
    service.shutdown().await;
    printer.abort();

    outcome.context("Console failed")?;
    info!("Shutdown complete");
    Ok(())
}
