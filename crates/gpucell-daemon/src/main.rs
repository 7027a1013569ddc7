//! gpucell daemon
//!
//! Serves the GPU cell scheduler and applies node events to its inventory.

use anyhow::Context;
use clap::Parser;
use gpucell_api::create_router;
use gpucell_core::GpucellConfig;
use gpucell_scheduler::{node_event_channel, Scheduler, TopologyListener};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::FmtSubscriber;

/// gpucell daemon - fractional GPU cell scheduler
#[derive(Parser, Debug)]
#[command(name = "gpucelld")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to bind the API server (overrides the config file)
    #[arg(long)]
    address: Option<String>,

    /// Port for the REST API server (overrides the config file)
    #[arg(long)]
    port: Option<u16>,

    /// Log level (overrides the config file)
    #[arg(long)]
    log_level: Option<String>,

    /// Capacity of the node event queue
    #[arg(long, default_value_t = 64, value_parser = parse_event_buffer)]
    event_buffer: usize,
}

fn parse_event_buffer(value: &str) -> Result<usize, String> {
    match value.parse::<usize>() {
        Ok(0) => Err("event buffer must hold at least one event".to_string()),
        Ok(n) => Ok(n),
        Err(e) => Err(e.to_string()),
    }
}

fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => GpucellConfig::from_file(path)?,
        None => GpucellConfig::default(),
    };

    // Initialize logging
    let level = args.log_level.as_deref().unwrap_or(&config.logging.level);
    let writer = match &config.logging.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            BoxMakeWriter::new(std::sync::Mutex::new(file))
        }
        None => BoxMakeWriter::new(std::io::stdout),
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(parse_level(level))
        .with_target(false)
        .with_writer(writer)
        .with_ansi(config.logging.file.is_none())
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    info!("Starting gpucell daemon v{}", env!("CARGO_PKG_VERSION"));
    if args.config.is_none() {
        warn!("No configuration file given; starting with an empty inventory");
    }

    let scheduler = Arc::new(Scheduler::from_config(&config)?);

    // Topology listener
    let (node_events, source) = node_event_channel(args.event_buffer);
    TopologyListener::new(scheduler.clone(), source).spawn();

    let router = create_router(scheduler, node_events);

    let address = args.address.unwrap_or(config.api.address);
    let port = args.port.unwrap_or(config.api.port);
    let addr: SocketAddr = format!("{}:{}", address, port)
        .parse()
        .with_context(|| format!("Invalid address {}:{}", address, port))?;

    info!("API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, router).await.context("Server error")?;

    Ok(())
}
