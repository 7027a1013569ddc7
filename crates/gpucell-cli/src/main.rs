//! gpucell CLI
//!
//! Command-line interface for the gpucell daemon.

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// gpucell - fractional GPU cell scheduler
#[derive(Parser, Debug)]
#[command(name = "gpucell")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Daemon API address
    #[arg(long, default_value = "http://localhost:9090", global = true)]
    api: String,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show scheduler status
    Status,

    /// Show free cells, for every level or for one
    Cells {
        /// GPU type (e.g., V100)
        gpu_type: Option<String>,

        /// Level name (e.g., quarter); requires a GPU type
        #[arg(requires = "gpu_type")]
        level: Option<String>,
    },

    /// List reserved cells
    Ps,

    /// Reserve a cell
    Reserve {
        /// Fraction of one GPU (e.g., 0.25)
        #[arg(long, conflicts_with = "level")]
        gpu_request: Option<f64>,

        /// Level name, used instead of a fraction
        #[arg(long, required_unless_present = "gpu_request")]
        level: Option<String>,

        /// Acceptable GPU type; repeat for several
        #[arg(long = "gpu-type")]
        gpu_types: Vec<String>,

        /// Restrict the reservation to one node
        #[arg(long)]
        node: Option<String>,

        /// Requester identifier (generated when omitted)
        #[arg(long)]
        requester: Option<String>,
    },

    /// Release a reserved cell
    Release {
        /// Cell id as index.generation
        cell: String,
    },

    /// Release every cell held by a requester
    ReleaseOwner {
        /// Requester identifier
        requester: String,
    },

    /// Announce a GPU node to the daemon
    AddNode {
        /// Node name
        name: String,

        /// GPU model (e.g., V100)
        #[arg(long)]
        model: String,

        /// Number of physical GPUs
        #[arg(long, default_value_t = 1)]
        gpus: u64,
    },

    /// Validate a topology file offline
    Check {
        /// Path to the TOML configuration file
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::WARN
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    let client = commands::ApiClient::new(&cli.api);

    match cli.command {
        Commands::Status => {
            commands::status(&client).await?;
        }
        Commands::Cells { gpu_type, level } => {
            commands::cells(&client, gpu_type, level).await?;
        }
        Commands::Ps => {
            commands::ps(&client).await?;
        }
        Commands::Reserve {
            gpu_request,
            level,
            gpu_types,
            node,
            requester,
        } => {
            let req = commands::ReserveBody::new(requester, gpu_request, level, gpu_types, node);
            commands::reserve(&client, req).await?;
        }
        Commands::Release { cell } => {
            commands::release(&client, cell).await?;
        }
        Commands::ReleaseOwner { requester } => {
            commands::release_owner(&client, requester).await?;
        }
        Commands::AddNode { name, model, gpus } => {
            commands::add_node(&client, name, model, gpus).await?;
        }
        Commands::Check { config } => {
            commands::check(&config).await?;
        }
    }

    Ok(())
}
