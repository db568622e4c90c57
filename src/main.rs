use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use conveyor_dispatch::config::{ConveyorToml, DEFAULT_CONFIG_FILE};
use conveyor_dispatch::telemetry::init_logging;

mod cmd;

#[derive(Parser)]
#[command(name = "conveyor-dispatch")]
#[command(version, about = "Dispatcher for a ring conveyor of gated checkpoints")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to the configuration file
    #[arg(long, global = true, env = "CONVEYOR_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the dispatcher HTTP server
    Serve {
        /// Port to serve on (overrides [server].port)
        #[arg(short, long)]
        port: Option<u16>,

        /// Address to bind (overrides [server].host)
        #[arg(long)]
        host: Option<String>,

        /// Drive an in-process simulated conveyor instead of the gateway
        #[arg(long)]
        simulate: bool,

        /// Development mode: bind all interfaces and allow any CORS origin
        #[arg(long)]
        dev: bool,
    },
    /// Create the carrier store and record the dwell time
    Init {
        /// Database path (overrides [storage].db_path)
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
    /// Print checkpoint queues and carriers from the store
    Status {
        /// Database path (overrides [storage].db_path)
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default conveyor.toml
    Init,
}

/// Load configuration (file, then env) and start logging.
fn load_config(cli: &Cli) -> Result<ConveyorToml> {
    let mut config = ConveyorToml::load_or_default(&cli.config)?;
    config.apply_env();
    init_logging(config.logging.format, &config.logging.filter, cli.verbose);
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Serve {
            port,
            host,
            simulate,
            dev,
        } => {
            let config = load_config(&cli)?;
            cmd::cmd_serve(&config, *port, host.clone(), *simulate, *dev).await?;
        }
        Commands::Init { db_path } => {
            let config = load_config(&cli)?;
            let db_path = db_path.clone().unwrap_or(config.storage.db_path.clone());
            cmd::cmd_init(&db_path, config.dwell_time())?;
        }
        Commands::Status { db_path } => {
            let config = load_config(&cli)?;
            let db_path = db_path.clone().unwrap_or(config.storage.db_path.clone());
            cmd::cmd_status(&db_path)?;
        }
        Commands::Config { command } => cmd::cmd_config(&cli.config, command.clone())?,
    }

    Ok(())
}
