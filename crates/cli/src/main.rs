//! Cadenza CLI — the main entry point.
//!
//! Commands:
//! - `serve`        — Start the chat gateway
//! - `check-config` — Validate a configuration file and print the result

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "cadenza",
    about = "Cadenza — admission control and response pacing for chat",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the configuration file
    #[arg(short, long, global = true, default_value = "cadenza.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the chat gateway server
    Serve {
        /// Override the port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Validate the configuration file
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    match cli.command {
        Commands::Serve { port } => {
            let mut config = cadenza_config::AppConfig::load(&cli.config)
                .with_context(|| format!("loading {}", cli.config.display()))?;
            if let Some(port) = port {
                config.gateway.port = port;
            }
            cadenza_gateway::start(config)
                .await
                .map_err(|e| anyhow::anyhow!("gateway failed: {e}"))?;
        }
        Commands::CheckConfig => {
            let config = cadenza_config::AppConfig::load(&cli.config)
                .with_context(|| format!("loading {}", cli.config.display()))?;
            println!("{} is valid", cli.config.display());
            println!("{config:#?}");
        }
    }

    Ok(())
}
