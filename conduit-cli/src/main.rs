//! Conduit CLI
//!
//! Command-line interface for interacting with the Conduit orchestrator.

mod commands;
mod config;
mod display;

use anyhow::Result;
use clap::Parser;
use commands::{Commands, handle_command};
use config::Config;

#[derive(Parser)]
#[command(name = "conduit")]
#[command(about = "Conduit CI/CD Pipeline CLI", long_about = None)]
struct Cli {
    /// Orchestrator URL
    #[arg(
        long,
        env = "CONDUIT_ORCHESTRATOR_URL",
        default_value = "http://localhost:8080"
    )]
    orchestrator_url: String,

    /// User to act as
    #[arg(long, env = "CONDUIT_USER")]
    user: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config {
        orchestrator_url: cli.orchestrator_url,
        user: cli.user,
    };

    handle_command(cli.command, &config).await
}
