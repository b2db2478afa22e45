//! Runner command handlers
//!
//! Handles listing and removing runners.

use anyhow::Result;
use clap::Subcommand;
use colored::*;
use conduit_client::ConduitClient;
use conduit_core::domain::runner::RunnerStatus;
use conduit_core::dto::runner::RunnerSummary;

/// Runner subcommands
#[derive(Subcommand)]
pub enum RunnerCommands {
    /// List the runners you can see
    List,
    /// Remove a runner
    Delete {
        /// Runner ID
        id: i64,
    },
}

/// Handle runner commands
pub async fn handle_runner_command(command: RunnerCommands, client: &ConduitClient) -> Result<()> {
    match command {
        RunnerCommands::List => list_runners(client).await,
        RunnerCommands::Delete { id } => {
            client.delete_runner(id).await?;
            println!(
                "{}",
                format!("✓ Runner {} deleted successfully!", id).green().bold()
            );
            Ok(())
        }
    }
}

/// List all registered runners
async fn list_runners(client: &ConduitClient) -> Result<()> {
    let runners = client.list_runners().await?;

    if runners.is_empty() {
        println!("{}", "No runners registered.".yellow());
    } else {
        println!(
            "{}",
            format!("Found {} registered runner(s):", runners.len()).bold()
        );
        println!();
        for runner in runners {
            print_runner_summary(&runner);
        }
    }

    Ok(())
}

/// Print a runner summary
fn print_runner_summary(runner: &RunnerSummary) {
    println!(
        "  {} Runner {} {}",
        "▸".cyan(),
        runner.id.to_string().bold(),
        runner.description.as_deref().unwrap_or_default().dimmed()
    );
    println!("    Status:       {}", colorize_status(&runner.status));
    println!("    Type:         {:?}", runner.runner_type);
    if !runner.tags.is_empty() {
        println!("    Tags:         {}", runner.tags.join(", "));
    }
    println!(
        "    Untagged:     {}",
        if runner.run_untagged { "yes" } else { "no" }
    );
    println!(
        "    Last Seen:    {}",
        runner
            .contacted_at
            .map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "never".to_string())
            .dimmed()
    );
    println!();
}

/// Colorize runner status for display
fn colorize_status(status: &RunnerStatus) -> ColoredString {
    let status_str = status.to_string();
    match status {
        RunnerStatus::Online => status_str.green(),
        RunnerStatus::Offline => status_str.red(),
    }
}
