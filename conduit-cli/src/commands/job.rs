//! Job command handlers
//!
//! Viewing jobs and their traces, and retry, play and cancel.

use anyhow::Result;
use clap::Subcommand;
use colored::*;
use conduit_client::ConduitClient;
use conduit_core::domain::job::Job;

use crate::display::colorize_status;

/// Job subcommands
#[derive(Subcommand)]
pub enum JobCommands {
    /// Get job details
    Get {
        /// Job ID
        id: i64,
    },
    /// Print the job trace
    Trace {
        /// Job ID
        id: i64,
    },
    /// Retry a finished job
    Retry {
        /// Job ID
        id: i64,
    },
    /// Start a manual job
    Play {
        /// Job ID
        id: i64,
    },
    /// Cancel a job
    Cancel {
        /// Job ID
        id: i64,
    },
}

/// Handle job commands
pub async fn handle_job_command(command: JobCommands, client: &ConduitClient) -> Result<()> {
    match command {
        JobCommands::Get { id } => {
            let job = client.get_job(id).await?;
            print_job_details(&job);
        }
        JobCommands::Trace { id } => {
            let trace = client.get_trace(id).await?;
            if trace.is_empty() {
                println!("{}", "No output yet.".yellow());
            } else {
                print!("{}", trace);
            }
        }
        JobCommands::Retry { id } => {
            let job = client.retry_job(id).await?;
            println!(
                "{}",
                format!("✓ Job {} retried as job {}", id, job.id).green().bold()
            );
            print_job_summary(&job);
        }
        JobCommands::Play { id } => {
            let job = client.play_job(id).await?;
            println!("{}", "✓ Job started".green().bold());
            print_job_summary(&job);
        }
        JobCommands::Cancel { id } => {
            let job = client.cancel_job(id).await?;
            println!("{}", "✓ Job canceled".green().bold());
            print_job_summary(&job);
        }
    }

    Ok(())
}

/// Print a job summary
fn print_job_summary(job: &Job) {
    println!(
        "  {} {} {}",
        "▸".cyan(),
        job.name.bold(),
        colorize_status(job.status)
    );
    println!("    ID:       {}", job.id.to_string().dimmed());
    println!("    Pipeline: {}", job.pipeline_id.to_string().dimmed());
    println!();
}

/// Print detailed job information
fn print_job_details(job: &Job) {
    println!("{}", "Job Details:".bold());
    println!("  ID:          {}", job.id.to_string().cyan());
    println!("  Name:        {}", job.name.bold());
    println!("  Stage:       {}", job.stage);
    println!("  Pipeline:    {}", job.pipeline_id);
    println!("  Status:      {}", colorize_status(job.status));
    println!("  When:        {:?}", job.when);
    if job.allow_failure {
        println!("  Allow fail:  {}", "yes".dimmed());
    }
    if !job.tags.is_empty() {
        println!("  Tags:        {}", job.tags.join(", "));
    }
    if !job.needs.is_empty() {
        println!("  Needs:       {}", job.needs.join(", "));
    }
    if let Some(runner_id) = job.runner_id {
        println!("  Runner:      {}", runner_id);
    }
    if let Some(reason) = job.failure_reason {
        println!("  Failure:     {}", reason.as_str().red());
    }
    if let Some(code) = job.exit_code {
        println!("  Exit code:   {}", code);
    }
    if job.retried {
        println!("  {}", "Superseded by a retry".dimmed());
    }
    println!(
        "  Created:     {}",
        job.created_at.format("%Y-%m-%d %H:%M:%S")
    );
    if let Some(started) = job.started_at {
        println!("  Started:     {}", started.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(finished) = job.finished_at {
        println!("  Finished:    {}", finished.format("%Y-%m-%d %H:%M:%S"));
    }
}
