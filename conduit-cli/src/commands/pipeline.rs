//! Pipeline command handlers
//!
//! Handles pipeline creation, listing, viewing, cancellation and retry.

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::*;
use conduit_client::ConduitClient;
use conduit_core::domain::pipeline::Pipeline;
use conduit_core::dto::pipeline::{CreatePipeline, PipelineDetails};

use crate::display::{colorize_status, parse_key_val};

/// Pipeline subcommands
#[derive(Subcommand)]
pub enum PipelineCommands {
    /// Create a pipeline for a ref of a project
    Create {
        /// Project ID
        project: i64,

        /// Branch or tag to build
        #[arg(long = "ref", default_value = "main")]
        ref_name: String,

        /// Commit to build (defaults to the ref)
        #[arg(long)]
        sha: Option<String>,

        /// Lua pipeline definition; the project's stored one is used otherwise
        #[arg(short, long)]
        file: Option<String>,

        /// Pipeline variables as KEY=value pairs
        #[arg(short, long, value_parser = parse_key_val)]
        variable: Vec<(String, String)>,
    },
    /// List recent pipelines of a project
    List {
        /// Project ID
        project: i64,

        /// Maximum number of pipelines to show
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// Get pipeline details
    Get {
        /// Pipeline ID
        id: i64,
    },
    /// Cancel a pipeline and its downstream pipelines
    Cancel {
        /// Pipeline ID
        id: i64,

        /// Cancel downstream pipelines before returning
        #[arg(long)]
        wait: bool,
    },
    /// Retry the failed and canceled jobs of a pipeline
    Retry {
        /// Pipeline ID
        id: i64,
    },
}

/// Handle pipeline commands
pub async fn handle_pipeline_command(command: PipelineCommands, client: &ConduitClient) -> Result<()> {
    match command {
        PipelineCommands::Create {
            project,
            ref_name,
            sha,
            file,
            variable,
        } => create_pipeline(client, project, ref_name, sha, file, variable).await,
        PipelineCommands::List { project, limit } => list_pipelines(client, project, limit).await,
        PipelineCommands::Get { id } => get_pipeline(client, id).await,
        PipelineCommands::Cancel { id, wait } => {
            let pipeline = client.cancel_pipeline(id, !wait).await?;
            println!("{}", "✓ Pipeline canceled".green().bold());
            print_pipeline_summary(&pipeline);
            Ok(())
        }
        PipelineCommands::Retry { id } => {
            let pipeline = client.retry_pipeline(id).await?;
            println!("{}", "✓ Pipeline retried".green().bold());
            print_pipeline_summary(&pipeline);
            Ok(())
        }
    }
}

/// Read and check a definition before sending it
fn load_definition(path: &str) -> Result<String> {
    let source = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read pipeline definition: {}", path))?;

    let definition = conduit_lua::parse_pipeline_definition(&source)
        .context("Failed to evaluate pipeline definition")?;
    conduit_lua::validate_definition(&definition).context("Invalid pipeline definition")?;

    Ok(source)
}

async fn create_pipeline(
    client: &ConduitClient,
    project_id: i64,
    ref_name: String,
    sha: Option<String>,
    file: Option<String>,
    variables: Vec<(String, String)>,
) -> Result<()> {
    let config = file.as_deref().map(load_definition).transpose()?;

    let req = CreatePipeline {
        ref_name,
        sha,
        config,
        variables: variables.into_iter().collect(),
    };

    let pipeline = client.create_pipeline(project_id, &req).await?;

    println!("{}", "✓ Pipeline created successfully!".green().bold());
    println!("  ID:     {}", pipeline.id.to_string().cyan());
    println!("  Ref:    {} ({})", pipeline.ref_name.bold(), pipeline.sha.dimmed());
    println!("  Status: {}", colorize_status(pipeline.status));

    Ok(())
}

async fn list_pipelines(client: &ConduitClient, project_id: i64, limit: Option<usize>) -> Result<()> {
    let pipelines = client.list_pipelines(project_id, limit).await?;

    if pipelines.is_empty() {
        println!("{}", "No pipelines found.".yellow());
    } else {
        println!(
            "{}",
            format!("Found {} pipeline(s):", pipelines.len()).bold()
        );
        println!();
        for pipeline in pipelines {
            print_pipeline_summary(&pipeline);
        }
    }

    Ok(())
}

async fn get_pipeline(client: &ConduitClient, id: i64) -> Result<()> {
    let details = client.get_pipeline(id).await?;
    print_pipeline_details(&details);
    Ok(())
}

/// Print a pipeline summary
fn print_pipeline_summary(pipeline: &Pipeline) {
    println!(
        "  {} #{} {} {}",
        "▸".cyan(),
        pipeline.iid,
        pipeline.ref_name.bold(),
        colorize_status(pipeline.status)
    );
    println!("    ID:      {}", pipeline.id.to_string().dimmed());
    println!("    Source:  {}", format!("{:?}", pipeline.source).dimmed());
    println!(
        "    Created: {}",
        pipeline
            .created_at
            .format("%Y-%m-%d %H:%M:%S")
            .to_string()
            .dimmed()
    );
    println!();
}

/// Print a pipeline with its stages and jobs
fn print_pipeline_details(details: &PipelineDetails) {
    let pipeline = &details.pipeline;

    println!("{}", "Pipeline Details:".bold());
    println!("  ID:       {}", pipeline.id.to_string().cyan());
    println!("  Project:  {}", pipeline.project_id);
    println!("  Ref:      {} ({})", pipeline.ref_name.bold(), pipeline.sha);
    println!("  Status:   {}", colorize_status(pipeline.status));
    println!("  Locked:   {:?}", pipeline.locked);
    if let Some(upstream) = &pipeline.upstream {
        println!(
            "  Upstream: pipeline {} (bridge {})",
            upstream.pipeline_id, upstream.job_id
        );
    }
    println!(
        "  Created:  {}",
        pipeline.created_at.format("%Y-%m-%d %H:%M:%S")
    );
    if let Some(finished) = pipeline.finished_at {
        println!("  Finished: {}", finished.format("%Y-%m-%d %H:%M:%S"));
    }

    for stage in &details.stages {
        println!(
            "\n{} {}",
            stage.name.bold(),
            colorize_status(stage.status)
        );
        for job in details.jobs.iter().filter(|job| job.stage == stage.name) {
            let kind = if job.is_bridge() { " (trigger)" } else { "" };
            println!(
                "  {} {}{}  {}  {}",
                "▸".cyan(),
                job.name,
                kind.dimmed(),
                colorize_status(job.status),
                format!("#{}", job.id).dimmed()
            );
        }
    }

    if !details.downstream.is_empty() {
        println!("\n{}", "Downstream:".bold());
        for child in &details.downstream {
            println!(
                "  {} pipeline {} in project {}  {}",
                "▸".cyan(),
                child.id,
                child.project_id,
                colorize_status(child.status)
            );
        }
    }
}
