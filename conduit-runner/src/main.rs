//! Conduit Runner
//!
//! A worker agent that executes CI jobs assigned by the orchestrator.
//!
//! Architecture:
//! - Configuration: Load settings from environment
//! - Services: Script execution, trace buffering, artifact bundling
//! - Scheduler: Job polling and per-job lifecycle
//!
//! The runner polls the orchestrator for jobs, runs each script line with
//! `sh -c` in a per-job workspace and streams the output back as it goes.

mod config;
mod scheduler;
mod service;

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::scheduler::JobPoller;
use crate::service::{ExecutionService, ShellExecutionService};
use conduit_client::ConduitClient;
use conduit_core::dto::runner::RegisterRunner;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "conduit_runner=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Conduit Runner");

    let config = Config::from_env().context("Failed to load configuration")?;
    config.validate()?;
    info!("Loaded configuration: orchestrator_url={}", config.orchestrator_url);

    let client = Arc::new(ConduitClient::new(config.orchestrator_url.clone()));

    let token = match &config.runner_token {
        Some(token) => {
            let runner = client
                .verify_runner(token)
                .await
                .context("Runner token was rejected")?;
            info!("Using registered runner {}", runner.id);
            token.clone()
        }
        None => register_with_retry(&client, &config).await?,
    };

    tokio::fs::create_dir_all(&config.workspace_dir)
        .await
        .with_context(|| format!("Failed to create {}", config.workspace_dir.display()))?;

    let executor: Arc<dyn ExecutionService> = Arc::new(ShellExecutionService::new());
    let poller = JobPoller::new(config.clone(), client, executor, token);

    info!(
        "Poll interval: {:?}, trace send interval: {:?}, parallel jobs: {}",
        config.poll_interval, config.trace_send_interval, config.max_parallel_jobs
    );

    // Start polling loop
    if let Err(e) = poller.run().await {
        error!("Poller error: {}", e);
        return Err(e);
    }

    Ok(())
}

/// Register with the orchestrator with exponential backoff
///
/// The orchestrator may not be ready yet when the runner starts (common in
/// container environments). A rejected registration token is not retried.
async fn register_with_retry(client: &ConduitClient, config: &Config) -> Result<String> {
    const MAX_RETRIES: u32 = 10;
    const INITIAL_DELAY_MS: u64 = 500;
    const MAX_DELAY_MS: u64 = 30_000;

    let registration_token = config
        .registration_token
        .clone()
        .context("RUNNER_REGISTRATION_TOKEN is not set")?;
    let request = RegisterRunner {
        token: registration_token,
        description: config.description.clone(),
        group_id: None,
        tags: config.tags.clone(),
        run_untagged: config.run_untagged,
        access_level: Default::default(),
    };

    let mut attempt = 0;
    let mut delay_ms = INITIAL_DELAY_MS;

    loop {
        attempt += 1;

        match client.register_runner(&request).await {
            Ok(registered) => {
                info!(
                    "Registered as runner {} after {} attempt(s)",
                    registered.id, attempt
                );
                return Ok(registered.token);
            }
            Err(e) if e.is_client_error() => {
                return Err(e).context("Registration was refused");
            }
            Err(e) => {
                if attempt >= MAX_RETRIES {
                    error!(
                        "Failed to register with orchestrator after {} attempts",
                        MAX_RETRIES
                    );
                    return Err(e).context("Failed to register with orchestrator");
                }

                warn!(
                    "Failed to register with orchestrator (attempt {}/{}): {}",
                    attempt, MAX_RETRIES, e
                );
                warn!("Retrying in {} ms...", delay_ms);

                tokio::time::sleep(Duration::from_millis(delay_ms)).await;

                // Exponential backoff with cap
                delay_ms = (delay_ms * 2).min(MAX_DELAY_MS);
            }
        }
    }
}
