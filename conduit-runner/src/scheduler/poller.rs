//! Job poller
//!
//! Asks the orchestrator for work and runs each assigned job in its own
//! task, bounded by `max_parallel_jobs`.

use anyhow::{Context as AnyhowContext, Result};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::scheduler::job::JobRunner;
use crate::service::ExecutionService;
use conduit_client::{ConduitClient, JobPayload};

/// Job poller that continuously polls for and executes jobs
pub struct JobPoller {
    config: Config,
    client: Arc<ConduitClient>,
    runner: JobRunner,
    /// Token this runner authenticates with
    token: String,
    semaphore: Arc<Semaphore>,
}

impl JobPoller {
    /// Creates a new job poller
    pub fn new(
        config: Config,
        client: Arc<ConduitClient>,
        executor: Arc<dyn ExecutionService>,
        token: String,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_parallel_jobs));
        let runner = JobRunner {
            client: Arc::clone(&client),
            executor,
            workspace_dir: config.workspace_dir.clone(),
            trace_send_interval: config.trace_send_interval,
        };
        Self {
            config,
            client,
            runner,
            token,
            semaphore,
        }
    }

    /// Starts the polling loop
    pub async fn run(&self) -> Result<()> {
        info!(
            "Starting job poller (interval: {:?})",
            self.config.poll_interval
        );

        let _heartbeat_handle = self.start_heartbeat_loop();

        let mut interval = time::interval(self.config.poll_interval);

        loop {
            interval.tick().await;

            debug!("Polling for jobs");

            match self.poll_once().await {
                Ok(started) => {
                    if started > 0 {
                        info!("Started {} job(s) this cycle", started);
                    }
                }
                Err(e) => {
                    error!("Error during poll cycle: {:#}", e);
                }
            }
        }
    }

    /// Request jobs while there is a free slot and the orchestrator has work
    async fn poll_once(&self) -> Result<usize> {
        let mut started = 0;

        loop {
            // Try to acquire semaphore permit, stop if at max capacity
            let Ok(permit) = self.semaphore.clone().try_acquire_owned() else {
                debug!("Max parallel jobs reached, not requesting more");
                break;
            };

            let job = self
                .client
                .request_job(&self.token)
                .await
                .context("Failed to request a job")?;

            let Some(job) = job else {
                debug!("No jobs available");
                break;
            };

            self.spawn_job_task(job, permit);
            started += 1;
        }

        Ok(started)
    }

    /// Spawns a task to execute a single job
    fn spawn_job_task(&self, job: JobPayload, permit: OwnedSemaphorePermit) {
        let runner = self.runner.clone();

        tokio::spawn(async move {
            let job_id = job.id;
            if let Err(e) = runner.run(job).await {
                error!("Failed to execute job {}: {:#}", job_id, e);
            }
            // Permit is released when dropped
            drop(permit);
        });
    }

    /// Starts a background task to send heartbeats
    fn start_heartbeat_loop(&self) -> tokio::task::JoinHandle<()> {
        let client = Arc::clone(&self.client);
        let token = self.token.clone();
        let heartbeat_interval = self.config.heartbeat_interval;

        tokio::spawn(async move {
            let mut ticker = time::interval(heartbeat_interval);

            loop {
                ticker.tick().await;

                debug!("Sending heartbeat");

                if let Err(e) = client.send_heartbeat(&token).await {
                    warn!("Failed to send heartbeat: {:#}", e);
                }
            }
        })
    }
}
