//! Service context
//!
//! Everything a service call depends on, passed explicitly: persistence,
//! the worker queue, object storage, configuration and the trigger rate
//! limiter. Cloning is cheap.

use std::sync::Arc;

use conduit_core::domain::job::Job;
use conduit_core::domain::pipeline::Pipeline;
use conduit_core::domain::project::Project;

use crate::config::{Config, Limits, SweepSettings};
use crate::error::{ServiceError, ServiceResult};
use crate::repository::Store;
use crate::service::rate_limit::RateLimiter;
use crate::storage::ObjectStore;
use crate::worker::WorkerQueue;

#[derive(Clone)]
pub struct ServiceContext {
    pub store: Arc<dyn Store>,
    pub queue: Arc<dyn WorkerQueue>,
    pub objects: Arc<dyn ObjectStore>,
    pub config: Arc<Config>,
    pub rate_limiter: RateLimiter,
}

impl ServiceContext {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<dyn WorkerQueue>,
        objects: Arc<dyn ObjectStore>,
        config: Config,
    ) -> Self {
        let rate_limiter = RateLimiter::per_minute(config.limits.downstream_trigger_rate_limit);
        Self {
            store,
            queue,
            objects,
            config: Arc::new(config),
            rate_limiter,
        }
    }

    pub fn limits(&self) -> &Limits {
        &self.config.limits
    }

    pub fn sweeps(&self) -> &SweepSettings {
        &self.config.sweeps
    }

    pub async fn project(&self, id: i64) -> ServiceResult<Project> {
        self.store
            .find_project(id)
            .await?
            .ok_or_else(|| ServiceError::not_found(format!("Project {} not found", id)))
    }

    pub async fn pipeline(&self, id: i64) -> ServiceResult<Pipeline> {
        self.store
            .find_pipeline(id)
            .await?
            .ok_or_else(|| ServiceError::not_found(format!("Pipeline {} not found", id)))
    }

    pub async fn job(&self, id: i64) -> ServiceResult<Job> {
        self.store
            .find_job(id)
            .await?
            .ok_or_else(|| ServiceError::not_found(format!("Job {} not found", id)))
    }

    /// Latest attempt of every job in the pipeline
    pub async fn latest_jobs(&self, pipeline_id: i64) -> ServiceResult<Vec<Job>> {
        let mut jobs = self.store.pipeline_jobs(pipeline_id).await?;
        jobs.retain(|job| !job.retried);
        Ok(jobs)
    }
}
