//! Repository Module
//!
//! Data access layer for the orchestrator. Services only see the store
//! traits below; `PgStore` implements them on Postgres and `InMemoryStore`
//! keeps everything in process for tests and single-node runs.

pub mod artifact;
pub mod job;
pub mod lease;
pub mod memory;
pub mod pipeline;
pub mod project;
pub mod runner;
pub mod trace;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conduit_core::Status;
use conduit_core::domain::artifact::{
    DeletedObject, JobArtifact, NewJobArtifact, NewPipelineArtifact, PipelineArtifact,
};
use conduit_core::domain::job::{Job, JobKind, NewJob};
use conduit_core::domain::pipeline::{NewPipeline, NewStage, Pipeline, Stage};
use conduit_core::domain::project::{MemberRole, NewProject, Project, Trigger, User};
use conduit_core::domain::runner::{NewRunner, Runner};
use conduit_core::domain::trace::{PendingState, TraceChunk, TraceMetadata};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::PgPool;
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};

pub use memory::InMemoryStore;

/// Projects a runner may take jobs from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerScope {
    /// Every project with shared runners enabled
    Instance,
    /// Every project of the group
    Group(i64),
    Projects(Vec<i64>),
}

#[async_trait]
pub trait ProjectStore: Send + Sync {
    async fn create_user(&self, username: &str, admin: bool) -> StoreResult<User>;
    async fn find_user(&self, id: i64) -> StoreResult<Option<User>>;
    async fn find_user_by_username(&self, username: &str) -> StoreResult<Option<User>>;

    async fn create_project(&self, project: NewProject, runners_token: &str)
    -> StoreResult<Project>;
    async fn find_project(&self, id: i64) -> StoreResult<Option<Project>>;
    async fn find_project_by_path(&self, path: &str) -> StoreResult<Option<Project>>;
    async fn find_project_by_runners_token(&self, token: &str) -> StoreResult<Option<Project>>;

    /// Insert or replace a membership
    async fn add_member(&self, project_id: i64, user_id: i64, role: MemberRole)
    -> StoreResult<()>;
    async fn member_role(&self, project_id: i64, user_id: i64) -> StoreResult<Option<MemberRole>>;

    async fn create_trigger(
        &self,
        project_id: i64,
        owner_id: i64,
        token: &str,
        description: Option<String>,
    ) -> StoreResult<Trigger>;
    async fn find_trigger_by_token(&self, token: &str) -> StoreResult<Option<Trigger>>;
}

#[async_trait]
pub trait PipelineStore: Send + Sync {
    /// Persist a pipeline with its stages and jobs in one transaction,
    /// assigning the next per-project `iid`
    async fn create_pipeline(
        &self,
        pipeline: NewPipeline,
        stages: Vec<NewStage>,
        jobs: Vec<NewJob>,
    ) -> StoreResult<Pipeline>;
    async fn find_pipeline(&self, id: i64) -> StoreResult<Option<Pipeline>>;
    /// Newest first
    async fn list_pipelines(&self, project_id: i64, limit: usize) -> StoreResult<Vec<Pipeline>>;
    /// Compare-and-set on `lock_version`; returns the stored row
    async fn update_pipeline(&self, pipeline: &Pipeline) -> StoreResult<Pipeline>;

    async fn stages(&self, pipeline_id: i64) -> StoreResult<Vec<Stage>>;
    async fn update_stage_status(&self, stage_id: i64, status: Status) -> StoreResult<()>;

    /// Pipelines created by bridges of the given pipeline
    async fn downstream_pipelines(&self, pipeline_id: i64) -> StoreResult<Vec<Pipeline>>;
    async fn pipeline_for_bridge(&self, bridge_id: i64) -> StoreResult<Option<Pipeline>>;

    /// Locked pipelines on the ref created before `before_iid`
    async fn locked_pipelines_before(
        &self,
        project_id: i64,
        ref_name: &str,
        before_iid: i64,
    ) -> StoreResult<Vec<Pipeline>>;
    async fn unlock_pipeline(&self, id: i64) -> StoreResult<()>;
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn find_job(&self, id: i64) -> StoreResult<Option<Job>>;
    async fn find_job_by_token(&self, token: &str) -> StoreResult<Option<Job>>;
    /// Every job of the pipeline including retried ones, oldest first
    async fn pipeline_jobs(&self, pipeline_id: i64) -> StoreResult<Vec<Job>>;
    /// Compare-and-set on `lock_version`; returns the stored row
    async fn update_job(&self, job: &Job) -> StoreResult<Job>;
    /// Flag `original` as retried (compare-and-set) and insert `clone` into
    /// the same pipeline, atomically
    async fn retry_job(&self, original: &Job, clone: NewJob) -> StoreResult<Job>;

    /// Pending builds without a runner that `runner` may pick, oldest first
    ///
    /// Scope, tags, `run_untagged` and protection are filtered before the
    /// limit applies.
    async fn pending_builds(
        &self,
        runner: &Runner,
        scope: &RunnerScope,
        limit: usize,
    ) -> StoreResult<Vec<Job>>;
    /// Running builds per project, counting only jobs on instance runners
    async fn running_shared_builds(&self) -> StoreResult<HashMap<i64, i64>>;
    /// Jobs in `status` whose sweep timestamp is before `before`: `updated_at`
    /// for running, `queued_at` for pending and `scheduled_at` for scheduled.
    /// `kind` narrows the batch to builds or bridges.
    async fn jobs_for_sweep(
        &self,
        status: Status,
        kind: Option<JobKind>,
        before: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<Job>>;
}

#[async_trait]
pub trait RunnerStore: Send + Sync {
    async fn create_runner(&self, runner: NewRunner, token: &str) -> StoreResult<Runner>;
    async fn find_runner(&self, id: i64) -> StoreResult<Option<Runner>>;
    async fn find_runner_by_token(&self, token: &str) -> StoreResult<Option<Runner>>;
    async fn list_runners(&self) -> StoreResult<Vec<Runner>>;
    async fn delete_runner(&self, id: i64) -> StoreResult<bool>;
    /// Record contact and mark the runner online
    async fn touch_runner(&self, id: i64, at: DateTime<Utc>) -> StoreResult<()>;
    /// Mark runners not seen since `contacted_before` offline
    async fn mark_stale_runners(&self, contacted_before: DateTime<Utc>) -> StoreResult<u64>;
}

#[async_trait]
pub trait TraceStore: Send + Sync {
    /// Ordered by chunk index
    async fn trace_chunks(&self, job_id: i64) -> StoreResult<Vec<TraceChunk>>;
    async fn save_trace_chunk(&self, chunk: &TraceChunk) -> StoreResult<()>;
    async fn delete_trace_chunks(&self, job_id: i64) -> StoreResult<()>;

    /// Store the state unless one exists; returns the stored state
    async fn create_pending_state(&self, state: &PendingState) -> StoreResult<PendingState>;
    async fn delete_pending_state(&self, job_id: i64) -> StoreResult<()>;

    async fn trace_metadata(&self, job_id: i64) -> StoreResult<Option<TraceMetadata>>;
    async fn save_trace_metadata(&self, metadata: &TraceMetadata) -> StoreResult<()>;
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Insert and add its size to the project statistics; `Conflict` when the
    /// job already has an artifact of that type
    async fn create_job_artifact(&self, artifact: NewJobArtifact) -> StoreResult<JobArtifact>;
    async fn job_artifacts(&self, job_id: i64) -> StoreResult<Vec<JobArtifact>>;
    async fn pipeline_job_artifacts(&self, pipeline_id: i64) -> StoreResult<Vec<JobArtifact>>;

    /// Copy the owning pipeline's lock onto up to `limit` artifacts in the
    /// `unknown` state
    async fn resolve_unknown_artifact_locks(&self, limit: usize) -> StoreResult<u64>;
    /// Unlocked, non-trace artifacts that expired before `now`
    async fn expired_job_artifacts(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<JobArtifact>>;
    /// In one transaction: stage the files in `deleted_objects`, delete the
    /// rows and decrement the project statistics
    async fn destroy_job_artifacts(
        &self,
        artifacts: &[JobArtifact],
        pick_up_at: DateTime<Utc>,
    ) -> StoreResult<u64>;
    /// Unlock up to `limit` locked artifacts of the pipeline's own jobs
    async fn unlock_job_artifacts(&self, pipeline_id: i64, limit: usize) -> StoreResult<u64>;

    async fn create_pipeline_artifact(
        &self,
        artifact: NewPipelineArtifact,
    ) -> StoreResult<PipelineArtifact>;
    async fn pipeline_artifacts(&self, pipeline_id: i64) -> StoreResult<Vec<PipelineArtifact>>;
    async fn unlock_pipeline_artifacts(&self, pipeline_id: i64) -> StoreResult<u64>;

    /// Claim due deleted objects, pushing their `pick_up_at` to `retry_at`
    /// so a failed removal is retried later
    async fn claim_deleted_objects(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        retry_at: DateTime<Utc>,
    ) -> StoreResult<Vec<DeletedObject>>;
    async fn remove_deleted_objects(&self, ids: &[i64]) -> StoreResult<u64>;
}

/// Exclusive leases with a time to live
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Take the lease unless another owner holds an unexpired one
    async fn try_obtain_lease(&self, key: &str, owner: Uuid, ttl: Duration) -> StoreResult<bool>;
    async fn release_lease(&self, key: &str, owner: Uuid) -> StoreResult<()>;
}

/// Everything the services persist
pub trait Store:
    ProjectStore + PipelineStore + JobStore + RunnerStore + TraceStore + ArtifactStore + LeaseStore
{
}

impl<T> Store for T where
    T: ProjectStore
        + PipelineStore
        + JobStore
        + RunnerStore
        + TraceStore
        + ArtifactStore
        + LeaseStore
{
}

/// Postgres implementation of every store trait
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

/// Text form of a unit enum, as serde names it
pub(crate) fn enum_to_text<T: Serialize>(value: &T) -> StoreResult<String> {
    match serde_json::to_value(value)? {
        serde_json::Value::String(text) => Ok(text),
        other => Err(StoreError::Serialization(
            <serde_json::Error as serde::ser::Error>::custom(format!(
                "expected a unit variant, got {other}"
            )),
        )),
    }
}

pub(crate) fn text_to_enum<T: DeserializeOwned>(text: &str) -> StoreResult<T> {
    Ok(serde_json::from_value(serde_json::Value::String(
        text.to_string(),
    ))?)
}

pub(crate) fn status_from_text(text: &str) -> StoreResult<Status> {
    text.parse::<Status>().map_err(|err| {
        StoreError::Serialization(<serde_json::Error as serde::de::Error>::custom(err))
    })
}

/// Unique constraint violations surface as `Conflict`
pub(crate) fn conflict_on_unique(err: sqlx::Error, message: &str) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            StoreError::Conflict(message.to_string())
        }
        _ => StoreError::Database(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::domain::job::FailureReason;
    use conduit_core::domain::pipeline::PipelineSource;

    #[test]
    fn test_enum_text_round_trip() {
        assert_eq!(
            enum_to_text(&PipelineSource::ParentPipeline).unwrap(),
            "parent_pipeline"
        );
        let reason: FailureReason = text_to_enum("script_failure").unwrap();
        assert_eq!(reason, FailureReason::ScriptFailure);
        assert!(text_to_enum::<FailureReason>("bogus").is_err());
    }

    #[test]
    fn test_status_from_text() {
        assert_eq!(status_from_text("manual").unwrap(), Status::Manual);
        assert!(status_from_text("paused").is_err());
    }
}
