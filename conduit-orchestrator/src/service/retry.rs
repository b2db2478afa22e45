//! Retry and play
//!
//! Retrying clones a finished build into a fresh job of the same pipeline and
//! flags the original as retried. Jobs that were skipped because of the
//! original are reset to `created` so processing can reconsider them, and
//! any dependent bridge upstream is reset to `pending` so parent pipelines
//! stop reporting the stale result.

use chrono::Utc;
use conduit_core::domain::dag;
use conduit_core::domain::job::{Job, SchedulingType};
use conduit_core::domain::pipeline::Pipeline;
use conduit_core::domain::project::User;
use conduit_core::{JobEvent, Status};
use std::collections::HashSet;

use crate::error::{Reason, ServiceError, ServiceResult};
use crate::service::auth::{self, Ability};
use crate::service::context::ServiceContext;
use crate::service::locking::retry_lock;
use crate::service::pipeline;
use crate::worker::BackgroundJob;

/// Retry a single build
pub async fn retry_job(ctx: &ServiceContext, user: Option<&User>, job_id: i64) -> ServiceResult<Job> {
    let job = pipeline::get_job(ctx, user, job_id).await?;
    let project = ctx.project(job.project_id).await?;
    auth::authorize(ctx, user, Ability::UpdateBuild, &project).await?;

    if !job.is_retryable() {
        return Err(ServiceError::unprocessable("Job is not retryable"));
    }

    clone_and_requeue(ctx, &job, user.map(|user| user.id)).await
}

/// Retry every failed or canceled build of a pipeline
pub async fn retry_pipeline(
    ctx: &ServiceContext,
    user: Option<&User>,
    pipeline_id: i64,
) -> ServiceResult<Pipeline> {
    let pipeline = ctx.pipeline(pipeline_id).await?;
    let project = auth::readable_project(ctx, user, pipeline.project_id)
        .await
        .map_err(|_| ServiceError::not_found(format!("Pipeline {} not found", pipeline_id)))?;
    auth::authorize(ctx, user, Ability::UpdatePipeline, &project).await?;

    let retryable: Vec<Job> = ctx
        .latest_jobs(pipeline.id)
        .await?
        .into_iter()
        .filter(|job| job.is_retryable() && matches!(job.status, Status::Failed | Status::Canceled))
        .collect();

    if retryable.is_empty() {
        return Err(ServiceError::unprocessable("Pipeline has no jobs to retry"));
    }

    for job in &retryable {
        clone_and_requeue(ctx, job, user.map(|user| user.id)).await?;
    }

    tracing::info!(pipeline_id, jobs = retryable.len(), "Pipeline retried");

    ctx.pipeline(pipeline_id).await
}

/// Start a manual job
pub async fn play_job(ctx: &ServiceContext, user: Option<&User>, job_id: i64) -> ServiceResult<Job> {
    let job = pipeline::get_job(ctx, user, job_id).await?;
    let project = ctx.project(job.project_id).await?;
    auth::authorize(ctx, user, Ability::UpdateBuild, &project).await?;
    let user = user.ok_or_else(|| ServiceError::unauthorized("Authentication required"))?;

    if job.status != Status::Manual {
        return Err(ServiceError::unprocessable("Job is not playable"));
    }

    if job.protected && !auth::can_update_branch(ctx, user, &project, &job.ref_name).await? {
        return Err(ServiceError::forbidden(format!(
            "You are not allowed to run jobs on protected ref {}",
            job.ref_name
        )));
    }

    let now = Utc::now();
    let job = retry_lock(ctx, job, |job| {
        job.fire(JobEvent::Enqueue, now)?;
        job.user_id = Some(user.id);
        Ok(())
    })
    .await?;

    tracing::info!(job_id = job.id, user_id = user.id, "Manual job started");

    if job.is_bridge() {
        ctx.queue
            .enqueue(BackgroundJob::CreateDownstreamPipeline { bridge_id: job.id });
    }
    ctx.queue.enqueue(BackgroundJob::ProcessPipeline {
        pipeline_id: job.pipeline_id,
    });

    Ok(job)
}

/// Retry a failed build automatically when its `retry` option allows it
pub async fn auto_retry_if_allowed(ctx: &ServiceContext, job: &Job) -> ServiceResult<()> {
    if job.is_bridge() || job.retried || job.status != Status::Failed {
        return Ok(());
    }

    if !job
        .failure_reason
        .is_some_and(|reason| reason.is_auto_retryable())
    {
        return Ok(());
    }

    let previous_attempts = ctx
        .store
        .pipeline_jobs(job.pipeline_id)
        .await?
        .iter()
        .filter(|other| other.name == job.name && other.retried)
        .count();

    if previous_attempts >= job.options.retry as usize {
        return Ok(());
    }

    let clone = clone_and_requeue(ctx, job, job.user_id).await?;
    tracing::info!(
        job_id = job.id,
        retry_id = clone.id,
        attempt = previous_attempts + 1,
        "Job retried automatically"
    );

    Ok(())
}

/// Clone `job` into a new attempt and let processing pick it up
pub async fn clone_and_requeue(
    ctx: &ServiceContext,
    job: &Job,
    user_id: Option<i64>,
) -> ServiceResult<Job> {
    let mut attributes = job.clone_for_retry();
    if user_id.is_some() {
        attributes.user_id = user_id;
    }

    let clone = ctx.store.retry_job(job, attributes).await.map_err(|err| {
        if err.is_stale() {
            ServiceError::conflict("Job has already been retried")
        } else {
            err.into()
        }
    })?;

    tracing::info!(
        job_id = job.id,
        clone_id = clone.id,
        pipeline_id = job.pipeline_id,
        "Job retried"
    );

    reset_skipped_jobs(ctx, &clone).await?;

    let pipeline = ctx.pipeline(clone.pipeline_id).await?;
    reset_upstream_bridges(ctx, &pipeline).await?;

    ctx.queue.enqueue(BackgroundJob::ProcessPipeline {
        pipeline_id: clone.pipeline_id,
    });

    Ok(clone)
}

/// Reset skipped jobs that depend on `retried` back to `created`
///
/// Dependents are the `needs` descendants plus stage-scheduled jobs of later
/// stages; they are reset in dependency order.
async fn reset_skipped_jobs(ctx: &ServiceContext, retried: &Job) -> ServiceResult<()> {
    let jobs = ctx.latest_jobs(retried.pipeline_id).await?;
    let nodes: Vec<(String, Vec<String>)> = jobs
        .iter()
        .map(|job| (job.name.clone(), job.needs.clone()))
        .collect();

    let mut dependents: HashSet<String> = dag::descendants(&nodes, &[retried.name.as_str()])
        .into_iter()
        .collect();
    dependents.extend(
        jobs.iter()
            .filter(|job| {
                job.scheduling_type == SchedulingType::Stage && job.stage_idx > retried.stage_idx
            })
            .map(|job| job.name.clone()),
    );

    let order = dag::topological_order(&nodes).unwrap_or_else(|| {
        let mut by_stage: Vec<usize> = (0..jobs.len()).collect();
        by_stage.sort_by_key(|&i| jobs[i].stage_idx);
        by_stage
    });

    let now = Utc::now();
    for index in order {
        let job = &jobs[index];
        if job.status != Status::Skipped || !dependents.contains(&job.name) {
            continue;
        }

        let result = retry_lock(ctx, job.clone(), |job| {
            job.fire(JobEvent::Process, now)?;
            Ok(())
        })
        .await;

        match result {
            Ok(job) => tracing::debug!(job_id = job.id, "Skipped job reset"),
            Err(err) if err.reason == Reason::UnprocessableEntity => {
                tracing::debug!(job_id = job.id, "Skipped job moved on: {}", err)
            }
            Err(err) => return Err(err),
        }
    }

    Ok(())
}

/// Reset finished dependent bridges above `pipeline`, walking upward
async fn reset_upstream_bridges(ctx: &ServiceContext, pipeline: &Pipeline) -> ServiceResult<()> {
    let mut upstream = pipeline.upstream;
    let now = Utc::now();

    while let Some(link) = upstream {
        let bridge = ctx.job(link.job_id).await?;
        if !bridge.is_dependent_bridge() || !bridge.status.is_complete() {
            break;
        }

        let bridge = retry_lock(ctx, bridge, |bridge| {
            bridge.fire(JobEvent::Requeue, now)?;
            Ok(())
        })
        .await?;
        tracing::info!(job_id = bridge.id, "Bridge reset by downstream retry");

        ctx.queue.enqueue(BackgroundJob::ProcessPipeline {
            pipeline_id: link.pipeline_id,
        });

        upstream = ctx.pipeline(link.pipeline_id).await?.upstream;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::test_support::{TestEnv, simple_config};
    use conduit_core::domain::job::FailureReason;
    use conduit_core::domain::project::MemberRole;

    #[tokio::test]
    async fn test_retry_resets_skipped_dependents() {
        let env = TestEnv::new();
        let (owner, pipeline) = env.pipeline_from(simple_config()).await;
        env.drain().await;
        let failed = env.finish(pipeline.id, "compile", Status::Failed).await;
        env.drain().await;
        assert_eq!(env.status_of(pipeline.id, "unit").await, Status::Skipped);

        let clone = retry_job(&env.ctx, Some(&owner), failed.id).await.unwrap();
        assert_ne!(clone.id, failed.id);
        assert_eq!(clone.status, Status::Created);
        assert_eq!(clone.runner_id, None);
        assert_eq!(clone.token, None);
        assert_eq!(clone.user_id, Some(owner.id));

        let attempts = env.attempts(pipeline.id, "compile").await;
        assert_eq!(attempts.len(), 2);
        assert!(attempts[0].retried);
        assert!(!attempts[1].retried);

        assert_eq!(env.status_of(pipeline.id, "unit").await, Status::Created);

        env.drain().await;
        assert_eq!(env.status_of(pipeline.id, "compile").await, Status::Pending);
        assert_eq!(env.status_of(pipeline.id, "unit").await, Status::Created);
        let pipeline = env.ctx.pipeline(pipeline.id).await.unwrap();
        assert_eq!(pipeline.status, Status::Pending);
    }

    #[tokio::test]
    async fn test_only_finished_latest_builds_are_retryable() {
        let env = TestEnv::new();
        let (owner, pipeline) = env.pipeline_from(simple_config()).await;
        env.drain().await;

        let pending = env.job_named(pipeline.id, "compile").await;
        let err = retry_job(&env.ctx, Some(&owner), pending.id).await.unwrap_err();
        assert_eq!(err.reason, Reason::UnprocessableEntity);
        assert_eq!(err.message, "Job is not retryable");

        let failed = env.finish(pipeline.id, "compile", Status::Failed).await;
        retry_job(&env.ctx, Some(&owner), failed.id).await.unwrap();

        // The original is no longer the latest attempt
        let err = retry_job(&env.ctx, Some(&owner), failed.id).await.unwrap_err();
        assert_eq!(err.reason, Reason::UnprocessableEntity);
    }

    #[tokio::test]
    async fn test_reporters_cannot_retry() {
        let env = TestEnv::new();
        let (_, pipeline) = env.pipeline_from(simple_config()).await;
        env.drain().await;
        let failed = env.finish(pipeline.id, "compile", Status::Failed).await;

        let reporter = env.user("reporter").await;
        let project = env.ctx.project(pipeline.project_id).await.unwrap();
        env.member(&project, &reporter, MemberRole::Reporter).await;

        let err = retry_job(&env.ctx, Some(&reporter), failed.id)
            .await
            .unwrap_err();
        assert_eq!(err.reason, Reason::Forbidden);
    }

    #[tokio::test]
    async fn test_retry_pipeline() {
        let env = TestEnv::new();
        let (owner, pipeline) = env.pipeline_from(simple_config()).await;
        env.drain().await;

        let err = retry_pipeline(&env.ctx, Some(&owner), pipeline.id)
            .await
            .unwrap_err();
        assert_eq!(err.reason, Reason::UnprocessableEntity);

        env.finish(pipeline.id, "compile", Status::Canceled).await;
        env.drain().await;

        retry_pipeline(&env.ctx, Some(&owner), pipeline.id)
            .await
            .unwrap();
        env.drain().await;

        assert_eq!(env.attempts(pipeline.id, "compile").await.len(), 2);
        assert_eq!(env.status_of(pipeline.id, "compile").await, Status::Pending);
    }

    #[tokio::test]
    async fn test_play_manual_job() {
        let env = TestEnv::new();
        let (owner, pipeline) = env
            .pipeline_from(
                r#"return { jobs = { { name = "deploy", script = "ship", when = "manual" } } }"#,
            )
            .await;
        env.drain().await;
        let job = env.job_named(pipeline.id, "deploy").await;
        assert_eq!(job.status, Status::Manual);

        let played = play_job(&env.ctx, Some(&owner), job.id).await.unwrap();
        assert_eq!(played.status, Status::Pending);
        assert_eq!(played.user_id, Some(owner.id));

        let err = play_job(&env.ctx, Some(&owner), job.id).await.unwrap_err();
        assert_eq!(err.reason, Reason::UnprocessableEntity);
    }

    #[tokio::test]
    async fn test_protected_manual_job_needs_branch_access() {
        let env = TestEnv::new();
        let owner = env.user("owner").await;
        let new_project = serde_json::from_value(serde_json::json!({
            "path": "acme/prod",
            "protected_branches": ["main"],
        }))
        .unwrap();
        let project = env.ctx.store.create_project(new_project, "t").await.unwrap();
        env.member(&project, &owner, MemberRole::Owner).await;
        let developer = env.user("dev").await;
        env.member(&project, &developer, MemberRole::Developer).await;

        let pipeline = env
            .try_create_pipeline(
                &owner,
                &project,
                r#"return { jobs = { { name = "deploy", script = "ship", when = "manual" } } }"#,
            )
            .await
            .unwrap();
        env.drain().await;
        let job = env.job_named(pipeline.id, "deploy").await;
        assert!(job.protected);

        let err = play_job(&env.ctx, Some(&developer), job.id).await.unwrap_err();
        assert_eq!(err.reason, Reason::Forbidden);

        play_job(&env.ctx, Some(&owner), job.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_auto_retry_respects_the_limit() {
        let env = TestEnv::new();
        let (_, pipeline) = env
            .pipeline_from(r#"return { jobs = { { name = "flaky", script = "maybe", retry = 1 } } }"#)
            .await;
        env.drain().await;

        let failed = env.finish(pipeline.id, "flaky", Status::Failed).await;
        auto_retry_if_allowed(&env.ctx, &failed).await.unwrap();
        assert_eq!(env.attempts(pipeline.id, "flaky").await.len(), 2);

        env.drain().await;
        let failed = env.finish(pipeline.id, "flaky", Status::Failed).await;
        auto_retry_if_allowed(&env.ctx, &failed).await.unwrap();
        assert_eq!(env.attempts(pipeline.id, "flaky").await.len(), 2);
    }

    #[tokio::test]
    async fn test_config_failures_are_not_auto_retried() {
        let env = TestEnv::new();
        let (_, pipeline) = env
            .pipeline_from(r#"return { jobs = { { name = "flaky", script = "maybe", retry = 2 } } }"#)
            .await;
        env.drain().await;

        let mut job = env.job_named(pipeline.id, "flaky").await;
        job.drop_with(FailureReason::InsufficientBridgePermissions, None, Utc::now())
            .unwrap();
        let job = env.ctx.store.update_job(&job).await.unwrap();

        auto_retry_if_allowed(&env.ctx, &job).await.unwrap();
        assert_eq!(env.attempts(pipeline.id, "flaky").await.len(), 1);
    }
}
