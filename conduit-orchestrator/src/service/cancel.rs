//! Cancellation
//!
//! Canceling is best effort: every cancelable job gets one `retry_lock`
//! attempt sequence and jobs that finished in the meantime are left alone.
//! Downstream pipelines are canceled too, inline or through background work.

use chrono::Utc;
use conduit_core::JobEvent;
use conduit_core::domain::job::Job;
use conduit_core::domain::pipeline::Pipeline;
use conduit_core::domain::project::User;
use conduit_core::dto::pipeline::CancelPipeline;
use std::collections::VecDeque;

use crate::error::{Reason, ServiceError, ServiceResult};
use crate::service::auth::{self, Ability};
use crate::service::context::ServiceContext;
use crate::service::locking::retry_lock;
use crate::service::pipeline;
use crate::worker::BackgroundJob;

/// Cancel a pipeline and its downstream pipelines
pub async fn cancel_pipeline(
    ctx: &ServiceContext,
    user: Option<&User>,
    pipeline_id: i64,
    req: CancelPipeline,
) -> ServiceResult<Pipeline> {
    let pipeline = ctx.pipeline(pipeline_id).await?;
    let project = auth::readable_project(ctx, user, pipeline.project_id)
        .await
        .map_err(|_| ServiceError::not_found(format!("Pipeline {} not found", pipeline_id)))?;
    auth::authorize(ctx, user, Ability::CancelPipeline, &project).await?;

    if !pipeline.is_cancelable() {
        return Err(ServiceError::unprocessable("Pipeline is not cancelable"));
    }

    let canceled = cancel_jobs(ctx, pipeline.id).await?;
    tracing::info!(pipeline_id, canceled, "Pipeline canceled");

    if req.async_downstream {
        for downstream in ctx.store.downstream_pipelines(pipeline.id).await? {
            ctx.queue.enqueue(BackgroundJob::CancelPipeline {
                pipeline_id: downstream.id,
            });
        }
    } else {
        cancel_descendants(ctx, pipeline.id).await?;
    }

    ctx.queue.enqueue(BackgroundJob::ProcessPipeline { pipeline_id });

    ctx.pipeline(pipeline_id).await
}

/// Worker entry point for downstream cancellation
pub async fn cancel_pipeline_in_background(
    ctx: &ServiceContext,
    pipeline_id: i64,
) -> ServiceResult<()> {
    let canceled = cancel_jobs(ctx, pipeline_id).await?;
    tracing::info!(pipeline_id, canceled, "Downstream pipeline canceled");

    for downstream in ctx.store.downstream_pipelines(pipeline_id).await? {
        ctx.queue.enqueue(BackgroundJob::CancelPipeline {
            pipeline_id: downstream.id,
        });
    }

    ctx.queue.enqueue(BackgroundJob::ProcessPipeline { pipeline_id });
    Ok(())
}

/// Cancel a single job; a bridge also cancels the pipeline it created
pub async fn cancel_job(ctx: &ServiceContext, user: Option<&User>, job_id: i64) -> ServiceResult<Job> {
    let job = pipeline::get_job(ctx, user, job_id).await?;
    let project = ctx.project(job.project_id).await?;
    auth::authorize(ctx, user, Ability::UpdateBuild, &project).await?;

    if !job.status.is_cancelable() {
        return Err(ServiceError::unprocessable("Job is not cancelable"));
    }

    let now = Utc::now();
    let job = retry_lock(ctx, job, |job| {
        job.fire(JobEvent::Cancel, now)?;
        Ok(())
    })
    .await?;

    tracing::info!(job_id = job.id, pipeline_id = job.pipeline_id, "Job canceled");

    if job.is_bridge()
        && let Some(downstream) = ctx.store.pipeline_for_bridge(job.id).await?
    {
        ctx.queue.enqueue(BackgroundJob::CancelPipeline {
            pipeline_id: downstream.id,
        });
    }

    ctx.queue.enqueue(BackgroundJob::ProcessPipeline {
        pipeline_id: job.pipeline_id,
    });

    Ok(job)
}

/// Cancel every cancelable latest job; returns how many were canceled
async fn cancel_jobs(ctx: &ServiceContext, pipeline_id: i64) -> ServiceResult<usize> {
    let now = Utc::now();
    let mut canceled = 0;

    for job in ctx.latest_jobs(pipeline_id).await? {
        if !job.status.is_cancelable() {
            continue;
        }

        let job_id = job.id;
        let result = retry_lock(ctx, job, |job| {
            job.fire(JobEvent::Cancel, now)?;
            Ok(())
        })
        .await;

        match result {
            Ok(_) => canceled += 1,
            Err(err) if matches!(err.reason, Reason::UnprocessableEntity | Reason::Conflict) => {
                tracing::debug!(job_id, "Job not canceled: {}", err);
            }
            Err(err) => return Err(err),
        }
    }

    Ok(canceled)
}

/// Cancel the whole downstream hierarchy of `root` in place
async fn cancel_descendants(ctx: &ServiceContext, root: i64) -> ServiceResult<()> {
    let mut queue: VecDeque<Pipeline> = ctx.store.downstream_pipelines(root).await?.into();

    while let Some(pipeline) = queue.pop_front() {
        let canceled = cancel_jobs(ctx, pipeline.id).await?;
        tracing::debug!(pipeline_id = pipeline.id, canceled, "Downstream pipeline canceled");

        ctx.queue.enqueue(BackgroundJob::ProcessPipeline {
            pipeline_id: pipeline.id,
        });
        queue.extend(ctx.store.downstream_pipelines(pipeline.id).await?);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::test_support::{TestEnv, simple_config};
    use conduit_core::Status;
    use conduit_core::domain::project::MemberRole;

    #[tokio::test]
    async fn test_cancel_running_pipeline() {
        let env = TestEnv::new();
        let (owner, pipeline) = env.pipeline_from(simple_config()).await;
        env.drain().await;
        env.start(pipeline.id, "compile").await;

        cancel_pipeline(&env.ctx, Some(&owner), pipeline.id, CancelPipeline::default())
            .await
            .unwrap();
        env.drain().await;

        assert_eq!(env.status_of(pipeline.id, "compile").await, Status::Canceled);
        assert_eq!(env.status_of(pipeline.id, "unit").await, Status::Canceled);
        let pipeline = env.ctx.pipeline(pipeline.id).await.unwrap();
        assert_eq!(pipeline.status, Status::Canceled);

        let err = cancel_pipeline(&env.ctx, Some(&owner), pipeline.id, CancelPipeline::default())
            .await
            .unwrap_err();
        assert_eq!(err.reason, Reason::UnprocessableEntity);
    }

    #[tokio::test]
    async fn test_finished_jobs_are_left_alone() {
        let env = TestEnv::new();
        let (owner, pipeline) = env.pipeline_from(simple_config()).await;
        env.drain().await;
        env.finish(pipeline.id, "compile", Status::Success).await;
        env.drain().await;

        cancel_pipeline(&env.ctx, Some(&owner), pipeline.id, CancelPipeline::default())
            .await
            .unwrap();

        assert_eq!(env.status_of(pipeline.id, "compile").await, Status::Success);
        assert_eq!(env.status_of(pipeline.id, "unit").await, Status::Canceled);
    }

    #[tokio::test]
    async fn test_reporters_cannot_cancel() {
        let env = TestEnv::new();
        let (_, pipeline) = env.pipeline_from(simple_config()).await;
        let reporter = env.user("reporter").await;
        let project = env.ctx.project(pipeline.project_id).await.unwrap();
        env.member(&project, &reporter, MemberRole::Reporter).await;

        let err = cancel_pipeline(
            &env.ctx,
            Some(&reporter),
            pipeline.id,
            CancelPipeline::default(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.reason, Reason::Forbidden);
    }

    #[tokio::test]
    async fn test_cancel_single_job() {
        let env = TestEnv::new();
        let (owner, pipeline) = env.pipeline_from(simple_config()).await;
        env.drain().await;
        let job = env.job_named(pipeline.id, "compile").await;

        let canceled = cancel_job(&env.ctx, Some(&owner), job.id).await.unwrap();
        assert_eq!(canceled.status, Status::Canceled);

        let err = cancel_job(&env.ctx, Some(&owner), job.id).await.unwrap_err();
        assert_eq!(err.reason, Reason::UnprocessableEntity);
        assert_eq!(err.message, "Job is not cancelable");

        env.drain().await;
        assert_eq!(env.status_of(pipeline.id, "unit").await, Status::Skipped);
    }
}
