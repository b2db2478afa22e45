//! Stuck and scheduled job sweep

use chrono::{Duration as ChronoDuration, Utc};
use conduit_core::domain::job::{FailureReason, Job, JobKind};
use conduit_core::{JobEvent, Status};
use std::collections::BTreeSet;
use std::time::Duration;

use crate::error::{Reason, ServiceResult};
use crate::service::context::ServiceContext;
use crate::service::locking::retry_lock;
use crate::service::retry;
use crate::worker::BackgroundJob;

const BATCH_SIZE: usize = 100;
/// Full batches processed per status in one sweep
const MAX_BATCHES: usize = 10;

/// Drop jobs nobody is working on and enqueue due scheduled jobs
pub async fn drop_stuck_jobs(ctx: &ServiceContext) -> ServiceResult<()> {
    let sweeps = ctx.sweeps();
    let mut touched = BTreeSet::new();

    let running = drop_older_than(ctx, Status::Running, sweeps.stuck_running_timeout, &mut touched).await?;
    let pending = drop_older_than(ctx, Status::Pending, sweeps.stuck_pending_timeout, &mut touched).await?;
    let scheduled = enqueue_due(ctx, &mut touched).await?;

    if running + pending + scheduled > 0 {
        tracing::info!(running, pending, scheduled, "Stuck job sweep finished");
    }

    for pipeline_id in touched {
        ctx.queue
            .enqueue(BackgroundJob::ProcessPipeline { pipeline_id });
    }
    Ok(())
}

async fn drop_older_than(
    ctx: &ServiceContext,
    status: Status,
    timeout: Duration,
    touched: &mut BTreeSet<i64>,
) -> ServiceResult<usize> {
    let before = Utc::now() - ChronoDuration::from_std(timeout).unwrap_or(ChronoDuration::zero());
    let mut dropped = 0;

    for _ in 0..MAX_BATCHES {
        let batch = ctx
            .store
            .jobs_for_sweep(status, Some(JobKind::Build), before, BATCH_SIZE)
            .await?;
        let full = batch.len() == BATCH_SIZE;

        for job in batch {
            if let Some(job) = apply(ctx, job, |job, now| {
                job.drop_with(FailureReason::StuckOrTimeoutFailure, None, now)
            })
            .await?
            {
                tracing::warn!(job_id = job.id, pipeline_id = job.pipeline_id, %status, "Dropped stuck job");
                touched.insert(job.pipeline_id);
                retry::auto_retry_if_allowed(ctx, &job).await?;
                dropped += 1;
            }
        }

        if !full {
            break;
        }
    }

    Ok(dropped)
}

async fn enqueue_due(ctx: &ServiceContext, touched: &mut BTreeSet<i64>) -> ServiceResult<usize> {
    let mut enqueued = 0;

    for _ in 0..MAX_BATCHES {
        let batch = ctx
            .store
            .jobs_for_sweep(Status::Scheduled, None, Utc::now(), BATCH_SIZE)
            .await?;
        let full = batch.len() == BATCH_SIZE;

        for job in batch {
            if let Some(job) = apply(ctx, job, |job, now| job.fire(JobEvent::Enqueue, now)).await? {
                tracing::debug!(job_id = job.id, "Scheduled job is due");
                if job.is_bridge() {
                    ctx.queue
                        .enqueue(BackgroundJob::CreateDownstreamPipeline { bridge_id: job.id });
                }
                touched.insert(job.pipeline_id);
                enqueued += 1;
            }
        }

        if !full {
            break;
        }
    }

    Ok(enqueued)
}

/// Apply a transition; `None` when the job moved on in the meantime
async fn apply<F>(ctx: &ServiceContext, job: Job, mut transition: F) -> ServiceResult<Option<Job>>
where
    F: FnMut(&mut Job, chrono::DateTime<Utc>) -> Result<(), conduit_core::TransitionError> + Send,
{
    let job_id = job.id;
    let result = retry_lock(ctx, job, |job| {
        transition(job, Utc::now())?;
        Ok(())
    })
    .await;

    match result {
        Ok(job) => Ok(Some(job)),
        Err(err) if matches!(err.reason, Reason::UnprocessableEntity | Reason::Conflict) => {
            tracing::debug!(job_id, "Sweep skipped job: {}", err);
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::test_support::{TestEnv, simple_config};

    async fn backdate(env: &TestEnv, job: Job, hours: i64) {
        let mut job = env.ctx.job(job.id).await.unwrap();
        let past = Utc::now() - ChronoDuration::hours(hours);
        job.updated_at = past;
        job.queued_at = Some(past);
        if job.status == Status::Scheduled {
            job.scheduled_at = Some(past);
        }
        env.ctx.store.update_job(&job).await.unwrap();
    }

    #[tokio::test]
    async fn test_silent_running_job_is_dropped() {
        let env = TestEnv::new();
        let (_, pipeline) = env.pipeline_from(simple_config()).await;
        env.drain().await;
        let job = env.start(pipeline.id, "compile").await;
        backdate(&env, job, 2).await;

        drop_stuck_jobs(&env.ctx).await.unwrap();
        env.drain().await;

        let job = env.job_named(pipeline.id, "compile").await;
        assert_eq!(job.status, Status::Failed);
        assert_eq!(job.failure_reason, Some(FailureReason::StuckOrTimeoutFailure));
        assert_eq!(env.status_of(pipeline.id, "unit").await, Status::Skipped);
    }

    #[tokio::test]
    async fn test_recent_jobs_are_left_alone() {
        let env = TestEnv::new();
        let (_, pipeline) = env.pipeline_from(simple_config()).await;
        env.drain().await;
        env.start(pipeline.id, "compile").await;

        drop_stuck_jobs(&env.ctx).await.unwrap();
        assert_eq!(env.status_of(pipeline.id, "compile").await, Status::Running);
    }

    #[tokio::test]
    async fn test_pending_job_queued_for_a_day_is_dropped() {
        let env = TestEnv::new();
        let (_, pipeline) = env.pipeline_from(simple_config()).await;
        env.drain().await;
        let job = env.job_named(pipeline.id, "compile").await;
        backdate(&env, job, 25).await;

        drop_stuck_jobs(&env.ctx).await.unwrap();
        assert_eq!(env.status_of(pipeline.id, "compile").await, Status::Failed);
    }

    #[tokio::test]
    async fn test_pending_bridges_do_not_hide_stuck_builds() {
        let env = TestEnv::new();
        let (_, pipeline) = env
            .pipeline_from(
                r#"
                local jobs = {}
                for i = 1, 100 do
                    jobs[i] = { name = "deploy" .. i, trigger = { project = "acme/other" } }
                end
                jobs[101] = { name = "late", script = "true" }
                return { jobs = jobs }
                "#,
            )
            .await;
        crate::service::processing::process_pipeline(&env.ctx, pipeline.id)
            .await
            .unwrap();
        // Leave the bridges pending instead of triggering them
        env.queue.clear();

        for job in env.ctx.latest_jobs(pipeline.id).await.unwrap() {
            backdate(&env, job, 25).await;
        }

        drop_stuck_jobs(&env.ctx).await.unwrap();

        let late = env.job_named(pipeline.id, "late").await;
        assert_eq!(late.status, Status::Failed);
        assert_eq!(late.failure_reason, Some(FailureReason::StuckOrTimeoutFailure));
        assert_eq!(env.status_of(pipeline.id, "deploy1").await, Status::Pending);
    }

    #[tokio::test]
    async fn test_stuck_job_with_retries_is_retried() {
        let env = TestEnv::new();
        let (_, pipeline) = env
            .pipeline_from(r#"return { jobs = { { name = "flaky", script = "true", retry = 1 } } }"#)
            .await;
        env.drain().await;
        let job = env.start(pipeline.id, "flaky").await;
        backdate(&env, job, 2).await;

        drop_stuck_jobs(&env.ctx).await.unwrap();
        env.drain().await;

        let attempts = env.attempts(pipeline.id, "flaky").await;
        assert_eq!(attempts.len(), 2);
        assert!(attempts[0].retried);
        assert_eq!(attempts[1].status, Status::Pending);
    }

    #[tokio::test]
    async fn test_due_scheduled_job_is_enqueued() {
        let env = TestEnv::new();
        let (_, pipeline) = env
            .pipeline_from(
                r#"return { jobs = { { name = "later", script = "true", when = "delayed", start_in = "10 minutes" } } }"#,
            )
            .await;
        env.drain().await;
        let job = env.job_named(pipeline.id, "later").await;
        assert_eq!(job.status, Status::Scheduled);

        drop_stuck_jobs(&env.ctx).await.unwrap();
        assert_eq!(env.status_of(pipeline.id, "later").await, Status::Scheduled);

        backdate(&env, job, 1).await;
        drop_stuck_jobs(&env.ctx).await.unwrap();
        assert_eq!(env.status_of(pipeline.id, "later").await, Status::Pending);
    }
}
