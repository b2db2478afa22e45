//! Pipeline processing
//!
//! Walks the latest jobs of a pipeline and moves every `created` job whose
//! gate has resolved: stage-scheduled jobs are gated by all jobs of earlier
//! stages, DAG jobs by the jobs they need. The gate's composite status is
//! mapped through the job's `when` policy. Afterwards stage and pipeline
//! statuses are recomputed from the jobs.

use chrono::{Duration as ChronoDuration, Utc};
use conduit_core::domain::artifact::ArtifactType;
use conduit_core::domain::job::{FailureReason, Job, SchedulingType, WhenPolicy};
use conduit_core::domain::pipeline::{LockState, Pipeline};
use conduit_core::{JobEvent, Status, composite_status};
use std::time::Duration;

use crate::error::{Reason, ServiceResult};
use crate::service::artifacts;
use crate::service::context::ServiceContext;
use crate::service::lease::{self, in_lock};
use crate::service::locking::retry_lock;
use crate::worker::BackgroundJob;

/// Delay before retrying a pipeline whose processing lease is taken
const BUSY_RETRY_DELAY: Duration = Duration::from_secs(1);

/// What to do with a `created` job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Gate not resolved yet
    Wait,
    Enqueue,
    Actionize,
    Schedule,
    Skip,
}

/// Map a resolved gate status through the job's policy
pub fn decide(when: WhenPolicy, scheduling: SchedulingType, gate: Status) -> Decision {
    if !gate.is_complete() {
        return Decision::Wait;
    }

    let valid = match when {
        WhenPolicy::OnSuccess | WhenPolicy::Manual | WhenPolicy::Delayed => {
            gate == Status::Success
                || (scheduling == SchedulingType::Stage && gate == Status::Skipped)
        }
        WhenPolicy::OnFailure => gate == Status::Failed,
        WhenPolicy::Always => matches!(gate, Status::Success | Status::Failed | Status::Skipped),
    };

    match (valid, when) {
        (false, _) => Decision::Skip,
        (true, WhenPolicy::Manual) => Decision::Actionize,
        (true, WhenPolicy::Delayed) => Decision::Schedule,
        (true, _) => Decision::Enqueue,
    }
}

/// Composite status of the jobs gating `job`; success when nothing gates it
pub fn gate_status(jobs: &[Job], job: &Job) -> Status {
    let gating: Vec<(Status, bool)> = match job.scheduling_type {
        SchedulingType::Stage => jobs
            .iter()
            .filter(|other| other.stage_idx < job.stage_idx)
            .map(Job::status_entry)
            .collect(),
        SchedulingType::Dag => jobs
            .iter()
            .filter(|other| job.needs.contains(&other.name))
            .map(Job::status_entry)
            .collect(),
    };

    composite_status(gating).unwrap_or(Status::Success)
}

/// Process a pipeline, deferring when another worker holds its lease
pub async fn process_pipeline(ctx: &ServiceContext, pipeline_id: i64) -> ServiceResult<()> {
    let key = lease::processing_key(pipeline_id);
    let ttl = ctx.limits().processing_lease_ttl;

    let processed = in_lock(ctx, &key, ttl, || process_locked(ctx, pipeline_id)).await?;

    if processed.is_none() {
        tracing::debug!(pipeline_id, "Pipeline is being processed elsewhere, retrying later");
        ctx.queue
            .enqueue_in(BackgroundJob::ProcessPipeline { pipeline_id }, BUSY_RETRY_DELAY);
    }

    Ok(())
}

async fn process_locked(ctx: &ServiceContext, pipeline_id: i64) -> ServiceResult<()> {
    let pipeline = ctx.pipeline(pipeline_id).await?;

    let mut jobs = ctx.latest_jobs(pipeline.id).await?;
    jobs.sort_by_key(|job| (job.stage_idx, job.id));

    // Decisions can unblock later jobs; repeat until nothing moves
    loop {
        let mut changed = false;

        for index in 0..jobs.len() {
            if jobs[index].status != Status::Created {
                continue;
            }

            let gate = gate_status(&jobs, &jobs[index]);
            let job = &jobs[index];
            let decision = decide(job.when, job.scheduling_type, gate);
            if decision == Decision::Wait {
                continue;
            }

            jobs[index] = apply_decision(ctx, job.clone(), decision).await?;
            changed |= jobs[index].status != Status::Created;
        }

        if !changed {
            break;
        }
    }

    update_stages(ctx, pipeline.id, &jobs).await?;
    update_pipeline_status(ctx, pipeline, &jobs).await
}

async fn apply_decision(ctx: &ServiceContext, job: Job, decision: Decision) -> ServiceResult<Job> {
    let job_id = job.id;
    let now = Utc::now();

    let result = retry_lock(ctx, job, |job| {
        match decision {
            Decision::Enqueue => job.fire(JobEvent::Enqueue, now)?,
            Decision::Actionize => job.fire(JobEvent::Actionize, now)?,
            Decision::Schedule => {
                job.fire(JobEvent::Schedule, now)?;
                let delay = job.options.start_in_secs.unwrap_or_default();
                job.scheduled_at = Some(now + ChronoDuration::seconds(delay as i64));
            }
            Decision::Skip => job.fire(JobEvent::Skip, now)?,
            Decision::Wait => {}
        }
        Ok(())
    })
    .await;

    let job = match result {
        Ok(job) => job,
        // Moved by someone else in the meantime
        Err(err) if err.reason == Reason::UnprocessableEntity => {
            tracing::debug!(job_id, "Job changed while processing: {}", err);
            return ctx.job(job_id).await;
        }
        Err(err) => return Err(err),
    };

    tracing::debug!(
        job_id = job.id,
        pipeline_id = job.pipeline_id,
        status = %job.status,
        "Processed job {}",
        job.name
    );

    if job.is_bridge() && job.status == Status::Pending {
        ctx.queue
            .enqueue(BackgroundJob::CreateDownstreamPipeline { bridge_id: job.id });
    }

    Ok(job)
}

async fn update_stages(ctx: &ServiceContext, pipeline_id: i64, jobs: &[Job]) -> ServiceResult<()> {
    for stage in ctx.store.stages(pipeline_id).await? {
        let status = composite_status(
            jobs.iter()
                .filter(|job| job.stage == stage.name)
                .map(Job::status_entry),
        );

        if let Some(status) = status
            && status != stage.status
        {
            ctx.store.update_stage_status(stage.id, status).await?;
        }
    }
    Ok(())
}

async fn update_pipeline_status(
    ctx: &ServiceContext,
    pipeline: Pipeline,
    jobs: &[Job],
) -> ServiceResult<()> {
    let Some(status) = composite_status(jobs.iter().map(Job::status_entry)) else {
        return Ok(());
    };

    let previous = pipeline.status;
    if previous == status {
        return Ok(());
    }

    let now = Utc::now();
    let pipeline = retry_lock(ctx, pipeline, |pipeline| {
        pipeline.apply_status(status, now);
        Ok(())
    })
    .await?;

    tracing::info!(
        pipeline_id = pipeline.id,
        from = %previous,
        to = %status,
        "Pipeline status changed"
    );

    if status.is_complete() && !previous.is_complete() {
        on_pipeline_completed(ctx, &pipeline).await?;
    }

    Ok(())
}

/// Hooks run once when a pipeline reaches a terminal status
async fn on_pipeline_completed(ctx: &ServiceContext, pipeline: &Pipeline) -> ServiceResult<()> {
    if let Some(upstream) = pipeline.upstream {
        let bridge = ctx.job(upstream.job_id).await?;
        if bridge.is_dependent_bridge() && !bridge.status.is_complete() {
            inherit_downstream_status(ctx, bridge, pipeline.status).await?;
            ctx.queue.enqueue(BackgroundJob::ProcessPipeline {
                pipeline_id: upstream.pipeline_id,
            });
        }
    }

    if pipeline.status == Status::Success && pipeline.locked == LockState::ArtifactsLocked {
        ctx.queue.enqueue(BackgroundJob::UnlockPreviousPipelines {
            project_id: pipeline.project_id,
            ref_name: pipeline.ref_name.clone(),
            before_iid: pipeline.iid,
        });
    }

    let has_coverage = ctx
        .store
        .pipeline_job_artifacts(pipeline.id)
        .await?
        .iter()
        .any(|artifact| artifact.file_type == ArtifactType::Coverage);
    if has_coverage {
        artifacts::generate_coverage(ctx, pipeline).await?;
    }

    Ok(())
}

/// A dependent bridge mirrors its downstream pipeline
async fn inherit_downstream_status(
    ctx: &ServiceContext,
    bridge: Job,
    downstream: Status,
) -> ServiceResult<()> {
    let now = Utc::now();
    let result = retry_lock(ctx, bridge, |bridge| {
        match downstream {
            Status::Success | Status::Skipped => bridge.fire(JobEvent::Succeed, now)?,
            Status::Canceled => bridge.fire(JobEvent::Cancel, now)?,
            _ => bridge.drop_with(FailureReason::UnknownFailure, None, now)?,
        }
        Ok(())
    })
    .await;

    match result {
        Ok(bridge) => {
            tracing::info!(
                job_id = bridge.id,
                status = %bridge.status,
                "Bridge inherited downstream status"
            );
            Ok(())
        }
        Err(err) if err.reason == Reason::UnprocessableEntity => {
            tracing::debug!("Bridge already finished: {}", err);
            Ok(())
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::test_support::{TestEnv, simple_config};
    use conduit_core::domain::job::JobKind;

    #[test]
    fn test_on_success_requires_success() {
        let stage = SchedulingType::Stage;
        assert_eq!(
            decide(WhenPolicy::OnSuccess, stage, Status::Success),
            Decision::Enqueue
        );
        assert_eq!(
            decide(WhenPolicy::OnSuccess, stage, Status::Failed),
            Decision::Skip
        );
        assert_eq!(
            decide(WhenPolicy::OnSuccess, stage, Status::Canceled),
            Decision::Skip
        );
        assert_eq!(
            decide(WhenPolicy::OnSuccess, stage, Status::Running),
            Decision::Wait
        );
    }

    #[test]
    fn test_skipped_gate_depends_on_scheduling() {
        assert_eq!(
            decide(WhenPolicy::OnSuccess, SchedulingType::Stage, Status::Skipped),
            Decision::Enqueue
        );
        assert_eq!(
            decide(WhenPolicy::OnSuccess, SchedulingType::Dag, Status::Skipped),
            Decision::Skip
        );
    }

    #[test]
    fn test_other_policies() {
        let stage = SchedulingType::Stage;
        assert_eq!(
            decide(WhenPolicy::OnFailure, stage, Status::Failed),
            Decision::Enqueue
        );
        assert_eq!(
            decide(WhenPolicy::OnFailure, stage, Status::Success),
            Decision::Skip
        );
        assert_eq!(
            decide(WhenPolicy::Always, stage, Status::Failed),
            Decision::Enqueue
        );
        assert_eq!(
            decide(WhenPolicy::Always, stage, Status::Canceled),
            Decision::Skip
        );
        assert_eq!(
            decide(WhenPolicy::Manual, stage, Status::Success),
            Decision::Actionize
        );
        assert_eq!(
            decide(WhenPolicy::Delayed, stage, Status::Success),
            Decision::Schedule
        );
        assert_eq!(
            decide(WhenPolicy::Manual, stage, Status::Manual),
            Decision::Wait
        );
    }

    #[tokio::test]
    async fn test_first_stage_is_enqueued() {
        let env = TestEnv::new();
        let (_, pipeline) = env.pipeline_from(simple_config()).await;
        env.drain().await;

        assert_eq!(env.status_of(pipeline.id, "compile").await, Status::Pending);
        assert_eq!(env.status_of(pipeline.id, "unit").await, Status::Created);

        let pipeline = env.ctx.pipeline(pipeline.id).await.unwrap();
        assert_eq!(pipeline.status, Status::Pending);

        let stages = env.ctx.store.stages(pipeline.id).await.unwrap();
        assert_eq!(stages[0].status, Status::Pending);
        assert_eq!(stages[1].status, Status::Created);
    }

    #[tokio::test]
    async fn test_failed_stage_skips_on_success_jobs() {
        let env = TestEnv::new();
        let (_, pipeline) = env.pipeline_from(simple_config()).await;
        env.drain().await;

        env.finish(pipeline.id, "compile", Status::Failed).await;
        env.drain().await;

        assert_eq!(env.status_of(pipeline.id, "unit").await, Status::Skipped);
        let pipeline = env.ctx.pipeline(pipeline.id).await.unwrap();
        assert_eq!(pipeline.status, Status::Failed);
        assert!(pipeline.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_dag_jobs_ignore_stage_order() {
        let env = TestEnv::new();
        let (_, pipeline) = env
            .pipeline_from(
                r#"
                return {
                    stages = { "build", "test" },
                    jobs = {
                        { name = "slow", stage = "build", script = "sleep 100" },
                        { name = "fast", stage = "build", script = "true" },
                        { name = "check", stage = "test", script = "true", needs = { "fast" } },
                        { name = "lint", stage = "test", script = "true", needs = {} },
                    },
                }
                "#,
            )
            .await;
        env.drain().await;

        assert_eq!(env.status_of(pipeline.id, "lint").await, Status::Pending);
        assert_eq!(env.status_of(pipeline.id, "check").await, Status::Created);

        env.finish(pipeline.id, "fast", Status::Success).await;
        env.drain().await;

        assert_eq!(env.status_of(pipeline.id, "check").await, Status::Pending);
        assert_eq!(env.status_of(pipeline.id, "slow").await, Status::Pending);
    }

    #[tokio::test]
    async fn test_manual_and_delayed_jobs() {
        let env = TestEnv::new();
        let (_, pipeline) = env
            .pipeline_from(
                r#"
                return {
                    jobs = {
                        { name = "deploy", stage = "deploy", script = "ship", when = "manual" },
                        { name = "later", stage = "deploy", script = "ship", when = "delayed",
                          start_in = "10 minutes" },
                    },
                }
                "#,
            )
            .await;
        env.drain().await;

        let deploy = env.job_named(pipeline.id, "deploy").await;
        assert_eq!(deploy.status, Status::Manual);
        assert!(deploy.allow_failure);

        let later = env.job_named(pipeline.id, "later").await;
        assert_eq!(later.status, Status::Scheduled);
        let delay = later.scheduled_at.unwrap() - Utc::now();
        assert!(delay.num_seconds() > 590 && delay.num_seconds() <= 600);
    }

    #[tokio::test]
    async fn test_enqueued_bridge_triggers_downstream() {
        let env = TestEnv::new();
        let (_, pipeline) = env
            .pipeline_from(
                r#"
                return {
                    jobs = {
                        { name = "spawn", trigger = { child = { jobs = { { name = "inner", script = "true" } } } } },
                    },
                }
                "#,
            )
            .await;
        env.queue.clear();

        process_pipeline(&env.ctx, pipeline.id).await.unwrap();

        let bridge = env.job_named(pipeline.id, "spawn").await;
        assert_eq!(bridge.kind, JobKind::Bridge);
        assert!(env.queue.jobs().contains(&BackgroundJob::CreateDownstreamPipeline {
            bridge_id: bridge.id
        }));
    }

    #[tokio::test]
    async fn test_busy_pipeline_is_deferred() {
        let env = TestEnv::new();
        let (_, pipeline) = env.pipeline_from(simple_config()).await;
        env.queue.clear();

        env.ctx
            .store
            .try_obtain_lease(
                &lease::processing_key(pipeline.id),
                uuid::Uuid::new_v4(),
                Duration::from_secs(60),
            )
            .await
            .unwrap();

        process_pipeline(&env.ctx, pipeline.id).await.unwrap();

        assert_eq!(env.status_of(pipeline.id, "compile").await, Status::Created);
        assert_eq!(
            env.queue.delayed(),
            vec![(
                BackgroundJob::ProcessPipeline {
                    pipeline_id: pipeline.id
                },
                BUSY_RETRY_DELAY
            )]
        );
    }
}
