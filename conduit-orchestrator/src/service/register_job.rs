//! Job assignment
//!
//! A runner asks for work and gets the first pending build in its scope
//! that it can take. Assignment is a compare-and-set on the job, so two
//! runners racing for the same build cannot both win; the loser moves on to
//! the next candidate.

use chrono::Utc;
use conduit_core::JobEvent;
use conduit_core::domain::job::Job;
use conduit_core::domain::project::Project;
use conduit_core::domain::runner::{Runner, RunnerType};
use conduit_core::dto::job::{JobPayload, RequestJob};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::ServiceResult;
use crate::repository::RunnerScope;
use crate::service::context::ServiceContext;
use crate::service::runner;
use crate::worker::BackgroundJob;

/// Result of a job request
#[derive(Debug, Clone, PartialEq)]
pub enum RequestOutcome {
    Assigned(Box<JobPayload>),
    /// Nothing to do for this runner
    NoJob,
    /// Every matching build was taken by a concurrent request
    Conflict,
}

/// Assign the next pending build to the runner owning `req.token`
pub async fn request_job(ctx: &ServiceContext, req: RequestJob) -> ServiceResult<RequestOutcome> {
    let runner = runner::verify_runner(ctx, &req.token).await?;
    ctx.store.touch_runner(runner.id, Utc::now()).await?;

    if !runner.active {
        return Ok(RequestOutcome::NoJob);
    }

    let Some(scope) = scope_of(&runner) else {
        return Ok(RequestOutcome::NoJob);
    };

    let mut candidates: Vec<Job> = ctx
        .store
        .pending_builds(&runner, &scope, ctx.limits().max_queue_depth)
        .await?;

    // Shared runners favour projects with the fewest running shared builds
    if runner.is_shared() {
        let running = ctx.store.running_shared_builds().await?;
        candidates.sort_by_key(|job| (running.get(&job.project_id).copied().unwrap_or(0), job.id));
    }

    let mut conflicted = false;
    for candidate in candidates {
        match assign(ctx, &runner, candidate).await? {
            Some(job) => {
                let project = ctx.project(job.project_id).await?;
                let payload = build_payload(&job, &project);

                tracing::info!(
                    job_id = job.id,
                    runner_id = runner.id,
                    pipeline_id = job.pipeline_id,
                    "Job assigned to runner"
                );

                ctx.queue.enqueue(BackgroundJob::ProcessPipeline {
                    pipeline_id: job.pipeline_id,
                });

                return Ok(RequestOutcome::Assigned(Box::new(payload)));
            }
            None => conflicted = true,
        }
    }

    if conflicted {
        Ok(RequestOutcome::Conflict)
    } else {
        Ok(RequestOutcome::NoJob)
    }
}

fn scope_of(runner: &Runner) -> Option<RunnerScope> {
    match runner.runner_type {
        RunnerType::Instance => Some(RunnerScope::Instance),
        RunnerType::Group => runner.group_id.map(RunnerScope::Group),
        RunnerType::Project => Some(RunnerScope::Projects(runner.project_ids.clone())),
    }
}

/// One assignment attempt; `None` when the build changed under us
async fn assign(ctx: &ServiceContext, runner: &Runner, mut job: Job) -> ServiceResult<Option<Job>> {
    if job.fire(JobEvent::Run, Utc::now()).is_err() {
        return Ok(None);
    }
    job.runner_id = Some(runner.id);
    job.token = Some(Uuid::new_v4().simple().to_string());

    match ctx.store.update_job(&job).await {
        Ok(job) => Ok(Some(job)),
        Err(err) if err.is_stale() => {
            tracing::debug!(job_id = job.id, runner_id = runner.id, "Lost assignment race");
            Ok(None)
        }
        Err(err) => Err(err.into()),
    }
}

fn build_payload(job: &Job, project: &Project) -> JobPayload {
    let mut variables = BTreeMap::from([
        ("CI".to_string(), "true".to_string()),
        ("CI_JOB_ID".to_string(), job.id.to_string()),
        ("CI_JOB_NAME".to_string(), job.name.clone()),
        ("CI_JOB_STAGE".to_string(), job.stage.clone()),
        ("CI_PIPELINE_ID".to_string(), job.pipeline_id.to_string()),
        ("CI_PROJECT_ID".to_string(), project.id.to_string()),
        ("CI_PROJECT_PATH".to_string(), project.path.clone()),
        ("CI_COMMIT_REF_NAME".to_string(), job.ref_name.clone()),
        ("CI_COMMIT_SHA".to_string(), job.sha.clone()),
    ]);
    if let Some(environment) = &job.environment {
        variables.insert("CI_ENVIRONMENT_NAME".to_string(), environment.clone());
    }
    // User variables win over the predefined ones
    variables.extend(job.variables.clone());

    JobPayload {
        id: job.id,
        token: job.token.clone().unwrap_or_default(),
        name: job.name.clone(),
        stage: job.stage.clone(),
        project_id: job.project_id,
        pipeline_id: job.pipeline_id,
        ref_name: job.ref_name.clone(),
        sha: job.sha.clone(),
        script: job.options.script.clone(),
        image: job.options.image.clone(),
        timeout_secs: job.options.timeout_secs,
        variables,
        artifacts: job.options.artifacts.clone(),
    }
}
