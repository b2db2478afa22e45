//! Pipeline Service
//!
//! Builds pipelines from their definitions and serves pipeline and job
//! reads. Building parses the definition, seeds stages and jobs and hands
//! the persisted pipeline to processing.

use conduit_core::domain::definition::PipelineDefinition;
use conduit_core::domain::job::{Job, JobKind, JobOptions, NewJob, SchedulingType};
use conduit_core::domain::pipeline::{
    LockState, NewPipeline, NewStage, Pipeline, PipelineSource, UpstreamLink,
};
use conduit_core::domain::project::{Project, User};
use conduit_core::dto::pipeline::{CreatePipeline, PipelineDetails, TriggerPipeline};
use std::collections::BTreeMap;

use crate::error::{ServiceError, ServiceResult};
use crate::service::auth::{self, Ability};
use crate::service::context::ServiceContext;
use crate::worker::BackgroundJob;

/// Where the pipeline definition comes from
#[derive(Debug, Clone)]
pub enum DefinitionSource {
    /// Already parsed, as carried by a child trigger
    Inline(PipelineDefinition),
    /// Lua source supplied with the request
    Source(String),
    /// The project's stored definition
    ProjectConfig,
}

/// Everything needed to build a pipeline for a project
#[derive(Debug, Clone)]
pub struct PipelineRequest {
    pub ref_name: String,
    pub sha: String,
    pub source: PipelineSource,
    pub user_id: Option<i64>,
    pub variables: BTreeMap<String, String>,
    pub upstream: Option<UpstreamLink>,
    pub definition: DefinitionSource,
}

/// Create a pipeline on behalf of a user
pub async fn create_pipeline(
    ctx: &ServiceContext,
    user: Option<&User>,
    project_id: i64,
    req: CreatePipeline,
) -> ServiceResult<Pipeline> {
    let project = auth::readable_project(ctx, user, project_id).await?;
    auth::authorize(ctx, user, Ability::CreatePipeline, &project).await?;

    if req.ref_name.trim().is_empty() {
        return Err(ServiceError::bad_request("Ref cannot be empty"));
    }

    let definition = match req.config {
        Some(source) => DefinitionSource::Source(source),
        None => DefinitionSource::ProjectConfig,
    };

    build_pipeline(
        ctx,
        &project,
        PipelineRequest {
            sha: req.sha.unwrap_or_else(|| req.ref_name.clone()),
            ref_name: req.ref_name,
            source: PipelineSource::Api,
            user_id: user.map(|u| u.id),
            variables: req.variables,
            upstream: None,
            definition,
        },
    )
    .await
}

/// Create a pipeline with a trigger token, acting as the trigger's owner
pub async fn trigger_pipeline(
    ctx: &ServiceContext,
    project_id: i64,
    req: TriggerPipeline,
) -> ServiceResult<Pipeline> {
    let trigger = ctx
        .store
        .find_trigger_by_token(&req.token)
        .await?
        .filter(|trigger| trigger.project_id == project_id)
        .ok_or_else(|| ServiceError::unauthorized("Invalid trigger token"))?;

    let owner = ctx
        .store
        .find_user(trigger.owner_id)
        .await?
        .ok_or_else(|| ServiceError::forbidden("Trigger owner no longer exists"))?;

    let project = ctx.project(project_id).await?;
    auth::authorize(ctx, Some(&owner), Ability::CreatePipeline, &project).await?;

    build_pipeline(
        ctx,
        &project,
        PipelineRequest {
            sha: req.ref_name.clone(),
            ref_name: req.ref_name,
            source: PipelineSource::Trigger,
            user_id: Some(owner.id),
            variables: req.variables,
            upstream: None,
            definition: DefinitionSource::ProjectConfig,
        },
    )
    .await
}

/// Parse, seed and persist a pipeline, then enqueue its processing
pub async fn build_pipeline(
    ctx: &ServiceContext,
    project: &Project,
    req: PipelineRequest,
) -> ServiceResult<Pipeline> {
    let definition = resolve_definition(project, req.definition.clone())?;

    let (stages, jobs) = seed_jobs(&definition, project, &req);

    let max_jobs = ctx.limits().max_jobs_per_pipeline;
    if jobs.len() > max_jobs {
        return Err(ServiceError::unprocessable(format!(
            "Pipeline has too many jobs ({} > {})",
            jobs.len(),
            max_jobs
        )));
    }

    let locked = if project.keep_latest_artifact {
        LockState::ArtifactsLocked
    } else {
        LockState::Unlocked
    };

    let new_pipeline = NewPipeline {
        project_id: project.id,
        ref_name: req.ref_name,
        sha: req.sha,
        tag: false,
        source: req.source,
        locked,
        user_id: req.user_id,
        variables: req.variables,
        upstream: req.upstream,
    };

    let pipeline = ctx
        .store
        .create_pipeline(new_pipeline, stages, jobs)
        .await?;

    tracing::info!(
        pipeline_id = pipeline.id,
        project_id = project.id,
        iid = pipeline.iid,
        source = ?pipeline.source,
        "Pipeline created for {}",
        pipeline.ref_name
    );

    ctx.queue.enqueue(BackgroundJob::ProcessPipeline {
        pipeline_id: pipeline.id,
    });

    Ok(pipeline)
}

/// Pipeline with its stages, latest jobs and downstream pipelines
pub async fn get_pipeline_details(
    ctx: &ServiceContext,
    user: Option<&User>,
    pipeline_id: i64,
) -> ServiceResult<PipelineDetails> {
    let pipeline = readable_pipeline(ctx, user, pipeline_id).await?;

    let stages = ctx.store.stages(pipeline.id).await?;
    let jobs = ctx.latest_jobs(pipeline.id).await?;
    let downstream = ctx.store.downstream_pipelines(pipeline.id).await?;

    Ok(PipelineDetails {
        pipeline,
        stages,
        jobs,
        downstream,
    })
}

/// Newest pipelines of a project
pub async fn list_pipelines(
    ctx: &ServiceContext,
    user: Option<&User>,
    project_id: i64,
    limit: usize,
) -> ServiceResult<Vec<Pipeline>> {
    let project = auth::readable_project(ctx, user, project_id).await?;
    let pipelines = ctx.store.list_pipelines(project.id, limit.clamp(1, 100)).await?;
    Ok(pipelines)
}

/// Every job of a pipeline, retried attempts included
pub async fn list_pipeline_jobs(
    ctx: &ServiceContext,
    user: Option<&User>,
    pipeline_id: i64,
) -> ServiceResult<Vec<Job>> {
    let pipeline = readable_pipeline(ctx, user, pipeline_id).await?;
    let jobs = ctx.store.pipeline_jobs(pipeline.id).await?;
    Ok(jobs)
}

pub async fn get_job(ctx: &ServiceContext, user: Option<&User>, job_id: i64) -> ServiceResult<Job> {
    let job = ctx.job(job_id).await?;
    auth::readable_project(ctx, user, job.project_id)
        .await
        .map_err(|_| ServiceError::not_found(format!("Job {} not found", job_id)))?;
    Ok(job)
}

async fn readable_pipeline(
    ctx: &ServiceContext,
    user: Option<&User>,
    pipeline_id: i64,
) -> ServiceResult<Pipeline> {
    let pipeline = ctx.pipeline(pipeline_id).await?;
    auth::readable_project(ctx, user, pipeline.project_id)
        .await
        .map_err(|_| ServiceError::not_found(format!("Pipeline {} not found", pipeline_id)))?;
    Ok(pipeline)
}

// =============================================================================
// Helper Functions
// =============================================================================

fn resolve_definition(
    project: &Project,
    source: DefinitionSource,
) -> ServiceResult<PipelineDefinition> {
    match source {
        DefinitionSource::Inline(definition) => {
            conduit_lua::validate_definition(&definition).map_err(invalid_config)?;
            Ok(definition)
        }
        DefinitionSource::Source(source) => conduit_lua::parse_pipeline_definition(&source)
            .map_err(|e| invalid_config(format!("{:#}", e))),
        DefinitionSource::ProjectConfig => {
            let source = project
                .ci_config
                .as_deref()
                .ok_or_else(|| ServiceError::unprocessable("Missing pipeline configuration"))?;
            conduit_lua::parse_pipeline_definition(source)
                .map_err(|e| invalid_config(format!("{:#}", e)))
        }
    }
}

fn invalid_config(err: impl std::fmt::Display) -> ServiceError {
    ServiceError::unprocessable(format!("Invalid pipeline configuration: {}", err))
}

/// Stages and jobs of a new pipeline
///
/// Only stages holding jobs are kept, numbered densely in declared order.
/// Job variables layer definition globals, then the job's own, then the
/// request's.
pub fn seed_jobs(
    definition: &PipelineDefinition,
    project: &Project,
    req: &PipelineRequest,
) -> (Vec<NewStage>, Vec<NewJob>) {
    let stages: Vec<NewStage> = definition
        .stages
        .iter()
        .filter(|stage| definition.jobs.iter().any(|job| &job.stage == *stage))
        .enumerate()
        .map(|(position, name)| NewStage {
            name: name.clone(),
            position: position as i32,
        })
        .collect();

    let protected = project.is_protected_ref(&req.ref_name);

    let jobs = definition
        .jobs
        .iter()
        .map(|job| {
            let stage_idx = stages
                .iter()
                .find(|stage| stage.name == job.stage)
                .map(|stage| stage.position)
                .unwrap_or_default();

            let mut variables = definition.variables.clone();
            variables.extend(job.variables.clone());
            variables.extend(req.variables.clone());

            NewJob {
                name: job.name.clone(),
                stage: job.stage.clone(),
                stage_idx,
                kind: if job.trigger.is_some() {
                    JobKind::Bridge
                } else {
                    JobKind::Build
                },
                when: job.when,
                scheduling_type: if job.needs.is_some() {
                    SchedulingType::Dag
                } else {
                    SchedulingType::Stage
                },
                needs: job.needs.clone().unwrap_or_default(),
                tags: job.tags.clone(),
                protected,
                allow_failure: job.allow_failure,
                environment: job.environment.clone(),
                ref_name: req.ref_name.clone(),
                tag: false,
                sha: req.sha.clone(),
                options: JobOptions {
                    script: job.script.clone(),
                    image: job.image.clone(),
                    timeout_secs: job.timeout_secs,
                    artifacts: job.artifacts.clone(),
                    start_in_secs: job.start_in_secs,
                    retry: job.retry,
                    trigger: job.trigger.clone(),
                },
                variables,
                user_id: req.user_id,
            }
        })
        .collect();

    (stages, jobs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Reason;
    use crate::service::test_support::{TestEnv, simple_config};
    use chrono::Utc;
    use conduit_core::Status;
    use conduit_core::domain::project::Visibility;

    fn project(protected: &[&str]) -> Project {
        Project {
            id: 1,
            path: "acme/web".to_string(),
            group_id: None,
            visibility: Visibility::Private,
            shared_runners_enabled: true,
            protected_branches: protected.iter().map(|b| b.to_string()).collect(),
            ci_config: None,
            keep_latest_artifact: true,
            runners_token: "t".to_string(),
            artifacts_size: 0,
            created_at: Utc::now(),
        }
    }

    fn request(ref_name: &str) -> PipelineRequest {
        PipelineRequest {
            ref_name: ref_name.to_string(),
            sha: "abc".to_string(),
            source: PipelineSource::Api,
            user_id: Some(1),
            variables: BTreeMap::from([("DEPLOY".to_string(), "request".to_string())]),
            upstream: None,
            definition: DefinitionSource::ProjectConfig,
        }
    }

    #[test]
    fn test_seed_skips_empty_stages() {
        let definition = conduit_lua::parse_pipeline_definition(
            r#"
            return {
                stages = { "build", "lint", "test", "deploy" },
                variables = { DEPLOY = "global", LEVEL = "global" },
                jobs = {
                    { name = "compile", stage = "build", script = "make" },
                    { name = "unit", stage = "test", script = "make test", needs = { "compile" },
                      variables = { LEVEL = "job" } },
                    { name = "ship", stage = "deploy", trigger = { project = "ops/infra" } },
                },
            }
            "#,
        )
        .unwrap();

        let (stages, jobs) = seed_jobs(&definition, &project(&["main"]), &request("main"));

        let names: Vec<_> = stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["build", "test", "deploy"]);

        assert_eq!(jobs[0].stage_idx, 0);
        assert_eq!(jobs[1].stage_idx, 1);
        assert_eq!(jobs[2].stage_idx, 2);

        assert_eq!(jobs[0].scheduling_type, SchedulingType::Stage);
        assert_eq!(jobs[1].scheduling_type, SchedulingType::Dag);
        assert_eq!(jobs[1].needs, vec!["compile"]);
        assert_eq!(jobs[2].kind, JobKind::Bridge);
        assert!(jobs.iter().all(|job| job.protected));

        assert_eq!(jobs[1].variables["LEVEL"], "job");
        assert_eq!(jobs[1].variables["DEPLOY"], "request");
        assert_eq!(jobs[0].variables["LEVEL"], "global");
    }

    #[test]
    fn test_unprotected_ref() {
        let definition =
            conduit_lua::parse_pipeline_definition(r#"return { jobs = { { name = "a", script = "true" } } }"#)
                .unwrap();
        let (_, jobs) = seed_jobs(&definition, &project(&["main"]), &request("feature"));
        assert!(!jobs[0].protected);
    }

    #[tokio::test]
    async fn test_create_pipeline_enqueues_processing() {
        let env = TestEnv::new();
        let (_, pipeline) = env.pipeline_from(simple_config()).await;

        assert_eq!(pipeline.status, Status::Created);
        assert_eq!(pipeline.iid, 1);
        assert_eq!(pipeline.locked, LockState::ArtifactsLocked);
        assert_eq!(
            env.queue.jobs(),
            vec![BackgroundJob::ProcessPipeline {
                pipeline_id: pipeline.id
            }]
        );

        let stages = env.ctx.store.stages(pipeline.id).await.unwrap();
        assert_eq!(stages.len(), 2);
    }

    #[tokio::test]
    async fn test_create_pipeline_rejects_bad_config() {
        let env = TestEnv::new();
        let owner = env.user("owner").await;
        let project = env.project(&owner, "acme/web").await;

        let err = create_pipeline(
            &env.ctx,
            Some(&owner),
            project.id,
            CreatePipeline {
                ref_name: "main".to_string(),
                sha: None,
                config: Some("return {".to_string()),
                variables: BTreeMap::new(),
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.reason, Reason::UnprocessableEntity);

        // No stored definition either
        let err = create_pipeline(
            &env.ctx,
            Some(&owner),
            project.id,
            CreatePipeline {
                ref_name: "main".to_string(),
                sha: None,
                config: None,
                variables: BTreeMap::new(),
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.reason, Reason::UnprocessableEntity);
        assert_eq!(err.message, "Missing pipeline configuration");
    }

    #[tokio::test]
    async fn test_create_pipeline_enforces_job_limit() {
        let env = TestEnv::with_config(|config| config.limits.max_jobs_per_pipeline = 1);
        let owner = env.user("owner").await;
        let project = env.project(&owner, "acme/web").await;

        let err = env
            .try_create_pipeline(&owner, &project, simple_config())
            .await
            .unwrap_err();
        assert_eq!(err.reason, Reason::UnprocessableEntity);
        assert!(env.queue.jobs().is_empty());
    }

    #[tokio::test]
    async fn test_reporters_cannot_create_pipelines() {
        let env = TestEnv::new();
        let owner = env.user("owner").await;
        let reporter = env.user("reporter").await;
        let project = env.project(&owner, "acme/web").await;
        env.member(&project, &reporter, conduit_core::domain::project::MemberRole::Reporter)
            .await;

        let err = env
            .try_create_pipeline(&reporter, &project, simple_config())
            .await
            .unwrap_err();
        assert_eq!(err.reason, Reason::Forbidden);
    }

    #[tokio::test]
    async fn test_trigger_token_acts_as_owner() {
        let env = TestEnv::new();
        let owner = env.user("owner").await;
        let project = env
            .project_with_config(&owner, "acme/web", simple_config())
            .await;
        let created = crate::service::project::create_trigger(
            &env.ctx,
            Some(&owner),
            project.id,
            Default::default(),
        )
        .await
        .unwrap();

        let pipeline = trigger_pipeline(
            &env.ctx,
            project.id,
            TriggerPipeline {
                token: created.token,
                ref_name: "main".to_string(),
                variables: BTreeMap::new(),
            },
        )
        .await
        .unwrap();
        assert_eq!(pipeline.source, PipelineSource::Trigger);
        assert_eq!(pipeline.user_id, Some(owner.id));

        let err = trigger_pipeline(
            &env.ctx,
            project.id,
            TriggerPipeline {
                token: "bogus".to_string(),
                ref_name: "main".to_string(),
                variables: BTreeMap::new(),
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.reason, Reason::Unauthorized);
    }
}
