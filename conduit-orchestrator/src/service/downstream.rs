//! Downstream pipelines
//!
//! A pending bridge creates a child pipeline (same project, inline
//! definition) or a multi-project pipeline (another project's stored
//! definition). Preconditions are checked in a fixed order; the first one
//! that fails drops the bridge with the matching failure reason.

use chrono::Utc;
use conduit_core::domain::job::{FailureReason, Job, TriggerSpec, TriggerTarget};
use conduit_core::domain::pipeline::{Pipeline, PipelineSource, UpstreamLink};
use conduit_core::domain::project::{Project, User};
use conduit_core::{JobEvent, Status};
use std::collections::{HashMap, VecDeque};

use crate::error::{Reason, ServiceResult};
use crate::service::auth::{self, Ability};
use crate::service::context::ServiceContext;
use crate::service::locking::retry_lock;
use crate::service::pipeline::{self, DefinitionSource, PipelineRequest};
use crate::service::rate_limit::TriggerKey;
use crate::worker::BackgroundJob;

/// Branch multi-project triggers target when none is given
pub const DEFAULT_TARGET_BRANCH: &str = "main";

/// Same (project, ref, source) allowed this many times in an upstream chain
const MAX_CHAIN_REPEATS: usize = 2;

/// A precondition that stops a bridge from creating its pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    /// The bridge already created its pipeline
    AlreadyTriggered,
    ProjectAccessible,
    InvalidTrigger,
    MaxNestedChildren,
    HierarchySize,
    Permissions,
    LoopDetected,
    RateLimit,
}

impl Precondition {
    /// Failure reason for the bridge; `None` when nothing needs to change
    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self {
            Precondition::AlreadyTriggered => None,
            Precondition::ProjectAccessible => Some(FailureReason::DownstreamBridgeProjectNotFound),
            Precondition::InvalidTrigger => Some(FailureReason::InvalidBridgeTrigger),
            Precondition::MaxNestedChildren => {
                Some(FailureReason::ReachedMaxDescendantPipelinesDepth)
            }
            Precondition::HierarchySize => Some(FailureReason::ReachedMaxPipelineHierarchySize),
            Precondition::Permissions => Some(FailureReason::InsufficientBridgePermissions),
            Precondition::LoopDetected => Some(FailureReason::PipelineLoopDetected),
            Precondition::RateLimit => {
                Some(FailureReason::ReachedDownstreamPipelineTriggerRateLimit)
            }
        }
    }
}

/// Resolved destination of a bridge
struct Target {
    project: Project,
    ref_name: String,
    sha: String,
    source: PipelineSource,
    definition: DefinitionSource,
}

/// Create the downstream pipeline of a pending bridge
pub async fn create_downstream_pipeline(ctx: &ServiceContext, bridge_id: i64) -> ServiceResult<()> {
    let bridge = ctx.job(bridge_id).await?;
    if bridge.status != Status::Pending {
        tracing::debug!(bridge_id, status = %bridge.status, "Bridge is not pending, skipping");
        return Ok(());
    }

    let upstream = ctx.pipeline(bridge.pipeline_id).await?;

    let Some(trigger) = bridge.options.trigger.clone() else {
        return fail_bridge(ctx, bridge, Precondition::InvalidTrigger).await;
    };

    let target = match check_preconditions(ctx, &bridge, &trigger, &upstream).await? {
        Ok(target) => target,
        Err(Precondition::AlreadyTriggered) => {
            tracing::debug!(bridge_id, "Downstream pipeline already exists");
            return Ok(());
        }
        Err(precondition) => return fail_bridge(ctx, bridge, precondition).await,
    };

    let now = Utc::now();
    let bridge = retry_lock(ctx, bridge, |bridge| {
        bridge.fire(JobEvent::Run, now)?;
        Ok(())
    })
    .await?;

    let created = pipeline::build_pipeline(
        ctx,
        &target.project,
        PipelineRequest {
            ref_name: target.ref_name,
            sha: target.sha,
            source: target.source,
            user_id: bridge.user_id,
            variables: bridge.variables.clone(),
            upstream: Some(UpstreamLink {
                pipeline_id: upstream.id,
                job_id: bridge.id,
                project_id: upstream.project_id,
            }),
            definition: target.definition,
        },
    )
    .await;

    match created {
        Ok(downstream) => {
            tracing::info!(
                bridge_id,
                pipeline_id = downstream.id,
                project_id = downstream.project_id,
                "Downstream pipeline created"
            );

            if !bridge.is_dependent_bridge() {
                retry_lock(ctx, bridge, |bridge| {
                    bridge.fire(JobEvent::Succeed, now)?;
                    Ok(())
                })
                .await?;
            }
        }
        Err(err) => {
            tracing::warn!(bridge_id, "Downstream pipeline creation failed: {}", err);
            retry_lock(ctx, bridge, |bridge| {
                bridge.drop_with(FailureReason::DownstreamPipelineCreationFailed, None, now)?;
                Ok(())
            })
            .await?;
        }
    }

    ctx.queue.enqueue(BackgroundJob::ProcessPipeline {
        pipeline_id: upstream.id,
    });

    Ok(())
}

async fn fail_bridge(
    ctx: &ServiceContext,
    bridge: Job,
    precondition: Precondition,
) -> ServiceResult<()> {
    let Some(reason) = precondition.failure_reason() else {
        return Ok(());
    };

    tracing::warn!(
        bridge_id = bridge.id,
        reason = %reason,
        "Downstream pipeline not created"
    );

    let pipeline_id = bridge.pipeline_id;
    let now = Utc::now();
    let result = retry_lock(ctx, bridge, |bridge| {
        bridge.drop_with(reason, None, now)?;
        Ok(())
    })
    .await;

    match result {
        Ok(_) => {}
        Err(err) if err.reason == Reason::UnprocessableEntity => {
            tracing::debug!("Bridge finished before it could be dropped: {}", err);
        }
        Err(err) => return Err(err),
    }

    ctx.queue
        .enqueue(BackgroundJob::ProcessPipeline { pipeline_id });
    Ok(())
}

/// Evaluate the preconditions in order
async fn check_preconditions(
    ctx: &ServiceContext,
    bridge: &Job,
    trigger: &TriggerSpec,
    upstream: &Pipeline,
) -> ServiceResult<Result<Target, Precondition>> {
    if ctx.store.pipeline_for_bridge(bridge.id).await?.is_some() {
        return Ok(Err(Precondition::AlreadyTriggered));
    }

    let user = match bridge.user_id {
        Some(user_id) => ctx.store.find_user(user_id).await?,
        None => None,
    };

    let target = match &trigger.target {
        TriggerTarget::Child { definition } => Target {
            project: ctx.project(upstream.project_id).await?,
            ref_name: upstream.ref_name.clone(),
            sha: upstream.sha.clone(),
            source: PipelineSource::ParentPipeline,
            definition: DefinitionSource::Inline((**definition).clone()),
        },
        TriggerTarget::Project { project, branch } => {
            let found = ctx.store.find_project_by_path(project).await?;
            let readable = match &found {
                Some(found) => auth::can(ctx, user.as_ref(), Ability::ReadProject, found).await?,
                None => false,
            };
            let Some(found) = found.filter(|_| readable) else {
                return Ok(Err(Precondition::ProjectAccessible));
            };

            let ref_name = branch
                .clone()
                .unwrap_or_else(|| DEFAULT_TARGET_BRANCH.to_string());
            Target {
                project: found,
                sha: ref_name.clone(),
                ref_name,
                source: PipelineSource::Pipeline,
                definition: DefinitionSource::ProjectConfig,
            }
        }
    };

    let is_child = matches!(trigger.target, TriggerTarget::Child { .. });
    if !is_child && target.project.id == upstream.project_id {
        return Ok(Err(Precondition::InvalidTrigger));
    }

    if is_child && project_ancestors(ctx, upstream).await? > ctx.limits().max_nested_children {
        return Ok(Err(Precondition::MaxNestedChildren));
    }

    if hierarchy_size(ctx, upstream).await? >= ctx.limits().pipeline_hierarchy_size {
        return Ok(Err(Precondition::HierarchySize));
    }

    let Some(user) = user else {
        return Ok(Err(Precondition::Permissions));
    };
    if !has_permissions(ctx, &user, upstream, &target).await? {
        return Ok(Err(Precondition::Permissions));
    }

    if has_cyclic_dependency(ctx, upstream).await? {
        return Ok(Err(Precondition::LoopDetected));
    }

    let key = TriggerKey {
        project_id: upstream.project_id,
        user_id: Some(user.id),
        sha: upstream.sha.clone(),
    };
    if ctx.rate_limiter.throttled(&key).await {
        return Ok(Err(Precondition::RateLimit));
    }

    Ok(Ok(target))
}

async fn has_permissions(
    ctx: &ServiceContext,
    user: &User,
    upstream: &Pipeline,
    target: &Target,
) -> ServiceResult<bool> {
    let upstream_project = ctx.project(upstream.project_id).await?;

    Ok(
        auth::can(ctx, Some(user), Ability::UpdatePipeline, &upstream_project).await?
            && auth::can(ctx, Some(user), Ability::CreatePipeline, &target.project).await?
            && auth::can_update_branch(ctx, user, &target.project, &target.ref_name).await?,
    )
}

/// `pipeline` and its parents within the same project
async fn project_ancestors(ctx: &ServiceContext, pipeline: &Pipeline) -> ServiceResult<usize> {
    let mut count = 1;
    let mut current = pipeline.clone();

    while current.is_child() {
        let Some(link) = current.upstream else {
            break;
        };
        current = ctx.pipeline(link.pipeline_id).await?;
        count += 1;
    }

    Ok(count)
}

/// Number of pipelines in the hierarchy `pipeline` belongs to
async fn hierarchy_size(ctx: &ServiceContext, pipeline: &Pipeline) -> ServiceResult<usize> {
    let mut root = pipeline.clone();
    while let Some(link) = root.upstream {
        root = ctx.pipeline(link.pipeline_id).await?;
    }

    let mut count = 0;
    let mut queue = VecDeque::from([root]);
    while let Some(current) = queue.pop_front() {
        count += 1;
        queue.extend(ctx.store.downstream_pipelines(current.id).await?);
    }

    Ok(count)
}

/// `pipeline` followed by every pipeline above it
async fn self_and_upstreams(ctx: &ServiceContext, pipeline: &Pipeline) -> ServiceResult<Vec<Pipeline>> {
    let mut chain = vec![pipeline.clone()];
    while let Some(link) = chain.last().and_then(|last| last.upstream) {
        chain.push(ctx.pipeline(link.pipeline_id).await?);
    }
    Ok(chain)
}

/// The same project, ref and source repeat too often above the bridge
async fn has_cyclic_dependency(ctx: &ServiceContext, upstream: &Pipeline) -> ServiceResult<bool> {
    let mut tally: HashMap<(i64, String, PipelineSource), usize> = HashMap::new();

    for pipeline in self_and_upstreams(ctx, upstream).await? {
        if pipeline.is_child() {
            continue;
        }
        *tally
            .entry((pipeline.project_id, pipeline.ref_name, pipeline.source))
            .or_default() += 1;
    }

    Ok(tally.values().any(|&occurrences| occurrences > MAX_CHAIN_REPEATS))
}
