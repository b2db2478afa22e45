//! Artifact lifecycle
//!
//! Uploads, the expiry sweep, physical removal of deleted objects and the
//! unlock sweep that leaves only the newest pipeline per ref locked.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use conduit_core::Status;
use conduit_core::domain::artifact::{
    ArtifactType, JobArtifact, NewJobArtifact, NewPipelineArtifact, PipelineArtifactType,
};
use conduit_core::domain::job::Job;
use conduit_core::domain::pipeline::Pipeline;
use serde_json::{Map, Value, json};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{Reason, ServiceError, ServiceResult};
use crate::service::context::ServiceContext;
use crate::service::lease::{self, EXPIRE_ARTIFACTS_KEY, in_lock};
use crate::worker::BackgroundJob;

/// Value of `expire_in` that keeps an artifact forever
const NEVER_EXPIRE: &str = "never";

/// Extra lease time on top of the unlock timeout
const UNLOCK_LEASE_MARGIN: Duration = Duration::from_secs(60);

/// Out-of-range durations are clamped to a century
fn chrono_duration(duration: Duration) -> ChronoDuration {
    ChronoDuration::from_std(duration).unwrap_or_else(|_| ChronoDuration::days(36_500))
}

/// Store an artifact uploaded by the runner of a running job
pub async fn upload_artifact(
    ctx: &ServiceContext,
    job: &Job,
    file_type: ArtifactType,
    expire_in: Option<&str>,
    data: &[u8],
) -> ServiceResult<JobArtifact> {
    let job = ctx.job(job.id).await?;
    if job.status != Status::Running {
        return Err(ServiceError::forbidden(format!(
            "Job is not running ({})",
            job.status
        )));
    }
    if file_type == ArtifactType::Trace {
        return Err(ServiceError::bad_request(
            "Traces are uploaded through the trace endpoint",
        ));
    }

    let now = Utc::now();
    let expire_at = match expire_in.map(str::trim) {
        Some(NEVER_EXPIRE) => None,
        Some(text) => {
            let secs = conduit_lua::parser::parse_duration(text)
                .map_err(|err| ServiceError::bad_request(err.to_string()))?;
            Some(now + chrono_duration(Duration::from_secs(secs)))
        }
        None => {
            let default = job
                .options
                .artifacts
                .as_ref()
                .and_then(|spec| spec.expire_in_secs)
                .map(Duration::from_secs)
                .unwrap_or(ctx.limits().default_artifacts_expire_in);
            Some(now + chrono_duration(default))
        }
    };

    let pipeline = ctx.pipeline(job.pipeline_id).await?;
    let key = format!(
        "artifacts/{}/{}/{}/{}-{}",
        job.project_id,
        job.pipeline_id,
        job.id,
        file_type.as_str(),
        Uuid::new_v4().simple()
    );
    ctx.objects.put(&key, data).await?;

    let created = ctx
        .store
        .create_job_artifact(NewJobArtifact {
            job_id: job.id,
            pipeline_id: job.pipeline_id,
            project_id: job.project_id,
            file_type,
            file_path: key.clone(),
            size: data.len() as i64,
            locked: pipeline.locked.into(),
            expire_at,
        })
        .await;

    match created {
        Ok(artifact) => {
            tracing::info!(
                job_id = job.id,
                artifact_id = artifact.id,
                file_type = file_type.as_str(),
                size = artifact.size,
                "Artifact stored"
            );
            Ok(artifact)
        }
        Err(err) => {
            if let Err(cleanup) = ctx.objects.delete(&key).await {
                tracing::warn!(key, "Failed to remove orphaned artifact: {}", cleanup);
            }
            let err = ServiceError::from(err);
            if err.reason == Reason::Conflict {
                Err(ServiceError::conflict(format!(
                    "Job already has a {} artifact",
                    file_type.as_str()
                )))
            } else {
                Err(err)
            }
        }
    }
}

/// Destroy expired, unlocked artifacts in batches
pub async fn destroy_all_expired(ctx: &ServiceContext) -> ServiceResult<()> {
    let ttl = ctx.sweeps().artifact_lease_ttl;

    let outcome = in_lock(ctx, EXPIRE_ARTIFACTS_KEY, ttl, || destroy_batches(ctx)).await?;
    match outcome {
        Some(true) => {
            tracing::info!("Artifact expiry interrupted, continuing later");
            ctx.queue.enqueue(BackgroundJob::ExpireArtifacts);
        }
        Some(false) => {}
        None => tracing::debug!("Artifact expiry already running"),
    }
    Ok(())
}

/// Returns whether work was left over
async fn destroy_batches(ctx: &ServiceContext) -> ServiceResult<bool> {
    let sweeps = ctx.sweeps();
    let started = Instant::now();

    let resolved = ctx
        .store
        .resolve_unknown_artifact_locks(sweeps.artifact_batch_size)
        .await?;
    if resolved > 0 {
        tracing::debug!(resolved, "Resolved unknown artifact locks");
    }

    let mut destroyed = 0;
    for _ in 0..sweeps.artifact_loop_limit {
        if started.elapsed() >= sweeps.artifact_loop_timeout {
            tracing::info!(destroyed, "Expired artifacts destroyed before timeout");
            return Ok(true);
        }

        let now = Utc::now();
        let batch = ctx
            .store
            .expired_job_artifacts(now, sweeps.artifact_batch_size)
            .await?;
        if batch.is_empty() {
            if destroyed > 0 {
                tracing::info!(destroyed, "Expired artifacts destroyed");
            }
            return Ok(false);
        }

        destroyed += ctx.store.destroy_job_artifacts(&batch, now).await?;
    }

    tracing::info!(destroyed, "Artifact expiry reached its loop limit");
    Ok(true)
}

/// Remove staged files from object storage
pub async fn delete_objects(ctx: &ServiceContext) -> ServiceResult<()> {
    let sweeps = ctx.sweeps();
    let now = Utc::now();
    let retry_at = now + chrono_duration(sweeps.deleted_object_retry_delay);
    let acceptable_delay = chrono_duration(sweeps.deleted_object_acceptable_delay);

    let objects = ctx
        .store
        .claim_deleted_objects(now, sweeps.deleted_object_batch_size, retry_at)
        .await?;

    let mut removed = Vec::with_capacity(objects.len());
    for object in objects {
        if now - object.created_at > acceptable_delay {
            tracing::warn!(
                id = object.id,
                path = %object.file_path,
                created_at = %object.created_at,
                "Deleted object is overdue"
            );
        }

        match ctx.objects.delete(&object.file_path).await {
            Ok(()) => removed.push(object.id),
            Err(err) => {
                tracing::warn!(path = %object.file_path, "Failed to delete object: {}", err);
            }
        }
    }

    if !removed.is_empty() {
        let count = ctx.store.remove_deleted_objects(&removed).await?;
        tracing::debug!(count, "Deleted objects removed");
    }

    Ok(())
}

/// Unlock every older locked pipeline on the ref
pub async fn unlock_previous_pipelines(
    ctx: &ServiceContext,
    project_id: i64,
    ref_name: &str,
    before_iid: i64,
) -> ServiceResult<()> {
    let pipelines = ctx
        .store
        .locked_pipelines_before(project_id, ref_name, before_iid)
        .await?;

    tracing::debug!(
        project_id,
        ref_name,
        count = pipelines.len(),
        "Unlocking previous pipelines"
    );

    for pipeline in pipelines {
        ctx.queue.enqueue(BackgroundJob::UnlockPipeline {
            pipeline_id: pipeline.id,
        });
    }
    Ok(())
}

/// Unlock the artifacts of one pipeline, then the pipeline itself
pub async fn unlock_pipeline(ctx: &ServiceContext, pipeline_id: i64) -> ServiceResult<()> {
    let key = lease::unlock_pipeline_key(pipeline_id);
    let ttl = ctx.sweeps().unlock_timeout + UNLOCK_LEASE_MARGIN;

    match in_lock(ctx, &key, ttl, || unlock_locked(ctx, pipeline_id)).await? {
        Some(true) => {
            tracing::info!(pipeline_id, "Pipeline unlock interrupted, continuing later");
            ctx.queue
                .enqueue(BackgroundJob::UnlockPipeline { pipeline_id });
        }
        Some(false) => {}
        None => tracing::debug!(pipeline_id, "Pipeline unlock already running"),
    }
    Ok(())
}

/// Returns whether work was left over
async fn unlock_locked(ctx: &ServiceContext, pipeline_id: i64) -> ServiceResult<bool> {
    let sweeps = ctx.sweeps();
    let started = Instant::now();
    let mut unlocked = 0;

    loop {
        if started.elapsed() >= sweeps.unlock_timeout {
            return Ok(true);
        }

        let count = ctx
            .store
            .unlock_job_artifacts(pipeline_id, sweeps.unlock_batch_size)
            .await?;
        unlocked += count;
        if (count as usize) < sweeps.unlock_batch_size {
            break;
        }
    }

    let pipeline_artifacts = ctx.store.unlock_pipeline_artifacts(pipeline_id).await?;
    ctx.store.unlock_pipeline(pipeline_id).await?;

    tracing::info!(
        pipeline_id,
        job_artifacts = unlocked,
        pipeline_artifacts,
        "Pipeline unlocked"
    );
    Ok(false)
}

/// Merge the coverage reports of a pipeline's jobs into one pipeline artifact
pub async fn generate_coverage(ctx: &ServiceContext, pipeline: &Pipeline) -> ServiceResult<()> {
    let jobs = ctx.store.pipeline_jobs(pipeline.id).await?;
    let job_name = |job_id: i64| {
        jobs.iter()
            .find(|job| job.id == job_id)
            .map(|job| job.name.clone())
            .unwrap_or_else(|| job_id.to_string())
    };

    let mut reports = Map::new();
    let mut expire_at: Option<DateTime<Utc>> = None;
    for artifact in ctx.store.pipeline_job_artifacts(pipeline.id).await? {
        if artifact.file_type != ArtifactType::Coverage {
            continue;
        }

        let data = ctx.objects.get(&artifact.file_path).await?;
        let report = serde_json::from_slice::<Value>(&data)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&data).into_owned()));
        reports.insert(job_name(artifact.job_id), report);

        expire_at = match (expire_at, artifact.expire_at) {
            (Some(current), Some(candidate)) => Some(current.max(candidate)),
            (current, candidate) => current.or(candidate),
        };
    }

    if reports.is_empty() {
        return Ok(());
    }

    let document = json!({
        "pipeline_id": pipeline.id,
        "reports": reports,
    });
    let data = serde_json::to_vec_pretty(&document)
        .map_err(|err| ServiceError::internal(format!("Failed to encode coverage: {}", err)))?;

    let key = format!("pipelines/{}/code_coverage.json", pipeline.id);
    ctx.objects.put(&key, &data).await?;

    let created = ctx
        .store
        .create_pipeline_artifact(NewPipelineArtifact {
            pipeline_id: pipeline.id,
            project_id: pipeline.project_id,
            file_type: PipelineArtifactType::CodeCoverage,
            file_path: key,
            size: data.len() as i64,
            locked: pipeline.locked.into(),
            expire_at,
        })
        .await;

    match created.map_err(ServiceError::from) {
        Ok(artifact) => {
            tracing::info!(
                pipeline_id = pipeline.id,
                artifact_id = artifact.id,
                "Code coverage report generated"
            );
            Ok(())
        }
        Err(err) if err.reason == Reason::Conflict => Ok(()),
        Err(err) => Err(err),
    }
}
