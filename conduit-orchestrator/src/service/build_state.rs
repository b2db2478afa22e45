//! Job state updates from runners
//!
//! A runner reports `running` as a keep-alive and a final `success` or
//! `failed` when the script ends. The final state is only applied once the
//! trace is settled: while live chunks are still young the state is parked
//! as a pending state and the runner is told to retry after a backoff.

use chrono::{Duration as ChronoDuration, Utc};
use conduit_core::domain::job::{FailureReason, Job};
use conduit_core::domain::trace::{ChunkStore, PendingState, TraceChecksum, TraceMetadata};
use conduit_core::dto::job::{UpdateJob, UpdateJobResponse};
use conduit_core::{JobEvent, Status};

use crate::error::{ServiceError, ServiceResult};
use crate::service::context::ServiceContext;
use crate::service::lease::{self, in_lock};
use crate::service::locking::retry_lock;
use crate::service::retry;
use crate::worker::BackgroundJob;

/// Seconds a runner waits before repeating a deferred final state
pub const PENDING_STATE_BACKOFF_SECS: u64 = 5;

/// Apply a state reported by the runner of `job`
pub async fn update_job_state(
    ctx: &ServiceContext,
    job: &Job,
    req: UpdateJob,
) -> ServiceResult<UpdateJobResponse> {
    let job = ctx.job(job.id).await?;
    if job.status != Status::Running {
        return Err(ServiceError::forbidden(format!(
            "Job is not running ({})",
            job.status
        )));
    }

    if !req.state.is_terminal() {
        let now = Utc::now();
        retry_lock(ctx, job, |job| {
            job.updated_at = now;
            Ok(())
        })
        .await?;
        return Ok(UpdateJobResponse {
            accepted: true,
            backoff_secs: None,
        });
    }

    let key = lease::trace_write_key(job.id);
    let ttl = ctx.limits().trace_lease_ttl;
    let job_id = job.id;

    in_lock(ctx, &key, ttl, || finalize(ctx, job, req))
        .await?
        .ok_or_else(|| {
            tracing::debug!(job_id, "Trace busy while finishing job");
            ServiceError::conflict("Trace is being written by another request")
        })
}

async fn finalize(ctx: &ServiceContext, job: Job, req: UpdateJob) -> ServiceResult<UpdateJobResponse> {
    let now = Utc::now();

    // The first report wins; repeats only poll for acceptance
    let pending = ctx
        .store
        .create_pending_state(&PendingState {
            job_id: job.id,
            state: req.state.to_status(),
            failure_reason: req.failure_reason,
            exit_code: req.exit_code,
            checksum: req.checksum.clone(),
            created_at: now,
        })
        .await?;

    let chunks = ctx.store.trace_chunks(job.id).await?;
    let live: Vec<i32> = chunks
        .iter()
        .filter(|chunk| chunk.data_store == ChunkStore::Live)
        .map(|chunk| chunk.chunk_index)
        .collect();

    let accept_timeout = ChronoDuration::from_std(ctx.limits().pending_state_accept_timeout)
        .unwrap_or_else(|_| ChronoDuration::minutes(5));
    let waited_long_enough = now - pending.created_at >= accept_timeout;

    if !live.is_empty() && !waited_long_enough {
        for chunk_index in live {
            ctx.queue.enqueue(BackgroundJob::FlushTraceChunk {
                job_id: job.id,
                chunk_index,
            });
        }
        tracing::debug!(job_id = job.id, "Final state deferred until the trace is flushed");
        return Ok(UpdateJobResponse {
            accepted: false,
            backoff_secs: Some(PENDING_STATE_BACKOFF_SECS),
        });
    }

    if !live.is_empty() {
        tracing::warn!(job_id = job.id, "Accepting final state with unflushed trace chunks");
    }

    let mut checksum = TraceChecksum::new();
    for chunk in &chunks {
        checksum.update(&chunk.data);
    }
    let mut metadata = ctx
        .store
        .trace_metadata(job.id)
        .await?
        .unwrap_or_else(|| TraceMetadata {
            job_id: job.id,
            ..TraceMetadata::default()
        });
    metadata.checksum = Some(checksum.finalize());
    metadata.remote_checksum = pending.checksum.clone();
    if !metadata.is_valid() {
        tracing::warn!(
            job_id = job.id,
            local = ?metadata.checksum,
            remote = ?metadata.remote_checksum,
            "Trace checksum mismatch"
        );
    }
    ctx.store.save_trace_metadata(&metadata).await?;

    let job = retry_lock(ctx, job, |job| {
        match pending.state {
            Status::Success => job.fire(JobEvent::Succeed, now)?,
            _ => job.drop_with(
                pending.failure_reason.unwrap_or(FailureReason::ScriptFailure),
                pending.exit_code,
                now,
            )?,
        }
        Ok(())
    })
    .await?;

    ctx.store.delete_pending_state(job.id).await?;

    tracing::info!(
        job_id = job.id,
        pipeline_id = job.pipeline_id,
        status = %job.status,
        "Job finished"
    );

    ctx.queue.enqueue(BackgroundJob::ArchiveTrace { job_id: job.id });
    ctx.queue.enqueue(BackgroundJob::ProcessPipeline {
        pipeline_id: job.pipeline_id,
    });

    retry::auto_retry_if_allowed(ctx, &job).await?;

    Ok(UpdateJobResponse {
        accepted: true,
        backoff_secs: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Reason;
    use crate::service::test_support::{TestEnv, simple_config};
    use crate::service::trace;
    use conduit_core::dto::job::RemoteState;

    fn update(state: RemoteState) -> UpdateJob {
        UpdateJob {
            token: String::new(),
            state,
            checksum: None,
            failure_reason: None,
            exit_code: None,
        }
    }

    async fn running_job(env: &TestEnv) -> Job {
        let (_, pipeline) = env.pipeline_from(simple_config()).await;
        env.drain().await;
        env.start(pipeline.id, "compile").await
    }

    #[tokio::test]
    async fn test_success_without_trace_is_immediate() {
        let env = TestEnv::new();
        let job = running_job(&env).await;

        let response = update_job_state(&env.ctx, &job, update(RemoteState::Success))
            .await
            .unwrap();
        assert!(response.accepted);

        let job = env.ctx.job(job.id).await.unwrap();
        assert_eq!(job.status, Status::Success);
        assert!(env.queue.jobs().contains(&BackgroundJob::ArchiveTrace { job_id: job.id }));
    }

    #[tokio::test]
    async fn test_running_is_a_keep_alive() {
        let env = TestEnv::new();
        let job = running_job(&env).await;

        let response = update_job_state(&env.ctx, &job, update(RemoteState::Running))
            .await
            .unwrap();
        assert!(response.accepted);
        assert_eq!(env.ctx.job(job.id).await.unwrap().status, Status::Running);
    }

    #[tokio::test]
    async fn test_live_trace_defers_final_state() {
        let env = TestEnv::new();
        let job = running_job(&env).await;
        trace::append_trace(&env.ctx, &job, 0, b"done\n").await.unwrap();

        let mut req = update(RemoteState::Failed);
        req.exit_code = Some(2);
        req.checksum = Some(TraceChecksum::of(b"done\n"));

        let response = update_job_state(&env.ctx, &job, req.clone()).await.unwrap();
        assert!(!response.accepted);
        assert_eq!(response.backoff_secs, Some(PENDING_STATE_BACKOFF_SECS));
        assert_eq!(env.ctx.job(job.id).await.unwrap().status, Status::Running);

        // The flush runs, then the runner repeats the call
        env.drain().await;
        let response = update_job_state(&env.ctx, &job, req).await.unwrap();
        assert!(response.accepted);

        let job = env.ctx.job(job.id).await.unwrap();
        assert_eq!(job.status, Status::Failed);
        assert_eq!(job.failure_reason, Some(FailureReason::ScriptFailure));
        assert_eq!(job.exit_code, Some(2));

        let metadata = env.ctx.store.trace_metadata(job.id).await.unwrap().unwrap();
        assert!(metadata.is_valid());
    }

    #[tokio::test]
    async fn test_checksum_mismatch_does_not_fail_the_job() {
        let env = TestEnv::new();
        let job = running_job(&env).await;
        trace::append_trace(&env.ctx, &job, 0, b"built\n").await.unwrap();
        env.drain().await;

        let mut req = update(RemoteState::Success);
        req.checksum = Some("sha256:deadbeef".to_string());

        let mut response = update_job_state(&env.ctx, &job, req.clone()).await.unwrap();
        if !response.accepted {
            env.drain().await;
            response = update_job_state(&env.ctx, &job, req).await.unwrap();
        }
        assert!(response.accepted);

        let job = env.ctx.job(job.id).await.unwrap();
        assert_eq!(job.status, Status::Success);

        let metadata = env.ctx.store.trace_metadata(job.id).await.unwrap().unwrap();
        assert_eq!(metadata.remote_checksum.as_deref(), Some("sha256:deadbeef"));
        assert_eq!(metadata.checksum, Some(TraceChecksum::of(b"built\n")));
        assert!(!metadata.is_valid());
    }

    #[tokio::test]
    async fn test_accept_timeout_forces_acceptance() {
        let env = TestEnv::with_config(|config| {
            config.limits.pending_state_accept_timeout = std::time::Duration::ZERO
        });
        let job = running_job(&env).await;
        trace::append_trace(&env.ctx, &job, 0, b"partial").await.unwrap();

        let response = update_job_state(&env.ctx, &job, update(RemoteState::Success))
            .await
            .unwrap();
        assert!(response.accepted);
        assert_eq!(env.ctx.job(job.id).await.unwrap().status, Status::Success);
    }

    #[tokio::test]
    async fn test_finished_job_is_forbidden() {
        let env = TestEnv::new();
        let job = running_job(&env).await;
        update_job_state(&env.ctx, &job, update(RemoteState::Success))
            .await
            .unwrap();

        let err = update_job_state(&env.ctx, &job, update(RemoteState::Failed))
            .await
            .unwrap_err();
        assert_eq!(err.reason, Reason::Forbidden);
    }
}
