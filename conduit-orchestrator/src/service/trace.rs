//! Trace Service
//!
//! Runners stream job logs as byte ranges. Appends land in fixed-size live
//! chunks; a full chunk is flushed in the background and, once the job is
//! finished, all chunks are concatenated into a trace artifact.
//!
//! Every write to a job's chunks happens under the job's trace write lease.

use conduit_core::Status;
use conduit_core::domain::artifact::{ArtifactType, NewJobArtifact};
use conduit_core::domain::job::Job;
use conduit_core::domain::project::User;
use conduit_core::domain::trace::{CHUNK_SIZE, ChunkStore, TraceChecksum, TraceChunk, TraceMetadata};
use conduit_core::dto::job::TraceAppend;
use std::time::Duration;

use crate::error::{Reason, ServiceError, ServiceResult};
use crate::service::context::ServiceContext;
use crate::service::lease::{self, in_lock};
use crate::service::pipeline;
use crate::worker::BackgroundJob;

/// Delay before retrying a flush or archive whose lease is taken
const BUSY_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Job owning `token`, checked against the job id in the path
pub async fn authenticate_job(ctx: &ServiceContext, job_id: i64, token: &str) -> ServiceResult<Job> {
    let job = ctx.job(job_id).await?;
    match job.token.as_deref() {
        Some(expected) if !token.is_empty() && expected == token => Ok(job),
        _ => Err(ServiceError::unauthorized("Invalid job token")),
    }
}

/// Object key of an archived trace
pub fn archive_key(job_id: i64) -> String {
    format!("traces/{}/job.log", job_id)
}

/// Append `data` at byte offset `start` of the job's trace
///
/// The offset must equal the current stream size; anything else is reported
/// as a range mismatch carrying the size the runner should resume from.
pub async fn append_trace(
    ctx: &ServiceContext,
    job: &Job,
    start: u64,
    data: &[u8],
) -> ServiceResult<TraceAppend> {
    let key = lease::trace_write_key(job.id);
    let ttl = ctx.limits().trace_lease_ttl;

    in_lock(ctx, &key, ttl, || write_chunks(ctx, job.id, start, data))
        .await?
        .ok_or_else(|| ServiceError::conflict("Trace is being written by another request"))
}

async fn write_chunks(
    ctx: &ServiceContext,
    job_id: i64,
    start: u64,
    data: &[u8],
) -> ServiceResult<TraceAppend> {
    let job = ctx.job(job_id).await?;
    if job.status != Status::Running {
        return Err(ServiceError::forbidden(format!(
            "Job is not running ({})",
            job.status
        )));
    }

    let mut chunks = ctx.store.trace_chunks(job_id).await?;
    let stream_size = chunks.last().map(TraceChunk::end_offset).unwrap_or(0);
    if start != stream_size {
        tracing::debug!(job_id, start, stream_size, "Trace range mismatch");
        return Ok(TraceAppend::RangeMismatch { stream_size });
    }

    let mut offset = start;
    let mut remaining = data;

    while !remaining.is_empty() {
        let index = (offset / CHUNK_SIZE as u64) as i32;
        let mut chunk = match chunks.last() {
            Some(last) if last.chunk_index == index => last.clone(),
            _ => TraceChunk::new(job_id, index),
        };

        let take = chunk.remaining_capacity().min(remaining.len());
        chunk.data.extend_from_slice(&remaining[..take]);
        chunk.data_store = ChunkStore::Live;
        ctx.store.save_trace_chunk(&chunk).await?;

        if chunk.is_full() {
            ctx.queue.enqueue(BackgroundJob::FlushTraceChunk {
                job_id,
                chunk_index: index,
            });
        }

        offset += take as u64;
        remaining = &remaining[take..];

        if chunks.last().is_some_and(|last| last.chunk_index == index) {
            chunks.pop();
        }
        chunks.push(chunk);
    }

    Ok(TraceAppend::Accepted {
        stream_size: offset,
    })
}

/// Move a full live chunk to durable storage
pub async fn flush_trace_chunk(
    ctx: &ServiceContext,
    job_id: i64,
    chunk_index: i32,
) -> ServiceResult<()> {
    let key = lease::trace_write_key(job_id);
    let ttl = ctx.limits().trace_lease_ttl;

    let flushed = in_lock(ctx, &key, ttl, || async {
        let chunk = ctx
            .store
            .trace_chunks(job_id)
            .await?
            .into_iter()
            .find(|chunk| chunk.chunk_index == chunk_index);

        if let Some(mut chunk) = chunk
            && chunk.data_store == ChunkStore::Live
        {
            chunk.data_store = ChunkStore::Database;
            ctx.store.save_trace_chunk(&chunk).await?;
            tracing::debug!(job_id, chunk_index, "Trace chunk flushed");
        }
        Ok(())
    })
    .await?;

    if flushed.is_none() {
        ctx.queue.enqueue_in(
            BackgroundJob::FlushTraceChunk {
                job_id,
                chunk_index,
            },
            BUSY_RETRY_DELAY,
        );
    }

    Ok(())
}

/// Concatenate the chunks of a finished job into its trace artifact
pub async fn archive_trace(ctx: &ServiceContext, job_id: i64) -> ServiceResult<()> {
    let key = lease::trace_write_key(job_id);
    let ttl = ctx.limits().trace_lease_ttl;

    let archived = in_lock(ctx, &key, ttl, || archive_locked(ctx, job_id)).await?;

    if archived.is_none() {
        ctx.queue
            .enqueue_in(BackgroundJob::ArchiveTrace { job_id }, BUSY_RETRY_DELAY);
    }

    Ok(())
}

async fn archive_locked(ctx: &ServiceContext, job_id: i64) -> ServiceResult<()> {
    let job = ctx.job(job_id).await?;
    let mut metadata = ctx
        .store
        .trace_metadata(job_id)
        .await?
        .unwrap_or_else(|| TraceMetadata {
            job_id,
            ..TraceMetadata::default()
        });

    if metadata.archived {
        return Ok(());
    }

    let chunks = ctx.store.trace_chunks(job_id).await?;
    let data: Vec<u8> = chunks
        .iter()
        .flat_map(|chunk| chunk.data.iter().copied())
        .collect();

    let key = archive_key(job_id);
    ctx.objects.put(&key, &data).await?;

    let pipeline = ctx.pipeline(job.pipeline_id).await?;
    let created = ctx
        .store
        .create_job_artifact(NewJobArtifact {
            job_id,
            pipeline_id: job.pipeline_id,
            project_id: job.project_id,
            file_type: ArtifactType::Trace,
            file_path: key,
            size: data.len() as i64,
            locked: pipeline.locked.into(),
            expire_at: None,
        })
        .await;

    match created.map_err(ServiceError::from) {
        Ok(_) => {}
        // A previous attempt got this far
        Err(err) if err.reason == Reason::Conflict => {}
        Err(err) => return Err(err),
    }

    metadata.checksum = Some(TraceChecksum::of(&data));
    metadata.archived = true;
    ctx.store.save_trace_metadata(&metadata).await?;
    ctx.store.delete_trace_chunks(job_id).await?;

    if !metadata.is_valid() {
        tracing::warn!(job_id, "Archived trace does not match the runner checksum");
    }

    tracing::info!(job_id, size = data.len(), "Trace archived");

    Ok(())
}

/// Full trace of a job, archived or live
pub async fn read_trace(
    ctx: &ServiceContext,
    user: Option<&User>,
    job_id: i64,
) -> ServiceResult<Vec<u8>> {
    let job = pipeline::get_job(ctx, user, job_id).await?;

    let archived = ctx
        .store
        .trace_metadata(job.id)
        .await?
        .is_some_and(|metadata| metadata.archived);

    if archived {
        let artifact = ctx
            .store
            .job_artifacts(job.id)
            .await?
            .into_iter()
            .find(|artifact| artifact.file_type == ArtifactType::Trace)
            .ok_or_else(|| ServiceError::not_found("Trace has expired"))?;
        return Ok(ctx.objects.get(&artifact.file_path).await?);
    }

    let chunks = ctx.store.trace_chunks(job.id).await?;
    Ok(chunks.into_iter().flat_map(|chunk| chunk.data).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::test_support::{TestEnv, simple_config};

    async fn running_job(env: &TestEnv) -> (User, Job) {
        let (owner, pipeline) = env.pipeline_from(simple_config()).await;
        env.drain().await;
        let job = env.start(pipeline.id, "compile").await;
        (owner, job)
    }

    #[tokio::test]
    async fn test_token_must_match() {
        let env = TestEnv::new();
        let (_, job) = running_job(&env).await;

        let token = job.token.clone().unwrap();
        assert!(authenticate_job(&env.ctx, job.id, &token).await.is_ok());

        let err = authenticate_job(&env.ctx, job.id, "forged").await.unwrap_err();
        assert_eq!(err.reason, Reason::Unauthorized);
    }

    #[tokio::test]
    async fn test_appends_must_continue_the_stream() {
        let env = TestEnv::new();
        let (_, job) = running_job(&env).await;

        let appended = append_trace(&env.ctx, &job, 0, b"hello ").await.unwrap();
        assert_eq!(appended, TraceAppend::Accepted { stream_size: 6 });

        let mismatch = append_trace(&env.ctx, &job, 3, b"world").await.unwrap();
        assert_eq!(mismatch, TraceAppend::RangeMismatch { stream_size: 6 });

        let appended = append_trace(&env.ctx, &job, 6, b"world").await.unwrap();
        assert_eq!(appended, TraceAppend::Accepted { stream_size: 11 });

        let trace = read_trace(&env.ctx, None, job.id).await;
        // Private project, anonymous reader
        assert_eq!(trace.unwrap_err().reason, Reason::NotFound);
    }

    #[tokio::test]
    async fn test_large_append_spans_chunks() {
        let env = TestEnv::new();
        let (owner, job) = running_job(&env).await;
        env.queue.clear();

        let data = vec![b'x'; CHUNK_SIZE + 10];
        let appended = append_trace(&env.ctx, &job, 0, &data).await.unwrap();
        assert_eq!(
            appended,
            TraceAppend::Accepted {
                stream_size: data.len() as u64
            }
        );

        let chunks = env.ctx.store.trace_chunks(job.id).await.unwrap();
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].is_full());
        assert_eq!(chunks[1].data.len(), 10);
        assert_eq!(
            env.queue.jobs(),
            vec![BackgroundJob::FlushTraceChunk {
                job_id: job.id,
                chunk_index: 0
            }]
        );

        env.drain().await;
        let chunks = env.ctx.store.trace_chunks(job.id).await.unwrap();
        assert_eq!(chunks[0].data_store, ChunkStore::Database);
        assert_eq!(chunks[1].data_store, ChunkStore::Live);

        let trace = read_trace(&env.ctx, Some(&owner), job.id).await.unwrap();
        assert_eq!(trace, data);
    }

    #[tokio::test]
    async fn test_finished_jobs_reject_appends() {
        let env = TestEnv::new();
        let (_, job) = running_job(&env).await;
        env.finish(job.pipeline_id, "compile", Status::Success).await;

        let err = append_trace(&env.ctx, &job, 0, b"late").await.unwrap_err();
        assert_eq!(err.reason, Reason::Forbidden);
    }

    #[tokio::test]
    async fn test_concurrent_writer_conflicts() {
        let env = TestEnv::new();
        let (_, job) = running_job(&env).await;
        env.ctx
            .store
            .try_obtain_lease(
                &lease::trace_write_key(job.id),
                uuid::Uuid::new_v4(),
                Duration::from_secs(60),
            )
            .await
            .unwrap();

        let err = append_trace(&env.ctx, &job, 0, b"x").await.unwrap_err();
        assert_eq!(err.reason, Reason::Conflict);
    }

    #[tokio::test]
    async fn test_archive_creates_trace_artifact() {
        let env = TestEnv::new();
        let (owner, job) = running_job(&env).await;
        append_trace(&env.ctx, &job, 0, b"build ok\n").await.unwrap();

        archive_trace(&env.ctx, job.id).await.unwrap();

        let artifacts = env.ctx.store.job_artifacts(job.id).await.unwrap();
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].file_type, ArtifactType::Trace);
        assert_eq!(artifacts[0].expire_at, None);
        assert_eq!(artifacts[0].size, 9);

        assert!(env.ctx.store.trace_chunks(job.id).await.unwrap().is_empty());
        let metadata = env.ctx.store.trace_metadata(job.id).await.unwrap().unwrap();
        assert!(metadata.archived);
        assert_eq!(metadata.checksum, Some(TraceChecksum::of(b"build ok\n")));

        let trace = read_trace(&env.ctx, Some(&owner), job.id).await.unwrap();
        assert_eq!(trace, b"build ok\n");

        // Archiving again changes nothing
        archive_trace(&env.ctx, job.id).await.unwrap();
        assert_eq!(env.ctx.store.job_artifacts(job.id).await.unwrap().len(), 1);
    }
}
