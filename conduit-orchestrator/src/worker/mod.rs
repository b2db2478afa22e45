//! Background work
//!
//! Everything the services defer runs as a [`BackgroundJob`]. Jobs are
//! dispatched by [`perform`]; [`run_worker`] drains a [`ChannelQueue`] with
//! bounded concurrency and [`spawn_cron`] enqueues the periodic sweeps.

pub mod queue;

use std::sync::Arc;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;

use crate::error::ServiceResult;
use crate::service::context::ServiceContext;
use crate::service::{artifacts, cancel, downstream, processing, runner, stuck, trace};

pub use queue::{ChannelQueue, RecordingQueue, WorkerQueue};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackgroundJob {
    ProcessPipeline { pipeline_id: i64 },
    CreateDownstreamPipeline { bridge_id: i64 },
    CancelPipeline { pipeline_id: i64 },
    FlushTraceChunk { job_id: i64, chunk_index: i32 },
    ArchiveTrace { job_id: i64 },
    UnlockPreviousPipelines {
        project_id: i64,
        ref_name: String,
        before_iid: i64,
    },
    UnlockPipeline { pipeline_id: i64 },
    ExpireArtifacts,
    DeleteObjects,
    DropStuckJobs,
    MarkStaleRunners,
}

/// Run one background job to completion
pub async fn perform(ctx: &ServiceContext, job: BackgroundJob) -> ServiceResult<()> {
    match job {
        BackgroundJob::ProcessPipeline { pipeline_id } => {
            processing::process_pipeline(ctx, pipeline_id).await
        }
        BackgroundJob::CreateDownstreamPipeline { bridge_id } => {
            downstream::create_downstream_pipeline(ctx, bridge_id).await
        }
        BackgroundJob::CancelPipeline { pipeline_id } => {
            cancel::cancel_pipeline_in_background(ctx, pipeline_id).await
        }
        BackgroundJob::FlushTraceChunk {
            job_id,
            chunk_index,
        } => trace::flush_trace_chunk(ctx, job_id, chunk_index).await,
        BackgroundJob::ArchiveTrace { job_id } => trace::archive_trace(ctx, job_id).await,
        BackgroundJob::UnlockPreviousPipelines {
            project_id,
            ref_name,
            before_iid,
        } => artifacts::unlock_previous_pipelines(ctx, project_id, &ref_name, before_iid).await,
        BackgroundJob::UnlockPipeline { pipeline_id } => {
            artifacts::unlock_pipeline(ctx, pipeline_id).await
        }
        BackgroundJob::ExpireArtifacts => artifacts::destroy_all_expired(ctx).await,
        BackgroundJob::DeleteObjects => artifacts::delete_objects(ctx).await,
        BackgroundJob::DropStuckJobs => stuck::drop_stuck_jobs(ctx).await,
        BackgroundJob::MarkStaleRunners => runner::mark_stale_runners(ctx).await,
    }
}

/// Drain the channel, running up to `concurrency` jobs at once
pub async fn run_worker(
    ctx: ServiceContext,
    mut receiver: mpsc::UnboundedReceiver<BackgroundJob>,
    concurrency: usize,
) {
    let semaphore = Arc::new(Semaphore::new(concurrency));
    tracing::info!(concurrency, "Background worker started");

    while let Some(job) = receiver.recv().await {
        let Ok(permit) = semaphore.clone().acquire_owned().await else {
            break;
        };
        let ctx = ctx.clone();

        tokio::spawn(async move {
            let description = format!("{:?}", job);
            if let Err(err) = perform(&ctx, job).await {
                tracing::error!(job = %description, reason = %err.reason, "Background job failed: {}", err);
            }
            drop(permit);
        });
    }

    tracing::info!("Background worker stopped");
}

/// Enqueue the periodic sweeps every `cron_interval`
pub fn spawn_cron(ctx: ServiceContext) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(ctx.sweeps().cron_interval);
        loop {
            interval.tick().await;
            tracing::debug!("Enqueuing periodic sweeps");
            for job in [
                BackgroundJob::ExpireArtifacts,
                BackgroundJob::DeleteObjects,
                BackgroundJob::DropStuckJobs,
                BackgroundJob::MarkStaleRunners,
            ] {
                ctx.queue.enqueue(job);
            }
        }
    })
}

/// Perform queued jobs until the queue is empty; returns how many ran
///
/// Delayed jobs stay parked. Errors are logged like the channel worker does.
pub async fn drain(ctx: &ServiceContext, queue: &RecordingQueue) -> usize {
    let mut performed = 0;
    // Guards against a job that keeps re-enqueuing itself
    while performed < 10_000 {
        let Some(job) = queue.pop() else {
            break;
        };
        let description = format!("{:?}", job);
        if let Err(err) = perform(ctx, job).await {
            tracing::error!(job = %description, "Background job failed: {}", err);
        }
        performed += 1;
    }
    performed
}
