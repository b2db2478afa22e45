//! Job lifecycle
//!
//! Runs one assigned job end to end: workspace setup, script execution with
//! periodic trace streaming, artifact upload, final trace flush and the
//! state report.

use anyhow::{Context, Result};
use conduit_client::{ClientError, ConduitClient};
use conduit_core::domain::artifact::ArtifactType;
use conduit_core::domain::job::FailureReason;
use conduit_core::dto::job::{JobPayload, RemoteState, UpdateJob};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

use crate::service::artifacts;
use crate::service::{ExecutionService, ScriptOutcome, TraceBuffer};

/// Running-state keep-alives while the script executes
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);

/// Backoff when the orchestrator did not name one
const DEFAULT_STATE_BACKOFF: Duration = Duration::from_secs(5);

/// Give up repeating the final state after this long
const STATE_REPORT_DEADLINE: Duration = Duration::from_secs(10 * 60);

/// Everything a job task needs
#[derive(Clone)]
pub struct JobRunner {
    pub client: Arc<ConduitClient>,
    pub executor: Arc<dyn ExecutionService>,
    pub workspace_dir: std::path::PathBuf,
    pub trace_send_interval: Duration,
}

impl JobRunner {
    /// Execute `job` and report its outcome
    ///
    /// Returns once the orchestrator accepted the final state, or early when
    /// the job was canceled on the server.
    pub async fn run(&self, job: JobPayload) -> Result<()> {
        info!(job_id = job.id, pipeline_id = job.pipeline_id, "Starting job {}", job.name);

        let workspace = self.workspace_dir.join(format!("job-{}", job.id));
        tokio::fs::create_dir_all(&workspace)
            .await
            .with_context(|| format!("Failed to create workspace {}", workspace.display()))?;

        let result = self.run_in(&job, &workspace).await;

        if let Err(e) = tokio::fs::remove_dir_all(&workspace).await {
            warn!(job_id = job.id, "Failed to clean up workspace: {}", e);
        }

        result
    }

    async fn run_in(&self, job: &JobPayload, workspace: &Path) -> Result<()> {
        let trace = TraceBuffer::new();
        trace
            .line(format!(
                "Running {} ({}) on {} at {}",
                job.name, job.id, job.ref_name, job.sha
            ))
            .await;

        let outcome = tokio::select! {
            outcome = self.executor.execute(job, workspace, &trace) => outcome,
            status = self.stream_trace(job, &trace) => {
                info!(job_id = job.id, "Job is {} on the server, aborting", status);
                return Ok(());
            }
        };

        let outcome = match outcome {
            ScriptOutcome::Success => self.upload_artifacts(job, workspace, &trace).await,
            failed => failed,
        };

        match trace.flush(&self.client, job.id, &job.token).await {
            Ok(()) => {}
            Err(ClientError::JobNotRunning { status }) => {
                info!(job_id = job.id, "Job is {} on the server, not reporting", status);
                return Ok(());
            }
            Err(e) => warn!(job_id = job.id, "Failed to send final trace: {}", e),
        }

        self.report_state(job, &trace, outcome).await
    }

    /// Flush the trace every interval until the job leaves the running state
    ///
    /// Only returns when the server refuses the job; the returned string is
    /// the job's server-side status.
    async fn stream_trace(&self, job: &JobPayload, trace: &TraceBuffer) -> String {
        let mut ticker = time::interval(self.trace_send_interval);
        ticker.tick().await;
        let mut last_keepalive = Instant::now();

        loop {
            ticker.tick().await;

            match trace.flush(&self.client, job.id, &job.token).await {
                Ok(()) => {}
                Err(ClientError::JobNotRunning { status }) => return status,
                Err(e) => warn!(job_id = job.id, "Failed to send trace: {}", e),
            }

            if last_keepalive.elapsed() >= KEEPALIVE_INTERVAL {
                last_keepalive = Instant::now();
                let keepalive = UpdateJob {
                    token: job.token.clone(),
                    state: RemoteState::Running,
                    checksum: None,
                    failure_reason: None,
                    exit_code: None,
                };
                match self.client.update_job(job.id, &keepalive).await {
                    Ok(_) => debug!(job_id = job.id, "Sent keep-alive"),
                    Err(ClientError::JobNotRunning { status }) => return status,
                    Err(e) => warn!(job_id = job.id, "Failed to send keep-alive: {}", e),
                }
            }
        }
    }

    /// Upload the declared artifact paths; a failed upload fails the job
    async fn upload_artifacts(&self, job: &JobPayload, workspace: &Path, trace: &TraceBuffer) -> ScriptOutcome {
        let Some(spec) = job.artifacts.as_ref().filter(|spec| !spec.paths.is_empty()) else {
            return ScriptOutcome::Success;
        };

        trace.line("Uploading artifacts...").await;
        let paths = spec.paths.clone();
        let root = workspace.to_path_buf();
        let bundled = tokio::task::spawn_blocking(move || artifacts::bundle(&root, &paths))
            .await
            .context("Artifact bundling panicked")
            .and_then(|result| result);

        let bundle = match bundled {
            Ok(Some(bundle)) => bundle,
            Ok(None) => {
                trace.line("WARNING: No files to upload").await;
                return ScriptOutcome::Success;
            }
            Err(e) => {
                trace.line(format!("ERROR: {:#}", e)).await;
                return ScriptOutcome::Failed {
                    exit_code: None,
                    reason: FailureReason::RunnerSystemFailure,
                };
            }
        };

        for path in &bundle.missing {
            trace.line(format!("WARNING: {}: no matching files", path)).await;
        }

        let size = bundle.data.len();
        match self
            .client
            .upload_artifact(job.id, &job.token, ArtifactType::Archive, None, bundle.data)
            .await
        {
            Ok(artifact) => {
                trace
                    .line(format!("Uploaded {} path(s), {} bytes", bundle.files, size))
                    .await;
                debug!(job_id = job.id, artifact_id = artifact.id, "Artifacts uploaded");
                ScriptOutcome::Success
            }
            Err(e) => {
                error!(job_id = job.id, "Failed to upload artifacts: {}", e);
                trace.line(format!("ERROR: Uploading artifacts failed: {}", e)).await;
                ScriptOutcome::Failed {
                    exit_code: None,
                    reason: FailureReason::RunnerSystemFailure,
                }
            }
        }
    }

    /// Send the final state, repeating it while the orchestrator defers it
    async fn report_state(&self, job: &JobPayload, trace: &TraceBuffer, outcome: ScriptOutcome) -> Result<()> {
        let (state, failure_reason, exit_code) = match outcome {
            ScriptOutcome::Success => (RemoteState::Success, None, None),
            ScriptOutcome::Failed { exit_code, reason } => (RemoteState::Failed, Some(reason), exit_code),
        };
        let update = UpdateJob {
            token: job.token.clone(),
            state,
            checksum: Some(trace.checksum().await),
            failure_reason,
            exit_code,
        };

        let deadline = Instant::now() + STATE_REPORT_DEADLINE;
        loop {
            let backoff = match self.client.update_job(job.id, &update).await {
                Ok(response) if response.accepted => {
                    info!(job_id = job.id, "Job finished: {:?}", state);
                    return Ok(());
                }
                Ok(response) => response
                    .backoff_secs
                    .map(Duration::from_secs)
                    .unwrap_or(DEFAULT_STATE_BACKOFF),
                Err(ClientError::JobNotRunning { status }) => {
                    info!(job_id = job.id, "Job already {} on the server", status);
                    return Ok(());
                }
                Err(e) if is_retryable(&e) => {
                    warn!(job_id = job.id, "Failed to report state, retrying: {}", e);
                    DEFAULT_STATE_BACKOFF
                }
                Err(e) => return Err(e).context("Failed to report job state"),
            };

            if Instant::now() + backoff > deadline {
                anyhow::bail!("Orchestrator did not accept the state of job {}", job.id);
            }
            debug!(job_id = job.id, "State deferred, retrying in {:?}", backoff);
            time::sleep(backoff).await;
        }
    }
}

/// Transport failures, busy traces and server errors are worth repeating
fn is_retryable(error: &ClientError) -> bool {
    match error {
        ClientError::RequestFailed(_) => true,
        _ => error.status() == Some(409) || error.is_server_error(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::ShellExecutionService;
    use conduit_core::Status;
    use conduit_core::domain::project::NewProject;
    use conduit_core::dto::pipeline::CreatePipeline;
    use conduit_core::dto::project::CreateUser;
    use conduit_core::dto::runner::RegisterRunner;
    use conduit_orchestrator::config::{Config, StoreKind};
    use conduit_orchestrator::repository::InMemoryStore;
    use conduit_orchestrator::service::ServiceContext;
    use conduit_orchestrator::storage::LocalObjectStore;
    use conduit_orchestrator::worker::{self, ChannelQueue};

    #[test]
    fn test_retryable_errors() {
        assert!(is_retryable(&ClientError::api_error(409, "busy", None)));
        assert!(is_retryable(&ClientError::api_error(503, "down", None)));
        assert!(!is_retryable(&ClientError::api_error(401, "bad token", None)));
        assert!(!is_retryable(&ClientError::JobNotRunning {
            status: "canceled".to_string()
        }));
    }

    /// Serve an in-memory orchestrator on a random local port
    async fn orchestrator(artifacts: &Path) -> String {
        let config = Config {
            store: StoreKind::Memory,
            registration_token: "register-me".to_string(),
            artifacts_dir: artifacts.to_path_buf(),
            ..Config::default()
        };
        let (queue, receiver) = ChannelQueue::new();
        let ctx = ServiceContext::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(queue),
            Arc::new(LocalObjectStore::new(artifacts)),
            config,
        );
        tokio::spawn(worker::run_worker(ctx.clone(), receiver, 2));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, conduit_orchestrator::api::create_router(ctx))
                .await
                .unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_job_runs_against_orchestrator() {
        let dir = tempfile::tempdir().unwrap();
        let url = orchestrator(&dir.path().join("objects")).await;
        let client = ConduitClient::new(&url).as_user("dev");

        client
            .create_user(&CreateUser {
                username: "dev".to_string(),
                admin: false,
            })
            .await
            .unwrap();
        let project: NewProject =
            serde_json::from_value(serde_json::json!({ "path": "acme/app" })).unwrap();
        let project = client.create_project(&project).await.unwrap().project;

        let config = r#"
            return {
                jobs = {
                    {
                        name = "build",
                        script = { "echo compiling", "mkdir -p out", "echo binary > out/app" },
                        artifacts = { paths = { "out" } },
                    },
                },
            }
        "#;
        let pipeline = client
            .create_pipeline(
                project.id,
                &CreatePipeline {
                    ref_name: "main".to_string(),
                    sha: None,
                    config: Some(config.to_string()),
                    variables: Default::default(),
                },
            )
            .await
            .unwrap();

        let registered = client
            .register_runner(&RegisterRunner {
                token: "register-me".to_string(),
                description: Some("test".to_string()),
                group_id: None,
                tags: Vec::new(),
                run_untagged: true,
                access_level: Default::default(),
            })
            .await
            .unwrap();

        // Processing happens in the background worker
        let mut assigned = None;
        for _ in 0..50 {
            assigned = client.request_job(&registered.token).await.unwrap();
            if assigned.is_some() {
                break;
            }
            time::sleep(Duration::from_millis(100)).await;
        }
        let job = assigned.expect("no job was assigned");
        let job_id = job.id;

        let runner = JobRunner {
            client: Arc::new(client.clone()),
            executor: Arc::new(ShellExecutionService::new()),
            workspace_dir: dir.path().join("builds"),
            trace_send_interval: Duration::from_secs(1),
        };
        runner.run(job).await.unwrap();

        let finished = client.get_job(job_id).await.unwrap();
        assert_eq!(finished.status, Status::Success);

        let trace = client.get_trace(job_id).await.unwrap();
        assert!(trace.contains("$ echo compiling\ncompiling\n"));
        assert!(trace.contains("Uploaded 1 path(s)"));

        // The workspace is gone once the job is over
        assert!(!dir.path().join("builds").join(format!("job-{}", job_id)).exists());

        let details = client.get_pipeline(pipeline.id).await.unwrap();
        assert_eq!(details.jobs.len(), 1);
    }
}
