//! Execution service
//!
//! Runs a job's script lines one by one with `sh -c` inside the job
//! workspace, feeding stdout and stderr into the trace buffer. The first
//! failing line fails the job.

use anyhow::{Context, Result};
use async_trait::async_trait;
use conduit_core::domain::job::FailureReason;
use conduit_core::dto::job::JobPayload;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::service::trace::TraceBuffer;

/// How a job's script ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptOutcome {
    Success,
    Failed {
        exit_code: Option<i32>,
        reason: FailureReason,
    },
}

/// Service trait for executing job scripts
#[async_trait]
pub trait ExecutionService: Send + Sync {
    /// Run the job's script in `workspace`, writing output to `trace`
    ///
    /// Dropping the returned future kills the running command.
    async fn execute(&self, job: &JobPayload, workspace: &Path, trace: &TraceBuffer) -> ScriptOutcome;
}

/// Runs script lines through a POSIX shell
pub struct ShellExecutionService {
    shell: String,
}

impl ShellExecutionService {
    pub fn new() -> Self {
        Self {
            shell: "sh".to_string(),
        }
    }

    async fn run_script(&self, job: &JobPayload, workspace: &Path, trace: &TraceBuffer) -> ScriptOutcome {
        for line in &job.script {
            trace.line(format!("$ {}", line)).await;
            debug!(job_id = job.id, "Running: {}", line);

            match self.run_line(line, job, workspace, trace).await {
                Ok(status) if status.success() => {}
                Ok(status) => {
                    let exit_code = status.code();
                    let shown = exit_code.map_or_else(|| "signal".to_string(), |code| code.to_string());
                    trace.line(format!("ERROR: Job failed: exit code {}", shown)).await;
                    return ScriptOutcome::Failed {
                        exit_code,
                        reason: FailureReason::ScriptFailure,
                    };
                }
                Err(e) => {
                    warn!(job_id = job.id, "Failed to run script line: {:#}", e);
                    trace.line(format!("ERROR: {:#}", e)).await;
                    return ScriptOutcome::Failed {
                        exit_code: None,
                        reason: FailureReason::RunnerSystemFailure,
                    };
                }
            }
        }

        ScriptOutcome::Success
    }

    async fn run_line(
        &self,
        line: &str,
        job: &JobPayload,
        workspace: &Path,
        trace: &TraceBuffer,
    ) -> Result<ExitStatus> {
        let mut child = Command::new(&self.shell)
            .arg("-c")
            .arg(line)
            .current_dir(workspace)
            .envs(&job.variables)
            .env("CI_PROJECT_DIR", workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to start {}", self.shell))?;

        let stdout = child.stdout.take().context("stdout was not captured")?;
        let stderr = child.stderr.take().context("stderr was not captured")?;
        let (out, err) = tokio::join!(pump(stdout, trace), pump(stderr, trace));
        out.context("Failed to read stdout")?;
        err.context("Failed to read stderr")?;

        child.wait().await.context("Failed to wait for command")
    }
}

impl Default for ShellExecutionService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutionService for ShellExecutionService {
    async fn execute(&self, job: &JobPayload, workspace: &Path, trace: &TraceBuffer) -> ScriptOutcome {
        let run = self.run_script(job, workspace, trace);

        let Some(secs) = job.timeout_secs else {
            return run.await;
        };

        match tokio::time::timeout(Duration::from_secs(secs), run).await {
            Ok(outcome) => outcome,
            Err(_) => {
                trace
                    .line(format!("ERROR: Job timed out after {} seconds", secs))
                    .await;
                ScriptOutcome::Failed {
                    exit_code: None,
                    reason: FailureReason::StuckOrTimeoutFailure,
                }
            }
        }
    }
}

/// Copy a child's output stream into the trace as it arrives
async fn pump(mut reader: impl AsyncRead + Unpin, trace: &TraceBuffer) -> std::io::Result<()> {
    let mut buf = [0u8; 8192];
    loop {
        let read = reader.read(&mut buf).await?;
        if read == 0 {
            return Ok(());
        }
        trace.append(&buf[..read]).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn payload(script: &[&str]) -> JobPayload {
        JobPayload {
            id: 7,
            token: "job-token".to_string(),
            name: "build".to_string(),
            stage: "build".to_string(),
            project_id: 1,
            pipeline_id: 3,
            ref_name: "main".to_string(),
            sha: "abc123".to_string(),
            script: script.iter().map(|line| line.to_string()).collect(),
            image: None,
            timeout_secs: None,
            variables: BTreeMap::from([("GREETING".to_string(), "hello".to_string())]),
            artifacts: None,
        }
    }

    async fn run(job: &JobPayload) -> (ScriptOutcome, String) {
        let workspace = tempfile::tempdir().unwrap();
        let trace = TraceBuffer::new();
        let outcome = ShellExecutionService::new()
            .execute(job, workspace.path(), &trace)
            .await;
        (outcome, String::from_utf8(trace.contents().await).unwrap())
    }

    #[tokio::test]
    async fn test_runs_lines_in_order() {
        let (outcome, trace) = run(&payload(&["echo $GREETING", "echo done"])).await;

        assert_eq!(outcome, ScriptOutcome::Success);
        assert_eq!(trace, "$ echo $GREETING\nhello\n$ echo done\ndone\n");
    }

    #[tokio::test]
    async fn test_first_failure_stops_the_script() {
        let (outcome, trace) = run(&payload(&["echo oops >&2; exit 3", "echo never"])).await;

        assert_eq!(
            outcome,
            ScriptOutcome::Failed {
                exit_code: Some(3),
                reason: FailureReason::ScriptFailure,
            }
        );
        assert!(trace.contains("oops"));
        assert!(trace.contains("exit code 3"));
        assert!(!trace.contains("never\n"));
    }

    #[tokio::test]
    async fn test_commands_run_in_workspace() {
        let workspace = tempfile::tempdir().unwrap();
        let trace = TraceBuffer::new();
        let job = payload(&["echo built > out.txt"]);

        let outcome = ShellExecutionService::new()
            .execute(&job, workspace.path(), &trace)
            .await;

        assert_eq!(outcome, ScriptOutcome::Success);
        let written = std::fs::read_to_string(workspace.path().join("out.txt")).unwrap();
        assert_eq!(written, "built\n");
    }

    #[tokio::test]
    async fn test_timeout_fails_the_job() {
        let mut job = payload(&["sleep 5"]);
        job.timeout_secs = Some(1);

        let (outcome, trace) = run(&job).await;

        assert_eq!(
            outcome,
            ScriptOutcome::Failed {
                exit_code: None,
                reason: FailureReason::StuckOrTimeoutFailure,
            }
        );
        assert!(trace.contains("timed out"));
    }
}
