//! Job DTOs
//!
//! Payloads of the runner job API: requesting work, reporting state and the
//! job description a runner executes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::domain::job::{ArtifactsSpec, FailureReason};
use crate::domain::status::Status;

/// Request for a job, sent by a runner
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestJob {
    /// Runner authentication token
    pub token: String,
}

/// Everything a runner needs to execute a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    pub id: i64,
    /// Job token used for trace, state and artifact calls
    pub token: String,
    pub name: String,
    pub stage: String,
    pub project_id: i64,
    pub pipeline_id: i64,
    pub ref_name: String,
    pub sha: String,
    pub script: Vec<String>,
    pub image: Option<String>,
    pub timeout_secs: Option<u64>,
    pub variables: BTreeMap<String, String>,
    pub artifacts: Option<ArtifactsSpec>,
}

/// State a runner reports for a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteState {
    Running,
    Success,
    Failed,
}

impl RemoteState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RemoteState::Running)
    }

    pub fn to_status(self) -> Status {
        match self {
            RemoteState::Running => Status::Running,
            RemoteState::Success => Status::Success,
            RemoteState::Failed => Status::Failed,
        }
    }
}

/// Job state update sent by a runner
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateJob {
    /// Job token
    pub token: String,
    pub state: RemoteState,
    /// `sha256:<hex>` over the whole trace the runner sent
    #[serde(default)]
    pub checksum: Option<String>,
    #[serde(default)]
    pub failure_reason: Option<FailureReason>,
    #[serde(default)]
    pub exit_code: Option<i32>,
}

/// Outcome of a state update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateJobResponse {
    /// `true` when the final state was recorded, `false` when the runner must
    /// repeat the call after `backoff_secs`
    pub accepted: bool,
    pub backoff_secs: Option<u64>,
}

/// Outcome of a trace append
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceAppend {
    /// Bytes stored; stream now has the given size
    Accepted { stream_size: u64 },
    /// Offset did not match the stream; nothing stored
    RangeMismatch { stream_size: u64 },
}

impl TraceAppend {
    pub fn stream_size(&self) -> u64 {
        match self {
            TraceAppend::Accepted { stream_size } | TraceAppend::RangeMismatch { stream_size } => {
                *stream_size
            }
        }
    }
}
