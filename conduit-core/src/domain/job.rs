//! Job domain types
//!
//! A job is either a build, executed by a runner, or a bridge, which spawns a
//! downstream pipeline instead of running code.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::domain::definition::PipelineDefinition;
use crate::domain::status::{JobEvent, Status, TransitionError};

/// Job record
///
/// Persisted by the orchestrator; `lock_version` guards every status update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub pipeline_id: i64,
    pub project_id: i64,
    pub name: String,
    pub stage: String,
    pub stage_idx: i32,
    pub kind: JobKind,
    pub status: Status,
    pub when: WhenPolicy,
    pub scheduling_type: SchedulingType,
    pub needs: Vec<String>,
    pub tags: Vec<String>,
    pub protected: bool,
    pub allow_failure: bool,
    pub environment: Option<String>,
    pub ref_name: String,
    pub tag: bool,
    pub sha: String,
    pub options: JobOptions,
    pub variables: BTreeMap<String, String>,
    pub user_id: Option<i64>,
    pub runner_id: Option<i64>,
    #[serde(skip_serializing, default)]
    pub token: Option<String>,
    pub retried: bool,
    pub failure_reason: Option<FailureReason>,
    pub exit_code: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub queued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub lock_version: i32,
}

impl Job {
    pub fn is_bridge(&self) -> bool {
        self.kind == JobKind::Bridge
    }

    /// Bridge whose status mirrors its downstream pipeline
    pub fn is_dependent_bridge(&self) -> bool {
        self.options
            .trigger
            .as_ref()
            .is_some_and(|trigger| trigger.depend)
    }

    /// Only the latest attempt of a finished build can be retried
    pub fn is_retryable(&self) -> bool {
        self.kind == JobKind::Build
            && !self.retried
            && matches!(
                self.status,
                Status::Success | Status::Failed | Status::Canceled
            )
    }

    /// Entry used when computing stage and pipeline composite statuses
    pub fn status_entry(&self) -> (Status, bool) {
        (self.status, self.allow_failure)
    }

    /// Fire a status machine event, stamping the matching timestamps
    pub fn fire(&mut self, event: JobEvent, now: DateTime<Utc>) -> Result<(), TransitionError> {
        let next = event.transition(self.status)?;

        match event {
            JobEvent::Enqueue | JobEvent::Requeue => {
                self.queued_at = Some(now);
                self.finished_at = None;
            }
            JobEvent::Run => self.started_at = Some(now),
            JobEvent::Process => {
                self.scheduled_at = None;
                self.finished_at = None;
            }
            JobEvent::Succeed | JobEvent::Drop | JobEvent::Cancel | JobEvent::Skip => {
                self.finished_at = Some(now);
            }
            JobEvent::Actionize | JobEvent::Schedule => {}
        }

        if event == JobEvent::Succeed {
            self.failure_reason = None;
        }

        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// Drop the job with a failure reason
    pub fn drop_with(
        &mut self,
        reason: FailureReason,
        exit_code: Option<i32>,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.fire(JobEvent::Drop, now)?;
        self.failure_reason = Some(reason);
        self.exit_code = exit_code;
        Ok(())
    }

    /// Attributes carried over to a retried copy of this job
    ///
    /// Status, timestamps, runner assignment, token, failure details and
    /// artifacts are never copied.
    pub fn clone_for_retry(&self) -> NewJob {
        NewJob {
            name: self.name.clone(),
            stage: self.stage.clone(),
            stage_idx: self.stage_idx,
            kind: self.kind,
            when: self.when,
            scheduling_type: self.scheduling_type,
            needs: self.needs.clone(),
            tags: self.tags.clone(),
            protected: self.protected,
            allow_failure: self.allow_failure,
            environment: self.environment.clone(),
            ref_name: self.ref_name.clone(),
            tag: self.tag,
            sha: self.sha.clone(),
            options: self.options.clone(),
            variables: self.variables.clone(),
            user_id: self.user_id,
        }
    }
}

/// Attributes of a job that has not been persisted yet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub name: String,
    pub stage: String,
    pub stage_idx: i32,
    pub kind: JobKind,
    pub when: WhenPolicy,
    pub scheduling_type: SchedulingType,
    pub needs: Vec<String>,
    pub tags: Vec<String>,
    pub protected: bool,
    pub allow_failure: bool,
    pub environment: Option<String>,
    pub ref_name: String,
    pub tag: bool,
    pub sha: String,
    pub options: JobOptions,
    pub variables: BTreeMap<String, String>,
    pub user_id: Option<i64>,
}

impl NewJob {
    /// Materialise the job with store-assigned identifiers
    pub fn into_job(self, id: i64, pipeline_id: i64, project_id: i64, now: DateTime<Utc>) -> Job {
        Job {
            id,
            pipeline_id,
            project_id,
            name: self.name,
            stage: self.stage,
            stage_idx: self.stage_idx,
            kind: self.kind,
            status: Status::Created,
            when: self.when,
            scheduling_type: self.scheduling_type,
            needs: self.needs,
            tags: self.tags,
            protected: self.protected,
            allow_failure: self.allow_failure,
            environment: self.environment,
            ref_name: self.ref_name,
            tag: self.tag,
            sha: self.sha,
            options: self.options,
            variables: self.variables,
            user_id: self.user_id,
            runner_id: None,
            token: None,
            retried: false,
            failure_reason: None,
            exit_code: None,
            created_at: now,
            updated_at: now,
            queued_at: None,
            started_at: None,
            finished_at: None,
            scheduled_at: None,
            lock_version: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Build,
    Bridge,
}

/// When a job runs relative to the jobs gating it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WhenPolicy {
    #[default]
    OnSuccess,
    OnFailure,
    Always,
    Manual,
    Delayed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingType {
    /// Gated by every job in earlier stages
    #[default]
    Stage,
    /// Gated only by the jobs listed in `needs`
    Dag,
}

/// Execution options copied verbatim into retries
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
    #[serde(default)]
    pub script: Vec<String>,
    pub image: Option<String>,
    pub timeout_secs: Option<u64>,
    pub artifacts: Option<ArtifactsSpec>,
    pub start_in_secs: Option<u64>,
    /// Automatic retries allowed after a failure
    #[serde(default)]
    pub retry: u8,
    pub trigger: Option<TriggerSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArtifactsSpec {
    pub paths: Vec<String>,
    pub expire_in_secs: Option<u64>,
}

/// Downstream pipeline a bridge creates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerSpec {
    pub target: TriggerTarget,
    /// Mirror the downstream pipeline status instead of succeeding at once
    #[serde(default)]
    pub depend: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerTarget {
    Child {
        definition: Box<PipelineDefinition>,
    },
    Project {
        project: String,
        branch: Option<String>,
    },
}

/// Why a job ended up failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    UnknownFailure,
    ScriptFailure,
    StuckOrTimeoutFailure,
    RunnerSystemFailure,
    DownstreamBridgeProjectNotFound,
    InvalidBridgeTrigger,
    ReachedMaxDescendantPipelinesDepth,
    ReachedMaxPipelineHierarchySize,
    InsufficientBridgePermissions,
    PipelineLoopDetected,
    DownstreamPipelineCreationFailed,
    ReachedDownstreamPipelineTriggerRateLimit,
}

impl FailureReason {
    pub const ALL: [FailureReason; 12] = [
        FailureReason::UnknownFailure,
        FailureReason::ScriptFailure,
        FailureReason::StuckOrTimeoutFailure,
        FailureReason::RunnerSystemFailure,
        FailureReason::DownstreamBridgeProjectNotFound,
        FailureReason::InvalidBridgeTrigger,
        FailureReason::ReachedMaxDescendantPipelinesDepth,
        FailureReason::ReachedMaxPipelineHierarchySize,
        FailureReason::InsufficientBridgePermissions,
        FailureReason::PipelineLoopDetected,
        FailureReason::DownstreamPipelineCreationFailed,
        FailureReason::ReachedDownstreamPipelineTriggerRateLimit,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::UnknownFailure => "unknown_failure",
            FailureReason::ScriptFailure => "script_failure",
            FailureReason::StuckOrTimeoutFailure => "stuck_or_timeout_failure",
            FailureReason::RunnerSystemFailure => "runner_system_failure",
            FailureReason::DownstreamBridgeProjectNotFound => "downstream_bridge_project_not_found",
            FailureReason::InvalidBridgeTrigger => "invalid_bridge_trigger",
            FailureReason::ReachedMaxDescendantPipelinesDepth => {
                "reached_max_descendant_pipelines_depth"
            }
            FailureReason::ReachedMaxPipelineHierarchySize => "reached_max_pipeline_hierarchy_size",
            FailureReason::InsufficientBridgePermissions => "insufficient_bridge_permissions",
            FailureReason::PipelineLoopDetected => "pipeline_loop_detected",
            FailureReason::DownstreamPipelineCreationFailed => {
                "downstream_pipeline_creation_failed"
            }
            FailureReason::ReachedDownstreamPipelineTriggerRateLimit => {
                "reached_downstream_pipeline_trigger_rate_limit"
            }
        }
    }

    /// Failures a job's `retry` option may recover from
    pub fn is_auto_retryable(&self) -> bool {
        matches!(
            self,
            FailureReason::UnknownFailure
                | FailureReason::ScriptFailure
                | FailureReason::StuckOrTimeoutFailure
                | FailureReason::RunnerSystemFailure
        )
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FailureReason::ALL
            .into_iter()
            .find(|reason| reason.as_str() == s)
            .ok_or_else(|| format!("unknown failure reason: {}", s))
    }
}
