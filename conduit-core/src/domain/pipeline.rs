//! Pipeline domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::domain::status::Status;

/// Pipeline record
///
/// Top-level execution unit for one commit of one ref. Its status is never set
/// directly by callers: it is recomputed from the latest jobs on every
/// processing pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: i64,
    /// Per-project sequence number, increasing with creation order
    pub iid: i64,
    pub project_id: i64,
    pub ref_name: String,
    pub sha: String,
    pub tag: bool,
    pub source: PipelineSource,
    pub status: Status,
    pub locked: LockState,
    pub user_id: Option<i64>,
    pub variables: BTreeMap<String, String>,
    pub upstream: Option<UpstreamLink>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub lock_version: i32,
}

impl Pipeline {
    /// Created by a bridge of a pipeline in the same project
    pub fn is_child(&self) -> bool {
        self.source == PipelineSource::ParentPipeline
    }

    pub fn is_cancelable(&self) -> bool {
        self.status.is_cancelable()
    }

    /// Apply a freshly computed status, stamping start and finish times
    ///
    /// Returns `true` when the status actually changed.
    pub fn apply_status(&mut self, status: Status, now: DateTime<Utc>) -> bool {
        if self.status == status {
            return false;
        }

        if status == Status::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }

        if status.is_complete() {
            self.finished_at = Some(now);
        } else {
            self.finished_at = None;
        }

        self.status = status;
        self.updated_at = now;
        true
    }
}

/// Attributes of a pipeline that has not been persisted yet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPipeline {
    pub project_id: i64,
    pub ref_name: String,
    pub sha: String,
    pub tag: bool,
    pub source: PipelineSource,
    pub locked: LockState,
    pub user_id: Option<i64>,
    pub variables: BTreeMap<String, String>,
    pub upstream: Option<UpstreamLink>,
}

impl NewPipeline {
    pub fn into_pipeline(self, id: i64, iid: i64, now: DateTime<Utc>) -> Pipeline {
        Pipeline {
            id,
            iid,
            project_id: self.project_id,
            ref_name: self.ref_name,
            sha: self.sha,
            tag: self.tag,
            source: self.source,
            status: Status::Created,
            locked: self.locked,
            user_id: self.user_id,
            variables: self.variables,
            upstream: self.upstream,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            lock_version: 0,
        }
    }
}

/// The bridge job (and its pipeline) that created a downstream pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamLink {
    pub pipeline_id: i64,
    pub job_id: i64,
    pub project_id: i64,
}

/// What created the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineSource {
    Push,
    Web,
    Api,
    Trigger,
    Schedule,
    External,
    WebIde,
    /// Child pipeline created by a bridge in the same project
    ParentPipeline,
    /// Multi-project pipeline created by a bridge in another project
    Pipeline,
}

/// Whether the pipeline's artifacts are protected from expiry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockState {
    Unlocked,
    ArtifactsLocked,
}

/// Ordered group of jobs within a pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub id: i64,
    pub pipeline_id: i64,
    pub name: String,
    pub position: i32,
    pub status: Status,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewStage {
    pub name: String,
    pub position: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline() -> Pipeline {
        NewPipeline {
            project_id: 1,
            ref_name: "main".to_string(),
            sha: "abc".to_string(),
            tag: false,
            source: PipelineSource::Push,
            locked: LockState::ArtifactsLocked,
            user_id: None,
            variables: BTreeMap::new(),
            upstream: None,
        }
        .into_pipeline(1, 1, Utc::now())
    }

    #[test]
    fn test_apply_status_stamps_timestamps() {
        let mut pipeline = pipeline();
        let now = Utc::now();

        assert!(pipeline.apply_status(Status::Running, now));
        assert_eq!(pipeline.started_at, Some(now));
        assert_eq!(pipeline.finished_at, None);

        assert!(pipeline.apply_status(Status::Failed, now));
        assert_eq!(pipeline.finished_at, Some(now));

        assert!(!pipeline.apply_status(Status::Failed, now));
    }

    #[test]
    fn test_restarted_pipeline_clears_finished_at() {
        let mut pipeline = pipeline();
        let now = Utc::now();
        pipeline.apply_status(Status::Failed, now);
        pipeline.apply_status(Status::Running, now);
        assert_eq!(pipeline.finished_at, None);
    }

    #[test]
    fn test_child_detection() {
        let mut pipeline = pipeline();
        assert!(!pipeline.is_child());
        pipeline.source = PipelineSource::ParentPipeline;
        assert!(pipeline.is_child());
    }
}
