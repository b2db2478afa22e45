//! Artifact domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::pipeline::LockState;

/// File produced by a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobArtifact {
    pub id: i64,
    pub job_id: i64,
    pub pipeline_id: i64,
    pub project_id: i64,
    pub file_type: ArtifactType,
    /// Object storage key
    pub file_path: String,
    pub size: i64,
    pub locked: ArtifactLock,
    pub expire_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl JobArtifact {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expire_at.is_some_and(|expire_at| expire_at < now)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJobArtifact {
    pub job_id: i64,
    pub pipeline_id: i64,
    pub project_id: i64,
    pub file_type: ArtifactType,
    pub file_path: String,
    pub size: i64,
    pub locked: ArtifactLock,
    pub expire_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    Archive,
    Metadata,
    Trace,
    Junit,
    Coverage,
    Dotenv,
}

impl ArtifactType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactType::Archive => "archive",
            ArtifactType::Metadata => "metadata",
            ArtifactType::Trace => "trace",
            ArtifactType::Junit => "junit",
            ArtifactType::Coverage => "coverage",
            ArtifactType::Dotenv => "dotenv",
        }
    }
}

/// Lock state of an artifact, mirroring its pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactLock {
    Unlocked,
    ArtifactsLocked,
    /// Not resolved yet; looked up from the pipeline when it matters
    Unknown,
}

impl From<LockState> for ArtifactLock {
    fn from(state: LockState) -> Self {
        match state {
            LockState::Unlocked => ArtifactLock::Unlocked,
            LockState::ArtifactsLocked => ArtifactLock::ArtifactsLocked,
        }
    }
}

/// File generated for a whole pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineArtifact {
    pub id: i64,
    pub pipeline_id: i64,
    pub project_id: i64,
    pub file_type: PipelineArtifactType,
    pub file_path: String,
    pub size: i64,
    pub locked: ArtifactLock,
    pub expire_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPipelineArtifact {
    pub pipeline_id: i64,
    pub project_id: i64,
    pub file_type: PipelineArtifactType,
    pub file_path: String,
    pub size: i64,
    pub locked: ArtifactLock,
    pub expire_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineArtifactType {
    CodeCoverage,
}

/// Stored file whose database row is gone and which awaits physical removal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletedObject {
    pub id: i64,
    pub file_path: String,
    pub pick_up_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_lock_state_maps_to_artifact_lock() {
        assert_eq!(
            ArtifactLock::from(LockState::Unlocked),
            ArtifactLock::Unlocked
        );
        assert_eq!(
            ArtifactLock::from(LockState::ArtifactsLocked),
            ArtifactLock::ArtifactsLocked
        );
    }

    #[test]
    fn test_expiry() {
        let now = Utc::now();
        let mut artifact = JobArtifact {
            id: 1,
            job_id: 1,
            pipeline_id: 1,
            project_id: 1,
            file_type: ArtifactType::Archive,
            file_path: "a".to_string(),
            size: 1,
            locked: ArtifactLock::Unlocked,
            expire_at: None,
            created_at: now,
        };
        assert!(!artifact.is_expired(now));
        artifact.expire_at = Some(now - Duration::seconds(1));
        assert!(artifact.is_expired(now));
    }
}
