//! Runner domain model
//!
//! Represents an agent that polls the orchestrator for jobs and executes them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::job::Job;

/// A runner that can execute jobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Runner {
    pub id: i64,

    /// Authentication token presented on every job request
    #[serde(skip_serializing, default)]
    pub token: String,

    pub description: Option<String>,

    /// Which projects the runner may serve
    pub runner_type: RunnerType,

    /// Owning group for group runners
    pub group_id: Option<i64>,

    /// Assigned projects for project runners
    pub project_ids: Vec<i64>,

    pub tags: Vec<String>,

    /// Accept jobs that declare no tags
    pub run_untagged: bool,

    pub access_level: RunnerAccessLevel,

    /// Paused runners receive no jobs
    pub active: bool,

    pub status: RunnerStatus,

    /// Last time the runner talked to the orchestrator
    pub contacted_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
}

impl Runner {
    /// Every tag the job requires is offered by the runner
    pub fn matches_tags(&self, job_tags: &[String]) -> bool {
        if job_tags.is_empty() {
            return self.run_untagged;
        }
        job_tags.iter().all(|tag| self.tags.contains(tag))
    }

    /// Protected jobs only go to runners restricted to protected refs
    pub fn matches_protection(&self, job_protected: bool) -> bool {
        match self.access_level {
            RunnerAccessLevel::RefProtected => job_protected,
            RunnerAccessLevel::NotProtected => true,
        }
    }

    /// Tag and protection compatibility with a pending job
    pub fn can_pick(&self, job: &Job) -> bool {
        self.matches_protection(job.protected) && self.matches_tags(&job.tags)
    }

    pub fn is_shared(&self) -> bool {
        self.runner_type == RunnerType::Instance
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRunner {
    pub description: Option<String>,
    pub runner_type: RunnerType,
    pub group_id: Option<i64>,
    pub project_ids: Vec<i64>,
    pub tags: Vec<String>,
    pub run_untagged: bool,
    pub access_level: RunnerAccessLevel,
}

/// Scope of projects a runner serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerType {
    /// Shared by every project with shared runners enabled
    Instance,
    Group,
    Project,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerAccessLevel {
    #[default]
    NotProtected,
    RefProtected,
}

/// Status of a runner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunnerStatus {
    /// Runner contacted the orchestrator recently
    Online,

    /// Runner hasn't been seen recently
    Offline,
}

impl std::fmt::Display for RunnerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunnerStatus::Online => write!(f, "Online"),
            RunnerStatus::Offline => write!(f, "Offline"),
        }
    }
}
