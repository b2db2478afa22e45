//! Runner DTOs
//!
//! Data transfer objects for runner-related operations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::runner::{Runner, RunnerAccessLevel, RunnerStatus, RunnerType};

/// Request to register a runner with the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRunner {
    /// Instance registration token or a project's runners token
    pub token: String,

    #[serde(default)]
    pub description: Option<String>,

    /// Register a group runner (instance token only)
    #[serde(default)]
    pub group_id: Option<i64>,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub run_untagged: bool,

    #[serde(default)]
    pub access_level: RunnerAccessLevel,
}

/// Credentials handed back after registration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredRunner {
    pub id: i64,
    pub token: String,
}

/// Runner authentication, used by verify and heartbeat
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerToken {
    pub token: String,
}

/// Summary information about a runner
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerSummary {
    pub id: i64,

    pub description: Option<String>,

    pub runner_type: RunnerType,

    pub tags: Vec<String>,

    pub run_untagged: bool,

    pub access_level: RunnerAccessLevel,

    /// Last time this runner contacted the orchestrator
    pub contacted_at: Option<DateTime<Utc>>,

    /// Current status of the runner
    pub status: RunnerStatus,
}

impl From<Runner> for RunnerSummary {
    fn from(runner: Runner) -> Self {
        RunnerSummary {
            id: runner.id,
            description: runner.description,
            runner_type: runner.runner_type,
            tags: runner.tags,
            run_untagged: runner.run_untagged,
            access_level: runner.access_level,
            contacted_at: runner.contacted_at,
            status: runner.status,
        }
    }
}
