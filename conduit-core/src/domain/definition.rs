//! Pipeline definition types
//!
//! The structure extracted from a `.conduit.lua` definition: stages, global
//! variables and job definitions. The orchestrator seeds pipelines from it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::domain::job::{ArtifactsSpec, TriggerSpec, WhenPolicy};

/// Default stages when a definition does not declare any
pub const DEFAULT_STAGES: [&str; 3] = ["build", "test", "deploy"];

/// Stage a job lands in when it does not name one
pub const DEFAULT_STAGE: &str = "test";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub stages: Vec<String>,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    pub jobs: Vec<JobDefinition>,
}

impl PipelineDefinition {
    pub fn job(&self, name: &str) -> Option<&JobDefinition> {
        self.jobs.iter().find(|job| job.name == name)
    }

    pub fn stage_index(&self, stage: &str) -> Option<usize> {
        self.stages.iter().position(|s| s == stage)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDefinition {
    pub name: String,
    pub stage: String,
    #[serde(default)]
    pub script: Vec<String>,
    #[serde(default)]
    pub when: WhenPolicy,
    pub start_in_secs: Option<u64>,
    /// Present (even empty) switches the job to DAG scheduling
    pub needs: Option<Vec<String>>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub allow_failure: bool,
    pub environment: Option<String>,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    pub image: Option<String>,
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub retry: u8,
    pub artifacts: Option<ArtifactsSpec>,
    pub trigger: Option<TriggerSpec>,
}
