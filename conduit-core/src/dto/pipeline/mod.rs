//! Pipeline DTOs
//!
//! Data transfer objects for pipeline-related operations.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::domain::job::Job;
use crate::domain::pipeline::{Pipeline, Stage};

/// Request to create a pipeline for a ref
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePipeline {
    #[serde(rename = "ref")]
    pub ref_name: String,

    /// Commit to build; defaults to the ref name when absent
    #[serde(default)]
    pub sha: Option<String>,

    /// Lua pipeline definition; defaults to the project's stored definition
    #[serde(default)]
    pub config: Option<String>,

    #[serde(default)]
    pub variables: BTreeMap<String, String>,
}

/// Request to create a pipeline with a trigger token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerPipeline {
    pub token: String,

    #[serde(rename = "ref")]
    pub ref_name: String,

    #[serde(default)]
    pub variables: BTreeMap<String, String>,
}

/// A pipeline with its stages and latest jobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDetails {
    pub pipeline: Pipeline,
    pub stages: Vec<Stage>,
    pub jobs: Vec<Job>,
    /// Pipelines created by this pipeline's bridges
    pub downstream: Vec<Pipeline>,
}

/// Request to cancel a pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelPipeline {
    /// Cancel downstream pipelines in the background instead of inline
    #[serde(default = "default_true")]
    pub async_downstream: bool,
}

impl Default for CancelPipeline {
    fn default() -> Self {
        Self {
            async_downstream: true,
        }
    }
}

fn default_true() -> bool {
    true
}
