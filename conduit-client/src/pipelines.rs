//! Pipeline-related API endpoints

use crate::ConduitClient;
use crate::error::Result;
use conduit_core::domain::job::Job;
use conduit_core::domain::pipeline::Pipeline;
use conduit_core::dto::pipeline::{CreatePipeline, PipelineDetails, TriggerPipeline};
use reqwest::Method;

impl ConduitClient {
    // =============================================================================
    // Pipeline Creation
    // =============================================================================

    /// Create a pipeline for a ref of the project
    pub async fn create_pipeline(&self, project_id: i64, req: &CreatePipeline) -> Result<Pipeline> {
        let path = format!("/api/projects/{}/pipelines", project_id);
        let response = self.request(Method::POST, &path).json(req).send().await?;

        self.handle_response(response).await
    }

    /// Create a pipeline with a trigger token instead of a user
    pub async fn trigger_pipeline(&self, project_id: i64, req: &TriggerPipeline) -> Result<Pipeline> {
        let path = format!("/api/projects/{}/trigger/pipeline", project_id);
        let response = self
            .client
            .post(self.url(&path))
            .json(req)
            .send()
            .await?;

        self.handle_response(response).await
    }

    // =============================================================================
    // Pipeline Queries
    // =============================================================================

    /// List the most recent pipelines of a project, newest first
    pub async fn list_pipelines(&self, project_id: i64, limit: Option<usize>) -> Result<Vec<Pipeline>> {
        let path = format!("/api/projects/{}/pipelines", project_id);
        let mut request = self.request(Method::GET, &path);
        if let Some(limit) = limit {
            request = request.query(&[("limit", limit)]);
        }
        let response = request.send().await?;

        self.handle_response(response).await
    }

    /// Get a pipeline with its stages, latest jobs and downstream pipelines
    pub async fn get_pipeline(&self, pipeline_id: i64) -> Result<PipelineDetails> {
        let path = format!("/api/pipelines/{}", pipeline_id);
        let response = self.request(Method::GET, &path).send().await?;

        self.handle_response(response).await
    }

    pub async fn list_pipeline_jobs(&self, pipeline_id: i64) -> Result<Vec<Job>> {
        let path = format!("/api/pipelines/{}/jobs", pipeline_id);
        let response = self.request(Method::GET, &path).send().await?;

        self.handle_response(response).await
    }

    // =============================================================================
    // Pipeline Control
    // =============================================================================

    /// Cancel a pipeline; with `async_downstream` false its downstream
    /// pipelines are canceled before the call returns
    pub async fn cancel_pipeline(&self, pipeline_id: i64, async_downstream: bool) -> Result<Pipeline> {
        let path = format!("/api/pipelines/{}/cancel", pipeline_id);
        let response = self
            .request(Method::POST, &path)
            .query(&[("async_downstream", async_downstream)])
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Retry every failed or canceled job of a pipeline
    pub async fn retry_pipeline(&self, pipeline_id: i64) -> Result<Pipeline> {
        let path = format!("/api/pipelines/{}/retry", pipeline_id);
        let response = self.request(Method::POST, &path).send().await?;

        self.handle_response(response).await
    }
}
