//! Job-related API endpoints

use crate::error::{ClientError, Result};
use crate::{ConduitClient, header_str};
use conduit_core::domain::artifact::{ArtifactType, JobArtifact};
use conduit_core::domain::job::Job;
use conduit_core::domain::trace::ContentRange;
use conduit_core::dto::job::{JobPayload, RequestJob, TraceAppend, UpdateJob, UpdateJobResponse};
use reqwest::{Method, StatusCode, header};

/// Stream size from a `0-<size>` range header
fn stream_size(value: Option<&str>) -> Result<u64> {
    let value = value.ok_or_else(|| ClientError::ParseError("Missing range header".to_string()))?;
    let range: ContentRange = value.parse().map_err(ClientError::ParseError)?;
    Ok(range.end)
}

impl ConduitClient {
    // =============================================================================
    // Job Queries & Control
    // =============================================================================

    pub async fn get_job(&self, job_id: i64) -> Result<Job> {
        let path = format!("/api/jobs/{}", job_id);
        let response = self.request(Method::GET, &path).send().await?;

        self.handle_response(response).await
    }

    /// Retry a finished job; returns the new job
    pub async fn retry_job(&self, job_id: i64) -> Result<Job> {
        let path = format!("/api/jobs/{}/retry", job_id);
        let response = self.request(Method::POST, &path).send().await?;

        self.handle_response(response).await
    }

    /// Start a manual job
    pub async fn play_job(&self, job_id: i64) -> Result<Job> {
        let path = format!("/api/jobs/{}/play", job_id);
        let response = self.request(Method::POST, &path).send().await?;

        self.handle_response(response).await
    }

    pub async fn cancel_job(&self, job_id: i64) -> Result<Job> {
        let path = format!("/api/jobs/{}/cancel", job_id);
        let response = self.request(Method::POST, &path).send().await?;

        self.handle_response(response).await
    }

    /// Get the full trace of a job
    pub async fn get_trace(&self, job_id: i64) -> Result<String> {
        let path = format!("/api/jobs/{}/trace", job_id);
        let response = self.request(Method::GET, &path).send().await?;

        if !response.status().is_success() {
            return Err(Self::error_for(response).await);
        }
        Ok(response.text().await?)
    }

    // =============================================================================
    // Runner Job API
    // =============================================================================

    /// Ask for the next job this runner may pick
    ///
    /// `None` when nothing is pending or when another runner won the race
    /// for the job; both mean "ask again later".
    pub async fn request_job(&self, runner_token: &str) -> Result<Option<JobPayload>> {
        let response = self
            .client
            .post(self.url("/api/jobs/request"))
            .json(&RequestJob {
                token: runner_token.to_string(),
            })
            .send()
            .await?;

        match response.status() {
            StatusCode::NO_CONTENT => Ok(None),
            StatusCode::CONFLICT => {
                tracing::debug!("Job request conflicted with another runner");
                Ok(None)
            }
            _ => self.handle_response(response).await.map(Some),
        }
    }

    /// Report the job state
    ///
    /// A response with `accepted == false` asks the runner to repeat the
    /// same call after `backoff_secs`.
    pub async fn update_job(&self, job_id: i64, req: &UpdateJob) -> Result<UpdateJobResponse> {
        let path = format!("/api/jobs/{}", job_id);
        let response = self
            .job_request(Method::PUT, &path, &req.token)
            .json(req)
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Append trace bytes written at `offset`
    ///
    /// A [`TraceAppend::RangeMismatch`] carries the size the server holds;
    /// the caller resends from there.
    pub async fn append_trace(
        &self,
        job_id: i64,
        token: &str,
        offset: u64,
        data: Vec<u8>,
    ) -> Result<TraceAppend> {
        let path = format!("/api/jobs/{}/trace", job_id);
        let range = ContentRange::for_append(offset, data.len());
        let response = self
            .job_request(Method::PATCH, &path, token)
            .header(header::CONTENT_RANGE, range.to_string())
            .header(header::CONTENT_TYPE, "text/plain")
            .body(data)
            .send()
            .await?;

        match response.status() {
            StatusCode::ACCEPTED => Ok(TraceAppend::Accepted {
                stream_size: stream_size(header_str(&response, "range"))?,
            }),
            StatusCode::RANGE_NOT_SATISFIABLE => Ok(TraceAppend::RangeMismatch {
                stream_size: stream_size(header_str(&response, "range"))?,
            }),
            _ => Err(Self::error_for(response).await),
        }
    }

    /// Upload an artifact file for a running job
    ///
    /// `expire_in` takes durations like `"3 days"` or `"never"`; without it
    /// the job's own setting applies.
    pub async fn upload_artifact(
        &self,
        job_id: i64,
        token: &str,
        artifact_type: ArtifactType,
        expire_in: Option<&str>,
        data: Vec<u8>,
    ) -> Result<JobArtifact> {
        let path = format!("/api/jobs/{}/artifacts", job_id);
        let mut request = self
            .job_request(Method::POST, &path, token)
            .query(&[("artifact_type", artifact_type.as_str())]);
        if let Some(expire_in) = expire_in {
            request = request.query(&[("expire_in", expire_in)]);
        }
        let response = request.body(data).send().await?;

        self.handle_response(response).await
    }
}
