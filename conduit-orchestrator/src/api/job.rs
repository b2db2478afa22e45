//! Job API Handlers
//!
//! User-facing job endpoints and the runner job API: requesting work,
//! streaming traces, reporting state and uploading artifacts.

use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use conduit_core::domain::artifact::{ArtifactType, JobArtifact};
use conduit_core::domain::job::Job;
use conduit_core::domain::trace::ContentRange;
use conduit_core::dto::job::{RequestJob, TraceAppend, UpdateJob};
use serde::Deserialize;

use crate::api::error::{ApiError, ApiResult};
use crate::api::extract::{CurrentUser, job_token};
use crate::error::{Reason, ServiceError};
use crate::service::register_job::{self, RequestOutcome};
use crate::service::{ServiceContext, artifacts, build_state, cancel, pipeline, retry, trace};

pub const JOB_STATUS_HEADER: &str = "job-status";

#[derive(Debug, Default, Deserialize)]
pub struct TokenQuery {
    pub token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ArtifactQuery {
    pub artifact_type: ArtifactType,
    pub expire_in: Option<String>,
    pub token: Option<String>,
}

/// Tag a 403 with the job's current status so runners can stop
fn with_job_status(err: ServiceError, job: &Job) -> ApiError {
    let forbidden = err.reason == Reason::Forbidden;
    let err = ApiError::from(err);
    if forbidden {
        err.with_header(JOB_STATUS_HEADER, &job.status.to_string())
    } else {
        err
    }
}

// =============================================================================
// Job Endpoints
// =============================================================================

/// GET /api/jobs/{id}
pub async fn get_job(
    State(ctx): State<ServiceContext>,
    user: CurrentUser,
    Path(id): Path<i64>,
) -> ApiResult<Json<Job>> {
    tracing::debug!("Getting job: {}", id);

    Ok(Json(pipeline::get_job(&ctx, user.user(), id).await?))
}

/// POST /api/jobs/{id}/retry
pub async fn retry_job(
    State(ctx): State<ServiceContext>,
    user: CurrentUser,
    Path(id): Path<i64>,
) -> ApiResult<(StatusCode, Json<Job>)> {
    tracing::info!("Retrying job: {}", id);

    let job = retry::retry_job(&ctx, user.user(), id).await?;
    Ok((StatusCode::CREATED, Json(job)))
}

/// POST /api/jobs/{id}/play
pub async fn play_job(
    State(ctx): State<ServiceContext>,
    user: CurrentUser,
    Path(id): Path<i64>,
) -> ApiResult<Json<Job>> {
    tracing::info!("Playing job: {}", id);

    Ok(Json(retry::play_job(&ctx, user.user(), id).await?))
}

/// POST /api/jobs/{id}/cancel
pub async fn cancel_job(
    State(ctx): State<ServiceContext>,
    user: CurrentUser,
    Path(id): Path<i64>,
) -> ApiResult<Json<Job>> {
    tracing::info!("Canceling job: {}", id);

    Ok(Json(cancel::cancel_job(&ctx, user.user(), id).await?))
}

/// GET /api/jobs/{id}/trace
pub async fn get_trace(
    State(ctx): State<ServiceContext>,
    user: CurrentUser,
    Path(id): Path<i64>,
) -> ApiResult<Response> {
    tracing::debug!("Getting trace for job: {}", id);

    let data = trace::read_trace(&ctx, user.user(), id).await?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        data,
    )
        .into_response())
}

// =============================================================================
// Runner Job API
// =============================================================================

/// POST /api/jobs/request
/// Hand the oldest matching pending job to the runner
pub async fn request_job(
    State(ctx): State<ServiceContext>,
    Json(req): Json<RequestJob>,
) -> ApiResult<Response> {
    let response = match register_job::request_job(&ctx, req).await? {
        RequestOutcome::Assigned(payload) => {
            tracing::info!("Assigned job {} to runner", payload.id);
            (StatusCode::CREATED, Json(*payload)).into_response()
        }
        RequestOutcome::NoJob => StatusCode::NO_CONTENT.into_response(),
        RequestOutcome::Conflict => StatusCode::CONFLICT.into_response(),
    };
    Ok(response)
}

/// PUT /api/jobs/{id}
/// Report the job state; 202 means the runner has to repeat the call
pub async fn update_job(
    State(ctx): State<ServiceContext>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    Json(req): Json<UpdateJob>,
) -> ApiResult<Response> {
    let token = job_token(&headers, Some(&req.token))?;
    let job = trace::authenticate_job(&ctx, id, &token).await?;
    tracing::debug!("Job {} reported {:?}", id, req.state);

    let response = build_state::update_job_state(&ctx, &job, req)
        .await
        .map_err(|err| with_job_status(err, &job))?;

    let status = if response.accepted {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    Ok((status, Json(response)).into_response())
}

/// PATCH /api/jobs/{id}/trace
/// Append bytes at the offset given by `Content-Range`
pub async fn append_trace(
    State(ctx): State<ServiceContext>,
    Path(id): Path<i64>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let token = job_token(&headers, query.token.as_deref())?;
    let job = trace::authenticate_job(&ctx, id, &token).await?;

    let range: ContentRange = headers
        .get(header::CONTENT_RANGE)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| ServiceError::bad_request("Missing Content-Range header"))?
        .parse()
        .map_err(ServiceError::bad_request)?;

    if range != ContentRange::for_append(range.start, body.len()) {
        return Err(ServiceError::bad_request("Content-Range does not match the body").into());
    }

    let appended = trace::append_trace(&ctx, &job, range.start, &body)
        .await
        .map_err(|err| with_job_status(err, &job))?;

    let response = match appended {
        TraceAppend::Accepted { stream_size } => (
            StatusCode::ACCEPTED,
            [
                ("range", format!("0-{}", stream_size)),
                (JOB_STATUS_HEADER, job.status.to_string()),
            ],
        )
            .into_response(),
        TraceAppend::RangeMismatch { stream_size } => {
            tracing::debug!(
                "Trace range mismatch for job {}: got {}, stream is {}",
                id,
                range.start,
                stream_size
            );
            (
                StatusCode::RANGE_NOT_SATISFIABLE,
                [(header::RANGE, format!("0-{}", stream_size))],
            )
                .into_response()
        }
    };
    Ok(response)
}

/// POST /api/jobs/{id}/artifacts?artifact_type=&expire_in=
pub async fn upload_artifact(
    State(ctx): State<ServiceContext>,
    Path(id): Path<i64>,
    Query(query): Query<ArtifactQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<JobArtifact>)> {
    let token = job_token(&headers, query.token.as_deref())?;
    let job = trace::authenticate_job(&ctx, id, &token).await?;
    tracing::info!(
        "Uploading {} artifact for job {} ({} bytes)",
        query.artifact_type.as_str(),
        id,
        body.len()
    );

    let artifact = artifacts::upload_artifact(
        &ctx,
        &job,
        query.artifact_type,
        query.expire_in.as_deref(),
        &body,
    )
    .await
    .map_err(|err| with_job_status(err, &job))?;

    Ok((StatusCode::CREATED, Json(artifact)))
}
