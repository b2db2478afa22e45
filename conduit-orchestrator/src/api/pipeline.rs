//! Pipeline API Handlers
//!
//! HTTP endpoints for pipeline management.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use conduit_core::domain::job::Job;
use conduit_core::domain::pipeline::Pipeline;
use conduit_core::dto::pipeline::{CancelPipeline, CreatePipeline, PipelineDetails, TriggerPipeline};
use serde::Deserialize;

use crate::api::error::ApiResult;
use crate::api::extract::CurrentUser;
use crate::service::{ServiceContext, cancel, pipeline, retry};

const DEFAULT_LIST_LIMIT: usize = 20;
const MAX_LIST_LIMIT: usize = 100;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<usize>,
}

/// POST /api/projects/{id}/pipelines
pub async fn create_pipeline(
    State(ctx): State<ServiceContext>,
    user: CurrentUser,
    Path(project_id): Path<i64>,
    Json(req): Json<CreatePipeline>,
) -> ApiResult<(StatusCode, Json<Pipeline>)> {
    tracing::info!("Creating pipeline for project {} on {}", project_id, req.ref_name);

    let pipeline = pipeline::create_pipeline(&ctx, user.user(), project_id, req).await?;
    Ok((StatusCode::CREATED, Json(pipeline)))
}

/// POST /api/projects/{id}/trigger/pipeline
///
/// Authenticated by the trigger token in the body, not by user.
pub async fn trigger_pipeline(
    State(ctx): State<ServiceContext>,
    Path(project_id): Path<i64>,
    Json(req): Json<TriggerPipeline>,
) -> ApiResult<(StatusCode, Json<Pipeline>)> {
    tracing::info!("Triggering pipeline for project {} on {}", project_id, req.ref_name);

    let pipeline = pipeline::trigger_pipeline(&ctx, project_id, req).await?;
    Ok((StatusCode::CREATED, Json(pipeline)))
}

/// GET /api/projects/{id}/pipelines
pub async fn list_pipelines(
    State(ctx): State<ServiceContext>,
    user: CurrentUser,
    Path(project_id): Path<i64>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<Pipeline>>> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);
    tracing::debug!("Listing pipelines for project {} (limit {})", project_id, limit);

    let pipelines = pipeline::list_pipelines(&ctx, user.user(), project_id, limit).await?;
    Ok(Json(pipelines))
}

/// GET /api/pipelines/{id}
pub async fn get_pipeline(
    State(ctx): State<ServiceContext>,
    user: CurrentUser,
    Path(id): Path<i64>,
) -> ApiResult<Json<PipelineDetails>> {
    tracing::debug!("Getting pipeline: {}", id);

    Ok(Json(pipeline::get_pipeline_details(&ctx, user.user(), id).await?))
}

/// GET /api/pipelines/{id}/jobs
pub async fn list_pipeline_jobs(
    State(ctx): State<ServiceContext>,
    user: CurrentUser,
    Path(id): Path<i64>,
) -> ApiResult<Json<Vec<Job>>> {
    tracing::debug!("Listing jobs for pipeline: {}", id);

    Ok(Json(pipeline::list_pipeline_jobs(&ctx, user.user(), id).await?))
}

/// POST /api/pipelines/{id}/cancel
///
/// `?async_downstream=false` cancels downstream pipelines inline.
pub async fn cancel_pipeline(
    State(ctx): State<ServiceContext>,
    user: CurrentUser,
    Path(id): Path<i64>,
    Query(req): Query<CancelPipeline>,
) -> ApiResult<Json<Pipeline>> {
    tracing::info!("Canceling pipeline: {}", id);

    Ok(Json(cancel::cancel_pipeline(&ctx, user.user(), id, req).await?))
}

/// POST /api/pipelines/{id}/retry
pub async fn retry_pipeline(
    State(ctx): State<ServiceContext>,
    user: CurrentUser,
    Path(id): Path<i64>,
) -> ApiResult<Json<Pipeline>> {
    tracing::info!("Retrying pipeline: {}", id);

    Ok(Json(retry::retry_pipeline(&ctx, user.user(), id).await?))
}
