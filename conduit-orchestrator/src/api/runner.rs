//! Runner API Handlers
//!
//! HTTP endpoints for runner registration and lifecycle.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use conduit_core::dto::runner::{RegisterRunner, RegisteredRunner, RunnerSummary, RunnerToken};

use crate::api::error::ApiResult;
use crate::api::extract::CurrentUser;
use crate::service::{ServiceContext, runner};

// =============================================================================
// Runner Registration & Lifecycle
// =============================================================================

/// POST /api/runners
/// Register a runner with a registration or project runners token
pub async fn register_runner(
    State(ctx): State<ServiceContext>,
    Json(req): Json<RegisterRunner>,
) -> ApiResult<(StatusCode, Json<RegisteredRunner>)> {
    tracing::info!(
        "Registering runner: {}",
        req.description.as_deref().unwrap_or("(no description)")
    );

    let registered = runner::register_runner(&ctx, req).await?;
    Ok((StatusCode::CREATED, Json(registered)))
}

/// POST /api/runners/verify
pub async fn verify_runner(
    State(ctx): State<ServiceContext>,
    Json(req): Json<RunnerToken>,
) -> ApiResult<Json<RunnerSummary>> {
    let runner = runner::verify_runner(&ctx, &req.token).await?;
    tracing::debug!("Verified runner: {}", runner.id);

    Ok(Json(RunnerSummary::from(runner)))
}

/// POST /api/runners/heartbeat
/// Keep the runner marked as online
pub async fn runner_heartbeat(
    State(ctx): State<ServiceContext>,
    Json(req): Json<RunnerToken>,
) -> ApiResult<StatusCode> {
    runner::heartbeat(&ctx, &req.token).await?;
    Ok(StatusCode::NO_CONTENT)
}

// =============================================================================
// Administration
// =============================================================================

/// GET /api/runners
pub async fn list_runners(
    State(ctx): State<ServiceContext>,
    user: CurrentUser,
) -> ApiResult<Json<Vec<RunnerSummary>>> {
    tracing::debug!("Listing all runners");

    Ok(Json(runner::list_runners(&ctx, user.user()).await?))
}

/// DELETE /api/runners/{id}
pub async fn delete_runner(
    State(ctx): State<ServiceContext>,
    user: CurrentUser,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    tracing::info!("Deleting runner: {}", id);

    runner::delete_runner(&ctx, user.user(), id).await?;
    Ok(StatusCode::NO_CONTENT)
}
