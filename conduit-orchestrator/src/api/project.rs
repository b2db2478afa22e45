//! Project API Handlers
//!
//! Users, projects, memberships and trigger tokens.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use conduit_core::domain::project::{NewProject, Project, User};
use conduit_core::dto::project::{AddMember, CreateTrigger, CreateUser, CreatedProject, CreatedTrigger};

use crate::api::error::ApiResult;
use crate::api::extract::CurrentUser;
use crate::service::{ServiceContext, project};

/// POST /api/users
pub async fn create_user(
    State(ctx): State<ServiceContext>,
    Json(req): Json<CreateUser>,
) -> ApiResult<(StatusCode, Json<User>)> {
    tracing::info!("Creating user: {}", req.username);

    let user = project::create_user(&ctx, req).await?;
    Ok((StatusCode::CREATED, Json(user)))
}

/// POST /api/projects
pub async fn create_project(
    State(ctx): State<ServiceContext>,
    user: CurrentUser,
    Json(req): Json<NewProject>,
) -> ApiResult<(StatusCode, Json<CreatedProject>)> {
    tracing::info!("Creating project: {}", req.path);

    let created = project::create_project(&ctx, user.user(), req).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// GET /api/projects/{id}
pub async fn get_project(
    State(ctx): State<ServiceContext>,
    user: CurrentUser,
    Path(id): Path<i64>,
) -> ApiResult<Json<Project>> {
    tracing::debug!("Getting project: {}", id);

    Ok(Json(project::get_project(&ctx, user.user(), id).await?))
}

/// POST /api/projects/{id}/members
pub async fn add_member(
    State(ctx): State<ServiceContext>,
    user: CurrentUser,
    Path(id): Path<i64>,
    Json(req): Json<AddMember>,
) -> ApiResult<StatusCode> {
    tracing::info!("Adding user {} to project {} as {:?}", req.user_id, id, req.role);

    project::add_member(&ctx, user.user(), id, req).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/projects/{id}/triggers
pub async fn create_trigger(
    State(ctx): State<ServiceContext>,
    user: CurrentUser,
    Path(id): Path<i64>,
    Json(req): Json<CreateTrigger>,
) -> ApiResult<(StatusCode, Json<CreatedTrigger>)> {
    tracing::info!("Creating trigger for project: {}", id);

    let created = project::create_trigger(&ctx, user.user(), id, req).await?;
    Ok((StatusCode::CREATED, Json(created)))
}
