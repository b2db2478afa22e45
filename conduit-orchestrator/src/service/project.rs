//! Project Service
//!
//! Users, projects, memberships and pipeline triggers.

use conduit_core::domain::project::{MemberRole, NewProject, Project, User};
use conduit_core::dto::project::{AddMember, CreateTrigger, CreateUser, CreatedProject, CreatedTrigger};
use uuid::Uuid;

use crate::error::{ServiceError, ServiceResult};
use crate::service::auth::{self, Ability};
use crate::service::context::ServiceContext;

/// Create a user
///
/// Identity is established by the gateway in front of the orchestrator, so
/// this is open to any caller.
pub async fn create_user(ctx: &ServiceContext, req: CreateUser) -> ServiceResult<User> {
    let username = req.username.trim();
    if username.is_empty() {
        return Err(ServiceError::bad_request("Username cannot be empty"));
    }

    let user = ctx.store.create_user(username, req.admin).await?;
    tracing::info!(user_id = user.id, "User created: {}", user.username);
    Ok(user)
}

/// Create a project owned by `user`
pub async fn create_project(
    ctx: &ServiceContext,
    user: Option<&User>,
    req: NewProject,
) -> ServiceResult<CreatedProject> {
    let user = user.ok_or_else(|| ServiceError::unauthorized("Authentication required"))?;
    validate_project_request(&req)?;

    let runners_token = Uuid::new_v4().simple().to_string();
    let project = ctx.store.create_project(req, &runners_token).await?;
    ctx.store
        .add_member(project.id, user.id, MemberRole::Owner)
        .await?;

    tracing::info!(project_id = project.id, "Project created: {}", project.path);

    Ok(CreatedProject {
        project,
        runners_token,
    })
}

pub async fn get_project(
    ctx: &ServiceContext,
    user: Option<&User>,
    project_id: i64,
) -> ServiceResult<Project> {
    auth::readable_project(ctx, user, project_id).await
}

/// Insert or replace a membership
pub async fn add_member(
    ctx: &ServiceContext,
    user: Option<&User>,
    project_id: i64,
    req: AddMember,
) -> ServiceResult<()> {
    let project = auth::readable_project(ctx, user, project_id).await?;
    auth::authorize(ctx, user, Ability::AdminProject, &project).await?;

    if ctx.store.find_user(req.user_id).await?.is_none() {
        return Err(ServiceError::not_found(format!(
            "User {} not found",
            req.user_id
        )));
    }

    ctx.store.add_member(project.id, req.user_id, req.role).await?;
    tracing::info!(
        project_id,
        user_id = req.user_id,
        role = ?req.role,
        "Project member added"
    );
    Ok(())
}

pub async fn create_trigger(
    ctx: &ServiceContext,
    user: Option<&User>,
    project_id: i64,
    req: CreateTrigger,
) -> ServiceResult<CreatedTrigger> {
    let project = auth::readable_project(ctx, user, project_id).await?;
    auth::authorize(ctx, user, Ability::AdminProject, &project).await?;
    let owner = user.ok_or_else(|| ServiceError::unauthorized("Authentication required"))?;

    let token = Uuid::new_v4().simple().to_string();
    let trigger = ctx
        .store
        .create_trigger(project.id, owner.id, &token, req.description)
        .await?;

    tracing::info!(project_id, trigger_id = trigger.id, "Pipeline trigger created");

    Ok(CreatedTrigger { trigger, token })
}

// =============================================================================
// Validation
// =============================================================================

fn validate_project_request(req: &NewProject) -> ServiceResult<()> {
    let path = req.path.trim();
    if path.is_empty() {
        return Err(ServiceError::bad_request("Project path cannot be empty"));
    }

    if path.len() > 255 {
        return Err(ServiceError::bad_request(
            "Project path is too long (max 255 characters)",
        ));
    }

    if let Some(config) = &req.ci_config {
        conduit_lua::parse_pipeline_definition(config).map_err(|e| {
            ServiceError::unprocessable(format!("Invalid pipeline configuration: {:#}", e))
        })?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Reason;
    use crate::service::test_support::TestEnv;

    fn new_project(path: &str) -> NewProject {
        serde_json::from_value(serde_json::json!({ "path": path })).unwrap()
    }

    #[tokio::test]
    async fn test_creator_becomes_owner() {
        let env = TestEnv::new();
        let alice = env.user("alice").await;

        let created = create_project(&env.ctx, Some(&alice), new_project("acme/web"))
            .await
            .unwrap();

        assert!(!created.runners_token.is_empty());
        let role = env
            .ctx
            .store
            .member_role(created.project.id, alice.id)
            .await
            .unwrap();
        assert_eq!(role, Some(MemberRole::Owner));
    }

    #[tokio::test]
    async fn test_project_requires_a_user() {
        let env = TestEnv::new();
        let err = create_project(&env.ctx, None, new_project("acme/web"))
            .await
            .unwrap_err();
        assert_eq!(err.reason, Reason::Unauthorized);
    }

    #[tokio::test]
    async fn test_invalid_stored_config_is_rejected() {
        let env = TestEnv::new();
        let alice = env.user("alice").await;
        let mut req = new_project("acme/web");
        req.ci_config = Some("return { jobs = {} }".to_string());

        let err = create_project(&env.ctx, Some(&alice), req)
            .await
            .unwrap_err();
        assert_eq!(err.reason, Reason::UnprocessableEntity);
    }

    #[tokio::test]
    async fn test_only_maintainers_manage_members() {
        let env = TestEnv::new();
        let alice = env.user("alice").await;
        let bob = env.user("bob").await;
        let project = env.project(&alice, "acme/web").await;

        add_member(
            &env.ctx,
            Some(&alice),
            project.id,
            AddMember {
                user_id: bob.id,
                role: MemberRole::Developer,
            },
        )
        .await
        .unwrap();

        let err = create_trigger(&env.ctx, Some(&bob), project.id, CreateTrigger::default())
            .await
            .unwrap_err();
        assert_eq!(err.reason, Reason::Forbidden);

        let created = create_trigger(&env.ctx, Some(&alice), project.id, CreateTrigger::default())
            .await
            .unwrap();
        assert_eq!(created.trigger.owner_id, alice.id);
    }

    #[tokio::test]
    async fn test_private_projects_look_missing_to_strangers() {
        let env = TestEnv::new();
        let alice = env.user("alice").await;
        let mallory = env.user("mallory").await;
        let project = env.project(&alice, "acme/web").await;

        let err = get_project(&env.ctx, Some(&mallory), project.id)
            .await
            .unwrap_err();
        assert_eq!(err.reason, Reason::NotFound);
    }
}
