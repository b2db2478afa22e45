//! Runner Service
//!
//! Registration, authentication and bookkeeping of runners.

use chrono::{Duration as ChronoDuration, Utc};
use conduit_core::domain::project::User;
use conduit_core::domain::runner::{NewRunner, Runner, RunnerType};
use conduit_core::dto::runner::{RegisterRunner, RegisteredRunner, RunnerSummary};
use uuid::Uuid;

use crate::error::{ServiceError, ServiceResult};
use crate::service::context::ServiceContext;

/// Register a runner with the orchestrator
///
/// The instance registration token creates an instance runner, or a group
/// runner when `group_id` is set. A project's runners token creates a
/// runner assigned to that project.
pub async fn register_runner(
    ctx: &ServiceContext,
    req: RegisterRunner,
) -> ServiceResult<RegisteredRunner> {
    validate_register_request(&req)?;

    let (runner_type, group_id, project_ids) = if req.token == ctx.config.registration_token {
        match req.group_id {
            Some(group_id) => (RunnerType::Group, Some(group_id), Vec::new()),
            None => (RunnerType::Instance, None, Vec::new()),
        }
    } else if let Some(project) = ctx.store.find_project_by_runners_token(&req.token).await? {
        (RunnerType::Project, None, vec![project.id])
    } else {
        return Err(ServiceError::unauthorized("Invalid registration token"));
    };

    let token = Uuid::new_v4().simple().to_string();
    let runner = ctx
        .store
        .create_runner(
            NewRunner {
                description: req.description,
                runner_type,
                group_id,
                project_ids,
                tags: req.tags,
                run_untagged: req.run_untagged,
                access_level: req.access_level,
            },
            &token,
        )
        .await?;

    tracing::info!(
        runner_id = runner.id,
        runner_type = ?runner.runner_type,
        "Runner registered"
    );

    Ok(RegisteredRunner {
        id: runner.id,
        token,
    })
}

/// Runner owning `token`
pub async fn verify_runner(ctx: &ServiceContext, token: &str) -> ServiceResult<Runner> {
    ctx.store
        .find_runner_by_token(token)
        .await?
        .ok_or_else(|| ServiceError::unauthorized("Invalid runner token"))
}

/// Update heartbeat for a runner
///
/// Keeps the runner marked as online. Should be called periodically by runners.
pub async fn heartbeat(ctx: &ServiceContext, token: &str) -> ServiceResult<()> {
    let runner = verify_runner(ctx, token).await?;
    ctx.store.touch_runner(runner.id, Utc::now()).await?;

    tracing::debug!(runner_id = runner.id, "Heartbeat received");

    Ok(())
}

/// List all runners (administrators only)
pub async fn list_runners(
    ctx: &ServiceContext,
    user: Option<&User>,
) -> ServiceResult<Vec<RunnerSummary>> {
    require_admin(user)?;
    let runners = ctx.store.list_runners().await?;
    Ok(runners.into_iter().map(RunnerSummary::from).collect())
}

/// Delete a runner (administrators only)
pub async fn delete_runner(ctx: &ServiceContext, user: Option<&User>, id: i64) -> ServiceResult<()> {
    require_admin(user)?;

    if !ctx.store.delete_runner(id).await? {
        return Err(ServiceError::not_found(format!("Runner {} not found", id)));
    }

    tracing::info!(runner_id = id, "Runner deleted");

    Ok(())
}

/// Mark stale runners as offline
///
/// Runners that have not contacted the orchestrator within
/// `runner_offline_after` are marked offline.
pub async fn mark_stale_runners(ctx: &ServiceContext) -> ServiceResult<()> {
    let offline_after = ChronoDuration::from_std(ctx.sweeps().runner_offline_after)
        .unwrap_or_else(|_| ChronoDuration::hours(1));
    let count = ctx
        .store
        .mark_stale_runners(Utc::now() - offline_after)
        .await?;

    if count > 0 {
        tracing::info!("Marked {} runner(s) as offline", count);
    }

    Ok(())
}

// =============================================================================
// Validation
// =============================================================================

fn require_admin(user: Option<&User>) -> ServiceResult<()> {
    match user {
        Some(user) if user.admin => Ok(()),
        Some(_) => Err(ServiceError::forbidden("Administrator access required")),
        None => Err(ServiceError::unauthorized("Authentication required")),
    }
}

fn validate_register_request(req: &RegisterRunner) -> ServiceResult<()> {
    if req.token.trim().is_empty() {
        return Err(ServiceError::unauthorized("Registration token is required"));
    }

    if req
        .description
        .as_ref()
        .is_some_and(|description| description.len() > 255)
    {
        return Err(ServiceError::bad_request(
            "Description is too long (max 255 characters)",
        ));
    }

    if req.tags.iter().any(|tag| tag.trim().is_empty()) {
        return Err(ServiceError::bad_request("Runner tags cannot be empty"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Reason;
    use crate::service::test_support::TestEnv;
    use conduit_core::domain::runner::{RunnerAccessLevel, RunnerStatus};

    fn register(token: &str) -> RegisterRunner {
        RegisterRunner {
            token: token.to_string(),
            description: Some("builder".to_string()),
            group_id: None,
            tags: vec!["docker".to_string()],
            run_untagged: false,
            access_level: RunnerAccessLevel::NotProtected,
        }
    }

    #[tokio::test]
    async fn test_registration_token_picks_runner_type() {
        let env = TestEnv::new();

        let instance = register_runner(&env.ctx, register("register-me")).await.unwrap();
        let runner = verify_runner(&env.ctx, &instance.token).await.unwrap();
        assert_eq!(runner.runner_type, RunnerType::Instance);

        let mut req = register("register-me");
        req.group_id = Some(9);
        let group = register_runner(&env.ctx, req).await.unwrap();
        let runner = verify_runner(&env.ctx, &group.token).await.unwrap();
        assert_eq!(runner.runner_type, RunnerType::Group);
        assert_eq!(runner.group_id, Some(9));

        let owner = env.user("owner").await;
        let project = env.project(&owner, "acme/app").await;
        let scoped = register_runner(&env.ctx, register(&project.runners_token))
            .await
            .unwrap();
        let runner = verify_runner(&env.ctx, &scoped.token).await.unwrap();
        assert_eq!(runner.runner_type, RunnerType::Project);
        assert_eq!(runner.project_ids, vec![project.id]);
    }

    #[tokio::test]
    async fn test_unknown_registration_token() {
        let env = TestEnv::new();
        let err = register_runner(&env.ctx, register("guess")).await.unwrap_err();
        assert_eq!(err.reason, Reason::Unauthorized);
    }

    #[tokio::test]
    async fn test_heartbeat_marks_online() {
        let env = TestEnv::new();
        let registered = register_runner(&env.ctx, register("register-me")).await.unwrap();

        heartbeat(&env.ctx, &registered.token).await.unwrap();

        let runner = verify_runner(&env.ctx, &registered.token).await.unwrap();
        assert_eq!(runner.status, RunnerStatus::Online);
        assert!(runner.contacted_at.is_some());

        let err = heartbeat(&env.ctx, "nope").await.unwrap_err();
        assert_eq!(err.reason, Reason::Unauthorized);
    }

    #[tokio::test]
    async fn test_stale_runners_go_offline() {
        let env = TestEnv::with_config(|config| {
            config.sweeps.runner_offline_after = std::time::Duration::ZERO
        });
        let registered = register_runner(&env.ctx, register("register-me")).await.unwrap();
        heartbeat(&env.ctx, &registered.token).await.unwrap();

        mark_stale_runners(&env.ctx).await.unwrap();

        let runner = verify_runner(&env.ctx, &registered.token).await.unwrap();
        assert_eq!(runner.status, RunnerStatus::Offline);
    }

    #[tokio::test]
    async fn test_runner_admin_endpoints() {
        let env = TestEnv::new();
        let admin = env.admin("root").await;
        let dev = env.user("dev").await;
        let registered = register_runner(&env.ctx, register("register-me")).await.unwrap();

        let err = list_runners(&env.ctx, Some(&dev)).await.unwrap_err();
        assert_eq!(err.reason, Reason::Forbidden);

        let runners = list_runners(&env.ctx, Some(&admin)).await.unwrap();
        assert_eq!(runners.len(), 1);

        delete_runner(&env.ctx, Some(&admin), registered.id).await.unwrap();
        let err = delete_runner(&env.ctx, Some(&admin), registered.id)
            .await
            .unwrap_err();
        assert_eq!(err.reason, Reason::NotFound);
    }
}
