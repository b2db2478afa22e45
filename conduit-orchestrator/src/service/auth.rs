//! Authorization
//!
//! `can(user, ability, project)` answers from the user's admin flag, the
//! project visibility and the user's membership role.

use conduit_core::domain::project::{MemberRole, Project, User, Visibility};

use crate::error::{ServiceError, ServiceResult};
use crate::service::context::ServiceContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ability {
    ReadProject,
    CreatePipeline,
    UpdatePipeline,
    UpdateBuild,
    CancelPipeline,
    /// Members, triggers and other project settings
    AdminProject,
}

impl Ability {
    fn required_role(&self) -> MemberRole {
        match self {
            Ability::ReadProject => MemberRole::Reporter,
            Ability::CreatePipeline
            | Ability::UpdatePipeline
            | Ability::UpdateBuild
            | Ability::CancelPipeline => MemberRole::Developer,
            Ability::AdminProject => MemberRole::Maintainer,
        }
    }
}

/// Pure authorization rule
pub fn allowed(
    ability: Ability,
    user: Option<&User>,
    visibility: Visibility,
    role: Option<MemberRole>,
) -> bool {
    if user.is_some_and(|user| user.admin) {
        return true;
    }

    if ability == Ability::ReadProject {
        match visibility {
            Visibility::Public => return true,
            Visibility::Internal if user.is_some() => return true,
            _ => {}
        }
    }

    role.is_some_and(|role| role >= ability.required_role())
}

pub async fn can(
    ctx: &ServiceContext,
    user: Option<&User>,
    ability: Ability,
    project: &Project,
) -> ServiceResult<bool> {
    let role = match user {
        Some(user) => ctx.store.member_role(project.id, user.id).await?,
        None => None,
    };
    Ok(allowed(ability, user, project.visibility, role))
}

/// `Forbidden` unless the user holds the ability
pub async fn authorize(
    ctx: &ServiceContext,
    user: Option<&User>,
    ability: Ability,
    project: &Project,
) -> ServiceResult<()> {
    if can(ctx, user, ability, project).await? {
        Ok(())
    } else {
        Err(ServiceError::forbidden(format!(
            "Insufficient permissions for project {}",
            project.path
        )))
    }
}

/// Project the user may read; unreadable projects look missing
pub async fn readable_project(
    ctx: &ServiceContext,
    user: Option<&User>,
    project_id: i64,
) -> ServiceResult<Project> {
    let project = ctx.project(project_id).await?;
    if can(ctx, user, Ability::ReadProject, &project).await? {
        Ok(project)
    } else {
        Err(ServiceError::not_found(format!(
            "Project {} not found",
            project_id
        )))
    }
}

/// Push access to a ref: maintainers for protected branches, developers
/// otherwise. Admin status is not consulted.
pub async fn can_update_branch(
    ctx: &ServiceContext,
    user: &User,
    project: &Project,
    ref_name: &str,
) -> ServiceResult<bool> {
    let Some(role) = ctx.store.member_role(project.id, user.id).await? else {
        return Ok(false);
    };

    let required = if project.is_protected_ref(ref_name) {
        MemberRole::Maintainer
    } else {
        MemberRole::Developer
    };
    Ok(role >= required)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn user(admin: bool) -> User {
        User {
            id: 1,
            username: "dev".to_string(),
            admin,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_admin_can_do_anything() {
        let admin = user(true);
        for ability in [
            Ability::ReadProject,
            Ability::CreatePipeline,
            Ability::AdminProject,
        ] {
            assert!(allowed(ability, Some(&admin), Visibility::Private, None));
        }
    }

    #[test]
    fn test_visibility_grants_read_only() {
        assert!(allowed(
            Ability::ReadProject,
            None,
            Visibility::Public,
            None
        ));
        assert!(!allowed(
            Ability::ReadProject,
            None,
            Visibility::Internal,
            None
        ));
        assert!(allowed(
            Ability::ReadProject,
            Some(&user(false)),
            Visibility::Internal,
            None
        ));
        assert!(!allowed(
            Ability::CreatePipeline,
            Some(&user(false)),
            Visibility::Public,
            None
        ));
    }

    #[test]
    fn test_roles() {
        let dev = user(false);
        let private = Visibility::Private;

        assert!(!allowed(
            Ability::ReadProject,
            Some(&dev),
            private,
            Some(MemberRole::Guest)
        ));
        assert!(allowed(
            Ability::ReadProject,
            Some(&dev),
            private,
            Some(MemberRole::Reporter)
        ));
        assert!(!allowed(
            Ability::UpdateBuild,
            Some(&dev),
            private,
            Some(MemberRole::Reporter)
        ));
        assert!(allowed(
            Ability::CancelPipeline,
            Some(&dev),
            private,
            Some(MemberRole::Developer)
        ));
        assert!(!allowed(
            Ability::AdminProject,
            Some(&dev),
            private,
            Some(MemberRole::Developer)
        ));
        assert!(allowed(
            Ability::AdminProject,
            Some(&dev),
            private,
            Some(MemberRole::Owner)
        ));
    }
}
