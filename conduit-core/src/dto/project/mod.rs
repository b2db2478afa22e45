//! Project, user and trigger DTOs

use serde::{Deserialize, Serialize};

use crate::domain::project::{MemberRole, Project, Trigger};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateUser {
    pub username: String,
    #[serde(default)]
    pub admin: bool,
}

/// A freshly created project, with the token runners register against it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatedProject {
    pub project: Project,
    pub runners_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddMember {
    pub user_id: i64,
    pub role: MemberRole,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateTrigger {
    #[serde(default)]
    pub description: Option<String>,
}

/// A freshly created trigger; the only time its token is shown
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatedTrigger {
    pub trigger: Trigger,
    pub token: String,
}
