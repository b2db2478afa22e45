//! Projects, users, memberships and pipeline triggers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    /// Unique `namespace/name` path
    pub path: String,
    pub group_id: Option<i64>,
    pub visibility: Visibility,
    pub shared_runners_enabled: bool,
    pub protected_branches: Vec<String>,
    /// Stored pipeline definition used when a request does not carry one
    pub ci_config: Option<String>,
    /// Keep the artifacts of the latest pipeline per ref locked
    pub keep_latest_artifact: bool,
    #[serde(skip_serializing, default)]
    pub runners_token: String,
    /// Aggregate size of job artifacts in bytes
    pub artifacts_size: i64,
    pub created_at: DateTime<Utc>,
}

impl Project {
    pub fn is_protected_ref(&self, ref_name: &str) -> bool {
        self.protected_branches.iter().any(|branch| branch == ref_name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewProject {
    pub path: String,
    #[serde(default)]
    pub group_id: Option<i64>,
    #[serde(default = "default_visibility")]
    pub visibility: Visibility,
    #[serde(default = "default_true")]
    pub shared_runners_enabled: bool,
    #[serde(default)]
    pub protected_branches: Vec<String>,
    #[serde(default)]
    pub ci_config: Option<String>,
    #[serde(default = "default_true")]
    pub keep_latest_artifact: bool,
}

fn default_visibility() -> Visibility {
    Visibility::Private
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Private,
    Internal,
    Public,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub admin: bool,
    pub created_at: DateTime<Utc>,
}

/// Project membership level, ordered from least to most privileged
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberRole {
    Guest,
    Reporter,
    Developer,
    Maintainer,
    Owner,
}

/// Token that lets external systems create pipelines as its owner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    pub id: i64,
    pub project_id: i64,
    pub owner_id: i64,
    #[serde(skip_serializing, default)]
    pub token: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member_roles_are_ordered() {
        assert!(MemberRole::Guest < MemberRole::Reporter);
        assert!(MemberRole::Developer < MemberRole::Maintainer);
        assert!(MemberRole::Owner > MemberRole::Maintainer);
    }

    #[test]
    fn test_new_project_defaults() {
        let project: NewProject = serde_json::from_str(r#"{"path": "acme/web"}"#).unwrap();
        assert_eq!(project.visibility, Visibility::Private);
        assert!(project.shared_runners_enabled);
        assert!(project.keep_latest_artifact);
        assert!(project.protected_branches.is_empty());
    }
}
