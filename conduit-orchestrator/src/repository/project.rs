//! Project Repository
//!
//! Users, projects, memberships and trigger tokens.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conduit_core::domain::project::{MemberRole, NewProject, Project, Trigger, User};

use crate::error::{StoreError, StoreResult};
use crate::repository::{PgStore, ProjectStore, conflict_on_unique, enum_to_text, text_to_enum};

const PROJECT_COLUMNS: &str = r#"
    id, path, group_id, visibility, shared_runners_enabled, protected_branches,
    ci_config, keep_latest_artifact, runners_token, artifacts_size, created_at
"#;

#[async_trait]
impl ProjectStore for PgStore {
    async fn create_user(&self, username: &str, admin: bool) -> StoreResult<User> {
        let row = sqlx::query_as::<_, UserRow>(
            r#"
            INSERT INTO users (username, admin, created_at)
            VALUES ($1, $2, $3)
            RETURNING id, username, admin, created_at
            "#,
        )
        .bind(username)
        .bind(admin)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .map_err(|err| conflict_on_unique(err, &format!("user '{}' already exists", username)))?;

        Ok(row.into())
    }

    async fn find_user(&self, id: i64) -> StoreResult<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(
            "SELECT id, username, admin, created_at FROM users WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.into()))
    }

    async fn find_user_by_username(&self, username: &str) -> StoreResult<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(
            "SELECT id, username, admin, created_at FROM users WHERE username = $1",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.into()))
    }

    async fn create_project(
        &self,
        project: NewProject,
        runners_token: &str,
    ) -> StoreResult<Project> {
        let sql = format!(
            r#"
            INSERT INTO projects (
                path, group_id, visibility, shared_runners_enabled, protected_branches,
                ci_config, keep_latest_artifact, runners_token, artifacts_size, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 0, $9)
            RETURNING {PROJECT_COLUMNS}
            "#
        );

        let row = sqlx::query_as::<_, ProjectRow>(&sql)
            .bind(&project.path)
            .bind(project.group_id)
            .bind(enum_to_text(&project.visibility)?)
            .bind(project.shared_runners_enabled)
            .bind(&project.protected_branches)
            .bind(&project.ci_config)
            .bind(project.keep_latest_artifact)
            .bind(runners_token)
            .bind(Utc::now())
            .fetch_one(&self.pool)
            .await
            .map_err(|err| {
                conflict_on_unique(err, &format!("project '{}' already exists", project.path))
            })?;

        row.try_into()
    }

    async fn find_project(&self, id: i64) -> StoreResult<Option<Project>> {
        let sql = format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE id = $1");
        let row = sqlx::query_as::<_, ProjectRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Project::try_from).transpose()
    }

    async fn find_project_by_path(&self, path: &str) -> StoreResult<Option<Project>> {
        let sql = format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE path = $1");
        let row = sqlx::query_as::<_, ProjectRow>(&sql)
            .bind(path)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Project::try_from).transpose()
    }

    async fn find_project_by_runners_token(&self, token: &str) -> StoreResult<Option<Project>> {
        let sql = format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE runners_token = $1");
        let row = sqlx::query_as::<_, ProjectRow>(&sql)
            .bind(token)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Project::try_from).transpose()
    }

    async fn add_member(
        &self,
        project_id: i64,
        user_id: i64,
        role: MemberRole,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO project_members (project_id, user_id, role)
            VALUES ($1, $2, $3)
            ON CONFLICT (project_id, user_id) DO UPDATE SET role = EXCLUDED.role
            "#,
        )
        .bind(project_id)
        .bind(user_id)
        .bind(enum_to_text(&role)?)
        .execute(&self.pool)
        .await
        .map_err(|err| match &err {
            sqlx::Error::Database(db) if db.is_foreign_key_violation() => StoreError::NotFound {
                entity: "project member",
                id: user_id,
            },
            _ => StoreError::Database(err),
        })?;

        Ok(())
    }

    async fn member_role(&self, project_id: i64, user_id: i64) -> StoreResult<Option<MemberRole>> {
        let role: Option<String> = sqlx::query_scalar(
            "SELECT role FROM project_members WHERE project_id = $1 AND user_id = $2",
        )
        .bind(project_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        role.as_deref().map(text_to_enum).transpose()
    }

    async fn create_trigger(
        &self,
        project_id: i64,
        owner_id: i64,
        token: &str,
        description: Option<String>,
    ) -> StoreResult<Trigger> {
        let row = sqlx::query_as::<_, TriggerRow>(
            r#"
            INSERT INTO triggers (project_id, owner_id, token, description, created_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, project_id, owner_id, token, description, created_at
            "#,
        )
        .bind(project_id)
        .bind(owner_id)
        .bind(token)
        .bind(&description)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into())
    }

    async fn find_trigger_by_token(&self, token: &str) -> StoreResult<Option<Trigger>> {
        let row = sqlx::query_as::<_, TriggerRow>(
            r#"
            SELECT id, project_id, owner_id, token, description, created_at
            FROM triggers
            WHERE token = $1
            "#,
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.into()))
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct UserRow {
    id: i64,
    username: String,
    admin: bool,
    created_at: DateTime<Utc>,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        User {
            id: row.id,
            username: row.username,
            admin: row.admin,
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ProjectRow {
    id: i64,
    path: String,
    group_id: Option<i64>,
    visibility: String,
    shared_runners_enabled: bool,
    protected_branches: Vec<String>,
    ci_config: Option<String>,
    keep_latest_artifact: bool,
    runners_token: String,
    artifacts_size: i64,
    created_at: DateTime<Utc>,
}

impl TryFrom<ProjectRow> for Project {
    type Error = StoreError;

    fn try_from(row: ProjectRow) -> Result<Self, Self::Error> {
        Ok(Project {
            id: row.id,
            path: row.path,
            group_id: row.group_id,
            visibility: text_to_enum(&row.visibility)?,
            shared_runners_enabled: row.shared_runners_enabled,
            protected_branches: row.protected_branches,
            ci_config: row.ci_config,
            keep_latest_artifact: row.keep_latest_artifact,
            runners_token: row.runners_token,
            artifacts_size: row.artifacts_size,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TriggerRow {
    id: i64,
    project_id: i64,
    owner_id: i64,
    token: String,
    description: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<TriggerRow> for Trigger {
    fn from(row: TriggerRow) -> Self {
        Trigger {
            id: row.id,
            project_id: row.project_id,
            owner_id: row.owner_id,
            token: row.token,
            description: row.description,
            created_at: row.created_at,
        }
    }
}
