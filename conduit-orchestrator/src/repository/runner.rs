//! Runner Repository
//!
//! Handles all database operations related to runners.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conduit_core::domain::runner::{NewRunner, Runner, RunnerStatus};

use crate::error::{StoreError, StoreResult};
use crate::repository::{PgStore, RunnerStore, enum_to_text, text_to_enum};

const RUNNER_COLUMNS: &str = r#"
    id, token, description, runner_type, group_id, project_ids, tags, run_untagged,
    access_level, active, status, contacted_at, created_at
"#;

#[async_trait]
impl RunnerStore for PgStore {
    async fn create_runner(&self, runner: NewRunner, token: &str) -> StoreResult<Runner> {
        let sql = format!(
            r#"
            INSERT INTO runners (
                token, description, runner_type, group_id, project_ids, tags, run_untagged,
                access_level, active, status, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, TRUE, $9, $10)
            RETURNING {RUNNER_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, RunnerRow>(&sql)
            .bind(token)
            .bind(&runner.description)
            .bind(enum_to_text(&runner.runner_type)?)
            .bind(runner.group_id)
            .bind(&runner.project_ids)
            .bind(&runner.tags)
            .bind(runner.run_untagged)
            .bind(enum_to_text(&runner.access_level)?)
            .bind(status_to_string(RunnerStatus::Offline))
            .bind(Utc::now())
            .fetch_one(&self.pool)
            .await?;

        row.try_into()
    }

    async fn find_runner(&self, id: i64) -> StoreResult<Option<Runner>> {
        let sql = format!("SELECT {RUNNER_COLUMNS} FROM runners WHERE id = $1");
        let row = sqlx::query_as::<_, RunnerRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Runner::try_from).transpose()
    }

    async fn find_runner_by_token(&self, token: &str) -> StoreResult<Option<Runner>> {
        let sql = format!("SELECT {RUNNER_COLUMNS} FROM runners WHERE token = $1");
        let row = sqlx::query_as::<_, RunnerRow>(&sql)
            .bind(token)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Runner::try_from).transpose()
    }

    async fn list_runners(&self) -> StoreResult<Vec<Runner>> {
        let sql = format!("SELECT {RUNNER_COLUMNS} FROM runners ORDER BY id");
        let rows = sqlx::query_as::<_, RunnerRow>(&sql)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Runner::try_from).collect()
    }

    async fn delete_runner(&self, id: i64) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM runners WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn touch_runner(&self, id: i64, at: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE runners
            SET contacted_at = $1, status = $2
            WHERE id = $3
            "#,
        )
        .bind(at)
        .bind(status_to_string(RunnerStatus::Online))
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn mark_stale_runners(&self, contacted_before: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE runners
            SET status = $1
            WHERE status = $2 AND (contacted_at IS NULL OR contacted_at < $3)
            "#,
        )
        .bind(status_to_string(RunnerStatus::Offline))
        .bind(status_to_string(RunnerStatus::Online))
        .bind(contacted_before)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

fn status_to_string(status: RunnerStatus) -> &'static str {
    match status {
        RunnerStatus::Online => "Online",
        RunnerStatus::Offline => "Offline",
    }
}

fn string_to_status(s: &str) -> RunnerStatus {
    match s {
        "Online" => RunnerStatus::Online,
        _ => RunnerStatus::Offline,
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct RunnerRow {
    id: i64,
    token: String,
    description: Option<String>,
    runner_type: String,
    group_id: Option<i64>,
    project_ids: Vec<i64>,
    tags: Vec<String>,
    run_untagged: bool,
    access_level: String,
    active: bool,
    status: String,
    contacted_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<RunnerRow> for Runner {
    type Error = StoreError;

    fn try_from(row: RunnerRow) -> Result<Self, Self::Error> {
        Ok(Runner {
            id: row.id,
            token: row.token,
            description: row.description,
            runner_type: text_to_enum(&row.runner_type)?,
            group_id: row.group_id,
            project_ids: row.project_ids,
            tags: row.tags,
            run_untagged: row.run_untagged,
            access_level: text_to_enum(&row.access_level)?,
            active: row.active,
            status: string_to_status(&row.status),
            contacted_at: row.contacted_at,
            created_at: row.created_at,
        })
    }
}
