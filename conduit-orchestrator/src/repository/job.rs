//! Job Repository
//!
//! Handles all database operations related to jobs, builds and bridges alike.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conduit_core::Status;
use conduit_core::domain::job::{Job, JobKind, NewJob};
use conduit_core::domain::runner::{Runner, RunnerAccessLevel, RunnerType};
use sqlx::{Postgres, Transaction};
use std::collections::HashMap;

use crate::error::{StoreError, StoreResult};
use crate::repository::{
    JobStore, PgStore, RunnerScope, enum_to_text, status_from_text, text_to_enum,
};

const JOB_COLUMNS: &str = r#"
    id, pipeline_id, project_id, name, stage, stage_idx, kind, status, when_policy,
    scheduling_type, needs, tags, protected, allow_failure, environment, ref_name, tag, sha,
    options, variables, user_id, runner_id, token, retried, failure_reason, exit_code,
    created_at, updated_at, queued_at, started_at, finished_at, scheduled_at, lock_version
"#;

#[async_trait]
impl JobStore for PgStore {
    async fn find_job(&self, id: i64) -> StoreResult<Option<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1");
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Job::try_from).transpose()
    }

    async fn find_job_by_token(&self, token: &str) -> StoreResult<Option<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE token = $1");
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(token)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Job::try_from).transpose()
    }

    async fn pipeline_jobs(&self, pipeline_id: i64) -> StoreResult<Vec<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE pipeline_id = $1 ORDER BY id");
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(pipeline_id)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Job::try_from).collect()
    }

    async fn update_job(&self, job: &Job) -> StoreResult<Job> {
        let sql = format!(
            r#"
            UPDATE jobs
            SET status = $1, runner_id = $2, token = $3, retried = $4, failure_reason = $5,
                exit_code = $6, updated_at = $7, queued_at = $8, started_at = $9,
                finished_at = $10, scheduled_at = $11, allow_failure = $12, user_id = $13,
                lock_version = lock_version + 1
            WHERE id = $14 AND lock_version = $15
            RETURNING {JOB_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(job.status.as_str())
            .bind(job.runner_id)
            .bind(&job.token)
            .bind(job.retried)
            .bind(job.failure_reason.map(|r| r.as_str()))
            .bind(job.exit_code)
            .bind(job.updated_at)
            .bind(job.queued_at)
            .bind(job.started_at)
            .bind(job.finished_at)
            .bind(job.scheduled_at)
            .bind(job.allow_failure)
            .bind(job.user_id)
            .bind(job.id)
            .bind(job.lock_version)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => row.try_into(),
            None => Err(self.missing_or_stale("job", "jobs", job.id).await),
        }
    }

    async fn retry_job(&self, original: &Job, clone: NewJob) -> StoreResult<Job> {
        let mut tx = self.pool.begin().await?;

        let marked = sqlx::query(
            r#"
            UPDATE jobs
            SET retried = TRUE, lock_version = lock_version + 1
            WHERE id = $1 AND lock_version = $2 AND retried = FALSE
            "#,
        )
        .bind(original.id)
        .bind(original.lock_version)
        .execute(&mut *tx)
        .await?;

        if marked.rows_affected() == 0 {
            return Err(StoreError::StaleObject {
                entity: "job",
                id: original.id,
            });
        }

        let now = Utc::now();
        let id = insert_job(
            &mut tx,
            original.pipeline_id,
            original.project_id,
            &clone,
            now,
        )
        .await?;

        tx.commit().await?;

        Ok(clone.into_job(id, original.pipeline_id, original.project_id, now))
    }

    async fn pending_builds(
        &self,
        runner: &Runner,
        scope: &RunnerScope,
        limit: usize,
    ) -> StoreResult<Vec<Job>> {
        let scope_filter = match scope {
            RunnerScope::Instance => "p.shared_runners_enabled = TRUE",
            RunnerScope::Group(_) => "p.group_id = $7",
            RunnerScope::Projects(_) => "p.id = ANY($7)",
        };
        let sql = format!(
            r#"
            SELECT {columns} FROM jobs j
            JOIN projects p ON p.id = j.project_id
            WHERE j.status = $1 AND j.kind = $2 AND j.runner_id IS NULL AND {scope_filter}
              AND ((cardinality(j.tags) = 0 AND $4) OR (cardinality(j.tags) > 0 AND j.tags <@ $5))
              AND (j.protected OR NOT $6)
            ORDER BY j.id
            LIMIT $3
            "#,
            columns = prefixed_columns("j"),
        );

        let query = sqlx::query_as::<_, JobRow>(&sql)
            .bind(Status::Pending.as_str())
            .bind(enum_to_text(&JobKind::Build)?)
            .bind(limit as i64)
            .bind(runner.run_untagged)
            .bind(runner.tags.clone())
            .bind(runner.access_level == RunnerAccessLevel::RefProtected);
        let query = match scope {
            RunnerScope::Instance => query,
            RunnerScope::Group(group_id) => query.bind(*group_id),
            RunnerScope::Projects(ids) => query.bind(ids.clone()),
        };
        let rows = query.fetch_all(&self.pool).await?;

        rows.into_iter().map(Job::try_from).collect()
    }

    async fn running_shared_builds(&self) -> StoreResult<HashMap<i64, i64>> {
        let rows: Vec<(i64, i64)> = sqlx::query_as(
            r#"
            SELECT j.project_id, COUNT(*) FROM jobs j
            JOIN runners r ON r.id = j.runner_id
            WHERE j.status = $1 AND r.runner_type = $2
            GROUP BY j.project_id
            "#,
        )
        .bind(Status::Running.as_str())
        .bind(enum_to_text(&RunnerType::Instance)?)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().collect())
    }

    async fn jobs_for_sweep(
        &self,
        status: Status,
        kind: Option<JobKind>,
        before: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<Job>> {
        let timestamp = match status {
            Status::Pending => "queued_at",
            Status::Scheduled => "scheduled_at",
            _ => "updated_at",
        };
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE status = $1 AND {timestamp} < $2 AND ($4::VARCHAR IS NULL OR kind = $4) \
             ORDER BY id LIMIT $3"
        );
        let kind = kind.as_ref().map(enum_to_text).transpose()?;
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(status.as_str())
            .bind(before)
            .bind(limit as i64)
            .bind(kind)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Job::try_from).collect()
    }
}

/// Insert a new job inside an open transaction, returning its id
pub(crate) async fn insert_job(
    tx: &mut Transaction<'_, Postgres>,
    pipeline_id: i64,
    project_id: i64,
    job: &NewJob,
    now: DateTime<Utc>,
) -> StoreResult<i64> {
    let id = sqlx::query_scalar(
        r#"
        INSERT INTO jobs (
            pipeline_id, project_id, name, stage, stage_idx, kind, status, when_policy,
            scheduling_type, needs, tags, protected, allow_failure, environment, ref_name, tag,
            sha, options, variables, user_id, retried, created_at, updated_at, lock_version
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
                $18, $19, $20, FALSE, $21, $21, 0)
        RETURNING id
        "#,
    )
    .bind(pipeline_id)
    .bind(project_id)
    .bind(&job.name)
    .bind(&job.stage)
    .bind(job.stage_idx)
    .bind(enum_to_text(&job.kind)?)
    .bind(Status::Created.as_str())
    .bind(enum_to_text(&job.when)?)
    .bind(enum_to_text(&job.scheduling_type)?)
    .bind(&job.needs)
    .bind(&job.tags)
    .bind(job.protected)
    .bind(job.allow_failure)
    .bind(&job.environment)
    .bind(&job.ref_name)
    .bind(job.tag)
    .bind(&job.sha)
    .bind(serde_json::to_value(&job.options)?)
    .bind(serde_json::to_value(&job.variables)?)
    .bind(job.user_id)
    .bind(now)
    .fetch_one(&mut **tx)
    .await?;

    Ok(id)
}

// =============================================================================
// Helper Functions
// =============================================================================

fn prefixed_columns(alias: &str) -> String {
    JOB_COLUMNS
        .split(',')
        .map(|column| format!("{}.{}", alias, column.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct JobRow {
    id: i64,
    pipeline_id: i64,
    project_id: i64,
    name: String,
    stage: String,
    stage_idx: i32,
    kind: String,
    status: String,
    when_policy: String,
    scheduling_type: String,
    needs: Vec<String>,
    tags: Vec<String>,
    protected: bool,
    allow_failure: bool,
    environment: Option<String>,
    ref_name: String,
    tag: bool,
    sha: String,
    options: serde_json::Value,
    variables: serde_json::Value,
    user_id: Option<i64>,
    runner_id: Option<i64>,
    token: Option<String>,
    retried: bool,
    failure_reason: Option<String>,
    exit_code: Option<i32>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    queued_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    scheduled_at: Option<DateTime<Utc>>,
    lock_version: i32,
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Job {
            id: row.id,
            pipeline_id: row.pipeline_id,
            project_id: row.project_id,
            name: row.name,
            stage: row.stage,
            stage_idx: row.stage_idx,
            kind: text_to_enum(&row.kind)?,
            status: status_from_text(&row.status)?,
            when: text_to_enum(&row.when_policy)?,
            scheduling_type: text_to_enum(&row.scheduling_type)?,
            needs: row.needs,
            tags: row.tags,
            protected: row.protected,
            allow_failure: row.allow_failure,
            environment: row.environment,
            ref_name: row.ref_name,
            tag: row.tag,
            sha: row.sha,
            options: serde_json::from_value(row.options)?,
            variables: serde_json::from_value(row.variables)?,
            user_id: row.user_id,
            runner_id: row.runner_id,
            token: row.token,
            retried: row.retried,
            failure_reason: row.failure_reason.as_deref().map(text_to_enum).transpose()?,
            exit_code: row.exit_code,
            created_at: row.created_at,
            updated_at: row.updated_at,
            queued_at: row.queued_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
            scheduled_at: row.scheduled_at,
            lock_version: row.lock_version,
        })
    }
}
