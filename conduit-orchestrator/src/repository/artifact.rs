//! Artifact Repository
//!
//! Job artifacts, pipeline artifacts and the deleted-object staging table
//! the removal sweep drains.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conduit_core::domain::artifact::{
    ArtifactLock, ArtifactType, DeletedObject, JobArtifact, NewJobArtifact, NewPipelineArtifact,
    PipelineArtifact,
};

use crate::error::{StoreError, StoreResult};
use crate::repository::{ArtifactStore, PgStore, conflict_on_unique, enum_to_text, text_to_enum};

const JOB_ARTIFACT_COLUMNS: &str = r#"
    id, job_id, pipeline_id, project_id, file_type, file_path, size, locked, expire_at, created_at
"#;

const PIPELINE_ARTIFACT_COLUMNS: &str = r#"
    id, pipeline_id, project_id, file_type, file_path, size, locked, expire_at, created_at
"#;

#[async_trait]
impl ArtifactStore for PgStore {
    async fn create_job_artifact(&self, artifact: NewJobArtifact) -> StoreResult<JobArtifact> {
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            r#"
            INSERT INTO job_artifacts (
                job_id, pipeline_id, project_id, file_type, file_path, size, locked, expire_at,
                created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING {JOB_ARTIFACT_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, JobArtifactRow>(&sql)
            .bind(artifact.job_id)
            .bind(artifact.pipeline_id)
            .bind(artifact.project_id)
            .bind(enum_to_text(&artifact.file_type)?)
            .bind(&artifact.file_path)
            .bind(artifact.size)
            .bind(enum_to_text(&artifact.locked)?)
            .bind(artifact.expire_at)
            .bind(Utc::now())
            .fetch_one(&mut *tx)
            .await
            .map_err(|err| conflict_on_unique(err, "artifact of this type already exists"))?;

        sqlx::query("UPDATE projects SET artifacts_size = artifacts_size + $1 WHERE id = $2")
            .bind(artifact.size)
            .bind(artifact.project_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        row.try_into()
    }

    async fn job_artifacts(&self, job_id: i64) -> StoreResult<Vec<JobArtifact>> {
        let sql = format!("SELECT {JOB_ARTIFACT_COLUMNS} FROM job_artifacts WHERE job_id = $1 ORDER BY id");
        let rows = sqlx::query_as::<_, JobArtifactRow>(&sql)
            .bind(job_id)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(JobArtifact::try_from).collect()
    }

    async fn pipeline_job_artifacts(&self, pipeline_id: i64) -> StoreResult<Vec<JobArtifact>> {
        let sql = format!(
            "SELECT {JOB_ARTIFACT_COLUMNS} FROM job_artifacts WHERE pipeline_id = $1 ORDER BY id"
        );
        let rows = sqlx::query_as::<_, JobArtifactRow>(&sql)
            .bind(pipeline_id)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(JobArtifact::try_from).collect()
    }

    async fn resolve_unknown_artifact_locks(&self, limit: usize) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE job_artifacts a
            SET locked = p.locked
            FROM pipelines p
            WHERE p.id = a.pipeline_id
              AND a.id IN (
                  SELECT id FROM job_artifacts
                  WHERE locked = $1
                  ORDER BY id
                  LIMIT $2
                  FOR UPDATE SKIP LOCKED
              )
            "#,
        )
        .bind(enum_to_text(&ArtifactLock::Unknown)?)
        .bind(limit as i64)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn expired_job_artifacts(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<JobArtifact>> {
        let sql = format!(
            r#"
            SELECT {JOB_ARTIFACT_COLUMNS} FROM job_artifacts
            WHERE locked = $1 AND file_type <> $2 AND expire_at IS NOT NULL AND expire_at < $3
            ORDER BY expire_at
            LIMIT $4
            "#
        );
        let rows = sqlx::query_as::<_, JobArtifactRow>(&sql)
            .bind(enum_to_text(&ArtifactLock::Unlocked)?)
            .bind(enum_to_text(&ArtifactType::Trace)?)
            .bind(now)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(JobArtifact::try_from).collect()
    }

    async fn destroy_job_artifacts(
        &self,
        artifacts: &[JobArtifact],
        pick_up_at: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let mut destroyed = 0;

        for artifact in artifacts {
            let deleted = sqlx::query("DELETE FROM job_artifacts WHERE id = $1")
                .bind(artifact.id)
                .execute(&mut *tx)
                .await?;
            if deleted.rows_affected() == 0 {
                continue;
            }

            sqlx::query(
                r#"
                INSERT INTO deleted_objects (file_path, pick_up_at, created_at)
                VALUES ($1, $2, $3)
                "#,
            )
            .bind(&artifact.file_path)
            .bind(pick_up_at)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "UPDATE projects SET artifacts_size = GREATEST(artifacts_size - $1, 0) WHERE id = $2",
            )
            .bind(artifact.size)
            .bind(artifact.project_id)
            .execute(&mut *tx)
            .await?;

            destroyed += 1;
        }

        tx.commit().await?;
        Ok(destroyed)
    }

    async fn unlock_job_artifacts(&self, pipeline_id: i64, limit: usize) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE job_artifacts
            SET locked = $1
            WHERE id IN (
                SELECT id FROM job_artifacts
                WHERE pipeline_id = $2 AND locked <> $1
                ORDER BY id
                LIMIT $3
            )
            "#,
        )
        .bind(enum_to_text(&ArtifactLock::Unlocked)?)
        .bind(pipeline_id)
        .bind(limit as i64)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn create_pipeline_artifact(
        &self,
        artifact: NewPipelineArtifact,
    ) -> StoreResult<PipelineArtifact> {
        let sql = format!(
            r#"
            INSERT INTO pipeline_artifacts (
                pipeline_id, project_id, file_type, file_path, size, locked, expire_at, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {PIPELINE_ARTIFACT_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, PipelineArtifactRow>(&sql)
            .bind(artifact.pipeline_id)
            .bind(artifact.project_id)
            .bind(enum_to_text(&artifact.file_type)?)
            .bind(&artifact.file_path)
            .bind(artifact.size)
            .bind(enum_to_text(&artifact.locked)?)
            .bind(artifact.expire_at)
            .bind(Utc::now())
            .fetch_one(&self.pool)
            .await
            .map_err(|err| {
                conflict_on_unique(err, "pipeline artifact of this type already exists")
            })?;

        row.try_into()
    }

    async fn pipeline_artifacts(&self, pipeline_id: i64) -> StoreResult<Vec<PipelineArtifact>> {
        let sql = format!(
            "SELECT {PIPELINE_ARTIFACT_COLUMNS} FROM pipeline_artifacts WHERE pipeline_id = $1 ORDER BY id"
        );
        let rows = sqlx::query_as::<_, PipelineArtifactRow>(&sql)
            .bind(pipeline_id)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(PipelineArtifact::try_from).collect()
    }

    async fn unlock_pipeline_artifacts(&self, pipeline_id: i64) -> StoreResult<u64> {
        let result = sqlx::query(
            "UPDATE pipeline_artifacts SET locked = $1 WHERE pipeline_id = $2 AND locked <> $1",
        )
        .bind(enum_to_text(&ArtifactLock::Unlocked)?)
        .bind(pipeline_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn claim_deleted_objects(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        retry_at: DateTime<Utc>,
    ) -> StoreResult<Vec<DeletedObject>> {
        let rows = sqlx::query_as::<_, DeletedObjectRow>(
            r#"
            UPDATE deleted_objects
            SET pick_up_at = $1
            WHERE id IN (
                SELECT id FROM deleted_objects
                WHERE pick_up_at <= $2
                ORDER BY pick_up_at
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, file_path, pick_up_at, created_at
            "#,
        )
        .bind(retry_at)
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }

    async fn remove_deleted_objects(&self, ids: &[i64]) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM deleted_objects WHERE id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct JobArtifactRow {
    id: i64,
    job_id: i64,
    pipeline_id: i64,
    project_id: i64,
    file_type: String,
    file_path: String,
    size: i64,
    locked: String,
    expire_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<JobArtifactRow> for JobArtifact {
    type Error = StoreError;

    fn try_from(row: JobArtifactRow) -> Result<Self, Self::Error> {
        Ok(JobArtifact {
            id: row.id,
            job_id: row.job_id,
            pipeline_id: row.pipeline_id,
            project_id: row.project_id,
            file_type: text_to_enum(&row.file_type)?,
            file_path: row.file_path,
            size: row.size,
            locked: text_to_enum(&row.locked)?,
            expire_at: row.expire_at,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct PipelineArtifactRow {
    id: i64,
    pipeline_id: i64,
    project_id: i64,
    file_type: String,
    file_path: String,
    size: i64,
    locked: String,
    expire_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<PipelineArtifactRow> for PipelineArtifact {
    type Error = StoreError;

    fn try_from(row: PipelineArtifactRow) -> Result<Self, Self::Error> {
        Ok(PipelineArtifact {
            id: row.id,
            pipeline_id: row.pipeline_id,
            project_id: row.project_id,
            file_type: text_to_enum(&row.file_type)?,
            file_path: row.file_path,
            size: row.size,
            locked: text_to_enum(&row.locked)?,
            expire_at: row.expire_at,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct DeletedObjectRow {
    id: i64,
    file_path: String,
    pick_up_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl From<DeletedObjectRow> for DeletedObject {
    fn from(row: DeletedObjectRow) -> Self {
        DeletedObject {
            id: row.id,
            file_path: row.file_path,
            pick_up_at: row.pick_up_at,
            created_at: row.created_at,
        }
    }
}
