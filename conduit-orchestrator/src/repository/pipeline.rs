//! Pipeline Repository
//!
//! Pipelines and their stages. Pipeline creation inserts the stages and jobs
//! in the same transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conduit_core::Status;
use conduit_core::domain::job::NewJob;
use conduit_core::domain::pipeline::{
    LockState, NewPipeline, NewStage, Pipeline, Stage, UpstreamLink,
};

use crate::error::{StoreError, StoreResult};
use crate::repository::job::insert_job;
use crate::repository::{PgStore, PipelineStore, enum_to_text, status_from_text, text_to_enum};

const PIPELINE_COLUMNS: &str = r#"
    id, iid, project_id, ref_name, sha, tag, source, status, locked, user_id, variables,
    upstream_pipeline_id, upstream_job_id, upstream_project_id,
    created_at, updated_at, started_at, finished_at, lock_version
"#;

#[async_trait]
impl PipelineStore for PgStore {
    async fn create_pipeline(
        &self,
        pipeline: NewPipeline,
        stages: Vec<NewStage>,
        jobs: Vec<NewJob>,
    ) -> StoreResult<Pipeline> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        // Serialises iid assignment per project
        sqlx::query("SELECT id FROM projects WHERE id = $1 FOR UPDATE")
            .bind(pipeline.project_id)
            .execute(&mut *tx)
            .await?;

        let iid: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(iid), 0) + 1 FROM pipelines WHERE project_id = $1",
        )
        .bind(pipeline.project_id)
        .fetch_one(&mut *tx)
        .await?;

        let upstream = pipeline.upstream;
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO pipelines (
                iid, project_id, ref_name, sha, tag, source, status, locked, user_id, variables,
                upstream_pipeline_id, upstream_job_id, upstream_project_id,
                created_at, updated_at, lock_version
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $14, 0)
            RETURNING id
            "#,
        )
        .bind(iid)
        .bind(pipeline.project_id)
        .bind(&pipeline.ref_name)
        .bind(&pipeline.sha)
        .bind(pipeline.tag)
        .bind(enum_to_text(&pipeline.source)?)
        .bind(Status::Created.as_str())
        .bind(enum_to_text(&pipeline.locked)?)
        .bind(pipeline.user_id)
        .bind(serde_json::to_value(&pipeline.variables)?)
        .bind(upstream.map(|u| u.pipeline_id))
        .bind(upstream.map(|u| u.job_id))
        .bind(upstream.map(|u| u.project_id))
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        for stage in &stages {
            sqlx::query(
                r#"
                INSERT INTO stages (pipeline_id, name, position, status)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(id)
            .bind(&stage.name)
            .bind(stage.position)
            .bind(Status::Created.as_str())
            .execute(&mut *tx)
            .await?;
        }

        let project_id = pipeline.project_id;
        for job in jobs {
            insert_job(&mut tx, id, project_id, &job, now).await?;
        }

        tx.commit().await?;

        Ok(pipeline.into_pipeline(id, iid, now))
    }

    async fn find_pipeline(&self, id: i64) -> StoreResult<Option<Pipeline>> {
        let sql = format!("SELECT {PIPELINE_COLUMNS} FROM pipelines WHERE id = $1");
        let row = sqlx::query_as::<_, PipelineRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Pipeline::try_from).transpose()
    }

    async fn list_pipelines(&self, project_id: i64, limit: usize) -> StoreResult<Vec<Pipeline>> {
        let sql = format!(
            "SELECT {PIPELINE_COLUMNS} FROM pipelines WHERE project_id = $1 ORDER BY id DESC LIMIT $2"
        );
        let rows = sqlx::query_as::<_, PipelineRow>(&sql)
            .bind(project_id)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Pipeline::try_from).collect()
    }

    async fn update_pipeline(&self, pipeline: &Pipeline) -> StoreResult<Pipeline> {
        let sql = format!(
            r#"
            UPDATE pipelines
            SET status = $1, locked = $2, updated_at = $3, started_at = $4, finished_at = $5,
                lock_version = lock_version + 1
            WHERE id = $6 AND lock_version = $7
            RETURNING {PIPELINE_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, PipelineRow>(&sql)
            .bind(pipeline.status.as_str())
            .bind(enum_to_text(&pipeline.locked)?)
            .bind(pipeline.updated_at)
            .bind(pipeline.started_at)
            .bind(pipeline.finished_at)
            .bind(pipeline.id)
            .bind(pipeline.lock_version)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => row.try_into(),
            None => Err(self.missing_or_stale("pipeline", "pipelines", pipeline.id).await),
        }
    }

    async fn stages(&self, pipeline_id: i64) -> StoreResult<Vec<Stage>> {
        let rows = sqlx::query_as::<_, StageRow>(
            r#"
            SELECT id, pipeline_id, name, position, status
            FROM stages
            WHERE pipeline_id = $1
            ORDER BY position ASC
            "#,
        )
        .bind(pipeline_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Stage::try_from).collect()
    }

    async fn update_stage_status(&self, stage_id: i64, status: Status) -> StoreResult<()> {
        let result = sqlx::query("UPDATE stages SET status = $1 WHERE id = $2")
            .bind(status.as_str())
            .bind(stage_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "stage",
                id: stage_id,
            });
        }
        Ok(())
    }

    async fn downstream_pipelines(&self, pipeline_id: i64) -> StoreResult<Vec<Pipeline>> {
        let sql = format!(
            "SELECT {PIPELINE_COLUMNS} FROM pipelines WHERE upstream_pipeline_id = $1 ORDER BY id"
        );
        let rows = sqlx::query_as::<_, PipelineRow>(&sql)
            .bind(pipeline_id)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Pipeline::try_from).collect()
    }

    async fn pipeline_for_bridge(&self, bridge_id: i64) -> StoreResult<Option<Pipeline>> {
        let sql = format!("SELECT {PIPELINE_COLUMNS} FROM pipelines WHERE upstream_job_id = $1");
        let row = sqlx::query_as::<_, PipelineRow>(&sql)
            .bind(bridge_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Pipeline::try_from).transpose()
    }

    async fn locked_pipelines_before(
        &self,
        project_id: i64,
        ref_name: &str,
        before_iid: i64,
    ) -> StoreResult<Vec<Pipeline>> {
        let sql = format!(
            r#"
            SELECT {PIPELINE_COLUMNS} FROM pipelines
            WHERE project_id = $1 AND ref_name = $2 AND iid < $3 AND locked = $4
            ORDER BY iid
            "#
        );
        let rows = sqlx::query_as::<_, PipelineRow>(&sql)
            .bind(project_id)
            .bind(ref_name)
            .bind(before_iid)
            .bind(enum_to_text(&LockState::ArtifactsLocked)?)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Pipeline::try_from).collect()
    }

    async fn unlock_pipeline(&self, id: i64) -> StoreResult<()> {
        sqlx::query(
            "UPDATE pipelines SET locked = $1, lock_version = lock_version + 1 WHERE id = $2 AND locked <> $1",
        )
        .bind(enum_to_text(&LockState::Unlocked)?)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

impl PgStore {
    /// Tell a missing row from a compare-and-set loss after a failed update
    pub(crate) async fn missing_or_stale(&self, entity: &'static str, table: &str, id: i64) -> StoreError {
        let sql = format!("SELECT EXISTS (SELECT 1 FROM {table} WHERE id = $1)");
        match sqlx::query_scalar::<_, bool>(&sql)
            .bind(id)
            .fetch_one(&self.pool)
            .await
        {
            Ok(true) => StoreError::StaleObject { entity, id },
            Ok(false) => StoreError::NotFound { entity, id },
            Err(err) => StoreError::Database(err),
        }
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct PipelineRow {
    id: i64,
    iid: i64,
    project_id: i64,
    ref_name: String,
    sha: String,
    tag: bool,
    source: String,
    status: String,
    locked: String,
    user_id: Option<i64>,
    variables: serde_json::Value,
    upstream_pipeline_id: Option<i64>,
    upstream_job_id: Option<i64>,
    upstream_project_id: Option<i64>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    lock_version: i32,
}

impl TryFrom<PipelineRow> for Pipeline {
    type Error = StoreError;

    fn try_from(row: PipelineRow) -> Result<Self, Self::Error> {
        let upstream = match (
            row.upstream_pipeline_id,
            row.upstream_job_id,
            row.upstream_project_id,
        ) {
            (Some(pipeline_id), Some(job_id), Some(project_id)) => Some(UpstreamLink {
                pipeline_id,
                job_id,
                project_id,
            }),
            _ => None,
        };

        Ok(Pipeline {
            id: row.id,
            iid: row.iid,
            project_id: row.project_id,
            ref_name: row.ref_name,
            sha: row.sha,
            tag: row.tag,
            source: text_to_enum(&row.source)?,
            status: status_from_text(&row.status)?,
            locked: text_to_enum(&row.locked)?,
            user_id: row.user_id,
            variables: serde_json::from_value(row.variables)?,
            upstream,
            created_at: row.created_at,
            updated_at: row.updated_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
            lock_version: row.lock_version,
        })
    }
}

#[derive(sqlx::FromRow)]
struct StageRow {
    id: i64,
    pipeline_id: i64,
    name: String,
    position: i32,
    status: String,
}

impl TryFrom<StageRow> for Stage {
    type Error = StoreError;

    fn try_from(row: StageRow) -> Result<Self, Self::Error> {
        Ok(Stage {
            id: row.id,
            pipeline_id: row.pipeline_id,
            name: row.name,
            position: row.position,
            status: status_from_text(&row.status)?,
        })
    }
}
