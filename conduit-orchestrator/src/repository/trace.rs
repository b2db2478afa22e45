//! Trace Repository
//!
//! Trace chunks, pending final states and trace integrity metadata.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conduit_core::domain::trace::{PendingState, TraceChunk, TraceMetadata};

use crate::error::{StoreError, StoreResult};
use crate::repository::{PgStore, TraceStore, enum_to_text, status_from_text, text_to_enum};

#[async_trait]
impl TraceStore for PgStore {
    async fn trace_chunks(&self, job_id: i64) -> StoreResult<Vec<TraceChunk>> {
        let rows = sqlx::query_as::<_, ChunkRow>(
            r#"
            SELECT job_id, chunk_index, data, data_store
            FROM trace_chunks
            WHERE job_id = $1
            ORDER BY chunk_index ASC
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TraceChunk::try_from).collect()
    }

    async fn save_trace_chunk(&self, chunk: &TraceChunk) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO trace_chunks (job_id, chunk_index, data, data_store)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (job_id, chunk_index) DO UPDATE SET
                data = EXCLUDED.data,
                data_store = EXCLUDED.data_store
            "#,
        )
        .bind(chunk.job_id)
        .bind(chunk.chunk_index)
        .bind(&chunk.data)
        .bind(enum_to_text(&chunk.data_store)?)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete_trace_chunks(&self, job_id: i64) -> StoreResult<()> {
        sqlx::query("DELETE FROM trace_chunks WHERE job_id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn create_pending_state(&self, state: &PendingState) -> StoreResult<PendingState> {
        sqlx::query(
            r#"
            INSERT INTO pending_states (job_id, state, failure_reason, exit_code, checksum, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (job_id) DO NOTHING
            "#,
        )
        .bind(state.job_id)
        .bind(state.state.as_str())
        .bind(state.failure_reason.map(|r| r.as_str()))
        .bind(state.exit_code)
        .bind(&state.checksum)
        .bind(state.created_at)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query_as::<_, PendingStateRow>(
            r#"
            SELECT job_id, state, failure_reason, exit_code, checksum, created_at
            FROM pending_states
            WHERE job_id = $1
            "#,
        )
        .bind(state.job_id)
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    async fn delete_pending_state(&self, job_id: i64) -> StoreResult<()> {
        sqlx::query("DELETE FROM pending_states WHERE job_id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn trace_metadata(&self, job_id: i64) -> StoreResult<Option<TraceMetadata>> {
        let row = sqlx::query_as::<_, MetadataRow>(
            r#"
            SELECT job_id, checksum, remote_checksum, archived
            FROM trace_metadata
            WHERE job_id = $1
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.into()))
    }

    async fn save_trace_metadata(&self, metadata: &TraceMetadata) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO trace_metadata (job_id, checksum, remote_checksum, archived)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (job_id) DO UPDATE SET
                checksum = EXCLUDED.checksum,
                remote_checksum = EXCLUDED.remote_checksum,
                archived = EXCLUDED.archived
            "#,
        )
        .bind(metadata.job_id)
        .bind(&metadata.checksum)
        .bind(&metadata.remote_checksum)
        .bind(metadata.archived)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct ChunkRow {
    job_id: i64,
    chunk_index: i32,
    data: Vec<u8>,
    data_store: String,
}

impl TryFrom<ChunkRow> for TraceChunk {
    type Error = StoreError;

    fn try_from(row: ChunkRow) -> Result<Self, Self::Error> {
        Ok(TraceChunk {
            job_id: row.job_id,
            chunk_index: row.chunk_index,
            data: row.data,
            data_store: text_to_enum(&row.data_store)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct PendingStateRow {
    job_id: i64,
    state: String,
    failure_reason: Option<String>,
    exit_code: Option<i32>,
    checksum: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<PendingStateRow> for PendingState {
    type Error = StoreError;

    fn try_from(row: PendingStateRow) -> Result<Self, Self::Error> {
        Ok(PendingState {
            job_id: row.job_id,
            state: status_from_text(&row.state)?,
            failure_reason: row.failure_reason.as_deref().map(text_to_enum).transpose()?,
            exit_code: row.exit_code,
            checksum: row.checksum,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct MetadataRow {
    job_id: i64,
    checksum: Option<String>,
    remote_checksum: Option<String>,
    archived: bool,
}

impl From<MetadataRow> for TraceMetadata {
    fn from(row: MetadataRow) -> Self {
        TraceMetadata {
            job_id: row.job_id,
            checksum: row.checksum,
            remote_checksum: row.remote_checksum,
            archived: row.archived,
        }
    }
}
