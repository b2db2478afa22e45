use sqlx::{PgPool, postgres::PgPoolOptions};
use std::time::Duration;

pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    // Users, projects and access
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id BIGSERIAL PRIMARY KEY,
            username VARCHAR(255) NOT NULL UNIQUE,
            admin BOOLEAN NOT NULL DEFAULT FALSE,
            created_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS projects (
            id BIGSERIAL PRIMARY KEY,
            path VARCHAR(255) NOT NULL UNIQUE,
            group_id BIGINT,
            visibility VARCHAR(20) NOT NULL,
            shared_runners_enabled BOOLEAN NOT NULL DEFAULT TRUE,
            protected_branches TEXT[] NOT NULL DEFAULT '{}',
            ci_config TEXT,
            keep_latest_artifact BOOLEAN NOT NULL DEFAULT TRUE,
            runners_token VARCHAR(255) NOT NULL UNIQUE,
            artifacts_size BIGINT NOT NULL DEFAULT 0,
            created_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS project_members (
            project_id BIGINT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
            user_id BIGINT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            role VARCHAR(20) NOT NULL,
            PRIMARY KEY (project_id, user_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS triggers (
            id BIGSERIAL PRIMARY KEY,
            project_id BIGINT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
            owner_id BIGINT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            token VARCHAR(255) NOT NULL UNIQUE,
            description TEXT,
            created_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Pipelines, stages and jobs
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pipelines (
            id BIGSERIAL PRIMARY KEY,
            iid BIGINT NOT NULL,
            project_id BIGINT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
            ref_name VARCHAR(255) NOT NULL,
            sha VARCHAR(255) NOT NULL,
            tag BOOLEAN NOT NULL DEFAULT FALSE,
            source VARCHAR(50) NOT NULL,
            status VARCHAR(50) NOT NULL,
            locked VARCHAR(50) NOT NULL,
            user_id BIGINT,
            variables JSONB NOT NULL DEFAULT '{}',
            upstream_pipeline_id BIGINT,
            upstream_job_id BIGINT,
            upstream_project_id BIGINT,
            created_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL,
            started_at TIMESTAMPTZ,
            finished_at TIMESTAMPTZ,
            lock_version INTEGER NOT NULL DEFAULT 0,
            UNIQUE (project_id, iid)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS stages (
            id BIGSERIAL PRIMARY KEY,
            pipeline_id BIGINT NOT NULL REFERENCES pipelines(id) ON DELETE CASCADE,
            name VARCHAR(255) NOT NULL,
            position INTEGER NOT NULL,
            status VARCHAR(50) NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id BIGSERIAL PRIMARY KEY,
            pipeline_id BIGINT NOT NULL REFERENCES pipelines(id) ON DELETE CASCADE,
            project_id BIGINT NOT NULL,
            name VARCHAR(255) NOT NULL,
            stage VARCHAR(255) NOT NULL,
            stage_idx INTEGER NOT NULL,
            kind VARCHAR(20) NOT NULL,
            status VARCHAR(50) NOT NULL,
            when_policy VARCHAR(20) NOT NULL,
            scheduling_type VARCHAR(20) NOT NULL,
            needs TEXT[] NOT NULL DEFAULT '{}',
            tags TEXT[] NOT NULL DEFAULT '{}',
            protected BOOLEAN NOT NULL DEFAULT FALSE,
            allow_failure BOOLEAN NOT NULL DEFAULT FALSE,
            environment VARCHAR(255),
            ref_name VARCHAR(255) NOT NULL,
            tag BOOLEAN NOT NULL DEFAULT FALSE,
            sha VARCHAR(255) NOT NULL,
            options JSONB NOT NULL DEFAULT '{}',
            variables JSONB NOT NULL DEFAULT '{}',
            user_id BIGINT,
            runner_id BIGINT,
            token VARCHAR(255) UNIQUE,
            retried BOOLEAN NOT NULL DEFAULT FALSE,
            failure_reason VARCHAR(100),
            exit_code INTEGER,
            created_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL,
            queued_at TIMESTAMPTZ,
            started_at TIMESTAMPTZ,
            finished_at TIMESTAMPTZ,
            scheduled_at TIMESTAMPTZ,
            lock_version INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_pipeline_id ON jobs(pipeline_id)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status, id)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_pipelines_upstream ON pipelines(upstream_pipeline_id)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_pipelines_ref ON pipelines(project_id, ref_name, iid)",
    )
    .execute(pool)
    .await?;

    // Runners
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS runners (
            id BIGSERIAL PRIMARY KEY,
            token VARCHAR(255) NOT NULL UNIQUE,
            description TEXT,
            runner_type VARCHAR(20) NOT NULL,
            group_id BIGINT,
            project_ids BIGINT[] NOT NULL DEFAULT '{}',
            tags TEXT[] NOT NULL DEFAULT '{}',
            run_untagged BOOLEAN NOT NULL DEFAULT TRUE,
            access_level VARCHAR(20) NOT NULL,
            active BOOLEAN NOT NULL DEFAULT TRUE,
            status VARCHAR(20) NOT NULL,
            contacted_at TIMESTAMPTZ,
            created_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Traces
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS trace_chunks (
            job_id BIGINT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
            chunk_index INTEGER NOT NULL,
            data BYTEA NOT NULL,
            data_store VARCHAR(20) NOT NULL,
            PRIMARY KEY (job_id, chunk_index)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pending_states (
            job_id BIGINT PRIMARY KEY REFERENCES jobs(id) ON DELETE CASCADE,
            state VARCHAR(50) NOT NULL,
            failure_reason VARCHAR(100),
            exit_code INTEGER,
            checksum VARCHAR(255),
            created_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS trace_metadata (
            job_id BIGINT PRIMARY KEY REFERENCES jobs(id) ON DELETE CASCADE,
            checksum VARCHAR(255),
            remote_checksum VARCHAR(255),
            archived BOOLEAN NOT NULL DEFAULT FALSE
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Artifacts
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS job_artifacts (
            id BIGSERIAL PRIMARY KEY,
            job_id BIGINT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
            pipeline_id BIGINT NOT NULL,
            project_id BIGINT NOT NULL,
            file_type VARCHAR(50) NOT NULL,
            file_path TEXT NOT NULL,
            size BIGINT NOT NULL,
            locked VARCHAR(50) NOT NULL,
            expire_at TIMESTAMPTZ,
            created_at TIMESTAMPTZ NOT NULL,
            UNIQUE (job_id, file_type)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_job_artifacts_expire ON job_artifacts(locked, expire_at)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pipeline_artifacts (
            id BIGSERIAL PRIMARY KEY,
            pipeline_id BIGINT NOT NULL REFERENCES pipelines(id) ON DELETE CASCADE,
            project_id BIGINT NOT NULL,
            file_type VARCHAR(50) NOT NULL,
            file_path TEXT NOT NULL,
            size BIGINT NOT NULL,
            locked VARCHAR(50) NOT NULL,
            expire_at TIMESTAMPTZ,
            created_at TIMESTAMPTZ NOT NULL,
            UNIQUE (pipeline_id, file_type)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS deleted_objects (
            id BIGSERIAL PRIMARY KEY,
            file_path TEXT NOT NULL,
            pick_up_at TIMESTAMPTZ NOT NULL,
            created_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_deleted_objects_pick_up ON deleted_objects(pick_up_at)",
    )
    .execute(pool)
    .await?;

    // Exclusive leases
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS exclusive_leases (
            key VARCHAR(255) PRIMARY KEY,
            owner UUID NOT NULL,
            expires_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    tracing::info!("Database migrations completed successfully");
    Ok(())
}
