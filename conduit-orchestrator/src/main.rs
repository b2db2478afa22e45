use anyhow::Context;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use conduit_orchestrator::config::{Config, StoreKind};
use conduit_orchestrator::repository::{InMemoryStore, PgStore, Store};
use conduit_orchestrator::service::ServiceContext;
use conduit_orchestrator::storage::LocalObjectStore;
use conduit_orchestrator::worker::{self, ChannelQueue};
use conduit_orchestrator::{api, db};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "conduit_orchestrator=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Conduit Orchestrator...");

    let config = Config::from_env()?;
    config.validate()?;

    let store: Arc<dyn Store> = match config.store {
        StoreKind::Postgres => {
            tracing::info!("Connecting to database...");
            let pool = db::create_pool(&config.database_url)
                .await
                .context("Failed to create database pool")?;
            db::run_migrations(&pool)
                .await
                .context("Failed to run database migrations")?;
            tracing::info!("Database ready");
            Arc::new(PgStore::new(pool))
        }
        StoreKind::Memory => {
            tracing::warn!("Using the in-memory store, nothing survives a restart");
            Arc::new(InMemoryStore::new())
        }
    };

    tokio::fs::create_dir_all(&config.artifacts_dir)
        .await
        .with_context(|| format!("Failed to create {}", config.artifacts_dir.display()))?;
    let objects = Arc::new(LocalObjectStore::new(&config.artifacts_dir));

    let (queue, receiver) = ChannelQueue::new();
    let concurrency = config.worker_concurrency;
    let addr = config.bind_addr.clone();
    let ctx = ServiceContext::new(store, Arc::new(queue), objects, config);

    tokio::spawn(worker::run_worker(ctx.clone(), receiver, concurrency));
    worker::spawn_cron(ctx.clone());

    // Build router with all API endpoints
    let app = api::create_router(ctx);

    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    axum::serve(listener, app)
        .await
        .context("Failed to start server")?;

    Ok(())
}
