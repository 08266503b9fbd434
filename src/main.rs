use anyhow::{Context, Result};
use axum::Router;
use std::{fs, io::ErrorKind, path::Path, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod config;
mod db;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;

use handlers::AppState;
use services::{
    consistency::ConsistencyMonitor,
    deletion_service::DeletionService,
    ingestion_service::IngestionService,
    metadata_repository::SqliteFileRepository,
    notification_worker::NotificationWorker,
    object_store::LocalObjectStore,
    queue_client::SqliteQueue,
};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = config::AppConfig::from_env_and_args()?;

    tracing::info!("Starting file-ingest with config: {:?}", cfg);

    // --- Ensure storage directories exist ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }
    ensure_sqlite_parent(&cfg.database_url)?;
    ensure_sqlite_parent(&cfg.queue_database_url)?;

    // --- Initialize SQLite connections ---
    let metadata_db = db::connect(&cfg.database_url, cfg.connect_timeout, 5)
        .await
        .with_context(|| format!("connecting to {}", cfg.database_url))?;

    // --- Handle migration mode ---
    if migrate {
        run_migrations(&metadata_db).await?;
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }
    db::apply_schema(&metadata_db, db::METADATA_SCHEMA).await?;

    let queue_db = db::connect(&cfg.queue_database_url, cfg.connect_timeout, 5)
        .await
        .with_context(|| format!("connecting to {}", cfg.queue_database_url))?;

    // --- Clients ---
    let policy = cfg.transport_policy();
    let store = Arc::new(LocalObjectStore::new(
        cfg.storage_dir.clone(),
        &cfg.region,
        policy,
    )?);
    tracing::info!(region = store.region(), bucket = %cfg.bucket, "store.ready");
    let repository = Arc::new(SqliteFileRepository::new(metadata_db, cfg.read_timeout));
    let queue = Arc::new(
        SqliteQueue::connect(queue_db, &cfg.queue_name, cfg.queue_settings(), policy)
            .await
            .context("resolving the processing queue")?,
    );
    tracing::info!(queue_url = queue.queue_url(), "queue.ready");
    let monitor = Arc::new(ConsistencyMonitor::new());

    // --- Services ---
    let state = AppState {
        ingestion: IngestionService::new(
            store.clone(),
            repository.clone(),
            queue.clone(),
            monitor.clone(),
            cfg.bucket.clone(),
            cfg.validation_policy(),
        ),
        deletion: DeletionService::new(
            store.clone(),
            repository.clone(),
            monitor.clone(),
            cfg.bucket.clone(),
        ),
        repository: repository.clone(),
        store,
        queue: queue.clone(),
        monitor,
        bucket: cfg.bucket.clone(),
    };

    let worker = NotificationWorker::new(queue, repository, cfg.worker_poll_interval);
    tokio::spawn(worker.run());

    // --- Build router ---
    let app: Router = routes::routes::routes()
        .layer(routes::routes::upload_body_limit(cfg.max_filesize_kb))
        .with_state(state);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}

/// Create the directory holding a file-backed SQLite database.
fn ensure_sqlite_parent(url: &str) -> Result<()> {
    let path = url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    let path = path.split('?').next().unwrap_or(path);
    if path.is_empty() || path.starts_with(":memory:") {
        return Ok(());
    }

    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }
    Ok(())
}

/// Run SQLite migrations from the SQL file shipped next to the binary.
async fn run_migrations(db: &sqlx::SqlitePool) -> Result<()> {
    let path = "migrations/0001_init.sql";

    if !Path::new(path).exists() {
        anyhow::bail!("Migration file not found: {}", path);
    }

    let sql = fs::read_to_string(path)?;
    let applied = db::apply_schema(db, &sql).await?;
    tracing::info!("Ran {} migration statements", applied);

    Ok(())
}
