use anyhow::Result;
use axum::Router;
use sqlx::sqlite::SqlitePoolOptions;
use std::{fs, io::ErrorKind, path::Path, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use crate::services::{
    content_store::ContentStore,
    finalize::Finalizer,
    metadata::{MetadataStore, SqliteMetadataStore, run_migrations},
    post_process::{CommandPostProcessor, NoopPostProcessor, PostProcessor},
    registry::Registry,
    upload_service::UploadService,
};

mod config;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = config::AppConfig::from_env_and_args()?;

    tracing::info!("Starting chunk-store with config: {:?}", cfg);

    // --- Ensure storage directories exist ---
    for dir in [&cfg.store_dir, &cfg.tmp_dir] {
        if !Path::new(dir).exists() {
            fs::create_dir_all(dir)?;
            tracing::info!("Created directory at {}", dir);
        }
    }

    // --- Initialize SQLite connection ---
    let db_url = &cfg.database_url;
    let db_path = db_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("file:");
    tracing::debug!("Interpreted SQLite path => {}", db_path);

    // Create parent directory and the file itself if needed
    let db_path_obj = Path::new(db_path);
    if let Some(parent) = db_path_obj.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }
    match fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(db_path)
    {
        Ok(_) => tracing::debug!("Database file can be created/opened successfully."),
        Err(e) => tracing::warn!("Failed to open database file manually: {}", e),
    }

    let db = Arc::new(
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect(db_url)
            .await?,
    );

    // --- Handle migration mode ---
    if migrate {
        run_migrations(&db).await?;
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Wire up collaborators ---
    let metadata: Arc<dyn MetadataStore> = Arc::new(SqliteMetadataStore::new(db.clone()));
    let post_processor: Arc<dyn PostProcessor> = if cfg.post_process {
        Arc::new(CommandPostProcessor {
            mime_program: cfg.mime_program.clone(),
            thumbnail_program: cfg.thumbnail_program.clone(),
            thumbnail_dir: cfg.thumbnail_dir.clone().into(),
        })
    } else {
        Arc::new(NoopPostProcessor)
    };

    // --- Initialize core service ---
    let registry = Registry::new();
    let store = ContentStore::new(&cfg.store_dir);
    let finalizer = Arc::new(Finalizer::new(
        store.clone(),
        metadata.clone(),
        post_processor,
        cfg.post_process_timeout,
        registry.clone(),
    ));
    let uploads = UploadService::new(
        registry,
        store,
        metadata,
        finalizer,
        &cfg.tmp_dir,
        cfg.upload_timeout,
        cfg.long_poll_timeout,
    );

    // --- Build router ---
    let app: Router = routes::routes::routes(cfg.max_chunk_bytes).with_state(uploads);

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
