// Main entry point for the transcription API server and worker pool

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vidscribe::kernel::jobs::{
    spawn_workers, InMemoryJobStore, InMemoryWorkQueue, JobStore, PostgresJobStore, PostgresWorkQueue,
    StalledJobReaper, WorkQueue,
};
use vidscribe::kernel::{ServerDeps, StageExecutors};
use vidscribe::{server::build_app, Config};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,vidscribe=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting video transcription service");

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::info!("Configuration loaded");

    let settings = config.pipeline_settings();

    let (store, queue): (Arc<dyn JobStore>, Arc<dyn WorkQueue>) = match &config.database_url {
        Some(database_url) => {
            // Connect to database
            tracing::info!("Connecting to database...");
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(database_url)
                .await
                .context("Failed to connect to database")?;
            tracing::info!("Database connected");

            // Run migrations
            tracing::info!("Running database migrations...");
            sqlx::migrate!("./migrations")
                .run(&pool)
                .await
                .context("Failed to run migrations")?;
            tracing::info!("Migrations complete");

            (
                Arc::new(PostgresJobStore::new(pool.clone(), settings.retention)),
                Arc::new(PostgresWorkQueue::new(pool)),
            )
        }
        None => {
            tracing::warn!("DATABASE_URL not set, jobs are kept in memory and lost on restart");
            (
                Arc::new(InMemoryJobStore::new(settings.retention)),
                Arc::new(InMemoryWorkQueue::new()),
            )
        }
    };

    let deps = ServerDeps::new(store, queue, StageExecutors::from_config(&config), settings);
    let shutdown = CancellationToken::new();

    // Start workers and the stalled-job reaper
    let workers = spawn_workers(&deps, config.worker_concurrency, shutdown.clone());
    tracing::info!(count = workers.len(), "Workers started");

    let reaper = StalledJobReaper::new(deps.store.clone(), deps.queue.clone(), config.reaper_config());
    let reaper_handle = tokio::spawn(reaper.run(shutdown.clone()));

    // Build application
    let app = build_app(&deps, &config.cors_origins);

    // Start server
    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!("Starting server on {}", addr);
    tracing::info!("Health check: http://localhost:{}/health", config.port);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Shutdown signal received");
            server_shutdown.cancel();
        })
        .await
        .context("Server error")?;

    // Server may also stop on its own; make sure background tasks follow.
    shutdown.cancel();
    futures::future::join_all(workers).await;
    let _ = reaper_handle.await;
    tracing::info!("Shutdown complete");

    Ok(())
}
