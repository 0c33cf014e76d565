//! Hookline delivery worker.
//!
//! Connects the attempt ledger and the task queue, runs the delivery engine
//! and drains in-flight deliveries on shutdown.

mod config;

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use hookline_core::{storage::Storage, Clock, RealClock};
use hookline_delivery::{
    plugin::NoPlugins,
    queue::InMemoryTaskQueue,
    DeliveryEngine, EngineParts, HttpDeliverer, PostgresLedger, TaskQueue,
};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{Config, LogFormat, QueueBackend};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(config.log_format)?;

    info!(
        database_url = %config.database_url_masked(),
        queue_backend = ?config.queue.backend,
        poll_batch_size = config.worker.poll_batch_size,
        "starting hookline worker"
    );

    let db_pool = create_database_pool(&config).await?;
    info!("database connection pool established");

    sqlx::migrate!("./migrations").run(&db_pool).await.context("failed to run migrations")?;
    info!("database migrations completed");

    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
    let background = CancellationToken::new();
    let queue = create_queue(&config, clock.clone(), &background).await?;

    let ledger = Arc::new(PostgresLedger::new(Arc::new(Storage::new(db_pool.clone()))));
    let deliverer = Arc::new(
        HttpDeliverer::new(config.to_client_config()).context("failed to build http deliverer")?,
    );

    let parts = EngineParts { queue, ledger, deliverer, plugins: Arc::new(NoPlugins), clock };
    let mut engine = DeliveryEngine::new(parts, config.to_engine_config())
        .context("failed to build delivery engine")?;
    if config.queue.backend == QueueBackend::Memory {
        let reclaimed =
            engine.reclaim_queued().await.context("failed to reclaim queued attempts")?;
        info!(reclaimed, "in-memory queue starts empty, queued attempts handed to reconciler");
    }
    engine.start().context("failed to start delivery engine")?;

    info!("hookline worker ready");

    shutdown_signal().await;
    info!("shutdown signal received, draining in-flight deliveries");

    let stats = engine.stats();
    if let Err(e) = engine.shutdown().await {
        warn!(error = %e, "delivery engine did not stop cleanly");
    }
    background.cancel();

    db_pool.close().await;
    info!(?stats, "hookline shutdown complete");
    Ok(())
}

/// Initializes tracing from `RUST_LOG`, falling back to `info,hookline=debug`.
fn init_tracing(format: LogFormat) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,hookline=debug"))
        .context("invalid RUST_LOG filter")?;

    let registry = tracing_subscriber::registry().with(filter);
    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    match format {
        LogFormat::Text => registry.with(fmt_layer).try_init(),
        LogFormat::Json => registry.with(fmt_layer.json()).try_init(),
    }
    .context("failed to install tracing subscriber")
}

/// Creates the database connection pool with retry logic.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);
    let mut retries = 0;

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(1)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                sqlx::query("SELECT 1")
                    .execute(&pool)
                    .await
                    .context("failed to verify database connection")?;
                return Ok(pool);
            },
            Err(e) if retries < MAX_RETRIES => {
                retries += 1;
                warn!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    error = %e,
                    "database connection failed, retrying"
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("failed to create database connection pool after retries");
            },
        }
    }
}

/// Builds the configured task queue. Background queue maintenance stops when
/// `token` is cancelled.
async fn create_queue(
    config: &Config,
    clock: Arc<dyn Clock>,
    token: &CancellationToken,
) -> Result<Arc<dyn TaskQueue>> {
    match config.queue.backend {
        QueueBackend::Memory => {
            info!(
                visibility_timeout_secs = config.queue.visibility_timeout_secs,
                "using in-memory task queue"
            );
            Ok(Arc::new(InMemoryTaskQueue::with_visibility_timeout(
                clock,
                config.visibility_timeout(),
            )))
        },
        #[cfg(feature = "redis")]
        QueueBackend::Redis => {
            let queue = hookline_delivery::queue::RedisTaskQueue::connect(&config.to_redis_config())
                .await
                .context("failed to connect to redis task queue")?;
            queue.spawn_requeue(token.child_token());
            Ok(Arc::new(queue))
        },
        #[cfg(not(feature = "redis"))]
        QueueBackend::Redis => {
            let _ = token;
            anyhow::bail!("redis queue backend requires the redis feature")
        },
    }
}

/// Waits for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received ctrl-c"),
        () = terminate => info!("received SIGTERM"),
    }
}
