//! Courier signed webhook delivery service.
//!
//! Main entry point. Wires storage, the delivery worker pool, the rotation
//! sweeper and the HTTP surface, and coordinates graceful shutdown.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use courier_api::{shutdown_signal, start_server, AppState, Config, ReadinessCheck};
use courier_core::{storage::Storage, Clock, MulticastEventHandler, RealClock};
use courier_delivery::{
    DeliveryClient, DeliveryStorage, PostgresDeliveryStorage, PostgresTaskQueue, RotationSweeper,
    TaskQueue, WebhookDispatcher, WorkerPool,
};
use courier_signing::{InboundVerifier, OsSecretGenerator, SecretRotationManager};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod alerts;
mod schema;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config.rust_log)?;

    info!(
        database_url = %config.database_url_masked(),
        host = %config.host,
        port = config.port,
        workers = config.worker_pool_size,
        "starting courier"
    );

    let db_pool = create_database_pool(&config).await?;
    info!("database connection pool established");

    schema::ensure(&db_pool).await?;
    info!("database schema ready");

    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
    let storage = Arc::new(Storage::new(db_pool.clone()));
    let delivery_storage: Arc<dyn DeliveryStorage> =
        Arc::new(PostgresDeliveryStorage::new(storage.clone()));
    let queue: Arc<dyn TaskQueue> = Arc::new(PostgresTaskQueue::new(storage.clone(), clock.clone()));

    let mut events = MulticastEventHandler::new();
    events.add_subscriber(Arc::new(alerts::ExhaustionAlerts));

    let client = DeliveryClient::new(config.to_client_config())
        .context("failed to build delivery HTTP client")?;
    let dispatcher = WebhookDispatcher::new(
        delivery_storage.clone(),
        queue.clone(),
        client,
        config.to_retry_policy(),
        clock.clone(),
    )
    .with_event_handler(Arc::new(events));

    let worker_config = config.to_worker_config();
    let shutdown_timeout = worker_config.shutdown_timeout;
    let mut worker_pool = WorkerPool::new(dispatcher, queue, worker_config, clock.clone());
    worker_pool.spawn_workers().await.context("failed to start delivery workers")?;

    let shutdown = CancellationToken::new();
    let rotation = SecretRotationManager::new(clock.clone(), Arc::new(OsSecretGenerator));

    let sweeper = RotationSweeper::new(
        delivery_storage.clone(),
        rotation.clone(),
        clock.clone(),
        config.rotation_sweep_interval(),
        shutdown.child_token(),
    );
    let sweeper_handle = tokio::spawn(sweeper.run());

    let verifier = InboundVerifier::new(config.replay_tolerance(), rotation, clock.clone());
    let readiness: Arc<dyn ReadinessCheck> = storage;
    let state = AppState::new(delivery_storage, verifier, readiness, clock);

    let addr = config.parse_server_addr()?;
    let server_shutdown = shutdown.clone();
    let mut server_handle = tokio::spawn(start_server(
        state,
        addr,
        config.request_timeout(),
        async move { server_shutdown.cancelled().await },
    ));

    info!(%addr, "courier is ready");

    let server_stopped = tokio::select! {
        () = shutdown_signal() => {
            info!("shutdown signal received, starting graceful shutdown");
            false
        },
        result = &mut server_handle => {
            match result {
                Ok(Ok(())) => warn!("server stopped unexpectedly"),
                Ok(Err(e)) => error!(error = %e, "server failed"),
                Err(e) => error!(error = %e, "server task panicked"),
            }
            true
        },
    };

    shutdown.cancel();

    if let Err(e) = worker_pool.shutdown_graceful(shutdown_timeout).await {
        error!(error = %e, "worker pool did not shut down cleanly");
    }

    if tokio::time::timeout(shutdown_timeout, sweeper_handle).await.is_err() {
        warn!("rotation sweeper did not stop within the shutdown timeout");
    }

    if !server_stopped && tokio::time::timeout(shutdown_timeout, server_handle).await.is_err() {
        warn!("HTTP server did not drain within the shutdown timeout");
    }

    db_pool.close().await;
    info!("courier shutdown complete");
    Ok(())
}

/// Initializes tracing. `RUST_LOG` wins over the configured filter.
fn init_tracing(default_filter: &str) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .context("invalid log filter")?;

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
    Ok(())
}

/// Creates the database connection pool, retrying while the database
/// comes up.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);

    let mut retries = 0;

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
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
