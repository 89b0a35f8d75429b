//! pgbus message delivery service.
//!
//! Main entry point. Loads configuration, prepares the database, then runs
//! the HTTP API, the push engine and the maintenance loop until a shutdown
//! signal arrives.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use pgbus_api::{shutdown_signal, start_server, AppState, Config};
use pgbus_core::{Clock, RealClock, Storage};
use pgbus_delivery::{DeliveryEngine, Maintenance, NotifyDriver};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config.log_filter)?;

    info!("Starting pgbus message delivery service");
    info!(
        database_url = %config.database_url_masked(),
        host = %config.host,
        port = config.port,
        max_connections = config.database_max_connections,
        push_enabled = config.push_enabled,
        notify_enabled = config.notify_enabled,
        "Configuration loaded"
    );

    let pool = create_database_pool(&config).await?;
    let storage = Storage::new(pool.clone());
    storage.migrate().await.context("Failed to run database migrations")?;
    info!("Database migrations completed");

    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
    let notify = config
        .notify_enabled
        .then(|| NotifyDriver::new(storage.clone(), config.to_pull_config().lease_timeout));
    let shutdown = CancellationToken::new();

    let mut engine = if config.push_enabled {
        let mut engine = DeliveryEngine::new(
            Arc::new(storage.clone()),
            config.to_delivery_config(),
            clock.clone(),
        )
        .context("Failed to create push delivery engine")?;
        engine.start().await.context("Failed to start push delivery engine")?;
        Some(engine)
    } else {
        info!("Push delivery disabled");
        None
    };

    let maintenance = Maintenance::new(
        storage.clone(),
        notify.clone(),
        config.to_maintenance_config(),
        clock.clone(),
        shutdown.child_token(),
    )
    .spawn();

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    let addr = config.parse_server_addr()?;
    let state = AppState::new(storage, notify, config.to_pull_config(), clock);
    if let Err(e) = start_server(state, addr, config.request_timeout(), shutdown.clone()).await {
        error!(error = %e, "HTTP server failed");
    }
    shutdown.cancel();

    if let Some(engine) = engine.take() {
        if let Err(e) = engine.shutdown().await {
            warn!(error = %e, "Push delivery engine did not stop cleanly");
        }
    }
    if let Err(e) = maintenance.await {
        warn!(error = %e, "Maintenance task ended abnormally");
    }

    pool.close().await;
    info!("pgbus shutdown complete");
    Ok(())
}

/// Initializes tracing; `RUST_LOG` takes precedence over the configured filter.
fn init_tracing(default_filter: &str) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .context("Invalid log filter")?;

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
    Ok(())
}

/// Creates the connection pool, retrying while the database comes up.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    let mut attempt = 1;

    loop {
        let result = PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(config.database_min_connections)
            .acquire_timeout(Duration::from_secs(config.database_acquire_timeout_secs))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect(&config.database_url)
            .await;

        match result {
            Ok(pool) => {
                info!(attempt, "Database connection pool established");
                return Ok(pool);
            },
            Err(e) if attempt < config.database_connect_attempts => {
                warn!(
                    attempt,
                    max_attempts = config.database_connect_attempts,
                    error = %e,
                    "Database connection failed, retrying"
                );
                attempt += 1;
                tokio::time::sleep(CONNECT_RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).with_context(|| {
                    format!(
                        "Failed to connect to {} after {attempt} attempts",
                        config.database_url_masked()
                    )
                });
            },
        }
    }
}
