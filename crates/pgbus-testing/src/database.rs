//! Isolated PostgreSQL databases for tests.
//!
//! Each [`TestDatabase`] is a fresh database created on the server named by
//! `DATABASE_URL` with every migration applied. Tests never share rows, so
//! they can run in parallel.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use pgbus_core::storage::MIGRATOR;
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions},
    PgPool,
};
use tokio::sync::{OnceCell, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

const DATABASE_PREFIX: &str = "pgbus_test";

static ADMIN_POOL: OnceCell<PgPool> = OnceCell::const_new();

// Limits concurrent CREATE DATABASE calls
static DB_CREATION_SEMAPHORE: Semaphore = Semaphore::const_new(3);

/// Handle to an isolated, migrated test database.
#[derive(Debug)]
pub struct TestDatabase {
    pool: PgPool,
    database_name: String,
}

impl TestDatabase {
    /// Creates a database, or returns `None` when `DATABASE_URL` is unset.
    ///
    /// # Errors
    ///
    /// Returns error if `DATABASE_URL` is set but unusable, or migrations fail.
    pub async fn isolated() -> Result<Option<Self>> {
        let Ok(database_url) = std::env::var("DATABASE_URL") else {
            return Ok(None);
        };

        let options =
            database_url.parse::<PgConnectOptions>().context("failed to parse DATABASE_URL")?;
        let admin_pool = admin_pool(&options).await?;

        let database_name = format!("{DATABASE_PREFIX}_{}", Uuid::new_v4().simple());
        create_database(&admin_pool, &database_name).await?;

        let pool = PgPoolOptions::new()
            .max_connections(8)
            .min_connections(0)
            .idle_timeout(Duration::from_secs(10))
            .acquire_timeout(Duration::from_secs(5))
            .connect_with(options.database(&database_name))
            .await
            .with_context(|| format!("failed to connect to {database_name}"))?;

        MIGRATOR.run(&pool).await.context("failed to run migrations")?;
        info!(database = %database_name, "created isolated test database");

        Ok(Some(Self { pool, database_name }))
    }

    /// Access to the database pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Name of the isolated database.
    pub fn database_name(&self) -> &str {
        &self.database_name
    }

    /// Closes the pool and drops the database.
    ///
    /// # Errors
    ///
    /// Returns error if the drop statement fails.
    pub async fn cleanup(self) -> Result<()> {
        self.pool.close().await;

        let Some(admin_pool) = ADMIN_POOL.get() else {
            return Ok(());
        };
        sqlx::query(&format!("DROP DATABASE IF EXISTS \"{}\" WITH (FORCE)", self.database_name))
            .execute(admin_pool)
            .await
            .with_context(|| format!("failed to drop database {}", self.database_name))?;

        debug!(database = %self.database_name, "dropped test database");
        Ok(())
    }
}

async fn admin_pool(options: &PgConnectOptions) -> Result<PgPool> {
    let pool = ADMIN_POOL
        .get_or_try_init(|| async {
            let pool = PgPoolOptions::new()
                .max_connections(2)
                .min_connections(0)
                .acquire_timeout(Duration::from_secs(3))
                .connect_with(options.clone().database("postgres"))
                .await
                .context("failed to connect to admin database")?;
            anyhow::Ok(pool)
        })
        .await?;

    Ok(pool.clone())
}

async fn create_database(admin_pool: &PgPool, database_name: &str) -> Result<()> {
    let start = Instant::now();
    let _permit =
        DB_CREATION_SEMAPHORE.acquire().await.context("database creation semaphore closed")?;

    sqlx::query(&format!("CREATE DATABASE \"{database_name}\""))
        .execute(admin_pool)
        .await
        .with_context(|| format!("failed to create database {database_name}"))?;

    let elapsed = start.elapsed();
    if elapsed > Duration::from_millis(500) {
        warn!(database = %database_name, elapsed_ms = elapsed.as_millis(), "slow database creation");
    }
    Ok(())
}
