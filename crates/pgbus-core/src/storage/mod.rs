//! Database access layer implementing the repository pattern.
//!
//! Repositories translate between domain models and the schema in
//! `migrations/`. All SQL lives under this module; the delivery crate only
//! composes repository calls and transactions.

use std::sync::Arc;

use sqlx::{PgPool, Postgres, Transaction};

pub mod deliveries;
pub mod messages;
pub mod subscriptions;

use crate::error::Result;

/// Embedded schema migrations.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Container for all repository instances.
#[derive(Clone)]
pub struct Storage {
    /// Message store.
    pub messages: Arc<messages::Repository>,

    /// Subscription registry.
    pub subscriptions: Arc<subscriptions::Repository>,

    /// Delivery tracker.
    pub deliveries: Arc<deliveries::Repository>,

    pool: Arc<PgPool>,
}

impl Storage {
    /// Creates a new storage instance with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            messages: Arc::new(messages::Repository::new(pool.clone())),
            subscriptions: Arc::new(subscriptions::Repository::new(pool.clone())),
            deliveries: Arc::new(deliveries::Repository::new(pool.clone())),
            pool,
        }
    }

    /// Shared connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Starts a transaction spanning several repositories.
    ///
    /// # Errors
    ///
    /// Returns an error if no connection can be acquired.
    pub async fn begin(&self) -> Result<Transaction<'static, Postgres>> {
        Ok(self.pool.begin().await?)
    }

    /// Applies pending migrations.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if a migration fails.
    pub async fn migrate(&self) -> Result<()> {
        MIGRATOR.run(&*self.pool).await?;
        Ok(())
    }

    /// Verifies database connectivity.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.pool).await?;
        Ok(())
    }
}
