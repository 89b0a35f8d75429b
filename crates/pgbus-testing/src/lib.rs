//! Test infrastructure for pgbus.
//!
//! Provides isolated PostgreSQL databases, fixture builders, invariant
//! checks and proptest strategies. Database-backed tests obtain a
//! [`TestEnv`] through [`require_database!`], which returns early when
//! `DATABASE_URL` is not set.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

use anyhow::Result;
use pgbus_core::{
    models::{DeliveryRecord, MessageId, NewSubscription, Subscription},
    Storage,
};

pub mod database;
pub mod fixtures;
pub mod invariants;

pub use database::TestDatabase;
pub use fixtures::{MessageBuilder, SubscriptionBuilder};
pub use invariants::{strategies, Invariants};
pub use pgbus_core::{Clock, TestClock};

/// Returns a [`TestEnv`] or ends the test early when no database is configured.
///
/// Must be used inside a function returning `anyhow::Result<()>`.
#[macro_export]
macro_rules! require_database {
    () => {
        match $crate::TestEnv::new().await? {
            Some(env) => env,
            None => {
                eprintln!("DATABASE_URL not set, skipping database test");
                return Ok(());
            },
        }
    };
}

/// Test environment backed by an isolated database.
pub struct TestEnv {
    /// Isolated database owning the pool.
    pub db: TestDatabase,
    /// Repositories over `db`.
    pub storage: Storage,
    /// Controllable clock for workers under test.
    pub clock: TestClock,
}

impl TestEnv {
    /// Creates an environment, or `None` when `DATABASE_URL` is unset.
    ///
    /// # Errors
    ///
    /// Returns error if the database cannot be created or migrated.
    pub async fn new() -> Result<Option<Self>> {
        let Some(db) = TestDatabase::isolated().await? else {
            return Ok(None);
        };

        let storage = Storage::new(db.pool().clone());
        Ok(Some(Self { db, storage, clock: TestClock::new() }))
    }

    /// Registers a subscription.
    ///
    /// # Errors
    ///
    /// Returns error if the upsert fails.
    pub async fn subscribe(&self, subscription: NewSubscription) -> Result<Subscription> {
        Ok(self.storage.subscriptions.upsert(&subscription).await?)
    }

    /// All delivery records for a message.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn records(&self, message_id: MessageId) -> Result<Vec<DeliveryRecord>> {
        Ok(self.storage.deliveries.find_by_message(message_id).await?)
    }

    /// Total number of delivery records in the database.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn record_count(&self) -> Result<i64> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM message_delivery")
            .fetch_one(self.db.pool())
            .await?;
        Ok(count)
    }

    /// Forces every lease to look expired.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn expire_leases(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE message_delivery SET lease_expires_at = clock_timestamp() - INTERVAL '1 \
             second' WHERE status = 'in_flight'",
        )
        .execute(self.db.pool())
        .await?;
        Ok(result.rows_affected())
    }

    /// Makes every scheduled push retry due now.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn make_retries_due(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE message_delivery SET next_attempt_at = clock_timestamp() - INTERVAL '1 \
             second' WHERE status = 'new' AND next_attempt_at IS NOT NULL",
        )
        .execute(self.db.pool())
        .await?;
        Ok(result.rows_affected())
    }

    /// Drops the isolated database.
    ///
    /// # Errors
    ///
    /// Returns error if the drop fails.
    pub async fn cleanup(self) -> Result<()> {
        self.db.cleanup().await
    }
}
