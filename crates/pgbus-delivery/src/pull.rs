//! Pull driver: competing consumers over the delivery tracker.
//!
//! Two lease flavours exist:
//!
//! - [`PullDriver::dequeue`] commits the `in_flight` transition at once. A
//!   consumer that disappears is detected by `lease_expires_at` passing, and
//!   the maintenance loop returns its records to `new`.
//! - [`PullDriver::lease`] keeps the claim inside an open transaction owned
//!   by the returned [`Lease`]. Dropping the lease or losing the connection
//!   rolls the claim back, so the records are immediately eligible again.

use std::time::Duration;

use pgbus_core::{
    error::Result,
    models::{ClientId, Delivery, DeliveryMode, MessageId},
    CoreError, Storage,
};
use serde::{Deserialize, Serialize};
use sqlx::{Postgres, Transaction};
use tracing::{debug, instrument};

use crate::retry::StoreRetry;

/// Pull driver settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullConfig {
    /// Batch size used when the caller does not choose one.
    pub default_batch_size: usize,
    /// Upper bound on one dequeue.
    pub max_batch_size: usize,
    /// How long a committed lease lasts.
    pub lease_timeout: Duration,
    /// Retries of transient store errors.
    #[serde(skip)]
    pub store_retry: StoreRetry,
}

impl Default for PullConfig {
    fn default() -> Self {
        Self {
            default_batch_size: crate::DEFAULT_BATCH_SIZE,
            max_batch_size: 100,
            lease_timeout: Duration::from_secs(30),
            store_retry: StoreRetry::default(),
        }
    }
}

impl PullConfig {
    /// Clamps a requested batch size into `1..=max_batch_size`.
    pub fn clamp_batch(&self, requested: usize) -> usize {
        requested.clamp(1, self.max_batch_size.max(1))
    }
}

/// Dequeue, acknowledge and release pull records.
#[derive(Clone)]
pub struct PullDriver {
    storage: Storage,
    config: PullConfig,
}

impl PullDriver {
    /// Creates a driver.
    pub fn new(storage: Storage, config: PullConfig) -> Self {
        Self { storage, config }
    }

    /// Driver settings.
    pub fn config(&self) -> &PullConfig {
        &self.config
    }

    /// Leases up to `batch_size` of the client's `new` pull records.
    ///
    /// Records are ordered by message creation and granted to exactly one
    /// caller. The lease is committed before this returns.
    ///
    /// # Errors
    ///
    /// Returns error once transient store failures exhaust their retries.
    #[instrument(skip(self, client_id), fields(client_id = %client_id))]
    pub async fn dequeue(&self, client_id: &ClientId, batch_size: usize) -> Result<Vec<Delivery>> {
        let batch_size = self.config.clamp_batch(batch_size);
        let deliveries = self
            .config
            .store_retry
            .run("pull_dequeue", || {
                self.storage.deliveries.claim(
                    client_id,
                    DeliveryMode::Pull,
                    batch_size,
                    self.config.lease_timeout,
                )
            })
            .await?;

        debug!(batch_size, claimed = deliveries.len(), "dequeued pull records");
        Ok(deliveries)
    }

    /// Leases records inside a transaction held by the returned [`Lease`].
    ///
    /// # Errors
    ///
    /// Returns error once transient store failures exhaust their retries.
    #[instrument(skip(self, client_id), fields(client_id = %client_id))]
    pub async fn lease(&self, client_id: &ClientId, batch_size: usize) -> Result<Lease> {
        let batch_size = self.config.clamp_batch(batch_size);
        let (tx, deliveries) = self
            .config
            .store_retry
            .run("pull_lease", || async move {
                let mut tx = self.storage.begin().await?;
                let deliveries = self
                    .storage
                    .deliveries
                    .claim_in_tx(
                        &mut tx,
                        client_id,
                        DeliveryMode::Pull,
                        batch_size,
                        self.config.lease_timeout,
                    )
                    .await?;
                Ok::<_, CoreError>((tx, deliveries))
            })
            .await?;

        debug!(batch_size, claimed = deliveries.len(), "leased pull records in transaction");
        Ok(Lease { tx, deliveries, client_id: client_id.clone(), storage: self.storage.clone() })
    }

    /// Marks the client's records delivered.
    ///
    /// Ids that are unknown, owned by another client or already delivered
    /// are ignored. Returns the number of records acknowledged.
    ///
    /// # Errors
    ///
    /// Returns error once transient store failures exhaust their retries.
    #[instrument(
        skip(self, client_id, message_ids),
        fields(client_id = %client_id, ids = message_ids.len())
    )]
    pub async fn ack(&self, client_id: &ClientId, message_ids: &[MessageId]) -> Result<u64> {
        self.config
            .store_retry
            .run("pull_ack", || {
                self.storage.deliveries.mark_delivered(client_id, DeliveryMode::Pull, message_ids)
            })
            .await
    }

    /// Returns leased records to `new` ahead of lease expiry.
    ///
    /// # Errors
    ///
    /// Returns error once transient store failures exhaust their retries.
    #[instrument(
        skip(self, client_id, message_ids),
        fields(client_id = %client_id, ids = message_ids.len())
    )]
    pub async fn release(&self, client_id: &ClientId, message_ids: &[MessageId]) -> Result<u64> {
        self.config
            .store_retry
            .run("pull_release", || {
                self.storage.deliveries.release(client_id, DeliveryMode::Pull, message_ids)
            })
            .await
    }
}

/// Transaction-scoped lease from [`PullDriver::lease`].
///
/// Dropping it without [`Lease::ack`] rolls the claim back.
pub struct Lease {
    tx: Transaction<'static, Postgres>,
    deliveries: Vec<Delivery>,
    client_id: ClientId,
    storage: Storage,
}

impl Lease {
    /// Claimed records in FIFO order.
    pub fn deliveries(&self) -> &[Delivery] {
        &self.deliveries
    }

    /// Ids of the claimed messages.
    pub fn message_ids(&self) -> Vec<MessageId> {
        self.deliveries.iter().map(|d| d.message.id).collect()
    }

    /// True when nothing was claimed.
    pub fn is_empty(&self) -> bool {
        self.deliveries.is_empty()
    }

    /// Marks every leased record delivered and commits.
    ///
    /// # Errors
    ///
    /// Returns error if the update or commit fails; the claim is then rolled
    /// back.
    pub async fn ack(mut self) -> Result<u64> {
        let ids = self.message_ids();
        let acked = self
            .storage
            .deliveries
            .mark_delivered_in_tx(&mut self.tx, &self.client_id, DeliveryMode::Pull, &ids)
            .await?;
        self.tx.commit().await?;
        Ok(acked)
    }

    /// Abandons the lease, making the records eligible again.
    ///
    /// # Errors
    ///
    /// Returns error if the rollback statement fails.
    pub async fn rollback(self) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_size_is_clamped() {
        let config = PullConfig { max_batch_size: 50, ..PullConfig::default() };
        assert_eq!(config.clamp_batch(0), 1);
        assert_eq!(config.clamp_batch(7), 7);
        assert_eq!(config.clamp_batch(50), 50);
        assert_eq!(config.clamp_batch(10_000), 50);
    }

    #[test]
    fn zero_max_still_allows_one() {
        let config = PullConfig { max_batch_size: 0, ..PullConfig::default() };
        assert_eq!(config.clamp_batch(5), 1);
    }
}
