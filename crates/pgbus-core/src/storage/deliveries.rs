//! Repository for the delivery tracker.
//!
//! Every status transition is a single guarded `UPDATE`: the `WHERE status`
//! clause encodes the legal source states, so an illegal transition affects
//! zero rows instead of corrupting a record. Claims use
//! `FOR UPDATE OF md SKIP LOCKED` so competing consumers and push workers
//! never receive the same record.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use sqlx::{Executor, PgPool, Postgres, Transaction};
use tracing::{debug, info};

use crate::{
    error::Result,
    models::{
        ClientId, Delivery, DeliveryKey, DeliveryMode, DeliveryRecord, MessageId, PushDelivery,
        Subscription,
    },
};

const RECORD_COLUMNS: &str = "message_id, client_id, subscription_id, delivery_mode, status, \
                              attempts, lease_expires_at, next_attempt_at, delivered_at, \
                              last_error, created_at, updated_at";

const DELIVERY_COLUMNS: &str = "md.message_id, md.client_id, md.subscription_id, \
                                md.delivery_mode, md.status, md.attempts, md.lease_expires_at, \
                                md.next_attempt_at, md.delivered_at, md.last_error, \
                                md.created_at, md.updated_at, m.message_type, m.namespace, \
                                m.payload, m.tracking_id, m.created_at AS message_created_at";

fn limit(batch_size: usize) -> i64 {
    i64::try_from(batch_size).unwrap_or(i64::MAX)
}

fn ids(message_ids: &[MessageId]) -> Vec<i64> {
    message_ids.iter().map(|id| id.0).collect()
}

fn fifo(mut deliveries: Vec<Delivery>) -> Vec<Delivery> {
    deliveries.sort_by_key(|d| (d.message.created_at, d.message.id));
    deliveries
}

/// Repository for `message_delivery` rows.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns a reference to the database pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Creates a `new` record for `(message, subscription)` unless one exists.
    ///
    /// Returns true if a row was inserted.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn create_if_absent_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        message_id: MessageId,
        subscription: &Subscription,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO message_delivery (message_id, client_id, subscription_id, delivery_mode)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (message_id, client_id, delivery_mode) DO NOTHING
            "#,
        )
        .bind(message_id)
        .bind(&subscription.client_id)
        .bind(subscription.id)
        .bind(subscription.mode().as_str())
        .execute(&mut **tx)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Leases up to `batch_size` of a client's `new` records in one mode.
    ///
    /// Records move to `in_flight` with `lease_expires_at = now + lease`.
    /// Runs as one autocommitted statement, so the lease is durable once this
    /// returns. Results are FIFO by message creation.
    ///
    /// # Errors
    ///
    /// Returns error if the statement fails.
    pub async fn claim(
        &self,
        client_id: &ClientId,
        mode: DeliveryMode,
        batch_size: usize,
        lease: Duration,
    ) -> Result<Vec<Delivery>> {
        self.claim_impl(&*self.pool, client_id, mode, batch_size, lease).await
    }

    /// Same as [`Self::claim`] inside a transaction.
    ///
    /// Row locks are held until the transaction ends; rolling back returns
    /// the records to `new`.
    ///
    /// # Errors
    ///
    /// Returns error if the statement fails.
    pub async fn claim_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        client_id: &ClientId,
        mode: DeliveryMode,
        batch_size: usize,
        lease: Duration,
    ) -> Result<Vec<Delivery>> {
        self.claim_impl(&mut **tx, client_id, mode, batch_size, lease).await
    }

    async fn claim_impl<'e, E>(
        &self,
        executor: E,
        client_id: &ClientId,
        mode: DeliveryMode,
        batch_size: usize,
        lease: Duration,
    ) -> Result<Vec<Delivery>>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let query = format!(
            r#"
            WITH claimable AS (
                SELECT md.message_id, md.client_id, md.delivery_mode
                FROM message_delivery md
                JOIN messages m ON m.id = md.message_id
                WHERE md.client_id = $1
                  AND md.delivery_mode = $2
                  AND md.status = 'new'
                ORDER BY m.created_at, m.id
                LIMIT $3
                FOR UPDATE OF md SKIP LOCKED
            )
            UPDATE message_delivery md
            SET status = 'in_flight',
                lease_expires_at = clock_timestamp() + make_interval(secs => $4),
                updated_at = clock_timestamp()
            FROM claimable c, messages m
            WHERE md.message_id = c.message_id
              AND md.client_id = c.client_id
              AND md.delivery_mode = c.delivery_mode
              AND m.id = md.message_id
            RETURNING {DELIVERY_COLUMNS}
            "#
        );

        let deliveries = sqlx::query_as::<_, Delivery>(&query)
            .bind(client_id)
            .bind(mode.as_str())
            .bind(limit(batch_size))
            .bind(lease.as_secs_f64())
            .fetch_all(executor)
            .await?;

        Ok(fifo(deliveries))
    }

    /// Leases up to `batch_size` due push records across all clients.
    ///
    /// A record is due when `next_attempt_at` is unset or has passed.
    ///
    /// # Errors
    ///
    /// Returns error if the statement fails.
    pub async fn claim_due_push(
        &self,
        batch_size: usize,
        lease: Duration,
    ) -> Result<Vec<PushDelivery>> {
        let query = format!(
            r#"
            WITH claimable AS (
                SELECT md.message_id, md.client_id, md.delivery_mode
                FROM message_delivery md
                JOIN messages m ON m.id = md.message_id
                WHERE md.delivery_mode = 'push'
                  AND md.status = 'new'
                  AND (md.next_attempt_at IS NULL OR md.next_attempt_at <= clock_timestamp())
                ORDER BY m.created_at, m.id
                LIMIT $1
                FOR UPDATE OF md SKIP LOCKED
            )
            UPDATE message_delivery md
            SET status = 'in_flight',
                lease_expires_at = clock_timestamp() + make_interval(secs => $2),
                updated_at = clock_timestamp()
            FROM claimable c, messages m, subscriptions s
            WHERE md.message_id = c.message_id
              AND md.client_id = c.client_id
              AND md.delivery_mode = c.delivery_mode
              AND m.id = md.message_id
              AND s.id = md.subscription_id
            RETURNING {DELIVERY_COLUMNS}, COALESCE(s.webhook_url, '') AS webhook_url
            "#
        );

        let mut deliveries = sqlx::query_as::<_, PushDelivery>(&query)
            .bind(limit(batch_size))
            .bind(lease.as_secs_f64())
            .fetch_all(&*self.pool)
            .await?;

        deliveries.sort_by_key(|p| (p.delivery.message.created_at, p.delivery.message.id));
        Ok(deliveries)
    }

    /// Marks a client's records delivered.
    ///
    /// Only `new` and `in_flight` records of `mode` owned by `client_id`
    /// change; other ids are ignored. Returns the number of records updated.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn mark_delivered(
        &self,
        client_id: &ClientId,
        mode: DeliveryMode,
        message_ids: &[MessageId],
    ) -> Result<u64> {
        self.mark_delivered_impl(&*self.pool, client_id, mode, message_ids).await
    }

    /// Same as [`Self::mark_delivered`] inside a transaction.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn mark_delivered_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        client_id: &ClientId,
        mode: DeliveryMode,
        message_ids: &[MessageId],
    ) -> Result<u64> {
        self.mark_delivered_impl(&mut **tx, client_id, mode, message_ids).await
    }

    async fn mark_delivered_impl<'e, E>(
        &self,
        executor: E,
        client_id: &ClientId,
        mode: DeliveryMode,
        message_ids: &[MessageId],
    ) -> Result<u64>
    where
        E: Executor<'e, Database = Postgres>,
    {
        if message_ids.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query(
            r#"
            UPDATE message_delivery
            SET status = 'delivered',
                delivered_at = clock_timestamp(),
                lease_expires_at = NULL,
                updated_at = clock_timestamp()
            WHERE client_id = $1
              AND delivery_mode = $2
              AND message_id = ANY($3)
              AND status IN ('new', 'in_flight')
            "#,
        )
        .bind(client_id)
        .bind(mode.as_str())
        .bind(ids(message_ids))
        .execute(executor)
        .await?;

        Ok(result.rows_affected())
    }

    /// Returns leased records to `new` ahead of lease expiry.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn release(
        &self,
        client_id: &ClientId,
        mode: DeliveryMode,
        message_ids: &[MessageId],
    ) -> Result<u64> {
        if message_ids.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query(
            r#"
            UPDATE message_delivery
            SET status = 'new', lease_expires_at = NULL, updated_at = clock_timestamp()
            WHERE client_id = $1
              AND delivery_mode = $2
              AND message_id = ANY($3)
              AND status = 'in_flight'
            "#,
        )
        .bind(client_id)
        .bind(mode.as_str())
        .bind(ids(message_ids))
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Extends a push lease the caller still holds.
    ///
    /// `held` is the `lease_expires_at` the caller last saw. Returns the new
    /// expiry, or `None` once the record was reaped or claimed by another
    /// worker.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn renew_push_lease(
        &self,
        key: &DeliveryKey,
        held: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<DateTime<Utc>>> {
        let renewed = sqlx::query_scalar::<_, DateTime<Utc>>(
            r#"
            UPDATE message_delivery
            SET lease_expires_at = clock_timestamp() + make_interval(secs => $5),
                updated_at = clock_timestamp()
            WHERE message_id = $1 AND client_id = $2 AND delivery_mode = $3
              AND status = 'in_flight'
              AND lease_expires_at = $4
            RETURNING lease_expires_at
            "#,
        )
        .bind(key.message_id)
        .bind(&key.client_id)
        .bind(key.mode.as_str())
        .bind(held)
        .bind(lease.as_secs_f64())
        .fetch_optional(&*self.pool)
        .await?;

        if renewed.is_none() {
            debug!(
                message_id = %key.message_id,
                client_id = %key.client_id,
                "push lease no longer held"
            );
        }
        Ok(renewed)
    }

    /// Records a successful push attempt under the lease `held`.
    ///
    /// Returns `false` when the lease was lost in the meantime.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn complete_push(
        &self,
        key: &DeliveryKey,
        held: DateTime<Utc>,
        attempts: i32,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE message_delivery
            SET status = 'delivered',
                attempts = $4,
                delivered_at = clock_timestamp(),
                lease_expires_at = NULL,
                last_error = NULL,
                updated_at = clock_timestamp()
            WHERE message_id = $1 AND client_id = $2 AND delivery_mode = $3
              AND status = 'in_flight'
              AND lease_expires_at = $5
            "#,
        )
        .bind(key.message_id)
        .bind(&key.client_id)
        .bind(key.mode.as_str())
        .bind(attempts)
        .bind(held)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Returns a failed attempt to `new`, not claimable before `next_attempt_at`.
    ///
    /// Fenced on the lease `held` like [`Self::complete_push`].
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn schedule_retry(
        &self,
        key: &DeliveryKey,
        held: DateTime<Utc>,
        attempts: i32,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE message_delivery
            SET status = 'new',
                attempts = $4,
                next_attempt_at = $5,
                last_error = $6,
                lease_expires_at = NULL,
                updated_at = clock_timestamp()
            WHERE message_id = $1 AND client_id = $2 AND delivery_mode = $3
              AND status = 'in_flight'
              AND lease_expires_at = $7
            "#,
        )
        .bind(key.message_id)
        .bind(&key.client_id)
        .bind(key.mode.as_str())
        .bind(attempts)
        .bind(next_attempt_at)
        .bind(error)
        .bind(held)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Moves a record leased as `held` to the terminal `failed` state.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn mark_failed(
        &self,
        key: &DeliveryKey,
        held: DateTime<Utc>,
        attempts: i32,
        error: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE message_delivery
            SET status = 'failed',
                attempts = $4,
                last_error = $5,
                lease_expires_at = NULL,
                updated_at = clock_timestamp()
            WHERE message_id = $1 AND client_id = $2 AND delivery_mode = $3
              AND status = 'in_flight'
              AND lease_expires_at = $6
            "#,
        )
        .bind(key.message_id)
        .bind(&key.client_id)
        .bind(key.mode.as_str())
        .bind(attempts)
        .bind(error)
        .bind(held)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Stores `error` on a record without changing its status.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn record_error(&self, key: &DeliveryKey, error: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE message_delivery
            SET last_error = $4, updated_at = clock_timestamp()
            WHERE message_id = $1 AND client_id = $2 AND delivery_mode = $3
              AND status <> 'delivered'
            "#,
        )
        .bind(key.message_id)
        .bind(&key.client_id)
        .bind(key.mode.as_str())
        .bind(error)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Reverts every `in_flight` record whose lease has lapsed to `new`.
    ///
    /// Records leased inside an open transaction are still `new` to every
    /// other session and are not touched.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn release_expired_leases(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE message_delivery
            SET status = 'new', lease_expires_at = NULL, updated_at = clock_timestamp()
            WHERE status = 'in_flight'
              AND lease_expires_at < clock_timestamp()
            "#,
        )
        .execute(&*self.pool)
        .await?;

        let released = result.rows_affected();
        if released > 0 {
            info!(released, "released expired delivery leases");
        }
        Ok(released)
    }

    /// Operator path out of `failed`: back to `new` with attempts reset.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn requeue_failed(&self, key: &DeliveryKey) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE message_delivery
            SET status = 'new',
                attempts = 0,
                next_attempt_at = NULL,
                last_error = NULL,
                updated_at = clock_timestamp()
            WHERE message_id = $1 AND client_id = $2 AND delivery_mode = $3
              AND status = 'failed'
            "#,
        )
        .bind(key.message_id)
        .bind(&key.client_id)
        .bind(key.mode.as_str())
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Finds a record by its natural key.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find(&self, key: &DeliveryKey) -> Result<Option<DeliveryRecord>> {
        let query = format!(
            "SELECT {RECORD_COLUMNS} FROM message_delivery \
             WHERE message_id = $1 AND client_id = $2 AND delivery_mode = $3"
        );
        let record = sqlx::query_as::<_, DeliveryRecord>(&query)
            .bind(key.message_id)
            .bind(&key.client_id)
            .bind(key.mode.as_str())
            .fetch_optional(&*self.pool)
            .await?;

        Ok(record)
    }

    /// Lists every record of a message, ordered by client and mode.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_message(&self, message_id: MessageId) -> Result<Vec<DeliveryRecord>> {
        let query = format!(
            "SELECT {RECORD_COLUMNS} FROM message_delivery \
             WHERE message_id = $1 ORDER BY client_id, delivery_mode"
        );
        let records = sqlx::query_as::<_, DeliveryRecord>(&query)
            .bind(message_id)
            .fetch_all(&*self.pool)
            .await?;

        Ok(records)
    }

    /// Counts a message's records per delivery mode.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn stats_for_message(
        &self,
        message_id: MessageId,
    ) -> Result<BTreeMap<DeliveryMode, i64>> {
        let rows: Vec<(DeliveryMode, i64)> = sqlx::query_as(
            r#"
            SELECT delivery_mode, COUNT(*)
            FROM message_delivery
            WHERE message_id = $1
            GROUP BY delivery_mode
            "#,
        )
        .bind(message_id)
        .fetch_all(&*self.pool)
        .await?;

        Ok(rows.into_iter().collect())
    }
}
