//! Repository for the message store.
//!
//! Messages are insert-only. Fan-out completion is tracked in the separate
//! `message_fanout` table so the message row itself never changes.

use std::sync::Arc;

use sqlx::{Executor, PgPool, Postgres, Transaction};

use crate::{
    error::{CoreError, Result},
    models::{generate_tracking_id, Message, MessageId, NewMessage},
};

/// Repository for message rows and fan-out markers.
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

    /// Inserts a message in its own transaction.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Validation` for blank fields, or a store error.
    pub async fn insert(&self, message: &NewMessage) -> Result<Message> {
        self.insert_impl(&*self.pool, message).await
    }

    /// Inserts a message inside the caller's transaction.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Validation` for blank fields, or a store error.
    pub async fn insert_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        message: &NewMessage,
    ) -> Result<Message> {
        self.insert_impl(&mut **tx, message).await
    }

    async fn insert_impl<'e, E>(&self, executor: E, message: &NewMessage) -> Result<Message>
    where
        E: Executor<'e, Database = Postgres>,
    {
        message.validate()?;
        let tracking_id = message.tracking_id.clone().unwrap_or_else(generate_tracking_id);

        let message = sqlx::query_as::<_, Message>(
            r#"
            INSERT INTO messages (message_type, namespace, payload, tracking_id)
            VALUES ($1, $2, $3, $4)
            RETURNING id, message_type, namespace, payload, tracking_id, created_at
            "#,
        )
        .bind(&message.message_type)
        .bind(&message.namespace)
        .bind(&message.payload)
        .bind(tracking_id)
        .fetch_one(executor)
        .await?;

        Ok(message)
    }

    /// Finds a message by id.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, id: MessageId) -> Result<Option<Message>> {
        self.find_by_id_impl(&*self.pool, id).await
    }

    /// Finds a message by id inside a transaction.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: MessageId,
    ) -> Result<Option<Message>> {
        self.find_by_id_impl(&mut **tx, id).await
    }

    async fn find_by_id_impl<'e, E>(&self, executor: E, id: MessageId) -> Result<Option<Message>>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let message = sqlx::query_as::<_, Message>(
            r#"
            SELECT id, message_type, namespace, payload, tracking_id, created_at
            FROM messages
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(executor)
        .await?;

        Ok(message)
    }

    /// Fetches a message, failing if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` for unknown ids.
    pub async fn get(&self, id: MessageId) -> Result<Message> {
        self.find_by_id(id).await?.ok_or_else(|| CoreError::not_found(format!("message {id}")))
    }

    /// Records that fan-out for `id` completed with `record_count` records.
    ///
    /// Returns false if a marker already existed.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn mark_fanned_out_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: MessageId,
        record_count: usize,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO message_fanout (message_id, record_count)
            VALUES ($1, $2)
            ON CONFLICT (message_id) DO NOTHING
            "#,
        )
        .bind(id)
        .bind(i32::try_from(record_count).unwrap_or(i32::MAX))
        .execute(&mut **tx)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Locks up to `limit` messages that have no fan-out marker.
    ///
    /// Uses `FOR UPDATE SKIP LOCKED` so concurrent recovery sweeps partition
    /// the backlog instead of blocking each other. The locks are held until
    /// the caller's transaction ends.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn claim_unfanned_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        limit: usize,
    ) -> Result<Vec<Message>> {
        let messages = sqlx::query_as::<_, Message>(
            r#"
            SELECT m.id, m.message_type, m.namespace, m.payload, m.tracking_id, m.created_at
            FROM messages m
            WHERE NOT EXISTS (SELECT 1 FROM message_fanout f WHERE f.message_id = m.id)
            ORDER BY m.id
            LIMIT $1
            FOR UPDATE OF m SKIP LOCKED
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&mut **tx)
        .await?;

        Ok(messages)
    }

    /// Counts messages still waiting for fan-out.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn count_unfanned(&self) -> Result<i64> {
        let count = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM messages m
            WHERE NOT EXISTS (SELECT 1 FROM message_fanout f WHERE f.message_id = m.id)
            "#,
        )
        .fetch_one(&*self.pool)
        .await?;

        Ok(count)
    }
}
