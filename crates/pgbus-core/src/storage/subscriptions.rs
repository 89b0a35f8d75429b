//! Repository for the subscription registry.
//!
//! Predicates are stored as nullable `TEXT[]` columns so PostgreSQL can
//! pre-filter candidates with `= ANY(...)`. Precedence between candidates is
//! resolved by [`crate::routing::select_matches`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{Executor, PgPool, Postgres, Transaction};
use tracing::warn;

use crate::{
    error::Result,
    models::{
        ClientId, DeliveryMode, DeliveryTarget, NewSubscription, Subscription, SubscriptionId,
    },
    routing::{self, Pattern, Predicate},
};

const SUBSCRIPTION_COLUMNS: &str = "id, client_id, message_types, namespaces, delivery_mode, \
                                    webhook_url, notify_channel, active, created_at";

#[derive(sqlx::FromRow)]
struct SubscriptionRow {
    id: SubscriptionId,
    client_id: ClientId,
    message_types: Option<Vec<String>>,
    namespaces: Option<Vec<String>>,
    delivery_mode: DeliveryMode,
    webhook_url: Option<String>,
    notify_channel: Option<String>,
    active: bool,
    created_at: DateTime<Utc>,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = crate::error::CoreError;

    fn try_from(row: SubscriptionRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            client_id: row.client_id,
            predicate: Predicate::new(
                Pattern::from_column(row.message_types),
                Pattern::from_column(row.namespaces),
            ),
            target: DeliveryTarget::from_columns(
                row.delivery_mode,
                row.webhook_url,
                row.notify_channel,
            )?,
            active: row.active,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct UpsertRow {
    #[sqlx(flatten)]
    subscription: SubscriptionRow,
    previous_mode: Option<DeliveryMode>,
}

fn into_subscriptions(rows: Vec<SubscriptionRow>) -> Result<Vec<Subscription>> {
    rows.into_iter().map(Subscription::try_from).collect()
}

/// Repository for subscription rows.
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

    /// Registers a subscription or updates the active one with the same
    /// client and predicate.
    ///
    /// Updating keeps the row's id and `created_at`, so its precedence
    /// position is stable.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Validation` for invalid input, or a store error.
    pub async fn upsert(&self, subscription: &NewSubscription) -> Result<Subscription> {
        Ok(self.upsert_replacing(subscription).await?.0)
    }

    /// Like [`Self::upsert`], also returning the delivery mode of the row it
    /// replaced, if any.
    ///
    /// A mode change on an existing row is logged as a warning: records
    /// created from now on use the new mode.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Validation` for invalid input, or a store error.
    pub async fn upsert_replacing(
        &self,
        subscription: &NewSubscription,
    ) -> Result<(Subscription, Option<DeliveryMode>)> {
        subscription.validate()?;

        let query = format!(
            r#"
            WITH previous AS (
                SELECT delivery_mode
                FROM subscriptions
                WHERE client_id = $2 AND predicate_key = $5 AND active
            )
            INSERT INTO subscriptions (
                id, client_id, message_types, namespaces, predicate_key,
                delivery_mode, webhook_url, notify_channel
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (client_id, predicate_key) WHERE active
            DO UPDATE SET delivery_mode = EXCLUDED.delivery_mode,
                          webhook_url = EXCLUDED.webhook_url,
                          notify_channel = EXCLUDED.notify_channel,
                          updated_at = clock_timestamp()
            RETURNING {SUBSCRIPTION_COLUMNS},
                      (SELECT delivery_mode FROM previous) AS previous_mode
            "#
        );

        let row = sqlx::query_as::<_, UpsertRow>(&query)
            .bind(SubscriptionId::new())
            .bind(&subscription.client_id)
            .bind(subscription.predicate.message_type.to_column())
            .bind(subscription.predicate.namespace.to_column())
            .bind(subscription.predicate.canonical_key())
            .bind(subscription.target.mode().as_str())
            .bind(subscription.target.webhook_url())
            .bind(subscription.target.notify_channel())
            .fetch_one(&*self.pool)
            .await?;

        let previous_mode = row.previous_mode;
        let stored = Subscription::try_from(row.subscription)?;
        if let Some(previous) = previous_mode.filter(|previous| *previous != stored.mode()) {
            warn!(
                subscription_id = %stored.id,
                client_id = %stored.client_id,
                previous_mode = %previous,
                mode = %stored.mode(),
                "subscription delivery mode changed"
            );
        }

        Ok((stored, previous_mode))
    }

    /// Deactivates a subscription. Existing delivery records are kept.
    ///
    /// Returns false if the subscription was unknown or already inactive.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn deactivate(&self, id: SubscriptionId) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions
            SET active = FALSE, updated_at = clock_timestamp()
            WHERE id = $1 AND active
            "#,
        )
        .bind(id)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Finds a subscription by id.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, id: SubscriptionId) -> Result<Option<Subscription>> {
        let query = format!("SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE id = $1");
        let row = sqlx::query_as::<_, SubscriptionRow>(&query)
            .bind(id)
            .fetch_optional(&*self.pool)
            .await?;

        row.map(Subscription::try_from).transpose()
    }

    /// Lists a client's subscriptions, oldest first.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn list_for_client(&self, client_id: &ClientId) -> Result<Vec<Subscription>> {
        let query = format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions \
             WHERE client_id = $1 ORDER BY created_at, id"
        );
        let rows = sqlx::query_as::<_, SubscriptionRow>(&query)
            .bind(client_id)
            .fetch_all(&*self.pool)
            .await?;

        into_subscriptions(rows)
    }

    /// Returns the subscriptions that should receive a message of this class.
    ///
    /// At most one subscription per `(client_id, delivery_mode)`, ordered by
    /// that pair. Deterministic for a given registry snapshot.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn match_subscriptions(
        &self,
        message_type: &str,
        namespace: &str,
    ) -> Result<Vec<Subscription>> {
        self.match_impl(&*self.pool, message_type, namespace).await
    }

    /// Same as [`Self::match_subscriptions`] inside a transaction.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn match_subscriptions_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        message_type: &str,
        namespace: &str,
    ) -> Result<Vec<Subscription>> {
        self.match_impl(&mut **tx, message_type, namespace).await
    }

    async fn match_impl<'e, E>(
        &self,
        executor: E,
        message_type: &str,
        namespace: &str,
    ) -> Result<Vec<Subscription>>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let query = format!(
            r#"
            SELECT {SUBSCRIPTION_COLUMNS}
            FROM subscriptions
            WHERE active
              AND (message_types IS NULL OR $1 = ANY(message_types))
              AND (namespaces IS NULL OR $2 = ANY(namespaces))
            ORDER BY client_id, delivery_mode, created_at, id
            "#
        );
        let rows = sqlx::query_as::<_, SubscriptionRow>(&query)
            .bind(message_type)
            .bind(namespace)
            .fetch_all(executor)
            .await?;

        Ok(routing::select_matches(into_subscriptions(rows)?, message_type, namespace))
    }
}
