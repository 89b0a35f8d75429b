//! Fan-out engine.
//!
//! Turns one message into one `new` delivery record per matching
//! subscription. Record creation is `ON CONFLICT DO NOTHING` on the natural
//! key, so running fan-out again for the same message never duplicates
//! records. A `message_fanout` marker row written in the same transaction
//! tells the recovery sweep which messages are done.

use std::collections::BTreeMap;

use pgbus_core::{
    error::Result,
    models::{DeliveryMode, Message, MessageId, Subscription},
    CoreError, Storage,
};
use sqlx::{Postgres, Transaction};
use tracing::{debug, info, instrument};

/// Result of fanning out one message.
#[derive(Debug, Clone, PartialEq)]
pub struct FanOut {
    /// The message fanned out.
    pub message: Message,
    /// Subscriptions that survived precedence.
    pub matched: usize,
    /// Subscriptions whose record was created by this run.
    pub created: Vec<Subscription>,
}

impl FanOut {
    /// Number of records created by this run.
    pub fn created_count(&self) -> usize {
        self.created.len()
    }

    /// Records created by this run, by delivery mode.
    pub fn created_by_mode(&self) -> BTreeMap<DeliveryMode, i64> {
        let mut counts = BTreeMap::new();
        for subscription in &self.created {
            *counts.entry(subscription.mode()).or_insert(0) += 1;
        }
        counts
    }

    /// Newly created notify-mode subscriptions, for broadcast after commit.
    pub fn notify_targets(&self) -> impl Iterator<Item = &Subscription> {
        self.created.iter().filter(|s| s.mode() == DeliveryMode::Notify)
    }
}

/// Materializes delivery records for published messages.
#[derive(Clone)]
pub struct FanOutEngine {
    storage: Storage,
}

impl FanOutEngine {
    /// Creates an engine over `storage`.
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    /// Fans out a stored message in its own transaction.
    ///
    /// Returns the number of records created; zero when every matching
    /// record already exists.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown id, or a store error.
    #[instrument(skip(self, message_id), fields(message_id = %message_id))]
    pub async fn fan_out(&self, message_id: MessageId) -> Result<usize> {
        let mut tx = self.storage.begin().await?;
        let message = self
            .storage
            .messages
            .find_by_id_in_tx(&mut tx, message_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("message {message_id}")))?;

        let fan_out = self.fan_out_in_tx(&mut tx, &message).await?;
        tx.commit().await?;

        Ok(fan_out.created_count())
    }

    /// Fans out `message` inside the caller's transaction.
    ///
    /// Nothing is visible until the caller commits.
    ///
    /// # Errors
    ///
    /// Returns error if matching or record creation fails.
    pub async fn fan_out_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        message: &Message,
    ) -> Result<FanOut> {
        let matched = self
            .storage
            .subscriptions
            .match_subscriptions_in_tx(tx, &message.message_type, &message.namespace)
            .await?;

        let mut created = Vec::new();
        for subscription in &matched {
            if self.storage.deliveries.create_if_absent_in_tx(tx, message.id, subscription).await? {
                created.push(subscription.clone());
            }
        }

        self.storage.messages.mark_fanned_out_in_tx(tx, message.id, matched.len()).await?;

        debug!(
            message_id = %message.id,
            matched = matched.len(),
            created = created.len(),
            "fanned out message"
        );

        Ok(FanOut { message: message.clone(), matched: matched.len(), created })
    }

    /// Fans out up to `limit` messages that have no fan-out marker.
    ///
    /// Covers messages inserted without fan-out (for example by a crashed
    /// publisher using a separate insert). Messages are locked with
    /// `SKIP LOCKED`, so concurrent sweeps take disjoint sets.
    ///
    /// # Errors
    ///
    /// Returns error if the sweep transaction fails; no partial results are
    /// committed.
    pub async fn recover(&self, limit: usize) -> Result<Vec<FanOut>> {
        let mut tx = self.storage.begin().await?;
        let pending = self.storage.messages.claim_unfanned_in_tx(&mut tx, limit).await?;
        if pending.is_empty() {
            return Ok(Vec::new());
        }

        let mut recovered = Vec::with_capacity(pending.len());
        for message in &pending {
            recovered.push(self.fan_out_in_tx(&mut tx, message).await?);
        }
        tx.commit().await?;

        info!(
            messages = recovered.len(),
            records = recovered.iter().map(FanOut::created_count).sum::<usize>(),
            "recovered pending fan-out"
        );
        Ok(recovered)
    }
}
