//! Publish path: insert, fan out, commit, then notify.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use pgbus_core::{
    error::Result,
    models::{DeliveryMode, Message, MessageId, NewMessage},
    Storage,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::{
    fanout::{FanOut, FanOutEngine},
    notify::NotifyDriver,
};

/// Answer to a publish call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReceipt {
    /// Assigned id.
    pub message_id: MessageId,
    /// Caller-supplied or generated tracking id.
    pub tracking_id: String,
    /// Assignment timestamp.
    pub created_at: DateTime<Utc>,
    /// Delivery records for the message, by mode.
    pub delivery_stats: BTreeMap<DeliveryMode, i64>,
}

/// Publishes messages.
#[derive(Clone)]
pub struct Publisher {
    storage: Storage,
    fanout: FanOutEngine,
    notify: Option<NotifyDriver>,
}

impl Publisher {
    /// Creates a publisher; pass `None` to skip notifications.
    pub fn new(storage: Storage, notify: Option<NotifyDriver>) -> Self {
        let fanout = FanOutEngine::new(storage.clone());
        Self { storage, fanout, notify }
    }

    /// Stores a message and its delivery records in one transaction.
    ///
    /// Notify-mode subscribers are signalled after commit; a failed signal
    /// does not fail the publish.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for a blank type or namespace, or a store error.
    /// On error nothing is persisted; once the commit succeeds the publish
    /// succeeds.
    #[instrument(
        skip(self, message),
        fields(message_type = %message.message_type, namespace = %message.namespace)
    )]
    pub async fn publish(&self, message: &NewMessage) -> Result<PublishReceipt> {
        message.validate()?;

        let mut tx = self.storage.begin().await?;
        let stored = self.storage.messages.insert_in_tx(&mut tx, message).await?;
        let fan_out = self.fanout.fan_out_in_tx(&mut tx, &stored).await?;
        tx.commit().await?;

        if let Some(notify) = &self.notify {
            notify.broadcast(&fan_out).await;
        }

        let delivery_stats =
            receipt_stats(self.storage.deliveries.stats_for_message(stored.id).await, &fan_out);

        info!(
            message_id = %stored.id,
            tracking_id = %stored.tracking_id,
            records = fan_out.created_count(),
            "message published"
        );

        Ok(PublishReceipt {
            message_id: stored.id,
            tracking_id: stored.tracking_id,
            created_at: stored.created_at,
            delivery_stats,
        })
    }

    /// Fetches a published message.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown id.
    pub async fn get(&self, message_id: MessageId) -> Result<Message> {
        self.storage.messages.get(message_id).await
    }
}

/// Counts from the tracker, or from the fan-out just committed when the
/// stats query fails.
fn receipt_stats(
    stats: Result<BTreeMap<DeliveryMode, i64>>,
    fan_out: &FanOut,
) -> BTreeMap<DeliveryMode, i64> {
    match stats {
        Ok(stats) => stats,
        Err(e) => {
            warn!(
                message_id = %fan_out.message.id,
                error = %e,
                "delivery stats unavailable after commit, using fan-out counts"
            );
            fan_out.created_by_mode()
        },
    }
}

#[cfg(test)]
mod tests {
    use pgbus_core::{
        models::{ClientId, DeliveryTarget, Subscription, SubscriptionId},
        CoreError, Pattern, Predicate,
    };
    use serde_json::json;

    use super::*;

    fn subscription(client: &str, target: DeliveryTarget) -> Subscription {
        Subscription {
            id: SubscriptionId::new(),
            client_id: ClientId::new(client),
            predicate: Predicate::new(Pattern::Any, Pattern::Any),
            target,
            active: true,
            created_at: Utc::now(),
        }
    }

    fn fan_out() -> FanOut {
        FanOut {
            message: Message {
                id: MessageId(7),
                message_type: "order.created".to_string(),
                namespace: "orders".to_string(),
                payload: json!({}),
                tracking_id: "trk-7".to_string(),
                created_at: Utc::now(),
            },
            matched: 3,
            created: vec![
                subscription("a", DeliveryTarget::Pull),
                subscription("b", DeliveryTarget::Pull),
                subscription("c", DeliveryTarget::Push { url: "http://x/hook".to_string() }),
            ],
        }
    }

    #[test]
    fn failed_stats_query_falls_back_to_fan_out_counts() {
        let stats =
            receipt_stats(Err(CoreError::TransientStore("connection reset".into())), &fan_out());

        assert_eq!(stats.get(&DeliveryMode::Pull), Some(&2));
        assert_eq!(stats.get(&DeliveryMode::Push), Some(&1));
        assert_eq!(stats.get(&DeliveryMode::Notify), None);
    }

    #[test]
    fn stored_stats_are_preferred() {
        let stored = BTreeMap::from([(DeliveryMode::Pull, 5)]);

        assert_eq!(receipt_stats(Ok(stored.clone()), &fan_out()), stored);
    }
}
