//! Notify driver: best-effort pub/sub over PostgreSQL `NOTIFY`.
//!
//! A notification is a latency hint. It is sent after the publishing
//! transaction commits, may be lost, and never changes a record's status.
//! Listeners reconcile through [`NotifyDriver::pending`] and
//! [`NotifyDriver::ack`], which use the same lease semantics as pull.

use std::time::Duration;

use pgbus_core::{
    error::Result,
    models::{ClientId, Delivery, DeliveryKey, DeliveryMode, Message, MessageEnvelope, MessageId},
    Storage,
};
use serde::{Deserialize, Serialize};
use sqlx::{postgres::PgListener, PgPool};
use tracing::{debug, warn};

use crate::{fanout::FanOut, retry::StoreRetry};

/// Largest body sent with `pg_notify`; PostgreSQL rejects 8000 bytes and up.
pub const NOTIFY_PAYLOAD_LIMIT: usize = 7900;

/// Body of one notification.
///
/// `payload` is omitted and `truncated` set when the full body would exceed
/// the limit; listeners then fetch the message by id. If the body is still
/// too large, `type` and `namespace` are dropped as well.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotifyEvent {
    /// Message id.
    pub id: MessageId,
    /// Message class, empty in the minimal truncated form.
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub message_type: String,
    /// Grouping axis, empty in the minimal truncated form.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    /// Message payload, absent when truncated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    /// Set when `payload` was dropped for size.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub truncated: bool,
}

impl NotifyEvent {
    /// Full event for `message`.
    pub fn from_message(message: &Message) -> Self {
        Self {
            id: message.id,
            message_type: message.message_type.clone(),
            namespace: message.namespace.clone(),
            payload: Some(message.payload.clone()),
            truncated: false,
        }
    }

    /// Serializes the event, dropping the payload if the body exceeds `limit`
    /// and then `type` and `namespace` if it still does.
    ///
    /// # Errors
    ///
    /// Returns error if the payload cannot be serialized.
    pub fn encode(message: &Message, limit: usize) -> serde_json::Result<String> {
        let full = serde_json::to_string(&Self::from_message(message))?;
        if full.len() <= limit {
            return Ok(full);
        }

        let truncated = Self { payload: None, truncated: true, ..Self::from_message(message) };
        let body = serde_json::to_string(&truncated)?;
        if body.len() <= limit {
            return Ok(body);
        }

        let minimal = Self {
            message_type: String::new(),
            namespace: String::new(),
            ..truncated
        };
        serde_json::to_string(&minimal)
    }

    /// Envelope when the payload was included.
    pub fn envelope(&self) -> Option<MessageEnvelope> {
        match (&self.payload, self.truncated) {
            (Some(payload), false) => Some(MessageEnvelope {
                id: self.id,
                message_type: self.message_type.clone(),
                namespace: self.namespace.clone(),
                payload: payload.clone(),
            }),
            _ => None,
        }
    }
}

/// Sends notifications and serves listener reconciliation.
#[derive(Clone)]
pub struct NotifyDriver {
    storage: Storage,
    payload_limit: usize,
    lease_timeout: Duration,
    retry: StoreRetry,
}

impl NotifyDriver {
    /// Creates a driver; `lease_timeout` applies to [`Self::pending`].
    pub fn new(storage: Storage, lease_timeout: Duration) -> Self {
        Self {
            storage,
            payload_limit: NOTIFY_PAYLOAD_LIMIT,
            lease_timeout,
            retry: StoreRetry::default(),
        }
    }

    /// Overrides the body size limit.
    #[must_use]
    pub fn with_payload_limit(mut self, payload_limit: usize) -> Self {
        self.payload_limit = payload_limit.min(NOTIFY_PAYLOAD_LIMIT);
        self
    }

    /// Issues `pg_notify(channel, body)`.
    ///
    /// # Errors
    ///
    /// Returns error if the statement fails, for example on an over-long
    /// body or a lost connection.
    pub async fn notify(&self, channel: &str, body: &str) -> Result<()> {
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(channel)
            .bind(body)
            .execute(self.storage.pool())
            .await?;
        Ok(())
    }

    /// Notifies every notify-mode record created by a fan-out.
    ///
    /// Failures are logged and stored in the record's `last_error`; the
    /// record stays `new`. Returns the number of notifications sent.
    pub async fn broadcast(&self, fan_out: &FanOut) -> usize {
        let body = match NotifyEvent::encode(&fan_out.message, self.payload_limit) {
            Ok(body) => body,
            Err(error) => {
                warn!(
                    message_id = %fan_out.message.id,
                    error = %error,
                    "failed to encode notify event"
                );
                return 0;
            },
        };

        let mut sent = 0;
        for subscription in fan_out.notify_targets() {
            let Some(channel) = subscription.target.notify_channel() else {
                continue;
            };

            match self.notify(channel, &body).await {
                Ok(()) => {
                    sent += 1;
                    debug!(
                        message_id = %fan_out.message.id,
                        client_id = %subscription.client_id,
                        channel,
                        "notification sent"
                    );
                },
                Err(error) => {
                    warn!(
                        message_id = %fan_out.message.id,
                        client_id = %subscription.client_id,
                        channel,
                        error = %error,
                        "notification failed"
                    );
                    let key = DeliveryKey {
                        message_id: fan_out.message.id,
                        client_id: subscription.client_id.clone(),
                        mode: DeliveryMode::Notify,
                    };
                    let text = format!("notify failed: {error}");
                    if let Err(store_error) =
                        self.storage.deliveries.record_error(&key, &text).await
                    {
                        warn!(error = %store_error, "failed to record notify error");
                    }
                },
            }
        }
        sent
    }

    /// Leases up to `batch_size` of a client's unacknowledged notify records.
    ///
    /// # Errors
    ///
    /// Returns error once transient store failures exhaust their retries.
    pub async fn pending(&self, client_id: &ClientId, batch_size: usize) -> Result<Vec<Delivery>> {
        self.retry
            .run("notify_pending", || {
                self.storage.deliveries.claim(
                    client_id,
                    DeliveryMode::Notify,
                    batch_size,
                    self.lease_timeout,
                )
            })
            .await
    }

    /// Marks a client's notify records delivered.
    ///
    /// # Errors
    ///
    /// Returns error once transient store failures exhaust their retries.
    pub async fn ack(&self, client_id: &ClientId, message_ids: &[MessageId]) -> Result<u64> {
        self.retry
            .run("notify_ack", || {
                self.storage.deliveries.mark_delivered(client_id, DeliveryMode::Notify, message_ids)
            })
            .await
    }
}

/// A decoded notification and the channel it arrived on.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedEvent {
    /// Channel name.
    pub channel: String,
    /// Decoded body.
    pub event: NotifyEvent,
}

/// Listening half: a dedicated connection subscribed to channels.
pub struct NotifyListener {
    listener: PgListener,
    storage: Storage,
}

impl NotifyListener {
    /// Opens a listener connection from `pool` and subscribes to `channels`.
    ///
    /// # Errors
    ///
    /// Returns error if the connection or `LISTEN` fails.
    pub async fn connect(pool: &PgPool, storage: Storage, channels: &[&str]) -> Result<Self> {
        let mut listener = PgListener::connect_with(pool).await?;
        listener.listen_all(channels.iter().copied()).await?;
        debug!(?channels, "listening for notifications");
        Ok(Self { listener, storage })
    }

    /// Waits for the next decodable event.
    ///
    /// Bodies that are not notify events are logged and skipped. After a
    /// lost connection the listener reconnects; notifications sent in the
    /// gap are lost, so callers reconcile with [`NotifyDriver::pending`].
    ///
    /// # Errors
    ///
    /// Returns error if the connection fails and cannot be re-established.
    pub async fn recv(&mut self) -> Result<ReceivedEvent> {
        loop {
            let notification = self.listener.recv().await?;
            match serde_json::from_str::<NotifyEvent>(notification.payload()) {
                Ok(event) => {
                    return Ok(ReceivedEvent { channel: notification.channel().to_string(), event });
                },
                Err(error) => {
                    warn!(
                        channel = notification.channel(),
                        error = %error,
                        "skipping undecodable notification"
                    );
                },
            }
        }
    }

    /// Full envelope for an event, fetching the message when truncated.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the message does not exist.
    pub async fn resolve(&self, event: &NotifyEvent) -> Result<MessageEnvelope> {
        if let Some(envelope) = event.envelope() {
            return Ok(envelope);
        }
        Ok(self.storage.messages.get(event.id).await?.envelope())
    }
}
