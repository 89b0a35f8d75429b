//! Builders for subscriptions and messages.

use std::sync::atomic::{AtomicU64, Ordering};

use pgbus_core::{
    models::{ClientId, DeliveryTarget, NewMessage, NewSubscription},
    routing::{Pattern, Predicate},
};
use serde_json::{json, Value};

static MESSAGE_SEQ: AtomicU64 = AtomicU64::new(0);

/// Builder for [`NewSubscription`]. Defaults to a pull subscription matching
/// every message.
#[derive(Debug, Clone)]
pub struct SubscriptionBuilder {
    client_id: String,
    message_type: Pattern,
    namespace: Pattern,
    target: DeliveryTarget,
}

impl SubscriptionBuilder {
    /// Starts a subscription for `client_id`.
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            message_type: Pattern::Any,
            namespace: Pattern::Any,
            target: DeliveryTarget::Pull,
        }
    }

    /// Only messages of this type.
    #[must_use]
    pub fn message_type(mut self, message_type: impl Into<String>) -> Self {
        self.message_type = Pattern::exact(message_type);
        self
    }

    /// Messages of any of these types.
    #[must_use]
    pub fn message_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.message_type = Pattern::one_of(types);
        self
    }

    /// Only messages in this namespace.
    #[must_use]
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Pattern::exact(namespace);
        self
    }

    /// Messages in any of these namespaces.
    #[must_use]
    pub fn namespaces<I, S>(mut self, namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.namespace = Pattern::one_of(namespaces);
        self
    }

    /// Pull delivery.
    #[must_use]
    pub fn pull(mut self) -> Self {
        self.target = DeliveryTarget::Pull;
        self
    }

    /// Webhook delivery to `url`.
    #[must_use]
    pub fn push(mut self, url: impl Into<String>) -> Self {
        self.target = DeliveryTarget::Push { url: url.into() };
        self
    }

    /// `NOTIFY` delivery on `channel`.
    #[must_use]
    pub fn notify(mut self, channel: impl Into<String>) -> Self {
        self.target = DeliveryTarget::Notify { channel: channel.into() };
        self
    }

    /// Builds the subscription request.
    pub fn build(self) -> NewSubscription {
        NewSubscription::new(
            ClientId::new(self.client_id),
            Predicate::new(self.message_type, self.namespace),
            self.target,
        )
    }
}

/// Builder for [`NewMessage`] with unique default payloads.
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    message_type: String,
    namespace: String,
    payload: Option<Value>,
    tracking_id: Option<String>,
}

impl Default for MessageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBuilder {
    /// Starts a `test.event` message in namespace `default`.
    pub fn new() -> Self {
        Self {
            message_type: "test.event".to_string(),
            namespace: "default".to_string(),
            payload: None,
            tracking_id: None,
        }
    }

    /// Sets the message type.
    #[must_use]
    pub fn message_type(mut self, message_type: impl Into<String>) -> Self {
        self.message_type = message_type.into();
        self
    }

    /// Sets the namespace.
    #[must_use]
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Sets the payload.
    #[must_use]
    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Sets a payload of roughly `bytes` bytes.
    #[must_use]
    pub fn large_payload(mut self, bytes: usize) -> Self {
        self.payload = Some(json!({ "blob": "x".repeat(bytes) }));
        self
    }

    /// Sets the tracking id.
    #[must_use]
    pub fn tracking_id(mut self, tracking_id: impl Into<String>) -> Self {
        self.tracking_id = Some(tracking_id.into());
        self
    }

    /// Builds the message request.
    pub fn build(self) -> NewMessage {
        let payload = self
            .payload
            .unwrap_or_else(|| json!({ "seq": MESSAGE_SEQ.fetch_add(1, Ordering::Relaxed) }));
        let message = NewMessage::new(self.message_type, self.namespace, payload);
        match self.tracking_id {
            Some(tracking_id) => message.with_tracking_id(tracking_id),
            None => message,
        }
    }
}
