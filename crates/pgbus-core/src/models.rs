//! Core domain models and strongly-typed identifiers.
//!
//! Defines messages, subscriptions, delivery records and the newtype ID
//! wrappers that keep them apart at compile time. Includes database
//! serialization traits and the delivery status state machine.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use rand::{distr::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Row};
use uuid::Uuid;

use crate::{
    error::{CoreError, Result},
    routing::Predicate,
};

type PgDb = sqlx::Postgres;
type PgRow = sqlx::postgres::PgRow;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    std::result::Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Length of generated tracking ids.
pub const TRACKING_ID_LEN: usize = 11;

/// Longest channel name PostgreSQL accepts for `NOTIFY`.
pub const MAX_CHANNEL_LEN: usize = 63;

/// Strongly-typed message identifier.
///
/// Assigned by the database sequence, so ids grow monotonically in commit
/// order of the inserting transactions' sequence calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId(pub i64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for MessageId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl sqlx::Type<PgDb> for MessageId {
    fn type_info() -> PgTypeInfo {
        <i64 as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for MessageId {
    fn decode(value: PgValueRef<'r>) -> std::result::Result<Self, BoxDynError> {
        let id = <i64 as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(id))
    }
}

impl sqlx::Encode<'_, PgDb> for MessageId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <i64 as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Strongly-typed subscription identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub Uuid);

impl SubscriptionId {
    /// Creates a new random subscription ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for SubscriptionId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for SubscriptionId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for SubscriptionId {
    fn decode(value: PgValueRef<'r>) -> std::result::Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for SubscriptionId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Name of a consuming client.
///
/// Opaque to the engine. Every delivery record and pull/ack call is scoped
/// to one client.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    /// Wraps a client name without validation.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Wraps a client name, rejecting blank input.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Validation` if `id` is empty after trimming.
    pub fn parse(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(CoreError::validation("client_id must not be empty"));
        }
        Ok(Self(id))
    }

    /// Borrows the client name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl sqlx::Type<PgDb> for ClientId {
    fn type_info() -> PgTypeInfo {
        <String as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for ClientId {
    fn decode(value: PgValueRef<'r>) -> std::result::Result<Self, BoxDynError> {
        let id = <String as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(id))
    }
}

impl sqlx::Encode<'_, PgDb> for ClientId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <String as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// How a subscription receives its messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Client polls and acknowledges.
    Pull,
    /// Engine POSTs to a webhook.
    Push,
    /// Engine broadcasts on a `NOTIFY` channel.
    Notify,
}

impl DeliveryMode {
    /// Column value.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pull => "pull",
            Self::Push => "push",
            Self::Notify => "notify",
        }
    }
}

impl fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryMode {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pull" => Ok(Self::Pull),
            "push" => Ok(Self::Push),
            "notify" => Ok(Self::Notify),
            _ => Err(CoreError::validation(format!("unknown delivery mode: {s}"))),
        }
    }
}

impl sqlx::Type<PgDb> for DeliveryMode {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for DeliveryMode {
    fn decode(value: PgValueRef<'r>) -> std::result::Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        s.parse().map_err(|_| format!("invalid delivery mode: {s}").into())
    }
}

/// Delivery record state.
///
/// ```text
/// new -> in_flight -> delivered
///  |        |  \-> new       (lease released or expired, push retry)
///  |        \-> failed       (push attempts exhausted)
///  \-> delivered             (ack without dequeue)
/// failed -> new              (operator requeue)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Waiting to be claimed.
    New,

    /// Leased to a consumer or push worker.
    ///
    /// Reverts to `New` when the lease expires or is released.
    InFlight,

    /// Acknowledged. Terminal.
    Delivered,

    /// Push attempts exhausted.
    ///
    /// Terminal for automation; only an operator requeue leaves it.
    Failed,
}

impl DeliveryStatus {
    /// Column value.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::InFlight => "in_flight",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
        }
    }

    /// Returns true if `self -> next` is a legal transition.
    pub const fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::New, Self::InFlight)
                | (Self::New, Self::Delivered)
                | (Self::InFlight, Self::Delivered)
                | (Self::InFlight, Self::New)
                | (Self::InFlight, Self::Failed)
                | (Self::Failed, Self::New)
        )
    }

    /// Returns true for states no automated path leaves.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Delivered | Self::Failed)
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl sqlx::Type<PgDb> for DeliveryStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for DeliveryStatus {
    fn decode(value: PgValueRef<'r>) -> std::result::Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        match s {
            "new" => Ok(Self::New),
            "in_flight" => Ok(Self::InFlight),
            "delivered" => Ok(Self::Delivered),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("invalid delivery status: {s}").into()),
        }
    }
}

/// Published message. Never mutated after insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Message {
    /// Sequence-assigned identifier.
    pub id: MessageId,

    /// Message class, e.g. `order.created`.
    #[serde(rename = "type")]
    pub message_type: String,

    /// Grouping axis, e.g. `billing`.
    pub namespace: String,

    /// Opaque JSON document.
    pub payload: serde_json::Value,

    /// Publisher-supplied or generated correlation id.
    pub tracking_id: String,

    /// Assignment timestamp.
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Wire form sent to webhooks and listeners.
    pub fn envelope(&self) -> MessageEnvelope {
        MessageEnvelope {
            id: self.id,
            message_type: self.message_type.clone(),
            namespace: self.namespace.clone(),
            payload: self.payload.clone(),
        }
    }
}

/// Input for publishing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMessage {
    /// Message class.
    #[serde(rename = "type")]
    pub message_type: String,

    /// Grouping axis.
    pub namespace: String,

    /// Opaque JSON document.
    #[serde(default)]
    pub payload: serde_json::Value,

    /// Optional caller-chosen tracking id.
    #[serde(default)]
    pub tracking_id: Option<String>,
}

impl NewMessage {
    /// Creates a message without a tracking id.
    pub fn new(
        message_type: impl Into<String>,
        namespace: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            message_type: message_type.into(),
            namespace: namespace.into(),
            payload,
            tracking_id: None,
        }
    }

    /// Sets a caller-chosen tracking id.
    #[must_use]
    pub fn with_tracking_id(mut self, tracking_id: impl Into<String>) -> Self {
        self.tracking_id = Some(tracking_id.into());
        self
    }

    /// Checks the fields the store cannot accept.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Validation` for a blank type, namespace or
    /// tracking id.
    pub fn validate(&self) -> Result<()> {
        if self.message_type.trim().is_empty() {
            return Err(CoreError::validation("message type must not be empty"));
        }
        if self.namespace.trim().is_empty() {
            return Err(CoreError::validation("namespace must not be empty"));
        }
        if self.tracking_id.as_deref().is_some_and(|t| t.trim().is_empty()) {
            return Err(CoreError::validation("tracking_id must not be blank when supplied"));
        }
        Ok(())
    }
}

/// JSON body delivered to webhooks and notify listeners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// Message id, stable across retries.
    pub id: MessageId,
    /// Message class.
    #[serde(rename = "type")]
    pub message_type: String,
    /// Grouping axis.
    pub namespace: String,
    /// Opaque JSON document.
    pub payload: serde_json::Value,
}

/// Mode-specific delivery configuration of a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DeliveryTarget {
    /// Client pulls.
    Pull,
    /// POST to `url`.
    Push {
        /// Webhook URL.
        url: String,
    },
    /// `NOTIFY` on `channel`.
    Notify {
        /// Channel name.
        channel: String,
    },
}

impl DeliveryTarget {
    /// Delivery mode this target implies.
    pub const fn mode(&self) -> DeliveryMode {
        match self {
            Self::Pull => DeliveryMode::Pull,
            Self::Push { .. } => DeliveryMode::Push,
            Self::Notify { .. } => DeliveryMode::Notify,
        }
    }

    /// Webhook URL for push targets.
    pub fn webhook_url(&self) -> Option<&str> {
        match self {
            Self::Push { url } => Some(url),
            _ => None,
        }
    }

    /// Channel for notify targets.
    pub fn notify_channel(&self) -> Option<&str> {
        match self {
            Self::Notify { channel } => Some(channel),
            _ => None,
        }
    }

    /// Rebuilds a target from the subscription columns.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the mode config column is missing.
    pub fn from_columns(
        mode: DeliveryMode,
        webhook_url: Option<String>,
        notify_channel: Option<String>,
    ) -> Result<Self> {
        match mode {
            DeliveryMode::Pull => Ok(Self::Pull),
            DeliveryMode::Push => webhook_url
                .map(|url| Self::Push { url })
                .ok_or_else(|| CoreError::Database("push subscription without webhook_url".into())),
            DeliveryMode::Notify => notify_channel
                .map(|channel| Self::Notify { channel })
                .ok_or_else(|| {
                    CoreError::Database("notify subscription without notify_channel".into())
                }),
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            Self::Pull => Ok(()),
            Self::Push { url } if url.trim().is_empty() => {
                Err(CoreError::validation("webhook_url must not be empty"))
            },
            Self::Push { .. } => Ok(()),
            Self::Notify { channel } if channel.trim().is_empty() => {
                Err(CoreError::validation("notify_channel must not be empty"))
            },
            Self::Notify { channel } if channel.len() > MAX_CHANNEL_LEN => Err(
                CoreError::validation(format!("notify_channel exceeds {MAX_CHANNEL_LEN} bytes")),
            ),
            Self::Notify { .. } => Ok(()),
        }
    }
}

/// A client's standing request for a class of messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    /// Unique identifier.
    pub id: SubscriptionId,
    /// Subscribing client.
    pub client_id: ClientId,
    /// Which messages match.
    pub predicate: Predicate,
    /// How matches are delivered.
    pub target: DeliveryTarget,
    /// Inactive subscriptions are ignored by fan-out.
    pub active: bool,
    /// Creation time, used to break precedence ties.
    pub created_at: DateTime<Utc>,
}

impl Subscription {
    /// Delivery mode of this subscription.
    pub const fn mode(&self) -> DeliveryMode {
        self.target.mode()
    }
}

/// Input for registering a subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSubscription {
    /// Subscribing client.
    pub client_id: ClientId,
    /// Which messages match.
    pub predicate: Predicate,
    /// How matches are delivered.
    pub target: DeliveryTarget,
}

impl NewSubscription {
    /// Creates a subscription request.
    pub fn new(client_id: ClientId, predicate: Predicate, target: DeliveryTarget) -> Self {
        Self { client_id, predicate, target }
    }

    /// Validates client, predicate and target.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Validation` for the first invalid field.
    pub fn validate(&self) -> Result<()> {
        ClientId::parse(self.client_id.as_str())?;
        self.predicate.validate()?;
        self.target.validate()
    }
}

/// Natural key of a delivery record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeliveryKey {
    /// Message being delivered.
    pub message_id: MessageId,
    /// Receiving client.
    pub client_id: ClientId,
    /// Partition owned by one driver.
    pub mode: DeliveryMode,
}

/// Durable delivery obligation for one `(message, client, mode)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct DeliveryRecord {
    /// Message being delivered.
    pub message_id: MessageId,
    /// Receiving client.
    pub client_id: ClientId,
    /// Subscription that produced this record.
    pub subscription_id: SubscriptionId,
    /// Driver partition.
    pub delivery_mode: DeliveryMode,
    /// Current state.
    pub status: DeliveryStatus,
    /// Push attempts made so far.
    pub attempts: i32,
    /// When an `in_flight` lease lapses.
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Earliest time a push retry may be claimed.
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Acknowledgment time.
    pub delivered_at: Option<DateTime<Utc>>,
    /// Most recent failure description.
    pub last_error: Option<String>,
    /// Fan-out time.
    pub created_at: DateTime<Utc>,
    /// Last transition time.
    pub updated_at: DateTime<Utc>,
}

impl DeliveryRecord {
    /// Natural key of this record.
    pub fn key(&self) -> DeliveryKey {
        DeliveryKey {
            message_id: self.message_id,
            client_id: self.client_id.clone(),
            mode: self.delivery_mode,
        }
    }
}

/// A claimed record together with its message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    /// Message content.
    pub message: Message,
    /// Tracker state at claim time.
    pub record: DeliveryRecord,
}

impl<'r> FromRow<'r, PgRow> for Delivery {
    fn from_row(row: &'r PgRow) -> sqlx::Result<Self> {
        let record = DeliveryRecord::from_row(row)?;
        let message = Message {
            id: record.message_id,
            message_type: row.try_get("message_type")?,
            namespace: row.try_get("namespace")?,
            payload: row.try_get("payload")?,
            tracking_id: row.try_get("tracking_id")?,
            created_at: row.try_get("message_created_at")?,
        };
        Ok(Self { message, record })
    }
}

/// A claimed push record with its destination.
#[derive(Debug, Clone, PartialEq)]
pub struct PushDelivery {
    /// Message and record.
    pub delivery: Delivery,
    /// Destination URL from the subscription.
    pub webhook_url: String,
}

impl PushDelivery {
    /// Natural key of the underlying record.
    pub fn key(&self) -> DeliveryKey {
        self.delivery.record.key()
    }
}

impl<'r> FromRow<'r, PgRow> for PushDelivery {
    fn from_row(row: &'r PgRow) -> sqlx::Result<Self> {
        Ok(Self { delivery: Delivery::from_row(row)?, webhook_url: row.try_get("webhook_url")? })
    }
}

/// Generates a tracking id from the thread-local CSPRNG.
pub fn generate_tracking_id() -> String {
    rand::rng().sample_iter(&Alphanumeric).take(TRACKING_ID_LEN).map(char::from).collect()
}
