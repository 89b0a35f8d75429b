//! Core domain models, storage and error types for pgbus.
//!
//! Provides strongly-typed identifiers, the subscription predicate algebra,
//! the delivery status state machine and the PostgreSQL repositories that
//! every other crate goes through. Nothing here talks HTTP.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod routing;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use models::{
    generate_tracking_id, ClientId, Delivery, DeliveryKey, DeliveryMode, DeliveryRecord,
    DeliveryStatus, DeliveryTarget, Message, MessageEnvelope, MessageId, NewMessage,
    NewSubscription, PushDelivery, Subscription, SubscriptionId,
};
pub use routing::{Pattern, Predicate};
pub use storage::Storage;
pub use time::{Clock, RealClock, TestClock};
