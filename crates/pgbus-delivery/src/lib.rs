//! Fan-out and delivery drivers for pgbus.
//!
//! A published message is inserted and fanned out in one transaction: one
//! `new` delivery record is created per matching subscription, after the
//! predicate precedence rules pick a single subscription per client. The
//! drivers then move those records through the tracker's state machine:
//!
//! - **Pull** - consumers lease batches with `FOR UPDATE SKIP LOCKED`, so
//!   competing consumers never see the same record, and acknowledge them.
//! - **Push** - a worker pool claims due records and POSTs them to the
//!   subscriber's webhook with exponential backoff and a bounded number of
//!   attempts.
//! - **Notify** - a `pg_notify` hint is sent after commit; listeners
//!   reconcile through the same lease and acknowledge path as pull.
//!
//! A maintenance loop returns expired leases to `new` and fans out messages
//! that were stored without fan-out.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use pgbus_core::{RealClock, Storage};
//! use pgbus_delivery::{DeliveryConfig, DeliveryEngine, DeliveryError};
//! use sqlx::PgPool;
//!
//! # async fn example(pool: PgPool) -> std::result::Result<(), DeliveryError> {
//! let storage = Arc::new(Storage::new(pool));
//! let mut engine =
//!     DeliveryEngine::new(storage, DeliveryConfig::default(), Arc::new(RealClock::new()))?;
//!
//! engine.start().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod client;
pub mod error;
pub mod fanout;
pub mod maintenance;
pub mod notify;
pub mod publisher;
pub mod pull;
pub mod push;
pub mod retry;
pub mod storage;
pub mod worker;
mod worker_pool;

pub use client::{ClientConfig, PushClient};
pub use error::{DeliveryError, Result};
pub use fanout::{FanOut, FanOutEngine};
pub use maintenance::{Maintenance, MaintenanceConfig, MaintenanceReport};
pub use notify::{NotifyDriver, NotifyEvent, NotifyListener, NOTIFY_PAYLOAD_LIMIT};
pub use publisher::{PublishReceipt, Publisher};
pub use pull::{Lease, PullConfig, PullDriver};
pub use push::{PushDriver, PushOutcome};
pub use retry::{RetryPolicy, StoreRetry};
pub use worker::{DeliveryConfig, DeliveryEngine, EngineStats};

/// Default number of concurrent push workers.
pub const DEFAULT_WORKER_COUNT: usize = 4;

/// Default batch size for claims and dequeues.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Default push request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 10;
