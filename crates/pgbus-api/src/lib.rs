//! pgbus HTTP API.
//!
//! Exposes publish, message lookup, pull dequeue/ack/release and the
//! operator requeue over JSON, plus the figment-based service
//! configuration shared with the binary.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::sync::Arc;

use pgbus_core::{Clock, Storage};
use pgbus_delivery::{NotifyDriver, Publisher, PullConfig, PullDriver};

pub mod config;
pub mod error;
pub mod handlers;
pub mod server;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use server::{create_router, shutdown_signal, start_server};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    /// Repositories.
    pub storage: Storage,
    /// Publish path.
    pub publisher: Publisher,
    /// Pull driver.
    pub pull: PullDriver,
    /// Time source for health reports.
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    /// Wires the publisher and pull driver over `storage`.
    ///
    /// Pass `None` for `notify` to publish without `pg_notify` hints.
    pub fn new(
        storage: Storage,
        notify: Option<NotifyDriver>,
        pull_config: PullConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            publisher: Publisher::new(storage.clone(), notify),
            pull: PullDriver::new(storage.clone(), pull_config),
            storage,
            clock,
        }
    }
}
