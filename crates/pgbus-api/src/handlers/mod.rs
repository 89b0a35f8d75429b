//! Request handlers.
//!
//! Handlers take their dependencies from [`AppState`](crate::AppState) and
//! return [`ApiResult`](crate::ApiResult) so failures render as JSON errors.

pub mod clients;
pub mod deliveries;
pub mod health;
pub mod messages;

pub use clients::{ack, dequeue, release};
pub use deliveries::requeue_delivery;
pub use health::health_check;
pub use messages::{get_message, list_deliveries, publish_message};
