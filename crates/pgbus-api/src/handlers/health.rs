//! Health check handler.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use pgbus_core::{Clock, Storage};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, instrument};

use crate::AppState;

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Overall status.
    pub status: HealthStatus,
    /// When the check ran.
    pub timestamp: DateTime<Utc>,
    /// Database probe.
    pub database: ComponentHealth,
    /// Service version.
    pub version: String,
}

/// Overall health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// All probes passed.
    Healthy,
    /// A critical probe failed.
    Unhealthy,
}

/// Result of one probe.
#[derive(Debug, Serialize, Deserialize)]
pub struct ComponentHealth {
    /// True if the probe passed.
    pub up: bool,
    /// Failure description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Probe duration in milliseconds.
    pub response_time_ms: u64,
}

/// Runs health probes against injected dependencies.
pub struct HealthService {
    clock: Arc<dyn Clock>,
}

impl HealthService {
    /// Creates a service reading time from `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Probes the database.
    pub async fn check(&self, storage: &Storage) -> HealthResponse {
        let timestamp = self.clock.now_utc();
        let start = self.clock.now();

        let result = storage.health_check().await;
        let response_time_ms =
            u64::try_from(self.clock.now().duration_since(start).as_millis()).unwrap_or(u64::MAX);

        let database = match result {
            Ok(()) => ComponentHealth { up: true, message: None, response_time_ms },
            Err(e) => {
                error!(error = %e, "database health check failed");
                ComponentHealth {
                    up: false,
                    message: Some(format!("database connection failed: {e}")),
                    response_time_ms,
                }
            },
        };

        HealthResponse {
            status: if database.up { HealthStatus::Healthy } else { HealthStatus::Unhealthy },
            timestamp,
            database,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// `GET /health`: 200 when the database answers, 503 otherwise.
#[instrument(name = "health_check", skip(state))]
pub async fn health_check(State(state): State<AppState>) -> Response {
    let response = HealthService::new(state.clock.clone()).check(&state.storage).await;

    let status_code = match response.status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    debug!(status = ?response.status, "health check completed");
    (status_code, Json(response)).into_response()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pgbus_core::TestClock;
    use sqlx::postgres::PgPoolOptions;

    use super::*;

    #[tokio::test]
    async fn unreachable_database_is_unhealthy() {
        let pool = PgPoolOptions::new()
            .acquire_timeout(Duration::from_millis(200))
            .connect_lazy("postgresql://127.0.0.1:1/unreachable")
            .unwrap();
        let service = HealthService::new(Arc::new(TestClock::new()));

        let response = service.check(&Storage::new(pool)).await;

        assert_eq!(response.status, HealthStatus::Unhealthy);
        assert!(!response.database.up);
        assert!(response.database.message.is_some());
    }
}
