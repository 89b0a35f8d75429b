//! Push driver: one webhook attempt and its recorded outcome.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use pgbus_core::{models::PushDelivery, Clock};
use tracing::{debug, info, warn};

use crate::{
    client::{PushClient, PushRequest, PushResponse},
    error::{DeliveryError, ErrorCategory, Result},
    retry::{RetryContext, RetryDecision, RetryPolicy, StoreRetry},
    storage::PushStorage,
};

/// What happened to a record after one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    /// 2xx received; the record is `delivered`.
    Delivered {
        /// Attempts including this one.
        attempts: u32,
        /// HTTP status returned by the endpoint.
        status_code: u16,
    },
    /// Attempt failed; the record is back to `new` until `next_attempt_at`.
    Retrying {
        /// Attempts including this one.
        attempts: u32,
        /// Earliest time the record can be claimed again.
        next_attempt_at: DateTime<Utc>,
        /// Failure description stored in `last_error`.
        error: String,
    },
    /// Attempts exhausted or the URL is unusable; the record is `failed`.
    Failed {
        /// Attempts including this one.
        attempts: u32,
        /// Failure description stored in `last_error`.
        error: String,
    },
    /// The lease was reaped or taken over before the attempt; nothing was
    /// sent and the record is left to its current holder.
    LeaseLost {
        /// Attempts recorded when the record was claimed.
        attempts: u32,
    },
}

impl PushOutcome {
    /// Attempts recorded on the record.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Delivered { attempts, .. }
            | Self::Retrying { attempts, .. }
            | Self::Failed { attempts, .. }
            | Self::LeaseLost { attempts } => *attempts,
        }
    }
}

/// Delivers claimed push records and records the result.
pub struct PushDriver {
    storage: Arc<dyn PushStorage>,
    client: Arc<PushClient>,
    policy: RetryPolicy,
    store_retry: StoreRetry,
    clock: Arc<dyn Clock>,
}

impl PushDriver {
    /// Creates a driver.
    pub fn new(
        storage: Arc<dyn PushStorage>,
        client: Arc<PushClient>,
        policy: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { storage, client, policy, store_retry: StoreRetry::default(), clock }
    }

    /// Overrides the retry applied to lease renewal and outcome writes.
    #[must_use]
    pub fn with_store_retry(mut self, store_retry: StoreRetry) -> Self {
        self.store_retry = store_retry;
        self
    }

    /// Retry policy in effect.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Makes one attempt for an `in_flight` record and stores the outcome.
    ///
    /// The lease is renewed first, so every attempt runs under a full lease
    /// no matter how long earlier records of the batch took. A record whose
    /// lease was already reaped is not sent and yields
    /// [`PushOutcome::LeaseLost`]. HTTP failures never surface as errors;
    /// they become [`PushOutcome::Retrying`] or [`PushOutcome::Failed`].
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the lease cannot be renewed or the outcome
    /// cannot be written after transient retries. The lease then expires and
    /// the maintenance loop returns the record to `new`.
    pub async fn push(&self, delivery: &PushDelivery) -> Result<PushOutcome> {
        let record = &delivery.delivery.record;
        let recorded_attempts = u32::try_from(record.attempts).unwrap_or(0);
        let attempt_number = recorded_attempts.saturating_add(1);
        let key = delivery.key();

        let renewed = match record.lease_expires_at {
            Some(held) => {
                self.store_retry
                    .run("push_renew_lease", || self.storage.renew_lease(&key, held))
                    .await?
            },
            None => None,
        };
        let Some(held) = renewed else {
            warn!(
                message_id = %key.message_id,
                client_id = %key.client_id,
                "push lease lost before attempt, skipping"
            );
            return Ok(PushOutcome::LeaseLost { attempts: recorded_attempts });
        };

        let request = PushRequest {
            url: delivery.webhook_url.clone(),
            client_id: record.client_id.clone(),
            attempt_number,
            envelope: delivery.delivery.message.envelope(),
        };

        let result = self.client.deliver(&request).await.and_then(PushResponse::into_result);
        let outcome = self.decide(attempt_number, result);

        let recorded = match &outcome {
            PushOutcome::Delivered { attempts, .. } => {
                self.store_retry
                    .run("push_complete", || self.storage.complete(&key, held, *attempts))
                    .await?
            },
            PushOutcome::Retrying { attempts, next_attempt_at, error } => {
                self.store_retry
                    .run("push_schedule_retry", || {
                        self.storage.schedule_retry(&key, held, *attempts, *next_attempt_at, error)
                    })
                    .await?
            },
            PushOutcome::Failed { attempts, error } => {
                self.store_retry
                    .run("push_mark_failed", || {
                        self.storage.mark_failed(&key, held, *attempts, error)
                    })
                    .await?
            },
            PushOutcome::LeaseLost { .. } => false,
        };

        if !recorded {
            warn!(
                message_id = %key.message_id,
                client_id = %key.client_id,
                "push outcome not recorded, lease no longer held"
            );
        }

        Ok(outcome)
    }

    /// Maps an attempt result to an outcome without touching storage.
    pub fn decide(&self, attempt_number: u32, result: Result<PushResponse>) -> PushOutcome {
        let error = match result {
            Ok(response) => {
                info!(
                    attempt = attempt_number,
                    status_code = response.status_code,
                    duration_ms = response.duration.as_millis(),
                    "webhook delivered"
                );
                return PushOutcome::Delivered {
                    attempts: attempt_number,
                    status_code: response.status_code,
                };
            },
            Err(error) => error,
        };

        let category = ErrorCategory::from(&error);
        let failed_at = self.clock.now_utc();
        let message = describe(&error);
        let body = response_body(&error).map(str::to_owned);

        match RetryContext::new(attempt_number, error, failed_at, self.policy.clone())
            .decide_retry()
        {
            RetryDecision::Retry { next_attempt_at } => {
                debug!(
                    attempt = attempt_number,
                    %category,
                    next_attempt_at = %next_attempt_at,
                    error = %message,
                    "webhook attempt failed, retry scheduled"
                );
                PushOutcome::Retrying { attempts: attempt_number, next_attempt_at, error: message }
            },
            RetryDecision::GiveUp { reason } => {
                warn!(attempt = attempt_number, %category, reason = %reason, "webhook delivery failed");
                let error = match body {
                    Some(body) => format!("{reason}: {body}"),
                    None => reason,
                };
                PushOutcome::Failed { attempts: attempt_number, error }
            },
        }
    }
}

/// `last_error` text, including the response body excerpt when present.
fn describe(error: &DeliveryError) -> String {
    match response_body(error) {
        Some(body) => format!("{error}: {body}"),
        None => error.to_string(),
    }
}

fn response_body(error: &DeliveryError) -> Option<&str> {
    match error {
        DeliveryError::ClientError { body, .. } | DeliveryError::ServerError { body, .. }
            if !body.is_empty() =>
        {
            Some(body)
        },
        _ => None,
    }
}
