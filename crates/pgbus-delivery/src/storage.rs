//! Storage seam for the push worker pool.
//!
//! Push workers only need a handful of tracker operations. Putting them
//! behind [`PushStorage`] lets the retry and worker logic run against the
//! in-memory [`mock::MockPushStorage`] without PostgreSQL.
//!
//! A claimed record carries its `lease_expires_at`. Workers renew it before
//! each attempt and present the renewed value with the outcome; a write whose
//! lease was reaped or taken over by another worker changes nothing.

use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use pgbus_core::{
    error::Result,
    models::{DeliveryKey, PushDelivery},
    Storage,
};

/// Tracker operations required by push workers.
pub trait PushStorage: Send + Sync + 'static {
    /// Leases up to `batch_size` due push records.
    ///
    /// Production uses `FOR UPDATE SKIP LOCKED`, so concurrent workers
    /// receive disjoint batches.
    fn claim_due(
        &self,
        batch_size: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<PushDelivery>>> + Send + '_>>;

    /// Extends the lease `held`; `None` when it is no longer ours.
    fn renew_lease<'a>(
        &'a self,
        key: &'a DeliveryKey,
        held: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<Option<DateTime<Utc>>>> + Send + 'a>>;

    /// Marks a record delivered after a 2xx response.
    fn complete<'a>(
        &'a self,
        key: &'a DeliveryKey,
        held: DateTime<Utc>,
        attempts: u32,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>>;

    /// Returns a record to `new` with a backoff.
    fn schedule_retry<'a>(
        &'a self,
        key: &'a DeliveryKey,
        held: DateTime<Utc>,
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
        error: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>>;

    /// Fails a record permanently.
    fn mark_failed<'a>(
        &'a self,
        key: &'a DeliveryKey,
        held: DateTime<Utc>,
        attempts: u32,
        error: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>>;
}

fn attempts_column(attempts: u32) -> i32 {
    i32::try_from(attempts).unwrap_or(i32::MAX)
}

/// [`PushStorage`] over the PostgreSQL delivery tracker.
pub struct PostgresPushStorage {
    storage: Arc<Storage>,
    lease: Duration,
}

impl PostgresPushStorage {
    /// Creates an adapter that leases records for `lease` per claim and per
    /// renewal.
    pub fn new(storage: Arc<Storage>, lease: Duration) -> Self {
        Self { storage, lease }
    }
}

impl PushStorage for PostgresPushStorage {
    fn claim_due(
        &self,
        batch_size: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<PushDelivery>>> + Send + '_>> {
        Box::pin(async move { self.storage.deliveries.claim_due_push(batch_size, self.lease).await })
    }

    fn renew_lease<'a>(
        &'a self,
        key: &'a DeliveryKey,
        held: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<Option<DateTime<Utc>>>> + Send + 'a>> {
        Box::pin(async move { self.storage.deliveries.renew_push_lease(key, held, self.lease).await })
    }

    fn complete<'a>(
        &'a self,
        key: &'a DeliveryKey,
        held: DateTime<Utc>,
        attempts: u32,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>> {
        Box::pin(async move {
            self.storage.deliveries.complete_push(key, held, attempts_column(attempts)).await
        })
    }

    fn schedule_retry<'a>(
        &'a self,
        key: &'a DeliveryKey,
        held: DateTime<Utc>,
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
        error: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>> {
        Box::pin(async move {
            self.storage
                .deliveries
                .schedule_retry(key, held, attempts_column(attempts), next_attempt_at, error)
                .await
        })
    }

    fn mark_failed<'a>(
        &'a self,
        key: &'a DeliveryKey,
        held: DateTime<Utc>,
        attempts: u32,
        error: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>> {
        Box::pin(async move {
            self.storage.deliveries.mark_failed(key, held, attempts_column(attempts), error).await
        })
    }
}

pub mod mock {
    //! In-memory push storage for tests.
    //!
    //! Mirrors the guarded transitions of the PostgreSQL tracker: only
    //! `in_flight` records holding the presented lease renew, complete, retry
    //! or fail, and only due `new` records are claimed.

    use std::{
        collections::HashMap,
        future::Future,
        pin::Pin,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
    };

    use chrono::{DateTime, Utc};
    use pgbus_core::{
        error::{CoreError, Result},
        models::{
            ClientId, Delivery, DeliveryKey, DeliveryMode, DeliveryRecord, DeliveryStatus,
            Message, MessageId, PushDelivery, SubscriptionId,
        },
    };
    use tokio::sync::RwLock;

    use super::{attempts_column, PushStorage};

    fn lease_from(now: DateTime<Utc>) -> DateTime<Utc> {
        now + chrono::Duration::seconds(60)
    }

    /// Snapshot of one mock record.
    #[derive(Debug, Clone, PartialEq)]
    pub struct MockRecord {
        /// Claimable payload.
        pub delivery: PushDelivery,
        /// Current status.
        pub status: DeliveryStatus,
        /// Attempts recorded so far.
        pub attempts: u32,
        /// Current lease, set while `in_flight`.
        pub lease_expires_at: Option<DateTime<Utc>>,
        /// Retry schedule.
        pub next_attempt_at: Option<DateTime<Utc>>,
        /// Most recent error.
        pub last_error: Option<String>,
    }

    /// In-memory [`PushStorage`].
    #[derive(Default)]
    pub struct MockPushStorage {
        records: Arc<RwLock<HashMap<DeliveryKey, MockRecord>>>,
        claim_error: Arc<RwLock<Option<String>>>,
        claim_calls: AtomicUsize,
        outcome_errors: AtomicUsize,
    }

    impl MockPushStorage {
        /// Creates an empty mock.
        pub fn new() -> Self {
            Self::default()
        }

        /// Builds a `new` push delivery for `message_id`.
        pub fn delivery(message_id: i64, client_id: &str, url: impl Into<String>) -> PushDelivery {
            let now = Utc::now();
            let message = Message {
                id: MessageId(message_id),
                message_type: "test.event".to_string(),
                namespace: "default".to_string(),
                payload: serde_json::json!({ "seq": message_id }),
                tracking_id: format!("trk{message_id:08}"),
                created_at: now,
            };
            let record = DeliveryRecord {
                message_id: MessageId(message_id),
                client_id: ClientId::new(client_id),
                subscription_id: SubscriptionId::new(),
                delivery_mode: DeliveryMode::Push,
                status: DeliveryStatus::New,
                attempts: 0,
                lease_expires_at: None,
                next_attempt_at: None,
                delivered_at: None,
                last_error: None,
                created_at: now,
                updated_at: now,
            };
            PushDelivery { delivery: Delivery { message, record }, webhook_url: url.into() }
        }

        /// Adds a claimable record.
        pub async fn add(&self, delivery: PushDelivery) {
            let record = MockRecord {
                status: DeliveryStatus::New,
                attempts: u32::try_from(delivery.delivery.record.attempts).unwrap_or(0),
                lease_expires_at: None,
                next_attempt_at: None,
                last_error: None,
                delivery,
            };
            self.records.write().await.insert(record.delivery.key(), record);
        }

        /// Current state of a record.
        pub async fn record(&self, key: &DeliveryKey) -> Option<MockRecord> {
            self.records.read().await.get(key).cloned()
        }

        /// All records in a status.
        pub async fn count_in(&self, status: DeliveryStatus) -> usize {
            self.records.read().await.values().filter(|r| r.status == status).count()
        }

        /// Makes every scheduled retry due now.
        pub async fn make_retries_due(&self) {
            for record in self.records.write().await.values_mut() {
                if record.next_attempt_at.is_some() {
                    record.next_attempt_at = Some(Utc::now() - chrono::Duration::seconds(1));
                }
            }
        }

        /// Returns an `in_flight` record to `new` as the lease reaper would.
        pub async fn reap_lease(&self, key: &DeliveryKey) -> bool {
            let mut records = self.records.write().await;
            match records.get_mut(key) {
                Some(record) if record.status == DeliveryStatus::InFlight => {
                    record.status = DeliveryStatus::New;
                    record.lease_expires_at = None;
                    true
                },
                _ => false,
            }
        }

        /// Makes every following claim fail with a transient error.
        pub async fn inject_claim_error(&self, error: Option<String>) {
            *self.claim_error.write().await = error;
        }

        /// Makes the next `count` outcome writes fail with a transient error.
        pub fn inject_outcome_errors(&self, count: usize) {
            self.outcome_errors.store(count, Ordering::Relaxed);
        }

        /// Number of claim calls made.
        pub fn claim_calls(&self) -> usize {
            self.claim_calls.load(Ordering::Relaxed)
        }

        fn take_outcome_error(&self) -> Result<()> {
            let injected = self
                .outcome_errors
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |left| left.checked_sub(1))
                .is_ok();
            if injected {
                return Err(CoreError::TransientStore("injected outcome failure".to_string()));
            }
            Ok(())
        }

        async fn transition(
            &self,
            key: &DeliveryKey,
            held: DateTime<Utc>,
            apply: impl FnOnce(&mut MockRecord) + Send,
        ) -> Result<bool> {
            self.take_outcome_error()?;
            let mut records = self.records.write().await;
            match records.get_mut(key) {
                Some(record)
                    if record.status == DeliveryStatus::InFlight
                        && record.lease_expires_at == Some(held) =>
                {
                    apply(record);
                    record.lease_expires_at = None;
                    Ok(true)
                },
                _ => Ok(false),
            }
        }
    }

    impl PushStorage for MockPushStorage {
        fn claim_due(
            &self,
            batch_size: usize,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<PushDelivery>>> + Send + '_>> {
            Box::pin(async move {
                self.claim_calls.fetch_add(1, Ordering::Relaxed);
                if let Some(error) = self.claim_error.read().await.clone() {
                    return Err(CoreError::TransientStore(error));
                }

                let now = Utc::now();
                let mut records = self.records.write().await;
                let mut due: Vec<&mut MockRecord> = records
                    .values_mut()
                    .filter(|r| r.status == DeliveryStatus::New)
                    .filter(|r| r.next_attempt_at.map_or(true, |at| at <= now))
                    .collect();
                due.sort_by_key(|r| {
                    let message = &r.delivery.delivery.message;
                    (message.created_at, message.id)
                });

                Ok(due
                    .into_iter()
                    .take(batch_size)
                    .map(|record| {
                        record.status = DeliveryStatus::InFlight;
                        record.lease_expires_at = Some(lease_from(now));
                        let mut claimed = record.delivery.clone();
                        claimed.delivery.record.status = DeliveryStatus::InFlight;
                        claimed.delivery.record.attempts = attempts_column(record.attempts);
                        claimed.delivery.record.lease_expires_at = record.lease_expires_at;
                        claimed
                    })
                    .collect())
            })
        }

        fn renew_lease<'a>(
            &'a self,
            key: &'a DeliveryKey,
            held: DateTime<Utc>,
        ) -> Pin<Box<dyn Future<Output = Result<Option<DateTime<Utc>>>> + Send + 'a>> {
            Box::pin(async move {
                let mut records = self.records.write().await;
                Ok(match records.get_mut(key) {
                    Some(record)
                        if record.status == DeliveryStatus::InFlight
                            && record.lease_expires_at == Some(held) =>
                    {
                        let renewed =
                            lease_from(Utc::now()).max(held + chrono::Duration::microseconds(1));
                        record.lease_expires_at = Some(renewed);
                        Some(renewed)
                    },
                    _ => None,
                })
            })
        }

        fn complete<'a>(
            &'a self,
            key: &'a DeliveryKey,
            held: DateTime<Utc>,
            attempts: u32,
        ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>> {
            Box::pin(async move {
                self.transition(key, held, |record| {
                    record.status = DeliveryStatus::Delivered;
                    record.attempts = attempts;
                    record.next_attempt_at = None;
                })
                .await
            })
        }

        fn schedule_retry<'a>(
            &'a self,
            key: &'a DeliveryKey,
            held: DateTime<Utc>,
            attempts: u32,
            next_attempt_at: DateTime<Utc>,
            error: &'a str,
        ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>> {
            Box::pin(async move {
                self.transition(key, held, |record| {
                    record.status = DeliveryStatus::New;
                    record.attempts = attempts;
                    record.next_attempt_at = Some(next_attempt_at);
                    record.last_error = Some(error.to_string());
                })
                .await
            })
        }

        fn mark_failed<'a>(
            &'a self,
            key: &'a DeliveryKey,
            held: DateTime<Utc>,
            attempts: u32,
            error: &'a str,
        ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>> {
            Box::pin(async move {
                self.transition(key, held, |record| {
                    record.status = DeliveryStatus::Failed;
                    record.attempts = attempts;
                    record.next_attempt_at = None;
                    record.last_error = Some(error.to_string());
                })
                .await
            })
        }
    }
}
