//! Push worker pool engine.
//!
//! Workers claim due push records with `FOR UPDATE SKIP LOCKED`, so any
//! number of workers (in this process or others) share the queue without
//! coordination beyond PostgreSQL.

use std::{sync::Arc, time::Duration};

use pgbus_core::{Clock, Storage};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{
    client::{ClientConfig, PushClient},
    error::Result,
    push::{PushDriver, PushOutcome},
    retry::RetryPolicy,
    storage::{PostgresPushStorage, PushStorage},
    worker_pool::WorkerPool,
};

/// Pause after a failed claim before polling again.
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Configuration for the push engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Number of concurrent push workers.
    pub worker_count: usize,

    /// Maximum records to claim per worker batch.
    pub batch_size: usize,

    /// How often idle workers poll for due records.
    pub poll_interval: Duration,

    /// Lease taken on claimed records and renewed before each attempt;
    /// must exceed the request timeout.
    pub lease_timeout: Duration,

    /// HTTP client configuration.
    pub client_config: ClientConfig,

    /// Backoff and attempt bound.
    pub retry_policy: RetryPolicy,

    /// Maximum time to wait for workers to stop.
    pub shutdown_timeout: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            worker_count: crate::DEFAULT_WORKER_COUNT,
            batch_size: crate::DEFAULT_BATCH_SIZE,
            poll_interval: Duration::from_secs(1),
            lease_timeout: Duration::from_secs(60),
            client_config: ClientConfig::default(),
            retry_policy: RetryPolicy::default(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Counters for engine monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Number of running workers.
    pub active_workers: usize,
    /// Records attempted since startup.
    pub records_processed: u64,
    /// Records delivered.
    pub successful_deliveries: u64,
    /// Attempts that scheduled a retry.
    pub retries_scheduled: u64,
    /// Records that reached `failed`.
    pub permanent_failures: u64,
    /// Records skipped because their lease was reaped before the attempt.
    pub leases_lost: u64,
    /// Attempts whose outcome could not be stored.
    pub store_errors: u64,
    /// Attempts currently running.
    pub in_flight_deliveries: u64,
}

impl EngineStats {
    fn record(&mut self, outcome: &Result<PushOutcome>) {
        self.records_processed += 1;
        match outcome {
            Ok(PushOutcome::Delivered { .. }) => self.successful_deliveries += 1,
            Ok(PushOutcome::Retrying { .. }) => self.retries_scheduled += 1,
            Ok(PushOutcome::Failed { .. }) => self.permanent_failures += 1,
            Ok(PushOutcome::LeaseLost { .. }) => self.leases_lost += 1,
            Err(_) => self.store_errors += 1,
        }
    }
}

/// Push engine owning the worker pool.
pub struct DeliveryEngine {
    storage: Arc<dyn PushStorage>,
    config: DeliveryConfig,
    driver: Arc<PushDriver>,
    stats: Arc<RwLock<EngineStats>>,
    cancellation_token: CancellationToken,
    worker_pool: Option<WorkerPool>,
    clock: Arc<dyn Clock>,
}

impl DeliveryEngine {
    /// Creates an engine over the PostgreSQL tracker.
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be initialized.
    pub fn new(storage: Arc<Storage>, config: DeliveryConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let push_storage: Arc<dyn PushStorage> =
            Arc::new(PostgresPushStorage::new(storage, config.lease_timeout));
        Self::with_storage(push_storage, config, clock)
    }

    /// Creates an engine over any [`PushStorage`].
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be initialized.
    pub fn with_storage(
        storage: Arc<dyn PushStorage>,
        config: DeliveryConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let client = Arc::new(PushClient::new(config.client_config.clone())?);
        let driver = Arc::new(PushDriver::new(
            storage.clone(),
            client,
            config.retry_policy.clone(),
            clock.clone(),
        ));

        Ok(Self {
            storage,
            config,
            driver,
            stats: Arc::new(RwLock::new(EngineStats::default())),
            cancellation_token: CancellationToken::new(),
            worker_pool: None,
            clock,
        })
    }

    /// Spawns the configured workers and returns.
    ///
    /// # Errors
    ///
    /// Returns error if the worker pool fails to spawn.
    pub async fn start(&mut self) -> Result<()> {
        info!(
            worker_count = self.config.worker_count,
            batch_size = self.config.batch_size,
            max_attempts = self.config.retry_policy.max_attempts,
            "starting push delivery engine"
        );

        let mut worker_pool = WorkerPool::new(
            self.storage.clone(),
            self.config.clone(),
            self.driver.clone(),
            self.stats.clone(),
            self.cancellation_token.clone(),
            self.clock.clone(),
        );

        worker_pool.spawn_workers().await?;
        self.worker_pool = Some(worker_pool);
        Ok(())
    }

    /// Stops workers between records and waits up to `shutdown_timeout`.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownTimeout` if workers do not stop in time.
    pub async fn shutdown(mut self) -> Result<()> {
        info!("shutting down push delivery engine");

        if let Some(worker_pool) = self.worker_pool.take() {
            worker_pool.shutdown_graceful(self.config.shutdown_timeout).await?;
        } else {
            debug!("push delivery engine was not started");
        }
        Ok(())
    }

    /// Current counters.
    pub async fn stats(&self) -> EngineStats {
        self.stats.read().await.clone()
    }

    /// Token that stops the workers when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Claims and delivers one batch on the calling task.
    ///
    /// Returns the number of records claimed.
    ///
    /// # Errors
    ///
    /// Returns error if the claim fails.
    pub async fn process_batch(&self) -> Result<usize> {
        let worker = PushWorker::new(
            0,
            self.storage.clone(),
            self.driver.clone(),
            self.config.clone(),
            self.stats.clone(),
            self.cancellation_token.clone(),
            self.clock.clone(),
        );

        worker.process_batch().await
    }
}

/// One worker loop.
pub struct PushWorker {
    id: usize,
    storage: Arc<dyn PushStorage>,
    driver: Arc<PushDriver>,
    config: DeliveryConfig,
    stats: Arc<RwLock<EngineStats>>,
    cancellation_token: CancellationToken,
    clock: Arc<dyn Clock>,
}

impl PushWorker {
    /// Creates a worker.
    pub fn new(
        id: usize,
        storage: Arc<dyn PushStorage>,
        driver: Arc<PushDriver>,
        config: DeliveryConfig,
        stats: Arc<RwLock<EngineStats>>,
        cancellation_token: CancellationToken,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { id, storage, driver, config, stats, cancellation_token, clock }
    }

    /// Claims and processes batches until cancelled.
    ///
    /// # Errors
    ///
    /// Never returns error today; claim failures are logged and retried.
    pub async fn run(&self) -> Result<()> {
        info!(worker_id = self.id, "push worker starting");

        loop {
            if self.cancellation_token.is_cancelled() {
                break;
            }

            let pause = match self.process_batch().await {
                Ok(0) => self.config.poll_interval,
                Ok(_) => continue,
                Err(error) => {
                    error!(worker_id = self.id, error = %error, "push batch claim failed");
                    ERROR_BACKOFF
                },
            };

            tokio::select! {
                () = self.clock.sleep(pause) => {}
                () = self.cancellation_token.cancelled() => break,
            }
        }

        info!(worker_id = self.id, "push worker stopped");
        Ok(())
    }

    /// Claims one batch and attempts every record in it.
    ///
    /// A failing record never aborts the batch. Each attempt renews its
    /// record's lease, so a slow endpoint cannot push later records past
    /// their lease. Cancellation is checked between records; unattempted
    /// records keep their lease until the reaper returns them.
    ///
    /// # Errors
    ///
    /// Returns error if the claim fails.
    pub async fn process_batch(&self) -> Result<usize> {
        let deliveries = self.storage.claim_due(self.config.batch_size).await?;
        let claimed = deliveries.len();

        if claimed > 0 {
            debug!(worker_id = self.id, claimed, "claimed push batch");
        }

        for delivery in &deliveries {
            if self.cancellation_token.is_cancelled() {
                debug!(worker_id = self.id, "cancelled mid-batch");
                break;
            }

            self.stats.write().await.in_flight_deliveries += 1;
            let outcome = self.driver.push(delivery).await;

            if let Err(error) = &outcome {
                error!(
                    worker_id = self.id,
                    message_id = %delivery.delivery.message.id,
                    client_id = %delivery.delivery.record.client_id,
                    error = %error,
                    "failed to record push outcome"
                );
            }

            let mut stats = self.stats.write().await;
            stats.in_flight_deliveries = stats.in_flight_deliveries.saturating_sub(1);
            stats.record(&outcome);
        }

        Ok(claimed)
    }
}

#[cfg(test)]
mod tests {
    use pgbus_core::{models::DeliveryStatus, TestClock};
    use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::storage::mock::MockPushStorage;

    fn test_config() -> DeliveryConfig {
        DeliveryConfig {
            worker_count: 2,
            batch_size: 4,
            poll_interval: Duration::from_millis(10),
            retry_policy: RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(1),
                jitter_factor: 0.0,
                max_retry_after: Duration::from_secs(1),
            },
            shutdown_timeout: Duration::from_secs(5),
            ..DeliveryConfig::default()
        }
    }

    #[tokio::test]
    async fn one_failing_record_does_not_abort_the_batch() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .and(matchers::path("/ok"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(matchers::method("POST"))
            .and(matchers::path("/broken"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let storage = Arc::new(MockPushStorage::new());
        storage.add(MockPushStorage::delivery(1, "a", format!("{}/broken", server.uri()))).await;
        storage.add(MockPushStorage::delivery(2, "b", format!("{}/ok", server.uri()))).await;
        storage.add(MockPushStorage::delivery(3, "c", "not a url")).await;

        let engine =
            DeliveryEngine::with_storage(storage.clone(), test_config(), Arc::new(TestClock::new()))
                .unwrap();

        assert_eq!(engine.process_batch().await.unwrap(), 3);

        let stats = engine.stats().await;
        assert_eq!(stats.records_processed, 3);
        assert_eq!(stats.successful_deliveries, 1);
        assert_eq!(stats.retries_scheduled, 1);
        assert_eq!(stats.permanent_failures, 1);
        assert_eq!(stats.in_flight_deliveries, 0);

        assert_eq!(storage.count_in(DeliveryStatus::Delivered).await, 1);
        assert_eq!(storage.count_in(DeliveryStatus::New).await, 1);
        assert_eq!(storage.count_in(DeliveryStatus::Failed).await, 1);
    }

    #[tokio::test]
    async fn records_reaped_mid_batch_are_left_to_the_new_holder() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(2)
            .mount(&server)
            .await;

        let storage = Arc::new(MockPushStorage::new());
        let first = MockPushStorage::delivery(1, "a", format!("{}/hook", server.uri()));
        let second = MockPushStorage::delivery(2, "b", format!("{}/hook", server.uri()));
        let reaped = second.key();
        storage.add(first).await;
        storage.add(second).await;

        let stale = storage.claim_due(10).await.unwrap();
        assert!(storage.reap_lease(&reaped).await);

        let engine =
            DeliveryEngine::with_storage(storage.clone(), test_config(), Arc::new(TestClock::new()))
                .unwrap();
        assert_eq!(engine.process_batch().await.unwrap(), 1);

        let driver = PushDriver::new(
            storage.clone(),
            Arc::new(PushClient::with_defaults().unwrap()),
            test_config().retry_policy,
            Arc::new(TestClock::new()),
        );
        let outcomes = [driver.push(&stale[0]).await.unwrap(), driver.push(&stale[1]).await.unwrap()];

        assert!(matches!(outcomes[0], PushOutcome::Delivered { .. }));
        assert_eq!(outcomes[1], PushOutcome::LeaseLost { attempts: 0 });
        assert_eq!(storage.count_in(DeliveryStatus::Delivered).await, 2);
        assert_eq!(engine.stats().await.successful_deliveries, 1);
        server.verify().await;
    }

    #[test]
    fn lost_leases_are_counted() {
        let mut stats = EngineStats::default();
        stats.record(&Ok(PushOutcome::LeaseLost { attempts: 2 }));
        stats.record(&Ok(PushOutcome::Delivered { attempts: 1, status_code: 200 }));

        assert_eq!(stats.records_processed, 2);
        assert_eq!(stats.leases_lost, 1);
        assert_eq!(stats.successful_deliveries, 1);
    }

    #[tokio::test]
    async fn workers_drain_the_queue_and_shut_down() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(10)
            .mount(&server)
            .await;

        let storage = Arc::new(MockPushStorage::new());
        for id in 1..=10 {
            storage.add(MockPushStorage::delivery(id, "c1", format!("{}/hook", server.uri()))).await;
        }

        let clock = TestClock::new();
        let mut engine =
            DeliveryEngine::with_storage(storage.clone(), test_config(), Arc::new(clock.clone()))
                .unwrap();
        engine.start().await.unwrap();

        for _ in 0..500 {
            if storage.count_in(DeliveryStatus::Delivered).await == 10 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(storage.count_in(DeliveryStatus::Delivered).await, 10);
        assert_eq!(engine.stats().await.active_workers, 2);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn claim_errors_are_survived() {
        let storage = Arc::new(MockPushStorage::new());
        storage.inject_claim_error(Some("connection reset".to_string())).await;

        let clock = TestClock::new();
        let mut engine =
            DeliveryEngine::with_storage(storage.clone(), test_config(), Arc::new(clock.clone()))
                .unwrap();

        assert!(engine.process_batch().await.is_err());

        engine.start().await.unwrap();
        for _ in 0..500 {
            if storage.claim_calls() >= 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(storage.claim_calls() >= 5);
        assert!(clock.sleep_count() >= 2);

        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_without_start_is_immediate() {
        let engine = DeliveryEngine::with_storage(
            Arc::new(MockPushStorage::new()),
            test_config(),
            Arc::new(TestClock::new()),
        )
        .unwrap();
        engine.shutdown().await.unwrap();
    }
}
