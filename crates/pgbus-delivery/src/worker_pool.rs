//! Supervised push worker tasks.

use std::{sync::Arc, time::Duration};

use pgbus_core::Clock;
use tokio::{sync::RwLock, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    error::{DeliveryError, Result},
    push::PushDriver,
    storage::PushStorage,
    worker::{DeliveryConfig, EngineStats, PushWorker},
};

/// Owns the spawned worker tasks.
///
/// Call [`WorkerPool::shutdown_graceful`] before dropping; dropping a live
/// pool cancels its workers without waiting.
pub struct WorkerPool {
    storage: Arc<dyn PushStorage>,
    config: DeliveryConfig,
    driver: Arc<PushDriver>,
    stats: Arc<RwLock<EngineStats>>,
    cancellation_token: CancellationToken,
    worker_handles: Vec<JoinHandle<Result<()>>>,
    clock: Arc<dyn Clock>,
}

impl WorkerPool {
    /// Creates a pool; no tasks run until [`Self::spawn_workers`].
    pub fn new(
        storage: Arc<dyn PushStorage>,
        config: DeliveryConfig,
        driver: Arc<PushDriver>,
        stats: Arc<RwLock<EngineStats>>,
        cancellation_token: CancellationToken,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            storage,
            config,
            driver,
            stats,
            cancellation_token,
            worker_handles: Vec::new(),
            clock,
        }
    }

    /// Spawns `worker_count` workers.
    ///
    /// # Errors
    ///
    /// Returns `InternalError` if called twice.
    pub async fn spawn_workers(&mut self) -> Result<()> {
        if !self.worker_handles.is_empty() {
            return Err(DeliveryError::internal("workers already spawned"));
        }

        self.stats.write().await.active_workers = self.config.worker_count;

        for worker_id in 0..self.config.worker_count {
            let worker = PushWorker::new(
                worker_id,
                self.storage.clone(),
                self.driver.clone(),
                self.config.clone(),
                self.stats.clone(),
                self.cancellation_token.clone(),
                self.clock.clone(),
            );

            let handle = tokio::spawn(async move {
                let result = worker.run().await;
                if let Err(ref error) = result {
                    error!(worker_id, error = %error, "push worker terminated with error");
                }
                result
            });

            self.worker_handles.push(handle);
        }

        info!(spawned_workers = self.worker_handles.len(), "push workers spawned");
        Ok(())
    }

    /// Cancels all workers and waits for them to finish.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownTimeout` if the workers are still running after
    /// `timeout`.
    pub async fn shutdown_graceful(mut self, timeout: Duration) -> Result<()> {
        info!(
            worker_count = self.worker_handles.len(),
            timeout_seconds = timeout.as_secs(),
            "initiating graceful worker shutdown"
        );

        self.cancellation_token.cancel();

        let handles = std::mem::take(&mut self.worker_handles);
        let stats = self.stats.clone();
        let shutdown_future = async move {
            let mut panics = Vec::new();

            for (worker_id, handle) in handles.into_iter().enumerate() {
                match handle.await {
                    Ok(Ok(())) => {},
                    Ok(Err(error)) => {
                        warn!(worker_id, error = %error, "worker completed with error");
                    },
                    Err(join_error) => {
                        error!(worker_id, error = %join_error, "worker task panicked");
                        panics.push(DeliveryError::WorkerPanic {
                            worker_id,
                            error: join_error.to_string(),
                        });
                    },
                }
            }

            stats.write().await.active_workers = 0;
            panics
        };

        match tokio::time::timeout(timeout, shutdown_future).await {
            Ok(panics) => {
                if !panics.is_empty() {
                    warn!(panicked = panics.len(), "some workers panicked before shutdown");
                }
                info!("worker pool shutdown completed");
                Ok(())
            },
            Err(_elapsed) => {
                error!(timeout_seconds = timeout.as_secs(), "worker shutdown timed out");
                Err(DeliveryError::ShutdownTimeout { timeout })
            },
        }
    }

    /// True while any worker task is still running.
    pub fn has_active_workers(&self) -> bool {
        self.worker_handles.iter().any(|h| !h.is_finished())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let active = self.worker_handles.iter().filter(|h| !h.is_finished()).count();
        if active > 0 && !self.cancellation_token.is_cancelled() {
            warn!(active_workers = active, "worker pool dropped without shutdown, cancelling");
            self.cancellation_token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use pgbus_core::TestClock;

    use super::*;
    use crate::{client::PushClient, storage::mock::MockPushStorage};

    fn pool(worker_count: usize, token: CancellationToken) -> (WorkerPool, Arc<RwLock<EngineStats>>) {
        let storage: Arc<dyn PushStorage> = Arc::new(MockPushStorage::new());
        let clock: Arc<dyn Clock> = Arc::new(TestClock::new());
        let config = DeliveryConfig {
            worker_count,
            poll_interval: Duration::from_millis(5),
            ..DeliveryConfig::default()
        };
        let driver = Arc::new(PushDriver::new(
            storage.clone(),
            Arc::new(PushClient::with_defaults().unwrap()),
            config.retry_policy.clone(),
            clock.clone(),
        ));
        let stats = Arc::new(RwLock::new(EngineStats::default()));
        (WorkerPool::new(storage, config, driver, stats.clone(), token, clock), stats)
    }

    #[tokio::test]
    async fn spawn_and_shutdown() {
        let (mut pool, stats) = pool(3, CancellationToken::new());

        pool.spawn_workers().await.unwrap();
        assert!(pool.has_active_workers());
        assert_eq!(stats.read().await.active_workers, 3);

        pool.shutdown_graceful(Duration::from_secs(5)).await.unwrap();
        assert_eq!(stats.read().await.active_workers, 0);
    }

    #[tokio::test]
    async fn spawning_twice_is_rejected() {
        let (mut pool, _) = pool(1, CancellationToken::new());

        pool.spawn_workers().await.unwrap();
        assert!(pool.spawn_workers().await.is_err());
        pool.shutdown_graceful(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn drop_cancels_workers() {
        let token = CancellationToken::new();
        let (mut pool, _) = pool(2, token.clone());

        pool.spawn_workers().await.unwrap();
        drop(pool);

        assert!(token.is_cancelled());
    }
}
