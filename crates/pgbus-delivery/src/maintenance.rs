//! Background maintenance: lease reaper and fan-out recovery sweep.

use std::{sync::Arc, time::Duration};

use pgbus_core::{error::Result, Clock, Storage};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{
    fanout::{FanOut, FanOutEngine},
    notify::NotifyDriver,
};

/// Maintenance loop settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    /// Pause between passes.
    pub interval: Duration,
    /// Messages fanned out per recovery pass.
    pub sweep_batch_size: usize,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self { interval: Duration::from_secs(5), sweep_batch_size: 100 }
    }
}

/// What one pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Expired leases returned to `new`.
    pub leases_released: u64,
    /// Messages fanned out by the sweep.
    pub messages_recovered: usize,
    /// Records created by the sweep.
    pub records_created: usize,
}

/// Periodic housekeeping task.
pub struct Maintenance {
    storage: Storage,
    fanout: FanOutEngine,
    notify: Option<NotifyDriver>,
    config: MaintenanceConfig,
    clock: Arc<dyn Clock>,
    cancellation_token: CancellationToken,
}

impl Maintenance {
    /// Creates the task; it stops when `cancellation_token` is cancelled.
    pub fn new(
        storage: Storage,
        notify: Option<NotifyDriver>,
        config: MaintenanceConfig,
        clock: Arc<dyn Clock>,
        cancellation_token: CancellationToken,
    ) -> Self {
        let fanout = FanOutEngine::new(storage.clone());
        Self { storage, fanout, notify, config, clock, cancellation_token }
    }

    /// Releases expired leases, then recovers missing fan-out.
    ///
    /// # Errors
    ///
    /// Returns the first store error; the lease release is kept even if the
    /// sweep fails.
    pub async fn run_once(&self) -> Result<MaintenanceReport> {
        let leases_released = self.storage.deliveries.release_expired_leases().await?;
        let recovered = self.fanout.recover(self.config.sweep_batch_size).await?;

        if let Some(notify) = &self.notify {
            for fan_out in &recovered {
                notify.broadcast(fan_out).await;
            }
        }

        let report = MaintenanceReport {
            leases_released,
            messages_recovered: recovered.len(),
            records_created: recovered.iter().map(FanOut::created_count).sum(),
        };

        if report != MaintenanceReport::default() {
            info!(
                leases_released = report.leases_released,
                messages_recovered = report.messages_recovered,
                records_created = report.records_created,
                "maintenance pass"
            );
        }
        Ok(report)
    }

    /// Runs passes every `interval` until cancelled. Errors are logged.
    pub async fn run(&self) {
        info!(interval_ms = self.config.interval.as_millis(), "maintenance loop starting");

        loop {
            if self.cancellation_token.is_cancelled() {
                break;
            }

            if let Err(error) = self.run_once().await {
                error!(error = %error, transient = error.is_transient(), "maintenance pass failed");
            }

            tokio::select! {
                () = self.clock.sleep(self.config.interval) => {}
                () = self.cancellation_token.cancelled() => break,
            }
        }

        debug!("maintenance loop stopped");
    }

    /// Spawns [`Self::run`] on the runtime.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }
}

#[cfg(test)]
mod tests {
    use pgbus_core::TestClock;
    use sqlx::PgPool;

    use super::*;

    #[tokio::test]
    async fn cancelled_loop_exits_without_touching_the_store() {
        let pool = PgPool::connect_lazy("postgresql://localhost:1/unused").unwrap();
        let token = CancellationToken::new();
        let clock = TestClock::new();
        let maintenance = Maintenance::new(
            Storage::new(pool),
            None,
            MaintenanceConfig::default(),
            Arc::new(clock.clone()),
            token.clone(),
        );

        token.cancel();
        maintenance.spawn().await.unwrap();
        assert_eq!(clock.sleep_count(), 0);
    }
}
