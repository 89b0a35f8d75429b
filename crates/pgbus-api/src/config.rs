//! Configuration for the pgbus service.

use std::{net::SocketAddr, str::FromStr, time::Duration};

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use pgbus_delivery::{
    client::ClientConfig, maintenance::MaintenanceConfig, pull::PullConfig, retry::RetryPolicy,
    worker::DeliveryConfig,
};
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "pgbus.toml";

const ENV_PREFIX: &str = "PGBUS_";

/// Complete service configuration.
///
/// Loaded in priority order, highest first:
/// 1. `PGBUS_`-prefixed environment variables (`PGBUS_PORT=9090`)
/// 2. plain `DATABASE_URL`
/// 3. `pgbus.toml` in the working directory
/// 4. built-in defaults
///
/// # Example
///
/// ```no_run
/// use pgbus_api::Config;
///
/// let config = Config::load().expect("Failed to load configuration");
/// println!("Server will bind to {}:{}", config.host, config.port);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // Database
    /// PostgreSQL connection URL.
    pub database_url: String,
    /// Maximum number of pooled connections.
    pub database_max_connections: u32,
    /// Connections kept open while idle.
    pub database_min_connections: u32,
    /// Pool acquire timeout in seconds.
    pub database_acquire_timeout_secs: u64,
    /// Attempts to reach the database at startup.
    pub database_connect_attempts: u32,

    // Server
    /// Bind address.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,

    // Push
    /// Run the push worker pool in this process.
    pub push_enabled: bool,
    /// Number of concurrent push workers.
    pub worker_count: usize,
    /// Records claimed per worker batch.
    pub batch_size: usize,
    /// Idle poll interval in milliseconds.
    pub poll_interval_ms: u64,
    /// Lease on claimed push records in seconds, renewed before each attempt.
    ///
    /// Must exceed `delivery_timeout_secs`; it bounds one attempt, not a
    /// whole batch.
    pub push_lease_timeout_secs: u64,
    /// Webhook request timeout in seconds.
    pub delivery_timeout_secs: u64,
    /// Seconds to wait for workers on shutdown.
    pub shutdown_timeout_secs: u64,

    // Retry
    /// Push attempts before a record fails.
    pub max_attempts: u32,
    /// First retry delay in milliseconds.
    pub retry_base_delay_ms: u64,
    /// Retry delay cap in milliseconds.
    pub retry_max_delay_ms: u64,
    /// Jitter factor between 0.0 and 1.0.
    pub retry_jitter_factor: f64,
    /// Cap on honoured `Retry-After` values in seconds.
    pub max_retry_after_secs: u64,

    // Pull
    /// Dequeue size when the caller gives none.
    pub pull_default_batch_size: usize,
    /// Largest dequeue.
    pub pull_max_batch_size: usize,
    /// Lease on dequeued records in seconds.
    pub pull_lease_timeout_secs: u64,

    // Notify
    /// Send `pg_notify` hints after publish.
    pub notify_enabled: bool,

    // Maintenance
    /// Seconds between maintenance passes.
    pub maintenance_interval_secs: u64,
    /// Messages recovered per pass.
    pub sweep_batch_size: usize,

    // Logging
    /// Filter used when `RUST_LOG` is unset.
    pub log_filter: String,
}

impl Config {
    /// Loads configuration from defaults, `pgbus.toml` and the environment.
    ///
    /// # Errors
    ///
    /// Returns error if a source cannot be parsed or validation fails.
    pub fn load() -> Result<Self> {
        Self::from_figment(Self::figment())
    }

    /// Layered provider used by [`Self::load`].
    pub fn figment() -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(CONFIG_FILE))
            .merge(Env::raw().only(&["DATABASE_URL"]))
            .merge(Env::prefixed(ENV_PREFIX))
    }

    /// Extracts and validates configuration from any figment.
    ///
    /// # Errors
    ///
    /// Returns error if extraction or validation fails.
    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: Self = figment.extract().context("Failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Push engine configuration.
    pub fn to_delivery_config(&self) -> DeliveryConfig {
        DeliveryConfig {
            worker_count: self.worker_count,
            batch_size: self.batch_size,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            lease_timeout: Duration::from_secs(self.push_lease_timeout_secs),
            client_config: self.to_client_config(),
            retry_policy: self.to_retry_policy(),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_secs),
        }
    }

    /// Webhook client configuration.
    pub fn to_client_config(&self) -> ClientConfig {
        ClientConfig {
            timeout: Duration::from_secs(self.delivery_timeout_secs),
            ..ClientConfig::default()
        }
    }

    /// Push retry policy.
    pub fn to_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            jitter_factor: self.retry_jitter_factor,
            max_retry_after: Duration::from_secs(self.max_retry_after_secs),
        }
    }

    /// Pull driver configuration.
    pub fn to_pull_config(&self) -> PullConfig {
        PullConfig {
            default_batch_size: self.pull_default_batch_size,
            max_batch_size: self.pull_max_batch_size,
            lease_timeout: Duration::from_secs(self.pull_lease_timeout_secs),
            ..PullConfig::default()
        }
    }

    /// Maintenance loop configuration.
    pub fn to_maintenance_config(&self) -> MaintenanceConfig {
        MaintenanceConfig {
            interval: Duration::from_secs(self.maintenance_interval_secs),
            sweep_batch_size: self.sweep_batch_size,
        }
    }

    /// Per-request timeout for the HTTP server.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Parses the server socket address from host and port.
    ///
    /// # Errors
    ///
    /// Returns error if `host:port` is not a socket address.
    pub fn parse_server_addr(&self) -> Result<SocketAddr> {
        let addr_str = format!("{}:{}", self.host, self.port);
        SocketAddr::from_str(&addr_str).context("Invalid server address")
    }

    /// Database URL with the password masked, for logging.
    pub fn database_url_masked(&self) -> String {
        if let Some(at_pos) = self.database_url.rfind('@') {
            let scheme_end = self.database_url.find("://").map_or(0, |pos| pos + 3);
            if let Some(colon_pos) = self.database_url[scheme_end..at_pos].find(':') {
                let mut masked = self.database_url.clone();
                masked.replace_range(scheme_end + colon_pos + 1..at_pos, "***");
                return masked;
            }
        }
        self.database_url.clone()
    }

    fn validate(&self) -> Result<()> {
        if self.port == 0 {
            anyhow::bail!("port must be greater than 0");
        }

        if self.database_max_connections == 0 {
            anyhow::bail!("database_max_connections must be greater than 0");
        }

        if self.database_min_connections > self.database_max_connections {
            anyhow::bail!("database_min_connections cannot exceed database_max_connections");
        }

        if self.request_timeout_secs == 0 {
            anyhow::bail!("request_timeout_secs must be greater than 0");
        }

        if self.worker_count == 0 {
            anyhow::bail!("worker_count must be greater than 0");
        }

        if self.batch_size == 0 {
            anyhow::bail!("batch_size must be greater than 0");
        }

        if self.max_attempts == 0 {
            anyhow::bail!("max_attempts must be greater than 0");
        }

        if !(0.0..=1.0).contains(&self.retry_jitter_factor) {
            anyhow::bail!("retry_jitter_factor must be between 0.0 and 1.0");
        }

        if self.retry_base_delay_ms > self.retry_max_delay_ms {
            anyhow::bail!("retry_base_delay_ms cannot exceed retry_max_delay_ms");
        }

        if self.push_lease_timeout_secs <= self.delivery_timeout_secs {
            anyhow::bail!("push_lease_timeout_secs must exceed delivery_timeout_secs");
        }

        if self.pull_max_batch_size == 0 || self.pull_default_batch_size == 0 {
            anyhow::bail!("pull batch sizes must be greater than 0");
        }

        if self.pull_default_batch_size > self.pull_max_batch_size {
            anyhow::bail!("pull_default_batch_size cannot exceed pull_max_batch_size");
        }

        if self.pull_lease_timeout_secs == 0 {
            anyhow::bail!("pull_lease_timeout_secs must be greater than 0");
        }

        if self.maintenance_interval_secs == 0 {
            anyhow::bail!("maintenance_interval_secs must be greater than 0");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        let delivery = DeliveryConfig::default();
        let retry = RetryPolicy::default();
        let pull = PullConfig::default();
        let maintenance = MaintenanceConfig::default();

        Self {
            database_url: "postgresql://localhost/pgbus".to_string(),
            database_max_connections: 10,
            database_min_connections: 2,
            database_acquire_timeout_secs: 10,
            database_connect_attempts: 5,
            host: "127.0.0.1".to_string(),
            port: 8080,
            request_timeout_secs: 30,
            push_enabled: true,
            worker_count: delivery.worker_count,
            batch_size: delivery.batch_size,
            poll_interval_ms: u64::try_from(delivery.poll_interval.as_millis()).unwrap_or(1000),
            push_lease_timeout_secs: delivery.lease_timeout.as_secs(),
            delivery_timeout_secs: pgbus_delivery::DEFAULT_TIMEOUT_SECONDS,
            shutdown_timeout_secs: delivery.shutdown_timeout.as_secs(),
            max_attempts: retry.max_attempts,
            retry_base_delay_ms: u64::try_from(retry.base_delay.as_millis()).unwrap_or(1000),
            retry_max_delay_ms: u64::try_from(retry.max_delay.as_millis()).unwrap_or(300_000),
            retry_jitter_factor: retry.jitter_factor,
            max_retry_after_secs: retry.max_retry_after.as_secs(),
            pull_default_batch_size: pull.default_batch_size,
            pull_max_batch_size: pull.max_batch_size,
            pull_lease_timeout_secs: pull.lease_timeout.as_secs(),
            notify_enabled: true,
            maintenance_interval_secs: maintenance.interval.as_secs(),
            sweep_batch_size: maintenance.sweep_batch_size,
            log_filter: "info,pgbus=debug,tower_http=debug".to_string(),
        }
    }
}
