//! Scheduler configuration.
//!
//! Settings are assembled from built-in defaults overridden by `SCHEDULER_*`
//! environment variables. `sanity_check` runs at startup and is fatal on
//! failure; a scheduler with a nonsensical polling interval must never enter
//! service.

use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, SchedulerError};

/// Runtime configuration for the queue manager and its poller.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Name of the cluster entity whose topology this instance serves.
    pub cluster_name: String,
    /// Connection string for the registry database.
    pub database_url: String,
    /// Delay between poller ticks.
    pub polling_interval: Duration,
    /// Fallback timeout for jobs whose queue defines none.
    pub default_queue_timeout: Duration,
    /// Hosts idle longer than this are retired by the poller.
    pub host_idle_timeout: Duration,
    /// How long a retiring host may take to wind down its jobs.
    pub host_stop_timeout: Duration,
    /// Load the full database layout with the topology. Disabled for
    /// lightweight test runs that only need queues.
    pub layout_required: bool,
}

/// Raw deserialization target for the `config` crate; durations arrive as
/// integer milliseconds / seconds and are converted in `load`.
#[derive(Debug, Deserialize)]
struct RawConfig {
    cluster_name: String,
    database_url: String,
    polling_interval_ms: u64,
    default_queue_timeout_secs: u64,
    host_idle_timeout_secs: u64,
    host_stop_timeout_secs: u64,
    layout_required: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            cluster_name: "Cluster".to_string(),
            database_url: "postgresql://localhost/scheduler_registry".to_string(),
            polling_interval: Duration::from_secs(5),
            default_queue_timeout: Duration::from_secs(3600),
            host_idle_timeout: Duration::from_secs(900),
            host_stop_timeout: Duration::from_secs(60),
            layout_required: true,
        }
    }
}

impl SchedulerConfig {
    /// Load configuration from defaults plus `SCHEDULER_*` environment
    /// variables (e.g. `SCHEDULER_POLLING_INTERVAL_MS=2000`).
    pub fn load() -> Result<Self> {
        let defaults = Self::default();

        let raw: RawConfig = config::Config::builder()
            .set_default("cluster_name", defaults.cluster_name.clone())
            .and_then(|b| b.set_default("database_url", defaults.database_url.clone()))
            .and_then(|b| {
                b.set_default(
                    "polling_interval_ms",
                    defaults.polling_interval.as_millis() as u64,
                )
            })
            .and_then(|b| {
                b.set_default(
                    "default_queue_timeout_secs",
                    defaults.default_queue_timeout.as_secs(),
                )
            })
            .and_then(|b| {
                b.set_default("host_idle_timeout_secs", defaults.host_idle_timeout.as_secs())
            })
            .and_then(|b| {
                b.set_default("host_stop_timeout_secs", defaults.host_stop_timeout.as_secs())
            })
            .and_then(|b| b.set_default("layout_required", defaults.layout_required))
            .map_err(|e| SchedulerError::Configuration(e.to_string()))?
            .add_source(config::Environment::with_prefix("SCHEDULER"))
            .build()
            .map_err(|e| SchedulerError::Configuration(e.to_string()))?
            .try_deserialize()
            .map_err(|e| SchedulerError::Configuration(e.to_string()))?;

        Ok(Self {
            cluster_name: raw.cluster_name,
            database_url: raw.database_url,
            polling_interval: Duration::from_millis(raw.polling_interval_ms),
            default_queue_timeout: Duration::from_secs(raw.default_queue_timeout_secs),
            host_idle_timeout: Duration::from_secs(raw.host_idle_timeout_secs),
            host_stop_timeout: Duration::from_secs(raw.host_stop_timeout_secs),
            layout_required: raw.layout_required,
        })
    }

    /// Validate the assembled configuration. Called by the queue manager
    /// before anything else happens; an error here aborts startup.
    pub fn sanity_check(&self) -> Result<()> {
        if self.cluster_name.trim().is_empty() {
            return Err(SchedulerError::Configuration(
                "cluster_name must not be empty".to_string(),
            ));
        }

        if self.polling_interval.is_zero() {
            return Err(SchedulerError::Configuration(
                "polling_interval must be positive".to_string(),
            ));
        }

        if self.default_queue_timeout.is_zero() {
            return Err(SchedulerError::Configuration(
                "default_queue_timeout must be positive".to_string(),
            ));
        }

        if self.host_idle_timeout < self.polling_interval {
            return Err(SchedulerError::Configuration(
                "host_idle_timeout must be at least one polling interval".to_string(),
            ));
        }

        Ok(())
    }
}
