//! Background job configuration.

use std::time::Duration;

use courier_core::defaults;

/// Configuration for every background role.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Whether the runner starts any role at all.
    pub enabled: bool,
    /// Pause between unsent sweeps.
    pub delivery_interval: Duration,
    /// Notifications claimed per unsent sweep.
    pub delivery_batch_size: i64,
    /// Notifications delivered in parallel within one sweep.
    pub delivery_concurrency: usize,
    /// Deadline for one driver call.
    pub send_timeout: Duration,
    /// Attempt cap written on every new attempt.
    pub max_retries: i32,
    /// Pause between retry sweeps.
    pub retry_interval: Duration,
    /// Attempts retried per sweep.
    pub retry_batch_size: i64,
    /// Age after which a queued or processing attempt counts as abandoned.
    pub stale_after: chrono::Duration,
    /// Pause between cleanup sweeps.
    pub cleanup_interval: Duration,
    /// Read notifications older than this are deleted.
    pub read_retention: chrono::Duration,
    /// Pause between campaign passes.
    pub campaign_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            delivery_interval: Duration::from_secs(defaults::DELIVERY_INTERVAL_SECS),
            delivery_batch_size: defaults::DELIVERY_BATCH_SIZE,
            delivery_concurrency: defaults::DELIVERY_CONCURRENCY,
            send_timeout: Duration::from_secs(defaults::DELIVERY_SEND_TIMEOUT_SECS),
            max_retries: defaults::MAX_RETRIES,
            retry_interval: Duration::from_secs(defaults::RETRY_INTERVAL_SECS),
            retry_batch_size: defaults::RETRY_BATCH_SIZE,
            stale_after: chrono::Duration::minutes(defaults::STALE_PROCESSING_MINUTES),
            cleanup_interval: Duration::from_secs(defaults::CLEANUP_INTERVAL_SECS),
            read_retention: chrono::Duration::days(defaults::READ_RETENTION_DAYS),
            campaign_interval: Duration::from_secs(defaults::CAMPAIGN_INTERVAL_SECS),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

impl WorkerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `WORKER_ENABLED` | `true` | Enable/disable background processing |
    /// | `DELIVERY_INTERVAL_SECS` | `10` | Pause between unsent sweeps |
    /// | `DELIVERY_BATCH_SIZE` | `100` | Notifications per unsent sweep |
    /// | `DELIVERY_CONCURRENCY` | `8` | Parallel deliveries per sweep |
    /// | `DELIVERY_SEND_TIMEOUT_SECS` | `30` | Per-driver-call deadline |
    /// | `DELIVERY_MAX_RETRIES` | `3` | Attempt cap per channel |
    /// | `RETRY_INTERVAL_SECS` | `60` | Pause between retry sweeps |
    /// | `RETRY_BATCH_SIZE` | `100` | Attempts per retry sweep |
    /// | `STALE_PROCESSING_MINUTES` | `10` | Age of an abandoned attempt |
    /// | `CLEANUP_INTERVAL_SECS` | `3600` | Pause between cleanup sweeps |
    /// | `READ_RETENTION_DAYS` | `90` | Retention of read notifications |
    /// | `CAMPAIGN_INTERVAL_SECS` | `30` | Pause between campaign passes |
    pub fn from_env() -> Self {
        let d = Self::default();
        let enabled = std::env::var("WORKER_ENABLED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        Self {
            enabled,
            delivery_interval: env_parse("DELIVERY_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.delivery_interval),
            delivery_batch_size: env_parse("DELIVERY_BATCH_SIZE")
                .unwrap_or(d.delivery_batch_size)
                .max(1),
            delivery_concurrency: env_parse("DELIVERY_CONCURRENCY")
                .unwrap_or(d.delivery_concurrency)
                .max(1),
            send_timeout: env_parse("DELIVERY_SEND_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.send_timeout),
            max_retries: env_parse("DELIVERY_MAX_RETRIES")
                .unwrap_or(d.max_retries)
                .max(1),
            retry_interval: env_parse("RETRY_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.retry_interval),
            retry_batch_size: env_parse("RETRY_BATCH_SIZE")
                .unwrap_or(d.retry_batch_size)
                .max(1),
            stale_after: env_parse("STALE_PROCESSING_MINUTES")
                .map(chrono::Duration::minutes)
                .unwrap_or(d.stale_after),
            cleanup_interval: env_parse("CLEANUP_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.cleanup_interval),
            read_retention: env_parse("READ_RETENTION_DAYS")
                .map(chrono::Duration::days)
                .unwrap_or(d.read_retention),
            campaign_interval: env_parse("CAMPAIGN_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.campaign_interval),
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_delivery_interval(mut self, interval: Duration) -> Self {
        self.delivery_interval = interval;
        self
    }

    pub fn with_delivery_batch_size(mut self, size: i64) -> Self {
        self.delivery_batch_size = size;
        self
    }

    pub fn with_delivery_concurrency(mut self, n: usize) -> Self {
        self.delivery_concurrency = n.max(1);
        self
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max: i32) -> Self {
        self.max_retries = max;
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn with_stale_after(mut self, age: chrono::Duration) -> Self {
        self.stale_after = age;
        self
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    pub fn with_read_retention(mut self, retention: chrono::Duration) -> Self {
        self.read_retention = retention;
        self
    }

    pub fn with_campaign_interval(mut self, interval: Duration) -> Self {
        self.campaign_interval = interval;
        self
    }
}
