use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::job::job::DEFAULT_MAX_RETRY;
use crate::runner::error::QueueError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatcherConfig {
    pub redis_url: String,
    /// Size of the worker pool.
    pub worker_count: usize,
    /// Retry budget for payloads created through the dispatcher.
    pub max_retry: u32,
    /// First idle sleep of a poller that found nothing to do.
    pub poll_interval_ms: u64,
    /// Upper bound of the idle sleep.
    pub max_poll_interval_ms: u64,
    /// Longest a handler may run before the attempt counts as failed.
    pub job_timeout_ms: u64,
    /// Base delay before a failed job is offered to the fallback lane,
    /// doubled per retry already spent. Zero hands it over immediately.
    pub retry_backoff_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            worker_count: 2,
            max_retry: DEFAULT_MAX_RETRY,
            poll_interval_ms: 200,
            max_poll_interval_ms: 2_000,
            job_timeout_ms: 300_000,
            retry_backoff_ms: 0,
        }
    }
}

impl DispatcherConfig {
    /// Load configuration from defaults, `dispatch-q.toml` and `DISPATCH_Q_*`
    /// environment variables, later sources winning.
    pub fn load() -> Result<Self, QueueError> {
        Self::from_figment(
            Figment::from(Serialized::defaults(Self::default()))
                .merge(Toml::file("dispatch-q.toml"))
                .merge(Env::prefixed("DISPATCH_Q_")),
        )
    }

    pub fn from_figment(figment: Figment) -> Result<Self, QueueError> {
        let config: Self = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), QueueError> {
        if self.worker_count == 0 {
            return Err(QueueError::Config("worker_count must be > 0".to_string()));
        }
        if self.poll_interval_ms == 0 {
            return Err(QueueError::Config("poll_interval_ms must be > 0".to_string()));
        }
        if self.max_poll_interval_ms < self.poll_interval_ms {
            return Err(QueueError::Config(
                "max_poll_interval_ms must be >= poll_interval_ms".to_string(),
            ));
        }
        if self.job_timeout_ms == 0 {
            return Err(QueueError::Config("job_timeout_ms must be > 0".to_string()));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn max_poll_interval(&self) -> Duration {
        Duration::from_millis(self.max_poll_interval_ms)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_millis(self.job_timeout_ms)
    }

    /// Delay before a job that already spent `retry` attempts is handed back.
    pub fn retry_backoff(&self, retry: u32) -> Duration {
        let factor = 2u64.saturating_pow(retry.min(16));
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor))
    }
}
