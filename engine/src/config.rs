//! Engine configuration.

use crate::log::LogConfig;
use crate::ClientId;
use std::time::Duration;

/// Default cap on operations kept in a file envelope.
pub const DEFAULT_MAX_RECENT_OPS: usize = 500;

/// Configuration for a sync engine instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Stable id of this installation.
    pub client_id: ClientId,
    /// Operations kept in a file envelope before the oldest are trimmed.
    pub max_recent_ops: usize,
    /// Attempts before a failing remote operation is given up.
    pub max_apply_attempts: u32,
    /// Backoff for version races and whole-cycle retries.
    pub retry: RetryConfig,
    /// Age after which synced operations may be compacted away.
    pub compaction_retention: Duration,
    /// Maximum log entries. `None` means unbounded.
    pub log_capacity: Option<usize>,
}

impl EngineConfig {
    /// Creates a configuration with defaults for the given client.
    pub fn new(client_id: impl Into<ClientId>) -> Self {
        Self {
            client_id: client_id.into(),
            max_recent_ops: DEFAULT_MAX_RECENT_OPS,
            max_apply_attempts: 3,
            retry: RetryConfig::default(),
            compaction_retention: Duration::from_secs(7 * 24 * 60 * 60),
            log_capacity: None,
        }
    }

    pub fn with_max_recent_ops(mut self, max: usize) -> Self {
        self.max_recent_ops = max.max(1);
        self
    }

    pub fn with_max_apply_attempts(mut self, attempts: u32) -> Self {
        self.max_apply_attempts = attempts.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_compaction_retention(mut self, retention: Duration) -> Self {
        self.compaction_retention = retention;
        self
    }

    pub fn with_log_capacity(mut self, capacity: usize) -> Self {
        self.log_capacity = Some(capacity);
        self
    }

    /// Settings for the operation log.
    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            capacity: self.log_capacity,
        }
    }
}

/// Bounded exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, the first included.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for any delay.
    pub max_delay: Duration,
    /// Multiplier applied per retry.
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }

    /// A single attempt, no waiting.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Delay before attempt `attempt` (0-indexed). The first attempt never waits.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let delay_secs =
            self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        Duration::from_secs_f64(delay_secs.min(self.max_delay.as_secs_f64()))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(5)
    }
}
