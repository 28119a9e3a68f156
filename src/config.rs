//! Configuration for queues, task engines and store connections.
//!
//! Every policy knob is an explicit field set at construction time; there is
//! no per-instance override mechanism beyond these structs.

use std::time::Duration;

/// Default key prefix for acknowledged queues.
pub const DEFAULT_QUEUE_PREFIX: &str = "redisson_ack_queue";

/// Default key prefix for delayed task engines.
pub const DEFAULT_TASK_PREFIX: &str = "redisson_delay_task";

/// Maximum number of entries a single sweep script touches.
pub const DEFAULT_SWEEP_BATCH: usize = 100;

/// Policy for an acknowledged queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    /// How long a popped message stays hidden before it is redelivered.
    pub visibility_timeout: Duration,
    /// Retry budget: negative retries forever, zero dead-letters on the
    /// first failure, otherwise the number of re-queues allowed.
    pub retry_budget: i64,
    /// Maximum expired entries handled per timeout sweep.
    pub sweep_batch: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(300), // 5 minutes
            retry_budget: 5,
            sweep_batch: DEFAULT_SWEEP_BATCH,
        }
    }
}

impl QueueConfig {
    /// Sets the visibility timeout.
    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    /// Sets the retry budget.
    pub fn with_retry_budget(mut self, budget: i64) -> Self {
        self.retry_budget = budget;
        self
    }

    /// Sets the sweep batch size.
    pub fn with_sweep_batch(mut self, batch: usize) -> Self {
        self.sweep_batch = batch.max(1);
        self
    }
}

/// Policy for a delayed task engine.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskConfig {
    /// How long a handler may run before the task is considered lost.
    pub visibility_timeout: Duration,
    /// Delay before a failed or timed-out task runs again.
    pub retry_delay: Duration,
    /// Retry budget with the same semantics as [`QueueConfig::retry_budget`].
    /// Defaults to `-1`: tasks retry forever.
    pub retry_budget: i64,
    /// Maximum entries handled per promotion or timeout sweep.
    pub sweep_batch: usize,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(180), // 3 minutes
            retry_delay: Duration::from_secs(300),        // 5 minutes
            retry_budget: -1,
            sweep_batch: DEFAULT_SWEEP_BATCH,
        }
    }
}

impl TaskConfig {
    /// Sets the visibility timeout.
    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    /// Sets the retry delay.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Sets the retry budget.
    pub fn with_retry_budget(mut self, budget: i64) -> Self {
        self.retry_budget = budget;
        self
    }

    /// Sets the sweep batch size.
    pub fn with_sweep_batch(mut self, batch: usize) -> Self {
        self.sweep_batch = batch.max(1);
        self
    }
}

/// Connection settings for the Redis store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreConfig {
    /// Redis connection URL.
    pub redis_url: String,
    /// Key prefix for acknowledged queues.
    pub queue_prefix: String,
    /// Key prefix for delayed task engines.
    pub task_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            queue_prefix: DEFAULT_QUEUE_PREFIX.to_string(),
            task_prefix: DEFAULT_TASK_PREFIX.to_string(),
        }
    }
}

impl StoreConfig {
    /// Reads `REDIS_URL`, `ACKQUEUE_QUEUE_PREFIX` and `ACKQUEUE_TASK_PREFIX`,
    /// falling back to the defaults for anything unset.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            redis_url: std::env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            queue_prefix: std::env::var("ACKQUEUE_QUEUE_PREFIX").unwrap_or(defaults.queue_prefix),
            task_prefix: std::env::var("ACKQUEUE_TASK_PREFIX").unwrap_or(defaults.task_prefix),
        }
    }

    /// Sets the Redis URL.
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    /// Sets the queue key prefix.
    pub fn with_queue_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.queue_prefix = prefix.into();
        self
    }

    /// Sets the task key prefix.
    pub fn with_task_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.task_prefix = prefix.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_config_default() {
        let config = QueueConfig::default();

        assert_eq!(config.visibility_timeout, Duration::from_secs(300));
        assert_eq!(config.retry_budget, 5);
        assert_eq!(config.sweep_batch, 100);
    }

    #[test]
    fn test_queue_config_builder() {
        let config = QueueConfig::default()
            .with_visibility_timeout(Duration::from_secs(1))
            .with_retry_budget(-1)
            .with_sweep_batch(0);

        assert_eq!(config.visibility_timeout, Duration::from_secs(1));
        assert_eq!(config.retry_budget, -1);
        assert_eq!(config.sweep_batch, 1);
    }

    #[test]
    fn test_task_config_default() {
        let config = TaskConfig::default();

        assert_eq!(config.visibility_timeout, Duration::from_secs(180));
        assert_eq!(config.retry_delay, Duration::from_secs(300));
        assert_eq!(config.retry_budget, -1);
        assert_eq!(config.sweep_batch, 100);
    }

    #[test]
    fn test_task_config_builder() {
        let config = TaskConfig::default()
            .with_visibility_timeout(Duration::from_millis(500))
            .with_retry_delay(Duration::from_millis(200))
            .with_retry_budget(3);

        assert_eq!(config.visibility_timeout, Duration::from_millis(500));
        assert_eq!(config.retry_delay, Duration::from_millis(200));
        assert_eq!(config.retry_budget, 3);
    }

    #[test]
    fn test_store_config_from_env() {
        std::env::set_var("ACKQUEUE_QUEUE_PREFIX", "env-queues");
        std::env::remove_var("ACKQUEUE_TASK_PREFIX");

        let config = StoreConfig::from_env();
        std::env::remove_var("ACKQUEUE_QUEUE_PREFIX");

        assert_eq!(config.queue_prefix, "env-queues");
        assert_eq!(config.task_prefix, DEFAULT_TASK_PREFIX);
        let expected_url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
        assert_eq!(config.redis_url, expected_url);
    }

    #[test]
    fn test_store_config_builder() {
        let config = StoreConfig::default()
            .with_redis_url("redis://custom:6380")
            .with_queue_prefix("q")
            .with_task_prefix("t");

        assert_eq!(config.redis_url, "redis://custom:6380");
        assert_eq!(config.queue_prefix, "q");
        assert_eq!(config.task_prefix, "t");
    }
}
