//! Database configuration.

use std::time::Duration;

/// Default number of queue jobs held in memory at once.
pub const DEFAULT_QUEUE_BATCH_SIZE: usize = 100;

/// Default number of delivery attempts for an outbound event.
pub const DEFAULT_DELIVERY_ATTEMPTS: u32 = 5;

/// Configuration for opening a database.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of queue jobs hydrated from the datastore per batch.
    pub queue_batch_size: usize,

    /// Retry policy for delivering outbound events.
    pub retry: RetryConfig,

    /// Lock timeout used by transactions that don't pass one explicitly.
    /// `None` waits indefinitely.
    pub lock_timeout: Option<Duration>,

    /// How long an identity token is reused before being fetched again.
    pub token_ttl: Duration,

    /// Whether file datastores opened through [`crate::Database::open_path`]
    /// flush every append to disk.
    pub sync_on_write: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            queue_batch_size: DEFAULT_QUEUE_BATCH_SIZE,
            retry: RetryConfig::default(),
            lock_timeout: None,
            token_ttl: Duration::from_secs(30 * 60),
            sync_on_write: true,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the queue batch size. Values below 1 are treated as 1.
    #[must_use]
    pub fn queue_batch_size(mut self, size: usize) -> Self {
        self.queue_batch_size = size.max(1);
        self
    }

    /// Sets the delivery retry policy.
    #[must_use]
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the default transaction lock timeout.
    #[must_use]
    pub const fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    /// Sets the token cache lifetime.
    #[must_use]
    pub const fn token_ttl(mut self, ttl: Duration) -> Self {
        self.token_ttl = ttl;
        self
    }

    /// Enables or disables syncing file datastores after every write.
    #[must_use]
    pub const fn sync_on_write(mut self, value: bool) -> Self {
        self.sync_on_write = value;
        self
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, add_jitter: bool) -> Self {
        self.add_jitter = add_jitter;
        self
    }

    /// Calculates the delay before a given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_delay = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);

        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            // Up to 25% jitter
            let jitter = delay_secs * 0.25 * rand::random::<f64>();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(DEFAULT_DELIVERY_ATTEMPTS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.queue_batch_size, 100);
        assert_eq!(config.retry.max_attempts, 5);
        assert!(config.lock_timeout.is_none());
        assert!(config.sync_on_write);
    }

    #[test]
    fn builder_pattern() {
        let config = Config::new()
            .queue_batch_size(0)
            .lock_timeout(Duration::from_millis(250))
            .retry(RetryConfig::no_retry())
            .sync_on_write(false);

        assert_eq!(config.queue_batch_size, 1);
        assert_eq!(config.lock_timeout, Some(Duration::from_millis(250)));
        assert_eq!(config.retry.max_attempts, 1);
        assert!(!config.sync_on_write);
    }

    #[test]
    fn retry_delay_calculation() {
        let config = RetryConfig::new(5)
            .with_initial_delay(Duration::from_millis(100))
            .with_backoff_multiplier(2.0);

        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);

        let delay1 = config.delay_for_attempt(1);
        assert!(delay1 >= Duration::from_millis(100));
        assert!(delay1 <= Duration::from_millis(125));

        let delay3 = config.delay_for_attempt(3);
        assert!(delay3 >= Duration::from_millis(400));
    }

    #[test]
    fn retry_delay_respects_max() {
        let config = RetryConfig::new(10)
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5))
            .with_backoff_multiplier(10.0)
            .with_jitter(false);

        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(5));
    }
}
