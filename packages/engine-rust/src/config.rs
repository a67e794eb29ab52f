//! Engine configuration.

use std::time::Duration;

use fieldsync_core::DEFAULT_MAX_RETRIES;

/// Configuration for a [`SyncEngine`](crate::SyncEngine).
///
/// Controls queue sizing, worker concurrency, retry behaviour and the
/// intervals of the background listener and health tasks.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Total capacity of the event queue across all priority lanes.
    pub queue_capacity: usize,
    /// Number of processor pool workers.
    pub worker_count: usize,
    /// How long a worker waits for an event before re-checking for shutdown.
    pub poll_timeout: Duration,
    /// Delay before a failed change listener resubscribes.
    pub listener_restart_delay: Duration,
    /// Interval between health snapshots.
    pub health_interval: Duration,
    /// How long `stop()` waits for workers to finish their in-flight event.
    pub drain_timeout: Duration,
    /// Longest a single post-sync handler may run before it counts as failed.
    pub handler_timeout: Duration,
    /// Retry behaviour for failed events.
    pub retry: RetryPolicy,
    /// Drop change notifications produced by the engine's own writes.
    pub skip_engine_writes: bool,
    /// Start a listener when a rule for a new source collection is added at runtime.
    pub dynamic_listeners: bool,
}

impl EngineConfig {
    /// Sets the queue capacity.
    #[must_use]
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Sets the number of workers.
    #[must_use]
    pub fn with_worker_count(mut self, workers: usize) -> Self {
        self.worker_count = workers;
        self
    }

    /// Sets the worker poll timeout.
    #[must_use]
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Sets the listener restart delay.
    #[must_use]
    pub fn with_listener_restart_delay(mut self, delay: Duration) -> Self {
        self.listener_restart_delay = delay;
        self
    }

    /// Sets the health snapshot interval.
    #[must_use]
    pub fn with_health_interval(mut self, interval: Duration) -> Self {
        self.health_interval = interval;
        self
    }

    /// Sets the shutdown drain timeout.
    #[must_use]
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Sets the per-handler timeout.
    #[must_use]
    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Enables or disables echo suppression for engine-originated writes.
    #[must_use]
    pub fn with_skip_engine_writes(mut self, skip: bool) -> Self {
        self.skip_engine_writes = skip;
        self
    }

    /// Enables or disables runtime listener spawning.
    #[must_use]
    pub fn with_dynamic_listeners(mut self, enabled: bool) -> Self {
        self.dynamic_listeners = enabled;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            worker_count: 3,
            poll_timeout: Duration::from_secs(1),
            listener_restart_delay: Duration::from_secs(5),
            health_interval: Duration::from_secs(300),
            drain_timeout: Duration::from_secs(30),
            handler_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            skip_engine_writes: true,
            dynamic_listeners: true,
        }
    }
}

/// Retry behaviour for events whose propagation failed.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Failed attempts allowed before an event is dropped.
    pub max_retries: u32,
    /// Delay unit; the n-th retry waits `base_delay * multiplier^n`.
    pub base_delay: Duration,
    /// Multiplier for exponential backoff.
    pub multiplier: f64,
    /// Upper bound on a single backoff.
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Creates a policy with the given ceiling and default backoff.
    #[must_use]
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// Creates a policy that never retries.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            multiplier: 1.0,
            max_delay: Duration::ZERO,
        }
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    #[must_use]
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Backoff before re-enqueueing an event that has failed `retry_count` times.
    #[must_use]
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let exponent = i32::try_from(retry_count).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = secs.min(self.max_delay.as_secs_f64());
        if capped.is_finite() && capped > 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            Duration::ZERO
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(300),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.queue_capacity, 10_000);
        assert_eq!(config.worker_count, 3);
        assert_eq!(config.listener_restart_delay, Duration::from_secs(5));
        assert_eq!(config.health_interval, Duration::from_secs(300));
        assert_eq!(config.handler_timeout, Duration::from_secs(30));
        assert_eq!(config.retry.max_retries, 3);
        assert!(config.skip_engine_writes);
        assert!(config.dynamic_listeners);
    }

    #[test]
    fn engine_config_builder() {
        let config = EngineConfig::default()
            .with_queue_capacity(16)
            .with_worker_count(1)
            .with_poll_timeout(Duration::from_millis(10))
            .with_skip_engine_writes(false)
            .with_handler_timeout(Duration::from_millis(250))
            .with_retry(RetryPolicy::new(5));

        assert_eq!(config.queue_capacity, 16);
        assert_eq!(config.worker_count, 1);
        assert_eq!(config.poll_timeout, Duration::from_millis(10));
        assert!(!config.skip_engine_writes);
        assert_eq!(config.handler_timeout, Duration::from_millis(250));
        assert_eq!(config.retry.max_retries, 5);
    }

    #[test]
    fn default_backoff_is_two_to_the_retry_count_seconds() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
    }

    #[test]
    fn backoff_respects_max() {
        let policy = RetryPolicy::new(50)
            .with_base_delay(Duration::from_secs(1))
            .with_multiplier(10.0)
            .with_max_delay(Duration::from_secs(5));
        assert_eq!(policy.delay_for(4), Duration::from_secs(5));
        assert_eq!(policy.delay_for(40), Duration::from_secs(5));
    }

    #[test]
    fn no_retry_policy() {
        let policy = RetryPolicy::no_retry();
        assert_eq!(policy.max_retries, 0);
        assert_eq!(policy.delay_for(1), Duration::ZERO);
    }
}
