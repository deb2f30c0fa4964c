//! Configuration for the sync engine.

use atelier_model::EntityKind;
use rand::Rng;
use std::collections::BTreeSet;
use std::time::Duration;

/// Configuration for sync operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Maximum number of remote calls in flight within a drain cycle.
    pub concurrency: usize,
    /// Period of the automatic drain trigger (`None` disables it).
    pub sync_interval: Option<Duration>,
    /// Bounded wait for every remote call; exceeding it counts as
    /// `NetworkUnavailable`.
    pub request_timeout: Duration,
    /// How many times one write may be rebased onto a newer remote version
    /// before it is flagged for manual review.
    pub max_conflict_rebases: u32,
    /// Retry configuration for transport failures.
    pub retry: RetryConfig,
    /// Kinds whose local writes are never rebased over a newer remote
    /// version automatically.
    ///
    /// A strictly newer remote version is still accepted for these kinds;
    /// only the "local write wins" outcome is turned into a manual conflict.
    pub no_auto_merge: BTreeSet<EntityKind>,
}

impl SyncConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self {
            concurrency: 4,
            sync_interval: Some(Duration::from_secs(30)),
            request_timeout: Duration::from_secs(15),
            max_conflict_rebases: 3,
            retry: RetryConfig::default(),
            no_auto_merge: [EntityKind::Invoice, EntityKind::InvoiceItem]
                .into_iter()
                .collect(),
        }
    }

    /// Sets the in-flight cap (at least 1).
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Sets the periodic drain interval.
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = Some(interval);
        self
    }

    /// Disables the periodic drain trigger.
    pub fn without_sync_interval(mut self) -> Self {
        self.sync_interval = None;
        self
    }

    /// Sets the per-call timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the rebase budget per write.
    pub fn with_max_conflict_rebases(mut self, rebases: u32) -> Self {
        self.max_conflict_rebases = rebases;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Replaces the set of no-auto-merge kinds.
    pub fn with_no_auto_merge(mut self, kinds: impl IntoIterator<Item = EntityKind>) -> Self {
        self.no_auto_merge = kinds.into_iter().collect();
        self
    }

    /// Returns true if local writes of `kind` must not be rebased
    /// automatically.
    pub fn is_no_auto_merge(&self, kind: EntityKind) -> bool {
        self.no_auto_merge.contains(&kind)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts before an entry is dead-lettered.
    pub max_attempts: u32,
    /// Delay after the first failure.
    pub initial_delay: Duration,
    /// Upper bound for the exponential delay (before jitter).
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add up to 25% random jitter.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a retry configuration with the given attempt budget.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5 * 60),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration that dead-letters on the first failure.
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
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.add_jitter = jitter;
        self
    }

    /// Delay before the next try after `attempt` failures (0 = no delay).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let base = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped = base.min(self.max_delay.as_secs_f64());

        if self.add_jitter && capped > 0.0 {
            let jitter = capped * 0.25 * rand::thread_rng().gen::<f64>();
            Duration::from_secs_f64(capped + jitter)
        } else {
            Duration::from_secs_f64(capped)
        }
    }

    /// Returns true once `attempts` failures exhaust the budget.
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.sync_interval, Some(Duration::from_secs(30)));
        assert_eq!(config.retry.max_attempts, 8);
        assert!(config.is_no_auto_merge(EntityKind::Invoice));
        assert!(!config.is_no_auto_merge(EntityKind::Customer));
    }

    #[test]
    fn sync_config_builder() {
        let config = SyncConfig::new()
            .with_concurrency(0)
            .without_sync_interval()
            .with_request_timeout(Duration::from_secs(2))
            .with_no_auto_merge([EntityKind::Order]);

        assert_eq!(config.concurrency, 1);
        assert!(config.sync_interval.is_none());
        assert_eq!(config.request_timeout, Duration::from_secs(2));
        assert!(config.is_no_auto_merge(EntityKind::Order));
        assert!(!config.is_no_auto_merge(EntityKind::Invoice));
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
        assert!(delay3 <= Duration::from_millis(500));
    }

    #[test]
    fn retry_delay_respects_max() {
        let config = RetryConfig::new(10)
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5))
            .with_backoff_multiplier(10.0);

        let delay = config.delay_for_attempt(40);
        assert!(delay >= Duration::from_secs(5));
        assert!(delay <= Duration::from_millis(6250));
    }

    #[test]
    fn exhaustion() {
        let config = RetryConfig::new(3);
        assert!(!config.is_exhausted(2));
        assert!(config.is_exhausted(3));
        assert!(RetryConfig::no_retry().is_exhausted(1));
    }
}
