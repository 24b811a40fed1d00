//! Retry policy: attempt budget and backoff delays.

use std::time::Duration;

/// Capped exponential backoff with a fixed attempt budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts allowed per item, counting the first delivery.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after `attempt` failed (1-indexed).
    ///
    /// `base_delay * 2^(attempt - 1)`, capped at `max_delay`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exp)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// Whether an item that has used `attempt_count` attempts may be retried.
    pub fn can_retry(&self, attempt_count: u32) -> bool {
        attempt_count < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_from_base() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        };
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(2), Duration::from_secs(2));
        assert_eq!(policy.delay(3), Duration::from_secs(4));
        assert_eq!(policy.delay(4), Duration::from_secs(8));
    }

    #[test]
    fn delays_are_monotonic_and_capped() {
        let policy = RetryPolicy {
            max_attempts: 100,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
        };
        let mut prev = Duration::ZERO;
        for attempt in 1..=100 {
            let d = policy.delay(attempt);
            assert!(d >= prev, "attempt {attempt}: {d:?} < {prev:?}");
            assert!(d <= policy.max_delay);
            prev = d;
        }
        assert_eq!(policy.delay(100), Duration::from_secs(10));
    }

    #[test]
    fn attempt_zero_uses_base_delay() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(0), policy.base_delay);
    }

    #[test]
    fn retry_budget_counts_first_attempt() {
        let policy = RetryPolicy::default();
        assert!(policy.can_retry(4));
        assert!(!policy.can_retry(5));
    }
}
