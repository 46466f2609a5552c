//! Retry and dead-letter policy.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry policy configuration.
///
/// Backoff is exponential and capped: with the defaults an event that fails
/// its Nth attempt waits `min(2^N, 300)` seconds before it is eligible again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempt number at which a failing event is dead-lettered
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Bookkeeping `next_retry_at` offset for events dead-lettered without
    /// going through backoff (unknown type, permanent failure)
    pub dead_letter_cooldown: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(300),
            dead_letter_cooldown: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl RetryPolicy {
    /// Default policy with a different attempt budget.
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    /// Delay before the event may be retried after failing `attempt`
    /// (1-indexed).
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        // Past 2^31 every sane base is already over the cap.
        let exp = (attempt - 1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }

    /// Whether failing `attempt` exhausts the budget.
    pub fn is_exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}

/// Backoff under the default policy: 2s, 4s, 8s, ... capped at 300s.
pub fn compute_backoff(attempt: u32) -> Duration {
    RetryPolicy::default().backoff(attempt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn default_backoff_sequence() {
        let secs: Vec<u64> = (1..=9).map(|a| compute_backoff(a).as_secs()).collect();
        assert_eq!(secs, vec![2, 4, 8, 16, 32, 64, 128, 256, 300]);
    }

    #[test]
    fn backoff_stays_capped_for_huge_attempts() {
        assert_eq!(compute_backoff(40), Duration::from_secs(300));
        assert_eq!(compute_backoff(u32::MAX), Duration::from_secs(300));
    }

    #[test]
    fn zeroth_attempt_has_no_delay() {
        assert_eq!(compute_backoff(0), Duration::ZERO);
    }

    #[test]
    fn exhaustion_respects_max_attempts() {
        let policy = RetryPolicy::default();

        assert!(!policy.is_exhausted(1));
        assert!(!policy.is_exhausted(7));
        assert!(policy.is_exhausted(8));
        assert!(policy.is_exhausted(9));

        let policy = RetryPolicy::with_max_attempts(1);
        assert!(policy.is_exhausted(1));
    }

    proptest! {
        #[test]
        fn backoff_is_monotonic_and_bounded(attempt in 1u32..10_000) {
            let policy = RetryPolicy::default();
            let this = policy.backoff(attempt);
            let next = policy.backoff(attempt + 1);

            prop_assert!(this >= policy.base_delay);
            prop_assert!(this <= policy.max_delay);
            prop_assert!(next >= this);
        }
    }
}
