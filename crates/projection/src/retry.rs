//! Retry backoff policy.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt-1)
    Exponential,
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential
    }
}

/// Backoff configuration for rescheduling failed tasks.
///
/// The default reproduces the production ladder: 1s, 2s, 4s, 8s, 16s, 32s,
/// 64s, then capped at 120s.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0) to add randomness
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(120),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.0,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with fixed delays.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.0,
        }
    }

    /// Calculate the delay before a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms.min(max_ms),
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi((attempt - 1).min(62) as i32);
                (base_ms * exp).min(max_ms)
            }
        };

        // Apply jitter
        let jitter_range = delay_ms * self.jitter;
        let jitter = if jitter_range > 0.0 {
            // Deterministic "jitter" derived from the attempt number
            let pseudo_random = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn default_policy_matches_the_production_ladder() {
        let policy = RetryPolicy::default();

        let ladder: Vec<u64> = (1..=8)
            .map(|a| policy.delay_for_attempt(a).as_secs())
            .collect();
        assert_eq!(ladder, vec![1, 2, 4, 8, 16, 32, 64, 120]);

        // Past the cap the delay stays flat.
        assert_eq!(policy.delay_for_attempt(20), Duration::from_secs(120));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = RetryPolicy::fixed(Duration::from_millis(500));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(9), Duration::from_millis(500));
    }

    #[test]
    fn jitter_is_deterministic_and_bounded() {
        let bare = RetryPolicy::default();
        let jittered = RetryPolicy {
            jitter: 0.5,
            ..RetryPolicy::default()
        };

        for attempt in 1..=8u32 {
            let base_ms = bare.delay_for_attempt(attempt).as_millis() as i64;
            let got_ms = jittered.delay_for_attempt(attempt).as_millis() as i64;

            // Same attempt always yields the same delay.
            assert_eq!(
                jittered.delay_for_attempt(attempt),
                jittered.delay_for_attempt(attempt)
            );
            // Deviation stays within the configured fraction of the base.
            assert!(
                (got_ms - base_ms).abs() <= base_ms / 2 + 1,
                "attempt {attempt}: {got_ms}ms strays too far from {base_ms}ms"
            );
        }

        // The knob actually moves the schedule off the bare ladder.
        assert_ne!(
            jittered.delay_for_attempt(1),
            bare.delay_for_attempt(1)
        );
    }

    #[test]
    fn attempt_zero_has_no_delay() {
        assert_eq!(
            RetryPolicy::default().delay_for_attempt(0),
            Duration::ZERO
        );
    }

    proptest! {
        #[test]
        fn exponential_delay_never_decreases(attempt in 1u32..64) {
            let policy = RetryPolicy::default();
            prop_assert!(
                policy.delay_for_attempt(attempt + 1) >= policy.delay_for_attempt(attempt)
            );
        }

        #[test]
        fn delay_never_exceeds_the_cap(attempt in 1u32..1000, base_ms in 1u64..5000) {
            let policy = RetryPolicy::exponential(
                Duration::from_millis(base_ms),
                Duration::from_secs(120),
            );
            prop_assert!(policy.delay_for_attempt(attempt) <= Duration::from_secs(120));
        }
    }
}
