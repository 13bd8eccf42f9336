//! Exponential backoff with jitter for transient RPC failures.

use std::time::Duration;

use rand::Rng;

/// Retry policy for inclusion-proof queries.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one.
    pub max_attempts: u32,

    /// Delay after the first failed attempt.
    pub base_delay: Duration,

    /// Upper bound for any single delay.
    pub max_delay: Duration,

    /// Jitter fraction (0.0 to 1.0) applied symmetrically around the delay.
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.25,
        }
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again after `delay`.
    Retry { delay: Duration },
    /// Stop retrying.
    GiveUp { reason: String },
}

impl RetryPolicy {
    /// Policy without jitter, mostly for deterministic tests.
    pub fn fixed(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            jitter_factor: 0.0,
        }
    }

    /// Decide what follows failed attempt number `attempt` (1-based).
    pub fn decide(&self, attempt: u32, retryable: bool) -> RetryDecision {
        if !retryable {
            return RetryDecision::GiveUp {
                reason: "error is not retryable".to_string(),
            };
        }

        if attempt >= self.max_attempts {
            return RetryDecision::GiveUp {
                reason: format!("maximum attempts ({}) exhausted", self.max_attempts),
            };
        }

        RetryDecision::Retry {
            delay: self.delay_for(attempt),
        }
    }

    /// Backoff delay after failed attempt `attempt`: `base * 2^(attempt-1)`,
    /// capped at `max_delay`, then jittered.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let backoff = self
            .base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);

        self.apply_jitter(backoff)
    }

    fn apply_jitter(&self, delay: Duration) -> Duration {
        let factor = self.jitter_factor.clamp(0.0, 1.0);
        if factor == 0.0 || delay.is_zero() {
            return delay;
        }

        let spread = delay.as_secs_f64() * factor;
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_secs_f64((delay.as_secs_f64() + offset).max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff_is_capped() {
        let policy = RetryPolicy::fixed(10, Duration::from_secs(1), Duration::from_secs(5));

        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(4), Duration::from_secs(5));
        assert_eq!(policy.delay_for(40), Duration::from_secs(5));
    }

    #[test]
    fn test_gives_up_at_attempt_ceiling() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(10), Duration::from_secs(1));

        assert!(matches!(policy.decide(1, true), RetryDecision::Retry { .. }));
        assert!(matches!(policy.decide(2, true), RetryDecision::Retry { .. }));
        assert!(matches!(policy.decide(3, true), RetryDecision::GiveUp { .. }));
    }

    #[test]
    fn test_non_retryable_gives_up_immediately() {
        let policy = RetryPolicy::default();
        assert!(matches!(policy.decide(1, false), RetryDecision::GiveUp { .. }));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy {
            jitter_factor: 0.25,
            ..RetryPolicy::fixed(5, Duration::from_secs(4), Duration::from_secs(60))
        };

        for _ in 0..100 {
            let delay = policy.delay_for(1);
            assert!(delay >= Duration::from_secs(3), "{:?}", delay);
            assert!(delay <= Duration::from_secs(5), "{:?}", delay);
        }
    }
}
