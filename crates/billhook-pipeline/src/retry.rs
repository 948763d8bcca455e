//! Exponential backoff policy for failed handler invocations.
//!
//! Delay for attempt n is `min(base_delay * 2^(n-1), max_delay)` with ±20%
//! jitter by default, so a burst of failures does not converge into a
//! thundering herd of simultaneous retries.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::HandlerError;

/// Retry policy configuration for event processing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the initial attempt).
    pub max_attempts: u32,

    /// Base delay for the exponential backoff calculation.
    pub base_delay: Duration,

    /// Ceiling on the delay between attempts.
    pub max_delay: Duration,

    /// Jitter fraction (0.0 to 1.0) applied to each delay.
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(30 * 60),
            jitter_factor: 0.2,
        }
    }
}

/// Context for deciding whether a failed attempt should be retried.
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// Attempts completed so far (1-based; includes the one that just
    /// failed).
    pub attempts_so_far: u32,
    /// The handler's classified failure.
    pub error: HandlerError,
    /// When the failed attempt completed.
    pub failed_at: DateTime<Utc>,
    /// Policy to apply.
    pub policy: RetryPolicy,
}

/// Result of the retry decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Schedule another attempt no earlier than `next_attempt_at`.
    Retry {
        /// Earliest time for the next attempt.
        next_attempt_at: DateTime<Utc>,
    },
    /// Stop retrying; the event is promoted to the dead letter.
    GiveUp {
        /// Why no further attempts will be made.
        reason: String,
    },
}

impl RetryContext {
    /// Creates a new retry context for a failed attempt.
    pub fn new(
        attempts_so_far: u32,
        error: HandlerError,
        failed_at: DateTime<Utc>,
        policy: RetryPolicy,
    ) -> Self {
        Self { attempts_so_far, error, failed_at, policy }
    }

    /// Determines if and when to retry based on the failure context.
    ///
    /// Permanent failures and an exhausted attempt budget both give up;
    /// everything else schedules the next attempt with backoff.
    pub fn decide_retry(&self) -> RetryDecision {
        if self.attempts_so_far >= self.policy.max_attempts {
            return RetryDecision::GiveUp {
                reason: format!("maximum attempts ({}) exceeded", self.policy.max_attempts),
            };
        }

        if !self.error.is_transient() {
            return RetryDecision::GiveUp {
                reason: format!("permanent failure: {}", self.error.message()),
            };
        }

        let delay = self.calculate_delay();
        let Ok(chrono_delay) = chrono::Duration::from_std(delay) else {
            return RetryDecision::GiveUp { reason: "retry delay out of range".to_string() };
        };

        RetryDecision::Retry { next_attempt_at: self.failed_at + chrono_delay }
    }

    /// Calculates the delay before the next attempt.
    pub(crate) fn calculate_delay(&self) -> Duration {
        let exponent = self.attempts_so_far.saturating_sub(1).min(20);
        let multiplier = 2_u32.saturating_pow(exponent);
        let base = self.policy.base_delay * multiplier;

        let capped = std::cmp::min(base, self.policy.max_delay);
        apply_jitter(capped, self.policy.jitter_factor)
    }
}

/// Applies ±`jitter_factor` randomization to a duration.
///
/// With the default 0.2, a 60s delay lands anywhere in 48s to 72s.
fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 {
        return duration;
    }

    let clamped = jitter_factor.clamp(0.0, 1.0);

    let mut rng = rand::rng();
    let range = duration.as_secs_f64() * clamped;
    let offset = rng.random_range(-range..=range);

    Duration::from_secs_f64((duration.as_secs_f64() + offset).max(0.0))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn no_jitter() -> RetryPolicy {
        RetryPolicy { jitter_factor: 0.0, ..RetryPolicy::default() }
    }

    #[test]
    fn exponential_backoff_doubles_each_attempt() {
        let delays = (1..=4)
            .map(|attempt| {
                RetryContext::new(
                    attempt,
                    HandlerError::transient("processor 503"),
                    Utc::now(),
                    no_jitter(),
                )
                .calculate_delay()
            })
            .collect::<Vec<_>>();

        assert_eq!(delays[0], Duration::from_secs(30));
        assert_eq!(delays[1], Duration::from_secs(60));
        assert_eq!(delays[2], Duration::from_secs(120));
        assert_eq!(delays[3], Duration::from_secs(240));
    }

    #[test]
    fn delay_never_exceeds_ceiling() {
        let context = RetryContext::new(
            20,
            HandlerError::transient("processor 503"),
            Utc::now(),
            no_jitter(),
        );

        assert!(context.calculate_delay() <= Duration::from_secs(30 * 60));
    }

    #[test]
    fn gives_up_at_max_attempts() {
        let context = RetryContext::new(
            5,
            HandlerError::transient("processor 503"),
            Utc::now(),
            RetryPolicy::default(),
        );

        match context.decide_retry() {
            RetryDecision::GiveUp { reason } => assert!(reason.contains("maximum attempts")),
            RetryDecision::Retry { .. } => unreachable!("must not retry at max attempts"),
        }
    }

    #[test]
    fn permanent_failures_never_retry() {
        let context = RetryContext::new(
            1,
            HandlerError::permanent("unknown customer"),
            Utc::now(),
            RetryPolicy::default(),
        );

        match context.decide_retry() {
            RetryDecision::GiveUp { reason } => assert!(reason.contains("permanent")),
            RetryDecision::Retry { .. } => unreachable!("must not retry permanent failures"),
        }
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy { jitter_factor: 0.2, ..RetryPolicy::default() };
        let base = Duration::from_secs(60);

        for _ in 0..50 {
            let jittered = apply_jitter(base, policy.jitter_factor);
            assert!(jittered >= Duration::from_secs(48), "too small: {jittered:?}");
            assert!(jittered <= Duration::from_secs(72), "too large: {jittered:?}");
        }
    }

    #[test]
    fn jitter_varies_delay() {
        let mut seen = std::collections::HashSet::new();
        for _ in 0..20 {
            seen.insert(apply_jitter(Duration::from_secs(60), 0.2).as_millis());
        }
        assert!(seen.len() > 1, "jitter should create variation");
    }

    proptest! {
        /// Successive delays never decrease until the ceiling is hit.
        #[test]
        fn backoff_is_monotonic_without_jitter(
            base_secs in 1u64..120,
            max_secs in 120u64..7200,
        ) {
            let policy = RetryPolicy {
                max_attempts: 10,
                base_delay: Duration::from_secs(base_secs),
                max_delay: Duration::from_secs(max_secs),
                jitter_factor: 0.0,
            };

            let mut previous = Duration::ZERO;
            for attempt in 1..=9u32 {
                let delay = RetryContext::new(
                    attempt,
                    HandlerError::transient("x"),
                    Utc::now(),
                    policy.clone(),
                )
                .calculate_delay();

                prop_assert!(delay >= previous);
                prop_assert!(delay <= policy.max_delay);
                previous = delay;
            }
        }
    }
}
