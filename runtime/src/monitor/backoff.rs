// Copyright 2026 Pricewatch Contributors
// SPDX-License-Identifier: Apache-2.0

//! Retry delays and schedule jitter.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// `base * 2^(attempt-1)`, capped. Attempt 0 is treated as 1.
pub fn exponential_delay(base: Duration, attempt: u32, cap: Duration) -> Duration {
    let exp = attempt.saturating_sub(1).min(31);
    base.checked_mul(1u32 << exp).unwrap_or(cap).min(cap)
}

/// Retry policy applied after consecutive failures of one target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay after the first failure.
    pub base: Duration,
    /// Upper bound for any retry delay.
    pub cap: Duration,
    /// Consecutive transient failures tolerated before suspension.
    pub max_retries: u32,
    /// Consecutive extraction failures tolerated before the rule is escalated.
    pub max_extraction_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(5),
            cap: Duration::from_secs(600),
            max_retries: 5,
            max_extraction_retries: 3,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (1-based). Non-decreasing in `attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        exponential_delay(self.base, attempt, self.cap)
    }
}

/// Spread `interval` by ±`ratio` so targets sharing a site do not fire together.
pub fn jittered(interval: Duration, ratio: f64) -> Duration {
    let ratio = ratio.clamp(0.0, 1.0);
    // NaN survives clamp; gen_range would panic on it.
    if ratio.is_nan() || ratio == 0.0 || interval.is_zero() {
        return interval;
    }
    let factor = rand::thread_rng().gen_range((1.0 - ratio)..=(1.0 + ratio));
    interval.mul_f64(factor)
}

/// Random delay in `[0, interval * ratio]` for a target's first run.
pub fn initial_delay(interval: Duration, ratio: f64) -> Duration {
    let ratio = ratio.clamp(0.0, 1.0);
    if ratio.is_nan() || ratio == 0.0 || interval.is_zero() {
        return Duration::ZERO;
    }
    interval.mul_f64(rand::thread_rng().gen_range(0.0..=ratio))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_is_non_decreasing_and_capped() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(500),
            cap: Duration::from_secs(30),
            max_retries: 20,
            max_extraction_retries: 3,
        };
        let mut prev = Duration::ZERO;
        for attempt in 1..=40 {
            let d = policy.delay(attempt);
            assert!(d >= prev, "attempt {attempt}: {d:?} < {prev:?}");
            assert!(d <= policy.cap);
            prev = d;
        }
        assert_eq!(policy.delay(1), Duration::from_millis(500));
        assert_eq!(policy.delay(2), Duration::from_secs(1));
        assert_eq!(policy.delay(3), Duration::from_secs(2));
        assert_eq!(policy.delay(40), Duration::from_secs(30));
    }

    #[test]
    fn test_zero_attempt_uses_base() {
        assert_eq!(
            exponential_delay(Duration::from_secs(1), 0, Duration::from_secs(10)),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let interval = Duration::from_secs(100);
        for _ in 0..200 {
            let j = jittered(interval, 0.1);
            assert!(j >= Duration::from_secs(90) && j <= Duration::from_secs(110));
        }
        assert_eq!(jittered(interval, 0.0), interval);
        assert_eq!(initial_delay(interval, 0.0), Duration::ZERO);
        assert!(initial_delay(interval, 0.1) <= Duration::from_secs(10));
    }

    #[test]
    fn test_nan_ratio_disables_jitter() {
        let interval = Duration::from_secs(100);
        assert_eq!(jittered(interval, f64::NAN), interval);
        assert_eq!(initial_delay(interval, f64::NAN), Duration::ZERO);
        let j = jittered(interval, f64::INFINITY);
        assert!(j <= Duration::from_secs(200));
    }
}
