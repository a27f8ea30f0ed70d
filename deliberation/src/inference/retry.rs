//! Backoff schedule for transient inference failures.
//!
//! Attempt 0 is the first call and never waits. Attempt `n > 0` waits
//! `initial_backoff_ms * multiplier^(n-1)`, capped at `max_backoff_ms`, then
//! spread by `jitter` so parallel experts hitting the same outage do not
//! retry in lockstep.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first call; 0 disables retrying.
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub max_backoff_ms: u64,
    /// Fraction of the delay randomized in either direction, clamped to [0, 1].
    pub jitter: f64,
}

impl RetryPolicy {
    /// Total calls a request may make, counting the first.
    pub fn attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Unjittered delay before `attempt`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let ms = self.initial_backoff_ms as f64 * self.backoff_multiplier.max(1.0).powi(exponent);
        Duration::from_millis((ms.min(u64::MAX as f64) as u64).min(self.max_backoff_ms))
    }

    /// Delay before `attempt`, uniformly spread over `base ± jitter * base`.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt).as_millis() as u64;
        let spread = (base as f64 * self.jitter.clamp(0.0, 1.0)) as u64;
        if spread == 0 {
            return Duration::from_millis(base);
        }
        let low = base - spread;
        Duration::from_millis(rand::thread_rng().gen_range(low..=base + spread))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff_ms: 500,
            backoff_multiplier: 2.0,
            max_backoff_ms: 5_000,
            jitter: 0.2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exact() -> RetryPolicy {
        RetryPolicy {
            jitter: 0.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_first_attempt_never_waits() {
        assert_eq!(RetryPolicy::default().delay_before(0), Duration::ZERO);
    }

    #[test]
    fn test_delay_doubles_until_cap() {
        let policy = exact();
        let ms: Vec<u128> = (1..=5)
            .map(|a| policy.delay_before(a).as_millis())
            .collect();
        assert_eq!(ms, vec![500, 1000, 2000, 4000, 5000]);
        assert_eq!(policy.delay_before(40).as_millis(), 5000);
    }

    #[test]
    fn test_attempts_count_first_call() {
        assert_eq!(RetryPolicy::default().attempts(), 3);
        let none = RetryPolicy {
            max_retries: 0,
            ..Default::default()
        };
        assert_eq!(none.attempts(), 1);
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let policy = RetryPolicy::default();
        for _ in 0..100 {
            let ms = policy.delay_before(2).as_millis() as u64;
            assert!((800..=1200).contains(&ms), "{}", ms);
        }
    }

    #[test]
    fn test_policy_reads_partial_toml() {
        let policy: RetryPolicy = toml::from_str("max_retries = 5").unwrap();
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.initial_backoff_ms, 500);
    }
}
