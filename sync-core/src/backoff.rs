//! Retry policy and backoff arithmetic.
//!
//! Computes how long to wait before retry `n` (1-based). Sleeping, jitter
//! randomness and the retry loop itself live in `sync-client`.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How the delay grows between retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// Always `initial_delay`.
    Constant,
    /// `initial_delay * n`.
    Linear,
    /// `initial_delay * multiplier^(n-1)`.
    #[default]
    Exponential,
}

/// Retry policy for one class of operations.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt. `0` means a single attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound applied before jitter.
    pub max_delay: Duration,
    /// Growth factor for [`BackoffStrategy::Exponential`].
    pub backoff_multiplier: f64,
    /// Growth shape.
    pub strategy: BackoffStrategy,
    /// Randomize each delay by ±25%.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            strategy: BackoffStrategy::Exponential,
            jitter: true,
        }
    }
}

/// Fraction of the delay jitter may add or remove.
pub const JITTER_FRACTION: f64 = 0.25;

impl RetryPolicy {
    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Set the retry count.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the first retry delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the delay cap.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the exponential growth factor.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Set the growth shape.
    pub fn with_strategy(mut self, strategy: BackoffStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Enable or disable jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Total attempts this policy allows.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Capped delay before retry `retry` (1-based), before jitter.
    pub fn base_delay(&self, retry: u32) -> Duration {
        let n = retry.max(1);
        let initial = self.initial_delay.as_nanos() as f64;
        let raw = match self.strategy {
            BackoffStrategy::Constant => initial,
            BackoffStrategy::Linear => initial * f64::from(n),
            BackoffStrategy::Exponential => {
                let exp = i32::try_from(n - 1).unwrap_or(i32::MAX);
                initial * self.backoff_multiplier.powi(exp)
            }
        };

        let cap = self.max_delay.as_nanos() as f64;
        if !raw.is_finite() || raw >= cap {
            return self.max_delay;
        }
        from_nanos_f64(raw)
    }

    /// Delay before retry `retry`, with `factor` applied when jitter is on.
    ///
    /// `factor` is expected in `[1 - JITTER_FRACTION, 1 + JITTER_FRACTION]`;
    /// the caller supplies the randomness.
    pub fn delay(&self, retry: u32, factor: f64) -> Duration {
        let base = self.base_delay(retry);
        if self.jitter {
            apply_jitter(base, factor)
        } else {
            base
        }
    }
}

/// Scale `delay` by `factor`, clamped to the jitter band.
pub fn apply_jitter(delay: Duration, factor: f64) -> Duration {
    let factor = if factor.is_finite() {
        factor.clamp(1.0 - JITTER_FRACTION, 1.0 + JITTER_FRACTION)
    } else {
        1.0
    };
    from_nanos_f64(delay.as_nanos() as f64 * factor)
}

fn from_nanos_f64(nanos: f64) -> Duration {
    if nanos <= 0.0 {
        Duration::ZERO
    } else if nanos >= u64::MAX as f64 {
        Duration::from_nanos(u64::MAX)
    } else {
        Duration::from_nanos(nanos.round() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(strategy: BackoffStrategy) -> RetryPolicy {
        RetryPolicy::default()
            .with_initial_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(10))
            .with_strategy(strategy)
            .with_jitter(false)
    }

    #[test]
    fn defaults() {
        let p = RetryPolicy::default();
        assert_eq!(p.max_retries, 3);
        assert_eq!(p.initial_delay, Duration::from_secs(1));
        assert_eq!(p.max_delay, Duration::from_secs(30));
        assert_eq!(p.backoff_multiplier, 2.0);
        assert_eq!(p.strategy, BackoffStrategy::Exponential);
        assert!(p.jitter);
        assert_eq!(p.max_attempts(), 4);
    }

    #[test]
    fn exponential_doubles() {
        let p = policy(BackoffStrategy::Exponential);
        assert_eq!(p.base_delay(1), Duration::from_millis(100));
        assert_eq!(p.base_delay(2), Duration::from_millis(200));
        assert_eq!(p.base_delay(3), Duration::from_millis(400));
        assert_eq!(p.base_delay(4), Duration::from_millis(800));
    }

    #[test]
    fn linear_grows_by_initial() {
        let p = policy(BackoffStrategy::Linear);
        assert_eq!(p.base_delay(1), Duration::from_millis(100));
        assert_eq!(p.base_delay(2), Duration::from_millis(200));
        assert_eq!(p.base_delay(3), Duration::from_millis(300));
    }

    #[test]
    fn constant_stays_flat() {
        let p = policy(BackoffStrategy::Constant);
        for n in 1..6 {
            assert_eq!(p.base_delay(n), Duration::from_millis(100));
        }
    }

    #[test]
    fn delay_is_capped() {
        let p = policy(BackoffStrategy::Exponential).with_max_delay(Duration::from_millis(250));
        assert_eq!(p.base_delay(3), Duration::from_millis(250));
        assert_eq!(p.base_delay(64), Duration::from_millis(250));
        assert_eq!(p.base_delay(u32::MAX), Duration::from_millis(250));
    }

    #[test]
    fn jitter_stays_in_band() {
        let p = policy(BackoffStrategy::Constant).with_jitter(true);
        assert_eq!(p.delay(1, 0.75), Duration::from_millis(75));
        assert_eq!(p.delay(1, 1.25), Duration::from_millis(125));
        // Out-of-band factors are clamped
        assert_eq!(p.delay(1, 3.0), Duration::from_millis(125));
        assert_eq!(p.delay(1, f64::NAN), Duration::from_millis(100));
    }

    #[test]
    fn jitter_disabled_ignores_factor() {
        let p = policy(BackoffStrategy::Constant);
        assert_eq!(p.delay(1, 0.75), Duration::from_millis(100));
    }

    #[test]
    fn no_retry_allows_one_attempt() {
        assert_eq!(RetryPolicy::no_retry().max_attempts(), 1);
    }

    #[test]
    fn strategy_parses_lowercase() {
        let s: BackoffStrategy = serde_json::from_str("\"linear\"").unwrap();
        assert_eq!(s, BackoffStrategy::Linear);
    }
}
