//! Per-provider request quota accounting.
//!
//! A [`Quota`] tracks one provider's request budget under one of three
//! strategies. The caller passes the current [`Instant`] into every call, so
//! the arithmetic is testable without sleeping.
//!
//! Upstream rate-limit headers can override the local counter: while an
//! upstream window is active its `remaining` count decides admission. When
//! that window resets the local counter starts over at full capacity.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::headers::{RateLimitHeaders, EPOCH_THRESHOLD};

/// Longest upstream reset adopted; larger hints are clamped.
const MAX_UPSTREAM_RESET: Duration = Duration::from_secs(EPOCH_THRESHOLD);

/// Admission algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RateLimitStrategy {
    /// Capacity `max_requests`, refilled continuously at `max_requests / window`.
    #[default]
    TokenBucket,
    /// At most `max_requests` in any trailing `window`.
    SlidingWindow,
    /// At most `max_requests` per aligned `window`.
    FixedWindow,
}

/// Rate-limit configuration for one provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaConfig {
    /// Admission algorithm.
    pub strategy: RateLimitStrategy,
    /// Requests allowed per window.
    pub max_requests: u32,
    /// Window length.
    pub window: Duration,
}

impl QuotaConfig {
    /// Create a configuration.
    pub fn new(strategy: RateLimitStrategy, max_requests: u32, window: Duration) -> Self {
        Self {
            strategy,
            max_requests,
            window,
        }
    }

    /// Reject configurations that could never admit a request.
    pub fn validate(&self) -> Result<(), QuotaError> {
        if self.max_requests == 0 {
            return Err(QuotaError::ZeroRequests);
        }
        if self.window.is_zero() {
            return Err(QuotaError::ZeroWindow);
        }
        Ok(())
    }
}

/// Invalid quota configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuotaError {
    /// `max_requests` is zero.
    #[error("max_requests must be greater than zero")]
    ZeroRequests,
    /// `window` is zero.
    #[error("window must be greater than zero")]
    ZeroWindow,
}

/// Snapshot of a provider's quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaStatus {
    /// Requests that would be admitted right now.
    pub remaining: u32,
    /// Requests per window.
    pub limit: u32,
    /// Time until the budget is next replenished.
    pub reset_in: Duration,
    /// True when the next request would be rejected.
    pub is_limited: bool,
}

#[derive(Debug, Clone)]
enum Counter {
    TokenBucket { tokens: f64, last_refill: Instant },
    SlidingWindow { hits: VecDeque<Instant> },
    FixedWindow { window_start: Instant, count: u32 },
}

#[derive(Debug, Clone, Copy)]
struct Upstream {
    remaining: u32,
    limit: u32,
    reset_at: Instant,
}

/// Request budget for one provider.
#[derive(Debug, Clone)]
pub struct Quota {
    config: QuotaConfig,
    counter: Counter,
    upstream: Option<Upstream>,
    last_used: Instant,
}

impl Quota {
    /// Create a full quota.
    pub fn new(config: QuotaConfig, now: Instant) -> Result<Self, QuotaError> {
        config.validate()?;
        Ok(Self {
            config,
            counter: Self::full_counter(&config, now),
            upstream: None,
            last_used: now,
        })
    }

    /// The configuration this quota enforces.
    pub fn config(&self) -> &QuotaConfig {
        &self.config
    }

    fn full_counter(config: &QuotaConfig, now: Instant) -> Counter {
        match config.strategy {
            RateLimitStrategy::TokenBucket => Counter::TokenBucket {
                tokens: f64::from(config.max_requests),
                last_refill: now,
            },
            RateLimitStrategy::SlidingWindow => Counter::SlidingWindow {
                hits: VecDeque::new(),
            },
            RateLimitStrategy::FixedWindow => Counter::FixedWindow {
                window_start: now,
                count: 0,
            },
        }
    }

    fn refill_rate(&self) -> f64 {
        f64::from(self.config.max_requests) / self.config.window.as_secs_f64()
    }

    /// Drop an upstream override whose window has reset, restarting the
    /// local counter at full capacity.
    fn expire_upstream(&mut self, now: Instant) {
        if let Some(up) = self.upstream {
            if now >= up.reset_at {
                self.upstream = None;
                self.counter = Self::full_counter(&self.config, now);
            }
        }
    }

    /// Advance time-based state to `now`.
    fn advance(&mut self, now: Instant) {
        self.expire_upstream(now);

        let window = self.config.window;
        let capacity = f64::from(self.config.max_requests);
        let rate = self.refill_rate();

        match &mut self.counter {
            Counter::TokenBucket {
                tokens,
                last_refill,
            } => {
                let elapsed = now.saturating_duration_since(*last_refill);
                *tokens = (*tokens + elapsed.as_secs_f64() * rate).min(capacity);
                *last_refill = now.max(*last_refill);
            }
            Counter::SlidingWindow { hits } => {
                while let Some(oldest) = hits.front() {
                    if now.saturating_duration_since(*oldest) >= window {
                        hits.pop_front();
                    } else {
                        break;
                    }
                }
            }
            Counter::FixedWindow {
                window_start,
                count,
            } => {
                let elapsed = now.saturating_duration_since(*window_start);
                if elapsed >= window {
                    let into_window = elapsed.as_nanos() % window.as_nanos();
                    let into_window = Duration::from_nanos(u64::try_from(into_window).unwrap_or(0));
                    *window_start = now - into_window;
                    *count = 0;
                }
            }
        }
    }

    /// Consume one request slot if available.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        self.advance(now);
        self.last_used = now;

        if let Some(up) = self.upstream.as_mut() {
            if up.remaining == 0 {
                return false;
            }
            up.remaining -= 1;
            return true;
        }

        let max = self.config.max_requests;
        match &mut self.counter {
            Counter::TokenBucket { tokens, .. } => {
                if *tokens >= 1.0 {
                    *tokens -= 1.0;
                    true
                } else {
                    false
                }
            }
            Counter::SlidingWindow { hits } => {
                if (hits.len() as u64) < u64::from(max) {
                    hits.push_back(now);
                    true
                } else {
                    false
                }
            }
            Counter::FixedWindow { count, .. } => {
                if *count < max {
                    *count += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Current quota without consuming a slot.
    pub fn status(&mut self, now: Instant) -> QuotaStatus {
        self.advance(now);

        if let Some(up) = self.upstream {
            return QuotaStatus {
                remaining: up.remaining,
                limit: up.limit,
                reset_in: up.reset_at.saturating_duration_since(now),
                is_limited: up.remaining == 0,
            };
        }

        let limit = self.config.max_requests;
        let window = self.config.window;
        let rate = self.refill_rate();

        let (remaining, reset_in) = match &self.counter {
            Counter::TokenBucket { tokens, .. } => {
                let missing = f64::from(limit) - tokens;
                (tokens.floor() as u32, secs_to_duration(missing / rate))
            }
            Counter::SlidingWindow { hits } => {
                let used = u32::try_from(hits.len()).unwrap_or(u32::MAX);
                let reset_in = hits
                    .front()
                    .map(|oldest| remaining_window(*oldest, window, now))
                    .unwrap_or(Duration::ZERO);
                (limit.saturating_sub(used), reset_in)
            }
            Counter::FixedWindow {
                window_start,
                count,
            } => (
                limit.saturating_sub(*count),
                remaining_window(*window_start, window, now),
            ),
        };

        QuotaStatus {
            remaining,
            limit,
            reset_in,
            is_limited: remaining == 0,
        }
    }

    /// How long to wait before a slot is likely to open. Zero if one is open now.
    pub fn wait_hint(&mut self, now: Instant) -> Duration {
        self.advance(now);

        if let Some(up) = self.upstream {
            return if up.remaining > 0 {
                Duration::ZERO
            } else {
                up.reset_at.saturating_duration_since(now)
            };
        }

        let max = self.config.max_requests;
        let window = self.config.window;
        let rate = self.refill_rate();

        match &self.counter {
            Counter::TokenBucket { tokens, .. } => {
                if *tokens >= 1.0 {
                    Duration::ZERO
                } else {
                    secs_to_duration((1.0 - tokens) / rate)
                }
            }
            Counter::SlidingWindow { hits } => {
                if (hits.len() as u64) < u64::from(max) {
                    Duration::ZERO
                } else {
                    hits.front()
                        .map(|oldest| remaining_window(*oldest, window, now))
                        .unwrap_or(Duration::ZERO)
                }
            }
            Counter::FixedWindow {
                window_start,
                count,
            } => {
                if *count < max {
                    Duration::ZERO
                } else {
                    remaining_window(*window_start, window, now)
                }
            }
        }
    }

    /// Adopt the upstream's view of the quota.
    ///
    /// Ignored unless `remaining` is present. A missing limit falls back to
    /// the configured one and a missing reset to one window from `now`.
    /// Returns true if the override was applied.
    pub fn apply_upstream(
        &mut self,
        headers: &RateLimitHeaders,
        now: Instant,
        now_unix_secs: u64,
    ) -> bool {
        let Some(remaining) = headers.remaining else {
            return false;
        };

        let reset_in = headers
            .reset
            .map(|hint| hint.reset_in(now_unix_secs))
            .unwrap_or(self.config.window);

        self.upstream = Some(Upstream {
            remaining,
            limit: headers.limit.unwrap_or(self.config.max_requests),
            reset_at: now
                .checked_add(reset_in.min(MAX_UPSTREAM_RESET))
                .unwrap_or(now),
        });
        true
    }

    /// Restore full capacity and drop any upstream override.
    pub fn reset(&mut self, now: Instant) {
        self.upstream = None;
        self.counter = Self::full_counter(&self.config, now);
    }

    /// True if the quota has not been used for at least `ttl`.
    pub fn is_idle(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.last_used) >= ttl
    }
}

/// Time left in a window that opened at `start`.
fn remaining_window(start: Instant, window: Duration, now: Instant) -> Duration {
    window.saturating_sub(now.saturating_duration_since(start))
}

fn secs_to_duration(secs: f64) -> Duration {
    if secs.is_finite() && secs > 0.0 {
        Duration::from_secs_f64(secs)
    } else {
        Duration::ZERO
    }
}
