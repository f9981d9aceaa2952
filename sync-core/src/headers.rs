//! Parsing of upstream rate-limit response headers.
//!
//! Recognized (case-insensitive):
//! - `x-ratelimit-limit`, `ratelimit-limit`
//! - `x-ratelimit-remaining`, `ratelimit-remaining`
//! - `x-ratelimit-reset`, `ratelimit-reset`
//! - `retry-after` (delta seconds; forces `remaining` to zero)

use std::time::Duration;

/// Reset values above this are read as Unix epoch seconds, below as a delta.
pub const EPOCH_THRESHOLD: u64 = 1_000_000_000;

/// When the upstream window resets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetHint {
    /// Absolute Unix time in seconds.
    EpochSecs(u64),
    /// Seconds from the time the response was received.
    DeltaSecs(u64),
}

impl ResetHint {
    /// Interpret a raw reset value.
    pub fn from_value(value: u64) -> Self {
        if value > EPOCH_THRESHOLD {
            Self::EpochSecs(value)
        } else {
            Self::DeltaSecs(value)
        }
    }

    /// Time until reset, given the current Unix time in seconds.
    pub fn reset_in(&self, now_unix_secs: u64) -> Duration {
        match *self {
            Self::EpochSecs(at) => Duration::from_secs(at.saturating_sub(now_unix_secs)),
            Self::DeltaSecs(delta) => Duration::from_secs(delta),
        }
    }
}

/// Rate-limit state advertised by an upstream response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimitHeaders {
    /// Requests allowed per window.
    pub limit: Option<u32>,
    /// Requests left in the current window.
    pub remaining: Option<u32>,
    /// When the window resets.
    pub reset: Option<ResetHint>,
}

impl RateLimitHeaders {
    /// Extract rate-limit fields from response headers.
    ///
    /// Unparseable values are ignored. A `retry-after` header sets
    /// `remaining` to zero and takes precedence over any reset header.
    pub fn parse<'a, I>(headers: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut parsed = Self::default();
        let mut retry_after = None;

        for (name, value) in headers {
            let value = value.trim();
            match name.to_ascii_lowercase().as_str() {
                "x-ratelimit-limit" | "ratelimit-limit" => {
                    if let Some(v) = parse_u32(value) {
                        parsed.limit = Some(v);
                    }
                }
                "x-ratelimit-remaining" | "ratelimit-remaining" => {
                    if let Some(v) = parse_u32(value) {
                        parsed.remaining = Some(v);
                    }
                }
                "x-ratelimit-reset" | "ratelimit-reset" => {
                    if let Ok(v) = value.parse::<u64>() {
                        parsed.reset = Some(ResetHint::from_value(v));
                    }
                }
                "retry-after" => {
                    if let Ok(v) = value.parse::<u64>() {
                        retry_after = Some(v);
                    }
                }
                _ => {}
            }
        }

        if let Some(secs) = retry_after {
            parsed.remaining = Some(0);
            parsed.reset = Some(ResetHint::DeltaSecs(secs));
        }

        parsed
    }

    /// True when no rate-limit header was present.
    pub fn is_empty(&self) -> bool {
        self.limit.is_none() && self.remaining.is_none() && self.reset.is_none()
    }
}

fn parse_u32(value: &str) -> Option<u32> {
    // Some providers send a float remaining; floor it.
    if let Ok(v) = value.parse::<u32>() {
        return Some(v);
    }
    let v = value.parse::<f64>().ok()?;
    if v.is_finite() && v >= 0.0 {
        Some(v.min(f64::from(u32::MAX)) as u32)
    } else {
        None
    }
}
