//! Per-provider rate limiting.
//!
//! Each configured provider gets a [`Quota`] from `sync-core`. Quota state
//! lives in a `DashMap`, so check-and-consume for one provider is atomic
//! with respect to concurrent callers. Providers without a configuration
//! are not limited.
//!
//! Quota state for providers that go idle is dropped by [`RateLimiter::sweep`]
//! (driven by [`spawn_sweep_task`]); the configuration is kept, so the next
//! request starts from a full quota.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use sync_core::{Quota, QuotaConfig, QuotaStatus, RateLimitHeaders};
use sync_types::{ProviderId, Timestamp};

use crate::error::LimiterError;

/// Shortest sleep while waiting for a slot.
const MIN_WAIT: Duration = Duration::from_millis(1);

/// Per-provider rate limiter. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct RateLimiter {
    inner: Arc<LimiterInner>,
}

#[derive(Default)]
struct LimiterInner {
    configs: DashMap<ProviderId, QuotaConfig>,
    quotas: DashMap<ProviderId, Quota>,
}

// Read through the tokio clock so paused-time tests drive the limiter.
fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

fn unix_now_secs() -> u64 {
    u64::try_from(Timestamp::now().as_secs()).unwrap_or(0)
}

impl RateLimiter {
    /// Create a limiter with no providers configured.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the rate limit for a provider, replacing any previous one and
    /// starting from a full quota.
    pub fn configure(&self, provider: ProviderId, config: QuotaConfig) -> Result<(), LimiterError> {
        let quota = Quota::new(config, now()).map_err(|source| LimiterError::InvalidConfig {
            provider: provider.clone(),
            source,
        })?;
        tracing::debug!(
            "Rate limit for {}: {:?} {} per {}ms",
            provider,
            config.strategy,
            config.max_requests,
            config.window.as_millis()
        );
        self.inner.configs.insert(provider.clone(), config);
        self.inner.quotas.insert(provider, quota);
        Ok(())
    }

    /// The configuration for a provider, if any.
    pub fn config(&self, provider: &ProviderId) -> Option<QuotaConfig> {
        self.inner.configs.get(provider).map(|c| *c)
    }

    fn with_quota<R>(
        &self,
        provider: &ProviderId,
        f: impl FnOnce(&mut Quota, Instant) -> R,
    ) -> Option<R> {
        let config = *self.inner.configs.get(provider)?;
        let now = now();
        let mut quota = match self.inner.quotas.entry(provider.clone()) {
            Entry::Occupied(entry) => entry.into_ref(),
            Entry::Vacant(entry) => entry.insert(Quota::new(config, now).ok()?),
        };
        Some(f(&mut quota, now))
    }

    /// Consume one request slot. Returns false if the provider is at its limit.
    pub fn check_limit(&self, provider: &ProviderId) -> bool {
        self.with_quota(provider, |quota, now| quota.try_acquire(now))
            .unwrap_or(true)
    }

    /// Wait until a slot is available and consume it.
    pub async fn wait_for_slot(&self, provider: &ProviderId) {
        loop {
            let wait = self.with_quota(provider, |quota, now| {
                if quota.try_acquire(now) {
                    None
                } else {
                    Some(quota.wait_hint(now))
                }
            });

            match wait.flatten() {
                None => return,
                Some(wait) => {
                    tracing::debug!("Rate limited on {}, waiting {}ms", provider, wait.as_millis());
                    tokio::time::sleep(wait.max(MIN_WAIT)).await;
                }
            }
        }
    }

    /// Wait for a slot, then run `f`, returning whatever it returns.
    pub async fn execute<F, Fut, T>(&self, provider: &ProviderId, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.wait_for_slot(provider).await;
        f().await
    }

    /// Current quota for a provider. `None` if it is not configured.
    pub fn status(&self, provider: &ProviderId) -> Option<QuotaStatus> {
        self.with_quota(provider, |quota, now| quota.status(now))
    }

    /// Adopt upstream rate-limit state. Returns true if it was applied.
    pub fn update_from_headers(&self, provider: &ProviderId, headers: &RateLimitHeaders) -> bool {
        if headers.is_empty() {
            return false;
        }
        let applied = self
            .with_quota(provider, |quota, now| {
                quota.apply_upstream(headers, now, unix_now_secs())
            })
            .unwrap_or(false);
        if applied {
            tracing::debug!(
                "Upstream rate limit for {}: remaining={:?} limit={:?}",
                provider,
                headers.remaining,
                headers.limit
            );
        }
        applied
    }

    /// Parse raw response headers and adopt them.
    pub fn update_from_header_pairs<'a, I>(&self, provider: &ProviderId, headers: I) -> bool
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        self.update_from_headers(provider, &RateLimitHeaders::parse(headers))
    }

    /// Restore a provider's full quota.
    pub fn reset(&self, provider: &ProviderId) {
        self.with_quota(provider, |quota, now| quota.reset(now));
    }

    /// Restore every provider's full quota.
    pub fn reset_all(&self) {
        let now = now();
        for mut quota in self.inner.quotas.iter_mut() {
            quota.reset(now);
        }
    }

    /// Drop quota state unused for `idle_ttl`. Returns how many were dropped.
    pub fn sweep(&self, idle_ttl: Duration) -> usize {
        let now = now();
        let before = self.inner.quotas.len();
        self.inner.quotas.retain(|_, quota| !quota.is_idle(now, idle_ttl));
        self.inner.quotas.shrink_to_fit();
        before.saturating_sub(self.inner.quotas.len())
    }

    /// Number of providers with live quota state.
    pub fn tracked_count(&self) -> usize {
        self.inner.quotas.len()
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("configured", &self.inner.configs.len())
            .field("tracked", &self.inner.quotas.len())
            .finish()
    }
}

/// Spawn a background task that sweeps idle quota state every `interval`.
///
/// Returns a handle that can be used to abort the task.
pub fn spawn_sweep_task(
    limiter: RateLimiter,
    interval: Duration,
    idle_ttl: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!(
            "Rate limit sweep started (interval: {}s, idle ttl: {}s)",
            interval.as_secs(),
            idle_ttl.as_secs()
        );

        let mut timer = tokio::time::interval(interval);

        loop {
            timer.tick().await;

            let removed = limiter.sweep(idle_ttl);
            if removed > 0 {
                tracing::info!("Rate limit sweep: dropped {} idle providers", removed);
            } else {
                tracing::debug!("Rate limit sweep: nothing idle");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_core::RateLimitStrategy;

    fn github() -> ProviderId {
        ProviderId::from("github")
    }

    fn limiter(strategy: RateLimitStrategy, max: u32, window_ms: u64) -> RateLimiter {
        let limiter = RateLimiter::new();
        limiter
            .configure(
                github(),
                QuotaConfig::new(strategy, max, Duration::from_millis(window_ms)),
            )
            .unwrap();
        limiter
    }

    #[tokio::test(start_paused = true)]
    async fn fixed_window_three_calls() {
        let limiter = limiter(RateLimitStrategy::FixedWindow, 2, 1000);

        let results: Vec<bool> = (0..3).map(|_| limiter.check_limit(&github())).collect();

        assert_eq!(results, vec![true, true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn token_bucket_capacity_plus_one_rejected() {
        let limiter = limiter(RateLimitStrategy::TokenBucket, 5, 1000);

        for _ in 0..5 {
            assert!(limiter.check_limit(&github()));
        }
        assert!(!limiter.check_limit(&github()));
    }

    #[tokio::test]
    async fn unconfigured_provider_is_unlimited() {
        let limiter = RateLimiter::new();
        let other = ProviderId::from("gitlab");

        for _ in 0..100 {
            assert!(limiter.check_limit(&other));
        }
        assert!(limiter.status(&other).is_none());
        limiter.wait_for_slot(&other).await;
    }

    #[tokio::test]
    async fn invalid_config_rejected() {
        let limiter = RateLimiter::new();
        let err = limiter
            .configure(
                github(),
                QuotaConfig::new(RateLimitStrategy::FixedWindow, 0, Duration::from_secs(1)),
            )
            .unwrap_err();

        assert!(matches!(err, LimiterError::InvalidConfig { .. }));
        assert!(limiter.config(&github()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_slot_sleeps_until_window_resets() {
        let limiter = limiter(RateLimitStrategy::FixedWindow, 1, 1000);
        assert!(limiter.check_limit(&github()));

        let start = tokio::time::Instant::now();
        limiter.wait_for_slot(&github()).await;

        assert!(start.elapsed() >= Duration::from_millis(1000));
        assert!(!limiter.check_limit(&github()));
    }

    #[tokio::test(start_paused = true)]
    async fn execute_runs_after_slot() {
        let limiter = limiter(RateLimitStrategy::FixedWindow, 2, 1000);

        let value = limiter.execute(&github(), || async { 42 }).await;

        assert_eq!(value, 42);
        assert_eq!(limiter.status(&github()).unwrap().remaining, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn execute_passes_errors_through() {
        let limiter = limiter(RateLimitStrategy::FixedWindow, 2, 1000);

        let result: Result<(), String> = limiter
            .execute(&github(), || async { Err("boom".to_string()) })
            .await;

        assert_eq!(result, Err("boom".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn upstream_headers_override_local_estimate() {
        let limiter = limiter(RateLimitStrategy::TokenBucket, 100, 60_000);

        assert!(limiter.update_from_header_pairs(
            &github(),
            [("X-RateLimit-Remaining", "0"), ("Retry-After", "2")]
        ));

        assert!(!limiter.check_limit(&github()));
        let status = limiter.status(&github()).unwrap();
        assert!(status.is_limited);
        assert_eq!(status.remaining, 0);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(limiter.check_limit(&github()));
    }

    #[tokio::test]
    async fn headers_for_unconfigured_provider_are_ignored() {
        let limiter = RateLimiter::new();
        assert!(!limiter.update_from_header_pairs(
            &github(),
            [("x-ratelimit-remaining", "0")]
        ));
        assert!(limiter.check_limit(&github()));
    }

    #[tokio::test(start_paused = true)]
    async fn reset_and_reset_all() {
        let limiter = limiter(RateLimitStrategy::FixedWindow, 1, 60_000);
        let gitlab = ProviderId::from("gitlab");
        limiter
            .configure(
                gitlab.clone(),
                QuotaConfig::new(RateLimitStrategy::FixedWindow, 1, Duration::from_secs(60)),
            )
            .unwrap();

        assert!(limiter.check_limit(&github()));
        assert!(limiter.check_limit(&gitlab));
        assert!(!limiter.check_limit(&github()));

        limiter.reset(&github());
        assert!(limiter.check_limit(&github()));
        assert!(!limiter.check_limit(&gitlab));

        limiter.reset_all();
        assert!(limiter.check_limit(&github()));
        assert!(limiter.check_limit(&gitlab));
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_drops_idle_state_but_keeps_config() {
        let limiter = limiter(RateLimitStrategy::FixedWindow, 1, 60_000);
        assert!(limiter.check_limit(&github()));

        tokio::time::advance(Duration::from_secs(301)).await;
        assert_eq!(limiter.sweep(Duration::from_secs(300)), 1);
        assert_eq!(limiter.tracked_count(), 0);

        // Recreated full on next use
        assert_eq!(limiter.status(&github()).unwrap().remaining, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_task_runs_periodically() {
        let limiter = limiter(RateLimitStrategy::FixedWindow, 1, 1000);
        assert!(limiter.check_limit(&github()));

        let handle = spawn_sweep_task(
            limiter.clone(),
            Duration::from_secs(60),
            Duration::from_secs(100),
        );
        tokio::time::sleep(Duration::from_secs(130)).await;

        assert_eq!(limiter.tracked_count(), 0);
        handle.abort();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_never_overdraw() {
        let limiter = limiter(RateLimitStrategy::FixedWindow, 10, 60_000);

        let mut handles = Vec::new();
        for _ in 0..50 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move { limiter.check_limit(&github()) }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 10);
    }
}
