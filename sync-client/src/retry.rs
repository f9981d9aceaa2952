//! Bounded retry with backoff and jitter around any fallible async operation.
//!
//! The engine never returns `Err` itself: the terminal failure is handed
//! back inside [`RetryOutcome`] together with the attempt count.

use rand::Rng;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use sync_core::backoff::JITTER_FRACTION;
use sync_core::RetryPolicy;
use sync_types::{Classify, ErrorClass};
use tokio::time::{sleep, Instant};

/// Result of a retried operation.
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    /// Value of the successful attempt, or the last error.
    pub result: Result<T, E>,
    /// Attempts performed, including the first.
    pub attempts: u32,
    /// Wall time from the first attempt to the outcome, delays included.
    pub total_time: Duration,
}

impl<T, E> RetryOutcome<T, E> {
    /// True if an attempt succeeded.
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// Drop the bookkeeping and keep the result.
    pub fn into_result(self) -> Result<T, E> {
        self.result
    }
}

/// Retry engine with a default policy.
#[derive(Debug, Clone, Default)]
pub struct RetryEngine {
    default_policy: RetryPolicy,
}

fn jitter_factor() -> f64 {
    rand::thread_rng().gen_range((1.0 - JITTER_FRACTION)..=(1.0 + JITTER_FRACTION))
}

impl RetryEngine {
    /// Create an engine whose [`RetryEngine::run`] uses `default_policy`.
    pub fn new(default_policy: RetryPolicy) -> Self {
        Self { default_policy }
    }

    /// Policy used when the caller does not supply one.
    pub fn default_policy(&self) -> &RetryPolicy {
        &self.default_policy
    }

    /// Run `op` under the default policy.
    pub async fn run<T, E, F, Fut>(&self, op: F) -> RetryOutcome<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + Display,
    {
        let policy = self.default_policy.clone();
        self.execute(&policy, op).await
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// policy's retry budget is spent.
    ///
    /// `op` receives the 1-based attempt number. Retryability follows
    /// [`ErrorClass::is_retryable`].
    pub async fn execute<T, E, F, Fut>(&self, policy: &RetryPolicy, op: F) -> RetryOutcome<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + Display,
    {
        self.execute_if(policy, op, |e: &E| e.classify().is_retryable())
            .await
    }

    /// Like [`RetryEngine::execute`], retrying only errors of class `class`.
    pub async fn retry_on<T, E, F, Fut>(
        &self,
        policy: &RetryPolicy,
        class: ErrorClass,
        op: F,
    ) -> RetryOutcome<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + Display,
    {
        self.execute_if(policy, op, move |e: &E| e.classify() == class)
            .await
    }

    /// Like [`RetryEngine::execute`] with a caller-supplied retry predicate.
    pub async fn execute_if<T, E, F, Fut, P>(
        &self,
        policy: &RetryPolicy,
        mut op: F,
        is_retryable: P,
    ) -> RetryOutcome<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: Display,
    {
        let start = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            attempt = attempt.saturating_add(1);

            let error = match op(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::debug!("Succeeded after {} attempts", attempt);
                    }
                    return RetryOutcome {
                        result: Ok(value),
                        attempts: attempt,
                        total_time: start.elapsed(),
                    };
                }
                Err(e) => e,
            };

            let retries_used = attempt - 1;
            if retries_used >= policy.max_retries || !is_retryable(&error) {
                if retries_used > 0 {
                    tracing::warn!("Giving up after {} attempts: {}", attempt, error);
                }
                return RetryOutcome {
                    result: Err(error),
                    attempts: attempt,
                    total_time: start.elapsed(),
                };
            }

            let delay = policy.delay(attempt, jitter_factor());
            tracing::warn!(
                "Attempt {} failed: {} (retrying in {}ms)",
                attempt,
                error,
                delay.as_millis()
            );
            sleep(delay).await;
        }
    }

    /// Bind `op` to `policy`, producing a reusable retrying callable.
    pub fn wrap<F>(&self, policy: RetryPolicy, op: F) -> Retrying<F> {
        Retrying {
            engine: self.clone(),
            policy,
            op,
        }
    }
}

/// An operation bound to a retry policy. See [`RetryEngine::wrap`].
#[derive(Debug)]
pub struct Retrying<F> {
    engine: RetryEngine,
    policy: RetryPolicy,
    op: F,
}

impl<F> Retrying<F> {
    /// Run the wrapped operation under its policy.
    pub async fn call<T, E, Fut>(&mut self) -> RetryOutcome<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + Display,
    {
        self.engine.execute(&self.policy, &mut self.op).await
    }
}
