//! Retry-with-backoff around fallible async work.
//!
//! A [`RetryPolicy`] is built once per call site and is stateless across calls:
//! every [`RetryPolicy::run`] starts counting attempts from scratch.
//!
//! ```text
//! call ─ok──────────────────────────────▶ value
//!   │err
//!   ├─ not retryable / attempts used ───▶ error
//!   └─ attempt += 1, delay = min(interval(attempt), cap)
//!        log hooks(attempt, &err) → sleeper.sleep(delay) → call again
//! ```
use std::{fmt, future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use tracing::warn;

type Predicate<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;
type Interval = Arc<dyn Fn(u32) -> u64 + Send + Sync>;
type RetryHook<E> = Arc<dyn Fn(u32, &E) + Send + Sync>;

/// Suspends the retrying call between attempts.
///
/// Injectable so tests can record delays instead of waiting for them.
#[async_trait]
pub trait Sleeper: Send + Sync + 'static {
    /// `delay_ms` is the final delay, after the `max_delay_ms` cap.
    async fn sleep(&self, delay_ms: u64);
}

/// Default sleeper backed by `tokio::time::sleep`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, delay_ms: u64) {
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    }
}

/// `1000 * 2^(attempt-1)` milliseconds, saturating.
pub fn default_interval(attempt: u32) -> u64 {
    let exp = attempt.saturating_sub(1).min(63);
    1000u64.saturating_mul(1u64 << exp)
}

/// Retry configuration for one kind of call.
///
/// Defaults retry nothing: `max_retries` is 0 and the predicate rejects every error.
pub struct RetryPolicy<E> {
    max_retries: u32,
    retryable: Predicate<E>,
    interval: Interval,
    max_delay_ms: Option<u64>,
    sleeper: Arc<dyn Sleeper>,
    hooks: Vec<RetryHook<E>>,
}

impl<E> Clone for RetryPolicy<E> {
    fn clone(&self) -> Self {
        Self {
            max_retries: self.max_retries,
            retryable: Arc::clone(&self.retryable),
            interval: Arc::clone(&self.interval),
            max_delay_ms: self.max_delay_ms,
            sleeper: Arc::clone(&self.sleeper),
            hooks: self.hooks.clone(),
        }
    }
}

impl<E> fmt::Debug for RetryPolicy<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("max_delay_ms", &self.max_delay_ms)
            .field("hooks", &self.hooks.len())
            .finish_non_exhaustive()
    }
}

impl<E> Default for RetryPolicy<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> RetryPolicy<E> {
    pub fn new() -> Self {
        Self {
            max_retries: 0,
            retryable: Arc::new(|_| false),
            interval: Arc::new(default_interval),
            max_delay_ms: None,
            sleeper: Arc::new(TokioSleeper),
            hooks: Vec::new(),
        }
    }

    /// Maximum number of retries after the initial call.
    pub fn max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }

    /// Errors for which `f` returns `true` are retried.
    pub fn retry_if<F>(mut self, f: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.retryable = Arc::new(f);
        self
    }

    /// Delay before retry number `attempt` (1-based), before capping.
    pub fn interval<F>(mut self, f: F) -> Self
    where
        F: Fn(u32) -> u64 + Send + Sync + 'static,
    {
        self.interval = Arc::new(f);
        self
    }

    /// Upper bound applied to every computed delay.
    pub fn max_delay_ms(mut self, cap: Option<u64>) -> Self {
        self.max_delay_ms = cap;
        self
    }

    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Add a hook called with `(attempt, &error)` before each retry sleep.
    ///
    /// Hooks run in the order they were added.
    pub fn on_retry<F>(mut self, f: F) -> Self
    where
        F: Fn(u32, &E) + Send + Sync + 'static,
    {
        self.hooks.push(Arc::new(f));
        self
    }

    pub fn retries(&self) -> u32 {
        self.max_retries
    }

    /// Delay actually slept before retry number `attempt`.
    pub fn delay_for(&self, attempt: u32) -> u64 {
        let raw = (self.interval)(attempt);
        match self.max_delay_ms {
            Some(cap) => raw.min(cap),
            None => raw,
        }
    }
}

impl<E: fmt::Display> RetryPolicy<E> {
    /// Run `work` until it succeeds, fails with a non-retryable error or runs out of retries.
    ///
    /// On exhaustion the error of the last attempt is returned.
    pub async fn run<T, F, Fut>(&self, mut work: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0u32;
        loop {
            let err = match work().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if attempt >= self.max_retries || !(self.retryable)(&err) {
                return Err(err);
            }

            attempt += 1;
            let delay_ms = self.delay_for(attempt);
            warn!(attempt, delay_ms, error = %err, "retrying after failure");
            for hook in &self.hooks {
                hook(attempt, &err);
            }
            self.sleeper.sleep(delay_ms).await;
        }
    }
}
