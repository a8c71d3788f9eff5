//! Bounded exponential backoff for every I/O call of a run.
//!
//! A [`RetryPolicy`] is a plain value: the fetcher, the archive writer, and
//! the warehouse commit each take one, so the attempt ceiling is visible
//! (and testable) at the call site instead of buried in nested loops.
//!
//! ```ignore
//! let records = RetryPolicy::FETCH
//!     .run("vendas page 3", |_attempt| source.fetch_page(&request))
//!     .await?;
//! ```

use std::future::Future;
use std::time::Duration;

/// Errors that can tell whether another attempt might succeed.
pub trait Transient {
    /// Returns `true` if the failure is likely temporary (network blip,
    /// 5xx, rate limiting) and worth retrying.
    fn is_transient(&self) -> bool;
}

/// Why a retried operation gave up.
#[derive(Debug)]
pub enum RetryError<E> {
    /// Every attempt failed transiently.
    Exhausted {
        /// Attempts made, including the first.
        attempts: u32,
        /// Error from the final attempt.
        last: E,
    },
    /// An attempt failed with a non-transient error; no further attempts
    /// were made.
    Permanent(E),
}

impl<E> RetryError<E> {
    /// The underlying error of the last attempt.
    pub fn into_inner(self) -> E {
        match self {
            Self::Exhausted { last, .. } => last,
            Self::Permanent(e) => e,
        }
    }

    /// Whether the ceiling was reached.
    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }
}

/// Attempt ceiling and backoff curve for one kind of I/O call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Zero behaves like one.
    pub max_attempts: u32,
    /// Wait before the first retry.
    pub base_delay: Duration,
    /// Growth factor between consecutive waits.
    pub multiplier: u32,
    /// Upper bound for any single wait.
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// External API page requests: waits 2s, 4s, 8s before giving up on
    /// the fourth attempt.
    pub const FETCH: Self = Self {
        max_attempts: 4,
        base_delay: Duration::from_secs(2),
        multiplier: 2,
        max_delay: Duration::from_secs(32),
    };

    /// Archive writes use the same curve as fetches.
    pub const ARCHIVE: Self = Self::FETCH;

    /// Warehouse commits are retried once.
    pub const COMMIT: Self = Self {
        max_attempts: 2,
        base_delay: Duration::from_secs(2),
        multiplier: 2,
        max_delay: Duration::from_secs(32),
    };

    /// A policy that retries without waiting.
    #[must_use]
    pub const fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            multiplier: 1,
            max_delay: Duration::ZERO,
        }
    }

    /// Wait before retry number `retry` (1 = first retry).
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self
            .multiplier
            .checked_pow(retry.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Runs `op` until it succeeds, fails permanently, or the attempt
    /// ceiling is reached. `op` receives the 1-based attempt number.
    ///
    /// # Errors
    ///
    /// Returns [`RetryError::Permanent`] on the first non-transient error
    /// and [`RetryError::Exhausted`] once every attempt failed transiently.
    pub async fn run<T, E, F, Fut>(&self, label: &str, mut op: F) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Transient + std::fmt::Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_transient() => return Err(RetryError::Permanent(e)),
                Err(e) if attempt >= max_attempts => {
                    log::error!("{label}: giving up after {attempt} attempts: {e}");
                    return Err(RetryError::Exhausted { attempts: attempt, last: e });
                }
                Err(e) => {
                    let delay = self.delay_for(attempt);
                    log::warn!(
                        "{label}: attempt {attempt}/{max_attempts} failed ({e}), retrying in {delay:?}..."
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[derive(Debug)]
    struct Flaky(bool);

    impl std::fmt::Display for Flaky {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "flaky (transient={})", self.0)
        }
    }

    impl Transient for Flaky {
        fn is_transient(&self) -> bool {
            self.0
        }
    }

    #[test]
    fn delays_grow_exponentially_up_to_cap() {
        let policy = RetryPolicy::FETCH;
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for(6), Duration::from_secs(32));
        assert_eq!(policy.delay_for(40), Duration::from_secs(32));
    }

    #[tokio::test]
    async fn recovers_before_ceiling() {
        let calls = AtomicU32::new(0);
        let result = RetryPolicy::immediate(4)
            .run("test", |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { if attempt < 3 { Err(Flaky(true)) } else { Ok(attempt) } }
            })
            .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stops_at_ceiling() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = RetryPolicy::immediate(4)
            .run("test", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Flaky(true)) }
            })
            .await;
        let err = result.unwrap_err();
        assert!(err.is_exhausted());
        assert!(matches!(err, RetryError::Exhausted { attempts: 4, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = RetryPolicy::immediate(4)
            .run("test", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Flaky(false)) }
            })
            .await;
        assert!(matches!(result, Err(RetryError::Permanent(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn commit_policy_retries_once_after_backoff() {
        let calls = AtomicU32::new(0);
        let start = tokio::time::Instant::now();
        let result: Result<(), _> = RetryPolicy::COMMIT
            .run("commit", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Flaky(true)) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(start.elapsed() >= Duration::from_secs(2));
    }
}
