// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Bounded retries with pluggable backoff.
//!
//! [`execute`] runs an async operation up to `max_attempts` times, waiting
//! `strategy.duration(attempt)` between failures. Waits race against the
//! cancellation token so shutdown is never held up by a pending backoff.

use rand::Rng;
use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Maps a zero-based attempt index to the wait before the next attempt.
pub trait Strategy: Send + Sync {
    fn duration(&self, attempt: i32) -> Duration;
}

/// `min + min(max, 2^attempt seconds) + uniform(0, max_jitter)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialStrategy {
    pub min: Duration,
    pub max: Duration,
    pub max_jitter: Duration,
}

impl ExponentialStrategy {
    pub fn new(min: Duration, max: Duration, max_jitter: Duration) -> Self {
        Self {
            min,
            max,
            max_jitter,
        }
    }

    fn jitter(&self) -> Duration {
        let bound = self.max_jitter.as_nanos().min(u64::MAX as u128) as u64;
        if bound == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(rand::thread_rng().gen_range(0..bound))
    }
}

impl Strategy for ExponentialStrategy {
    fn duration(&self, attempt: i32) -> Duration {
        let jitter = self.jitter();
        if attempt < 0 {
            return self.min.saturating_add(jitter);
        }
        let exp = 1u64
            .checked_shl(attempt as u32)
            .map(Duration::from_secs)
            .unwrap_or(Duration::MAX);
        self.min
            .saturating_add(exp.min(self.max))
            .saturating_add(jitter)
    }
}

/// Always waits the same amount of time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedStrategy {
    pub dur: Duration,
}

impl FixedStrategy {
    pub fn new(dur: Duration) -> Self {
        Self { dur }
    }
}

impl Strategy for FixedStrategy {
    fn duration(&self, _attempt: i32) -> Duration {
        self.dur
    }
}

/// Default exponential strategy: no floor, 10s cap, 250ms jitter.
pub fn exponential() -> ExponentialStrategy {
    ExponentialStrategy::new(
        Duration::ZERO,
        Duration::from_secs(10),
        Duration::from_millis(250),
    )
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("max attempts must be at least 1, got {0}")]
    InvalidMaxAttempts(usize),

    #[error("retry cancelled")]
    Cancelled,

    #[error("operation failed permanently after {attempts} attempts: {last_error}")]
    FailedPermanently { attempts: usize, last_error: E },
}

impl<E> RetryError<E> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RetryError::Cancelled)
    }

    /// The error returned by the final attempt, if every attempt ran and failed.
    pub fn last_error(&self) -> Option<&E> {
        match self {
            RetryError::FailedPermanently { last_error, .. } => Some(last_error),
            _ => None,
        }
    }
}

/// Run `op` until it succeeds, `max_attempts` is reached, or `cancel` fires.
///
/// Cancellation is checked before every attempt and during every backoff
/// wait. There is no wait after the final attempt.
pub async fn execute<T, E, F, Fut>(
    cancel: &CancellationToken,
    max_attempts: usize,
    strategy: &dyn Strategy,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Debug,
{
    if max_attempts < 1 {
        return Err(RetryError::InvalidMaxAttempts(max_attempts));
    }

    let mut attempts = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        attempts += 1;
        if attempts == max_attempts {
            return Err(RetryError::FailedPermanently {
                attempts,
                last_error: err,
            });
        }

        let wait = strategy.duration(attempts as i32 - 1);
        debug!(
            "Attempt {}/{} failed, retrying in {:?}: {:?}",
            attempts, max_attempts, wait, err
        );
        tokio::select! {
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            _ = tokio::time::sleep(wait) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    #[tokio::test]
    async fn test_rejects_zero_attempts() {
        let calls = AtomicUsize::new(0);
        let counter = &calls;
        let result: Result<(), RetryError<String>> = execute(
            &CancellationToken::new(),
            0,
            &FixedStrategy::new(Duration::ZERO),
            move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        )
        .await;
        assert!(matches!(result, Err(RetryError::InvalidMaxAttempts(0))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_attempts_and_wraps_last_error() {
        let calls = AtomicUsize::new(0);
        let counter = &calls;
        let result: Result<(), _> = execute(
            &CancellationToken::new(),
            3,
            &FixedStrategy::new(Duration::from_millis(10)),
            move || async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                Err(format!("boom {}", n))
            },
        )
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let err = result.unwrap_err();
        assert_eq!(err.last_error().map(String::as_str), Some("boom 2"));
        assert_eq!(
            err.to_string(),
            "operation failed permanently after 3 attempts: boom 2"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_returns_first_success() {
        let calls = AtomicUsize::new(0);
        let counter = &calls;
        let value = execute(
            &CancellationToken::new(),
            5,
            &FixedStrategy::new(Duration::from_millis(10)),
            move || async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("not yet")
                } else {
                    Ok(42u64)
                }
            },
        )
        .await
        .unwrap();
        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_sleep_after_final_attempt() {
        let start = Instant::now();
        let result: Result<(), _> = execute(
            &CancellationToken::new(),
            2,
            &FixedStrategy::new(Duration::from_millis(100)),
            || async { Err("always") },
        )
        .await;
        assert!(result.is_err());
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_cancelled_before_first_attempt() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = AtomicUsize::new(0);
        let counter = &calls;
        let result: Result<(), RetryError<&str>> = execute(
            &cancel,
            3,
            &FixedStrategy::new(Duration::ZERO),
            move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        )
        .await;
        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_backoff() {
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });
        let start = Instant::now();
        let counter = calls.clone();
        let result: Result<(), _> = execute(
            &cancel,
            10,
            &FixedStrategy::new(Duration::from_secs(60)),
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err("fail")
                }
            },
        )
        .await;
        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(start.elapsed() < Duration::from_secs(60));
    }

    #[test]
    fn test_exponential_bounds() {
        let strategy = ExponentialStrategy::new(
            Duration::from_millis(1000),
            Duration::from_millis(20_000),
            Duration::from_millis(250),
        );
        for attempt in -1..70 {
            let d = strategy.duration(attempt);
            assert!(d >= strategy.min);
            assert!(d < strategy.min + strategy.max + strategy.max_jitter);
        }
        let below_zero = strategy.duration(-5);
        assert!(below_zero < strategy.min + strategy.max_jitter);
    }

    #[test]
    fn test_exponential_without_jitter_is_monotonic_and_capped() {
        let strategy = ExponentialStrategy::new(
            Duration::from_millis(1000),
            Duration::from_millis(20_000),
            Duration::ZERO,
        );
        assert_eq!(strategy.duration(0), Duration::from_secs(2));
        assert_eq!(strategy.duration(3), Duration::from_secs(9));
        let mut previous = Duration::ZERO;
        for attempt in 0..40 {
            let d = strategy.duration(attempt);
            assert!(d >= previous);
            previous = d;
        }
        assert_eq!(previous, Duration::from_secs(21));
    }

    #[test]
    fn test_fixed_and_default_strategies() {
        let fixed = FixedStrategy::new(Duration::from_millis(7));
        assert_eq!(fixed.duration(0), Duration::from_millis(7));
        assert_eq!(fixed.duration(12), Duration::from_millis(7));

        let default = exponential();
        assert_eq!(default.min, Duration::ZERO);
        assert_eq!(default.max, Duration::from_secs(10));
        assert_eq!(default.max_jitter, Duration::from_millis(250));
    }
}
