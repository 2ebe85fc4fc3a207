//! Retry / backoff policy
//!
//! `RetryStrategy` is a pure policy object: it computes delays and classifies
//! failures but never sleeps or calls anything itself. [`retry_async`] is the
//! loop that applies it.

use rand::Rng;
use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::io;
use std::time::Duration;

use expense_core::PipelineConfig;

const JITTER_FACTOR: f64 = 0.1;

/// Exponential backoff: `base * 2^(attempt - 1)`, capped at `max_backoff`.
#[derive(Debug, Clone)]
pub struct RetryStrategy {
    base_delay: Duration,
    max_backoff: Duration,
    jitter: bool,
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30))
    }
}

impl RetryStrategy {
    pub fn new(base_delay: Duration, max_backoff: Duration) -> Self {
        Self {
            base_delay,
            max_backoff: max_backoff.max(base_delay),
            jitter: true,
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.retry_base_delay(), config.retry_max_backoff()).with_jitter(config.retry_jitter)
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn max_backoff(&self) -> Duration {
        self.max_backoff
    }

    /// Delay to wait after failed attempt number `attempt` (1-based; 0 is
    /// treated as 1).
    ///
    /// With jitter enabled the value is perturbed by up to ±10% and then
    /// clamped to `[base, max_backoff]`.
    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_backoff.as_millis() as f64;

        let exponent = (attempt - 1).min(62) as i32;
        let capped = (base_ms * 2f64.powi(exponent)).min(max_ms);

        let delay_ms = if self.jitter {
            let factor = rand::rng().random_range((1.0 - JITTER_FACTOR)..=(1.0 + JITTER_FACTOR));
            (capped * factor).clamp(base_ms, max_ms)
        } else {
            capped
        };

        Duration::from_millis(delay_ms.round() as u64)
    }

    /// Whether `err` (or anything in its source chain) looks transient:
    /// timeouts, connection resets/aborts, broken pipes and unexpected EOF.
    pub fn is_temporary_error(err: &(dyn StdError + 'static)) -> bool {
        let mut current: Option<&(dyn StdError + 'static)> = Some(err);

        while let Some(e) = current {
            if let Some(io_err) = e.downcast_ref::<io::Error>() {
                if matches!(
                    io_err.kind(),
                    io::ErrorKind::TimedOut
                        | io::ErrorKind::ConnectionReset
                        | io::ErrorKind::ConnectionAborted
                        | io::ErrorKind::BrokenPipe
                        | io::ErrorKind::UnexpectedEof
                        | io::ErrorKind::Interrupted
                ) {
                    return true;
                }
            }

            if e.downcast_ref::<tokio::time::error::Elapsed>().is_some() {
                return true;
            }

            if let Some(req_err) = e.downcast_ref::<reqwest::Error>() {
                if req_err.is_timeout() || req_err.is_connect() {
                    return true;
                }
            }

            if message_looks_temporary(&e.to_string()) {
                return true;
            }

            current = e.source();
        }

        false
    }

    /// 5xx and 429 are worth retrying; every other status is not.
    pub fn is_retryable_status_code(code: u16) -> bool {
        code == 429 || (500..600).contains(&code)
    }
}

fn message_looks_temporary(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    [
        "timeout",
        "timed out",
        "connection reset",
        "connection aborted",
        "broken pipe",
        "eof",
    ]
    .iter()
    .any(|needle| message.contains(needle))
}

/// The last error after the attempt budget ran out or a non-retryable error
/// stopped the loop.
#[derive(Debug)]
pub struct RetryExhausted<E> {
    pub attempts: u32,
    pub last_error: E,
}

impl<E: fmt::Display> fmt::Display for RetryExhausted<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed after {} attempt(s): {}", self.attempts, self.last_error)
    }
}

/// Run `op` up to `max_attempts` times (at least once), sleeping
/// `strategy.calculate_backoff(attempt)` between attempts.
///
/// `op` receives the 1-based attempt number. The loop stops early as soon as
/// `should_retry` rejects an error.
pub async fn retry_async<T, E, F, Fut, P>(
    strategy: &RetryStrategy,
    max_attempts: u32,
    should_retry: P,
    mut op: F,
) -> Result<T, RetryExhausted<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: fmt::Display,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;

        match op(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::debug!(attempt = attempt, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) => {
                if attempt >= max_attempts || !should_retry(&e) {
                    return Err(RetryExhausted {
                        attempts: attempt,
                        last_error: e,
                    });
                }

                let delay = strategy.calculate_backoff(attempt);
                tracing::warn!(
                    attempt = attempt,
                    max_attempts = max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn strategy(base_ms: u64, max_ms: u64) -> RetryStrategy {
        RetryStrategy::new(Duration::from_millis(base_ms), Duration::from_millis(max_ms))
            .with_jitter(false)
    }

    #[test]
    fn backoff_doubles_until_cap() {
        let s = strategy(100, 1000);
        assert_eq!(s.calculate_backoff(1), Duration::from_millis(100));
        assert_eq!(s.calculate_backoff(2), Duration::from_millis(200));
        assert_eq!(s.calculate_backoff(3), Duration::from_millis(400));
        assert_eq!(s.calculate_backoff(4), Duration::from_millis(800));
        assert_eq!(s.calculate_backoff(5), Duration::from_millis(1000));
        assert_eq!(s.calculate_backoff(60), Duration::from_millis(1000));
    }

    #[test]
    fn attempt_zero_is_attempt_one() {
        let s = strategy(250, 10_000);
        assert_eq!(s.calculate_backoff(0), s.calculate_backoff(1));
    }

    #[test]
    fn backoff_is_monotonic_and_bounded() {
        let s = strategy(500, 30_000);
        let mut previous = Duration::ZERO;
        for attempt in 1..40 {
            let delay = s.calculate_backoff(attempt);
            assert!(delay >= previous);
            assert!(delay <= s.max_backoff());
            previous = delay;
        }
    }

    #[test]
    fn jitter_stays_within_base_and_cap() {
        let s = RetryStrategy::new(Duration::from_millis(100), Duration::from_millis(1000));
        for _ in 0..200 {
            for attempt in 1..8 {
                let delay = s.calculate_backoff(attempt);
                assert!(delay >= Duration::from_millis(100));
                assert!(delay <= Duration::from_millis(1000));
            }
        }
    }

    #[test]
    fn status_code_classification() {
        assert!(RetryStrategy::is_retryable_status_code(500));
        assert!(RetryStrategy::is_retryable_status_code(503));
        assert!(RetryStrategy::is_retryable_status_code(429));
        assert!(!RetryStrategy::is_retryable_status_code(404));
        assert!(!RetryStrategy::is_retryable_status_code(403));
        assert!(!RetryStrategy::is_retryable_status_code(200));
    }

    #[test]
    fn io_errors_are_classified() {
        let reset = io::Error::new(io::ErrorKind::ConnectionReset, "peer reset");
        assert!(RetryStrategy::is_temporary_error(&reset));

        let eof = io::Error::new(io::ErrorKind::UnexpectedEof, "short read");
        assert!(RetryStrategy::is_temporary_error(&eof));

        let denied = io::Error::new(io::ErrorKind::PermissionDenied, "no access");
        assert!(!RetryStrategy::is_temporary_error(&denied));
    }

    #[test]
    fn source_chain_is_walked() {
        let inner = io::Error::new(io::ErrorKind::TimedOut, "deadline");
        let outer = anyhow::Error::new(inner).context("fetching receipt");
        assert!(RetryStrategy::is_temporary_error(&*outer));

        let permanent = anyhow::anyhow!("invalid certificate");
        assert!(!RetryStrategy::is_temporary_error(&*permanent));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_async_stops_on_success() {
        let calls = AtomicU32::new(0);
        let result: Result<&str, RetryExhausted<String>> = retry_async(
            &strategy(10, 100),
            3,
            |_| true,
            |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 1 {
                        Err("connection reset".to_string())
                    } else {
                        Ok("ok")
                    }
                }
            },
        )
        .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_async_respects_budget() {
        let calls = AtomicU32::new(0);
        let result: Result<(), RetryExhausted<String>> = retry_async(
            &strategy(10, 100),
            3,
            |_| true,
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("503".to_string()) }
            },
        )
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_async_does_not_retry_permanent_errors() {
        let calls = AtomicU32::new(0);
        let result: Result<(), RetryExhausted<String>> = retry_async(
            &strategy(10, 100),
            5,
            |e: &String| e != "404",
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("404".to_string()) }
            },
        )
        .await;

        assert_eq!(result.unwrap_err().attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
