use std::future::Future;

use tokio::time::{sleep, Duration};
use tracing::warn;

/// Errors that know whether another attempt could succeed.
pub trait Transient {
    fn is_transient(&self) -> bool;

    /// Stamps the final attempt count onto an exhausted error.
    fn with_attempts(self, _attempts: u32) -> Self
    where
        Self: Sized,
    {
        self
    }
}

/// Bounded exponential backoff for outbound calls.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn with_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }
}

/// Runs `op` until it succeeds, fails with a non-transient error, or the
/// attempt budget is spent. Delays double from `base_delay` up to `max_delay`.
pub async fn with_backoff<T, E, F, Fut>(what: &str, policy: &RetryPolicy, mut op: F) -> Result<T, E>
where
    E: Transient + std::fmt::Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max = policy.max_attempts.max(1);
    let mut delay = policy.base_delay;

    for attempt in 1..=max {
        match op(attempt).await {
            Ok(v) => return Ok(v),
            Err(e) if !e.is_transient() => return Err(e),
            Err(e) if attempt == max => return Err(e.with_attempts(attempt)),
            Err(e) => {
                warn!(
                    call = %what,
                    attempt,
                    max,
                    error = %e,
                    retry_after_ms = delay.as_millis() as u64,
                    "transient failure, retrying with backoff"
                );
                sleep(delay).await;
                delay = (delay * 2).min(policy.max_delay);
            }
        }
    }

    unreachable!("backoff loop exited without returning")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, PartialEq)]
    enum Fake {
        Flaky(u32),
        Fatal,
    }

    impl std::fmt::Display for Fake {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{self:?}")
        }
    }

    impl Transient for Fake {
        fn is_transient(&self) -> bool {
            matches!(self, Fake::Flaky(_))
        }

        fn with_attempts(self, attempts: u32) -> Self {
            Fake::Flaky(attempts)
        }
    }

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    #[tokio::test]
    async fn recovers_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let out: Result<u32, Fake> = with_backoff("test", &fast(3), |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(Fake::Flaky(attempt))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;
        assert_eq!(out, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_with_attempt_count() {
        let out: Result<(), Fake> =
            with_backoff("test", &fast(2), |_| async { Err(Fake::Flaky(1)) }).await;
        assert_eq!(out, Err(Fake::Flaky(2)));
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let out: Result<(), Fake> = with_backoff("test", &fast(5), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Fake::Fatal) }
        })
        .await;
        assert_eq!(out, Err(Fake::Fatal));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
