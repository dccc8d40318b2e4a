use std::future::Future;
use std::time::Duration;

use rand::Rng;

use super::FetchError;

/// Outcome of a single attempt, as seen by the retry loop.
#[derive(Debug)]
pub enum Attempt<T> {
    Done(T),
    Retry(FetchError),
    Fail(FetchError),
}

impl<T> Attempt<T> {
    pub fn classify(result: Result<T, FetchError>) -> Self {
        match result {
            Ok(v) => Attempt::Done(v),
            Err(e) if e.is_transient() => Attempt::Retry(e),
            Err(e) => Attempt::Fail(e),
        }
    }
}

/// Exponential backoff with jitter, bounded by a retry count.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based), without jitter.
    pub fn base_backoff(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.min(31)).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Delay before retry number `retry`: base backoff plus up to 50% jitter,
    /// never shorter than a server-supplied hint.
    pub fn backoff(&self, retry: u32, hint: Option<Duration>) -> Duration {
        let base = self.base_backoff(retry);
        let jitter_ms = (base.as_millis() as u64) / 2;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        } else {
            Duration::ZERO
        };
        let delay = base + jitter;
        match hint {
            Some(h) if h > delay => h,
            _ => delay,
        }
    }

    /// Drive `op` until it succeeds, fails permanently, or retries run out.
    ///
    /// Exhausted retries surface as [`FetchError::Exhausted`] for `page`.
    pub async fn run<T, F, Fut>(&self, page: u32, mut op: F) -> Result<T, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let mut retry: u32 = 0;
        loop {
            match Attempt::classify(op().await) {
                Attempt::Done(v) => return Ok(v),
                Attempt::Fail(e) => return Err(e),
                Attempt::Retry(e) if retry >= self.max_retries => {
                    return Err(FetchError::Exhausted {
                        page,
                        cause: Box::new(e),
                    });
                }
                Attempt::Retry(e) => {
                    let wait = self.backoff(retry, e.retry_after());
                    log::warn!(
                        "Page {page}: {e}. Waiting {}ms before retry {}/{}",
                        wait.as_millis(),
                        retry + 1,
                        self.max_retries
                    );
                    tokio::time::sleep(wait).await;
                    retry += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[test]
    fn test_base_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.base_backoff(0), Duration::from_millis(500));
        assert_eq!(policy.base_backoff(1), Duration::from_millis(1000));
        assert_eq!(policy.base_backoff(2), Duration::from_millis(2000));
        assert_eq!(policy.base_backoff(10), Duration::from_secs(30));
        assert_eq!(policy.base_backoff(40), Duration::from_secs(30));
    }

    #[test]
    fn test_backoff_jitter_bounds() {
        let policy = RetryPolicy::default();
        for _ in 0..50 {
            let d = policy.backoff(1, None);
            assert!(d >= Duration::from_millis(1000));
            assert!(d <= Duration::from_millis(1500));
        }
    }

    #[test]
    fn test_backoff_honors_server_hint() {
        let policy = RetryPolicy::default();
        let d = policy.backoff(0, Some(Duration::from_secs(90)));
        assert_eq!(d, Duration::from_secs(90));
    }

    #[tokio::test]
    async fn test_run_retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = fast_policy(3)
            .run(4, || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(FetchError::Status { status: 502, message: "bad gateway".into() })
                } else {
                    Ok(n)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_run_does_not_retry_permanent() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = fast_policy(3)
            .run(1, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(FetchError::Status { status: 404, message: "missing".into() })
            })
            .await;
        assert!(matches!(result, Err(FetchError::Status { status: 404, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_run_exhausts_retries() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = fast_policy(2)
            .run(9, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(FetchError::Timeout("30s elapsed".into()))
            })
            .await;
        match result {
            Err(FetchError::Exhausted { page, cause }) => {
                assert_eq!(page, 9);
                assert!(matches!(*cause, FetchError::Timeout(_)));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_rate_limit_is_retried() {
        let calls = AtomicU32::new(0);
        let result = fast_policy(1)
            .run(1, || async {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(FetchError::RateLimited { retry_after: Some(Duration::from_millis(2)) })
                } else {
                    Ok("page")
                }
            })
            .await;
        assert_eq!(result.unwrap(), "page");
    }
}
