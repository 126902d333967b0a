use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::models::ActivityDocument;
use crate::source::{Acquire, AcquireError};

pub const FETCH_MAX_ATTEMPTS: u32 = 3;
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(20);
pub const FETCH_RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchPolicy {
    pub max_attempts: u32,
    pub timeout: Duration,
    pub retry_delay: Duration,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            max_attempts: FETCH_MAX_ATTEMPTS,
            timeout: FETCH_TIMEOUT,
            retry_delay: FETCH_RETRY_DELAY,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum FetchError {
    #[error(transparent)]
    Acquire(#[from] AcquireError),
    #[error("gave up after {attempts} timed-out attempts")]
    ExhaustedRetries { attempts: u32 },
}

/// Runs acquisition attempts under a per-attempt timeout until one succeeds
/// or the attempt ceiling is reached.
pub struct RetryingFetcher<A> {
    source: A,
    policy: FetchPolicy,
}

impl<A: Acquire> RetryingFetcher<A> {
    pub fn new(source: A, policy: FetchPolicy) -> Self {
        Self { source, policy }
    }

    #[cfg(test)]
    pub fn source(&self) -> &A {
        &self.source
    }

    /// On failure returns the last attempt's own error, or
    /// `ExhaustedRetries` when the last attempt timed out.
    pub async fn fetch_with_retry(&self, locator: &str) -> Result<ActivityDocument, FetchError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            // A timed-out attempt's future is dropped here, releasing its session.
            let err = match tokio::time::timeout(self.policy.timeout, self.source.fetch(locator)).await
            {
                Ok(Ok(document)) => {
                    debug!(
                        locator,
                        attempt,
                        records = document.records.len(),
                        "fetched activity document"
                    );
                    return Ok(document);
                }
                Ok(Err(err)) => err,
                Err(_) => AcquireError::Timeout,
            };

            let remaining = attempt < max_attempts;
            match &err {
                AcquireError::Timeout | AcquireError::Transient(_) => warn!(
                    locator,
                    attempt,
                    max_attempts,
                    error = %err,
                    "fetch attempt failed, connection-level"
                ),
                AcquireError::Other(_) => warn!(
                    locator,
                    attempt,
                    max_attempts,
                    error = %err,
                    "fetch attempt failed"
                ),
            }

            if !remaining {
                return Err(match err {
                    AcquireError::Timeout => FetchError::ExhaustedRetries { attempts: attempt },
                    other => FetchError::Acquire(other),
                });
            }
            tokio::time::sleep(self.policy.retry_delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Scripted source: each call pops the next step; the last step repeats.
    struct Scripted {
        steps: Mutex<Vec<Step>>,
        calls: AtomicUsize,
        open: Arc<AtomicUsize>,
        peak_open: Arc<AtomicUsize>,
    }

    #[derive(Clone)]
    enum Step {
        Ok,
        Hang,
        Fail(AcquireError),
    }

    struct Session(Arc<AtomicUsize>);

    impl Drop for Session {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl Scripted {
        fn new(steps: Vec<Step>) -> Self {
            Self {
                steps: Mutex::new(steps),
                calls: AtomicUsize::new(0),
                open: Arc::new(AtomicUsize::new(0)),
                peak_open: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl Acquire for Scripted {
        async fn fetch(&self, _locator: &str) -> Result<ActivityDocument, AcquireError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let step = {
                let mut steps = self.steps.lock();
                if steps.len() > 1 {
                    steps.remove(0)
                } else {
                    steps[0].clone()
                }
            };

            let now_open = self.open.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_open.fetch_max(now_open, Ordering::SeqCst);
            let _session = Session(self.open.clone());

            match step {
                Step::Ok => Ok(ActivityDocument::default()),
                Step::Hang => std::future::pending().await,
                Step::Fail(err) => Err(err),
            }
        }
    }

    fn quick_policy() -> FetchPolicy {
        FetchPolicy {
            max_attempts: 3,
            timeout: Duration::from_secs(20),
            retry_delay: Duration::from_secs(5),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_and_timeout() {
        let source = Scripted::new(vec![
            Step::Fail(AcquireError::Transient("reset".into())),
            Step::Hang,
            Step::Ok,
        ]);
        let fetcher = RetryingFetcher::new(source, quick_policy());

        let result = fetcher.fetch_with_retry("1456").await;
        assert!(result.is_ok());
        assert_eq!(fetcher.source.calls.load(Ordering::SeqCst), 3);
        assert_eq!(fetcher.source.open.load(Ordering::SeqCst), 0);
        assert_eq!(fetcher.source.peak_open.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_exhaustion_is_synthetic() {
        let fetcher = RetryingFetcher::new(Scripted::new(vec![Step::Hang]), quick_policy());

        let result = fetcher.fetch_with_retry("1456").await;
        assert_eq!(result, Err(FetchError::ExhaustedRetries { attempts: 3 }));
        assert_eq!(fetcher.source.calls.load(Ordering::SeqCst), 3);
        assert_eq!(fetcher.source.open.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn last_concrete_error_surfaces() {
        let source = Scripted::new(vec![
            Step::Hang,
            Step::Fail(AcquireError::Transient("reset".into())),
            Step::Fail(AcquireError::Other("bad json".into())),
        ]);
        let fetcher = RetryingFetcher::new(source, quick_policy());

        let result = fetcher.fetch_with_retry("1456").await;
        assert_eq!(
            result,
            Err(FetchError::Acquire(AcquireError::Other("bad json".into())))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn waits_the_retry_delay_between_attempts() {
        let fetcher = RetryingFetcher::new(
            Scripted::new(vec![Step::Fail(AcquireError::Other("boom".into()))]),
            quick_policy(),
        );

        let started = tokio::time::Instant::now();
        let result = fetcher.fetch_with_retry("1456").await;
        assert!(matches!(result, Err(FetchError::Acquire(AcquireError::Other(_)))));
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(10) && waited < Duration::from_secs(11));
    }

    #[tokio::test]
    async fn zero_attempts_still_tries_once() {
        let policy = FetchPolicy {
            max_attempts: 0,
            ..quick_policy()
        };
        let fetcher = RetryingFetcher::new(Scripted::new(vec![Step::Ok]), policy);
        assert!(fetcher.fetch_with_retry("1456").await.is_ok());
        assert_eq!(fetcher.source.calls.load(Ordering::SeqCst), 1);
    }
}
