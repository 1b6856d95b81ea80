//! Bounded retry decorator for transactors.

use std::fmt;
use std::io;
use std::sync::Arc;

use futures_util::future::BoxFuture;

use super::Transactor;
use crate::metrics::Counter;

/// Decides whether a failed attempt should be retried.
pub type ShouldRetry<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

/// Errors that can report themselves as transient.
pub trait Temporary {
    fn is_temporary(&self) -> bool;
}

impl Temporary for reqwest::Error {
    fn is_temporary(&self) -> bool {
        self.is_timeout() || self.is_connect()
    }
}

impl Temporary for io::Error {
    fn is_temporary(&self) -> bool {
        matches!(
            self.kind(),
            io::ErrorKind::TimedOut
                | io::ErrorKind::Interrupted
                | io::ErrorKind::WouldBlock
                | io::ErrorKind::ConnectionRefused
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
        )
    }
}

/// Retry only errors that report themselves as temporary.
pub fn default_should_retry<E: Temporary>() -> ShouldRetry<E> {
    Arc::new(|e: &E| e.is_temporary())
}

pub struct RetryOptions<E> {
    /// Extra attempts after the first. Values below 1 disable retrying.
    pub retries: i32,
    pub should_retry: ShouldRetry<E>,
    /// Incremented once per retry.
    pub counter: Option<Arc<Counter>>,
}

impl<E> Clone for RetryOptions<E> {
    fn clone(&self) -> Self {
        Self {
            retries: self.retries,
            should_retry: self.should_retry.clone(),
            counter: self.counter.clone(),
        }
    }
}

impl<E: Temporary + 'static> RetryOptions<E> {
    pub fn new(retries: i32) -> Self {
        Self {
            retries,
            should_retry: default_should_retry(),
            counter: None,
        }
    }
}

impl<E> RetryOptions<E> {
    pub fn with_should_retry(mut self, should_retry: ShouldRetry<E>) -> Self {
        self.should_retry = should_retry;
        self
    }

    pub fn with_counter(mut self, counter: Arc<Counter>) -> Self {
        self.counter = Some(counter);
        self
    }
}

/// Wrap `next` so retryable failures are attempted again, up to
/// `retries + 1` attempts in total. With `retries < 1`, `next` is returned
/// as is.
pub fn retry_transactor<Req, Resp, E>(
    options: RetryOptions<E>,
    next: Transactor<Req, Resp, E>,
) -> Transactor<Req, Resp, E>
where
    Req: Clone + fmt::Display + Send + Sync + 'static,
    Resp: Send + 'static,
    E: fmt::Display + Send + 'static,
{
    if options.retries < 1 {
        return next;
    }

    let attempts = options.retries.unsigned_abs() + 1;
    Arc::new(move |request: Req| -> BoxFuture<'static, Result<Resp, E>> {
        let next = next.clone();
        let options = options.clone();
        Box::pin(async move {
            let mut attempt = 1;
            loop {
                let error = match next(request.clone()).await {
                    Ok(response) => return Ok(response),
                    Err(error) => error,
                };

                if !(options.should_retry)(&error) {
                    return Err(error);
                }
                if attempt >= attempts {
                    tracing::error!(
                        target: "retry",
                        request = %request,
                        attempts,
                        error = %error,
                        "all retries failed"
                    );
                    return Err(error);
                }

                tracing::warn!(
                    target: "retry",
                    request = %request,
                    attempt,
                    error = %error,
                    "retrying request"
                );
                if let Some(counter) = &options.counter {
                    counter.inc();
                }
                attempt += 1;
            }
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq)]
    struct Failure {
        temporary: bool,
    }

    impl fmt::Display for Failure {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "failure (temporary={})", self.temporary)
        }
    }

    impl Temporary for Failure {
        fn is_temporary(&self) -> bool {
            self.temporary
        }
    }

    type Attempt = BoxFuture<'static, Result<&'static str, Failure>>;

    /// Transactor that fails with `failure` for the first `failures` calls.
    fn flaky(
        failures: usize,
        failure: Failure,
    ) -> (Transactor<String, &'static str, Failure>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let transactor: Transactor<String, &'static str, Failure> =
            Arc::new(move |_request: String| -> Attempt {
                let call = counted.fetch_add(1, Ordering::SeqCst);
                let failure = failure.clone();
                Box::pin(async move {
                    if call < failures {
                        Err(failure)
                    } else {
                        Ok("ok")
                    }
                })
            });
        (transactor, calls)
    }

    #[tokio::test]
    async fn test_always_failing_attempts_retries_plus_one() {
        let (next, calls) = flaky(usize::MAX, Failure { temporary: true });
        let counter = Arc::new(Counter::default());
        let transactor =
            retry_transactor(RetryOptions::new(2).with_counter(counter.clone()), next);

        let result = transactor("GET /".to_string()).await;
        assert_eq!(result, Err(Failure { temporary: true }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(counter.get(), 2);
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failure() {
        let (next, calls) = flaky(1, Failure { temporary: true });
        let transactor = retry_transactor(RetryOptions::new(3), next);
        assert_eq!(transactor("GET /".to_string()).await, Ok("ok"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_terminal_error_not_retried() {
        let (next, calls) = flaky(usize::MAX, Failure { temporary: false });
        let transactor = retry_transactor(RetryOptions::new(5), next);
        assert!(transactor("GET /".to_string()).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_custom_predicate() {
        let (next, calls) = flaky(usize::MAX, Failure { temporary: false });
        let options = RetryOptions::new(1).with_should_retry(Arc::new(|_: &Failure| true));
        let transactor = retry_transactor(options, next);
        assert!(transactor("GET /".to_string()).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_non_positive_retries_return_next_unchanged() {
        for retries in [0, -3] {
            let (next, calls) = flaky(usize::MAX, Failure { temporary: true });
            let transactor = retry_transactor(RetryOptions::new(retries), next.clone());
            assert!(Arc::ptr_eq(&transactor, &next));
            assert!(transactor("GET /".to_string()).await.is_err());
            assert_eq!(calls.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn test_io_error_classification() {
        assert!(io::Error::from(io::ErrorKind::TimedOut).is_temporary());
        assert!(!io::Error::from(io::ErrorKind::PermissionDenied).is_temporary());
    }
}
