//! De-duplication of concurrent refreshes.
//!
//! [`SingleFlight`] makes sure that at most one operation is in flight at a time: callers that
//! arrive while an operation is running receive the outcome of that same operation.
//! [`SingleFlightWithBackoff`] additionally remembers a rate-limit error and short-circuits until
//! its retry-after deadline has passed.
use std::{
    future::Future,
    sync::{Arc, Mutex},
};

use chrono::Utc;
use futures::{
    future::{self, BoxFuture, Shared},
    FutureExt,
};

use crate::{Error, Result};

type SharedResult<T> = Shared<BoxFuture<'static, Result<T>>>;

pub struct SingleFlight<T> {
    in_flight: Arc<Mutex<Option<SharedResult<T>>>>,
}

impl<T> Default for SingleFlight<T> {
    fn default() -> Self {
        SingleFlight {
            in_flight: Arc::new(Mutex::new(None)),
        }
    }
}

impl<T> Clone for SingleFlight<T> {
    fn clone(&self) -> Self {
        SingleFlight {
            in_flight: Arc::clone(&self.in_flight),
        }
    }
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        SingleFlight::default()
    }

    /// Run `operation` unless another one is already in flight, in which case the returned
    /// future resolves with the outcome of the in-flight operation and `operation` is dropped
    /// without being called.
    pub fn run<F, Fut>(&self, operation: F) -> SharedResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let mut in_flight = self
            .in_flight
            .lock()
            .expect("thread holding single-flight lock should not panic");

        if let Some(current) = &*in_flight {
            return current.clone();
        }

        let slot = Arc::clone(&self.in_flight);
        let fut = operation();
        let shared = async move {
            let result = fut.await;
            *slot
                .lock()
                .expect("thread holding single-flight lock should not panic") = None;
            result
        }
        .boxed()
        .shared();

        *in_flight = Some(shared.clone());
        shared
    }

    /// Returns `true` if an operation is currently in flight.
    pub fn is_in_flight(&self) -> bool {
        self.in_flight
            .lock()
            .expect("thread holding single-flight lock should not panic")
            .is_some()
    }
}

pub struct SingleFlightWithBackoff<T> {
    inner: SingleFlight<T>,
    /// The last rate-limit error, if any.
    rate_limited: Arc<Mutex<Option<Error>>>,
}

impl<T> Default for SingleFlightWithBackoff<T> {
    fn default() -> Self {
        SingleFlightWithBackoff {
            inner: SingleFlight::default(),
            rate_limited: Arc::new(Mutex::new(None)),
        }
    }
}

impl<T> Clone for SingleFlightWithBackoff<T> {
    fn clone(&self) -> Self {
        SingleFlightWithBackoff {
            inner: self.inner.clone(),
            rate_limited: Arc::clone(&self.rate_limited),
        }
    }
}

impl<T> SingleFlightWithBackoff<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        SingleFlightWithBackoff::default()
    }

    /// Like [`SingleFlight::run`], but fails fast with the remembered rate-limit error while its
    /// deadline has not passed.
    pub fn run<F, Fut>(&self, operation: F) -> BoxFuture<'static, Result<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        if let Some(err) = self.active_rate_limit() {
            log::debug!(target: "featureboard", "rate limited, skipping refresh: {err}");
            return future::ready(Err(err)).boxed();
        }

        let rate_limited = Arc::clone(&self.rate_limited);
        self.inner
            .run(move || {
                let fut = operation();
                async move {
                    let result = fut.await;
                    let mut slot = rate_limited
                        .lock()
                        .expect("thread holding rate-limit lock should not panic");
                    *slot = match &result {
                        Err(err @ Error::TooManyRequests { .. }) => Some(err.clone()),
                        _ => None,
                    };
                    result
                }
            })
            .boxed()
    }

    fn active_rate_limit(&self) -> Option<Error> {
        let slot = self
            .rate_limited
            .lock()
            .expect("thread holding rate-limit lock should not panic");
        slot.as_ref()
            .filter(|err| err.retry_after().is_some_and(|deadline| deadline > Utc::now()))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use chrono::TimeDelta;
    use futures::future::join_all;

    use super::*;

    #[tokio::test]
    async fn concurrent_callers_share_one_operation() {
        let single = SingleFlight::<u32>::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let futures = (0..5).map(|_| {
            let calls = Arc::clone(&calls);
            single.run(move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(42)
            })
        });
        let results = join_all(futures).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| matches!(r, Ok(42))));
        assert!(!single.is_in_flight());
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_failure() {
        let single = SingleFlight::<()>::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let futures = (0..3).map(|_| {
            let calls = Arc::clone(&calls);
            single.run(move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                Err(Error::UnexpectedStatus {
                    status: 500,
                    status_text: "Internal Server Error".into(),
                })
            })
        });
        let results = join_all(futures).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results
            .iter()
            .all(|r| matches!(r, Err(Error::UnexpectedStatus { status: 500, .. }))));
    }

    #[tokio::test]
    async fn runs_again_once_previous_operation_completed() {
        let single = SingleFlight::<usize>::new();
        let calls = Arc::new(AtomicUsize::new(0));

        for expected in 1..=2 {
            let calls = Arc::clone(&calls);
            let result = single
                .run(move || async move { Ok(calls.fetch_add(1, Ordering::SeqCst) + 1) })
                .await;
            assert_eq!(result.unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn backoff_short_circuits_until_deadline() {
        let single = SingleFlightWithBackoff::<()>::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let retry_after = Utc::now() + TimeDelta::seconds(60);

        let run = |single: &SingleFlightWithBackoff<()>, calls: &Arc<AtomicUsize>| {
            let calls = Arc::clone(calls);
            single.run(move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::TooManyRequests { retry_after })
            })
        };

        assert!(run(&single, &calls).await.is_err());
        let second = run(&single, &calls).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.unwrap_err().retry_after(), Some(retry_after));
    }

    #[tokio::test]
    async fn backoff_runs_once_deadline_has_passed() {
        let single = SingleFlightWithBackoff::<()>::new();
        let calls = Arc::new(AtomicUsize::new(0));

        {
            let calls = Arc::clone(&calls);
            let _ = single
                .run(move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(Error::TooManyRequests {
                        retry_after: Utc::now() - TimeDelta::seconds(1),
                    })
                })
                .await;
        }
        {
            let calls = Arc::clone(&calls);
            single
                .run(move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
                .unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
