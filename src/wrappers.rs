use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::debug;

use crate::error::{BoxError, TaskError};
use crate::scope::Scope;
use crate::task::Runnable;

/// Wraps `runnable` with retry logic: up to `attempts + 1` invocations
/// with a linearly growing pause between failures.
///
/// The pause after failed attempt `i` is `backoff × (i + 1)`; the last
/// failure is not followed by a pause. If the ambient scope fires during
/// a pause, the wrapper returns the scope's timeout/cancellation error
/// instead of retrying. Exhausting every attempt yields
/// [`TaskError::RetryExhausted`] wrapping the last failure.
pub fn with_retry<R>(runnable: impl Runnable<R>, attempts: u32, backoff: Duration) -> Retry<R> {
  Retry {
    inner: Arc::new(runnable),
    attempts,
    backoff,
  }
}

/// Retrying [`Runnable`] produced by [`with_retry`].
pub struct Retry<R> {
  inner: Arc<dyn Runnable<R>>,
  attempts: u32,
  backoff: Duration,
}

impl<R: Clone + Send + Sync + 'static> Runnable<R> for Retry<R> {
  fn run(&self, scope: Scope) -> BoxFuture<'static, Result<R, BoxError>> {
    let inner = self.inner.clone();
    let attempts = self.attempts;
    let backoff = self.backoff;
    Box::pin(async move {
      let mut attempt = 0;
      loop {
        let err = match inner.run(scope.clone()).await {
          Ok(value) => return Ok(value),
          Err(err) => err,
        };
        if attempt >= attempts {
          return Err(Box::new(TaskError::RetryExhausted {
            attempts,
            last: Arc::from(err),
          }) as BoxError);
        }
        debug!(attempt, error = %err, "attempt failed, backing off");
        tokio::select! {
          _ = tokio::time::sleep(backoff * (attempt + 1)) => {}
          _ = scope.done() => return Err(Box::new(scope.cause()) as BoxError),
        }
        attempt += 1;
      }
    })
  }
}

/// Wraps `runnable` with a deadline: the work runs under a child scope
/// that is canceled once `timeout` elapses, and the deadline firing
/// yields [`TaskError::Timeout`].
///
/// Composition order decides the budget:
/// `with_timeout(with_retry(r, n, b), d)` shares one budget across all
/// attempts, `with_retry(with_timeout(r, d), n, b)` budgets each attempt
/// separately.
pub fn with_timeout<R>(runnable: impl Runnable<R>, timeout: Duration) -> Timeout<R> {
  Timeout {
    inner: Arc::new(runnable),
    timeout,
  }
}

/// Deadline-enforcing [`Runnable`] produced by [`with_timeout`].
pub struct Timeout<R> {
  inner: Arc<dyn Runnable<R>>,
  timeout: Duration,
}

impl<R: Clone + Send + Sync + 'static> Runnable<R> for Timeout<R> {
  fn run(&self, scope: Scope) -> BoxFuture<'static, Result<R, BoxError>> {
    let inner = self.inner.clone();
    let timeout = self.timeout;
    Box::pin(async move {
      let child = scope.with_timeout(timeout);
      let work = inner.run(child.clone());
      tokio::select! {
        result = work => result,
        _ = child.done() => {
          child.cancel();
          Err(Box::new(child.cause()) as BoxError)
        }
      }
    })
  }
}
