use std::sync::Arc;

use thiserror::Error;

/// A failure produced by user code inside a [`Runnable`](crate::Runnable).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A recorded task failure, shared between every awaiter of the task.
pub type DynError = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Errors surfaced by the task manager and its wrappers.
///
/// The display text of each variant is stable: embedding layers classify
/// exceptions crossing a runtime boundary by substring match on it.
#[derive(Error, Debug, Clone)]
pub enum TaskError {
  /// The caller's scope hit its deadline before the task finished.
  #[error("task timed out")]
  Timeout,

  /// The caller's scope was canceled without a deadline, the task was
  /// explicitly canceled, or the manager is shutting down.
  #[error("task canceled")]
  Canceled,

  /// The task ID is not, or is no longer, tracked by the manager.
  #[error("task not found")]
  NotFound,

  /// The task finished with an error. The recorded failure is preserved
  /// and may itself be a [`TaskError`] (panicked, timed out, canceled).
  #[error("task failed: {0}")]
  Failed(DynError),

  /// The task panicked while running; the payload message is preserved.
  #[error("task panicked: {0}")]
  Panicked(String),

  /// Every retry attempt failed; wraps the last attempt's error.
  #[error("retry exhausted after {attempts} retries: {last}")]
  RetryExhausted { attempts: u32, last: DynError },

  /// Malformed input to a public operation.
  #[error("invalid argument: {0}")]
  Argument(String),
}

impl TaskError {
  /// Moves the error behind a shared pointer so it can live in a task
  /// record cloned by concurrent awaiters.
  pub(crate) fn shared(self) -> DynError {
    Arc::new(self)
  }
}
