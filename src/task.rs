use std::fmt;
use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{BoxError, DynError};
use crate::id::TaskId;
use crate::scope::Scope;

/// Current state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
  /// Submitted via defer, not yet promoted by a first await.
  Deferred,
  /// Submitted, waiting for a worker slot.
  Pending,
  /// Picked up by a worker.
  Running,
  Completed,
  Failed,
  Canceled,
  /// Only reported for lookups of unknown IDs.
  Unknown,
}

impl TaskStatus {
  /// Whether the task has reached a terminal state.
  pub fn is_terminal(self) -> bool {
    matches!(
      self,
      TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Canceled
    )
  }
}

impl fmt::Display for TaskStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      TaskStatus::Deferred => "deferred",
      TaskStatus::Pending => "pending",
      TaskStatus::Running => "running",
      TaskStatus::Completed => "completed",
      TaskStatus::Failed => "failed",
      TaskStatus::Canceled => "canceled",
      TaskStatus::Unknown => "unknown",
    })
  }
}

/// Externally visible snapshot of a task.
#[derive(Debug, Clone)]
pub struct TaskRecord<R> {
  pub id: TaskId,
  /// The produced value, set once the task completes.
  pub result: Option<R>,
  /// The recorded failure for failed, canceled, or panicked tasks.
  pub error: Option<DynError>,
  /// When a worker picked the task up. Unset for never-started tasks.
  pub start_time: Option<Instant>,
  /// Wall time between start and finish. Unset until finished.
  pub duration: Option<Duration>,
  pub status: TaskStatus,
}

impl<R> TaskRecord<R> {
  pub(crate) fn with_status(id: TaskId, status: TaskStatus) -> Self {
    Self {
      id,
      result: None,
      error: None,
      start_time: None,
      duration: None,
      status,
    }
  }
}

impl<R> Default for TaskRecord<R> {
  fn default() -> Self {
    Self::with_status(TaskId::nil(), TaskStatus::Unknown)
  }
}

/// One unit of work: given a cancellation scope, produce a value or fail.
///
/// Implemented for free by any `Fn(Scope) -> Future` closure; implement it
/// directly to give a struct its own async logic. The work is expected to
/// check its scope at suspension points so cancellation can take effect.
pub trait Runnable<R>: Send + Sync + 'static {
  fn run(&self, scope: Scope) -> BoxFuture<'static, Result<R, BoxError>>;
}

impl<R, F, Fut> Runnable<R> for F
where
  F: Fn(Scope) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<R, BoxError>> + Send + 'static,
{
  fn run(&self, scope: Scope) -> BoxFuture<'static, Result<R, BoxError>> {
    Box::pin((self)(scope))
  }
}

/// An admitted task: a completion latch plus a write-once record slot.
/// The latch fires exactly once, after the record is in place, and stays
/// resolved for late awaiters.
pub(crate) struct AsyncEntry<R> {
  pub(crate) done: CancellationToken,
  pub(crate) record: OnceLock<TaskRecord<R>>,
}

impl<R> AsyncEntry<R> {
  pub(crate) fn new() -> Self {
    Self {
      done: CancellationToken::new(),
      record: OnceLock::new(),
    }
  }

  /// Stores the terminal record and resolves the latch. The first write
  /// wins; the slot is immutable afterwards.
  pub(crate) fn finish(&self, record: TaskRecord<R>) {
    let _ = self.record.set(record);
    self.done.cancel();
  }
}

/// A deferred task: holds the work and its submission scope until the
/// first await promotes it. The promotion cell fires exactly once, so
/// every concurrent first-awaiter agrees on the promoted task.
pub(crate) struct DeferredEntry<R> {
  pub(crate) runnable: Arc<dyn Runnable<R>>,
  pub(crate) scope: Scope,
  pub(crate) promoted: OnceCell<TaskId>,
}

#[derive(Clone)]
pub(crate) enum Entry<R> {
  Async(Arc<AsyncEntry<R>>),
  Deferred(Arc<DeferredEntry<R>>),
}
