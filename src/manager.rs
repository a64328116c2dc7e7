use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::{join_all, select_all};
use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

use crate::error::TaskError;
use crate::id::TaskId;
use crate::scope::Scope;
use crate::task::{AsyncEntry, DeferredEntry, Entry, Runnable, TaskRecord, TaskStatus};

/// Default worker limit multiplier over the logical CPU count.
const DEFAULT_WORKERS_PER_CPU: usize = 24;

/// Snapshot of task counts per status.
///
/// Consistent per entry but not atomic across the whole table: a task
/// transitioning while the snapshot is taken is counted in exactly one of
/// its two buckets.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
  pub deferred: usize,
  pub pending: usize,
  pub running: usize,
  pub completed: usize,
  pub failed: usize,
  pub canceled: usize,
  pub total: usize,
}

/// Configures and builds a [`Manager`].
pub struct ManagerBuilder<R> {
  name: String,
  worker_limit: usize,
  _result: PhantomData<fn() -> R>,
}

impl<R: Clone + Send + Sync + 'static> ManagerBuilder<R> {
  fn new() -> Self {
    let cpus = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    Self {
      name: "asynctask".to_string(),
      worker_limit: cpus * DEFAULT_WORKERS_PER_CPU,
      _result: PhantomData,
    }
  }

  /// Sets the name carried on every log event the manager emits.
  pub fn name(mut self, name: &str) -> Self {
    self.name = name.to_string();
    self
  }

  /// Sets the maximum number of concurrently running tasks. Values below
  /// one are clamped to one.
  pub fn worker_limit(mut self, limit: usize) -> Self {
    self.worker_limit = limit.max(1);
    self
  }

  /// Applies configuration from the process environment. `WORKER_LIMIT`
  /// must be a positive integer when set.
  pub fn from_env(mut self) -> Result<Self, TaskError> {
    if let Ok(value) = std::env::var("WORKER_LIMIT") {
      let limit: usize = value.trim().parse().map_err(|_| {
        TaskError::Argument(format!(
          "WORKER_LIMIT must be a positive integer, got {:?}",
          value
        ))
      })?;
      if limit == 0 {
        return Err(TaskError::Argument(
          "WORKER_LIMIT must be greater than zero".to_string(),
        ));
      }
      self.worker_limit = limit;
    }
    Ok(self)
  }

  pub fn build(self) -> Arc<Manager<R>> {
    Arc::new(Manager {
      name: Arc::new(self.name),
      worker_limit: self.worker_limit,
      semaphore: Arc::new(Semaphore::new(self.worker_limit)),
      entries: Arc::new(DashMap::new()),
      results: Arc::new(DashMap::new()),
      cancels: Arc::new(DashMap::new()),
      statuses: Arc::new(DashMap::new()),
      workers: TaskTracker::new(),
      shutting_down: Mutex::new(false),
    })
  }
}

/// Orchestrates concurrent task execution: a bounded worker pool, task
/// lifecycle tracking, await primitives, explicit cancellation, and
/// graceful shutdown. Every operation is safe to call concurrently.
///
/// One manager is meant to live for the duration of one external request,
/// be reachable from nested code through [`Scope::with_manager`], and be
/// torn down with [`shutdown`](Manager::shutdown) when the request ends.
pub struct Manager<R: Clone + Send + Sync + 'static> {
  name: Arc<String>,
  worker_limit: usize,
  semaphore: Arc<Semaphore>,
  entries: Arc<DashMap<TaskId, Entry<R>>>,
  results: Arc<DashMap<TaskId, TaskRecord<R>>>,
  cancels: Arc<DashMap<TaskId, CancellationToken>>,
  statuses: Arc<DashMap<TaskId, TaskStatus>>,
  workers: TaskTracker,
  shutting_down: Mutex<bool>,
}

impl<R: Clone + Send + Sync + 'static> Manager<R> {
  /// Creates a manager with default configuration.
  pub fn new() -> Arc<Self> {
    Self::builder().build()
  }

  pub fn builder() -> ManagerBuilder<R> {
    ManagerBuilder::new()
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  /// The configured maximum number of concurrently running tasks.
  pub fn worker_limit(&self) -> usize {
    self.worker_limit
  }

  fn is_shutting_down(&self) -> bool {
    *self.shutting_down.lock().unwrap()
  }

  /// Submits `runnable` for execution and returns its ID.
  ///
  /// Blocks only while the worker pool is full: if the submission scope
  /// fires before a slot frees up, the task finishes as Canceled without
  /// ever running. Submissions during shutdown finish as Canceled
  /// immediately. The returned ID is awaitable as soon as this returns.
  pub async fn spawn<T: Runnable<R>>(&self, scope: &Scope, runnable: T) -> TaskId {
    self.spawn_shared(scope, Arc::new(runnable)).await
  }

  pub(crate) async fn spawn_shared(
    &self,
    scope: &Scope,
    runnable: Arc<dyn Runnable<R>>,
  ) -> TaskId {
    let task_id = TaskId::new();
    let entry = Arc::new(AsyncEntry::new());
    self.entries.insert(task_id, Entry::Async(entry.clone()));
    self.statuses.insert(task_id, TaskStatus::Pending);

    if self.is_shutting_down() {
      warn!(manager = %self.name, %task_id, "submission refused, manager is shutting down");
      self.finish_without_running(task_id, &entry);
      return task_id;
    }

    // Admission: one permit per running task, held until the worker exits.
    let permit = tokio::select! {
      biased;
      _ = scope.done() => {
        debug!(manager = %self.name, %task_id, "submission scope fired while waiting for a worker slot");
        self.finish_without_running(task_id, &entry);
        return task_id;
      }
      permit = self.semaphore.clone().acquire_owned() => match permit {
        Ok(permit) => permit,
        Err(_) => {
          self.finish_without_running(task_id, &entry);
          return task_id;
        }
      },
    };

    // The task may have been canceled or shut down while the submitter
    // was blocked on the semaphore.
    if self.is_shutting_down() || !self.statuses.contains_key(&task_id) {
      self.finish_without_running(task_id, &entry);
      return task_id;
    }

    let task_scope = scope.child();
    self.cancels.insert(task_id, task_scope.token().clone());
    debug!(manager = %self.name, %task_id, "task admitted");

    let name = self.name.clone();
    let entries = self.entries.clone();
    let results = self.results.clone();
    let statuses = self.statuses.clone();

    self.workers.spawn(async move {
      let _permit = permit;
      let start = Instant::now();
      if entries.contains_key(&task_id) {
        statuses.insert(task_id, TaskStatus::Running);
      }
      trace!(manager = %name, %task_id, "task running");

      let run_scope = task_scope.clone();
      let outcome = AssertUnwindSafe(async move { runnable.run(run_scope).await })
        .catch_unwind()
        .await;

      let mut record = TaskRecord::with_status(task_id, TaskStatus::Completed);
      record.start_time = Some(start);
      record.duration = Some(start.elapsed());

      match outcome {
        Err(panic) => {
          record.status = TaskStatus::Failed;
          record.error = Some(TaskError::Panicked(panic_message(panic.as_ref())).shared());
          warn!(manager = %name, %task_id, "task panicked");
        }
        Ok(result) => {
          if task_scope.is_done() {
            record.status = TaskStatus::Canceled;
            record.error = Some(TaskError::Canceled.shared());
          } else {
            match result {
              Ok(value) => record.result = Some(value),
              Err(err) => {
                record.status = TaskStatus::Failed;
                record.error = Some(Arc::from(err));
              }
            }
          }
        }
      }

      debug!(manager = %name, %task_id, status = %record.status, "task finished");

      // A canceled task's rows were already purged; do not resurrect them.
      if entries.contains_key(&task_id) {
        statuses.insert(task_id, record.status);
        results.insert(task_id, record.clone());
      }
      entry.finish(record);
    });

    task_id
  }

  /// Creates a task that will not execute until the first await on it.
  ///
  /// No worker slot is consumed before promotion; before then the only
  /// observable effects are the ID existing and its status being
  /// Deferred. Deferrals during shutdown finish as Canceled immediately.
  pub fn defer<T: Runnable<R>>(&self, scope: &Scope, runnable: T) -> TaskId {
    let task_id = TaskId::new();

    if self.is_shutting_down() {
      warn!(manager = %self.name, %task_id, "deferral refused, manager is shutting down");
      let entry = Arc::new(AsyncEntry::new());
      self.entries.insert(task_id, Entry::Async(entry.clone()));
      self.statuses.insert(task_id, TaskStatus::Canceled);
      self.finish_without_running(task_id, &entry);
      return task_id;
    }

    let runnable: Arc<dyn Runnable<R>> = Arc::new(runnable);
    self.entries.insert(
      task_id,
      Entry::Deferred(Arc::new(DeferredEntry {
        runnable,
        scope: scope.clone(),
        promoted: tokio::sync::OnceCell::new(),
      })),
    );
    self.statuses.insert(task_id, TaskStatus::Deferred);
    debug!(manager = %self.name, %task_id, "task deferred");

    task_id
  }

  /// Blocks until the task finishes or `scope` fires.
  ///
  /// Repeatable: once the task has finished, every call returns an
  /// identical record, and a failed task always surfaces as
  /// [`TaskError::Failed`] wrapping the recorded error. A deferred task is
  /// promoted on its first await; concurrent first-awaiters all observe
  /// the same promoted task, and the work runs exactly once. If `scope`
  /// fires first, the task is canceled and the timeout/cancellation error
  /// is returned.
  ///
  /// Two running tasks that await each other never finish: no cycle
  /// detection is attempted, so an outer deadline is the caller's escape
  /// hatch.
  pub async fn await_task(
    &self,
    scope: &Scope,
    task_id: TaskId,
  ) -> Result<TaskRecord<R>, TaskError> {
    let mut task_id = task_id;
    loop {
      let entry = match self.entries.get(&task_id) {
        Some(entry) => entry.value().clone(),
        None => return Err(TaskError::NotFound),
      };

      match entry {
        Entry::Deferred(deferred) => {
          let promoted = deferred
            .promoted
            .get_or_init(|| async {
              let id = self
                .spawn_shared(&deferred.scope, deferred.runnable.clone())
                .await;
              debug!(manager = %self.name, deferred = %task_id, promoted = %id, "deferred task promoted");
              id
            })
            .await;
          task_id = *promoted;
        }
        Entry::Async(task) => {
          tokio::select! {
            biased;
            _ = task.done.cancelled() => {
              let record = match task.record.get() {
                Some(record) => record.clone(),
                None => TaskRecord::with_status(task_id, TaskStatus::Unknown),
              };
              return match &record.error {
                Some(err) => Err(TaskError::Failed(err.clone())),
                None => Ok(record),
              };
            }
            _ = scope.done() => {
              self.cancel(task_id);
              return Err(scope.cause());
            }
          }
        }
      }
    }
  }

  /// Awaits every task in `task_ids`, returning records in input order.
  ///
  /// Waits for all waiters even when one fails, then reports the first
  /// error in input order; sibling tasks are not canceled by a
  /// task-level failure. If `scope` fires first, every listed task is
  /// canceled and the timeout/cancellation error is returned. An empty
  /// list returns an empty vec.
  pub async fn await_all(
    &self,
    scope: &Scope,
    task_ids: &[TaskId],
  ) -> Result<Vec<TaskRecord<R>>, TaskError> {
    if task_ids.is_empty() {
      return Ok(Vec::new());
    }

    let group = scope.child();
    let waiters = join_all(task_ids.iter().map(|id| self.await_task(&group, *id)));

    tokio::select! {
      results = waiters => {
        let mut records = Vec::with_capacity(results.len());
        for result in results {
          records.push(result?);
        }
        Ok(records)
      }
      _ = scope.done() => {
        for task_id in task_ids {
          self.cancel(*task_id);
        }
        Err(scope.cause())
      }
    }
  }

  /// Awaits the first task in `task_ids` to finish.
  ///
  /// The first successful record wins, and every other listed task is
  /// canceled. The first failure ends the race and cancels every listed
  /// task. If `scope` fires first, every listed task is canceled and the
  /// timeout/cancellation error is returned. Ties resolve to the earliest
  /// listed task. An empty list returns a default record.
  pub async fn await_any(
    &self,
    scope: &Scope,
    task_ids: &[TaskId],
  ) -> Result<TaskRecord<R>, TaskError> {
    if task_ids.is_empty() {
      return Ok(TaskRecord::default());
    }

    let group = scope.child();
    let waiters: Vec<_> = task_ids
      .iter()
      .map(|id| Box::pin(self.await_task(&group, *id)))
      .collect();

    tokio::select! {
      (result, index, _rest) = select_all(waiters) => {
        group.cancel();
        match result {
          Ok(record) => {
            for (i, task_id) in task_ids.iter().enumerate() {
              if i != index {
                self.cancel(*task_id);
              }
            }
            Ok(record)
          }
          Err(err) => {
            for task_id in task_ids {
              self.cancel(*task_id);
            }
            Err(err)
          }
        }
      }
      _ = scope.done() => {
        group.cancel();
        for task_id in task_ids {
          self.cancel(*task_id);
        }
        Err(scope.cause())
      }
    }
  }

  /// Cancels a task: fires its cancellation trigger and purges every
  /// trace of it, so later lookups report not-found. Returns `true` iff
  /// the task existed at the moment of the call.
  ///
  /// Cancellation is a request, not a completion: a running worker keeps
  /// going until its next cooperative scope check.
  pub fn cancel(&self, task_id: TaskId) -> bool {
    if self.statuses.remove(&task_id).is_none() {
      return false;
    }
    if let Some((_, token)) = self.cancels.remove(&task_id) {
      token.cancel();
    }
    self.entries.remove(&task_id);
    self.results.remove(&task_id);
    debug!(manager = %self.name, %task_id, "task canceled");
    true
  }

  /// Current status of a task. A promoted deferred task reports the
  /// promoted task's status.
  pub fn status(&self, task_id: TaskId) -> Result<TaskStatus, TaskError> {
    let mut task_id = task_id;
    loop {
      let status = match self.statuses.get(&task_id) {
        Some(status) => *status.value(),
        None => return Err(TaskError::NotFound),
      };
      if status != TaskStatus::Deferred {
        return Ok(status);
      }
      let promoted = match self.entries.get(&task_id) {
        Some(entry) => match entry.value() {
          Entry::Deferred(deferred) => deferred.promoted.get().copied(),
          Entry::Async(_) => None,
        },
        None => None,
      };
      match promoted {
        Some(promoted) => task_id = promoted,
        None => return Ok(status),
      }
    }
  }

  /// Snapshot of a task's record with its current status merged in.
  /// Before the task finishes, the record carries the status alone.
  pub fn task(&self, task_id: TaskId) -> Result<TaskRecord<R>, TaskError> {
    let status = match self.statuses.get(&task_id) {
      Some(status) => *status.value(),
      None => return Err(TaskError::NotFound),
    };
    match self.results.get(&task_id) {
      Some(result) => {
        let mut record = result.value().clone();
        record.status = status;
        Ok(record)
      }
      None => Ok(TaskRecord::with_status(task_id, status)),
    }
  }

  /// Removes finished tasks from memory, returning how many were removed.
  ///
  /// With a nonzero `ttl`, only tasks whose recorded start time is older
  /// than `ttl` are removed; a zero `ttl` removes every terminal task.
  /// Deferred, pending, and running tasks are never pruned.
  pub fn prune(&self, ttl: Duration) -> usize {
    let now = Instant::now();
    let terminal: Vec<TaskId> = self
      .statuses
      .iter()
      .filter(|entry| entry.value().is_terminal())
      .map(|entry| *entry.key())
      .collect();

    let mut pruned = 0;
    for task_id in terminal {
      if !ttl.is_zero() {
        let fresh = self.results.get(&task_id).is_some_and(|record| {
          record
            .value()
            .start_time
            .is_some_and(|start| now.duration_since(start) < ttl)
        });
        if fresh {
          continue;
        }
      }
      self.entries.remove(&task_id);
      self.cancels.remove(&task_id);
      self.results.remove(&task_id);
      self.statuses.remove(&task_id);
      pruned += 1;
    }

    if pruned > 0 {
      debug!(manager = %self.name, pruned, "pruned terminal tasks");
    }
    pruned
  }

  /// Shuts the manager down: refuses new submissions, fires every
  /// recorded cancellation trigger, waits for in-flight workers until
  /// `scope` fires, then purges all task state. Afterwards every lookup
  /// reports not-found and [`stats`](Manager::stats) is all zeros.
  pub async fn shutdown(&self, scope: &Scope) {
    {
      let mut shutting_down = self.shutting_down.lock().unwrap();
      if *shutting_down {
        debug!(manager = %self.name, "shutdown already initiated");
      }
      *shutting_down = true;
    }
    info!(manager = %self.name, "shutting down, canceling all tasks");

    for entry in self.cancels.iter() {
      entry.value().cancel();
    }

    self.workers.close();
    tokio::select! {
      _ = self.workers.wait() => {
        debug!(manager = %self.name, "all workers finished");
      }
      _ = scope.done() => {
        warn!(manager = %self.name, "shutdown wait abandoned, scope fired first");
      }
    }

    self.entries.clear();
    self.cancels.clear();
    self.results.clear();
    self.statuses.clear();
    info!(manager = %self.name, "shutdown complete");
  }

  /// Snapshot of task counts per status.
  pub fn stats(&self) -> Stats {
    let mut stats = Stats::default();
    for entry in self.statuses.iter() {
      stats.total += 1;
      match entry.value() {
        TaskStatus::Deferred => stats.deferred += 1,
        TaskStatus::Pending => stats.pending += 1,
        TaskStatus::Running => stats.running += 1,
        TaskStatus::Completed => stats.completed += 1,
        TaskStatus::Failed => stats.failed += 1,
        TaskStatus::Canceled => stats.canceled += 1,
        TaskStatus::Unknown => {}
      }
    }
    stats
  }

  /// Finishes a task as Canceled before it ever ran, resolving its latch
  /// with a canceled error.
  fn finish_without_running(&self, task_id: TaskId, entry: &AsyncEntry<R>) {
    let mut record = TaskRecord::with_status(task_id, TaskStatus::Canceled);
    record.error = Some(TaskError::Canceled.shared());
    if self.statuses.contains_key(&task_id) {
      self.statuses.insert(task_id, TaskStatus::Canceled);
      self.results.insert(task_id, record.clone());
    }
    entry.finish(record);
  }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
  if let Some(s) = payload.downcast_ref::<&str>() {
    (*s).to_string()
  } else if let Some(s) = payload.downcast_ref::<String>() {
    s.clone()
  } else {
    "opaque panic payload".to_string()
  }
}
