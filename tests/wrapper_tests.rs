use asynctask::{
  with_retry, with_timeout, BoxError, Manager, Runnable, Scope, TaskError, TaskStatus,
};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;

// Helper to initialize tracing for tests; Once ensures a single install.
fn setup_tracing_for_test() {
  use std::sync::Once;
  use tracing_subscriber::{fmt, EnvFilter};
  static TRACING_INIT: Once = Once::new();

  TRACING_INIT.call_once(|| {
    let filter =
      EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,asynctask=debug"));
    fmt::Subscriber::builder()
      .with_env_filter(filter)
      .with_test_writer()
      .try_init()
      .ok();
  });
}

// Fails the first `failures` invocations, then yields `value`.
fn flaky(failures: usize, value: &'static str, attempts: Arc<AtomicUsize>) -> impl Runnable<String> {
  move |_scope: Scope| {
    let attempts = attempts.clone();
    async move {
      let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
      if attempt <= failures {
        Err::<String, BoxError>("temporary error".into())
      } else {
        Ok(value.to_string())
      }
    }
  }
}

// Sleeps without ever checking its scope, then yields `value`.
fn oblivious(duration: Duration, value: &'static str) -> impl Runnable<String> {
  move |_scope: Scope| async move {
    sleep(duration).await;
    Ok(value.to_string())
  }
}

#[tokio::test]
async fn test_retry_succeeds_after_transient_failures() {
  setup_tracing_for_test();
  let manager = Manager::<String>::builder().name("retry").build();
  let scope = Scope::new();

  let attempts = Arc::new(AtomicUsize::new(0));
  let wrapped = with_retry(
    flaky(2, "success", attempts.clone()),
    3,
    Duration::from_millis(10),
  );

  let task_id = manager.spawn(&scope, wrapped).await;
  let record = manager.await_task(&scope, task_id).await.unwrap();

  assert_eq!(record.result.as_deref(), Some("success"));
  assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_retry_with_defer_runs_nothing_before_await() {
  setup_tracing_for_test();
  let manager = Manager::<String>::builder().name("retry_defer").build();
  let scope = Scope::new();

  let attempts = Arc::new(AtomicUsize::new(0));
  let wrapped = with_retry(
    flaky(1, "deferred success", attempts.clone()),
    3,
    Duration::from_millis(10),
  );

  let task_id = manager.defer(&scope, wrapped);
  assert_eq!(attempts.load(Ordering::SeqCst), 0);

  let record = manager.await_task(&scope, task_id).await.unwrap();
  assert_eq!(record.result.as_deref(), Some("deferred success"));
  assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_retry_exhausted_wraps_last_failure() {
  setup_tracing_for_test();
  let attempts = Arc::new(AtomicUsize::new(0));
  let wrapped = with_retry(
    flaky(10, "never", attempts.clone()),
    2,
    Duration::from_millis(1),
  );

  let err = wrapped.run(Scope::new()).await.unwrap_err();
  match *err.downcast::<TaskError>().unwrap() {
    TaskError::RetryExhausted { attempts: retries, ref last } => {
      assert_eq!(retries, 2);
      assert_eq!(last.to_string(), "temporary error");
    }
    ref other => panic!("expected retry exhausted, got {:?}", other),
  }
  assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_retry_aborts_backoff_when_scope_fires() {
  setup_tracing_for_test();
  let attempts = Arc::new(AtomicUsize::new(0));
  let wrapped = with_retry(
    flaky(10, "never", attempts.clone()),
    5,
    Duration::from_secs(10),
  );

  let scope = Scope::new();
  let canceller = scope.clone();
  tokio::spawn(async move {
    sleep(Duration::from_millis(20)).await;
    canceller.cancel();
  });

  let start = tokio::time::Instant::now();
  let err = wrapped.run(scope).await.unwrap_err();
  assert!(start.elapsed() < Duration::from_secs(1));
  assert!(matches!(
    *err.downcast::<TaskError>().unwrap(),
    TaskError::Canceled
  ));
  assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_timeout_passes_fast_work_through() {
  setup_tracing_for_test();
  let wrapped = with_timeout(
    oblivious(Duration::from_millis(10), "completed"),
    Duration::from_millis(100),
  );

  let value = wrapped.run(Scope::new()).await.unwrap();
  assert_eq!(value, "completed");
}

#[tokio::test]
async fn test_timeout_surfaces_as_failed_task() {
  setup_tracing_for_test();
  let manager = Manager::<String>::builder().name("timeout").build();
  let scope = Scope::new();

  let wrapped = with_timeout(
    oblivious(Duration::from_millis(200), "late"),
    Duration::from_millis(50),
  );

  let task_id = manager.spawn(&scope, wrapped).await;
  match manager.await_task(&scope, task_id).await {
    Err(TaskError::Failed(source)) => {
      assert!(matches!(
        source.downcast_ref::<TaskError>(),
        Some(TaskError::Timeout)
      ));
    }
    other => panic!("expected failed-timeout, got {:?}", other),
  }

  let record = manager.task(task_id).unwrap();
  assert_eq!(record.status, TaskStatus::Failed);
}

#[tokio::test]
async fn test_timeout_propagates_parent_cancellation() {
  setup_tracing_for_test();
  let scope = Scope::new();
  scope.cancel();

  let wrapped = with_timeout(
    oblivious(Duration::from_millis(100), "x"),
    Duration::from_secs(10),
  );

  let err = wrapped.run(scope).await.unwrap_err();
  assert!(matches!(
    *err.downcast::<TaskError>().unwrap(),
    TaskError::Canceled
  ));
}

#[tokio::test]
async fn test_timeout_over_retry_shares_one_budget() {
  setup_tracing_for_test();
  let manager = Manager::<String>::builder().name("compose_outer").build();
  let scope = Scope::new();

  let attempts = Arc::new(AtomicUsize::new(0));
  let wrapped = with_timeout(
    with_retry(
      flaky(1, "composed", attempts.clone()),
      3,
      Duration::from_millis(10),
    ),
    Duration::from_millis(500),
  );

  let task_id = manager.spawn(&scope, wrapped).await;
  let record = manager.await_task(&scope, task_id).await.unwrap();

  assert_eq!(record.result.as_deref(), Some("composed"));
  assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_retry_over_timeout_budgets_each_attempt() {
  setup_tracing_for_test();
  let attempts = Arc::new(AtomicUsize::new(0));
  let counter = attempts.clone();
  let slow_then_fast = move |_scope: Scope| {
    let counter = counter.clone();
    async move {
      let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
      if attempt == 1 {
        sleep(Duration::from_millis(200)).await;
      }
      Ok::<String, BoxError>("recovered".to_string())
    }
  };

  let wrapped = with_retry(
    with_timeout(slow_then_fast, Duration::from_millis(50)),
    2,
    Duration::from_millis(10),
  );

  let value = wrapped.run(Scope::new()).await.unwrap();
  assert_eq!(value, "recovered");
  assert_eq!(attempts.load(Ordering::SeqCst), 2);
}
