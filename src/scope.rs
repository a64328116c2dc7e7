use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::TaskError;
use crate::manager::Manager;

/// A composable cancellation scope: a cancel signal, an optional deadline,
/// and the request-scoped [`Manager`] binding.
///
/// Derived scopes ([`child`](Scope::child), [`with_timeout`](Scope::with_timeout))
/// inherit the parent's cancellation and the tighter of the two deadlines;
/// canceling a child never affects its parent. Cancellation is cooperative:
/// firing a scope unblocks whoever awaits [`done`](Scope::done) but aborts
/// nothing that does not observe it.
#[derive(Clone)]
pub struct Scope {
  token: CancellationToken,
  deadline: Option<Instant>,
  manager: Option<Arc<dyn Any + Send + Sync>>,
}

impl Scope {
  /// A root scope: no deadline, canceled only explicitly.
  pub fn new() -> Self {
    Self {
      token: CancellationToken::new(),
      deadline: None,
      manager: None,
    }
  }

  /// Derives a child scope. Canceling the parent cancels the child;
  /// canceling the child leaves the parent untouched.
  pub fn child(&self) -> Self {
    Self {
      token: self.token.child_token(),
      deadline: self.deadline,
      manager: self.manager.clone(),
    }
  }

  /// Derives a child scope that expires `timeout` from now, or at the
  /// parent's deadline if that comes sooner. A zero duration means "no
  /// timeout" and only derives the cancellation edge.
  pub fn with_timeout(&self, timeout: Duration) -> Self {
    let mut child = self.child();
    if !timeout.is_zero() {
      let deadline = Instant::now() + timeout;
      child.deadline = Some(match self.deadline {
        Some(parent) => parent.min(deadline),
        None => deadline,
      });
    }
    child
  }

  /// Fires the cancellation signal.
  pub fn cancel(&self) {
    self.token.cancel();
  }

  /// Whether the cancel signal has fired. The deadline is not considered.
  pub fn is_cancelled(&self) -> bool {
    self.token.is_cancelled()
  }

  /// Whether the scope is finished: canceled or past its deadline.
  pub fn is_done(&self) -> bool {
    self.token.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
  }

  /// Resolves once the scope is canceled or its deadline passes. Pending
  /// forever on a root scope that is never canceled.
  pub async fn done(&self) {
    match self.deadline {
      Some(deadline) => {
        tokio::select! {
          _ = self.token.cancelled() => {}
          _ = tokio::time::sleep_until(deadline) => {}
        }
      }
      None => self.token.cancelled().await,
    }
  }

  /// Why the scope finished: [`TaskError::Timeout`] if the deadline
  /// passed, [`TaskError::Canceled`] otherwise.
  pub fn cause(&self) -> TaskError {
    if self.deadline.is_some_and(|d| Instant::now() >= d) {
      TaskError::Timeout
    } else {
      TaskError::Canceled
    }
  }

  /// The scope's deadline, if one is set.
  pub fn deadline(&self) -> Option<Instant> {
    self.deadline
  }

  /// The underlying cancellation token.
  pub fn token(&self) -> &CancellationToken {
    &self.token
  }

  /// Returns a derived scope carrying `manager`. The binding survives
  /// further derivation, so nested code can recover the manager from any
  /// descendant scope without threading it through every call.
  pub fn with_manager<R: Clone + Send + Sync + 'static>(&self, manager: Arc<Manager<R>>) -> Self {
    let mut scope = self.clone();
    scope.manager = Some(manager);
    scope
  }

  /// The manager bound to this scope, or a fresh default manager when
  /// none (of this result type) is attached.
  pub fn manager<R: Clone + Send + Sync + 'static>(&self) -> Arc<Manager<R>> {
    self
      .manager
      .as_ref()
      .and_then(|m| m.clone().downcast::<Manager<R>>().ok())
      .unwrap_or_else(|| Manager::builder().build())
  }
}

impl Default for Scope {
  fn default() -> Self {
    Self::new()
  }
}

impl fmt::Debug for Scope {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Scope")
      .field("cancelled", &self.token.is_cancelled())
      .field("deadline", &self.deadline)
      .field("has_manager", &self.manager.is_some())
      .finish()
  }
}
