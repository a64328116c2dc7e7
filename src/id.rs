use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

use crate::error::TaskError;

/// Unique identifier for a submitted task.
///
/// Generated at submission; collision-free across the process lifetime
/// with overwhelming probability. Renders as a string for embedding
/// layers and parses back with [`FromStr`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(Uuid);

impl TaskId {
  pub(crate) fn new() -> Self {
    Self(Uuid::new_v4())
  }

  /// The nil ID, carried by records that do not refer to a real task.
  pub const fn nil() -> Self {
    Self(Uuid::nil())
  }
}

impl fmt::Display for TaskId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    self.0.fmt(f)
  }
}

impl FromStr for TaskId {
  type Err = TaskError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Uuid::parse_str(s)
      .map(Self)
      .map_err(|e| TaskError::Argument(format!("malformed task id {:?}: {}", s, e)))
  }
}
