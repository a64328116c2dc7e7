//! A request-scoped asynchronous task manager: arbitrary work units run
//! concurrently under a bounded worker pool, with lifecycle tracking,
//! single/aggregate/racing awaits, deferred execution, cooperative
//! cancellation, pruning, and graceful shutdown.

mod duration;
mod error;
mod id;
mod manager;
mod scope;
mod task;
mod wrappers;

pub use duration::parse_duration;
pub use error::{BoxError, DynError, TaskError};
pub use id::TaskId;
pub use manager::{Manager, ManagerBuilder, Stats};
pub use scope::Scope;
pub use task::{Runnable, TaskRecord, TaskStatus};
pub use wrappers::{with_retry, with_timeout, Retry, Timeout};
