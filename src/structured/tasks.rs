//! Convenience fork/join helpers over ad-hoc scopes.
//!
//! Each helper opens a [`TaskScope`], forks every task, joins, and applies
//! the scope's policy, with the enclosing context inherited by every child,
//! exactly as with a hand-rolled scope.
//!
//! # Example
//!
//! ```
//! use ambit::structured;
//!
//! let results = structured::invoke_all(vec![
//!     || Ok("a".to_string()),
//!     || Ok("b".to_string()),
//! ])
//! .unwrap();
//! assert_eq!(results, vec!["a".to_string(), "b".to_string()]);
//! ```

use crate::error::Result;
use crate::structured::{Subtask, TaskResult, TaskScope};
use std::time::Duration;

/// Runs every task concurrently and awaits them all.
///
/// Results are returned in task order. The first failure cancels the
/// siblings and is surfaced.
///
/// # Errors
///
/// The first child failure, wrapped as
/// [`ExecutionFailure`](crate::error::ErrorKind::ExecutionFailure).
pub fn invoke_all<T, F>(tasks: Vec<F>) -> Result<Vec<T>>
where
    T: Send + 'static,
    F: FnOnce() -> TaskResult<T> + Send + 'static,
{
    let mut scope = TaskScope::shutdown_on_failure();
    let subtasks = fork_all(&mut scope, tasks)?;
    scope.join()?;
    scope.throw_if_failed()?;
    subtasks.iter().map(Subtask::get).collect()
}

/// As [`invoke_all`], bounded by a deadline.
///
/// # Errors
///
/// As [`invoke_all`], plus [`Timeout`](crate::error::ErrorKind::Timeout)
/// when the deadline elapses; outstanding children are cancelled.
pub fn invoke_all_timeout<T, F>(timeout: Duration, tasks: Vec<F>) -> Result<Vec<T>>
where
    T: Send + 'static,
    F: FnOnce() -> TaskResult<T> + Send + 'static,
{
    let mut scope = TaskScope::shutdown_on_failure();
    let subtasks = fork_all(&mut scope, tasks)?;
    scope.join_timeout(timeout)?;
    scope.throw_if_failed()?;
    subtasks.iter().map(Subtask::get).collect()
}

/// Runs every task concurrently and returns the first successful result.
///
/// The winner cancels the remaining tasks.
///
/// # Errors
///
/// [`ExecutionFailure`](crate::error::ErrorKind::ExecutionFailure) when all
/// tasks failed; [`InvalidScopeState`](crate::error::ErrorKind::InvalidScopeState)
/// for an empty task list.
pub fn invoke_any<T, F>(tasks: Vec<F>) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> TaskResult<T> + Send + 'static,
{
    let mut scope = TaskScope::shutdown_on_success();
    fork_all(&mut scope, tasks)?;
    scope.join()?;
    scope.result()
}

/// As [`invoke_any`], bounded by a deadline.
///
/// # Errors
///
/// As [`invoke_any`], plus [`Timeout`](crate::error::ErrorKind::Timeout)
/// when no task succeeded before the deadline.
pub fn invoke_any_timeout<T, F>(timeout: Duration, tasks: Vec<F>) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> TaskResult<T> + Send + 'static,
{
    let mut scope = TaskScope::shutdown_on_success();
    fork_all(&mut scope, tasks)?;
    scope.join_timeout(timeout)?;
    scope.result()
}

/// Runs every task concurrently, then reduces the results.
///
/// # Errors
///
/// As [`invoke_all`].
pub fn invoke_all_and_combine<T, R, F>(
    combiner: impl FnOnce(Vec<T>) -> R,
    tasks: Vec<F>,
) -> Result<R>
where
    T: Send + 'static,
    F: FnOnce() -> TaskResult<T> + Send + 'static,
{
    invoke_all(tasks).map(combiner)
}

fn fork_all<T, F>(scope: &mut TaskScope<T>, tasks: Vec<F>) -> Result<Vec<Subtask<T>>>
where
    T: Send + 'static,
    F: FnOnce() -> TaskResult<T> + Send + 'static,
{
    tasks.into_iter().map(|task| scope.fork(task)).collect()
}
