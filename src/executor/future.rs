//! Completion handles for submitted tasks.
//!
//! A [`TaskFuture`] is the caller's side of a one-shot completion cell: the
//! executor worker fills it exactly once, the caller blocks on [`join`] (or
//! polls with a deadline). The cell is a mutex + condvar pair with an atomic
//! done flag for cheap `is_done` checks.
//!
//! Cancellation is soft: a cancelled task that has not started resolves to
//! [`ErrorKind::Interrupted`]; one already running completes normally (a
//! closure cannot be preempted) and its result is still delivered. A task
//! dropped by its executor without ever running (a shut-down pool, for
//! example) also resolves to `Interrupted`, so a future can never hang on
//! rejected work.
//!
//! [`join`]: TaskFuture::join
//! [`ErrorKind::Interrupted`]: crate::error::ErrorKind::Interrupted

use crate::error::{Error, Result};
use crate::tracing_compat::trace;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

enum Slot<T> {
    Pending,
    Done(Option<Result<T>>),
}

struct FutureState<T> {
    done: AtomicBool,
    cancelled: AtomicBool,
    slot: Mutex<Slot<T>>,
    condvar: Condvar,
}

/// Handle to the eventual result of a submitted task.
///
/// Clones share the same completion cell; the result itself can be taken by
/// exactly one [`join`](TaskFuture::join) call.
pub struct TaskFuture<T> {
    state: Arc<FutureState<T>>,
}

impl<T> Clone for TaskFuture<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T> std::fmt::Debug for TaskFuture<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskFuture")
            .field("done", &self.is_done())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl<T> TaskFuture<T> {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new(FutureState {
                done: AtomicBool::new(false),
                cancelled: AtomicBool::new(false),
                slot: Mutex::new(Slot::Pending),
                condvar: Condvar::new(),
            }),
        }
    }

    /// Completes the future. Later completions are ignored.
    pub(crate) fn complete(&self, result: Result<T>) {
        let mut slot = self.state.slot.lock().unwrap_or_else(|e| e.into_inner());
        if matches!(*slot, Slot::Done(_)) {
            return;
        }
        *slot = Slot::Done(Some(result));
        self.state.done.store(true, Ordering::Release);
        drop(slot);
        self.state.condvar.notify_all();
    }

    /// Requests cancellation.
    ///
    /// A task still queued will be skipped and resolve to
    /// [`Interrupted`](crate::error::ErrorKind::Interrupted); a task already
    /// running finishes normally.
    pub fn cancel(&self) {
        trace!("task future cancelled");
        self.state.cancelled.store(true, Ordering::Release);
    }

    /// Returns true if cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::Acquire)
    }

    /// Returns true if the task has completed.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.state.done.load(Ordering::Acquire)
    }

    /// Blocks until the task completes.
    pub fn wait(&self) {
        if self.is_done() {
            return;
        }
        let mut slot = self.state.slot.lock().unwrap_or_else(|e| e.into_inner());
        while matches!(*slot, Slot::Pending) {
            slot = self
                .state
                .condvar
                .wait(slot)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Blocks until the task completes or `timeout` elapses.
    ///
    /// Returns true if the task completed.
    #[must_use]
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.is_done() {
            return true;
        }
        let deadline = Instant::now() + timeout;
        let mut slot = self.state.slot.lock().unwrap_or_else(|e| e.into_inner());
        while matches!(*slot, Slot::Pending) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let (guard, _) = self
                .state
                .condvar
                .wait_timeout(slot, remaining)
                .unwrap_or_else(|e| e.into_inner());
            slot = guard;
        }
        true
    }

    /// Blocks until the task completes, then takes its result.
    ///
    /// # Errors
    ///
    /// The task's own failure ([`ExecutionFailure`] for a panicked body,
    /// [`Interrupted`] for a cancelled or dropped task), or
    /// [`InvalidScopeState`] if the result was already taken by an earlier
    /// `join`.
    ///
    /// [`ExecutionFailure`]: crate::error::ErrorKind::ExecutionFailure
    /// [`Interrupted`]: crate::error::ErrorKind::Interrupted
    /// [`InvalidScopeState`]: crate::error::ErrorKind::InvalidScopeState
    pub fn join(&self) -> Result<T> {
        self.wait();
        self.take()
    }

    /// As [`join`](Self::join), failing with [`Timeout`] when the deadline
    /// elapses first. The task keeps running; the deadline does not cancel.
    ///
    /// [`Timeout`]: crate::error::ErrorKind::Timeout
    pub fn join_timeout(&self, timeout: Duration) -> Result<T> {
        if !self.wait_timeout(timeout) {
            return Err(Error::timeout("task did not complete within the deadline"));
        }
        self.take()
    }

    fn take(&self) -> Result<T> {
        let mut slot = self.state.slot.lock().unwrap_or_else(|e| e.into_inner());
        match &mut *slot {
            Slot::Done(result) => result
                .take()
                .unwrap_or_else(|| Err(Error::invalid_state("task result already taken"))),
            Slot::Pending => Err(Error::invalid_state("task result not ready")),
        }
    }
}

/// Resolves a future to `Interrupted` if its task is dropped without running.
///
/// The submitting closure owns one of these; completing through it disarms
/// the drop path.
pub(crate) struct CompletionGuard<T> {
    future: TaskFuture<T>,
}

impl<T> CompletionGuard<T> {
    pub(crate) fn new(future: TaskFuture<T>) -> Self {
        Self { future }
    }

    pub(crate) fn future(&self) -> &TaskFuture<T> {
        &self.future
    }

    pub(crate) fn complete(self, result: Result<T>) {
        self.future.complete(result);
        // Drop runs afterwards; `complete` ignores the second write.
    }
}

impl<T> Drop for CompletionGuard<T> {
    fn drop(&mut self) {
        if !self.future.is_done() {
            self.future.complete(Err(Error::interrupted(
                "task was dropped by its executor before running",
            )));
        }
    }
}
