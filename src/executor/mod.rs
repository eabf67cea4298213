//! Task-submission traits, futures, the thread pool, and the propagation
//! decorators.
//!
//! The submission surface is a pair of object-safe traits: [`Executor`]
//! (fire-and-forget `execute`) and [`ExecutorService`] (adds lifecycle:
//! shutdown, termination queries, bounded await). Anything that can run a
//! `Box<dyn FnOnce()>` can participate: hosts expose their pools through
//! these traits, or hand them to [`wrap_executor`] for transparent context
//! propagation.
//!
//! On top of `execute`, the blanket [`ExecutorExt`] extension provides the
//! richer submission forms: `submit` returning a [`TaskFuture`], and the
//! bulk `invoke_all` / `invoke_any` families with and without deadlines.
//!
//! # Capture timing
//!
//! Propagation decorators capture on the *submitting* worker at the *moment
//! of submission*, never at task construction and never on the target worker.
//! See [`wrap_task`] and [`wrap_executor`].

mod future;
mod pool;
mod propagating;

pub use future::TaskFuture;
pub use pool::{PoolOptions, ThreadPool};
pub use propagating::{
    default_executor, run_async, run_async_on, supply_async, supply_async_on, wrap_executor,
    wrap_executor_service, wrap_task, PropagatingExecutor, PropagatingExecutorService,
};

use crate::error::{Error, ErrorKind, Result};
use crate::executor::future::CompletionGuard;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// A unit of work accepted by an [`Executor`].
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Anything that can run a task, now or later, on some worker.
pub trait Executor: Send + Sync {
    /// Hands a task to the executor.
    ///
    /// The task runs at the executor's discretion; `execute` itself must not
    /// run it inline on the calling worker unless that is the executor's
    /// documented policy.
    fn execute(&self, task: Task);

    /// Returns true if this executor already propagates context.
    ///
    /// [`wrap_executor`] short-circuits on decorated executors so double
    /// wrapping is idempotent.
    fn is_propagating(&self) -> bool {
        false
    }
}

/// An [`Executor`] with a lifecycle.
pub trait ExecutorService: Executor {
    /// Stops intake; queued tasks still drain.
    fn shutdown(&self);

    /// Stops intake and returns the tasks that were still queued.
    fn shutdown_now(&self) -> Vec<Task>;

    /// Returns true once [`shutdown`](Self::shutdown) (or
    /// [`shutdown_now`](Self::shutdown_now)) was called.
    fn is_shutdown(&self) -> bool;

    /// Returns true once shut down with no queued work and no live workers.
    fn is_terminated(&self) -> bool;

    /// Blocks until terminated or `timeout` elapses; true means terminated.
    fn await_termination(&self, timeout: Duration) -> bool;
}

impl<E: Executor + ?Sized> Executor for Arc<E> {
    fn execute(&self, task: Task) {
        (**self).execute(task);
    }

    fn is_propagating(&self) -> bool {
        (**self).is_propagating()
    }
}

impl<E: ExecutorService + ?Sized> ExecutorService for Arc<E> {
    fn shutdown(&self) {
        (**self).shutdown();
    }

    fn shutdown_now(&self) -> Vec<Task> {
        (**self).shutdown_now()
    }

    fn is_shutdown(&self) -> bool {
        (**self).is_shutdown()
    }

    fn is_terminated(&self) -> bool {
        (**self).is_terminated()
    }

    fn await_termination(&self, timeout: Duration) -> bool {
        (**self).await_termination(timeout)
    }
}

/// Shared state for an `invoke_any` race.
struct AnyRace<T> {
    state: Mutex<AnyRaceState<T>>,
    condvar: Condvar,
    cancelled: AtomicBool,
}

struct AnyRaceState<T> {
    winner: Option<T>,
    finished: usize,
    first_failure: Option<Error>,
}

/// Richer submission forms over any [`Executor`], implemented on top of
/// [`execute`](Executor::execute).
///
/// All forms funnel through `execute`, so submitting through a propagation
/// decorator wraps every task at its individual moment of submission.
pub trait ExecutorExt: Executor {
    /// Submits a closure, returning a future for its result.
    ///
    /// A panicking closure resolves the future to
    /// [`ExecutionFailure`](ErrorKind::ExecutionFailure); a task the executor
    /// drops without running resolves to
    /// [`Interrupted`](ErrorKind::Interrupted).
    fn submit<T, F>(&self, f: F) -> TaskFuture<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let future = TaskFuture::new();
        let guard = CompletionGuard::new(future.clone());
        self.execute(Box::new(move || {
            if guard.future().is_cancelled() {
                guard.complete(Err(Error::interrupted("task cancelled before execution")));
                return;
            }
            match catch_unwind(AssertUnwindSafe(f)) {
                Ok(value) => guard.complete(Ok(value)),
                Err(payload) => guard.complete(Err(Error::from_panic(payload.as_ref()))),
            }
        }));
        future
    }

    /// Submits a closure and resolves to `result` once it has run.
    fn submit_with<T, F>(&self, f: F, result: T) -> TaskFuture<T>
    where
        T: Send + 'static,
        F: FnOnce() + Send + 'static,
    {
        self.submit(move || {
            f();
            result
        })
    }

    /// Submits every task and blocks until all have completed.
    ///
    /// The returned futures are all done; collect results with
    /// [`TaskFuture::join`].
    fn invoke_all<T, F>(&self, tasks: Vec<F>) -> Vec<TaskFuture<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let futures: Vec<_> = tasks.into_iter().map(|f| self.submit(f)).collect();
        for future in &futures {
            future.wait();
        }
        futures
    }

    /// As [`invoke_all`](Self::invoke_all), bounded by a deadline.
    ///
    /// # Errors
    ///
    /// Fails with [`Timeout`](ErrorKind::Timeout) when the deadline elapses;
    /// tasks that have not completed are cancelled cooperatively (queued
    /// work is skipped, running work finishes with its result discarded).
    fn invoke_all_timeout<T, F>(&self, tasks: Vec<F>, timeout: Duration) -> Result<Vec<TaskFuture<T>>>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let deadline = Instant::now() + timeout;
        let futures: Vec<_> = tasks.into_iter().map(|f| self.submit(f)).collect();
        for future in &futures {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !future.wait_timeout(remaining) {
                for pending in &futures {
                    if !pending.is_done() {
                        pending.cancel();
                    }
                }
                return Err(Error::timeout("invoke_all deadline elapsed"));
            }
        }
        Ok(futures)
    }

    /// Submits every task and returns the first successful result.
    ///
    /// Remaining tasks are cancelled cooperatively once a winner exists.
    ///
    /// # Errors
    ///
    /// [`Precondition`](ErrorKind::Precondition) for an empty task list;
    /// [`ExecutionFailure`](ErrorKind::ExecutionFailure) when every task
    /// failed.
    fn invoke_any<T, F>(&self, tasks: Vec<F>) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.invoke_any_race(tasks, None)
    }

    /// As [`invoke_any`](Self::invoke_any), bounded by a deadline.
    ///
    /// # Errors
    ///
    /// As [`invoke_any`](Self::invoke_any), plus
    /// [`Timeout`](ErrorKind::Timeout) when no task succeeded before the
    /// deadline.
    fn invoke_any_timeout<T, F>(&self, tasks: Vec<F>, timeout: Duration) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.invoke_any_race(tasks, Some(Instant::now() + timeout))
    }

    /// Shared engine for the `invoke_any` family.
    #[doc(hidden)]
    fn invoke_any_race<T, F>(&self, tasks: Vec<F>, deadline: Option<Instant>) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        if tasks.is_empty() {
            return Err(Error::new(ErrorKind::Precondition)
                .with_context("invoke_any requires at least one task"));
        }

        let total = tasks.len();
        let race = Arc::new(AnyRace {
            state: Mutex::new(AnyRaceState {
                winner: None,
                finished: 0,
                first_failure: None,
            }),
            condvar: Condvar::new(),
            cancelled: AtomicBool::new(false),
        });

        for f in tasks {
            let race = Arc::clone(&race);
            self.execute(Box::new(move || {
                let outcome = if race.cancelled.load(Ordering::Acquire) {
                    Err(Error::interrupted("race already decided"))
                } else {
                    catch_unwind(AssertUnwindSafe(f))
                        .map_err(|payload| Error::from_panic(payload.as_ref()))
                };

                let mut state = race.state.lock().unwrap_or_else(|e| e.into_inner());
                match outcome {
                    Ok(value) => {
                        if state.winner.is_none() {
                            state.winner = Some(value);
                            race.cancelled.store(true, Ordering::Release);
                        }
                    }
                    Err(error) => {
                        if state.first_failure.is_none() && !error.is_interrupted() {
                            state.first_failure = Some(error);
                        }
                    }
                }
                state.finished += 1;
                drop(state);
                race.condvar.notify_all();
            }));
        }

        let mut state = race.state.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(winner) = state.winner.take() {
                race.cancelled.store(true, Ordering::Release);
                return Ok(winner);
            }
            if state.finished == total {
                let cause = state
                    .first_failure
                    .take()
                    .unwrap_or_else(|| Error::interrupted("all tasks were cancelled"));
                return Err(Error::new(ErrorKind::ExecutionFailure)
                    .with_context("all tasks failed")
                    .with_source(cause));
            }
            if let Some(deadline) = deadline {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    race.cancelled.store(true, Ordering::Release);
                    return Err(Error::timeout("invoke_any deadline elapsed"));
                }
                let (guard, _) = race
                    .condvar
                    .wait_timeout(state, remaining)
                    .unwrap_or_else(|e| e.into_inner());
                state = guard;
            } else {
                state = race
                    .condvar
                    .wait(state)
                    .unwrap_or_else(|e| e.into_inner());
            }
        }
    }
}

impl<E: Executor + ?Sized> ExecutorExt for E {}
