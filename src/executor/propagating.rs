//! Context-propagating task and executor decorators.
//!
//! [`wrap_task`] is the primitive: capture a [`Carrier`] *now*, on the
//! submitting worker, and return a closure that restores through it before
//! delegating. The executor decorators apply that primitive to every task at
//! its moment of submission; the async helpers schedule wrapped closures on
//! a shared default pool.
//!
//! Wrapping is deliberately not deduplicated across calls: a task wrapped
//! twice is restored twice, the second restore layering over the first in
//! LIFO order. Executor wrapping, by contrast, is idempotent: wrapping an
//! already-propagating executor returns it unchanged.

use crate::carrier::Carrier;
use crate::executor::{Executor, ExecutorExt, ExecutorService, Task, TaskFuture, ThreadPool};
use crate::tracing_compat::debug;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// Wraps a closure so that, when invoked, it observes the ambient context of
/// this call site.
///
/// The carrier is captured immediately, on the submitting worker, at the
/// moment of wrapping, never when the returned closure eventually runs.
/// Wrapping twice captures twice and restores in LIFO layers.
pub fn wrap_task<R>(f: impl FnOnce() -> R + Send + 'static) -> impl FnOnce() -> R + Send + 'static {
    let carrier = Carrier::capture();
    move || carrier.restore(f)
}

/// Decorator propagating context through a fire-and-forget [`Executor`].
pub struct PropagatingExecutor {
    delegate: Arc<dyn Executor>,
}

impl PropagatingExecutor {
    /// Wraps `delegate`; prefer [`wrap_executor`] which is idempotent.
    #[must_use]
    pub fn new(delegate: Arc<dyn Executor>) -> Self {
        Self { delegate }
    }
}

impl Executor for PropagatingExecutor {
    fn execute(&self, task: Task) {
        self.delegate.execute(Box::new(wrap_task(move || task())));
    }

    fn is_propagating(&self) -> bool {
        true
    }
}

impl std::fmt::Debug for PropagatingExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PropagatingExecutor").finish_non_exhaustive()
    }
}

/// Decorator propagating context through an [`ExecutorService`].
///
/// Every submission form wraps its task at the moment of submission;
/// lifecycle operations pass through unchanged.
pub struct PropagatingExecutorService {
    delegate: Arc<dyn ExecutorService>,
}

impl PropagatingExecutorService {
    /// Wraps `delegate`; prefer [`wrap_executor_service`] which is
    /// idempotent.
    #[must_use]
    pub fn new(delegate: Arc<dyn ExecutorService>) -> Self {
        Self { delegate }
    }
}

impl Executor for PropagatingExecutorService {
    fn execute(&self, task: Task) {
        self.delegate.execute(Box::new(wrap_task(move || task())));
    }

    fn is_propagating(&self) -> bool {
        true
    }
}

impl ExecutorService for PropagatingExecutorService {
    fn shutdown(&self) {
        self.delegate.shutdown();
    }

    fn shutdown_now(&self) -> Vec<Task> {
        self.delegate.shutdown_now()
    }

    fn is_shutdown(&self) -> bool {
        self.delegate.is_shutdown()
    }

    fn is_terminated(&self) -> bool {
        self.delegate.is_terminated()
    }

    fn await_termination(&self, timeout: Duration) -> bool {
        self.delegate.await_termination(timeout)
    }
}

impl std::fmt::Debug for PropagatingExecutorService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PropagatingExecutorService")
            .finish_non_exhaustive()
    }
}

/// Makes an executor context-propagating.
///
/// Idempotent: an executor that already identifies as propagating is
/// returned unchanged.
#[must_use]
pub fn wrap_executor(executor: Arc<dyn Executor>) -> Arc<dyn Executor> {
    if executor.is_propagating() {
        return executor;
    }
    debug!("executor wrapped for context propagation");
    Arc::new(PropagatingExecutor::new(executor))
}

/// Makes an executor service context-propagating.
///
/// Idempotent: a service that already identifies as propagating is returned
/// unchanged. Lifecycle operations pass through to the delegate.
#[must_use]
pub fn wrap_executor_service(executor: Arc<dyn ExecutorService>) -> Arc<dyn ExecutorService> {
    if executor.is_propagating() {
        return executor;
    }
    debug!("executor service wrapped for context propagation");
    Arc::new(PropagatingExecutorService::new(executor))
}

/// Returns the shared default pool used by [`supply_async`] and
/// [`run_async`].
///
/// Built lazily with one worker per available core; it lives for the rest of
/// the process.
pub fn default_executor() -> &'static ThreadPool {
    static POOL: OnceLock<ThreadPool> = OnceLock::new();
    POOL.get_or_init(|| {
        let parallelism = std::thread::available_parallelism().map_or(2, std::num::NonZeroUsize::get);
        ThreadPool::with_options(
            1,
            parallelism.max(2),
            crate::executor::PoolOptions {
                thread_name_prefix: "ambit-async".to_string(),
                ..Default::default()
            },
        )
    })
}

/// Runs `f` asynchronously on the default pool, in the caller's context.
pub fn supply_async<T, F>(f: F) -> TaskFuture<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    supply_async_on(default_executor(), f)
}

/// Runs `f` asynchronously on `executor`, in the caller's context.
pub fn supply_async_on<T, F>(executor: &(impl Executor + ?Sized), f: F) -> TaskFuture<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    executor.submit(wrap_task(f))
}

/// Runs a unit closure asynchronously on the default pool, in the caller's
/// context.
pub fn run_async<F>(f: F) -> TaskFuture<()>
where
    F: FnOnce() + Send + 'static,
{
    run_async_on(default_executor(), f)
}

/// Runs a unit closure asynchronously on `executor`, in the caller's
/// context.
pub fn run_async_on<F>(executor: &(impl Executor + ?Sized), f: F) -> TaskFuture<()>
where
    F: FnOnce() + Send + 'static,
{
    executor.submit(wrap_task(f))
}
