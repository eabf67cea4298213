//! A thread pool implementing the crate's task-submission surface.
//!
//! This is the crate's own [`ExecutorService`]: the executor decorators and
//! async helpers work against any implementation of the submission traits,
//! but tests, the default async pool, and hosts without a pool of their own
//! need a real one.
//!
//! # Design
//!
//! Worker threads are spawned lazily up to `max_threads` and retired back to
//! `min_threads` after an idle timeout. Work is queued through a lock-free
//! [`SegQueue`]; idle workers park on a condvar. Task panics are caught per
//! task, so a panicking body costs nothing but its own result.
//!
//! Shutdown is graceful: `shutdown` stops intake and lets the queue drain,
//! `shutdown_now` additionally hands the undrained queue back to the caller,
//! and `await_termination` bounds the wait for workers to exit.
//!
//! # Example
//!
//! ```
//! use ambit::executor::{ExecutorExt, ExecutorService, ThreadPool};
//! use std::time::Duration;
//!
//! let pool = ThreadPool::new(1, 4);
//! let future = pool.submit(|| 2 + 2);
//! assert_eq!(future.join().unwrap(), 4);
//! pool.shutdown();
//! assert!(pool.await_termination(Duration::from_secs(5)));
//! ```

use crate::executor::{Executor, ExecutorService, Task};
use crate::tracing_compat::{debug, warn};
use crossbeam_queue::SegQueue;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle as ThreadJoinHandle};
use std::time::{Duration, Instant};

/// Default idle timeout before retiring excess threads.
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Bounded wait applied when the pool is dropped.
const DROP_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration options for [`ThreadPool`].
#[derive(Clone, Debug)]
pub struct PoolOptions {
    /// Idle timeout before retiring threads above the minimum.
    pub idle_timeout: Duration,
    /// Worker thread name prefix.
    pub thread_name_prefix: String,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            thread_name_prefix: "ambit".to_string(),
        }
    }
}

struct PoolInner {
    min_threads: usize,
    max_threads: usize,
    active_threads: AtomicUsize,
    busy_threads: AtomicUsize,
    pending_count: AtomicUsize,
    queue: SegQueue<Task>,
    shutdown: AtomicBool,
    condvar: Condvar,
    mutex: Mutex<()>,
    idle_timeout: Duration,
    thread_name_prefix: String,
    thread_handles: Mutex<Vec<ThreadJoinHandle<()>>>,
}

/// A min/max-scaled worker pool with a lock-free work queue.
pub struct ThreadPool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPool")
            .field("min_threads", &self.inner.min_threads)
            .field("max_threads", &self.inner.max_threads)
            .field(
                "active_threads",
                &self.inner.active_threads.load(Ordering::Relaxed),
            )
            .field(
                "pending_tasks",
                &self.inner.pending_count.load(Ordering::Relaxed),
            )
            .finish()
    }
}

impl ThreadPool {
    /// Creates a pool with the given thread limits and default options.
    ///
    /// # Panics
    ///
    /// Panics if `max_threads` is 0.
    #[must_use]
    pub fn new(min_threads: usize, max_threads: usize) -> Self {
        Self::with_options(min_threads, max_threads, PoolOptions::default())
    }

    /// Creates a pool with custom options.
    ///
    /// `max_threads` below `min_threads` is normalized up.
    ///
    /// # Panics
    ///
    /// Panics if `max_threads` is 0.
    #[must_use]
    pub fn with_options(min_threads: usize, max_threads: usize, options: PoolOptions) -> Self {
        assert!(max_threads > 0, "max_threads must be at least 1");
        let max_threads = max_threads.max(min_threads);

        let inner = Arc::new(PoolInner {
            min_threads,
            max_threads,
            active_threads: AtomicUsize::new(0),
            busy_threads: AtomicUsize::new(0),
            pending_count: AtomicUsize::new(0),
            queue: SegQueue::new(),
            shutdown: AtomicBool::new(false),
            condvar: Condvar::new(),
            mutex: Mutex::new(()),
            idle_timeout: options.idle_timeout,
            thread_name_prefix: options.thread_name_prefix,
            thread_handles: Mutex::new(Vec::with_capacity(max_threads)),
        });

        let pool = Self { inner };
        for _ in 0..min_threads {
            pool.spawn_thread();
        }
        pool
    }

    /// Returns the number of queued tasks not yet picked up.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.pending_count.load(Ordering::Relaxed)
    }

    /// Returns the number of live worker threads.
    #[must_use]
    pub fn active_threads(&self) -> usize {
        self.inner.active_threads.load(Ordering::Relaxed)
    }

    /// Returns the number of workers currently executing a task.
    #[must_use]
    pub fn busy_threads(&self) -> usize {
        self.inner.busy_threads.load(Ordering::Relaxed)
    }

    fn spawn_thread(&self) {
        spawn_thread_on(&self.inner);
    }

    fn notify_one(&self) {
        let _guard = self.inner.mutex.lock().unwrap_or_else(|e| e.into_inner());
        self.inner.condvar.notify_one();
    }

    fn notify_all(&self) {
        let _guard = self.inner.mutex.lock().unwrap_or_else(|e| e.into_inner());
        self.inner.condvar.notify_all();
    }
}

impl Executor for ThreadPool {
    fn execute(&self, task: Task) {
        if self.inner.shutdown.load(Ordering::Acquire) {
            warn!("task submitted to a shut-down pool; dropping");
            drop(task);
            return;
        }
        self.inner.queue.push(task);
        self.inner.pending_count.fetch_add(1, Ordering::Relaxed);
        maybe_spawn_thread_on(&self.inner);
        self.notify_one();
    }
}

impl ExecutorService for ThreadPool {
    fn shutdown(&self) {
        debug!("thread pool shutdown requested");
        self.inner.shutdown.store(true, Ordering::Release);
        self.notify_all();
    }

    fn shutdown_now(&self) -> Vec<Task> {
        self.inner.shutdown.store(true, Ordering::Release);
        let mut drained = Vec::new();
        while let Some(task) = self.inner.queue.pop() {
            self.inner.pending_count.fetch_sub(1, Ordering::Relaxed);
            drained.push(task);
        }
        debug!(dropped = drained.len(), "thread pool shutdown_now drained queue");
        self.notify_all();
        drained
    }

    fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    fn is_terminated(&self) -> bool {
        self.is_shutdown()
            && self.inner.queue.is_empty()
            && self.inner.active_threads.load(Ordering::Acquire) == 0
    }

    fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.is_terminated() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            // Workers park on the condvar; keep nudging them so they notice
            // the shutdown flag.
            self.notify_all();
            thread::sleep(Duration::from_millis(10).min(remaining));
        }

        let mut handles = self
            .inner
            .thread_handles
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        for handle in handles.drain(..) {
            let _ = handle.join();
        }
        true
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
        let _ = self.await_termination(DROP_DRAIN_TIMEOUT);
    }
}

fn spawn_thread_on(inner: &Arc<PoolInner>) {
    let inner_clone = Arc::clone(inner);
    let thread_id = inner.active_threads.fetch_add(1, Ordering::Relaxed);
    let name = format!("{}-worker-{}", inner.thread_name_prefix, thread_id);

    let spawned = thread::Builder::new().name(name).spawn(move || {
        worker_loop(&inner_clone);
        inner_clone.active_threads.fetch_sub(1, Ordering::Relaxed);
    });

    match spawned {
        Ok(handle) => inner
            .thread_handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle),
        Err(e) => {
            inner.active_threads.fetch_sub(1, Ordering::Relaxed);
            warn!(error = %e, "failed to spawn pool worker");
        }
    }
}

fn maybe_spawn_thread_on(inner: &Arc<PoolInner>) {
    let active = inner.active_threads.load(Ordering::Relaxed);
    let busy = inner.busy_threads.load(Ordering::Relaxed);
    let pending = inner.pending_count.load(Ordering::Relaxed);

    if active < inner.max_threads && busy >= active && pending > 0 {
        spawn_thread_on(inner);
    }
}

fn worker_loop(inner: &PoolInner) {
    loop {
        if let Some(task) = inner.queue.pop() {
            inner.pending_count.fetch_sub(1, Ordering::Relaxed);
            inner.busy_threads.fetch_add(1, Ordering::Relaxed);
            // Panic isolation: a failing task must not take the worker with
            // it or skew the busy counter.
            if let Err(payload) = catch_unwind(AssertUnwindSafe(task)) {
                warn!(
                    panic = %crate::error::panic_message(payload.as_ref()),
                    "pool task panicked"
                );
            }
            inner.busy_threads.fetch_sub(1, Ordering::Relaxed);
            continue;
        }

        if inner.shutdown.load(Ordering::Acquire) {
            break;
        }

        let active = inner.active_threads.load(Ordering::Relaxed);
        if active > inner.min_threads {
            let guard = inner.mutex.lock().unwrap_or_else(|e| e.into_inner());
            let (_guard, wait) = inner
                .condvar
                .wait_timeout(guard, inner.idle_timeout)
                .unwrap_or_else(|e| e.into_inner());
            if wait.timed_out()
                && inner.queue.is_empty()
                && inner.active_threads.load(Ordering::Relaxed) > inner.min_threads
            {
                // Retire this thread.
                break;
            }
        } else {
            let guard = inner.mutex.lock().unwrap_or_else(|e| e.into_inner());
            let _guard = inner.condvar.wait(guard).unwrap_or_else(|e| e.into_inner());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI32;

    #[test]
    fn executes_submitted_work() {
        let pool = ThreadPool::new(1, 4);
        let counter = Arc::new(AtomicI32::new(0));

        let c = Arc::clone(&counter);
        let done = Arc::new((Mutex::new(false), Condvar::new()));
        let signal = Arc::clone(&done);
        pool.execute(Box::new(move || {
            c.fetch_add(1, Ordering::Relaxed);
            let (lock, cv) = &*signal;
            *lock.lock().expect("signal lock") = true;
            cv.notify_all();
        }));

        let (lock, cv) = &*done;
        let mut finished = lock.lock().expect("wait lock");
        while !*finished {
            let (guard, wait) = cv
                .wait_timeout(finished, Duration::from_secs(5))
                .expect("wait");
            finished = guard;
            assert!(!wait.timed_out(), "task did not run");
        }
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn starts_with_min_threads() {
        let pool = ThreadPool::new(3, 8);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(pool.active_threads(), 3);
    }

    #[test]
    fn shutdown_is_idempotent() {
        let pool = ThreadPool::new(1, 2);
        pool.shutdown();
        assert!(pool.is_shutdown());
        pool.shutdown();
        assert!(pool.is_shutdown());
        assert!(pool.await_termination(Duration::from_secs(5)));
        assert!(pool.is_terminated());
    }

    #[test]
    fn await_termination_times_out_on_long_task() {
        let pool = ThreadPool::new(1, 1);
        pool.execute(Box::new(|| thread::sleep(Duration::from_millis(500))));
        thread::sleep(Duration::from_millis(20));

        pool.shutdown();
        let start = Instant::now();
        assert!(!pool.await_termination(Duration::from_millis(50)));
        assert!(start.elapsed() < Duration::from_secs(1));

        // Let it finish so Drop does not stall.
        assert!(pool.await_termination(Duration::from_secs(5)));
    }

    #[test]
    fn shutdown_now_returns_undrained_tasks() {
        let pool = ThreadPool::new(0, 1);
        let gate = Arc::new((Mutex::new(false), Condvar::new()));

        // One task occupies the single worker...
        let held = Arc::clone(&gate);
        pool.execute(Box::new(move || {
            let (lock, cv) = &*held;
            let mut open = lock.lock().expect("gate");
            while !*open {
                open = cv.wait(open).expect("gate wait");
            }
        }));
        thread::sleep(Duration::from_millis(50));

        // ...so these stay queued.
        for _ in 0..3 {
            pool.execute(Box::new(|| {}));
        }
        thread::sleep(Duration::from_millis(20));

        let drained = pool.shutdown_now();
        assert_eq!(drained.len(), 3);
        assert_eq!(pool.pending_count(), 0);

        let (lock, cv) = &*gate;
        *lock.lock().expect("open gate") = true;
        cv.notify_all();
        assert!(pool.await_termination(Duration::from_secs(5)));
    }

    #[test]
    fn rejects_work_after_shutdown() {
        let pool = ThreadPool::new(1, 1);
        pool.shutdown();
        assert!(pool.await_termination(Duration::from_secs(5)));

        let counter = Arc::new(AtomicI32::new(0));
        let c = Arc::clone(&counter);
        pool.execute(Box::new(move || {
            c.fetch_add(1, Ordering::Relaxed);
        }));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(counter.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn survives_panicking_tasks() {
        let pool = ThreadPool::new(2, 4);
        pool.execute(Box::new(|| panic!("intentional panic")));
        thread::sleep(Duration::from_millis(50));

        let counter = Arc::new(AtomicI32::new(0));
        let c = Arc::clone(&counter);
        pool.execute(Box::new(move || {
            c.fetch_add(1, Ordering::Relaxed);
        }));

        pool.shutdown();
        assert!(pool.await_termination(Duration::from_secs(5)));
        assert_eq!(counter.load(Ordering::Relaxed), 1);
        assert_eq!(pool.busy_threads(), 0);
    }

    #[test]
    fn completes_a_burst_of_tasks() {
        let pool = ThreadPool::new(1, 4);
        let counter = Arc::new(AtomicI32::new(0));

        for _ in 0..4 {
            let c = Arc::clone(&counter);
            pool.execute(Box::new(move || {
                c.fetch_add(1, Ordering::Relaxed);
                thread::sleep(Duration::from_millis(10));
            }));
        }

        pool.shutdown();
        assert!(pool.await_termination(Duration::from_secs(5)));
        assert_eq!(counter.load(Ordering::Relaxed), 4);
        assert!(pool.active_threads() == 0);
    }

    #[test]
    fn excess_threads_retire_after_idle_timeout() {
        let options = PoolOptions {
            idle_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let pool = ThreadPool::with_options(0, 3, options);

        for _ in 0..3 {
            pool.execute(Box::new(move || {
                thread::sleep(Duration::from_millis(30));
            }));
        }

        thread::sleep(Duration::from_millis(500));
        assert!(
            pool.active_threads() <= 1,
            "expected retirement, active={}",
            pool.active_threads()
        );
    }

    #[test]
    fn min_max_normalization() {
        let pool = ThreadPool::new(4, 2);
        thread::sleep(Duration::from_millis(50));
        assert!(pool.active_threads() >= 4);
    }

    #[test]
    fn worker_threads_carry_the_prefix() {
        let options = PoolOptions {
            thread_name_prefix: "prefix-check".to_string(),
            ..Default::default()
        };
        let pool = ThreadPool::with_options(1, 1, options);
        let name = Arc::new(Mutex::new(String::new()));

        let n = Arc::clone(&name);
        pool.execute(Box::new(move || {
            if let Some(current) = thread::current().name() {
                *n.lock().expect("name lock") = current.to_string();
            }
        }));

        pool.shutdown();
        assert!(pool.await_termination(Duration::from_secs(5)));
        assert!(name.lock().expect("name").starts_with("prefix-check"));
    }
}
