//! Structured fork/join concurrency with automatic context inheritance.
//!
//! A [`TaskScope`] owns the lifetime of the tasks forked inside it: children
//! cannot outlive the scope, the scope cannot be misused out of order, and
//! every child observes the parent's full binding stack at fork without any
//! explicit capture at the call site.
//!
//! # State machine
//!
//! ```text
//! Open ──join/join_timeout──► Joined ──close──► Closed
//!   │                                            ▲
//!   └────────────────close───────────────────────┘
//! ```
//!
//! `fork` is permitted only while `Open`; `throw_if_failed` / `result` only
//! once `Joined`. Violations fail with
//! [`InvalidScopeState`](crate::error::ErrorKind::InvalidScopeState).
//! Dropping the scope closes it.
//!
//! # Policies
//!
//! - [`TaskScope::open`] — await-all; the caller inspects subtasks.
//! - [`TaskScope::shutdown_on_failure`] — the first child failure cancels
//!   the siblings; [`throw_if_failed`](TaskScope::throw_if_failed) surfaces
//!   it.
//! - [`TaskScope::shutdown_on_success`] — the first child success cancels
//!   the siblings; [`result`](TaskScope::result) yields it.
//!
//! # Example
//!
//! ```
//! use ambit::structured::TaskScope;
//! use ambit::{context, ContextKey};
//! use std::sync::LazyLock;
//!
//! static TRACE: LazyLock<ContextKey<String>> = LazyLock::new(|| ContextKey::new("trace"));
//!
//! context::bind(&TRACE, "S".to_string(), || {
//!     let mut scope = TaskScope::shutdown_on_failure();
//!     let child = scope
//!         .fork(|| Ok((*context::get(&TRACE)?).clone()))
//!         .unwrap();
//!     scope.join().unwrap();
//!     scope.throw_if_failed().unwrap();
//!     assert_eq!(child.get().unwrap(), "S");
//! });
//! ```

mod cancel;
mod tasks;

pub use cancel::{current_cancel_token, CancelToken};
pub use tasks::{
    invoke_all, invoke_all_and_combine, invoke_all_timeout, invoke_any, invoke_any_timeout,
};

use crate::carrier::Carrier;
use crate::context::bind;
use crate::error::{Error, Result};
use crate::structured::cancel::CANCEL_KEY;
use crate::tracing_compat::{debug, trace, warn};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// The result type of a forked child body.
pub type TaskResult<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Grace period `close` waits for cancelled children before abandoning them.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScopePolicy {
    Await,
    ShutdownOnFailure,
    ShutdownOnSuccess,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScopeState {
    Open,
    Joined,
    Closed,
}

/// Observable lifecycle of one subtask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubtaskState {
    /// Not yet completed.
    Pending,
    /// Completed with a value.
    Success,
    /// Completed with a failure (error or panic).
    Failed,
    /// Cancelled before or instead of producing a result.
    Cancelled,
}

enum SubtaskSlot<T> {
    Pending,
    Success(Option<T>),
    Failed(Error),
    Cancelled,
}

struct SubtaskCell<T> {
    slot: Mutex<SubtaskSlot<T>>,
}

/// Handle to one forked child.
///
/// The success value can be taken by exactly one [`get`](Subtask::get) call.
pub struct Subtask<T> {
    cell: Arc<SubtaskCell<T>>,
}

impl<T> Clone for Subtask<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T> Subtask<T> {
    fn new() -> Self {
        Self {
            cell: Arc::new(SubtaskCell {
                slot: Mutex::new(SubtaskSlot::Pending),
            }),
        }
    }

    /// Returns the subtask's current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SubtaskState {
        match &*self.cell.slot.lock().unwrap_or_else(|e| e.into_inner()) {
            SubtaskSlot::Pending => SubtaskState::Pending,
            SubtaskSlot::Success(_) => SubtaskState::Success,
            SubtaskSlot::Failed(_) => SubtaskState::Failed,
            SubtaskSlot::Cancelled => SubtaskState::Cancelled,
        }
    }

    /// Takes the subtask's success value.
    ///
    /// # Errors
    ///
    /// [`InvalidScopeState`](crate::error::ErrorKind::InvalidScopeState) if
    /// the subtask has not completed or the value was already taken; the
    /// child's own failure for a failed subtask;
    /// [`Interrupted`](crate::error::ErrorKind::Interrupted) for a cancelled
    /// one.
    pub fn get(&self) -> Result<T> {
        match &mut *self.cell.slot.lock().unwrap_or_else(|e| e.into_inner()) {
            SubtaskSlot::Pending => Err(Error::invalid_state("subtask has not completed; join the scope first")),
            SubtaskSlot::Success(value) => value
                .take()
                .ok_or_else(|| Error::invalid_state("subtask result already taken")),
            SubtaskSlot::Failed(error) => Err(error.clone()),
            SubtaskSlot::Cancelled => Err(Error::interrupted("subtask was cancelled")),
        }
    }

    fn fill(&self, slot: SubtaskSlot<T>) {
        let mut guard = self.cell.slot.lock().unwrap_or_else(|e| e.into_inner());
        if matches!(*guard, SubtaskSlot::Pending) {
            *guard = slot;
        }
    }
}

impl<T> std::fmt::Debug for Subtask<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subtask").field("state", &self.state()).finish()
    }
}

struct ScopeShared<T> {
    policy: ScopePolicy,
    cancel: CancelToken,
    live: Mutex<usize>,
    joined: Condvar,
    outcome: Mutex<ScopeOutcome<T>>,
}

struct ScopeOutcome<T> {
    first_failure: Option<Error>,
    winner: Option<T>,
}

impl<T> ScopeShared<T> {
    fn child_started(&self) {
        *self.live.lock().unwrap_or_else(|e| e.into_inner()) += 1;
    }

    fn child_finished(&self) {
        let mut live = self.live.lock().unwrap_or_else(|e| e.into_inner());
        *live = live.saturating_sub(1);
        drop(live);
        self.joined.notify_all();
    }

    /// Waits until no children are live; `deadline` bounds the wait.
    fn await_quiescence(&self, deadline: Option<Instant>) -> bool {
        let mut live = self.live.lock().unwrap_or_else(|e| e.into_inner());
        while *live > 0 {
            match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return false;
                    }
                    let (guard, _) = self
                        .joined
                        .wait_timeout(live, remaining)
                        .unwrap_or_else(|e| e.into_inner());
                    live = guard;
                }
                None => {
                    live = self.joined.wait(live).unwrap_or_else(|e| e.into_inner());
                }
            }
        }
        true
    }

    fn record_failure(&self, error: Error) {
        let mut outcome = self.outcome.lock().unwrap_or_else(|e| e.into_inner());
        if outcome.first_failure.is_none() {
            outcome.first_failure = Some(error);
        }
        drop(outcome);
        if self.policy == ScopePolicy::ShutdownOnFailure {
            self.cancel.cancel();
        }
    }

    fn record_success(&self, value: T) -> Option<T> {
        if self.policy != ScopePolicy::ShutdownOnSuccess {
            return Some(value);
        }
        let mut outcome = self.outcome.lock().unwrap_or_else(|e| e.into_inner());
        if outcome.winner.is_none() {
            outcome.winner = Some(value);
            drop(outcome);
            self.cancel.cancel();
            None
        } else {
            Some(value)
        }
    }
}

/// A fork/join region owning its children's lifetimes.
///
/// See the [module docs](self) for the state machine and policies.
pub struct TaskScope<T> {
    shared: Arc<ScopeShared<T>>,
    threads: Vec<thread::JoinHandle<()>>,
    forked: usize,
    state: ScopeState,
}

impl<T> TaskScope<T> {
    fn with_policy(policy: ScopePolicy) -> Self {
        Self {
            shared: Arc::new(ScopeShared {
                policy,
                cancel: CancelToken::new(),
                live: Mutex::new(0),
                joined: Condvar::new(),
                outcome: Mutex::new(ScopeOutcome {
                    first_failure: None,
                    winner: None,
                }),
            }),
            threads: Vec::new(),
            forked: 0,
            state: ScopeState::Open,
        }
    }

    /// Opens a plain scope: `join` only awaits, the caller inspects
    /// subtasks.
    #[must_use]
    pub fn open() -> Self {
        Self::with_policy(ScopePolicy::Await)
    }

    /// Opens a scope where the first child failure cancels the siblings.
    #[must_use]
    pub fn shutdown_on_failure() -> Self {
        Self::with_policy(ScopePolicy::ShutdownOnFailure)
    }

    /// Opens a scope where the first child success cancels the siblings.
    #[must_use]
    pub fn shutdown_on_success() -> Self {
        Self::with_policy(ScopePolicy::ShutdownOnSuccess)
    }

    /// Returns the scope's cancellation token.
    #[must_use]
    pub fn cancel_token(&self) -> CancelToken {
        self.shared.cancel.clone()
    }

    /// Returns the number of children forked so far.
    #[must_use]
    pub fn forked(&self) -> usize {
        self.forked
    }

    fn ensure_state(&self, expected: ScopeState, operation: &str) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(Error::invalid_state(format!(
                "{operation} requires a {expected:?} scope, but the scope is {:?}",
                self.state
            )))
        }
    }

    /// Cancels any still-live children and closes the scope.
    ///
    /// Children are given a bounded grace period to observe the cancel
    /// signal; uncooperative ones are abandoned rather than blocking close
    /// indefinitely. Idempotent.
    pub fn close(&mut self) {
        if self.state == ScopeState::Closed {
            return;
        }
        self.state = ScopeState::Closed;
        self.shared.cancel.cancel();

        let drained = self
            .shared
            .await_quiescence(Some(Instant::now() + CLOSE_GRACE));
        if drained {
            for handle in self.threads.drain(..) {
                let _ = handle.join();
            }
        } else {
            warn!(
                abandoned = self.threads.len(),
                "scope close grace elapsed; abandoning uncooperative children"
            );
            self.threads.clear();
        }
        debug!(forked = self.forked, drained, "scope closed");
    }
}

impl<T: Send + 'static> TaskScope<T> {
    /// Forks a child task.
    ///
    /// The child starts on its own thread and observes every binding active
    /// at the fork site, plus this scope's cancellation token (see
    /// [`current_cancel_token`]). A child that returns `Err` or panics is a
    /// *failed* subtask; policy decides whether that cancels its siblings.
    ///
    /// # Errors
    ///
    /// [`InvalidScopeState`](crate::error::ErrorKind::InvalidScopeState)
    /// unless the scope is open.
    pub fn fork<F>(&mut self, f: F) -> Result<Subtask<T>>
    where
        F: FnOnce() -> TaskResult<T> + Send + 'static,
    {
        self.ensure_state(ScopeState::Open, "fork")?;

        let subtask = Subtask::new();
        let carrier = Carrier::capture();
        let shared = Arc::clone(&self.shared);
        let cell = subtask.clone();
        self.shared.child_started();
        self.forked += 1;

        let spawn = thread::Builder::new()
            .name(format!("ambit-scope-{}", self.forked))
            .spawn(move || {
                // The live count must drop even if restore teardown unwinds.
                let _finish = FinishGuard(Arc::clone(&shared));
                let token = shared.cancel.clone();
                carrier.restore(|| {
                    bind(&CANCEL_KEY, token, || run_child(&shared, &cell, f));
                });
            });

        match spawn {
            Ok(handle) => self.threads.push(handle),
            Err(e) => {
                self.shared.child_finished();
                self.forked -= 1;
                return Err(Error::invalid_state(format!(
                    "failed to spawn child thread: {e}"
                )));
            }
        }
        trace!(forked = self.forked, "child forked");
        Ok(subtask)
    }

    /// Awaits all forked children.
    ///
    /// # Errors
    ///
    /// [`InvalidScopeState`](crate::error::ErrorKind::InvalidScopeState)
    /// unless the scope is open.
    pub fn join(&mut self) -> Result<&mut Self> {
        self.ensure_state(ScopeState::Open, "join")?;
        self.shared.await_quiescence(None);
        self.state = ScopeState::Joined;
        Ok(self)
    }

    /// As [`join`](Self::join), bounded by a deadline.
    ///
    /// # Errors
    ///
    /// [`Timeout`](crate::error::ErrorKind::Timeout) when the deadline
    /// elapses; outstanding children are cancelled cooperatively and the
    /// scope stays open so the caller's `close` (or drop) finishes cleanup.
    pub fn join_timeout(&mut self, timeout: Duration) -> Result<&mut Self> {
        self.ensure_state(ScopeState::Open, "join")?;
        if self.shared.await_quiescence(Some(Instant::now() + timeout)) {
            self.state = ScopeState::Joined;
            Ok(self)
        } else {
            self.shared.cancel.cancel();
            Err(Error::timeout("scope join deadline elapsed"))
        }
    }

    /// Surfaces the first child failure, if any.
    ///
    /// # Errors
    ///
    /// The recorded failure wrapped as
    /// [`ExecutionFailure`](crate::error::ErrorKind::ExecutionFailure);
    /// [`InvalidScopeState`](crate::error::ErrorKind::InvalidScopeState)
    /// unless the scope was joined with the shutdown-on-failure policy.
    pub fn throw_if_failed(&self) -> Result<()> {
        if self.shared.policy != ScopePolicy::ShutdownOnFailure {
            return Err(Error::invalid_state(
                "throw_if_failed requires a shutdown-on-failure scope",
            ));
        }
        self.ensure_state(ScopeState::Joined, "throw_if_failed")?;
        let outcome = self.shared.outcome.lock().unwrap_or_else(|e| e.into_inner());
        match &outcome.first_failure {
            Some(failure) => Err(failure.clone()),
            None => Ok(()),
        }
    }

    /// Takes the winning child's value.
    ///
    /// # Errors
    ///
    /// [`ExecutionFailure`](crate::error::ErrorKind::ExecutionFailure) when
    /// every child failed;
    /// [`InvalidScopeState`](crate::error::ErrorKind::InvalidScopeState)
    /// unless the scope was joined with the shutdown-on-success policy, no
    /// child was forked, or the value was already taken.
    pub fn result(&mut self) -> Result<T> {
        if self.shared.policy != ScopePolicy::ShutdownOnSuccess {
            return Err(Error::invalid_state(
                "result requires a shutdown-on-success scope",
            ));
        }
        self.ensure_state(ScopeState::Joined, "result")?;
        if self.forked == 0 {
            return Err(Error::invalid_state("no subtasks were forked"));
        }
        let mut outcome = self.shared.outcome.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(winner) = outcome.winner.take() {
            return Ok(winner);
        }
        match outcome.first_failure.clone() {
            Some(failure) => Err(failure),
            None => Err(Error::invalid_state("result already taken")),
        }
    }
}

struct FinishGuard<T>(Arc<ScopeShared<T>>);

impl<T> Drop for FinishGuard<T> {
    fn drop(&mut self) {
        self.0.child_finished();
    }
}

fn run_child<T, F>(shared: &ScopeShared<T>, cell: &Subtask<T>, f: F)
where
    F: FnOnce() -> TaskResult<T>,
{
    if shared.cancel.is_cancelled() {
        cell.fill(SubtaskSlot::Cancelled);
        return;
    }

    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => match shared.record_success(value) {
            // Shutdown-on-success keeps only the winner; the value still
            // belongs to this subtask's cell otherwise.
            None => cell.fill(SubtaskSlot::Success(None)),
            Some(value) => cell.fill(SubtaskSlot::Success(Some(value))),
        },
        // A child that fails after the scope cancelled is a cancellation
        // casualty, not a scope failure; its result is discarded.
        Ok(Err(cause)) => {
            if shared.cancel.is_cancelled() {
                cell.fill(SubtaskSlot::Cancelled);
            } else {
                let error = Error::execution(cause);
                shared.record_failure(error.clone());
                cell.fill(SubtaskSlot::Failed(error));
            }
        }
        Err(payload) => {
            if shared.cancel.is_cancelled() {
                cell.fill(SubtaskSlot::Cancelled);
            } else {
                let error = Error::from_panic(payload.as_ref());
                shared.record_failure(error.clone());
                cell.fill(SubtaskSlot::Failed(error));
            }
        }
    }
}

impl<T> Drop for TaskScope<T> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<T> std::fmt::Debug for TaskScope<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskScope")
            .field("policy", &self.shared.policy)
            .field("state", &self.state)
            .field("forked", &self.forked)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{get, is_bound};
    use crate::key::ContextKey;
    use std::sync::LazyLock;

    static TRACE: LazyLock<ContextKey<String>> =
        LazyLock::new(|| ContextKey::new("structured.trace"));

    fn init_test(name: &str) {
        crate::test_utils::init_test_logging();
        crate::test_phase!(name);
    }

    #[test]
    fn fork_join_collects_results() {
        init_test("fork_join_collects_results");
        let mut scope = TaskScope::open();
        let a = scope.fork(|| Ok(1)).expect("fork a");
        let b = scope.fork(|| Ok(2)).expect("fork b");
        scope.join().expect("join");

        assert_eq!(a.state(), SubtaskState::Success);
        assert_eq!(a.get().expect("a") + b.get().expect("b"), 3);
        crate::test_complete!("fork_join_collects_results");
    }

    #[test]
    fn children_inherit_bindings_at_fork() {
        init_test("children_inherit_bindings_at_fork");
        crate::context::bind(&TRACE, "S".to_string(), || {
            let mut scope = TaskScope::shutdown_on_failure();
            let one = scope
                .fork(|| Ok((*get(&TRACE)?).clone()))
                .expect("fork one");
            let two = scope
                .fork(|| Ok((*get(&TRACE)?).clone()))
                .expect("fork two");
            scope.join().expect("join");
            scope.throw_if_failed().expect("no failures");

            crate::assert_with_log!(
                one.get().expect("one") == "S",
                "first child inherited",
                "S",
                "see child"
            );
            assert_eq!(two.get().expect("two"), "S");
        });
        crate::test_complete!("children_inherit_bindings_at_fork");
    }

    #[test]
    fn state_machine_rejects_out_of_order_operations() {
        init_test("state_machine_rejects_out_of_order_operations");
        let mut scope: TaskScope<u32> = TaskScope::shutdown_on_failure();
        assert!(scope.throw_if_failed().expect_err("before join").to_string().contains("Joined"));

        scope.join().expect("join empty scope");
        let err = scope.fork(|| Ok(1)).expect_err("fork after join");
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidScopeState);

        scope.close();
        let err = scope.join().expect_err("join after close");
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidScopeState);
        crate::test_complete!("state_machine_rejects_out_of_order_operations");
    }

    #[test]
    fn failure_policy_surfaces_first_failure_and_cancels_siblings() {
        init_test("failure_policy_surfaces_first_failure_and_cancels_siblings");
        let mut scope: TaskScope<u32> = TaskScope::shutdown_on_failure();

        let sibling = scope
            .fork(|| {
                current_cancel_token().sleep(Duration::from_secs(10))?;
                Ok(1)
            })
            .expect("fork sibling");
        let _failing = scope
            .fork(|| Err("deliberate failure".into()))
            .expect("fork failing");

        let start = Instant::now();
        scope.join().expect("join");
        assert!(start.elapsed() < Duration::from_secs(5), "siblings were cancelled");

        let err = scope.throw_if_failed().expect_err("failure surfaced");
        assert!(err.is_execution_failure());
        assert!(err.to_string().contains("deliberate failure"));
        assert!(sibling.get().expect_err("interrupted").is_interrupted());
        crate::test_complete!("failure_policy_surfaces_first_failure_and_cancels_siblings");
    }

    #[test]
    fn success_policy_yields_the_first_winner() {
        init_test("success_policy_yields_the_first_winner");
        let mut scope = TaskScope::shutdown_on_success();
        scope
            .fork(|| {
                current_cancel_token().sleep(Duration::from_secs(10))?;
                Ok("slow".to_string())
            })
            .expect("fork slow");
        scope.fork(|| Ok("fast".to_string())).expect("fork fast");

        scope.join().expect("join");
        let winner = scope.result().expect("winner");
        assert_eq!(winner, "fast");
        crate::test_complete!("success_policy_yields_the_first_winner");
    }

    #[test]
    fn success_policy_fails_when_all_children_fail() {
        init_test("success_policy_fails_when_all_children_fail");
        let mut scope: TaskScope<u32> = TaskScope::shutdown_on_success();
        scope.fork(|| Err("a failed".into())).expect("fork a");
        scope.fork(|| Err("b failed".into())).expect("fork b");
        scope.join().expect("join");

        let err = scope.result().expect_err("all failed");
        assert!(err.is_execution_failure());
        crate::test_complete!("success_policy_fails_when_all_children_fail");
    }

    #[test]
    fn join_timeout_cancels_and_close_returns_promptly() {
        init_test("join_timeout_cancels_and_close_returns_promptly");
        let mut scope: TaskScope<u32> = TaskScope::shutdown_on_failure();
        scope
            .fork(|| {
                current_cancel_token().sleep(Duration::from_secs(5))?;
                Ok(1)
            })
            .expect("fork sleeper");

        let err = scope.join_timeout(Duration::from_millis(100)).expect_err("deadline");
        assert!(err.is_timeout());

        let start = Instant::now();
        scope.close();
        assert!(
            start.elapsed() < Duration::from_secs(2),
            "close returned within a bounded margin"
        );
        crate::test_complete!("join_timeout_cancels_and_close_returns_promptly");
    }

    #[test]
    fn cancel_key_does_not_leak_out_of_children() {
        init_test("cancel_key_does_not_leak_out_of_children");
        let mut scope = TaskScope::open();
        scope
            .fork(|| {
                assert!(is_bound(&CANCEL_KEY));
                Ok(())
            })
            .expect("fork");
        scope.join().expect("join");
        assert!(!is_bound(&CANCEL_KEY));
        crate::test_complete!("cancel_key_does_not_leak_out_of_children");
    }

    #[test]
    fn drop_closes_the_scope() {
        init_test("drop_closes_the_scope");
        let token = {
            let mut scope: TaskScope<u32> = TaskScope::open();
            scope
                .fork(|| {
                    current_cancel_token().sleep(Duration::from_secs(10))?;
                    Ok(1)
                })
                .expect("fork");
            scope.cancel_token()
            // scope dropped here
        };
        assert!(token.is_cancelled());
        crate::test_complete!("drop_closes_the_scope");
    }
}
