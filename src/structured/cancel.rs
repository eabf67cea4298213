//! Cooperative cancellation for structured scopes.
//!
//! A [`CancelToken`] is a one-way latch shared between a scope and its
//! children. The scope trips it on failure-policy shutdown, timeout, or
//! close; children observe it at their next suspension point: an explicit
//! [`check`](CancelToken::check) or an interruptible
//! [`sleep`](CancelToken::sleep).
//!
//! Children reach their scope's token ambiently through the binding
//! machinery itself: the scope binds the token under an internal context key
//! around every child body, and [`current_cancel_token`] reads it back.
//! Outside any scope the returned token is a fresh, never-cancelled root.

use crate::error::{Error, Result};
use crate::key::ContextKey;
use crate::tracing_compat::trace;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, LazyLock, Mutex};
use std::time::{Duration, Instant};

struct CancelInner {
    flag: AtomicBool,
    mutex: Mutex<()>,
    condvar: Condvar,
}

/// A shared, one-way cancellation latch.
///
/// Clones observe the same latch. Cancellation is cooperative: tripping the
/// token wakes sleepers and makes [`check`](Self::check) fail, but never
/// preempts running code.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

impl CancelToken {
    /// Creates an untripped token.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CancelInner {
                flag: AtomicBool::new(false),
                mutex: Mutex::new(()),
                condvar: Condvar::new(),
            }),
        }
    }

    /// Trips the token and wakes every sleeper.
    pub fn cancel(&self) {
        if self.inner.flag.swap(true, Ordering::AcqRel) {
            return;
        }
        trace!("cancel token tripped");
        let _guard = self.inner.mutex.lock().unwrap_or_else(|e| e.into_inner());
        self.inner.condvar.notify_all();
    }

    /// Returns true once the token has been tripped.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::Acquire)
    }

    /// Fails with [`Interrupted`](crate::error::ErrorKind::Interrupted) once
    /// the token has been tripped.
    ///
    /// # Errors
    ///
    /// `Interrupted` when cancelled; `Ok(())` otherwise.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::interrupted("scope cancellation observed"))
        } else {
            Ok(())
        }
    }

    /// Sleeps for `duration`, waking early on cancellation.
    ///
    /// # Errors
    ///
    /// `Interrupted` when the token is tripped before or during the sleep.
    pub fn sleep(&self, duration: Duration) -> Result<()> {
        self.check()?;
        let deadline = Instant::now() + duration;
        let mut guard = self.inner.mutex.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if self.is_cancelled() {
                return Err(Error::interrupted("sleep interrupted by cancellation"));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(());
            }
            let (next, _) = self
                .inner
                .condvar
                .wait_timeout(guard, remaining)
                .unwrap_or_else(|e| e.into_inner());
            guard = next;
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Internal key binding a scope's token around its children.
pub(crate) static CANCEL_KEY: LazyLock<ContextKey<CancelToken>> =
    LazyLock::new(|| ContextKey::new("scope.cancel"));

/// Returns the cancellation token of the innermost enclosing scope.
///
/// Outside any scope, a fresh never-cancelled token is returned, so callers
/// can always `current_cancel_token().sleep(..)` unconditionally.
#[must_use]
pub fn current_cancel_token() -> CancelToken {
    crate::context::get(&CANCEL_KEY).map_or_else(|_| CancelToken::new(), |token| (*token).clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn starts_untripped() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.check().expect("not cancelled");
    }

    #[test]
    fn cancel_is_sticky_and_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        token.cancel();
        token.cancel();
        assert!(clone.is_cancelled());
        assert!(clone.check().expect_err("cancelled").is_interrupted());
    }

    #[test]
    fn sleep_completes_when_untripped() {
        let token = CancelToken::new();
        let start = Instant::now();
        token.sleep(Duration::from_millis(30)).expect("full sleep");
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn sleep_wakes_early_on_cancel() {
        let token = CancelToken::new();
        let remote = token.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            remote.cancel();
        });

        let start = Instant::now();
        let err = token.sleep(Duration::from_secs(10)).expect_err("interrupted");
        assert!(err.is_interrupted());
        assert!(start.elapsed() < Duration::from_secs(5));
        canceller.join().expect("canceller");
    }

    #[test]
    fn current_token_is_root_outside_scopes() {
        let token = current_cancel_token();
        assert!(!token.is_cancelled());
    }

    #[test]
    fn current_token_reads_the_bound_scope_token() {
        let token = CancelToken::new();
        let inner = crate::context::bind(&CANCEL_KEY, token.clone(), current_cancel_token);
        token.cancel();
        assert!(inner.is_cancelled());
    }
}
