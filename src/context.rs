//! The scoped binding runtime: a per-worker frame stack of key→value
//! bindings with strictly lexical lifetime.
//!
//! Every OS thread owns its own frame stack. [`bind`] pushes a one-binding
//! frame for the dynamic extent of a closure; the [`Bindings`] builder pushes
//! several bindings as a single frame. Frames are popped by an RAII guard on
//! every exit path, including unwinding panics, so a binding can never leak
//! past its scope body.
//!
//! Lookup is O(1) through a hash overlay from key id to the stack of active
//! values; the topmost entry is the innermost binding. Shadowing via a nested
//! [`bind`] is the only way to change the observed value.
//!
//! # Example
//!
//! ```
//! use ambit::{ContextKey, context};
//! use std::sync::LazyLock;
//!
//! static TRACE_ID: LazyLock<ContextKey<String>> =
//!     LazyLock::new(|| ContextKey::new("traceId"));
//!
//! let seen = context::bind(&TRACE_ID, "abc-123".to_string(), || {
//!     context::get(&TRACE_ID).map(|v| (*v).clone())
//! });
//! assert_eq!(seen.unwrap(), "abc-123");
//! assert!(!context::is_bound(&TRACE_ID));
//! ```

use crate::error::{Error, ErrorKind, Result};
use crate::key::{BoundValue, ContextKey, KeyId};
use crate::tracing_compat::trace;
use smallvec::SmallVec;
use std::cell::RefCell;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

/// The bindings established by one frame push.
pub(crate) type FrameBindings = SmallVec<[(KeyId, BoundValue); 4]>;

/// Per-thread stack of active binding frames, with a hash overlay for
/// constant-time innermost lookup.
#[derive(Default)]
struct FrameStack {
    frames: Vec<FrameBindings>,
    index: HashMap<KeyId, SmallVec<[BoundValue; 2]>>,
}

thread_local! {
    static STACK: RefCell<FrameStack> = RefCell::new(FrameStack::default());
}

/// Pushes a frame of bindings; the returned guard pops it on drop.
///
/// The guard is `!Send`: a frame must be popped on the thread that pushed it.
pub(crate) fn push_frame(bindings: FrameBindings) -> FrameGuard {
    STACK.with(|stack| {
        let mut stack = stack.borrow_mut();
        for (id, value) in &bindings {
            stack.index.entry(*id).or_default().push(value.clone());
        }
        trace!(bindings = bindings.len(), depth = stack.frames.len() + 1, "frame pushed");
        stack.frames.push(bindings);
    });
    FrameGuard {
        _not_send: PhantomData,
    }
}

/// RAII guard that pops one binding frame when dropped.
pub(crate) struct FrameGuard {
    _not_send: PhantomData<*const ()>,
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            if let Some(frame) = stack.frames.pop() {
                for (id, _) in frame.iter().rev() {
                    let empty = {
                        let Some(values) = stack.index.get_mut(id) else {
                            continue;
                        };
                        values.pop();
                        values.is_empty()
                    };
                    if empty {
                        stack.index.remove(id);
                    }
                }
                trace!(depth = stack.frames.len(), "frame popped");
            }
        });
    }
}

/// Returns the innermost bound value for a key id on the current thread.
pub(crate) fn innermost(id: KeyId) -> Option<BoundValue> {
    STACK.with(|stack| {
        stack
            .borrow()
            .index
            .get(&id)
            .and_then(|values| values.last().cloned())
    })
}

/// Invokes `body` with `value` bound to `key` for its dynamic extent.
///
/// Within `body`, [`get`] on `key` yields `value`; the binding is popped
/// before `bind` returns, whether `body` returns normally or panics.
pub fn bind<T, R>(key: &ContextKey<T>, value: T, body: impl FnOnce() -> R) -> R
where
    T: Send + Sync + 'static,
{
    let mut bindings = FrameBindings::new();
    bindings.push((key.id(), Arc::new(value) as BoundValue));
    let _guard = push_frame(bindings);
    body()
}

/// Starts a multi-binding scope.
///
/// Chain further bindings with [`Bindings::and`] and execute the scope body
/// with [`Bindings::run`]; all bindings are established atomically as a
/// single frame.
///
/// # Example
///
/// ```
/// use ambit::{context, ContextKey};
/// use std::sync::LazyLock;
///
/// static TENANT: LazyLock<ContextKey<String>> = LazyLock::new(|| ContextKey::new("tenant"));
/// static USER: LazyLock<ContextKey<String>> = LazyLock::new(|| ContextKey::new("user"));
///
/// context::with(&TENANT, "t-1".to_string())
///     .and(&USER, "u-9".to_string())
///     .run(|| {
///         assert!(context::is_bound(&TENANT));
///         assert!(context::is_bound(&USER));
///     });
/// ```
pub fn with<T>(key: &ContextKey<T>, value: T) -> Bindings
where
    T: Send + Sync + 'static,
{
    Bindings::new().and(key, value)
}

/// Builder for a scope establishing several bindings at once.
#[derive(Default)]
pub struct Bindings {
    bindings: FrameBindings,
}

impl Bindings {
    /// Creates an empty binding set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one binding to the set.
    #[must_use]
    pub fn and<T>(mut self, key: &ContextKey<T>, value: T) -> Self
    where
        T: Send + Sync + 'static,
    {
        self.bindings.push((key.id(), Arc::new(value) as BoundValue));
        self
    }

    /// Returns the number of bindings collected so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    /// Returns true if no bindings were collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Invokes `body` with every collected binding active, as one frame.
    pub fn run<R>(self, body: impl FnOnce() -> R) -> R {
        let _guard = push_frame(self.bindings);
        body()
    }
}

impl std::fmt::Debug for Bindings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bindings")
            .field("len", &self.bindings.len())
            .finish()
    }
}

/// Returns the innermost bound value for `key`, or the key's default.
///
/// # Errors
///
/// Fails with [`ErrorKind::Unbound`] when the key is neither bound on the
/// current thread nor carries a default value. Misuse is local to the
/// caller; no scope unwinding occurs.
pub fn get<T>(key: &ContextKey<T>) -> Result<Arc<T>>
where
    T: Send + Sync + 'static,
{
    if let Some(value) = innermost(key.id()) {
        return value.downcast::<T>().map_err(|_| {
            Error::new(ErrorKind::Internal)
                .with_context(format!("binding for key '{}' has a foreign type", key.name()))
        });
    }
    key.default_value().ok_or_else(|| Error::unbound(key.name()))
}

/// Returns the innermost bound value for `key`, the key's default, or
/// `fallback`. Never fails.
pub fn get_or_default<T>(key: &ContextKey<T>, fallback: T) -> Arc<T>
where
    T: Send + Sync + 'static,
{
    if let Some(value) = innermost(key.id()) {
        if let Ok(typed) = value.downcast::<T>() {
            return typed;
        }
    }
    key.default_value().unwrap_or_else(|| Arc::new(fallback))
}

/// Returns true if `key` is bound on the current thread.
///
/// A key default does not count as a binding.
#[must_use]
pub fn is_bound<T>(key: &ContextKey<T>) -> bool {
    innermost(key.id()).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::sync::LazyLock;

    static TRACE: LazyLock<ContextKey<String>> = LazyLock::new(|| ContextKey::new("trace"));
    static COUNT: LazyLock<ContextKey<u32>> = LazyLock::new(|| ContextKey::new("count"));
    static LEVEL: LazyLock<ContextKey<u32>> =
        LazyLock::new(|| ContextKey::with_default("level", 3));

    fn init_test(name: &str) {
        crate::test_utils::init_test_logging();
        crate::test_phase!(name);
    }

    #[test]
    fn bind_and_get_roundtrip() {
        init_test("bind_and_get_roundtrip");
        let seen = bind(&TRACE, "T1".to_string(), || {
            get(&TRACE).map(|v| (*v).clone())
        });
        let seen = seen.expect("bound value");
        crate::assert_with_log!(seen == "T1", "bound value observed", "T1", seen);
        crate::assert_with_log!(!is_bound(&TRACE), "popped after return", false, is_bound(&TRACE));
        crate::test_complete!("bind_and_get_roundtrip");
    }

    #[test]
    fn nested_bind_shadows_lifo() {
        init_test("nested_bind_shadows_lifo");
        bind(&COUNT, 1, || {
            let inner = bind(&COUNT, 2, || *get(&COUNT).expect("inner"));
            crate::assert_with_log!(inner == 2, "inner shadows", 2u32, inner);
            let outer = *get(&COUNT).expect("outer");
            crate::assert_with_log!(outer == 1, "outer restored", 1u32, outer);
        });
        crate::test_complete!("nested_bind_shadows_lifo");
    }

    #[test]
    fn binding_is_popped_on_panic() {
        init_test("binding_is_popped_on_panic");
        let result = catch_unwind(AssertUnwindSafe(|| {
            bind(&TRACE, "doomed".to_string(), || panic!("scope body failed"));
        }));
        assert!(result.is_err());
        crate::assert_with_log!(!is_bound(&TRACE), "no leak after panic", false, is_bound(&TRACE));
        crate::test_complete!("binding_is_popped_on_panic");
    }

    #[test]
    fn inner_panic_restores_outer_binding() {
        init_test("inner_panic_restores_outer_binding");
        bind(&TRACE, "outer".to_string(), || {
            let result = catch_unwind(AssertUnwindSafe(|| {
                bind(&TRACE, "inner".to_string(), || panic!("inner failed"));
            }));
            assert!(result.is_err());
            let seen = (*get(&TRACE).expect("outer survives")).clone();
            crate::assert_with_log!(seen == "outer", "outer restored", "outer", seen);
        });
        crate::test_complete!("inner_panic_restores_outer_binding");
    }

    #[test]
    fn default_applies_when_unbound() {
        init_test("default_applies_when_unbound");
        let value = *get(&LEVEL).expect("default");
        crate::assert_with_log!(value == 3, "key default", 3u32, value);
        let bound = bind(&LEVEL, 9, || *get(&LEVEL).expect("bound"));
        crate::assert_with_log!(bound == 9, "binding beats default", 9u32, bound);
        crate::test_complete!("default_applies_when_unbound");
    }

    #[test]
    fn get_or_default_never_fails() {
        init_test("get_or_default_never_fails");
        let fallback = *get_or_default(&COUNT, 42);
        crate::assert_with_log!(fallback == 42, "fallback used", 42u32, fallback);
        // Key default wins over the caller fallback.
        let key_default = *get_or_default(&LEVEL, 42);
        crate::assert_with_log!(key_default == 3, "key default wins", 3u32, key_default);
        crate::test_complete!("get_or_default_never_fails");
    }

    #[test]
    fn unbound_error_names_the_key() {
        init_test("unbound_error_names_the_key");
        let err = get(&COUNT).expect_err("unbound");
        assert_eq!(err.kind(), ErrorKind::Unbound);
        assert!(err.to_string().contains("count"));
        crate::test_complete!("unbound_error_names_the_key");
    }

    #[test]
    fn bindings_builder_establishes_one_frame() {
        init_test("bindings_builder_establishes_one_frame");
        with(&TRACE, "multi".to_string())
            .and(&COUNT, 5)
            .run(|| {
                assert!(is_bound(&TRACE));
                assert!(is_bound(&COUNT));
            });
        assert!(!is_bound(&TRACE));
        assert!(!is_bound(&COUNT));
        crate::test_complete!("bindings_builder_establishes_one_frame");
    }

    #[test]
    fn bindings_are_thread_local() {
        init_test("bindings_are_thread_local");
        bind(&COUNT, 11, || {
            let observed_elsewhere =
                std::thread::spawn(|| is_bound(&COUNT)).join().expect("thread");
            crate::assert_with_log!(
                !observed_elsewhere,
                "not visible across threads",
                false,
                observed_elsewhere
            );
        });
        crate::test_complete!("bindings_are_thread_local");
    }

    #[test]
    fn values_are_shared_not_cloned() {
        init_test("values_are_shared_not_cloned");
        bind(&TRACE, "shared".to_string(), || {
            let a = get(&TRACE).expect("a");
            let b = get(&TRACE).expect("b");
            assert!(Arc::ptr_eq(&a, &b));
        });
        crate::test_complete!("values_are_shared_not_cloned");
    }
}
