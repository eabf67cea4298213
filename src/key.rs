//! Typed context keys and the process-wide key registry.
//!
//! A [`ContextKey`] names one typed slot in the dynamic binding environment.
//! Keys compare by identity: two keys sharing a name are distinct slots.
//! Creating a key enrolls it in a process-wide registry that
//! [`Carrier::capture`](crate::carrier::Carrier::capture) traverses to find
//! currently-bound slots.
//!
//! The registry is a copy-on-write sequence: writers clone-push-swap an
//! `Arc<Vec<_>>` under a short write lock; readers take an `Arc` snapshot and
//! iterate without holding any lock. Traversal is safe under concurrent
//! insertion.
//!
//! # Example
//!
//! ```
//! use ambit::ContextKey;
//! use std::sync::LazyLock;
//!
//! static TRACE_ID: LazyLock<ContextKey<String>> =
//!     LazyLock::new(|| ContextKey::new("traceId"));
//! ```

use crate::tracing_compat::trace;
use parking_lot::RwLock;
use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

/// A value held by a binding, type-erased for frame-stack storage.
pub(crate) type BoundValue = Arc<dyn Any + Send + Sync>;

/// Process-unique identity of a [`ContextKey`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyId(u64);

impl KeyId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw numeric identity.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

struct KeyCore<T> {
    id: KeyId,
    name: Arc<str>,
    default: Option<Arc<T>>,
}

/// Identity object for one typed slot in the dynamic binding environment.
///
/// A key carries a debug name (non-unique, informational) and an optional
/// default value returned by [`get`](crate::context::get) when the key is
/// not bound. Keys are constructed once, never destroyed, and automatically
/// enrolled for capture at creation.
///
/// Equality and hashing use identity: every constructed key is globally
/// distinct.
pub struct ContextKey<T> {
    inner: Arc<KeyCore<T>>,
}

impl<T: Send + Sync + 'static> ContextKey<T> {
    /// Creates a key with no default value and enrolls it for capture.
    #[must_use]
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self::construct(name.into(), None)
    }

    /// Creates a key with a default value and enrolls it for capture.
    ///
    /// The default is returned by `get` whenever the key is unbound.
    #[must_use]
    pub fn with_default(name: impl Into<Arc<str>>, default: T) -> Self {
        Self::construct(name.into(), Some(Arc::new(default)))
    }

    fn construct(name: Arc<str>, default: Option<Arc<T>>) -> Self {
        let id = KeyId::next();
        enroll(KeyInfo {
            id,
            name: name.clone(),
        });
        trace!(key = %name, id = id.as_u64(), "context key enrolled");
        Self {
            inner: Arc::new(KeyCore { id, name, default }),
        }
    }
}

impl<T> ContextKey<T> {
    /// Returns the key's debug name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Returns the key's process-unique identity.
    #[must_use]
    pub fn id(&self) -> KeyId {
        self.inner.id
    }

    /// Returns the key's default value, if any.
    #[must_use]
    pub fn default_value(&self) -> Option<Arc<T>> {
        self.inner.default.clone()
    }

    /// Returns true if the key carries a default value.
    #[must_use]
    pub fn has_default(&self) -> bool {
        self.inner.default.is_some()
    }
}

impl<T> Clone for ContextKey<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> PartialEq for ContextKey<T> {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl<T> Eq for ContextKey<T> {}

impl<T> Hash for ContextKey<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl<T> fmt::Debug for ContextKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextKey")
            .field("name", &self.inner.name)
            .field("id", &self.inner.id)
            .field("has_default", &self.inner.default.is_some())
            .finish()
    }
}

/// Registry entry: the identity and name of one enrolled key.
#[derive(Debug, Clone)]
pub(crate) struct KeyInfo {
    pub(crate) id: KeyId,
    pub(crate) name: Arc<str>,
}

fn key_registry() -> &'static RwLock<Arc<Vec<KeyInfo>>> {
    static REGISTRY: OnceLock<RwLock<Arc<Vec<KeyInfo>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(Arc::new(Vec::new())))
}

/// Enrolls a key, deduplicating by identity.
///
/// Insert-if-absent under a short write lock; the published sequence is
/// replaced wholesale so in-flight readers keep their snapshot.
pub(crate) fn enroll(info: KeyInfo) {
    let registry = key_registry();
    let mut guard = registry.write();
    if guard.iter().any(|k| k.id == info.id) {
        return;
    }
    let mut next = Vec::with_capacity(guard.len() + 1);
    next.extend(guard.iter().cloned());
    next.push(info);
    *guard = Arc::new(next);
}

/// Returns a snapshot of the enrolled keys in enrollment order.
///
/// The snapshot is immutable; concurrent enrollments publish a new sequence
/// without disturbing it.
pub(crate) fn registry_snapshot() -> Arc<Vec<KeyInfo>> {
    Arc::clone(&key_registry().read())
}
