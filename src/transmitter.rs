//! The transmitter SPI: pluggable propagation of foreign ambient state.
//!
//! A [`Transmitter`] carries worker-local state the core does not know about
//! (diagnostic maps, tracing context, any thread-local store) across task
//! submission, in lock-step with the scoped bindings:
//!
//! - `capture` runs on the submitting worker and freezes a snapshot;
//! - `replay` runs on the target worker before the task body, backing up the
//!   worker's current state and installing the snapshot;
//! - `restore` runs after the task body and reinstates the backup exactly,
//!   including the "no state" case.
//!
//! Replay order equals registration order; teardown is strictly reverse.
//!
//! # Discovery
//!
//! Transmitters are discovered through *providers*: functions returning the
//! transmitters they contribute, evaluated once at first use and again on
//! every [`refresh`]. The crate installs one built-in provider for the
//! [diagnostic map](crate::diagnostic). [`register`] adds a transmitter
//! programmatically; such registrations do not survive a [`refresh`].

use crate::tracing_compat::debug;
use parking_lot::RwLock;
use std::any::Any;
use std::sync::{Arc, OnceLock};

/// An opaque snapshot captured on the submitting worker.
///
/// Snapshots are shared: one carrier may be restored concurrently on many
/// workers, so a snapshot must be immutable after capture.
pub type TransmitterSnapshot = Arc<dyn Any + Send + Sync>;

/// An opaque backup of one worker's prior state, produced by `replay` and
/// consumed by `restore`. Backups are per-restore and never shared.
pub type TransmitterBackup = Box<dyn Any + Send>;

/// Plugin contract for propagating foreign ambient state.
///
/// Implementations must be stateless with respect to the carrier: all state
/// flows through the snapshot and backup values. `capture` must produce a
/// defensively-copied value; later mutation on the submitting worker must not
/// affect the snapshot.
pub trait Transmitter: Send + Sync + 'static {
    /// Short name used in diagnostics.
    fn name(&self) -> &str;

    /// Captures the submitting worker's state.
    ///
    /// Returns `None` when there is nothing to propagate; the transmitter is
    /// then skipped entirely for this carrier.
    fn capture(&self) -> Option<TransmitterSnapshot>;

    /// Installs `snapshot` on the target worker, returning a backup of the
    /// state it replaced.
    fn replay(&self, snapshot: &TransmitterSnapshot) -> TransmitterBackup;

    /// Reinstates the state saved by [`replay`](Self::replay), including the
    /// "no state" case.
    fn restore(&self, backup: TransmitterBackup);
}

/// A discovery hook contributing transmitters to the registry.
pub type TransmitterProvider = fn() -> Vec<Arc<dyn Transmitter>>;

struct Registry {
    providers: Vec<TransmitterProvider>,
    active: Arc<Vec<Arc<dyn Transmitter>>>,
}

impl Registry {
    fn rebuild(&mut self) {
        let mut active: Vec<Arc<dyn Transmitter>> = Vec::new();
        for provider in &self.providers {
            active.extend(provider());
        }
        debug!(count = active.len(), "transmitter registry rebuilt");
        self.active = Arc::new(active);
    }
}

fn builtin_transmitters() -> Vec<Arc<dyn Transmitter>> {
    vec![Arc::new(crate::diagnostic::DiagnosticTransmitter::new()) as Arc<dyn Transmitter>]
}

fn registry() -> &'static RwLock<Registry> {
    static REGISTRY: OnceLock<RwLock<Registry>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut reg = Registry {
            providers: vec![builtin_transmitters],
            active: Arc::new(Vec::new()),
        };
        reg.rebuild();
        RwLock::new(reg)
    })
}

/// Registers a transmitter programmatically, deduplicating by identity.
///
/// The registration is appended after every currently-active transmitter and
/// is dropped again by the next [`refresh`].
pub fn register(transmitter: Arc<dyn Transmitter>) {
    let mut guard = registry().write();
    if guard
        .active
        .iter()
        .any(|t| Arc::ptr_eq(t, &transmitter))
    {
        return;
    }
    let mut next = Vec::with_capacity(guard.active.len() + 1);
    next.extend(guard.active.iter().cloned());
    debug!(transmitter = transmitter.name(), "transmitter registered");
    next.push(transmitter);
    guard.active = Arc::new(next);
}

/// Adds a discovery provider and immediately folds its transmitters in.
pub fn register_provider(provider: TransmitterProvider) {
    let mut guard = registry().write();
    if guard.providers.iter().any(|p| *p as usize == provider as usize) {
        return;
    }
    guard.providers.push(provider);
    let mut next = Vec::with_capacity(guard.active.len());
    next.extend(guard.active.iter().cloned());
    next.extend(provider());
    guard.active = Arc::new(next);
}

/// Rebuilds the registry from its providers.
///
/// Programmatic [`register`] entries are discarded, matching the re-scan
/// semantics of service discovery.
pub fn refresh() {
    registry().write().rebuild();
}

/// Returns a snapshot of the active transmitters in registration order.
///
/// The snapshot is immutable; concurrent registration publishes a new
/// sequence without disturbing in-flight capture or restore.
#[must_use]
pub fn transmitters() -> Arc<Vec<Arc<dyn Transmitter>>> {
    Arc::clone(&registry().read().active)
}
