//! Snapshot / restore of the full ambient context.
//!
//! A [`Carrier`] freezes everything a task-submitting site has in scope:
//! every bound registered [`ContextKey`](crate::key::ContextKey) plus every
//! transmitter snapshot. It re-establishes all of it around a task body on any
//! worker.
//!
//! Restore discipline, on all paths including unwinding panics:
//!
//! 1. the captured bindings are pushed as one frame;
//! 2. transmitters replay in capture order, each returning a backup;
//! 3. the task body runs;
//! 4. transmitters restore in **reverse** order;
//! 5. the binding frame pops.
//!
//! Transmitter teardown always runs before binding teardown. A panic from
//! the body propagates unchanged after teardown; panics raised by teardown
//! itself are logged and suppressed into the primary unwinding, or re-raised
//! once the remaining teardown has finished when there is no primary.

use crate::context::{push_frame, FrameBindings};
use crate::error::{panic_message, Error};
use crate::key::{self, BoundValue, KeyId};
use crate::transmitter::{self, Transmitter, TransmitterBackup, TransmitterSnapshot};
use crate::tracing_compat::{debug, warn};
use std::any::Any;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::Arc;

struct CapturedBinding {
    id: KeyId,
    name: Arc<str>,
    value: BoundValue,
}

struct CapturedTransmitter {
    transmitter: Arc<dyn Transmitter>,
    snapshot: TransmitterSnapshot,
}

struct CarrierInner {
    bindings: Vec<CapturedBinding>,
    transmitters: Vec<CapturedTransmitter>,
}

/// An immutable snapshot of the ambient context at one moment.
///
/// Carriers are cheap to clone and safe to restore concurrently on many
/// workers: capture freezes the values, so concurrent restores are
/// independent.
#[derive(Clone)]
pub struct Carrier {
    inner: Arc<CarrierInner>,
}

impl Carrier {
    /// Captures the current worker's ambient context.
    ///
    /// Iterates the key registry in enrollment order, recording the innermost
    /// value of every currently-bound key, then asks each registered
    /// transmitter for a snapshot, preserving transmitter order. When the
    /// master switch is off (see [`PropagationConfig`]) or nothing is bound,
    /// an empty carrier is returned; restoring it is still valid and cheap.
    ///
    /// [`PropagationConfig`]: crate::config::PropagationConfig
    #[must_use]
    pub fn capture() -> Self {
        if !crate::config::current().enabled {
            return Self::empty();
        }

        let keys = key::registry_snapshot();
        let mut bindings = Vec::new();
        for info in keys.iter() {
            if let Some(value) = crate::context::innermost(info.id) {
                bindings.push(CapturedBinding {
                    id: info.id,
                    name: Arc::clone(&info.name),
                    value,
                });
            }
        }

        let mut captured = Vec::new();
        for t in transmitter::transmitters().iter() {
            if let Some(snapshot) = t.capture() {
                captured.push(CapturedTransmitter {
                    transmitter: Arc::clone(t),
                    snapshot,
                });
            }
        }

        debug!(
            bindings = bindings.len(),
            transmitters = captured.len(),
            "context captured"
        );

        Self {
            inner: Arc::new(CarrierInner {
                bindings,
                transmitters: captured,
            }),
        }
    }

    /// Returns a carrier with no bindings and no transmitter snapshots.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            inner: Arc::new(CarrierInner {
                bindings: Vec::new(),
                transmitters: Vec::new(),
            }),
        }
    }

    /// Returns true if the carrier holds nothing to restore.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.bindings.is_empty() && self.inner.transmitters.is_empty()
    }

    /// Returns the number of captured bindings.
    #[must_use]
    pub fn binding_count(&self) -> usize {
        self.inner.bindings.len()
    }

    /// Returns the names of the captured bindings, in capture order.
    #[must_use]
    pub fn binding_names(&self) -> Vec<&str> {
        self.inner.bindings.iter().map(|b| &*b.name).collect()
    }

    /// Runs `body` with the captured context re-established on the current
    /// worker.
    ///
    /// All captured bindings are pushed as a single frame, layering over
    /// whatever the worker already has bound (a task restored twice is
    /// layered twice, LIFO). Transmitters replay in capture order before
    /// `body` and tear down in reverse order after it, on every exit path.
    pub fn restore<R>(&self, body: impl FnOnce() -> R) -> R {
        let frame: FrameBindings = self
            .inner
            .bindings
            .iter()
            .map(|b| (b.id, b.value.clone()))
            .collect();
        let _frame_guard = push_frame(frame);

        let mut teardown = TeardownGuard::new(self.inner.transmitters.len());
        for ct in &self.inner.transmitters {
            match catch_unwind(AssertUnwindSafe(|| ct.transmitter.replay(&ct.snapshot))) {
                Ok(backup) => teardown.push(Arc::clone(&ct.transmitter), backup),
                Err(payload) => {
                    // Already-replayed transmitters tear down through the
                    // guard; the failure unwinds as a typed error so result
                    // channels upstream can recover its kind.
                    let error = Error::transmitter_failure(
                        ct.transmitter.name(),
                        "replay",
                        &panic_message(payload.as_ref()),
                    );
                    warn!(
                        transmitter = ct.transmitter.name(),
                        "transmitter replay panicked"
                    );
                    resume_unwind(Box::new(error));
                }
            }
        }

        // If `body` unwinds, the guard tears transmitters down (suppressed)
        // and then the frame guard pops the bindings.
        let out = body();

        teardown.finish();
        out
    }
}

impl std::fmt::Debug for Carrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Carrier")
            .field("bindings", &self.inner.bindings.len())
            .field("transmitters", &self.inner.transmitters.len())
            .finish()
    }
}

/// Reverse-order transmitter teardown with guaranteed execution.
struct TeardownGuard {
    entries: Vec<(Arc<dyn Transmitter>, Option<TransmitterBackup>)>,
    armed: bool,
}

impl TeardownGuard {
    fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            armed: true,
        }
    }

    fn push(&mut self, transmitter: Arc<dyn Transmitter>, backup: TransmitterBackup) {
        self.entries.push((transmitter, Some(backup)));
    }

    /// Tears down in reverse replay order, catching per-transmitter panics so
    /// one failure cannot skip the rest. Returns the first panic payload.
    fn run_teardown(&mut self) -> Option<Box<dyn Any + Send>> {
        let mut first_panic = None;
        while let Some((transmitter, backup)) = self.entries.pop() {
            let Some(backup) = backup else { continue };
            let result = catch_unwind(AssertUnwindSafe(|| transmitter.restore(backup)));
            if let Err(payload) = result {
                warn!(
                    transmitter = transmitter.name(),
                    panic = %panic_message(payload.as_ref()),
                    "transmitter restore panicked during teardown"
                );
                if first_panic.is_none() {
                    first_panic = Some(payload);
                }
            }
        }
        first_panic
    }

    /// Normal-path teardown: re-raises the first teardown panic, if any,
    /// once every transmitter has been restored.
    fn finish(mut self) {
        self.armed = false;
        if let Some(payload) = self.run_teardown() {
            resume_unwind(payload);
        }
    }
}

impl Drop for TeardownGuard {
    fn drop(&mut self) {
        if self.armed {
            // A primary panic is unwinding; teardown failures are suppressed
            // into it (logged above) rather than aborting the process.
            let _ = self.run_teardown();
        }
    }
}
