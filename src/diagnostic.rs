//! Per-thread diagnostic map and its bridge transmitter.
//!
//! The diagnostic map is a worker-local `String -> String` store in the
//! tradition of logging diagnostic contexts: request ids, tenant ids, and
//! similar correlation fields that log layouts read ambiently. It is *not*
//! scoped storage (entries persist on the worker until removed), which is
//! exactly why it needs a [`Transmitter`] to follow tasks across workers.
//!
//! [`DiagnosticTransmitter`] is that bridge, discovered by default. On
//! replay it backs up the target worker's current map before installing the
//! captured one; on restore it reinstates the backup exactly, including the
//! "no map" case, so a worker that already had diagnostic state at task
//! start gets it back verbatim.

use crate::transmitter::{Transmitter, TransmitterBackup, TransmitterSnapshot};
use crate::tracing_compat::warn;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

thread_local! {
    static MAP: RefCell<Option<HashMap<String, String>>> = const { RefCell::new(None) };
}

/// Inserts an entry into the current worker's diagnostic map.
pub fn put(key: impl Into<String>, value: impl Into<String>) {
    MAP.with(|map| {
        map.borrow_mut()
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
    });
}

/// Returns a copy of one entry from the current worker's diagnostic map.
#[must_use]
pub fn get(key: &str) -> Option<String> {
    MAP.with(|map| map.borrow().as_ref().and_then(|m| m.get(key).cloned()))
}

/// Removes an entry, returning its previous value.
pub fn remove(key: &str) -> Option<String> {
    MAP.with(|map| map.borrow_mut().as_mut().and_then(|m| m.remove(key)))
}

/// Clears the current worker's diagnostic map.
pub fn clear() {
    MAP.with(|map| *map.borrow_mut() = None);
}

/// Returns a copy of the current worker's diagnostic map, or `None` when the
/// worker has no diagnostic state.
#[must_use]
pub fn context_map() -> Option<HashMap<String, String>> {
    MAP.with(|map| map.borrow().clone())
}

/// Replaces the current worker's diagnostic map wholesale.
///
/// `None` clears the worker back to the "no state" case.
pub fn set_context_map(entries: Option<HashMap<String, String>>) {
    MAP.with(|map| *map.borrow_mut() = entries);
}

/// Bridge transmitter propagating the diagnostic map across workers.
#[derive(Debug, Default)]
pub struct DiagnosticTransmitter;

impl DiagnosticTransmitter {
    /// Creates the bridge transmitter.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Transmitter for DiagnosticTransmitter {
    fn name(&self) -> &str {
        "diagnostic"
    }

    fn capture(&self) -> Option<TransmitterSnapshot> {
        context_map().map(|entries| Arc::new(entries) as TransmitterSnapshot)
    }

    fn replay(&self, snapshot: &TransmitterSnapshot) -> TransmitterBackup {
        let backup = context_map();
        if let Some(entries) = snapshot.downcast_ref::<HashMap<String, String>>() {
            set_context_map(Some(entries.clone()));
        } else {
            warn!("diagnostic snapshot has a foreign type; clearing worker map");
            clear();
        }
        Box::new(backup)
    }

    fn restore(&self, backup: TransmitterBackup) {
        match backup.downcast::<Option<HashMap<String, String>>>() {
            Ok(saved) => set_context_map(*saved),
            Err(_) => {
                warn!("diagnostic backup has a foreign type; clearing worker map");
                clear();
            }
        }
    }
}
