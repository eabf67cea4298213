//! Ambit: scoped context propagation across threads, pools, and structured
//! fork/join.
//!
//! # Overview
//!
//! Ambit lets code anywhere in a process read key→value bindings established
//! by a caller further up the logical call chain, across thread hand-offs,
//! pool submissions, and structured decompositions, with a *lexical*,
//! leak-proof lifetime model instead of unbounded per-thread storage.
//! Bindings live exactly as long as their scope body; a carrier snapshot
//! bridges them onto other workers; a narrow transmitter SPI drags foreign
//! thread-local state (diagnostic maps, tracing context) along in lock-step.
//!
//! # Core Guarantees
//!
//! - **Lexical cleanup**: a binding is popped on every exit path, panics
//!   included; nothing leaks past its scope body
//! - **LIFO shadowing**: a nested bind is the only way to change an observed
//!   value, and unwinds in strict stack order
//! - **Capture at submission**: decorated executors freeze the submitter's
//!   context at the moment of submission, never on the target worker
//! - **Symmetric foreign state**: transmitters replay in registration order
//!   and tear down in reverse, before the bindings unwind
//! - **Structured ownership**: children forked in a scope inherit its
//!   bindings and never outlive its close
//!
//! # Module Structure
//!
//! - [`key`]: typed context keys and the capture registry
//! - [`context`]: the per-worker frame stack (`bind`, `get`, `is_bound`)
//! - [`carrier`]: snapshot/restore of the full ambient context
//! - [`transmitter`]: the foreign-state propagation SPI
//! - [`diagnostic`]: per-worker diagnostic map plus its bridge transmitter
//! - [`executor`]: submission traits, thread pool, propagation decorators
//! - [`structured`]: fork/join scopes with automatic inheritance
//! - [`config`]: the process-wide propagation switches
//! - [`error`]: error types
//! - [`tracing_compat`]: logging shim over the `tracing-integration` feature
//!
//! # Example
//!
//! ```
//! use ambit::{context, ContextKey};
//! use std::sync::LazyLock;
//!
//! static TRACE_ID: LazyLock<ContextKey<String>> =
//!     LazyLock::new(|| ContextKey::new("traceId"));
//!
//! context::bind(&TRACE_ID, "abc-123".to_string(), || {
//!     // Anything called from here, including tasks submitted through a
//!     // wrapped executor, observes the binding.
//!     assert_eq!(*context::get(&TRACE_ID).unwrap(), "abc-123");
//! });
//! assert!(!context::is_bound(&TRACE_ID));
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::significant_drop_tightening)]

pub mod carrier;
pub mod config;
pub mod context;
pub mod diagnostic;
pub mod error;
pub mod executor;
pub mod key;
pub mod structured;
pub mod tracing_compat;
pub mod transmitter;

#[cfg(test)]
pub mod test_utils;

// Re-exports for convenient access to core types
pub use carrier::Carrier;
pub use config::{ConfigError, PropagationConfig};
pub use context::{bind, get, get_or_default, is_bound, with, Bindings};
pub use error::{Error, ErrorKind, Result, ResultExt};
pub use executor::{
    run_async, run_async_on, supply_async, supply_async_on, wrap_executor, wrap_executor_service,
    wrap_task, Executor, ExecutorExt, ExecutorService, Task, TaskFuture, ThreadPool,
};
pub use key::{ContextKey, KeyId};
pub use structured::{
    current_cancel_token, CancelToken, Subtask, SubtaskState, TaskResult, TaskScope,
};
pub use transmitter::{Transmitter, TransmitterBackup, TransmitterSnapshot};
