//! Error types and error handling strategy for Ambit.
//!
//! This module defines the core error type used throughout the crate.
//! Error handling follows these principles:
//!
//! - Errors are explicit and typed (no stringly-typed errors)
//! - Misuse of the binding API is a local error; no scope unwinding occurs
//!   unless the caller propagates
//! - Panics from user task bodies are never swallowed; they are converted to
//!   [`ErrorKind::ExecutionFailure`] only where a result channel exists

use core::fmt;
use std::any::Any;
use std::sync::Arc;

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    // === Binding ===
    /// `get` on a key that is neither bound nor carries a default.
    Unbound,

    // === Structured scope ===
    /// Operation issued in the wrong scope-machine state.
    InvalidScopeState,
    /// A join or bulk-invoke deadline elapsed.
    Timeout,
    /// A child or submitted task failed; the cause is in the source chain.
    ExecutionFailure,
    /// Cooperative cancellation was observed.
    Interrupted,

    // === Transmitters ===
    /// A transmitter panicked during capture, replay, or restore.
    TransmitterFailure,

    // === Arguments / internal ===
    /// Argument misuse (e.g. an empty task list).
    Precondition,
    /// Internal invariant breach (bug).
    Internal,
}

/// The main error type for Ambit operations.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    context: Option<String>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Creates a new error with the given kind.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            context: None,
            source: None,
        }
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns true if this error reports an unbound key.
    #[must_use]
    pub const fn is_unbound(&self) -> bool {
        matches!(self.kind, ErrorKind::Unbound)
    }

    /// Returns true if this error is a timeout.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self.kind, ErrorKind::Timeout)
    }

    /// Returns true if this error reports cooperative cancellation.
    #[must_use]
    pub const fn is_interrupted(&self) -> bool {
        matches!(self.kind, ErrorKind::Interrupted)
    }

    /// Returns true if this error wraps a failed task.
    #[must_use]
    pub const fn is_execution_failure(&self) -> bool {
        matches!(self.kind, ErrorKind::ExecutionFailure)
    }

    /// Adds deterministic context text to the error.
    #[must_use]
    pub fn with_context(mut self, ctx: impl Into<String>) -> Self {
        self.context = Some(ctx.into());
        self
    }

    /// Adds a source error to the chain.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Creates an unbound-key error naming the key.
    #[must_use]
    pub fn unbound(key_name: &str) -> Self {
        Self::new(ErrorKind::Unbound).with_context(format!(
            "context key '{key_name}' is not bound and has no default value"
        ))
    }

    /// Creates an invalid-scope-state error.
    #[must_use]
    pub fn invalid_state(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidScopeState).with_context(detail)
    }

    /// Creates a timeout error.
    #[must_use]
    pub fn timeout(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout).with_context(detail)
    }

    /// Creates an interrupted error.
    #[must_use]
    pub fn interrupted(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Interrupted).with_context(detail)
    }

    /// Creates an execution failure from a boxed task error, preserving the
    /// cause in the source chain.
    #[must_use]
    pub fn execution(cause: Box<dyn std::error::Error + Send + Sync>) -> Self {
        let mut err = Self::new(ErrorKind::ExecutionFailure).with_context(cause.to_string());
        err.source = Some(Arc::from(cause));
        err
    }

    /// Creates an execution failure from a panic payload.
    ///
    /// A payload that is itself an [`Error`] (raised, for example, by a
    /// panicking transmitter replay) is recovered with its kind intact.
    /// Otherwise the message is preserved when the payload is a `&str` or
    /// `String`.
    #[must_use]
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        if let Some(error) = payload.downcast_ref::<Self>() {
            return error.clone();
        }
        Self::new(ErrorKind::ExecutionFailure)
            .with_context(format!("task panicked: {}", panic_message(payload)))
    }

    /// Creates a transmitter failure naming the transmitter and phase.
    #[must_use]
    pub fn transmitter_failure(name: &str, phase: &str, detail: &str) -> Self {
        Self::new(ErrorKind::TransmitterFailure)
            .with_context(format!("transmitter '{name}' panicked during {phase}: {detail}"))
    }
}

/// Extracts a human-readable message from a panic payload.
#[must_use]
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "opaque panic payload".to_string()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(ctx) = &self.context {
            write!(f, ": {ctx}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as _)
    }
}

/// Extension trait for adding context to Results.
pub trait ResultExt<T> {
    /// Attach a context string on error.
    fn context(self, ctx: impl Into<String>) -> Result<T>;
    /// Attach context computed lazily on error.
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for core::result::Result<T, E> {
    fn context(self, ctx: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().with_context(ctx))
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.map_err(|e| e.into().with_context(f()))
    }
}

/// A specialized Result type for Ambit operations.
pub type Result<T> = core::result::Result<T, Error>;
