//! Propagation configuration.
//!
//! A single process-wide configuration object with three recognized options,
//! all defaulting to on:
//!
//! | Option | Field | Effect |
//! |--------|-------|--------|
//! | `enabled` | `enabled` | Master switch; off means captures are empty and executor wrapping is a no-op. |
//! | `wrap-task-executor` | `wrap_task_executor` | Host frameworks should auto-wrap their executor instances. |
//! | `wrap-async` | `wrap_async` | Host frameworks should intercept their async-annotated entry points. |
//!
//! The `wrap-*` flags are advisory toggles consumed by host-framework
//! integration; the core only stores them. The core defines no environment
//! variables and persists nothing; [`PropagationConfig::apply_option`] is
//! fed by the host, whatever its own configuration source is.

use parking_lot::RwLock;
use thiserror::Error;

/// Errors raised while applying host-supplied configuration options.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// The option name is not one of the recognized options.
    #[error("unrecognized option `{0}`")]
    UnknownOption(String),
    /// The option value could not be parsed as a boolean.
    #[error("invalid value for `{key}`: expected bool (true/false/1/0/yes/no), got `{value}`")]
    InvalidValue {
        /// The option that failed to parse.
        key: String,
        /// The rejected raw value.
        value: String,
    },
}

/// Process-wide propagation settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropagationConfig {
    /// Master switch for context propagation.
    pub enabled: bool,
    /// Whether host-framework executors should be auto-wrapped.
    pub wrap_task_executor: bool,
    /// Whether host-framework async entry points should be intercepted.
    pub wrap_async: bool,
}

const DEFAULT: PropagationConfig = PropagationConfig {
    enabled: true,
    wrap_task_executor: true,
    wrap_async: true,
};

impl Default for PropagationConfig {
    fn default() -> Self {
        DEFAULT
    }
}

impl PropagationConfig {
    /// Creates a configuration with every option on.
    #[must_use]
    pub const fn new() -> Self {
        DEFAULT
    }

    /// Sets the master switch.
    #[must_use]
    pub const fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Sets the executor auto-wrap flag.
    #[must_use]
    pub const fn with_wrap_task_executor(mut self, wrap: bool) -> Self {
        self.wrap_task_executor = wrap;
        self
    }

    /// Sets the async interception flag.
    #[must_use]
    pub const fn with_wrap_async(mut self, wrap: bool) -> Self {
        self.wrap_async = wrap;
        self
    }

    /// Applies one host-supplied option by its recognized name.
    ///
    /// # Errors
    ///
    /// [`ConfigError::UnknownOption`] for an unrecognized name,
    /// [`ConfigError::InvalidValue`] for an unparseable boolean.
    pub fn apply_option(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "enabled" => self.enabled = parse_bool(key, value)?,
            "wrap-task-executor" => self.wrap_task_executor = parse_bool(key, value)?,
            "wrap-async" => self.wrap_async = parse_bool(key, value)?,
            _ => return Err(ConfigError::UnknownOption(key.to_string())),
        }
        Ok(())
    }

    /// Builds a configuration from `(name, value)` option pairs.
    ///
    /// # Errors
    ///
    /// Fails on the first unrecognized name or unparseable value.
    pub fn from_options<'a>(
        options: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Result<Self, ConfigError> {
        let mut config = Self::new();
        for (key, value) in options {
            config.apply_option(key, value)?;
        }
        Ok(config)
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

static CURRENT: RwLock<PropagationConfig> = RwLock::new(DEFAULT);

/// Installs the process-wide configuration.
pub fn install(config: PropagationConfig) {
    *CURRENT.write() = config;
}

/// Returns the process-wide configuration.
#[must_use]
pub fn current() -> PropagationConfig {
    *CURRENT.read()
}
