//! Runtime Configuration
//!
//! This module provides configuration for the Tempo runtime.
//! Configuration can be set programmatically or loaded from environment variables.
//!
//! # Environment Variables
//!
//! All environment variables use the `TEMPO_` prefix:
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `TEMPO_MIN_PRIORITY` | Lowest realtime priority | 11 |
//! | `TEMPO_MAX_PRIORITY` | Highest realtime priority | 38 |
//! | `TEMPO_NORM_PRIORITY` | Default realtime priority | 11 |
//! | `TEMPO_MAX_WORKERS` | Release runner pool ceiling | CPU count × 4 |
//! | `TEMPO_HEAP_SIZE` | Heap budget in bytes (0 = unlimited) | 0 |
//! | `TEMPO_IMMORTAL_SIZE` | Immortal budget in bytes | 16777216 (16MB) |
//! | `TEMPO_DEFAULT_SCOPE_SIZE` | Default scoped region budget in bytes | 65536 (64KB) |
//! | `TEMPO_MAX_MESSAGE_LENGTH` | Preallocated error message bytes | 128 |
//! | `TEMPO_MAX_STACK_TRACE_DEPTH` | Preallocated frames per error | 16 |
//! | `TEMPO_LOG_LEVEL` | Log level (off/error/warn/info/debug/trace) | info |
//!
//! # Example
//!
//! ```rust,ignore
//! use tempo_runtime::config::RuntimeConfig;
//!
//! // Load from environment with defaults
//! let config = RuntimeConfig::from_env();
//!
//! // Or use the builder pattern
//! let config = RuntimeConfig::builder()
//!     .priority_range(1, 99)
//!     .immortal_size(1024 * 1024)
//!     .build()?;
//! ```

use std::env;

use thiserror::Error;

/// Log level for runtime logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    /// No logging.
    Off,
    /// Error messages only.
    Error,
    /// Warnings and errors.
    Warn,
    /// Informational messages (default).
    #[default]
    Info,
    /// Debug messages.
    Debug,
    /// Trace-level messages.
    Trace,
}

impl LogLevel {
    /// Parse a log level from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "off" | "none" | "0" => Some(LogLevel::Off),
            "error" | "err" | "1" => Some(LogLevel::Error),
            "warn" | "warning" | "2" => Some(LogLevel::Warn),
            "info" | "3" => Some(LogLevel::Info),
            "debug" | "4" => Some(LogLevel::Debug),
            "trace" | "5" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    /// Convert to a string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Lowest realtime priority.
    /// Default: 11.
    pub min_priority: i32,

    /// Highest realtime priority.
    /// Default: 38 (28 distinct levels).
    pub max_priority: i32,

    /// Priority given to schedulables that do not ask for one.
    /// Default: `min_priority`.
    pub norm_priority: i32,

    /// Upper bound on worker threads of any release runner pool.
    /// Default: available CPUs × 4.
    pub max_workers: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            min_priority: 11,
            max_priority: 38,
            norm_priority: 11,
            max_workers: num_cpus() * 4,
        }
    }
}

/// Memory configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryConfig {
    /// Heap budget in bytes.
    /// 0 means unlimited (default).
    pub heap_size: usize,

    /// Immortal budget in bytes.
    /// Default: 16MB.
    pub immortal_size: usize,

    /// Budget of scoped regions created without an explicit size.
    /// Default: 64KB.
    pub default_scope_size: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            heap_size: 0,
            immortal_size: 16 * 1024 * 1024,
            default_scope_size: 64 * 1024,
        }
    }
}

/// Buffer sizes for preallocated error records.
///
/// Each worker thread reserves one record per error kind up front; text
/// longer than these limits is truncated when recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionStorageConfig {
    /// Bytes reserved for an error message.
    /// Default: 128.
    pub max_message_length: usize,

    /// Frames reserved per error.
    /// Default: 16.
    pub max_stack_trace_depth: usize,

    /// Bytes reserved for a frame's type name.
    /// Default: 64.
    pub max_type_name_length: usize,

    /// Bytes reserved for a frame's function name.
    /// Default: 64.
    pub max_function_name_length: usize,

    /// Bytes reserved for a frame's file name.
    /// Default: 128.
    pub max_file_name_length: usize,
}

impl Default for ExceptionStorageConfig {
    fn default() -> Self {
        Self {
            max_message_length: 128,
            max_stack_trace_depth: 16,
            max_type_name_length: 64,
            max_function_name_length: 64,
            max_file_name_length: 128,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Log level.
    /// Default: Info.
    pub level: LogLevel,

    /// Include the event target (module path) in output.
    /// Default: true.
    pub with_target: bool,

    /// Include thread names in output.
    /// Default: true.
    pub with_thread_names: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            with_target: true,
            with_thread_names: true,
        }
    }
}

/// Complete runtime configuration.
///
/// Use `RuntimeConfig::default()` for sensible defaults, or
/// `RuntimeConfig::from_env()` to load from environment variables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Scheduler configuration.
    pub scheduler: SchedulerConfig,

    /// Memory configuration.
    pub memory: MemoryConfig,

    /// Preallocated error storage configuration.
    pub exceptions: ExceptionStorageConfig,

    /// Logging configuration.
    pub log: LogConfig,
}

impl RuntimeConfig {
    /// Create a new builder for RuntimeConfig.
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::new()
    }

    /// Load configuration from environment variables.
    ///
    /// Variables that are unset or fail to parse keep their default values.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        // Scheduler configuration
        if let Some(val) = parse_env_i32("TEMPO_MIN_PRIORITY") {
            config.scheduler.min_priority = val;
        }

        if let Some(val) = parse_env_i32("TEMPO_MAX_PRIORITY") {
            config.scheduler.max_priority = val;
        }

        config.scheduler.norm_priority = parse_env_i32("TEMPO_NORM_PRIORITY")
            .unwrap_or(config.scheduler.min_priority);

        if let Some(val) = parse_env_usize("TEMPO_MAX_WORKERS") {
            if val > 0 {
                config.scheduler.max_workers = val;
            }
        }

        // Memory configuration
        if let Some(val) = parse_env_usize("TEMPO_HEAP_SIZE") {
            config.memory.heap_size = val;
        }

        if let Some(val) = parse_env_usize("TEMPO_IMMORTAL_SIZE") {
            if val > 0 {
                config.memory.immortal_size = val;
            }
        }

        if let Some(val) = parse_env_usize("TEMPO_DEFAULT_SCOPE_SIZE") {
            if val > 0 {
                config.memory.default_scope_size = val;
            }
        }

        // Preallocated error storage
        if let Some(val) = parse_env_usize("TEMPO_MAX_MESSAGE_LENGTH") {
            config.exceptions.max_message_length = val;
        }

        if let Some(val) = parse_env_usize("TEMPO_MAX_STACK_TRACE_DEPTH") {
            config.exceptions.max_stack_trace_depth = val;
        }

        // Logging configuration
        if let Ok(val) = env::var("TEMPO_LOG_LEVEL") {
            if let Some(level) = LogLevel::parse(&val) {
                config.log.level = level;
            }
        }

        config
    }

    /// Validate the configuration and return any errors.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let sched = &self.scheduler;

        if sched.min_priority > sched.max_priority {
            return Err(ConfigError::InvalidValue {
                field: "scheduler.max_priority".into(),
                message: "must be at least min_priority".into(),
            });
        }

        if sched.norm_priority < sched.min_priority || sched.norm_priority > sched.max_priority {
            return Err(ConfigError::InvalidValue {
                field: "scheduler.norm_priority".into(),
                message: "must lie within [min_priority, max_priority]".into(),
            });
        }

        if sched.max_workers == 0 {
            return Err(ConfigError::InvalidValue {
                field: "scheduler.max_workers".into(),
                message: "must be at least 1".into(),
            });
        }

        if self.memory.immortal_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "memory.immortal_size".into(),
                message: "must be at least 1 byte".into(),
            });
        }

        if self.memory.default_scope_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "memory.default_scope_size".into(),
                message: "must be at least 1 byte".into(),
            });
        }

        if self.exceptions.max_message_length == 0 {
            return Err(ConfigError::InvalidValue {
                field: "exceptions.max_message_length".into(),
                message: "must be at least 1 byte".into(),
            });
        }

        Ok(())
    }
}

/// Configuration error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Invalid configuration value.
    #[error("invalid configuration for '{field}': {message}")]
    InvalidValue {
        /// Field name.
        field: String,
        /// Error message.
        message: String,
    },
}

/// Builder for RuntimeConfig.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
    norm_set: bool,
}

impl RuntimeConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the realtime priority range.
    ///
    /// The normal priority follows `min` unless set explicitly.
    pub fn priority_range(mut self, min: i32, max: i32) -> Self {
        self.config.scheduler.min_priority = min;
        self.config.scheduler.max_priority = max;
        self
    }

    /// Set the default realtime priority.
    pub fn norm_priority(mut self, priority: i32) -> Self {
        self.config.scheduler.norm_priority = priority;
        self.norm_set = true;
        self
    }

    /// Set the release runner pool ceiling.
    pub fn max_workers(mut self, n: usize) -> Self {
        self.config.scheduler.max_workers = n;
        self
    }

    /// Set the heap budget in bytes (0 = unlimited).
    pub fn heap_size(mut self, size: usize) -> Self {
        self.config.memory.heap_size = size;
        self
    }

    /// Set the immortal budget in bytes.
    pub fn immortal_size(mut self, size: usize) -> Self {
        self.config.memory.immortal_size = size;
        self
    }

    /// Set the default scoped region budget in bytes.
    pub fn default_scope_size(mut self, size: usize) -> Self {
        self.config.memory.default_scope_size = size;
        self
    }

    /// Set the preallocated error storage sizes.
    pub fn exceptions(mut self, exceptions: ExceptionStorageConfig) -> Self {
        self.config.exceptions = exceptions;
        self
    }

    /// Set the log level.
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config.log.level = level;
        self
    }

    /// Build the configuration.
    ///
    /// This validates the configuration and returns an error if invalid.
    pub fn build(self) -> Result<RuntimeConfig, ConfigError> {
        let config = self.build_unchecked();
        config.validate()?;
        Ok(config)
    }

    /// Build the configuration without validation.
    pub fn build_unchecked(mut self) -> RuntimeConfig {
        if !self.norm_set {
            self.config.scheduler.norm_priority = self.config.scheduler.min_priority;
        }
        self.config
    }
}

/// Parse an environment variable as usize.
fn parse_env_usize(name: &str) -> Option<usize> {
    env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

/// Parse an environment variable as i32.
fn parse_env_i32(name: &str) -> Option<i32> {
    env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

/// Get the number of available CPUs.
pub(crate) fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
