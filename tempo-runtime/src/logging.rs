//! Logging Infrastructure
//!
//! The runtime emits structured events through `tracing`. Fields carry the
//! identifiers a reader needs to correlate events across threads:
//!
//! - `handler`: handler name
//! - `region`: memory region id
//! - `priority`: active or requested priority
//! - `worker`: release runner worker index
//!
//! Applications that already install a subscriber need nothing from this
//! module. Everyone else calls [`init`] once with the configured
//! [`LogConfig`].
//!
//! # Example
//!
//! ```rust,ignore
//! use tempo_runtime::{config::RuntimeConfig, logging};
//!
//! let config = RuntimeConfig::from_env();
//! logging::init(&config.log);
//! ```

use std::sync::atomic::{AtomicBool, Ordering};

use tracing_subscriber::EnvFilter;

use crate::config::{LogConfig, LogLevel};

/// Whether [`init`] already ran in this process.
static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Install a `tracing_subscriber` fmt subscriber for `config`.
///
/// `RUST_LOG` takes precedence over the configured level when set. Calling
/// this more than once, or after another subscriber has been installed, is a
/// no-op. Returns whether this call installed the subscriber.
pub fn init(config: &LogConfig) -> bool {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return false;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter_directive(config.level)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.with_target)
        .with_thread_names(config.with_thread_names)
        .try_init()
        .is_ok()
}

/// Filter directive for `level`, scoped to this crate.
pub fn filter_directive(level: LogLevel) -> String {
    format!("tempo_runtime={}", level.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_directive() {
        assert_eq!(filter_directive(LogLevel::Debug), "tempo_runtime=debug");
        assert_eq!(filter_directive(LogLevel::Off), "tempo_runtime=off");
    }

    #[test]
    fn test_init_is_idempotent() {
        let config = LogConfig::default();
        let _ = init(&config);
        assert!(!init(&config));
    }
}
