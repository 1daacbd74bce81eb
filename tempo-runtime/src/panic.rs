//! Panic Containment
//!
//! Handler logic runs on shared worker threads. A panic inside one release
//! must not take the worker, or later releases of the same handler, down
//! with it. [`catch_panic`] turns an unwinding panic into a
//! [`CaughtPanic`] value the caller can log and move past.
//!
//! # Example
//!
//! ```rust,ignore
//! use tempo_runtime::panic::{catch_panic_unchecked, CatchResult};
//!
//! match catch_panic_unchecked(|| logic.handle_async_event()) {
//!     CatchResult::Ok(()) => {}
//!     CatchResult::Panicked(info) => tracing::error!(message = info.message(), "handler panicked"),
//! }
//! ```

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};

/// Number of panics contained since process start.
static CAUGHT_COUNT: AtomicU64 = AtomicU64::new(0);

/// A panic that was caught and contained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaughtPanic {
    /// Panic message.
    message: String,
    /// Name of the thread that panicked.
    thread_name: Option<String>,
    /// Sequence number among contained panics.
    count: u64,
}

impl CaughtPanic {
    fn from_payload(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        };

        Self {
            message,
            thread_name: std::thread::current().name().map(|s| s.to_string()),
            count: CAUGHT_COUNT.fetch_add(1, Ordering::SeqCst) + 1,
        }
    }

    /// Get the panic message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Get the thread name, if available.
    pub fn thread_name(&self) -> Option<&str> {
        self.thread_name.as_deref()
    }

    /// Sequence number of this panic.
    pub fn count(&self) -> u64 {
        self.count
    }
}

/// Result of catching a panic.
#[derive(Debug)]
pub enum CatchResult<T> {
    /// The closure completed successfully.
    Ok(T),
    /// The closure panicked.
    Panicked(CaughtPanic),
}

impl<T> CatchResult<T> {
    /// Returns true if the result is Ok.
    pub fn is_ok(&self) -> bool {
        matches!(self, CatchResult::Ok(_))
    }

    /// Returns true if the closure panicked.
    pub fn is_panicked(&self) -> bool {
        matches!(self, CatchResult::Panicked(_))
    }

    /// Converts to a standard Result.
    pub fn into_result(self) -> Result<T, CaughtPanic> {
        match self {
            CatchResult::Ok(v) => Ok(v),
            CatchResult::Panicked(info) => Err(info),
        }
    }
}

/// Catch panics from a closure.
pub fn catch_panic<F, R>(f: F) -> CatchResult<R>
where
    F: FnOnce() -> R + std::panic::UnwindSafe,
{
    match std::panic::catch_unwind(f) {
        Ok(value) => CatchResult::Ok(value),
        Err(payload) => CatchResult::Panicked(CaughtPanic::from_payload(payload)),
    }
}

/// Catch panics from a closure that is not statically unwind-safe.
///
/// The caller asserts that state touched by `f` stays consistent if `f`
/// unwinds midway.
pub fn catch_panic_unchecked<F, R>(f: F) -> CatchResult<R>
where
    F: FnOnce() -> R,
{
    catch_panic(std::panic::AssertUnwindSafe(f))
}

/// Number of panics contained so far.
pub fn caught_count() -> u64 {
    CAUGHT_COUNT.load(Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catch_ok() {
        let result = catch_panic(|| 42);
        assert!(result.is_ok());
        assert_eq!(result.into_result(), Ok(42));
    }

    #[test]
    fn test_catch_str_panic() {
        let before = caught_count();
        let result: CatchResult<()> = catch_panic(|| panic!("boom"));
        assert!(result.is_panicked());
        let info = result.into_result().unwrap_err();
        assert_eq!(info.message(), "boom");
        assert!(info.count() > before);
    }

    #[test]
    fn test_caught_panic_names_its_thread() {
        let info = std::thread::Builder::new()
            .name("tempo-worker-7".into())
            .spawn(|| catch_panic::<_, ()>(|| panic!("in worker")).into_result().unwrap_err())
            .unwrap()
            .join()
            .unwrap();
        assert_eq!(info.thread_name(), Some("tempo-worker-7"));
        assert_eq!(info.message(), "in worker");
    }

    #[test]
    fn test_catch_formatted_panic() {
        let value = 7;
        let result: CatchResult<()> = catch_panic_unchecked(|| panic!("value was {}", value));
        assert_eq!(result.into_result().unwrap_err().message(), "value was 7");
    }
}
