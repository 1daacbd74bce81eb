//! Asynchronous Interruption
//!
//! Every execution context owns an [`InterruptToken`]. Interrupting a context
//! sets a pending flag; the flag is observed at interruption points (blocking
//! queue operations, release waits, [`InterruptToken::check`]).
//!
//! # Deferral
//!
//! Code that must not be torn down midway runs under
//! [`InterruptToken::defer`]. While a deferral guard is alive the flag stays
//! pending and interruption points succeed; the first interruption point after
//! the last guard drops observes it. Deferral delays delivery, it never
//! drops an interrupt.
//!
//! # Example
//!
//! ```rust,ignore
//! use tempo_runtime::interrupt::InterruptToken;
//!
//! let token = InterruptToken::new();
//! let worker_token = token.clone();
//!
//! std::thread::spawn(move || {
//!     let outcome = worker_token.run_interruptible(|t| {
//!         loop {
//!             t.check()?;
//!             // Do work...
//!         }
//!     });
//!     assert!(outcome.unwrap().is_none());
//! });
//!
//! token.interrupt();
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{RtError, RtResult};

/// Counter for generating unique interrupt token IDs.
static TOKEN_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

type Waker = Arc<dyn Fn() + Send + Sync>;

/// Shared state behind a token.
struct InterruptState {
    /// Whether an interrupt is pending.
    pending: AtomicBool,
    /// Number of live deferral guards.
    deferrals: AtomicUsize,
    /// Condition variable for interruptible sleeps.
    notify: (Mutex<()>, Condvar),
    /// Callbacks that wake blocking calls parked elsewhere.
    wakers: Mutex<Vec<(u64, Waker)>>,
    /// Next waker registration id.
    next_waker: AtomicU64,
    /// Timestamp of the most recent interrupt.
    interrupted_at: Mutex<Option<Instant>>,
}

impl InterruptState {
    fn new() -> Self {
        Self {
            pending: AtomicBool::new(false),
            deferrals: AtomicUsize::new(0),
            notify: (Mutex::new(()), Condvar::new()),
            wakers: Mutex::new(Vec::new()),
            next_waker: AtomicU64::new(1),
            interrupted_at: Mutex::new(None),
        }
    }
}

impl std::fmt::Debug for InterruptState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterruptState")
            .field("pending", &self.pending.load(Ordering::Relaxed))
            .field("deferrals", &self.deferrals.load(Ordering::Relaxed))
            .finish()
    }
}

/// Pending-interrupt flag of one execution context.
///
/// Tokens are cheap to clone; clones share state.
#[derive(Debug, Clone)]
pub struct InterruptToken {
    /// Unique token ID.
    id: u64,
    /// Shared state.
    state: Arc<InterruptState>,
}

impl Default for InterruptToken {
    fn default() -> Self {
        Self::new()
    }
}

impl InterruptToken {
    /// Create a token with no pending interrupt.
    pub fn new() -> Self {
        Self {
            id: TOKEN_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            state: Arc::new(InterruptState::new()),
        }
    }

    /// Get the token ID.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Post an interrupt and wake any blocking call of this context.
    pub fn interrupt(&self) {
        self.state.pending.store(true, Ordering::SeqCst);
        *self.state.interrupted_at.lock() = Some(Instant::now());

        {
            let (lock, cvar) = &self.state.notify;
            let _guard = lock.lock();
            cvar.notify_all();
        }

        let wakers: Vec<Waker> = self.state.wakers.lock().iter().map(|(_, w)| w.clone()).collect();
        for wake in wakers {
            wake();
        }
    }

    /// Whether an interrupt is pending (delivered or not).
    pub fn is_pending(&self) -> bool {
        self.state.pending.load(Ordering::SeqCst)
    }

    /// Whether interruption points currently deliver interrupts.
    pub fn is_interruptible(&self) -> bool {
        self.state.deferrals.load(Ordering::SeqCst) == 0
    }

    /// Time of the most recent interrupt.
    pub fn interrupted_at(&self) -> Option<Instant> {
        *self.state.interrupted_at.lock()
    }

    /// Clear a pending interrupt, returning whether one was pending.
    pub fn clear(&self) -> bool {
        self.state.pending.swap(false, Ordering::SeqCst)
    }

    /// Interruption point.
    ///
    /// Consumes a pending interrupt and fails with `Interrupted`, unless
    /// delivery is deferred.
    pub fn check(&self) -> RtResult<()> {
        if self.is_interruptible() && self.clear() {
            return Err(RtError::Interrupted);
        }
        Ok(())
    }

    /// Defer delivery until the returned guard is dropped.
    pub fn defer(&self) -> DeferGuard {
        self.state.deferrals.fetch_add(1, Ordering::SeqCst);
        DeferGuard {
            state: self.state.clone(),
        }
    }

    /// Interruptible sleep.
    pub fn sleep(&self, duration: Duration) -> RtResult<()> {
        self.check()?;
        let deadline = Instant::now().checked_add(duration);
        let (lock, cvar) = &self.state.notify;
        let mut guard = lock.lock();
        loop {
            if self.is_interruptible() && self.is_pending() {
                drop(guard);
                return self.check();
            }
            match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return Ok(());
                    }
                    cvar.wait_until(&mut guard, deadline);
                }
                None => cvar.wait(&mut guard),
            }
        }
    }

    /// Register a callback invoked on every interrupt.
    ///
    /// Blocking primitives parked on their own condition variables use this
    /// to be woken. The registration is removed when the guard drops.
    pub fn register_waker(&self, waker: impl Fn() + Send + Sync + 'static) -> WakerRegistration {
        let id = self.state.next_waker.fetch_add(1, Ordering::Relaxed);
        self.state.wakers.lock().push((id, Arc::new(waker)));
        WakerRegistration {
            id,
            state: self.state.clone(),
        }
    }

    /// Run `logic` as an interruptible region.
    ///
    /// Returns `Ok(None)` if the region was cut short by an interrupt, and
    /// propagates every other error.
    pub fn run_interruptible<T>(&self, logic: impl FnOnce(&InterruptToken) -> RtResult<T>) -> RtResult<Option<T>> {
        match logic(self) {
            Ok(value) => Ok(Some(value)),
            Err(RtError::Interrupted) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Keeps interrupt delivery deferred while alive.
#[derive(Debug)]
pub struct DeferGuard {
    state: Arc<InterruptState>,
}

impl Drop for DeferGuard {
    fn drop(&mut self) {
        self.state.deferrals.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Removes a waker registration on drop.
pub struct WakerRegistration {
    id: u64,
    state: Arc<InterruptState>,
}

impl Drop for WakerRegistration {
    fn drop(&mut self) {
        self.state.wakers.lock().retain(|(id, _)| *id != self.id);
    }
}

impl std::fmt::Debug for WakerRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WakerRegistration").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_interrupt_basic() {
        let token = InterruptToken::new();
        assert!(!token.is_pending());
        token.interrupt();
        assert!(token.is_pending());
        assert!(token.interrupted_at().is_some());
    }

    #[test]
    fn test_check_consumes_interrupt() {
        let token = InterruptToken::new();
        token.interrupt();
        assert_eq!(token.check(), Err(RtError::Interrupted));
        assert!(token.check().is_ok());
    }

    #[test]
    fn test_deferral_delays_delivery() {
        let token = InterruptToken::new();
        {
            let _defer = token.defer();
            token.interrupt();
            assert!(!token.is_interruptible());
            assert!(token.check().is_ok());
            assert!(token.is_pending());
        }
        assert_eq!(token.check(), Err(RtError::Interrupted));
    }

    #[test]
    fn test_sleep_times_out() {
        let token = InterruptToken::new();
        let start = Instant::now();
        assert!(token.sleep(Duration::from_millis(10)).is_ok());
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[test]
    fn test_sleep_is_interrupted() {
        let token = InterruptToken::new();
        let sleeper = {
            let token = token.clone();
            std::thread::spawn(move || token.sleep(Duration::from_secs(30)))
        };
        std::thread::sleep(Duration::from_millis(20));
        token.interrupt();
        assert_eq!(sleeper.join().unwrap(), Err(RtError::Interrupted));
    }

    #[test]
    fn test_wakers_run_until_unregistered() {
        let token = InterruptToken::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let registration = {
            let hits = hits.clone();
            token.register_waker(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        };
        token.interrupt();
        drop(registration);
        token.interrupt();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_run_interruptible() {
        let token = InterruptToken::new();
        token.interrupt();
        let outcome = token.run_interruptible(|t| {
            t.check()?;
            Ok(42)
        });
        assert_eq!(outcome, Ok(None));

        let outcome = token.run_interruptible(|_| Ok(7));
        assert_eq!(outcome, Ok(Some(7)));
    }
}
