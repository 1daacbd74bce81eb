//! Bounded ring shared by both queue variants.
//!
//! `head` and `tail` are monotonically increasing sequence numbers; slot
//! `seq % capacity` holds element `seq`. The ring itself assumes one
//! producer and one consumer at a time. The queue types serialize the
//! blocking side so only the wait-free side runs unsynchronized.

use std::sync::atomic::{fence, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::error::{raise, RtError, RtResult};
use crate::interrupt::InterruptToken;

pub(crate) struct Ring<T> {
    slots: Box<[Mutex<Option<T>>]>,
    /// Sequence number of the next element to read.
    head: AtomicUsize,
    /// Sequence number of the next element to write.
    tail: AtomicUsize,
}

impl<T> Ring<T> {
    pub(crate) fn new(capacity: usize) -> RtResult<Self> {
        if capacity == 0 {
            return Err(raise(RtError::IllegalArgument("queue capacity must be positive")));
        }
        Ok(Self {
            slots: (0..capacity).map(|_| Mutex::new(None)).collect(),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        })
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn len(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        tail.saturating_sub(head)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn is_full(&self) -> bool {
        self.len() >= self.capacity()
    }

    fn slot(&self, seq: usize) -> &Mutex<Option<T>> {
        &self.slots[seq % self.slots.len()]
    }

    /// Append `value`, handing it back if the ring is full.
    pub(crate) fn push(&self, value: T) -> Result<(), T> {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if tail - head >= self.capacity() {
            return Err(value);
        }
        *self.slot(tail).lock() = Some(value);
        self.tail.store(tail + 1, Ordering::Release);
        Ok(())
    }

    /// Remove the oldest element.
    pub(crate) fn pop(&self) -> Option<T> {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        let mut slot = self.slot(head).lock();
        let value = slot.take();
        // Advanced under the slot lock so `force` can tell a consumed slot.
        self.head.store(head + 1, Ordering::Release);
        value
    }

    /// Append `value`, overwriting the newest element when full.
    ///
    /// Returns whether occupied data was overwritten.
    pub(crate) fn force(&self, value: T) -> bool {
        let mut value = value;
        loop {
            value = match self.push(value) {
                Ok(()) => return false,
                Err(value) => value,
            };
            let newest = self.tail.load(Ordering::Relaxed) - 1;
            let mut slot = self.slot(newest).lock();
            if self.head.load(Ordering::Acquire) <= newest && slot.is_some() {
                *slot = Some(value);
                return true;
            }
            // The reader consumed the newest element meanwhile; room is free now.
        }
    }

    pub(crate) fn clear(&self) {
        while self.pop().is_some() {}
    }
}

/// Parks the blocking side of a queue until the other side makes progress.
///
/// The non-blocking side only touches the lock when someone is waiting.
pub(crate) struct Signal {
    waiting: AtomicUsize,
    lock: Mutex<()>,
    cond: Condvar,
}

impl Signal {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            waiting: AtomicUsize::new(0),
            lock: Mutex::new(()),
            cond: Condvar::new(),
        })
    }

    /// Wake waiters after a state change made visible before this call.
    pub(crate) fn notify(&self) {
        fence(Ordering::SeqCst);
        if self.waiting.load(Ordering::SeqCst) > 0 {
            self.wake_all();
        }
    }

    fn wake_all(&self) {
        let _guard = self.lock.lock();
        self.cond.notify_all();
    }

    /// Block while `blocked()` holds, failing with `Interrupted` if `token` fires.
    pub(crate) fn wait_while(self: &Arc<Self>, token: &InterruptToken, mut blocked: impl FnMut() -> bool) -> RtResult<()> {
        token.check()?;
        if !blocked() {
            return Ok(());
        }

        let _waker = {
            let signal = Arc::clone(self);
            token.register_waker(move || signal.wake_all())
        };
        let mut guard = self.lock.lock();
        self.waiting.fetch_add(1, Ordering::SeqCst);
        fence(Ordering::SeqCst);
        let outcome = loop {
            if !blocked() {
                break Ok(());
            }
            if token.is_interruptible() && token.is_pending() {
                break token.check();
            }
            self.cond.wait(&mut guard);
        };
        self.waiting.fetch_sub(1, Ordering::SeqCst);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(matches!(Ring::<u8>::new(0), Err(RtError::IllegalArgument(_))));
    }

    #[test]
    fn test_fifo_and_wraparound() {
        let ring = Ring::new(3).unwrap();
        for round in 0..5 {
            assert!(ring.push(round * 10).is_ok());
            assert!(ring.push(round * 10 + 1).is_ok());
            assert_eq!(ring.pop(), Some(round * 10));
            assert_eq!(ring.pop(), Some(round * 10 + 1));
        }
        assert!(ring.is_empty());
    }

    #[test]
    fn test_push_full_returns_value() {
        let ring = Ring::new(1).unwrap();
        assert!(ring.push('a').is_ok());
        assert!(ring.is_full());
        assert_eq!(ring.push('b'), Err('b'));
    }

    #[test]
    fn test_force_overwrites_newest() {
        let ring = Ring::new(2).unwrap();
        assert!(!ring.force(1));
        assert!(!ring.force(2));
        assert!(ring.force(3));
        assert_eq!(ring.pop(), Some(1));
        assert_eq!(ring.pop(), Some(3));
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn test_signal_wait_is_interruptible() {
        let signal = Signal::new();
        let token = InterruptToken::new();
        let waiter = {
            let (signal, token) = (signal.clone(), token.clone());
            std::thread::spawn(move || signal.wait_while(&token, || true))
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        token.interrupt();
        assert_eq!(waiter.join().unwrap(), Err(RtError::Interrupted));
    }
}
