//! Queue with a wait-free writer and blocking readers.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use super::ring::{Ring, Signal};
use crate::error::RtResult;
use crate::memory::current_interrupt;

/// Bounded FIFO whose writer never blocks.
///
/// Meant for a single writer, typically a no-heap context handing data to
/// heap-using readers. Concurrent writers must coordinate among themselves.
/// Readers are serialized internally.
pub struct WaitFreeWriteQueue<T> {
    ring: Ring<T>,
    readers: Mutex<()>,
    data: Arc<Signal>,
}

impl<T> WaitFreeWriteQueue<T> {
    /// Queue holding at most `capacity` elements.
    pub fn new(capacity: usize) -> RtResult<Self> {
        Ok(Self {
            ring: Ring::new(capacity)?,
            readers: Mutex::new(()),
            data: Signal::new(),
        })
    }

    /// Append `value` without blocking.
    ///
    /// Returns the value back if the queue is full.
    pub fn write(&self, value: T) -> Result<(), T> {
        self.ring.push(value)?;
        self.data.notify();
        Ok(())
    }

    /// Append `value` without blocking, overwriting the newest element if
    /// the queue is full.
    ///
    /// Returns whether occupied data was overwritten.
    pub fn force(&self, value: T) -> bool {
        let overwrote = self.ring.force(value);
        self.data.notify();
        overwrote
    }

    /// Remove the oldest element, blocking until one is available.
    ///
    /// Fails with `Interrupted` if the calling context is interrupted while
    /// waiting.
    pub fn read(&self) -> RtResult<T> {
        let token = current_interrupt();
        let _reader = self.readers.lock();
        loop {
            if let Some(value) = self.ring.pop() {
                return Ok(value);
            }
            self.data.wait_while(&token, || self.ring.is_empty())?;
        }
    }

    /// Maximum number of elements.
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// Number of queued elements.
    pub fn size(&self) -> usize {
        self.ring.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Whether the queue is full.
    pub fn is_full(&self) -> bool {
        self.ring.is_full()
    }

    /// Discard every queued element.
    pub fn clear(&self) {
        let _reader = self.readers.lock();
        self.ring.clear();
    }
}

impl<T> fmt::Debug for WaitFreeWriteQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitFreeWriteQueue")
            .field("capacity", &self.capacity())
            .field("size", &self.size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RtError;
    use crate::interrupt::InterruptToken;
    use crate::memory::{ExecutionContext, MemoryArea};
    use crate::monitor::TaskControl;
    use std::time::Duration;

    #[test]
    fn test_write_then_read() {
        let queue = WaitFreeWriteQueue::new(1).unwrap();
        assert!(queue.write(42).is_ok());
        assert_eq!(queue.write(43), Err(43));
        assert_eq!(queue.read(), Ok(42));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_force_when_full() {
        let queue = WaitFreeWriteQueue::new(2).unwrap();
        assert!(!queue.force("a"));
        assert!(!queue.force("b"));
        assert!(queue.force("c"));
        assert_eq!(queue.size(), 2);
        assert_eq!(queue.read(), Ok("a"));
        assert_eq!(queue.read(), Ok("c"));
    }

    #[test]
    fn test_read_blocks_until_write() {
        let queue = Arc::new(WaitFreeWriteQueue::new(4).unwrap());
        let reader = {
            let queue = queue.clone();
            std::thread::spawn(move || queue.read())
        };
        std::thread::sleep(Duration::from_millis(20));
        queue.write(7u32).unwrap();
        assert_eq!(reader.join().unwrap(), Ok(7));
    }

    #[test]
    fn test_concurrent_readers_see_each_value_once() {
        let queue = Arc::new(WaitFreeWriteQueue::new(8).unwrap());
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let queue = queue.clone();
                std::thread::spawn(move || (0..25).map(|_| queue.read().unwrap()).collect::<Vec<u32>>())
            })
            .collect();

        for v in 0..100u32 {
            let mut value = v;
            while let Err(back) = queue.write(value) {
                value = back;
                std::thread::yield_now();
            }
        }

        let mut seen: Vec<u32> = readers.into_iter().flat_map(|r| r.join().unwrap()).collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_blocked_read_is_interrupted() {
        let queue: Arc<WaitFreeWriteQueue<u8>> = Arc::new(WaitFreeWriteQueue::new(1).unwrap());
        let token = InterruptToken::new();
        let reader = {
            let (queue, token) = (queue.clone(), token.clone());
            std::thread::spawn(move || {
                let _cx = ExecutionContext::new(MemoryArea::heap(0), TaskControl::new("reader", 11))
                    .interrupt_token(token)
                    .install()
                    .unwrap();
                queue.read()
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        token.interrupt();
        assert_eq!(reader.join().unwrap(), Err(RtError::Interrupted));
    }
}
