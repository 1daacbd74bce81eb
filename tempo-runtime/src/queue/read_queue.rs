//! Queue with a wait-free reader and blocking writers.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use super::ring::{Ring, Signal};
use crate::error::{raise, RtError, RtResult};
use crate::memory::current_interrupt;

/// Bounded FIFO whose reader never blocks.
///
/// Meant for a single reader, typically a no-heap context draining data
/// produced by heap-using writers. Writers are serialized internally.
pub struct WaitFreeReadQueue<T> {
    ring: Ring<T>,
    writers: Mutex<()>,
    space: Arc<Signal>,
    /// Present when constructed with notification enabled.
    data: Option<Arc<Signal>>,
}

impl<T> WaitFreeReadQueue<T> {
    /// Queue holding at most `capacity` elements.
    ///
    /// With `notify` set, readers may park in [`WaitFreeReadQueue::wait_for_data`].
    pub fn new(capacity: usize, notify: bool) -> RtResult<Self> {
        Ok(Self {
            ring: Ring::new(capacity)?,
            writers: Mutex::new(()),
            space: Signal::new(),
            data: notify.then(Signal::new),
        })
    }

    /// Remove the oldest element without blocking.
    pub fn read(&self) -> Option<T> {
        let value = self.ring.pop()?;
        self.space.notify();
        Some(value)
    }

    /// Append `value`, blocking while the queue is full.
    ///
    /// Fails with `Interrupted` if the calling context is interrupted while
    /// waiting.
    pub fn write(&self, value: T) -> RtResult<()> {
        let token = current_interrupt();
        let _writer = self.writers.lock();
        let mut value = value;
        loop {
            match self.ring.push(value) {
                Ok(()) => break,
                Err(back) => value = back,
            }
            self.space.wait_while(&token, || self.ring.is_full())?;
        }
        if let Some(data) = &self.data {
            data.notify();
        }
        Ok(())
    }

    /// Block until the queue holds data.
    ///
    /// Fails with `IllegalState` unless the queue was created with
    /// notification enabled.
    pub fn wait_for_data(&self) -> RtResult<()> {
        let Some(data) = &self.data else {
            return Err(raise(RtError::IllegalState("queue was created without notification")));
        };
        data.wait_while(&current_interrupt(), || self.ring.is_empty())
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
    ///
    /// Runs on the reader side.
    pub fn clear(&self) {
        self.ring.clear();
        self.space.notify();
    }
}

impl<T> fmt::Debug for WaitFreeReadQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitFreeReadQueue")
            .field("capacity", &self.capacity())
            .field("size", &self.size())
            .field("notify", &self.data.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_read_empty_is_none() {
        let queue: WaitFreeReadQueue<u8> = WaitFreeReadQueue::new(2, false).unwrap();
        assert_eq!(queue.read(), None);
    }

    #[test]
    fn test_write_blocks_until_read() {
        let queue = Arc::new(WaitFreeReadQueue::new(1, false).unwrap());
        queue.write(1).unwrap();
        let writer = {
            let queue = queue.clone();
            std::thread::spawn(move || queue.write(2))
        };
        std::thread::sleep(Duration::from_millis(20));
        assert!(queue.is_full());
        assert_eq!(queue.read(), Some(1));
        assert_eq!(writer.join().unwrap(), Ok(()));
        assert_eq!(queue.read(), Some(2));
    }

    #[test]
    fn test_wait_for_data_requires_notification() {
        let queue: WaitFreeReadQueue<u8> = WaitFreeReadQueue::new(1, false).unwrap();
        assert!(matches!(queue.wait_for_data(), Err(RtError::IllegalState(_))));
    }

    #[test]
    fn test_wait_for_data_wakes_on_write() {
        let queue = Arc::new(WaitFreeReadQueue::new(4, true).unwrap());
        let waiter = {
            let queue = queue.clone();
            std::thread::spawn(move || {
                queue.wait_for_data()?;
                Ok::<_, RtError>(queue.read())
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        queue.write("payload").unwrap();
        assert_eq!(waiter.join().unwrap(), Ok(Some("payload")));
    }

    #[test]
    fn test_many_writers_one_reader() {
        let queue = Arc::new(WaitFreeReadQueue::new(4, true).unwrap());
        let writers: Vec<_> = (0..4u32)
            .map(|w| {
                let queue = queue.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        queue.write(w * 1000 + i).unwrap();
                    }
                })
            })
            .collect();

        let mut received = Vec::new();
        while received.len() < 200 {
            match queue.read() {
                Some(v) => received.push(v),
                None => queue.wait_for_data().unwrap(),
            }
        }
        for w in writers {
            w.join().unwrap();
        }

        // Per-writer order is preserved.
        for w in 0..4u32 {
            let mine: Vec<u32> = received.iter().copied().filter(|v| v / 1000 == w).collect();
            assert_eq!(mine, (0..50).map(|i| w * 1000 + i).collect::<Vec<_>>());
        }
    }
}
