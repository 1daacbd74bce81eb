//! # Wait-Free Queues
//!
//! Bounded FIFO queues that bridge contexts which must never block (or
//! never touch the heap) and contexts that may.
//!
//! - [`WaitFreeWriteQueue`]: the writer never blocks; `read` blocks.
//! - [`WaitFreeReadQueue`]: the reader never blocks; `write` blocks.
//!
//! Both share one ring implementation. The wait-free side takes no queue
//! lock on its fast path; the blocking side is serialized by a queue lock
//! and parks until the other side makes progress. Blocking calls observe
//! the calling context's interrupt token and fail with `Interrupted`.
//!
//! # Example
//!
//! ```rust,ignore
//! use tempo_runtime::queue::WaitFreeWriteQueue;
//!
//! let queue = WaitFreeWriteQueue::new(16)?;
//! queue.write(sample).ok();       // never blocks
//! let next = queue.read()?;       // blocks until data
//! ```

mod read_queue;
mod ring;
mod write_queue;

pub use read_queue::WaitFreeReadQueue;
pub use write_queue::WaitFreeWriteQueue;
