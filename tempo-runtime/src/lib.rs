//! # Tempo Runtime
//!
//! Scoped-memory-aware priority scheduling and release runtime:
//!
//! - **Memory areas**: heap, immortal and reference-counted scoped regions
//!   with a single-parent rule and assignment checks
//! - **Monitors**: priority ceiling emulation and priority inheritance
//! - **Release model**: periodic, sporadic and aperiodic release
//!   parameters with arrival-queue overflow and minimum-interarrival policies
//! - **Events**: asynchronous events fanning out to handlers run by a
//!   priority-ordered release runner
//! - **Timers and threads**: one-shot and periodic timers, realtime threads
//! - **Wait-free queues**: single-sided non-blocking queues bridging no-heap
//!   and heap contexts
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                           RUNTIME                                │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐          │
//! │  │    Events    │  │    Timers    │  │   Threads    │          │
//! │  │  (event/)    │  │  (timer.rs)  │  │ (thread.rs)  │          │
//! │  └──────────────┘  └──────────────┘  └──────────────┘          │
//! │         │                 │                 │                   │
//! │         ▼                 ▼                 │                   │
//! │  ┌──────────────┐  ┌──────────────┐         │                   │
//! │  │   Runners    │  │ Dispatchers  │         │                   │
//! │  │ (runner.rs)  │  │(dispatcher.rs│         │                   │
//! │  └──────────────┘  └──────────────┘         │                   │
//! │         │                                   │                   │
//! │         └─────────────────┬─────────────────┘                   │
//! │                           ▼                                     │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐          │
//! │  │  Scheduler   │  │   Monitors   │  │    Memory    │          │
//! │  │(scheduler.rs)│  │ (monitor.rs) │  │  (memory/)   │          │
//! │  └──────────────┘  └──────────────┘  └──────────────┘          │
//! │                                                                  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod affinity;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod interrupt;
pub mod logging;
pub mod memory;
pub mod monitor;
pub mod panic;
pub mod queue;
pub mod release;
pub mod runner;
pub mod runtime;
pub mod scheduler;
pub mod thread;
pub mod time;
pub mod timer;

// Re-exports
pub use affinity::Affinity;
pub use config::{ConfigError, ExceptionStorageConfig, LogLevel, RuntimeConfig, RuntimeConfigBuilder};
pub use dispatcher::{ActiveEventDispatcher, DispatchSlot, TimeDispatcher};
pub use error::{ErrorKind, ErrorStorage, RtError, RtResult};
pub use event::{AsyncEvent, AsyncEventHandler, Fireable, HandlerState, Payload, RegionScoped, ReleaseContext, Schedulable};
pub use interrupt::InterruptToken;
pub use memory::{Handle, MemoryArea, MemoryParameters, RegionKind};
pub use monitor::{Monitor, MonitorControl, TaskControl};
pub use queue::{WaitFreeReadQueue, WaitFreeWriteQueue};
pub use release::{
    Admission, MinimumInterarrivalPolicy, PhasingPolicy, QueueOverflowPolicy, ReleaseKind, ReleaseParameters, StartTime,
};
pub use runner::{BoundReleaseRunner, FirstInFirstOutReleaseRunner, ReleaseRunner};
pub use runtime::{Runtime, RuntimeBuilder};
pub use scheduler::{FirstInFirstOutScheduler, PriorityParameters, Scheduler};
pub use thread::{RealtimeContext, RealtimeThread};
pub use time::{AbsoluteTime, Clock, ManualClock, MonotonicClock};
pub use timer::{OneShotTimer, PeriodicTimer};

/// Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
