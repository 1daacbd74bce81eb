//! # Asynchronous Events
//!
//! An [`AsyncEvent`] fans fires out to a set of [`AsyncEventHandler`]s.
//! Each handler queues the arrival under its release parameters and asks
//! its release runner for a worker; the runner runs the handler's logic
//! inside the handler's initial memory area, one release at a time.
//!
//! ```text
//!   fire(payload)
//!        │
//!        ▼
//!   AsyncEvent ── snapshot of handlers (copy-on-write)
//!        │
//!        ├──► handler A: MIT rule → overflow policy → pending += 1 → runner.release
//!        └──► handler B: ...
//!                                   │
//!                                   ▼
//!                     worker: install context → enter area → logic(cx)
//! ```
//!
//! ## Capabilities
//!
//! Behavior shared by events, handlers, timers and realtime threads is
//! expressed through three small traits rather than a type hierarchy:
//!
//! - [`Fireable`]: something that can be fired with a [`Payload`]
//! - [`Schedulable`]: something the scheduler runs at a priority
//! - [`RegionScoped`]: something that runs inside a memory area

mod async_event;
mod handler;
mod payload;

use std::sync::Arc;

pub use async_event::AsyncEvent;
pub(crate) use async_event::EventCore;
pub use handler::{AsyncEventHandler, HandlerBuilder, HandlerState, ReleaseContext};
pub use payload::Payload;

use crate::affinity::Affinity;
use crate::error::RtResult;
use crate::memory::{MemoryArea, MemoryParameters};
use crate::release::ReleaseParameters;
use crate::scheduler::PriorityParameters;

/// Something that can be fired.
pub trait Fireable: Send + Sync {
    /// Fire carrying `payload`.
    fn fire_payload(&self, payload: Payload) -> RtResult<()>;

    /// Fire without data.
    fn fire(&self) -> RtResult<()> {
        self.fire_payload(Payload::None)
    }

    /// Whether fires currently reach handlers.
    fn is_enabled(&self) -> bool;
}

/// Something run by the scheduler.
pub trait Schedulable: Send + Sync {
    /// Name for logs.
    fn name(&self) -> &str;

    /// Current scheduling parameters.
    fn priority(&self) -> PriorityParameters;

    /// Change the scheduling parameters; takes effect at the next release.
    fn set_priority(&self, params: PriorityParameters) -> RtResult<()>;

    /// Bound release parameters.
    fn release_parameters(&self) -> Arc<ReleaseParameters>;

    /// Bind other release parameters; takes effect at the next release.
    fn set_release_parameters(&self, params: Arc<ReleaseParameters>);

    /// Processor affinity.
    fn affinity(&self) -> Affinity;

    /// Raise an asynchronous interrupt.
    fn interrupt(&self);
}

/// Something that runs inside a memory area.
pub trait RegionScoped {
    /// Area the logic runs in.
    fn initial_area(&self) -> &MemoryArea;

    /// Whether heap access is forbidden.
    fn is_no_heap(&self) -> bool;

    /// Allocation budgets, if any.
    fn memory_parameters(&self) -> Option<Arc<MemoryParameters>>;
}
