//! # Memory Regions
//!
//! Allocation contexts with different lifetimes.
//!
//! ## Design
//!
//! - **Heap**: one per runtime, optionally budgeted, forbidden to no-heap
//!   contexts
//! - **Immortal**: one per runtime, never reclaimed
//! - **Scoped**: entered and left in stack order by execution contexts;
//!   reclaimed when the last context leaves it
//!
//! Every execution context keeps a scope stack. Entering a scoped region
//! pushes it; the matching pop runs on every exit path through an RAII
//! guard. A scoped region's parent is fixed by the first context that
//! enters it, and stays fixed until it is reclaimed (single-parent rule).
//!
//! ## Generations
//!
//! Objects are reached through [`Handle`]s that remember the generation of
//! their region at allocation time. Reclaiming a scoped region bumps its
//! generation, so a handle that escaped the scope is detected as stale
//! instead of silently observing recycled memory.
//!
//! ## Assignment Rule
//!
//! A reference into region A may be stored in an object of region B only if
//! A outlives B: same region, Heap or Immortal, or a scoped ancestor of B.
//! [`RefField`] enforces the rule on every store.

mod context;
mod handle;
mod params;
mod region;

pub use context::{current_area, current_interrupt, current_task, scope_depth, ContextGuard, ExecutionContext};
pub use handle::{check_assignment, Handle, RefField};
pub use params::{MemoryLimits, MemoryParameters};
pub use region::{AreaGuard, MemoryArea, RegionKind};

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Generation counter for detecting stale references.
pub type Generation = u32;

/// Reserved generation values.
pub mod generation {
    use super::Generation;

    /// First generation of every region.
    pub const FIRST: Generation = 1;
}

/// Region identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionId(pub u64);

impl RegionId {
    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "region#{}", self.0)
    }
}

/// Global region ID counter.
static NEXT_REGION_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a new unique region ID.
pub(crate) fn next_region_id() -> RegionId {
    RegionId(NEXT_REGION_ID.fetch_add(1, Ordering::Relaxed))
}
