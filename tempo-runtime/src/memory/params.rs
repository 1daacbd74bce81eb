//! Per-schedulable memory budgets.

use std::sync::Arc;

use parking_lot::RwLock;

/// Allocation limits of a schedulable.
///
/// One parameter object may be shared by many schedulables. Changes made
/// through the setters are seen by every one of them at its next allocation.
#[derive(Debug, Default)]
pub struct MemoryParameters {
    limits: RwLock<MemoryLimits>,
}

/// Snapshot of [`MemoryParameters`]. `None` means no limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryLimits {
    /// Bytes the schedulable may allocate in its initial region.
    pub max_memory_area: Option<usize>,
    /// Bytes the schedulable may allocate in the immortal region.
    pub max_immortal: Option<usize>,
    /// Heap bytes the schedulable may allocate per second.
    pub allocation_rate: Option<usize>,
}

impl MemoryParameters {
    /// Parameters without any limit.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Parameters with the given limits.
    pub fn with_limits(limits: MemoryLimits) -> Arc<Self> {
        Arc::new(Self {
            limits: RwLock::new(limits),
        })
    }

    /// Current limits.
    pub fn limits(&self) -> MemoryLimits {
        *self.limits.read()
    }

    /// Limit allocation in the initial region.
    pub fn set_max_memory_area(&self, bytes: Option<usize>) -> &Self {
        self.limits.write().max_memory_area = bytes;
        self
    }

    /// Limit allocation in the immortal region.
    pub fn set_max_immortal(&self, bytes: Option<usize>) -> &Self {
        self.limits.write().max_immortal = bytes;
        self
    }

    /// Limit the heap allocation rate, in bytes per second.
    pub fn set_allocation_rate(&self, bytes_per_second: Option<usize>) -> &Self {
        self.limits.write().allocation_rate = bytes_per_second;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fluent_setters() {
        let params = MemoryParameters::new();
        params
            .set_max_memory_area(Some(1024))
            .set_max_immortal(Some(64))
            .set_allocation_rate(None);
        assert_eq!(
            params.limits(),
            MemoryLimits {
                max_memory_area: Some(1024),
                max_immortal: Some(64),
                allocation_rate: None,
            }
        );
    }
}
