//! Per-thread execution context.
//!
//! An execution context is what a schedulable carries on the thread running
//! it: its scope stack, no-heap flag, task control block, interrupt token
//! and memory budgets. Release runners install the handler's context for
//! the duration of each release; realtime threads install theirs once.

use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::params::MemoryParameters;
use super::region::{MemoryArea, RegionKind};
use crate::error::{raise, RtError, RtResult};
use crate::interrupt::InterruptToken;
use crate::monitor::TaskControl;

thread_local! {
    static CONTEXT: RefCell<Option<ExecutionContext>> = const { RefCell::new(None) };
    static FALLBACK_TASK: Arc<TaskControl> = TaskControl::new("plain", 0);
    static FALLBACK_INTERRUPT: InterruptToken = InterruptToken::new();
}

/// Bytes a context allocated against its memory parameters.
#[derive(Debug)]
struct AllocationUsage {
    initial_area: usize,
    immortal: usize,
    window_start: Instant,
    window_bytes: usize,
}

impl AllocationUsage {
    fn new() -> Self {
        Self {
            initial_area: 0,
            immortal: 0,
            window_start: Instant::now(),
            window_bytes: 0,
        }
    }
}

/// State of the schedulable running on the current thread.
#[derive(Debug)]
pub struct ExecutionContext {
    pub(super) scopes: Vec<MemoryArea>,
    pub(super) current_override: Option<MemoryArea>,
    pub(super) no_heap: bool,
    initial_area: MemoryArea,
    task: Arc<TaskControl>,
    interrupt: InterruptToken,
    memory: Option<Arc<MemoryParameters>>,
    usage: AllocationUsage,
}

impl ExecutionContext {
    /// Context whose scope stack starts at `base` (the heap or immortal region).
    pub fn new(base: MemoryArea, task: Arc<TaskControl>) -> Self {
        Self {
            scopes: vec![base.clone()],
            current_override: None,
            no_heap: false,
            initial_area: base,
            task,
            interrupt: InterruptToken::new(),
            memory: None,
            usage: AllocationUsage::new(),
        }
    }

    /// Forbid every heap access from this context.
    pub fn no_heap(mut self, no_heap: bool) -> Self {
        self.no_heap = no_heap;
        self
    }

    /// Use `token` as this context's interrupt flag.
    pub fn interrupt_token(mut self, token: InterruptToken) -> Self {
        self.interrupt = token;
        self
    }

    /// Charge allocations against `params`.
    pub fn memory_parameters(mut self, params: Option<Arc<MemoryParameters>>) -> Self {
        self.memory = params;
        self
    }

    /// Region whose allocations count against the initial-area budget.
    ///
    /// Defaults to the base region.
    pub fn initial_area(mut self, area: MemoryArea) -> Self {
        self.initial_area = area;
        self
    }

    /// Install on the calling thread until the returned guard drops.
    ///
    /// A context already installed on the thread is restored afterwards.
    pub fn install(self) -> RtResult<ContextGuard> {
        if self.no_heap && self.scopes.iter().any(MemoryArea::is_heap) {
            return Err(raise(RtError::MemoryAccess("no-heap context cannot start in the heap")));
        }
        let previous = CONTEXT.with(|cell| cell.borrow_mut().replace(self));
        Ok(ContextGuard {
            previous,
            _not_send: PhantomData,
        })
    }

    /// Innermost scoped region on the scope stack.
    pub(super) fn innermost_scoped(&self) -> Option<&MemoryArea> {
        self.scopes.iter().rev().find(|a| a.is_scoped())
    }

    fn charge(&mut self, area: &MemoryArea, bytes: usize) -> RtResult<()> {
        if area.is_heap() && self.no_heap {
            return Err(raise(RtError::MemoryAccess("no-heap context allocated in the heap")));
        }
        if area.is_scoped() && !self.scopes.contains(area) {
            return Err(raise(RtError::InaccessibleArea(area.id())));
        }
        let Some(params) = &self.memory else {
            return Ok(());
        };
        let limits = params.limits();
        let out_of_memory = |used: usize, max: usize| {
            raise(RtError::OutOfMemory {
                region: area.id(),
                requested: bytes,
                remaining: max.saturating_sub(used),
            })
        };

        if area == &self.initial_area {
            if let Some(max) = limits.max_memory_area {
                if self.usage.initial_area.saturating_add(bytes) > max {
                    return Err(out_of_memory(self.usage.initial_area, max));
                }
            }
        }
        if area.kind() == RegionKind::Immortal {
            if let Some(max) = limits.max_immortal {
                if self.usage.immortal.saturating_add(bytes) > max {
                    return Err(out_of_memory(self.usage.immortal, max));
                }
            }
        }
        if area.is_heap() {
            if let Some(rate) = limits.allocation_rate {
                if self.usage.window_start.elapsed() >= Duration::from_secs(1) {
                    self.usage.window_start = Instant::now();
                    self.usage.window_bytes = 0;
                }
                if self.usage.window_bytes.saturating_add(bytes) > rate {
                    return Err(out_of_memory(self.usage.window_bytes, rate));
                }
                self.usage.window_bytes += bytes;
            }
        }

        if area == &self.initial_area {
            self.usage.initial_area += bytes;
        }
        if area.kind() == RegionKind::Immortal {
            self.usage.immortal += bytes;
        }
        Ok(())
    }
}

/// Restores the previous context of the thread when dropped.
#[must_use = "the context is uninstalled as soon as the guard is dropped"]
#[derive(Debug)]
pub struct ContextGuard {
    previous: Option<ExecutionContext>,
    _not_send: PhantomData<*const ()>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        let _ = CONTEXT.try_with(|cell| {
            *cell.borrow_mut() = previous;
        });
    }
}

/// Run `f` on the calling thread's context.
pub(crate) fn with_current_mut<R>(f: impl FnOnce(&mut ExecutionContext) -> R) -> RtResult<R> {
    CONTEXT.with(|cell| match cell.borrow_mut().as_mut() {
        Some(cx) => Ok(f(cx)),
        None => Err(raise(RtError::IllegalState("no execution context on this thread"))),
    })
}

/// Charge an allocation in `area` to the calling context.
///
/// Threads without a context may allocate in the heap and immortal regions
/// only.
pub(crate) fn charge(area: &MemoryArea, bytes: usize) -> RtResult<()> {
    CONTEXT.with(|cell| match cell.borrow_mut().as_mut() {
        Some(cx) => cx.charge(area, bytes),
        None if area.is_scoped() => Err(raise(RtError::InaccessibleArea(area.id()))),
        None => Ok(()),
    })
}

/// Whether `area` is on the calling context's scope stack.
pub(crate) fn is_on_stack(area: &MemoryArea) -> bool {
    CONTEXT.with(|cell| cell.borrow().as_ref().is_some_and(|cx| cx.scopes.contains(area)))
}

/// Whether the calling context is a no-heap context.
pub(crate) fn forbids_heap() -> bool {
    CONTEXT.with(|cell| cell.borrow().as_ref().is_some_and(|cx| cx.no_heap))
}

/// Current allocation context of the calling thread.
pub fn current_area() -> RtResult<MemoryArea> {
    with_current_mut(|cx| {
        cx.current_override
            .clone()
            .or_else(|| cx.scopes.last().cloned())
    })?
    .ok_or_else(|| raise(RtError::IllegalState("empty scope stack")))
}

/// Number of regions on the calling thread's scope stack.
pub fn scope_depth() -> usize {
    CONTEXT.with(|cell| cell.borrow().as_ref().map_or(0, |cx| cx.scopes.len()))
}

/// Task control block of the calling thread.
///
/// Threads without a context get a per-thread block at priority 0.
pub fn current_task() -> Arc<TaskControl> {
    CONTEXT
        .with(|cell| cell.borrow().as_ref().map(|cx| cx.task.clone()))
        .unwrap_or_else(|| FALLBACK_TASK.with(Arc::clone))
}

/// Interrupt token of the calling thread.
pub fn current_interrupt() -> InterruptToken {
    CONTEXT
        .with(|cell| cell.borrow().as_ref().map(|cx| cx.interrupt.clone()))
        .unwrap_or_else(|| FALLBACK_INTERRUPT.with(InterruptToken::clone))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryLimits;

    #[test]
    fn test_install_restores_previous() {
        let heap = MemoryArea::heap(0);
        let outer_task = TaskControl::new("outer", 11);
        let inner_task = TaskControl::new("inner", 30);

        let outer = ExecutionContext::new(heap.clone(), outer_task.clone()).install().unwrap();
        assert_eq!(current_task().id(), outer_task.id());
        {
            let _inner = ExecutionContext::new(heap.clone(), inner_task.clone()).install().unwrap();
            assert_eq!(current_task().id(), inner_task.id());
        }
        assert_eq!(current_task().id(), outer_task.id());
        drop(outer);
        assert_eq!(scope_depth(), 0);
        assert!(current_area().is_err());
        assert_eq!(current_task().base_priority(), 0);
    }

    #[test]
    fn test_no_heap_context_cannot_start_in_heap() {
        let heap = MemoryArea::heap(0);
        let err = ExecutionContext::new(heap, TaskControl::new("t", 11))
            .no_heap(true)
            .install()
            .unwrap_err();
        assert!(matches!(err, RtError::MemoryAccess(_)));
    }

    #[test]
    fn test_memory_parameters_limit_initial_area() {
        let heap = MemoryArea::heap(0);
        let params = MemoryParameters::with_limits(MemoryLimits {
            max_memory_area: Some(8),
            ..MemoryLimits::default()
        });
        let _cx = ExecutionContext::new(heap.clone(), TaskControl::new("t", 11))
            .memory_parameters(Some(params))
            .install()
            .unwrap();

        assert!(heap.new_instance(1u64).is_ok());
        assert!(matches!(heap.new_instance(1u8), Err(RtError::OutOfMemory { .. })));
        // The failed allocation is not charged to the region.
        assert_eq!(heap.memory_consumed(), 8);
    }

    #[test]
    fn test_allocation_rate() {
        let heap = MemoryArea::heap(0);
        let params = MemoryParameters::new();
        params.set_allocation_rate(Some(16));
        let _cx = ExecutionContext::new(heap.clone(), TaskControl::new("t", 11))
            .memory_parameters(Some(params))
            .install()
            .unwrap();

        assert!(heap.new_array(16, 0u8).is_ok());
        assert!(matches!(heap.new_instance(0u8), Err(RtError::OutOfMemory { .. })));
    }

    #[test]
    fn test_max_immortal() {
        let heap = MemoryArea::heap(0);
        let immortal = MemoryArea::immortal(1024);
        let params = MemoryParameters::new();
        params.set_max_immortal(Some(4));
        let _cx = ExecutionContext::new(heap, TaskControl::new("t", 11))
            .memory_parameters(Some(params))
            .install()
            .unwrap();

        assert!(immortal.new_instance(0u32).is_ok());
        assert!(matches!(immortal.new_instance(0u8), Err(RtError::OutOfMemory { .. })));
    }

    #[test]
    fn test_interrupt_token_follows_context() {
        let heap = MemoryArea::heap(0);
        let token = InterruptToken::new();
        let _cx = ExecutionContext::new(heap, TaskControl::new("t", 11))
            .interrupt_token(token.clone())
            .install()
            .unwrap();
        assert_eq!(current_interrupt().id(), token.id());
    }
}
