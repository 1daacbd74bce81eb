//! Heap, immortal and scoped regions.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use super::context;
use super::handle::{check_assignment, Handle};
use super::{generation, next_region_id, Generation, RegionId};
use crate::error::{raise, RtError, RtResult};

/// Lifetime class of a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionKind {
    /// Garbage-collected heap. Forbidden to no-heap contexts.
    Heap,
    /// Lives as long as the runtime.
    Immortal,
    /// Reclaimed when the last context leaves it.
    Scoped,
}

impl RegionKind {
    /// Lowercase name for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            RegionKind::Heap => "heap",
            RegionKind::Immortal => "immortal",
            RegionKind::Scoped => "scoped",
        }
    }
}

/// Scope bookkeeping, only meaningful for scoped regions.
struct ScopeState {
    /// Parent fixed by the first context to enter; `None` is the primordial scope.
    parent: Option<MemoryArea>,
    /// Number of scope stacks the region is currently on.
    references: usize,
    /// Optional shared object of the region.
    portal: Option<Handle<dyn Any + Send + Sync>>,
}

struct AreaInner {
    id: RegionId,
    kind: RegionKind,
    /// Byte budget, 0 for unlimited.
    size: usize,
    consumed: AtomicUsize,
    generation: AtomicU32,
    scope: Mutex<ScopeState>,
}

/// A memory region.
///
/// Cloning yields another reference to the same region.
#[derive(Clone)]
pub struct MemoryArea {
    inner: Arc<AreaInner>,
}

impl MemoryArea {
    fn with_kind(kind: RegionKind, size: usize) -> Self {
        Self {
            inner: Arc::new(AreaInner {
                id: next_region_id(),
                kind,
                size,
                consumed: AtomicUsize::new(0),
                generation: AtomicU32::new(generation::FIRST),
                scope: Mutex::new(ScopeState {
                    parent: None,
                    references: 0,
                    portal: None,
                }),
            }),
        }
    }

    /// The runtime heap; `size` 0 means unlimited.
    pub(crate) fn heap(size: usize) -> Self {
        Self::with_kind(RegionKind::Heap, size)
    }

    /// The runtime immortal region.
    pub(crate) fn immortal(size: usize) -> Self {
        Self::with_kind(RegionKind::Immortal, size)
    }

    /// Create a scoped region with a budget of `size` bytes.
    pub fn scoped(size: usize) -> RtResult<Self> {
        if size == 0 {
            return Err(raise(RtError::IllegalArgument("scoped region size must be positive")));
        }
        Ok(Self::with_kind(RegionKind::Scoped, size))
    }

    /// Region ID.
    pub fn id(&self) -> RegionId {
        self.inner.id
    }

    /// Lifetime class.
    pub fn kind(&self) -> RegionKind {
        self.inner.kind
    }

    /// Whether this is a scoped region.
    pub fn is_scoped(&self) -> bool {
        self.inner.kind == RegionKind::Scoped
    }

    /// Whether this is the heap.
    pub fn is_heap(&self) -> bool {
        self.inner.kind == RegionKind::Heap
    }

    /// Byte budget, 0 for unlimited.
    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// Bytes allocated since creation or last reclaim.
    pub fn memory_consumed(&self) -> usize {
        self.inner.consumed.load(Ordering::Acquire)
    }

    /// Bytes still available; `usize::MAX` when unlimited.
    pub fn memory_remaining(&self) -> usize {
        if self.inner.size == 0 {
            return usize::MAX;
        }
        self.inner.size.saturating_sub(self.memory_consumed())
    }

    /// Number of scope stacks this region is on (always 0 unless scoped).
    pub fn reference_count(&self) -> usize {
        self.inner.scope.lock().references
    }

    /// Current generation; bumped every time the region is reclaimed.
    pub fn generation(&self) -> Generation {
        self.inner.generation.load(Ordering::Acquire)
    }

    /// Parent scope, if the region is in use and nested in another scope.
    pub fn outer_scope(&self) -> Option<MemoryArea> {
        self.inner.scope.lock().parent.clone()
    }

    /// Whether objects of this region live at least as long as those of `other`.
    pub fn outlives(&self, other: &MemoryArea) -> bool {
        if self == other || !self.is_scoped() {
            return true;
        }
        if !other.is_scoped() {
            return false;
        }
        let mut cursor = other.outer_scope();
        while let Some(area) = cursor {
            if &area == self {
                return true;
            }
            cursor = area.outer_scope();
        }
        false
    }

    /// Push this region on the calling context's scope stack, run `logic`,
    /// and pop again on every exit path.
    pub fn enter<R>(&self, logic: impl FnOnce() -> R) -> RtResult<R> {
        let _guard = self.enter_guard()?;
        Ok(logic())
    }

    /// Push this region and return the guard that pops it.
    pub fn enter_guard(&self) -> RtResult<AreaGuard> {
        let saved = context::with_current_mut(|cx| -> RtResult<Option<MemoryArea>> {
            if self.is_heap() && cx.no_heap {
                return Err(raise(RtError::MemoryAccess("no-heap context cannot enter the heap")));
            }
            if self.is_scoped() {
                let candidate = cx.innermost_scoped().cloned();
                let mut scope = self.inner.scope.lock();
                if cx.scopes.contains(self) {
                    return Err(raise(RtError::ScopedCycle {
                        region: self.id(),
                        parent: scope.parent.as_ref().map(MemoryArea::id),
                    }));
                }
                if scope.references > 0 && scope.parent.as_ref().map(MemoryArea::id) != candidate.as_ref().map(MemoryArea::id) {
                    return Err(raise(RtError::ScopedCycle {
                        region: self.id(),
                        parent: scope.parent.as_ref().map(MemoryArea::id),
                    }));
                }
                if scope.references == 0 {
                    scope.parent = candidate;
                }
                scope.references += 1;
            }
            cx.scopes.push(self.clone());
            Ok(cx.current_override.take())
        })??;

        trace!(region = %self.id(), kind = self.kind().as_str(), "entered region");
        Ok(AreaGuard {
            area: self.clone(),
            pops: true,
            saved,
        })
    }

    /// Run `logic` with this region as the allocation context, without
    /// pushing a new scope.
    ///
    /// A scoped region must already be on the caller's scope stack.
    pub fn execute_in_area<R>(&self, logic: impl FnOnce() -> R) -> RtResult<R> {
        let saved = context::with_current_mut(|cx| -> RtResult<Option<MemoryArea>> {
            if self.is_heap() && cx.no_heap {
                return Err(raise(RtError::MemoryAccess("no-heap context cannot execute in the heap")));
            }
            if self.is_scoped() && !cx.scopes.contains(self) {
                return Err(raise(RtError::InaccessibleArea(self.id())));
            }
            Ok(cx.current_override.replace(self.clone()))
        })??;

        let _guard = AreaGuard {
            area: self.clone(),
            pops: false,
            saved,
        };
        Ok(logic())
    }

    /// Allocate `value` in this region.
    pub fn new_instance<T>(&self, value: T) -> RtResult<Handle<T>> {
        self.allocate(std::mem::size_of::<T>())?;
        Ok(Handle::new(value, self.clone(), self.generation()))
    }

    /// Allocate an array of `len` copies of `init` in this region.
    pub fn new_array<T: Clone>(&self, len: usize, init: T) -> RtResult<Handle<Vec<T>>> {
        let bytes = std::mem::size_of::<T>()
            .checked_mul(len)
            .ok_or_else(|| raise(RtError::IllegalArgument("array size overflows")))?;
        self.allocate(bytes)?;
        Ok(Handle::new(vec![init; len], self.clone(), self.generation()))
    }

    /// Charge `bytes` against this region and the caller's memory parameters.
    pub(crate) fn allocate(&self, bytes: usize) -> RtResult<()> {
        self.reserve(bytes)?;
        if let Err(e) = context::charge(self, bytes) {
            self.inner.consumed.fetch_sub(bytes, Ordering::AcqRel);
            return Err(e);
        }
        Ok(())
    }

    fn reserve(&self, bytes: usize) -> RtResult<()> {
        let size = self.inner.size;
        let mut used = self.inner.consumed.load(Ordering::Acquire);
        loop {
            let next = used.saturating_add(bytes);
            if size != 0 && next > size {
                return Err(raise(RtError::OutOfMemory {
                    region: self.id(),
                    requested: bytes,
                    remaining: size.saturating_sub(used),
                }));
            }
            match self
                .inner
                .consumed
                .compare_exchange_weak(used, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Ok(()),
                Err(actual) => used = actual,
            }
        }
    }

    /// Install the region's portal object.
    ///
    /// The portal obeys the assignment rule with this region as the holder.
    pub fn set_portal<T: Any + Send + Sync>(&self, portal: Handle<T>) -> RtResult<()> {
        self.check_portal_access()?;
        check_assignment(self, portal.area())?;
        portal.validate()?;
        let previous = self.inner.scope.lock().portal.replace(portal.erase());
        drop(previous);
        Ok(())
    }

    /// The region's portal object, if set and of type `T`.
    pub fn portal<T: Any + Send + Sync>(&self) -> RtResult<Option<Handle<T>>> {
        self.check_portal_access()?;
        let portal = self.inner.scope.lock().portal.clone();
        Ok(portal.and_then(Handle::downcast))
    }

    fn check_portal_access(&self) -> RtResult<()> {
        if !self.is_scoped() {
            return Err(raise(RtError::UnsupportedOperation("only scoped regions carry a portal")));
        }
        if !context::is_on_stack(self) {
            return Err(raise(RtError::InaccessibleArea(self.id())));
        }
        Ok(())
    }

    /// Drop one scope-stack reference, reclaiming the region at zero.
    fn leave(&self) {
        let mut scope = self.inner.scope.lock();
        scope.references = scope.references.saturating_sub(1);
        if scope.references > 0 {
            return;
        }
        scope.parent = None;
        let portal = scope.portal.take();
        self.inner.consumed.store(0, Ordering::Release);
        let generation = self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
        drop(scope);
        drop(portal);
        trace!(region = %self.id(), generation, "reclaimed scoped region");
    }
}

impl PartialEq for MemoryArea {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for MemoryArea {}

impl fmt::Debug for MemoryArea {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryArea")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("size", &self.inner.size)
            .field("consumed", &self.memory_consumed())
            .field("generation", &self.generation())
            .finish()
    }
}

/// Pops a region (or restores the allocation context) when dropped.
#[must_use = "the region is left as soon as the guard is dropped"]
pub struct AreaGuard {
    area: MemoryArea,
    /// False for `execute_in_area`, which only swaps the allocation context.
    pops: bool,
    saved: Option<MemoryArea>,
}

impl Drop for AreaGuard {
    fn drop(&mut self) {
        let saved = self.saved.take();
        let pops = self.pops;
        let area = &self.area;
        let _ = context::with_current_mut(|cx| {
            if pops && cx.scopes.last() == Some(area) {
                cx.scopes.pop();
            }
            cx.current_override = saved;
        });
        if pops {
            trace!(region = %area.id(), "left region");
            if area.is_scoped() {
                area.leave();
            }
        }
    }
}

impl fmt::Debug for AreaGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AreaGuard")
            .field("area", &self.area.id())
            .field("pops", &self.pops)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{current_area, scope_depth, ExecutionContext};
    use crate::monitor::TaskControl;

    fn attach(heap: &MemoryArea) -> crate::memory::ContextGuard {
        ExecutionContext::new(heap.clone(), TaskControl::new("test", 20))
            .install()
            .unwrap()
    }

    #[test]
    fn test_enter_pushes_and_pops() {
        let heap = MemoryArea::heap(0);
        let _cx = attach(&heap);
        let scope = MemoryArea::scoped(1024).unwrap();

        assert_eq!(scope_depth(), 1);
        let depth = scope.enter(|| {
            assert_eq!(current_area().unwrap(), scope);
            assert_eq!(scope.reference_count(), 1);
            scope_depth()
        });
        assert_eq!(depth, Ok(2));
        assert_eq!(scope_depth(), 1);
        assert_eq!(scope.reference_count(), 0);
    }

    #[test]
    fn test_pop_runs_on_unwind() {
        let heap = MemoryArea::heap(0);
        let _cx = attach(&heap);
        let scope = MemoryArea::scoped(1024).unwrap();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            scope.enter(|| panic!("inside scope")).ok();
        }));
        assert!(result.is_err());
        assert_eq!(scope_depth(), 1);
        assert_eq!(scope.reference_count(), 0);
    }

    #[test]
    fn test_budget_exhaustion() {
        let heap = MemoryArea::heap(0);
        let _cx = attach(&heap);
        let scope = MemoryArea::scoped(16).unwrap();

        scope
            .enter(|| {
                assert!(scope.new_instance(0u64).is_ok());
                assert!(scope.new_instance(0u64).is_ok());
                let err = scope.new_instance(0u8).unwrap_err();
                assert_eq!(
                    err,
                    RtError::OutOfMemory {
                        region: scope.id(),
                        requested: 1,
                        remaining: 0
                    }
                );
            })
            .unwrap();
    }

    #[test]
    fn test_reclaim_resets_and_bumps_generation() {
        let heap = MemoryArea::heap(0);
        let _cx = attach(&heap);
        let scope = MemoryArea::scoped(64).unwrap();

        let escaped = scope.enter(|| scope.new_instance(5u32).unwrap()).unwrap();
        assert_eq!(scope.memory_consumed(), 0);
        assert_eq!(scope.generation(), generation::FIRST + 1);
        assert!(matches!(escaped.get(), Err(RtError::StaleReference { .. })));
    }

    #[test]
    fn test_single_parent_rule() {
        use std::sync::mpsc;

        let heap = MemoryArea::heap(0);
        let a = MemoryArea::scoped(64).unwrap();
        let b = MemoryArea::scoped(64).unwrap();
        let shared = MemoryArea::scoped(64).unwrap();

        let (entered_tx, entered_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let holder = {
            let (heap, a, shared) = (heap.clone(), a.clone(), shared.clone());
            std::thread::spawn(move || {
                let _cx = attach(&heap);
                a.enter(|| {
                    shared
                        .enter(|| {
                            entered_tx.send(()).unwrap();
                            done_rx.recv().unwrap();
                        })
                        .unwrap();
                })
                .unwrap();
            })
        };

        entered_rx.recv().unwrap();
        {
            let _cx = attach(&heap);
            assert_eq!(shared.outer_scope(), Some(a.clone()));
            b.enter(|| {
                let err = shared.enter(|| ()).unwrap_err();
                assert_eq!(
                    err,
                    RtError::ScopedCycle {
                        region: shared.id(),
                        parent: Some(a.id())
                    }
                );
            })
            .unwrap();
            // Same parent as the holder: allowed, shares the region.
            a.enter(|| {
                shared.enter(|| assert_eq!(shared.reference_count(), 2)).unwrap();
            })
            .unwrap();
        }
        done_tx.send(()).unwrap();
        holder.join().unwrap();
        assert_eq!(shared.reference_count(), 0);
    }

    #[test]
    fn test_reentering_same_scope_is_a_cycle() {
        let heap = MemoryArea::heap(0);
        let _cx = attach(&heap);
        let a = MemoryArea::scoped(64).unwrap();

        a.enter(|| {
            assert!(matches!(a.enter(|| ()), Err(RtError::ScopedCycle { .. })));
        })
        .unwrap();
    }

    #[test]
    fn test_scope_faults_are_recorded() {
        use crate::config::ExceptionStorageConfig;
        use crate::error::{ErrorKind, ErrorStorage};

        let heap = MemoryArea::heap(0);
        let _cx = attach(&heap);
        assert!(ErrorStorage::install(&ExceptionStorageConfig::default()));
        let a = MemoryArea::scoped(64).unwrap();
        let b = MemoryArea::scoped(64).unwrap();

        a.enter(|| assert!(a.enter(|| ()).is_err())).unwrap();
        assert!(ErrorStorage::last_message(ErrorKind::ScopedCycle).is_some());
        assert!(b.execute_in_area(|| ()).is_err());
        assert!(ErrorStorage::last_message(ErrorKind::InaccessibleArea).is_some());
        ErrorStorage::uninstall();
    }

    #[test]
    fn test_execute_in_area_requires_scope_on_stack() {
        let heap = MemoryArea::heap(0);
        let _cx = attach(&heap);
        let a = MemoryArea::scoped(64).unwrap();
        let b = MemoryArea::scoped(64).unwrap();

        assert_eq!(b.execute_in_area(|| ()), Err(RtError::InaccessibleArea(b.id())));
        a.enter(|| {
            b.enter(|| {
                a.execute_in_area(|| assert_eq!(current_area().unwrap(), a)).unwrap();
                assert_eq!(current_area().unwrap(), b);
            })
            .unwrap();
        })
        .unwrap();
    }

    #[test]
    fn test_allocation_requires_scope_on_stack() {
        let heap = MemoryArea::heap(0);
        let _cx = attach(&heap);
        let scope = MemoryArea::scoped(64).unwrap();
        assert_eq!(scope.new_instance(1u8).unwrap_err(), RtError::InaccessibleArea(scope.id()));
    }

    #[test]
    fn test_no_heap_context_cannot_touch_heap() {
        let heap = MemoryArea::heap(0);
        let immortal = MemoryArea::immortal(1024);
        let _cx = ExecutionContext::new(immortal.clone(), TaskControl::new("nhrt", 20))
            .no_heap(true)
            .install()
            .unwrap();

        assert!(matches!(heap.enter(|| ()), Err(RtError::MemoryAccess(_))));
        assert!(matches!(heap.new_instance(1u8), Err(RtError::MemoryAccess(_))));
        assert!(immortal.new_instance(1u8).is_ok());
    }

    #[test]
    fn test_portal_follows_assignment_rule() {
        let heap = MemoryArea::heap(0);
        let _cx = attach(&heap);
        let outer = MemoryArea::scoped(256).unwrap();
        let inner = MemoryArea::scoped(256).unwrap();

        outer
            .enter(|| {
                inner
                    .enter(|| {
                        let deep = inner.new_instance(String::from("inner")).unwrap();
                        assert!(matches!(outer.set_portal(deep), Err(RtError::IllegalAssignment { .. })));

                        let shallow = outer.new_instance(7u32).unwrap();
                        inner.set_portal(shallow).unwrap();
                        let got = inner.portal::<u32>().unwrap().unwrap();
                        assert_eq!(*got.get().unwrap(), 7);
                        assert!(inner.portal::<String>().unwrap().is_none());
                    })
                    .unwrap();
            })
            .unwrap();
    }

    #[test]
    fn test_outlives() {
        let heap = MemoryArea::heap(0);
        let immortal = MemoryArea::immortal(64);
        let _cx = attach(&heap);
        let a = MemoryArea::scoped(64).unwrap();
        let b = MemoryArea::scoped(64).unwrap();

        a.enter(|| {
            b.enter(|| {
                assert!(a.outlives(&b));
                assert!(!b.outlives(&a));
                assert!(heap.outlives(&b));
                assert!(immortal.outlives(&a));
                assert!(!a.outlives(&heap));
            })
            .unwrap();
        })
        .unwrap();
    }
}
