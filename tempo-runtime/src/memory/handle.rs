//! Region-tagged references and checked reference fields.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use super::context;
use super::region::MemoryArea;
use super::Generation;
use crate::error::{raise, RtError, RtResult};

/// A reference to an object allocated in a [`MemoryArea`].
///
/// The handle remembers the region generation at allocation time. Once the
/// region is reclaimed every access fails with `StaleReference`.
pub struct Handle<T: ?Sized> {
    value: Arc<T>,
    area: MemoryArea,
    generation: Generation,
}

impl<T> Handle<T> {
    pub(crate) fn new(value: T, area: MemoryArea, generation: Generation) -> Self {
        Self {
            value: Arc::new(value),
            area,
            generation,
        }
    }
}

impl<T: ?Sized> Handle<T> {
    /// Borrow the object.
    ///
    /// Fails with `StaleReference` after the region was reclaimed, and with
    /// `MemoryAccess` when a no-heap context dereferences a heap object.
    pub fn get(&self) -> RtResult<&T> {
        self.validate()?;
        Ok(&self.value)
    }

    /// Check that the handle may be dereferenced by the calling context.
    pub fn validate(&self) -> RtResult<()> {
        if self.area.is_heap() && context::forbids_heap() {
            return Err(raise(RtError::MemoryAccess("no-heap context dereferenced a heap object")));
        }
        let actual = self.area.generation();
        if actual != self.generation {
            return Err(RtError::StaleReference {
                region: self.area.id(),
                expected: self.generation,
                actual,
            });
        }
        Ok(())
    }

    /// Region the object was allocated in.
    pub fn area(&self) -> &MemoryArea {
        &self.area
    }

    /// Region generation at allocation time.
    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Whether the region has not been reclaimed since allocation.
    pub fn is_live(&self) -> bool {
        self.area.generation() == self.generation
    }

    /// Whether two handles point to the same object.
    pub fn ptr_eq(a: &Handle<T>, b: &Handle<T>) -> bool {
        Arc::ptr_eq(&a.value, &b.value)
    }
}

impl<T: Any + Send + Sync> Handle<T> {
    pub(crate) fn erase(self) -> Handle<dyn Any + Send + Sync> {
        let value: Arc<dyn Any + Send + Sync> = self.value;
        Handle {
            value,
            area: self.area,
            generation: self.generation,
        }
    }
}

impl Handle<dyn Any + Send + Sync> {
    pub(crate) fn downcast<T: Any + Send + Sync>(self) -> Option<Handle<T>> {
        let Handle { value, area, generation } = self;
        value.downcast::<T>().ok().map(|value| Handle { value, area, generation })
    }
}

impl<T: ?Sized> Clone for Handle<T> {
    fn clone(&self) -> Self {
        Self {
            value: self.value.clone(),
            area: self.area.clone(),
            generation: self.generation,
        }
    }
}

impl<T: ?Sized> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("region", &self.area.id())
            .field("generation", &self.generation)
            .field("live", &self.is_live())
            .finish()
    }
}

/// Fail with `IllegalAssignment` unless a reference into `value` may be
/// stored in an object allocated in `target`.
pub fn check_assignment(target: &MemoryArea, value: &MemoryArea) -> RtResult<()> {
    if value.outlives(target) {
        Ok(())
    } else {
        Err(raise(RtError::IllegalAssignment {
            target: target.id(),
            value: value.id(),
        }))
    }
}

/// A reference-holding field of an object allocated in a given region.
///
/// Every store is checked against the assignment rule.
pub struct RefField<T: ?Sized> {
    holder: MemoryArea,
    slot: Mutex<Option<Handle<T>>>,
}

impl<T: ?Sized> RefField<T> {
    /// Empty field of an object allocated in `holder`.
    pub fn new(holder: MemoryArea) -> Self {
        Self {
            holder,
            slot: Mutex::new(None),
        }
    }

    /// Region of the object owning this field.
    pub fn holder(&self) -> &MemoryArea {
        &self.holder
    }

    /// Store `value`, or clear the field with `None`.
    pub fn set(&self, value: Option<Handle<T>>) -> RtResult<()> {
        if let Some(handle) = &value {
            handle.validate()?;
            check_assignment(&self.holder, handle.area())?;
        }
        *self.slot.lock() = value;
        Ok(())
    }

    /// Current value.
    pub fn get(&self) -> Option<Handle<T>> {
        self.slot.lock().clone()
    }

    /// Take the value, leaving the field empty.
    pub fn take(&self) -> Option<Handle<T>> {
        self.slot.lock().take()
    }
}

impl<T: ?Sized> fmt::Debug for RefField<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefField")
            .field("holder", &self.holder.id())
            .field("value", &*self.slot.lock())
            .finish()
    }
}
