//! # Priority-Aware Monitors
//!
//! Locks that bound priority inversion.
//!
//! ## Protocols
//!
//! - **Priority ceiling emulation** ([`MonitorControl::PriorityCeilingEmulation`]):
//!   the lock carries a ceiling C. Acquiring it fails with
//!   `CeilingViolation` before blocking when the task's base priority, or
//!   any ceiling the task already holds, exceeds C. While held, the task
//!   runs at no less than C.
//! - **Priority inheritance** ([`MonitorControl::PriorityInheritance`]): a
//!   blocked waiter lends its priority to the holder for as long as it waits.
//!
//! While a task holds any inheritance lock, ceiling locks it acquires use
//! inheritance semantics instead: no ceiling check, no ceiling boost.
//!
//! On every release the task's active priority is recomputed from the locks
//! it still holds, so it need not return to its pre-lock value.
//!
//! Monitors are not reentrant. Waiters are granted the lock in priority
//! order, FIFO within a priority.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::trace;

use crate::error::{raise, RtError, RtResult};
use crate::memory::current_task;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_MONITOR_ID: AtomicU64 = AtomicU64::new(1);

/// Sentinel for "no waiter".
const NO_BOOST: i32 = i32::MIN;

/// Locking protocol of a monitor. Immutable once attached to a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorControl {
    /// Ceiling protocol with a fixed ceiling priority.
    PriorityCeilingEmulation {
        /// Ceiling priority.
        ceiling: i32,
    },
    /// Inheritance protocol.
    PriorityInheritance,
}

impl MonitorControl {
    /// Ceiling emulation at `ceiling`.
    pub fn ceiling(ceiling: i32) -> Self {
        MonitorControl::PriorityCeilingEmulation { ceiling }
    }

    /// Ceiling of a ceiling-emulation policy.
    pub fn ceiling_priority(&self) -> Option<i32> {
        match self {
            MonitorControl::PriorityCeilingEmulation { ceiling } => Some(*ceiling),
            MonitorControl::PriorityInheritance => None,
        }
    }
}

impl Default for MonitorControl {
    fn default() -> Self {
        MonitorControl::PriorityInheritance
    }
}

/// How a task holds one lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HoldMode {
    Ceiling(i32),
    Inheritance,
}

struct HeldLock {
    core: Arc<MonitorCore>,
    mode: HoldMode,
}

/// Priority bookkeeping of one schedulable.
pub struct TaskControl {
    id: u64,
    name: String,
    base: AtomicI32,
    active: AtomicI32,
    held: Mutex<Vec<HeldLock>>,
}

impl TaskControl {
    /// Create a task control block at `base` priority.
    pub fn new(name: impl Into<String>, base: i32) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            base: AtomicI32::new(base),
            active: AtomicI32::new(base),
            held: Mutex::new(Vec::new()),
        })
    }

    /// Task ID.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Task name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Priority the task was given.
    pub fn base_priority(&self) -> i32 {
        self.base.load(Ordering::Acquire)
    }

    /// Priority the task currently runs at.
    pub fn active_priority(&self) -> i32 {
        self.active.load(Ordering::Acquire)
    }

    /// Change the base priority.
    pub fn set_base_priority(&self, priority: i32) {
        self.base.store(priority, Ordering::Release);
        self.recompute();
    }

    /// Number of monitors held.
    pub fn held_count(&self) -> usize {
        self.held.lock().len()
    }

    fn holds(&self, monitor: u64) -> bool {
        self.held.lock().iter().any(|h| h.core.id == monitor)
    }

    /// Decide how a lock with `control` would be held, checking ceilings.
    fn admit(&self, control: MonitorControl) -> RtResult<HoldMode> {
        let held = self.held.lock();
        let inheriting = held.iter().any(|h| h.mode == HoldMode::Inheritance);
        match control {
            MonitorControl::PriorityInheritance => Ok(HoldMode::Inheritance),
            MonitorControl::PriorityCeilingEmulation { .. } if inheriting => Ok(HoldMode::Inheritance),
            MonitorControl::PriorityCeilingEmulation { ceiling } => {
                let base = self.base_priority();
                if base > ceiling {
                    return Err(RtError::CeilingViolation { priority: base, ceiling });
                }
                for h in held.iter() {
                    if let HoldMode::Ceiling(c) = h.mode {
                        if c > ceiling {
                            return Err(RtError::CeilingViolation { priority: c, ceiling });
                        }
                    }
                }
                Ok(HoldMode::Ceiling(ceiling))
            }
        }
    }

    fn push_held(&self, core: Arc<MonitorCore>, mode: HoldMode) {
        self.held.lock().push(HeldLock { core, mode });
        self.recompute();
    }

    fn remove_held(&self, monitor: u64) {
        self.held.lock().retain(|h| h.core.id != monitor);
        self.recompute();
    }

    /// Recompute the active priority from the base priority and held locks.
    fn recompute(&self) {
        let mut priority = self.base_priority();
        for h in self.held.lock().iter() {
            if let HoldMode::Ceiling(c) = h.mode {
                priority = priority.max(c);
            }
            priority = priority.max(h.core.boost.load(Ordering::Acquire));
        }
        let previous = self.active.swap(priority, Ordering::AcqRel);
        if previous != priority {
            trace!(task = %self.name, from = previous, to = priority, "active priority changed");
        }
    }
}

impl fmt::Debug for TaskControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskControl")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("base", &self.base_priority())
            .field("active", &self.active_priority())
            .finish()
    }
}

struct Waiter {
    priority: i32,
    ticket: u64,
}

#[derive(Default)]
struct LockState {
    holder: Option<Arc<TaskControl>>,
    holder_mode: Option<HoldMode>,
    waiters: Vec<Waiter>,
    next_ticket: u64,
}

impl LockState {
    /// Whether `ticket` is the next waiter to be granted the lock.
    fn is_next(&self, ticket: u64) -> bool {
        self.waiters
            .iter()
            .max_by(|a, b| a.priority.cmp(&b.priority).then(b.ticket.cmp(&a.ticket)))
            .is_some_and(|w| w.ticket == ticket)
    }

    fn max_waiter_priority(&self) -> i32 {
        self.waiters.iter().map(|w| w.priority).max().unwrap_or(NO_BOOST)
    }
}

struct MonitorCore {
    id: u64,
    control: MonitorControl,
    state: Mutex<LockState>,
    granted: Condvar,
    /// Highest priority among inheritance waiters.
    boost: AtomicI32,
}

impl MonitorCore {
    fn acquire(self: &Arc<Self>, task: &Arc<TaskControl>, block: bool) -> RtResult<bool> {
        if task.holds(self.id) {
            return Err(raise(RtError::IllegalState("monitor is not reentrant")));
        }
        let mode = task.admit(self.control)?;

        let mut state = self.state.lock();
        if state.holder.is_none() && state.waiters.is_empty() {
            state.holder = Some(task.clone());
            state.holder_mode = Some(mode);
        } else if !block {
            return Ok(false);
        } else {
            let ticket = state.next_ticket;
            state.next_ticket += 1;
            state.waiters.push(Waiter {
                priority: task.active_priority(),
                ticket,
            });
            self.update_boost(&state);
            trace!(monitor = self.id, task = %task.name, "blocked on monitor");

            while state.holder.is_some() || !state.is_next(ticket) {
                self.granted.wait(&mut state);
            }
            state.waiters.retain(|w| w.ticket != ticket);
            state.holder = Some(task.clone());
            state.holder_mode = Some(mode);
            self.update_boost(&state);
        }
        drop(state);

        task.push_held(self.clone(), mode);
        Ok(true)
    }

    /// Publish the highest waiter priority and let the holder inherit it.
    fn update_boost(&self, state: &LockState) {
        let boost = match state.holder_mode {
            Some(HoldMode::Inheritance) => state.max_waiter_priority(),
            _ => NO_BOOST,
        };
        self.boost.store(boost, Ordering::Release);
        if let Some(holder) = &state.holder {
            holder.recompute();
        }
    }

    fn release(&self, task: &TaskControl) {
        {
            let mut state = self.state.lock();
            if state.holder.as_ref().map(|h| h.id) == Some(task.id) {
                state.holder = None;
                state.holder_mode = None;
                self.boost.store(NO_BOOST, Ordering::Release);
            }
            self.granted.notify_all();
        }
        task.remove_held(self.id);
    }
}

/// A value protected by a priority-aware lock.
pub struct Monitor<T> {
    core: Arc<MonitorCore>,
    data: Mutex<T>,
}

impl<T> Monitor<T> {
    /// Monitor governed by `control`.
    pub fn new(value: T, control: MonitorControl) -> Self {
        Self {
            core: Arc::new(MonitorCore {
                id: NEXT_MONITOR_ID.fetch_add(1, Ordering::Relaxed),
                control,
                state: Mutex::new(LockState::default()),
                granted: Condvar::new(),
                boost: AtomicI32::new(NO_BOOST),
            }),
            data: Mutex::new(value),
        }
    }

    /// Monitor ID.
    pub fn id(&self) -> u64 {
        self.core.id
    }

    /// Locking protocol.
    pub fn control(&self) -> MonitorControl {
        self.core.control
    }

    /// Whether some task holds the lock.
    pub fn is_locked(&self) -> bool {
        self.core.state.lock().holder.is_some()
    }

    /// Number of tasks blocked on the lock.
    pub fn waiter_count(&self) -> usize {
        self.core.state.lock().waiters.len()
    }

    /// Acquire the lock for the calling thread's task, blocking if held.
    pub fn lock(&self) -> RtResult<MonitorGuard<'_, T>> {
        self.lock_as(&current_task())
    }

    /// Acquire the lock on behalf of `task`.
    pub fn lock_as(&self, task: &Arc<TaskControl>) -> RtResult<MonitorGuard<'_, T>> {
        self.core.acquire(task, true)?;
        Ok(self.guard(task))
    }

    /// Acquire the lock only if it is free.
    ///
    /// Ceiling checks still apply; `Ok(None)` means the lock was busy.
    pub fn try_lock(&self) -> RtResult<Option<MonitorGuard<'_, T>>> {
        let task = current_task();
        if self.core.acquire(&task, false)? {
            Ok(Some(self.guard(&task)))
        } else {
            Ok(None)
        }
    }

    fn guard(&self, task: &Arc<TaskControl>) -> MonitorGuard<'_, T> {
        MonitorGuard {
            data: Some(self.data.lock()),
            core: &self.core,
            task: task.clone(),
        }
    }
}

impl<T> fmt::Debug for Monitor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Monitor")
            .field("id", &self.core.id)
            .field("control", &self.core.control)
            .field("locked", &self.is_locked())
            .finish()
    }
}

/// Holds a monitor; releases it on drop.
pub struct MonitorGuard<'a, T> {
    data: Option<MutexGuard<'a, T>>,
    core: &'a Arc<MonitorCore>,
    task: Arc<TaskControl>,
}

impl<T> Deref for MonitorGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.data {
            Some(guard) => guard,
            None => unreachable!("monitor data released before guard drop"),
        }
    }
}

impl<T> DerefMut for MonitorGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.data {
            Some(guard) => guard,
            None => unreachable!("monitor data released before guard drop"),
        }
    }
}

impl<T> fmt::Debug for MonitorGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonitorGuard")
            .field("id", &self.core.id)
            .field("task", &self.task)
            .finish()
    }
}

impl<T> Drop for MonitorGuard<'_, T> {
    fn drop(&mut self) {
        // The data lock goes first so the next holder never contends on it.
        self.data.take();
        self.core.release(&self.task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_ceiling_boosts_and_restores() {
        let task = TaskControl::new("t", 10);
        let monitor = Monitor::new(0, MonitorControl::ceiling(20));
        {
            let mut guard = monitor.lock_as(&task).unwrap();
            *guard += 1;
            assert_eq!(task.active_priority(), 20);
        }
        assert_eq!(task.active_priority(), 10);
        assert!(!monitor.is_locked());
    }

    #[test]
    fn test_base_priority_above_ceiling_fails() {
        let task = TaskControl::new("t", 7);
        let monitor = Monitor::new((), MonitorControl::ceiling(5));
        let err = monitor.lock_as(&task).unwrap_err();
        assert_eq!(err, RtError::CeilingViolation { priority: 7, ceiling: 5 });
    }

    #[test]
    fn test_nested_ceilings() {
        let task = TaskControl::new("t", 1);
        let outer = Monitor::new((), MonitorControl::ceiling(10));
        let higher = Monitor::new((), MonitorControl::ceiling(15));
        let lower = Monitor::new((), MonitorControl::ceiling(8));

        let _o = outer.lock_as(&task).unwrap();
        {
            let _h = higher.lock_as(&task).unwrap();
            assert_eq!(task.active_priority(), 15);
        }
        assert_eq!(task.active_priority(), 10);
        let err = lower.lock_as(&task).unwrap_err();
        assert_eq!(err, RtError::CeilingViolation { priority: 10, ceiling: 8 });
    }

    #[test]
    fn test_release_recomputes_from_remaining_locks() {
        let task = TaskControl::new("t", 1);
        let a = Monitor::new((), MonitorControl::ceiling(10));
        let b = Monitor::new((), MonitorControl::ceiling(12));

        let ga = a.lock_as(&task).unwrap();
        let gb = b.lock_as(&task).unwrap();
        assert_eq!(task.active_priority(), 12);
        // Release out of order: still holding the ceiling-12 lock.
        drop(ga);
        assert_eq!(task.active_priority(), 12);
        drop(gb);
        assert_eq!(task.active_priority(), 1);
    }

    #[test]
    fn test_not_reentrant() {
        let task = TaskControl::new("t", 1);
        let monitor = Monitor::new((), MonitorControl::PriorityInheritance);
        let _g = monitor.lock_as(&task).unwrap();
        assert!(matches!(monitor.lock_as(&task), Err(RtError::IllegalState(_))));
    }

    #[test]
    fn test_inheritance_boosts_holder() {
        let low = TaskControl::new("low", 3);
        let high = TaskControl::new("high", 30);
        let monitor = Arc::new(Monitor::new(0u32, MonitorControl::PriorityInheritance));

        let guard = monitor.lock_as(&low).unwrap();
        let waiter = {
            let monitor = monitor.clone();
            let high = high.clone();
            std::thread::spawn(move || {
                let mut g = monitor.lock_as(&high).unwrap();
                *g += 1;
            })
        };

        while monitor.waiter_count() == 0 {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(low.active_priority(), 30);
        drop(guard);
        waiter.join().unwrap();
        assert_eq!(low.active_priority(), 3);
        assert_eq!(high.active_priority(), 30);
    }

    #[test]
    fn test_ceiling_lock_under_inheritance_lock_inherits() {
        let task = TaskControl::new("t", 9);
        let pi = Monitor::new((), MonitorControl::PriorityInheritance);
        let pce = Monitor::new((), MonitorControl::ceiling(5));

        let _p = pi.lock_as(&task).unwrap();
        // Base priority 9 exceeds ceiling 5, yet no violation and no ceiling boost.
        let _c = pce.lock_as(&task).unwrap();
        assert_eq!(task.active_priority(), 9);
    }

    #[test]
    fn test_priority_ordered_handoff() {
        let owner = TaskControl::new("owner", 1);
        let monitor = Arc::new(Monitor::new(Vec::new(), MonitorControl::PriorityInheritance));
        let guard = monitor.lock_as(&owner).unwrap();

        let spawn = |name: &'static str, priority: i32| {
            let monitor = monitor.clone();
            let task = TaskControl::new(name, priority);
            std::thread::spawn(move || {
                monitor.lock_as(&task).unwrap().push(name);
            })
        };
        let low = spawn("low", 2);
        while monitor.waiter_count() < 1 {
            std::thread::sleep(Duration::from_millis(1));
        }
        let high = spawn("high", 20);
        while monitor.waiter_count() < 2 {
            std::thread::sleep(Duration::from_millis(1));
        }

        drop(guard);
        low.join().unwrap();
        high.join().unwrap();
        let order = monitor.lock_as(&owner).unwrap().clone();
        assert_eq!(order, vec!["high", "low"]);
    }

    #[test]
    fn test_try_lock_busy() {
        let monitor = Arc::new(Monitor::new((), MonitorControl::PriorityInheritance));
        let _g = monitor.lock_as(&TaskControl::new("other", 1)).unwrap();
        let busy = {
            let monitor = monitor.clone();
            std::thread::spawn(move || monitor.try_lock().map(|g| g.is_none()))
        };
        assert_eq!(busy.join().unwrap(), Ok(true));
    }
}
