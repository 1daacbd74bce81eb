//! # Event Dispatchers
//!
//! A dispatcher owns a dedicated thread and a slot table of the targets
//! bound to it. Targets refer back to their dispatcher only through the
//! [`DispatchSlot`] index they were given at registration, so there is no
//! ownership cycle between a dispatcher and what it serves.
//!
//! - [`ActiveEventDispatcher`]: fires registered events on its own thread
//!   when triggered.
//! - [`TimeDispatcher`]: fires time-driven targets (timers) when their
//!   deadline passes on the runtime clock.
//!
//! A slot is `register`ed inactive, `activate`d to be served,
//! `deactivate`d to pause, and `deregister`ed to free it. `destroy` fails
//! while any slot is still registered.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Sender};
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, trace, warn};

use crate::config::ExceptionStorageConfig;
use crate::error::{raise, ErrorStorage, RtError, RtResult};
use crate::event::{AsyncEvent, Fireable, Payload};
use crate::time::{AbsoluteTime, Clock};

/// Index of a target in a dispatcher's slot table.
///
/// The generation makes an index stale once its slot is freed and reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DispatchSlot {
    index: u32,
    generation: u32,
}

impl DispatchSlot {
    /// Position in the slot table.
    pub fn index(&self) -> usize {
        self.index as usize
    }
}

struct Entry<T> {
    generation: u32,
    value: Option<T>,
}

/// Generational slot table.
struct SlotTable<T> {
    entries: Vec<Entry<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> SlotTable<T> {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    fn insert(&mut self, value: T) -> DispatchSlot {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let entry = &mut self.entries[index as usize];
            entry.generation = entry.generation.wrapping_add(1);
            entry.value = Some(value);
            return DispatchSlot {
                index,
                generation: entry.generation,
            };
        }
        let index = self.entries.len() as u32;
        self.entries.push(Entry {
            generation: 0,
            value: Some(value),
        });
        DispatchSlot { index, generation: 0 }
    }

    fn get_mut(&mut self, slot: DispatchSlot) -> Option<&mut T> {
        self.entries
            .get_mut(slot.index())
            .filter(|e| e.generation == slot.generation)
            .and_then(|e| e.value.as_mut())
    }

    fn get(&self, slot: DispatchSlot) -> Option<&T> {
        self.entries
            .get(slot.index())
            .filter(|e| e.generation == slot.generation)
            .and_then(|e| e.value.as_ref())
    }

    fn remove(&mut self, slot: DispatchSlot) -> Option<T> {
        let entry = self
            .entries
            .get_mut(slot.index())
            .filter(|e| e.generation == slot.generation)?;
        let value = entry.value.take()?;
        self.free.push(slot.index);
        self.len -= 1;
        Some(value)
    }

    fn drain(&mut self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.len);
        for (index, entry) in self.entries.iter_mut().enumerate() {
            if let Some(value) = entry.value.take() {
                self.free.push(index as u32);
                out.push(value);
            }
        }
        self.len = 0;
        out
    }

    fn len(&self) -> usize {
        self.len
    }
}

fn unknown_slot() -> RtError {
    raise(RtError::IllegalArgument("unknown dispatch slot"))
}

fn destroyed() -> RtError {
    raise(RtError::IllegalState("dispatcher is destroyed"))
}

fn join_unless_current(handle: Option<JoinHandle<()>>) {
    if let Some(handle) = handle {
        if handle.thread().id() != thread::current().id() {
            let _ = handle.join();
        }
    }
}

// ============================================================================
// Active event dispatcher
// ============================================================================

struct ActiveSlot {
    event: AsyncEvent,
    active: bool,
}

enum Command {
    Trigger(DispatchSlot, Payload),
    Stop,
}

struct ActiveShared {
    name: String,
    slots: Mutex<SlotTable<ActiveSlot>>,
    destroyed: AtomicBool,
}

impl ActiveShared {
    fn dispatch(&self, slot: DispatchSlot, payload: Payload) {
        let event = self
            .slots
            .lock()
            .get(slot)
            .filter(|s| s.active)
            .map(|s| s.event.clone());
        let Some(event) = event else {
            trace!(dispatcher = %self.name, slot = slot.index(), "trigger on inactive slot dropped");
            return;
        };
        if let Err(e) = event.fire_payload(payload) {
            warn!(dispatcher = %self.name, event = event.id(), error = %e, "dispatched fire failed");
        }
    }
}

/// Dispatcher that fires registered events on its own thread.
pub struct ActiveEventDispatcher {
    shared: Arc<ActiveShared>,
    commands: Sender<Command>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ActiveEventDispatcher {
    /// Start a dispatcher thread named after `name`.
    pub fn new(name: impl Into<String>, exceptions: ExceptionStorageConfig) -> RtResult<Self> {
        let name = name.into();
        let shared = Arc::new(ActiveShared {
            name: name.clone(),
            slots: Mutex::new(SlotTable::new()),
            destroyed: AtomicBool::new(false),
        });
        let (commands, inbox) = unbounded();
        let worker = shared.clone();
        let thread = thread::Builder::new()
            .name(format!("tempo-dispatch-{}", name))
            .spawn(move || {
                ErrorStorage::install(&exceptions);
                for command in inbox {
                    match command {
                        Command::Trigger(slot, payload) => worker.dispatch(slot, payload),
                        Command::Stop => break,
                    }
                }
                ErrorStorage::uninstall();
            })
            .map_err(|_| raise(RtError::IllegalState("failed to spawn dispatcher thread")))?;
        debug!(dispatcher = %name, "active event dispatcher started");
        Ok(Self {
            shared,
            commands,
            thread: Mutex::new(Some(thread)),
        })
    }

    fn ensure_live(&self) -> RtResult<()> {
        if self.shared.destroyed.load(Ordering::Acquire) {
            return Err(destroyed());
        }
        Ok(())
    }

    /// Bind `event`, inactive. An event is bound to at most one dispatcher.
    pub fn register(&self, event: &AsyncEvent) -> RtResult<DispatchSlot> {
        self.ensure_live()?;
        let mut slots = self.shared.slots.lock();
        if event.dispatch_slot().is_some() {
            return Err(raise(RtError::IllegalState("event is already bound to a dispatcher")));
        }
        let slot = slots.insert(ActiveSlot {
            event: event.clone(),
            active: false,
        });
        event.core().set_slot(Some(slot));
        trace!(dispatcher = %self.shared.name, event = event.id(), slot = slot.index(), "registered");
        Ok(slot)
    }

    /// Serve triggers on `slot`.
    pub fn activate(&self, slot: DispatchSlot) -> RtResult<()> {
        self.set_active(slot, true)
    }

    /// Drop triggers on `slot` until reactivated.
    pub fn deactivate(&self, slot: DispatchSlot) -> RtResult<()> {
        self.set_active(slot, false)
    }

    fn set_active(&self, slot: DispatchSlot, active: bool) -> RtResult<()> {
        self.ensure_live()?;
        let mut slots = self.shared.slots.lock();
        let entry = slots.get_mut(slot).ok_or_else(unknown_slot)?;
        entry.active = active;
        Ok(())
    }

    /// Unbind the event in `slot`.
    pub fn deregister(&self, slot: DispatchSlot) -> RtResult<()> {
        let entry = self.shared.slots.lock().remove(slot).ok_or_else(unknown_slot)?;
        entry.event.core().set_slot(None);
        Ok(())
    }

    /// Fire the event in `slot` on the dispatcher thread.
    pub fn trigger(&self, slot: DispatchSlot, payload: Payload) -> RtResult<()> {
        self.ensure_live()?;
        if self.shared.slots.lock().get(slot).is_none() {
            return Err(unknown_slot());
        }
        self.commands
            .send(Command::Trigger(slot, payload))
            .map_err(|_| destroyed())
    }

    /// Number of bound events.
    pub fn registered_count(&self) -> usize {
        self.shared.slots.lock().len()
    }

    /// Stop the dispatcher thread.
    ///
    /// Fails with `IllegalState` while any event is still registered.
    pub fn destroy(&self) -> RtResult<()> {
        {
            let slots = self.shared.slots.lock();
            if slots.len() > 0 {
                return Err(raise(RtError::IllegalState("dispatcher still has registered events")));
            }
            if self.shared.destroyed.swap(true, Ordering::AcqRel) {
                return Ok(());
            }
        }
        let _ = self.commands.send(Command::Stop);
        join_unless_current(self.thread.lock().take());
        debug!(dispatcher = %self.shared.name, "active event dispatcher destroyed");
        Ok(())
    }
}

impl Drop for ActiveEventDispatcher {
    fn drop(&mut self) {
        let leftover = self.shared.slots.lock().drain();
        for entry in leftover {
            entry.event.core().set_slot(None);
        }
        self.shared.destroyed.store(true, Ordering::Release);
        let _ = self.commands.send(Command::Stop);
        join_unless_current(self.thread.lock().take());
    }
}

impl fmt::Debug for ActiveEventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveEventDispatcher")
            .field("name", &self.shared.name)
            .field("registered", &self.registered_count())
            .field("destroyed", &self.shared.destroyed.load(Ordering::Acquire))
            .finish()
    }
}

// ============================================================================
// Time dispatcher
// ============================================================================

/// Target of a [`TimeDispatcher`].
pub trait TimedFire: Send + Sync {
    /// The scheduled time `now` was reached. Returns the next expiry, if any.
    fn on_expiry(&self, now: AbsoluteTime) -> Option<AbsoluteTime>;
}

struct TimedSlot {
    target: Weak<dyn TimedFire>,
    epoch: u64,
    active: bool,
}

struct TimeState {
    slots: SlotTable<TimedSlot>,
    queue: BinaryHeap<Reverse<(AbsoluteTime, DispatchSlot, u64)>>,
    stopped: bool,
    destroyed: bool,
}

struct TimeShared {
    clock: Arc<dyn Clock>,
    state: Mutex<TimeState>,
    wake: Condvar,
}

impl TimeShared {
    fn run(&self) {
        let mut state = self.state.lock();
        loop {
            if state.stopped {
                break;
            }
            let now = self.clock.now();
            let Some(&Reverse((at, slot, epoch))) = state.queue.peek() else {
                self.wake.wait(&mut state);
                continue;
            };
            if at > now {
                let wait = at.saturating_since(now).min(self.clock.max_sleep_slice());
                self.wake.wait_for(&mut state, wait);
                continue;
            }
            state.queue.pop();
            let target = match state.slots.get(slot) {
                Some(s) if s.epoch == epoch && s.active => s.target.upgrade(),
                _ => None,
            };
            let Some(target) = target else { continue };
            // The target is dropped before relocking.
            let next = MutexGuard::unlocked(&mut state, move || target.on_expiry(now));
            if let Some(next) = next {
                if state.slots.get(slot).is_some_and(|s| s.epoch == epoch) {
                    state.queue.push(Reverse((next, slot, epoch)));
                }
            }
        }
    }
}

/// Dispatcher that fires time-driven targets from its own thread.
pub struct TimeDispatcher {
    shared: Arc<TimeShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TimeDispatcher {
    /// Start a dispatcher thread reading `clock`.
    pub fn new(clock: Arc<dyn Clock>, exceptions: ExceptionStorageConfig) -> RtResult<Self> {
        let shared = Arc::new(TimeShared {
            clock,
            state: Mutex::new(TimeState {
                slots: SlotTable::new(),
                queue: BinaryHeap::new(),
                stopped: false,
                destroyed: false,
            }),
            wake: Condvar::new(),
        });
        let worker = shared.clone();
        let thread = thread::Builder::new()
            .name("tempo-timer".to_string())
            .spawn(move || {
                ErrorStorage::install(&exceptions);
                worker.run();
                ErrorStorage::uninstall();
            })
            .map_err(|_| raise(RtError::IllegalState("failed to spawn timer thread")))?;
        Ok(Self {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut TimeState) -> RtResult<R>) -> RtResult<R> {
        let mut state = self.shared.state.lock();
        if state.destroyed {
            return Err(destroyed());
        }
        f(&mut state)
    }

    /// Bind `target`, inactive and unscheduled.
    pub fn register(&self, target: Weak<dyn TimedFire>) -> RtResult<DispatchSlot> {
        self.with_state(|state| {
            Ok(state.slots.insert(TimedSlot {
                target,
                epoch: 0,
                active: false,
            }))
        })
    }

    /// Serve expiries of `slot`.
    pub fn activate(&self, slot: DispatchSlot) -> RtResult<()> {
        self.with_state(|state| {
            state.slots.get_mut(slot).ok_or_else(unknown_slot)?.active = true;
            Ok(())
        })
    }

    /// Skip expiries of `slot` until reactivated.
    pub fn deactivate(&self, slot: DispatchSlot) -> RtResult<()> {
        self.with_state(|state| {
            state.slots.get_mut(slot).ok_or_else(unknown_slot)?.active = false;
            Ok(())
        })
    }

    /// Expire `slot` at `at`, replacing any earlier schedule.
    pub fn schedule(&self, slot: DispatchSlot, at: AbsoluteTime) -> RtResult<()> {
        self.with_state(|state| {
            let entry = state.slots.get_mut(slot).ok_or_else(unknown_slot)?;
            entry.epoch += 1;
            let epoch = entry.epoch;
            state.queue.push(Reverse((at, slot, epoch)));
            Ok(())
        })?;
        self.shared.wake.notify_one();
        Ok(())
    }

    /// Drop any pending expiry of `slot`.
    pub fn cancel(&self, slot: DispatchSlot) -> RtResult<()> {
        self.with_state(|state| {
            state.slots.get_mut(slot).ok_or_else(unknown_slot)?.epoch += 1;
            Ok(())
        })
    }

    /// Unbind `slot`.
    pub fn deregister(&self, slot: DispatchSlot) -> RtResult<()> {
        let mut state = self.shared.state.lock();
        state.slots.remove(slot).ok_or_else(unknown_slot)?;
        Ok(())
    }

    /// Number of bound targets.
    pub fn registered_count(&self) -> usize {
        self.shared.state.lock().slots.len()
    }

    /// Stop the dispatcher thread.
    ///
    /// Fails with `IllegalState` while any target is still registered.
    pub fn destroy(&self) -> RtResult<()> {
        {
            let mut state = self.shared.state.lock();
            if state.slots.len() > 0 {
                return Err(raise(RtError::IllegalState("dispatcher still has registered timers")));
            }
            state.destroyed = true;
        }
        self.stop();
        Ok(())
    }

    /// Stop the dispatcher thread regardless of registrations.
    pub(crate) fn stop(&self) {
        self.shared.state.lock().stopped = true;
        self.shared.wake.notify_all();
        join_unless_current(self.thread.lock().take());
    }
}

impl Drop for TimeDispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for TimeDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("TimeDispatcher")
            .field("registered", &state.slots.len())
            .field("scheduled", &state.queue.len())
            .field("stopped", &state.stopped)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::{ManualClock, MonotonicClock};
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    fn wait_for(mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        done()
    }

    #[test]
    fn test_slot_table_generations() {
        let mut table = SlotTable::new();
        let a = table.insert("a");
        assert_eq!(table.remove(a), Some("a"));
        let b = table.insert("b");
        assert_eq!(a.index(), b.index());
        assert_ne!(a, b);
        assert_eq!(table.get(a), None);
        assert_eq!(table.get(b), Some(&"b"));
        assert_eq!(table.remove(a), None);
    }

    #[test]
    fn test_active_dispatcher_lifecycle() {
        let dispatcher = ActiveEventDispatcher::new("test", ExceptionStorageConfig::default()).unwrap();
        let event = AsyncEvent::new(Arc::new(MonotonicClock::new()));
        let slot = dispatcher.register(&event).unwrap();
        assert_eq!(event.dispatch_slot(), Some(slot));
        assert!(dispatcher.register(&event).is_err());

        dispatcher.activate(slot).unwrap();
        dispatcher.trigger(slot, Payload::Long(1)).unwrap();
        dispatcher.deactivate(slot).unwrap();

        assert!(matches!(dispatcher.destroy(), Err(RtError::IllegalState(_))));
        dispatcher.deregister(slot).unwrap();
        assert_eq!(event.dispatch_slot(), None);
        assert!(dispatcher.deregister(slot).is_err());

        dispatcher.destroy().unwrap();
        assert!(dispatcher.register(&event).is_err());
    }

    struct Counter {
        hits: AtomicUsize,
        every: Option<Duration>,
    }

    impl TimedFire for Counter {
        fn on_expiry(&self, now: AbsoluteTime) -> Option<AbsoluteTime> {
            self.hits.fetch_add(1, Ordering::SeqCst);
            self.every.map(|d| now + d)
        }
    }

    #[test]
    fn test_time_dispatcher_fires_on_manual_clock() {
        let clock = ManualClock::new();
        let dispatcher = TimeDispatcher::new(Arc::new(clock.clone()), ExceptionStorageConfig::default()).unwrap();
        let target = Arc::new(Counter {
            hits: AtomicUsize::new(0),
            every: Some(Duration::from_millis(10)),
        });
        let weak: Weak<dyn TimedFire> = Arc::downgrade(&target) as Weak<dyn TimedFire>;
        let slot = dispatcher.register(weak).unwrap();
        dispatcher.activate(slot).unwrap();
        dispatcher.schedule(slot, AbsoluteTime::from_millis(10)).unwrap();

        thread::sleep(Duration::from_millis(20));
        assert_eq!(target.hits.load(Ordering::SeqCst), 0);

        clock.advance(Duration::from_millis(10));
        assert!(wait_for(|| target.hits.load(Ordering::SeqCst) == 1));
        clock.advance(Duration::from_millis(10));
        assert!(wait_for(|| target.hits.load(Ordering::SeqCst) == 2));

        dispatcher.cancel(slot).unwrap();
        clock.advance(Duration::from_millis(50));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(target.hits.load(Ordering::SeqCst), 2);

        assert!(dispatcher.destroy().is_err());
        dispatcher.deregister(slot).unwrap();
        dispatcher.destroy().unwrap();
    }
}
