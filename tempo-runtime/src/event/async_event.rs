//! Asynchronous events.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use super::handler::AsyncEventHandler;
use super::payload::Payload;
use super::Fireable;
use crate::dispatcher::DispatchSlot;
use crate::error::{RtError, RtResult};
use crate::release::Arrival;
use crate::time::Clock;

static NEXT_EVENT_ID: AtomicU64 = AtomicU64::new(1);

type HandlerSet = Arc<Vec<Weak<AsyncEventHandler>>>;

/// Shared state of an event.
pub(crate) struct EventCore {
    id: u64,
    /// Replaced wholesale on every mutation; `fire` works on a snapshot.
    handlers: RwLock<HandlerSet>,
    enabled: AtomicBool,
    clock: Arc<dyn Clock>,
    slot: Mutex<Option<DispatchSlot>>,
}

impl EventCore {
    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    fn snapshot(&self) -> HandlerSet {
        self.handlers.read().clone()
    }

    fn update(&self, f: impl FnOnce(&mut Vec<Weak<AsyncEventHandler>>)) {
        let mut handlers = self.handlers.write();
        let mut next: Vec<_> = handlers.iter().filter(|h| h.strong_count() > 0).cloned().collect();
        f(&mut next);
        *handlers = Arc::new(next);
    }

    pub(crate) fn remove(&self, handler: &AsyncEventHandler) {
        self.update(|set| set.retain(|h| !std::ptr::eq(h.as_ptr(), handler)));
    }

    /// Drop entries of handlers that no longer exist.
    pub(crate) fn prune(&self) {
        self.update(|_| {});
    }

    pub(crate) fn set_slot(&self, slot: Option<DispatchSlot>) -> Option<DispatchSlot> {
        std::mem::replace(&mut *self.slot.lock(), slot)
    }

    fn fire_with(&self, payload: Payload, from_timer: bool) -> RtResult<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        let now = self.clock.now();
        let handlers = self.snapshot();
        trace!(event = self.id, handlers = handlers.len(), "fire");

        let mut failure: Option<RtError> = None;
        for handler in handlers.iter().filter_map(Weak::upgrade) {
            if let Err(e) = handler.deliver(Arrival::new(now, payload.clone()), from_timer) {
                failure = Some(match failure {
                    Some(first) => RtError::prevailing(first, e),
                    None => e,
                });
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Event that releases a set of handlers when fired.
///
/// Clones share the same event. Enabling, disabling and changing the
/// handler set are atomic with respect to [`AsyncEvent::fire`]: a fire sees
/// either the old or the new set, never a mix.
#[derive(Clone)]
pub struct AsyncEvent {
    core: Arc<EventCore>,
}

impl AsyncEvent {
    /// Enabled event with no handlers, timed by `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            core: Arc::new(EventCore {
                id: NEXT_EVENT_ID.fetch_add(1, Ordering::Relaxed),
                handlers: RwLock::new(Arc::new(Vec::new())),
                enabled: AtomicBool::new(true),
                clock,
                slot: Mutex::new(None),
            }),
        }
    }

    /// Event ID.
    pub fn id(&self) -> u64 {
        self.core.id
    }

    /// Fire without data.
    ///
    /// Every handler is offered the arrival even if an earlier one fails.
    /// When several fail, the error returned is the one with the highest
    /// [`RtError::precedence`].
    pub fn fire(&self) -> RtResult<()> {
        self.core.fire_with(Payload::None, false)
    }

    /// Fire carrying an integer.
    pub fn fire_long(&self, value: i64) -> RtResult<()> {
        self.core.fire_with(Payload::Long(value), false)
    }

    /// Fire carrying a shared object.
    pub fn fire_object<T: std::any::Any + Send + Sync>(&self, value: T) -> RtResult<()> {
        self.core.fire_with(Payload::object(value), false)
    }

    /// Fire from a timer; `Except` queue overflow is ignored on this path.
    pub(crate) fn fire_from_timer(&self) -> RtResult<()> {
        self.core.fire_with(Payload::None, true)
    }

    /// Let fires reach handlers.
    pub fn enable(&self) {
        self.core.enabled.store(true, Ordering::Release);
    }

    /// Make fires no-ops. Idempotent.
    pub fn disable(&self) {
        self.core.enabled.store(false, Ordering::Release);
    }

    /// Attach `handler`. Attaching a handler twice has no effect.
    pub fn add_handler(&self, handler: &Arc<AsyncEventHandler>) {
        let target = Arc::as_ptr(handler);
        self.core.update(|set| {
            if !set.iter().any(|h| h.as_ptr() == target) {
                set.push(Arc::downgrade(handler));
            }
        });
        handler.joined(&self.core);
        debug!(event = self.core.id, handler = handler.name(), "handler attached");
    }

    /// Detach `handler`.
    pub fn remove_handler(&self, handler: &AsyncEventHandler) {
        self.core.remove(handler);
        handler.left(&self.core);
    }

    /// Replace every handler with `handler`, or with none.
    pub fn set_handler(&self, handler: Option<&Arc<AsyncEventHandler>>) {
        let previous = self.core.snapshot();
        self.core.update(|set| {
            set.clear();
            if let Some(h) = handler {
                set.push(Arc::downgrade(h));
            }
        });
        for old in previous.iter().filter_map(Weak::upgrade) {
            if handler.map_or(true, |h| !Arc::ptr_eq(h, &old)) {
                old.left(&self.core);
            }
        }
        if let Some(h) = handler {
            h.joined(&self.core);
        }
    }

    /// Whether `handler` is attached.
    pub fn handled_by(&self, handler: &AsyncEventHandler) -> bool {
        self.core
            .snapshot()
            .iter()
            .any(|h| std::ptr::eq(h.as_ptr(), handler) && h.strong_count() > 0)
    }

    /// Number of live attached handlers.
    pub fn handler_count(&self) -> usize {
        self.core.snapshot().iter().filter(|h| h.strong_count() > 0).count()
    }

    /// Dispatcher slot this event is registered in, if any.
    pub fn dispatch_slot(&self) -> Option<DispatchSlot> {
        *self.core.slot.lock()
    }

    pub(crate) fn core(&self) -> &Arc<EventCore> {
        &self.core
    }
}

impl Fireable for AsyncEvent {
    fn fire_payload(&self, payload: Payload) -> RtResult<()> {
        self.core.fire_with(payload, false)
    }

    fn is_enabled(&self) -> bool {
        self.core.is_enabled()
    }
}

impl fmt::Debug for AsyncEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncEvent")
            .field("id", &self.core.id)
            .field("enabled", &self.core.is_enabled())
            .field("handlers", &self.handler_count())
            .finish()
    }
}
