//! Asynchronous event handlers.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, trace, warn};

use super::async_event::EventCore;
use super::payload::Payload;
use super::{RegionScoped, Schedulable};
use crate::affinity::Affinity;
use crate::error::{raise, RtError, RtResult};
use crate::interrupt::InterruptToken;
use crate::memory::{ExecutionContext, MemoryArea, MemoryParameters};
use crate::monitor::TaskControl;
use crate::panic::{catch_panic_unchecked, CatchResult};
use crate::release::{Admission, Arrival, ArrivalQueue, ReleaseParameters, ReleaseSnapshot};
use crate::runner::ReleaseRunner;
use crate::runtime::Runtime;
use crate::scheduler::{PriorityParameters, Scheduler};
use crate::time::{AbsoluteTime, Clock};

static NEXT_HANDLER_ID: AtomicU64 = AtomicU64::new(1);

type Logic = Box<dyn Fn(&ReleaseContext<'_>) -> RtResult<()> + Send + Sync>;

/// Lifecycle state of a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    /// Attached to no event.
    Unarmed,
    /// Attached only to disabled events.
    ArmedDisabled,
    /// Attached to at least one enabled event.
    ArmedEnabled,
    /// A release is executing.
    Running,
    /// Destroyed; fires are discarded.
    Destroyed,
}

/// What the handler logic sees of the release it runs.
pub struct ReleaseContext<'a> {
    handler: &'a AsyncEventHandler,
    arrival: Arrival,
    number: u64,
    deadline: Option<AbsoluteTime>,
    snapshot: ReleaseSnapshot,
}

impl ReleaseContext<'_> {
    /// Handler being released.
    pub fn handler(&self) -> &AsyncEventHandler {
        self.handler
    }

    /// Payload of the fire behind this release.
    pub fn payload(&self) -> &Payload {
        &self.arrival.payload
    }

    /// Arrival time of the fire behind this release.
    pub fn arrival_time(&self) -> AbsoluteTime {
        self.arrival.time
    }

    /// 1-based release number.
    pub fn release_number(&self) -> u64 {
        self.number
    }

    /// Absolute deadline of this release, if any.
    pub fn deadline(&self) -> Option<AbsoluteTime> {
        self.deadline
    }

    /// Release parameters in force for this release.
    pub fn parameters(&self) -> &ReleaseSnapshot {
        &self.snapshot
    }
}

#[derive(Debug)]
struct FireState {
    pending: usize,
    arrivals: ArrivalQueue,
}

/// Schedulable released by asynchronous events.
///
/// Handlers are created through [`Runtime::handler`] and shared as
/// `Arc<AsyncEventHandler>`. Events keep only weak references: dropping the
/// last `Arc` removes the handler from every event it was attached to.
///
/// A handler keeps a pending fire count and an arrival queue. Each fire
/// that passes the handler's release rules adds one pending release; the
/// release runner then runs the logic once per pending release, in arrival
/// order, never concurrently with itself.
pub struct AsyncEventHandler {
    id: u64,
    name: String,
    weak_self: Weak<AsyncEventHandler>,
    logic: Logic,
    release: RwLock<Arc<ReleaseParameters>>,
    memory: Option<Arc<MemoryParameters>>,
    area: MemoryArea,
    base: MemoryArea,
    no_heap: bool,
    affinity: Affinity,
    task: Arc<TaskControl>,
    interrupt: InterruptToken,
    scheduler: Arc<dyn Scheduler>,
    runner: Arc<dyn ReleaseRunner>,
    clock: Arc<dyn Clock>,
    state: Mutex<FireState>,
    events: Mutex<Vec<Weak<EventCore>>>,
    scheduled: AtomicBool,
    running: AtomicBool,
    destroyed: AtomicBool,
    releases: AtomicU64,
    misses: AtomicU64,
    overruns: AtomicU64,
}

impl AsyncEventHandler {
    /// Handler ID.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Handler name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Task control block the logic runs under.
    pub fn task(&self) -> &Arc<TaskControl> {
        &self.task
    }

    /// Current lifecycle state.
    pub fn state(&self) -> HandlerState {
        if self.destroyed.load(Ordering::Acquire) {
            return HandlerState::Destroyed;
        }
        if self.running.load(Ordering::Acquire) {
            return HandlerState::Running;
        }
        let events: Vec<Arc<EventCore>> = self.events.lock().iter().filter_map(Weak::upgrade).collect();
        if events.is_empty() {
            HandlerState::Unarmed
        } else if events.iter().any(|e| e.is_enabled()) {
            HandlerState::ArmedEnabled
        } else {
            HandlerState::ArmedDisabled
        }
    }

    /// Releases still owed to this handler.
    pub fn pending_fire_count(&self) -> usize {
        self.state.lock().pending
    }

    /// Reset the pending fire count to zero, discarding queued arrivals.
    pub fn get_and_clear_pending_fire_count(&self) -> usize {
        let mut state = self.state.lock();
        state.arrivals.clear();
        std::mem::take(&mut state.pending)
    }

    /// Drop one pending release, oldest arrival first.
    pub fn get_and_decrement_pending_fire_count(&self) -> usize {
        let mut state = self.state.lock();
        let previous = state.pending;
        if previous > 0 {
            state.pending -= 1;
            if state.arrivals.len() > state.pending {
                state.arrivals.pop();
            }
        }
        previous
    }

    /// Owe one more release, without a queued arrival.
    pub fn get_and_increment_pending_fire_count(&self) -> usize {
        let previous = {
            let mut state = self.state.lock();
            state.pending += 1;
            state.pending - 1
        };
        self.request_release();
        previous
    }

    /// Arrivals currently queued.
    pub fn queued_arrivals(&self) -> usize {
        self.state.lock().arrivals.len()
    }

    /// Releases executed so far.
    pub fn release_count(&self) -> u64 {
        self.releases.load(Ordering::Acquire)
    }

    /// Releases that finished after their deadline.
    pub fn deadline_miss_count(&self) -> u64 {
        self.misses.load(Ordering::Acquire)
    }

    /// Releases that ran longer than their cost.
    pub fn cost_overrun_count(&self) -> u64 {
        self.overruns.load(Ordering::Acquire)
    }

    /// Release this handler directly, as if fired with no payload.
    pub fn release(&self) -> RtResult<Admission> {
        self.deliver(Arrival::new(self.clock.now(), Payload::None), false)
    }

    /// Detach from every event and the release runner; further fires are
    /// discarded. Idempotent.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        let events = std::mem::take(&mut *self.events.lock());
        for core in events.iter().filter_map(Weak::upgrade) {
            core.remove(self);
        }
        self.get_and_clear_pending_fire_count();
        self.runner.detach(self);
        debug!(handler = %self.name, "handler destroyed");
    }

    /// Offer one arrival.
    pub(crate) fn deliver(&self, arrival: Arrival, from_timer: bool) -> RtResult<Admission> {
        if self.destroyed.load(Ordering::Acquire) {
            return Ok(Admission::Dropped);
        }
        let snapshot = self.release_parameters().snapshot();
        let admission = {
            let mut state = self.state.lock();
            let admission = match state.arrivals.admit(arrival, &snapshot, from_timer) {
                Ok(admission) => admission,
                Err(e) => {
                    debug!(handler = %self.name, error = %e, "arrival rejected");
                    return Err(e);
                }
            };
            if admission.adds_release() {
                state.pending += 1;
            }
            admission
        };
        trace!(handler = %self.name, ?admission, "arrival offered");
        if admission.adds_release() {
            self.request_release();
        }
        Ok(admission)
    }

    fn request_release(&self) {
        if self.scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        match self.weak_self.upgrade() {
            Some(me) => self.runner.release(me),
            None => self.scheduled.store(false, Ordering::Release),
        }
    }

    /// Run one pending release on the calling thread.
    ///
    /// Returns false when nothing was pending.
    pub(crate) fn run_once(&self) -> bool {
        if self.destroyed.load(Ordering::Acquire) {
            return false;
        }
        let (arrival, number) = {
            let mut state = self.state.lock();
            if state.pending == 0 {
                return false;
            }
            state.pending -= 1;
            let arrival = match state.arrivals.pop() {
                Some(arrival) => arrival,
                None => Arrival::new(self.clock.now(), Payload::None),
            };
            (arrival, self.releases.fetch_add(1, Ordering::AcqRel) + 1)
        };

        let snapshot = self.release_parameters().snapshot();
        let deadline = snapshot.deadline().map(|d| arrival.time + d);
        let cost = snapshot.cost;
        let miss_handler = snapshot.miss_handler.clone();
        let overrun_handler = snapshot.overrun_handler.clone();
        let cx = ReleaseContext {
            handler: self,
            arrival,
            number,
            deadline,
            snapshot,
        };

        self.running.store(true, Ordering::Release);
        let started = self.clock.now();
        self.execute(&cx);
        let finished = self.clock.now();
        self.running.store(false, Ordering::Release);
        self.interrupt.clear();

        if !cost.is_zero() && finished.saturating_since(started) > cost {
            self.overruns.fetch_add(1, Ordering::AcqRel);
            debug!(handler = %self.name, release = number, ?cost, "cost overrun");
            Self::notify(overrun_handler.as_deref(), finished);
        }
        if deadline.is_some_and(|d| finished > d) {
            self.misses.fetch_add(1, Ordering::AcqRel);
            debug!(handler = %self.name, release = number, "deadline missed");
            Self::notify(miss_handler.as_deref(), finished);
        }
        true
    }

    fn execute(&self, cx: &ReleaseContext<'_>) {
        let context = ExecutionContext::new(self.base.clone(), self.task.clone())
            .no_heap(self.no_heap)
            .interrupt_token(self.interrupt.clone())
            .memory_parameters(self.memory.clone())
            .initial_area(self.area.clone());
        let _context = match context.install() {
            Ok(guard) => guard,
            Err(e) => {
                warn!(handler = %self.name, error = %e, "could not install execution context");
                return;
            }
        };

        let logic = || catch_panic_unchecked(|| (self.logic)(cx));
        let outcome = if self.area == self.base {
            Ok(logic())
        } else if self.area.is_scoped() {
            self.area.enter(logic)
        } else {
            self.area.execute_in_area(logic)
        };

        match outcome {
            Ok(CatchResult::Ok(Ok(()))) => {}
            Ok(CatchResult::Ok(Err(e))) => {
                warn!(handler = %self.name, release = cx.number, error = %e, "handler logic failed");
            }
            Ok(CatchResult::Panicked(panic)) => {
                error!(
                    handler = %self.name,
                    release = cx.number,
                    worker = panic.thread_name().unwrap_or("unnamed"),
                    panic = panic.count(),
                    message = panic.message(),
                    "handler logic panicked"
                );
            }
            Err(e) => {
                warn!(handler = %self.name, region = %self.area.id(), error = %e, "could not enter handler area");
            }
        }
    }

    fn notify(handler: Option<&AsyncEventHandler>, at: AbsoluteTime) {
        let Some(handler) = handler else { return };
        if let Err(e) = handler.deliver(Arrival::new(at, Payload::None), false) {
            warn!(handler = %handler.name, error = %e, "could not release handler");
        }
    }

    /// Run releases until none are pending.
    pub(crate) fn run(&self) -> u64 {
        let mut ran = 0;
        while self.run_once() {
            ran += 1;
        }
        ran
    }

    /// Called by a runner after a release. Returns true if the handler must
    /// be released again; otherwise the handler is marked idle.
    pub(crate) fn settle(&self) -> bool {
        let owes = || !self.destroyed.load(Ordering::Acquire) && self.state.lock().pending > 0;
        if owes() {
            return true;
        }
        self.scheduled.store(false, Ordering::SeqCst);
        // A fire may have seen `scheduled` still set just before the store.
        owes() && !self.scheduled.swap(true, Ordering::SeqCst)
    }

    /// Priority the runner queues this handler at.
    pub(crate) fn ready_priority(&self) -> i32 {
        self.task.active_priority()
    }

    pub(crate) fn joined(&self, core: &Arc<EventCore>) {
        let mut events = self.events.lock();
        events.retain(|e| e.strong_count() > 0);
        if !events.iter().any(|e| e.as_ptr() == Arc::as_ptr(core)) {
            events.push(Arc::downgrade(core));
        }
    }

    pub(crate) fn left(&self, core: &EventCore) {
        self.events
            .lock()
            .retain(|e| e.strong_count() > 0 && !std::ptr::eq(e.as_ptr(), core));
    }
}

impl Schedulable for AsyncEventHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> PriorityParameters {
        PriorityParameters::new(self.task.base_priority())
    }

    fn set_priority(&self, params: PriorityParameters) -> RtResult<()> {
        self.scheduler.validate(&params)?;
        self.task.set_base_priority(params.priority());
        self.runner.priority_changed(self);
        Ok(())
    }

    fn release_parameters(&self) -> Arc<ReleaseParameters> {
        self.release.read().clone()
    }

    fn set_release_parameters(&self, params: Arc<ReleaseParameters>) {
        *self.release.write() = params;
    }

    fn affinity(&self) -> Affinity {
        self.affinity.clone()
    }

    fn interrupt(&self) {
        self.interrupt.interrupt();
    }
}

impl RegionScoped for AsyncEventHandler {
    fn initial_area(&self) -> &MemoryArea {
        &self.area
    }

    fn is_no_heap(&self) -> bool {
        self.no_heap
    }

    fn memory_parameters(&self) -> Option<Arc<MemoryParameters>> {
        self.memory.clone()
    }
}

impl Drop for AsyncEventHandler {
    fn drop(&mut self) {
        let events = std::mem::take(&mut *self.events.lock());
        for core in events.iter().filter_map(Weak::upgrade) {
            core.prune();
        }
        self.runner.detach(self);
        trace!(handler = %self.name, "handler dropped");
    }
}

impl fmt::Debug for AsyncEventHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncEventHandler")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("priority", &self.task.base_priority())
            .field("area", &self.area.id())
            .field("no_heap", &self.no_heap)
            .field("pending", &self.pending_fire_count())
            .finish()
    }
}

/// Builder for [`AsyncEventHandler`]; obtained from [`Runtime::handler`].
pub struct HandlerBuilder<'rt> {
    runtime: &'rt Runtime,
    logic: Logic,
    name: Option<String>,
    priority: Option<PriorityParameters>,
    release: Option<Arc<ReleaseParameters>>,
    memory: Option<Arc<MemoryParameters>>,
    area: Option<MemoryArea>,
    no_heap: bool,
    runner: Option<Arc<dyn ReleaseRunner>>,
    affinity: Option<Affinity>,
}

impl<'rt> HandlerBuilder<'rt> {
    pub(crate) fn new<F>(runtime: &'rt Runtime, logic: F) -> Self
    where
        F: Fn(&ReleaseContext<'_>) -> RtResult<()> + Send + Sync + 'static,
    {
        Self {
            runtime,
            logic: Box::new(logic),
            name: None,
            priority: None,
            release: None,
            memory: None,
            area: None,
            no_heap: false,
            runner: None,
            affinity: None,
        }
    }

    /// Name for logs.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Scheduling parameters. Default: the scheduler's norm priority.
    pub fn priority(mut self, params: PriorityParameters) -> Self {
        self.priority = Some(params);
        self
    }

    /// Release parameters. Default: aperiodic.
    pub fn release(mut self, params: Arc<ReleaseParameters>) -> Self {
        self.release = Some(params);
        self
    }

    /// Allocation budgets.
    pub fn memory(mut self, params: Arc<MemoryParameters>) -> Self {
        self.memory = Some(params);
        self
    }

    /// Area the logic runs in. Default: heap, or immortal when no-heap.
    pub fn area(mut self, area: MemoryArea) -> Self {
        self.area = Some(area);
        self
    }

    /// Forbid heap access from the logic.
    pub fn no_heap(mut self, no_heap: bool) -> Self {
        self.no_heap = no_heap;
        self
    }

    /// Release runner. Default: the runtime's FIFO runner.
    pub fn runner(mut self, runner: Arc<dyn ReleaseRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    /// Processor affinity. Default: every CPU.
    pub fn affinity(mut self, affinity: Affinity) -> Self {
        self.affinity = Some(affinity);
        self
    }

    /// Validate and create the handler, attaching it to its runner.
    pub fn build(self) -> RtResult<Arc<AsyncEventHandler>> {
        let rt = self.runtime;
        let scheduler = rt.scheduler().clone();
        let priority = self
            .priority
            .unwrap_or_else(|| PriorityParameters::new(scheduler.norm_priority()));
        scheduler.validate(&priority)?;

        let affinity = self.affinity.unwrap_or_default();
        affinity.ensure_valid()?;

        let base = if self.no_heap { rt.immortal().clone() } else { rt.heap().clone() };
        let area = self.area.unwrap_or_else(|| base.clone());
        if self.no_heap && area.is_heap() {
            return Err(raise(RtError::MemoryAccess("no-heap handler cannot run in the heap")));
        }

        let release = self.release.unwrap_or_else(ReleaseParameters::aperiodic);
        let initial_length = release.snapshot().initial_queue_length;
        let runner = self.runner.unwrap_or_else(|| rt.release_runner());
        let id = NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed);
        let name = self.name.unwrap_or_else(|| format!("handler-{}", id));

        let handler = Arc::new_cyclic(|weak_self| AsyncEventHandler {
            id,
            task: TaskControl::new(name.clone(), priority.priority()),
            name,
            weak_self: weak_self.clone(),
            logic: self.logic,
            release: RwLock::new(release),
            memory: self.memory,
            area,
            base,
            no_heap: self.no_heap,
            affinity,
            interrupt: InterruptToken::new(),
            scheduler,
            runner,
            clock: rt.clock().clone(),
            state: Mutex::new(FireState {
                pending: 0,
                arrivals: ArrivalQueue::new(initial_length),
            }),
            events: Mutex::new(Vec::new()),
            scheduled: AtomicBool::new(false),
            running: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            releases: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            overruns: AtomicU64::new(0),
        });
        handler.runner.attach(&handler)?;
        debug!(
            handler = %handler.name,
            priority = priority.priority(),
            region = %handler.area.id(),
            no_heap = handler.no_heap,
            "handler created"
        );
        Ok(handler)
    }
}
