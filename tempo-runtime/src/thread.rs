//! Realtime threads.
//!
//! A [`RealtimeThread`] is an OS thread registered with the runtime's
//! scheduler and running under an [`ExecutionContext`]: its logic starts in
//! the thread's initial memory area, may be forbidden from touching the
//! heap, and sees the thread's interrupt token at every interruption point.
//!
//! Periodic threads wait for their first release before the logic starts
//! and call [`RealtimeContext::wait_for_next_release`] between releases.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, error, warn};

use crate::affinity::Affinity;
use crate::error::{raise, ErrorStorage, RtError, RtResult};
use crate::event::{Payload, RegionScoped, Schedulable};
use crate::interrupt::InterruptToken;
use crate::memory::{ExecutionContext, MemoryArea, MemoryParameters};
use crate::monitor::TaskControl;
use crate::panic::catch_panic_unchecked;
use crate::release::{first_release, Arrival, FirstRelease, ReleaseKind, ReleaseParameters};
use crate::runtime::Runtime;
use crate::scheduler::{PriorityParameters, Scheduler};
use crate::time::{AbsoluteTime, Clock};

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

struct ThreadShared {
    name: String,
    task: Arc<TaskControl>,
    release: RwLock<Arc<ReleaseParameters>>,
    memory: Option<Arc<MemoryParameters>>,
    area: MemoryArea,
    no_heap: bool,
    affinity: Affinity,
    interrupt: InterruptToken,
    scheduler: Arc<dyn Scheduler>,
    misses: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
struct Periodic {
    first: FirstRelease,
    period: Duration,
    /// Release that `first.anchor` belongs to.
    base: u64,
}

impl Periodic {
    fn nominal(&self, n: u64) -> AbsoluteTime {
        if n == 0 {
            self.first.release_at
        } else {
            self.first.nth(self.period, n - self.base)
        }
    }

    /// Continue from release `n` with a new period.
    fn rebase(&mut self, n: u64, period: Duration) {
        let at = self.nominal(n);
        self.first.anchor = at;
        self.base = n;
        self.period = period;
    }
}

/// What the logic of a realtime thread sees of its thread.
pub struct RealtimeContext {
    shared: Arc<ThreadShared>,
    clock: Arc<dyn Clock>,
    periodic: Option<Periodic>,
    release: u64,
}

impl RealtimeContext {
    /// Thread name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Task control block of the thread.
    pub fn task(&self) -> &Arc<TaskControl> {
        &self.shared.task
    }

    /// Interrupt token of the thread.
    pub fn interrupt_token(&self) -> &InterruptToken {
        &self.shared.interrupt
    }

    /// Current time on the runtime clock.
    pub fn now(&self) -> AbsoluteTime {
        self.clock.now()
    }

    /// 0-based number of the current release.
    pub fn release_number(&self) -> u64 {
        self.release
    }

    /// Deadline misses observed so far.
    pub fn deadline_miss_count(&self) -> u64 {
        self.shared.misses.load(Ordering::Acquire)
    }

    /// Block until the next periodic release.
    ///
    /// Returns `Ok(false)` when the release just finished missed its
    /// deadline; the miss handler, if any, has been released. A period
    /// changed on the release parameters applies from this release on: the
    /// next release is due one new period after the current one. A rousable
    /// thread is woken by an interrupt with `Err(Interrupted)`; otherwise
    /// the interrupt stays pending until the next interruption point.
    pub fn wait_for_next_release(&mut self) -> RtResult<bool> {
        let Some(periodic) = self.periodic.as_mut() else {
            return Err(raise(RtError::IllegalState("thread is not periodic")));
        };
        let snapshot = self.shared.release.read().snapshot();
        if let Some(period) = snapshot.period().filter(|p| *p != periodic.period) {
            debug!(thread = %self.shared.name, release = self.release, old = ?periodic.period, new = ?period, "period changed");
            periodic.rebase(self.release, period);
        }
        let periodic = *periodic;
        let deadline = snapshot.deadline().unwrap_or(periodic.period);
        let due = periodic.nominal(self.release) + deadline;
        let now = self.clock.now();

        let on_time = now <= due;
        if !on_time {
            self.shared.misses.fetch_add(1, Ordering::AcqRel);
            debug!(thread = %self.shared.name, release = self.release, "deadline missed");
            if let Some(handler) = &snapshot.miss_handler {
                if let Err(e) = handler.deliver(Arrival::new(now, Payload::None), false) {
                    warn!(thread = %self.shared.name, error = %e, "could not release miss handler");
                }
            }
        }

        self.release += 1;
        let next = periodic.nominal(self.release);
        if snapshot.rousable {
            self.clock.wait_until(next, &self.shared.interrupt)?;
        } else {
            self.clock.wait_until(next, &InterruptToken::new())?;
        }
        Ok(on_time)
    }
}

impl fmt::Debug for RealtimeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealtimeContext")
            .field("name", &self.shared.name)
            .field("release", &self.release)
            .finish()
    }
}

/// Handle of a running realtime thread.
pub struct RealtimeThread {
    shared: Arc<ThreadShared>,
    handle: JoinHandle<RtResult<()>>,
}

impl RealtimeThread {
    /// Thread name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Task control block of the thread.
    pub fn task(&self) -> &Arc<TaskControl> {
        &self.shared.task
    }

    /// Whether the logic has returned.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Deadline misses observed so far.
    pub fn deadline_miss_count(&self) -> u64 {
        self.shared.misses.load(Ordering::Acquire)
    }

    /// Wait for the logic to return and hand back its result.
    ///
    /// A panic in the logic is contained on the thread and surfaces as
    /// `IllegalState`.
    pub fn join(self) -> RtResult<()> {
        match self.handle.join() {
            Ok(result) => result,
            Err(_) => Err(raise(RtError::IllegalState("realtime thread panicked"))),
        }
    }
}

impl Schedulable for RealtimeThread {
    fn name(&self) -> &str {
        &self.shared.name
    }

    fn priority(&self) -> PriorityParameters {
        PriorityParameters::new(self.shared.task.base_priority())
    }

    fn set_priority(&self, params: PriorityParameters) -> RtResult<()> {
        self.shared.scheduler.validate(&params)?;
        self.shared.task.set_base_priority(params.priority());
        Ok(())
    }

    fn release_parameters(&self) -> Arc<ReleaseParameters> {
        self.shared.release.read().clone()
    }

    fn set_release_parameters(&self, params: Arc<ReleaseParameters>) {
        *self.shared.release.write() = params;
    }

    fn affinity(&self) -> Affinity {
        self.shared.affinity.clone()
    }

    fn interrupt(&self) {
        self.shared.interrupt.interrupt();
    }
}

impl RegionScoped for RealtimeThread {
    fn initial_area(&self) -> &MemoryArea {
        &self.shared.area
    }

    fn is_no_heap(&self) -> bool {
        self.shared.no_heap
    }

    fn memory_parameters(&self) -> Option<Arc<MemoryParameters>> {
        self.shared.memory.clone()
    }
}

impl fmt::Debug for RealtimeThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealtimeThread")
            .field("name", &self.shared.name)
            .field("priority", &self.shared.task.base_priority())
            .field("area", &self.shared.area.id())
            .field("no_heap", &self.shared.no_heap)
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Builder for [`RealtimeThread`]; obtained from [`Runtime::thread`].
pub struct ThreadBuilder<'rt> {
    runtime: &'rt Runtime,
    name: Option<String>,
    priority: Option<PriorityParameters>,
    release: Option<Arc<ReleaseParameters>>,
    memory: Option<Arc<MemoryParameters>>,
    area: Option<MemoryArea>,
    no_heap: bool,
    affinity: Option<Affinity>,
}

impl<'rt> ThreadBuilder<'rt> {
    pub(crate) fn new(runtime: &'rt Runtime) -> Self {
        Self {
            runtime,
            name: None,
            priority: None,
            release: None,
            memory: None,
            area: None,
            no_heap: false,
            affinity: None,
        }
    }

    /// Thread name.
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

    /// Area the logic starts in. Default: heap, or immortal when no-heap.
    pub fn area(mut self, area: MemoryArea) -> Self {
        self.area = Some(area);
        self
    }

    /// Forbid heap access from the logic.
    pub fn no_heap(mut self, no_heap: bool) -> Self {
        self.no_heap = no_heap;
        self
    }

    /// Processor affinity. Default: every CPU.
    pub fn affinity(mut self, affinity: Affinity) -> Self {
        self.affinity = Some(affinity);
        self
    }

    /// Validate the parameters and start the thread.
    ///
    /// The first release of a periodic thread is resolved here, so a strict
    /// phasing start already in the past fails with `LateStart` before any
    /// thread is created.
    pub fn spawn<F>(self, logic: F) -> RtResult<RealtimeThread>
    where
        F: FnOnce(&mut RealtimeContext) -> RtResult<()> + Send + 'static,
    {
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
            return Err(raise(RtError::MemoryAccess("no-heap thread cannot run in the heap")));
        }

        let release = self.release.unwrap_or_else(ReleaseParameters::aperiodic);
        let clock = rt.clock().clone();
        let periodic = match release.kind() {
            ReleaseKind::Periodic { start, period, phasing } => {
                let now = clock.now();
                let first = first_release(start.resolve(now), period, phasing, now)?;
                Some(Periodic { first, period, base: 0 })
            }
            _ => None,
        };

        let id = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
        let name = self.name.unwrap_or_else(|| format!("realtime-{}", id));
        let shared = Arc::new(ThreadShared {
            task: TaskControl::new(name.clone(), priority.priority()),
            name: name.clone(),
            release: RwLock::new(release),
            memory: self.memory,
            area,
            no_heap: self.no_heap,
            affinity,
            interrupt: InterruptToken::new(),
            scheduler,
            misses: AtomicU64::new(0),
        });

        let exceptions = rt.config().exceptions.clone();
        let mut cx = RealtimeContext {
            shared: shared.clone(),
            clock,
            periodic,
            release: 0,
        };
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                ErrorStorage::install(&exceptions);
                let me = thread::current().id();
                cx.shared.scheduler.register(me, &cx.shared.task);
                let result = match catch_panic_unchecked(|| run(&mut cx, base, logic)).into_result() {
                    Ok(result) => result,
                    Err(panic) => {
                        error!(
                            thread = panic.thread_name().unwrap_or("unnamed"),
                            panic = panic.count(),
                            message = panic.message(),
                            "realtime thread panicked"
                        );
                        Err(raise(RtError::IllegalState("realtime thread panicked")))
                    }
                };
                if let Err(e) = &result {
                    debug!(thread = %cx.shared.name, error = %e, "realtime thread failed");
                }
                cx.shared.scheduler.deregister(me);
                ErrorStorage::uninstall();
                result
            })
            .map_err(|_| raise(RtError::IllegalState("failed to spawn realtime thread")))?;

        debug!(thread = %name, priority = priority.priority(), periodic = periodic.is_some(), "realtime thread started");
        Ok(RealtimeThread { shared, handle })
    }
}

fn run<F>(cx: &mut RealtimeContext, base: MemoryArea, logic: F) -> RtResult<()>
where
    F: FnOnce(&mut RealtimeContext) -> RtResult<()>,
{
    let shared = cx.shared.clone();
    let _context = ExecutionContext::new(base.clone(), shared.task.clone())
        .no_heap(shared.no_heap)
        .interrupt_token(shared.interrupt.clone())
        .memory_parameters(shared.memory.clone())
        .initial_area(shared.area.clone())
        .install()?;

    if let Some(periodic) = cx.periodic {
        cx.clock.wait_until(periodic.first.release_at, &InterruptToken::new())?;
    }

    let area = &shared.area;
    if *area == base {
        logic(cx)
    } else if area.is_scoped() {
        area.enter(|| logic(cx))?
    } else {
        area.execute_in_area(|| logic(cx))?
    }
}
