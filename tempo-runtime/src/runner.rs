//! # Release Runners
//!
//! A release runner turns "this handler has a pending release" into the
//! handler's logic running on some thread.
//!
//! - [`FirstInFirstOutReleaseRunner`]: a pool of worker threads serving a
//!   shared priority ready queue. The pool is sized by a pluggable
//!   [`PoolSizer`] from the current [`PoolDemand`].
//! - [`BoundReleaseRunner`]: one dedicated thread per handler.
//!
//! Both deliver the releases of one handler in arrival order and never run
//! one handler on two threads at once: a handler is in a runner's queue at
//! most once, and is requeued only after its current release finished.
//!
//! ## Pool worker loop
//!
//! ```text
//! loop {
//!     pick the head of the highest ready level
//!     run one release of that handler
//!     if it still owes releases:
//!         put it back at the head of its level (it keeps the CPU unless
//!         something of strictly higher priority is ready)
//! }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};

use crossbeam_channel::{unbounded, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, trace, warn};

use crate::config::{num_cpus, ExceptionStorageConfig};
use crate::error::{raise, ErrorStorage, RtError, RtResult};
use crate::event::AsyncEventHandler;
use crate::scheduler::ReadyQueue;

/// Runs the releases of attached handlers.
pub trait ReleaseRunner: Send + Sync + fmt::Debug {
    /// Start serving `handler`.
    fn attach(&self, handler: &Arc<AsyncEventHandler>) -> RtResult<()>;

    /// Stop serving `handler`. Idempotent.
    fn detach(&self, handler: &AsyncEventHandler);

    /// Queue one release of `handler`.
    ///
    /// Called at most once between two releases of the same handler.
    fn release(&self, handler: Arc<AsyncEventHandler>);

    /// The priority of `handler` changed.
    fn priority_changed(&self, _handler: &AsyncEventHandler) {}

    /// Stop every thread of the runner.
    fn shutdown(&self);
}

/// Inputs of a pool sizing decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolDemand {
    /// Attached handlers.
    pub handlers: usize,
    /// Distinct priorities among attached handlers.
    pub distinct_priorities: usize,
    /// Available CPUs.
    pub cpus: usize,
}

/// Pool sizing function.
pub type PoolSizer = Arc<dyn Fn(PoolDemand) -> usize + Send + Sync>;

/// One worker per handler, at most one per CPU for each distinct priority,
/// and never fewer than one.
pub fn default_pool_size(demand: PoolDemand) -> usize {
    demand
        .handlers
        .min(demand.distinct_priorities.saturating_mul(demand.cpus))
        .max(1)
}

struct PoolState {
    ready: ReadyQueue<Weak<AsyncEventHandler>>,
    attached: HashMap<u64, i32>,
    shutdown: bool,
}

struct PoolShared {
    name: String,
    exceptions: ExceptionStorageConfig,
    max_workers: usize,
    sizer: PoolSizer,
    state: Mutex<PoolState>,
    available: Condvar,
    /// Workers alive.
    live: AtomicUsize,
    /// Workers wanted.
    target: AtomicUsize,
    next_worker: AtomicUsize,
    workers: Mutex<Vec<(ThreadId, JoinHandle<()>)>>,
}

impl PoolShared {
    fn demand(state: &PoolState) -> PoolDemand {
        let mut priorities: Vec<i32> = state.attached.values().copied().collect();
        priorities.sort_unstable();
        priorities.dedup();
        PoolDemand {
            handlers: state.attached.len(),
            distinct_priorities: priorities.len(),
            cpus: num_cpus(),
        }
    }

    fn resize(self: &Arc<Self>, state: &PoolState) -> RtResult<()> {
        let demand = Self::demand(state);
        let target = (self.sizer)(demand).clamp(1, self.max_workers.max(1));
        let previous = self.target.swap(target, Ordering::AcqRel);
        if previous != target {
            debug!(runner = %self.name, ?demand, workers = target, "pool resized");
        }
        while self.live.load(Ordering::Acquire) < target {
            self.spawn_worker()?;
        }
        self.available.notify_all();
        Ok(())
    }

    fn spawn_worker(self: &Arc<Self>) -> RtResult<()> {
        let n = self.next_worker.fetch_add(1, Ordering::Relaxed);
        let shared = self.clone();
        self.live.fetch_add(1, Ordering::AcqRel);
        let spawned = thread::Builder::new()
            .name(format!("{}-{}", self.name, n))
            .spawn(move || shared.worker_loop());
        match spawned {
            Ok(handle) => {
                let id = handle.thread().id();
                let mut workers = self.workers.lock();
                workers.retain(|(_, h)| !h.is_finished());
                workers.push((id, handle));
                Ok(())
            }
            Err(e) => {
                self.live.fetch_sub(1, Ordering::AcqRel);
                warn!(runner = %self.name, error = %e, "failed to spawn worker");
                Err(raise(RtError::IllegalState("failed to spawn worker thread")))
            }
        }
    }

    fn next(&self) -> Option<Weak<AsyncEventHandler>> {
        let mut state = self.state.lock();
        loop {
            if state.shutdown {
                self.live.fetch_sub(1, Ordering::AcqRel);
                return None;
            }
            if let Some((_, handler)) = state.ready.pop_highest() {
                return Some(handler);
            }
            // Retire surplus workers while idle.
            let live = self.live.load(Ordering::Acquire);
            if live > self.target.load(Ordering::Acquire)
                && self
                    .live
                    .compare_exchange(live, live - 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                return None;
            }
            self.available.wait(&mut state);
        }
    }

    fn worker_loop(self: Arc<Self>) {
        ErrorStorage::install(&self.exceptions);
        trace!(runner = %self.name, "worker started");
        loop {
            let Some(weak) = self.next() else { break };
            let Some(handler) = weak.upgrade() else { continue };

            handler.run_once();
            if handler.settle() {
                let priority = handler.ready_priority();
                let mut state = self.state.lock();
                if state.ready.peek_priority().is_some_and(|p| p > priority) {
                    trace!(handler = handler.name(), priority, "preempted");
                }
                state.ready.push_front(priority, weak);
                drop(state);
                self.available.notify_one();
            }
            // The handler may be dropped here; never while holding the state lock.
            drop(handler);
        }
        ErrorStorage::uninstall();
        trace!(runner = %self.name, "worker stopped");
    }
}

/// Pool-backed runner with a fixed-priority, FIFO-within-priority ready queue.
pub struct FirstInFirstOutReleaseRunner {
    shared: Arc<PoolShared>,
}

impl FirstInFirstOutReleaseRunner {
    /// Runner whose pool never exceeds `max_workers`.
    pub fn new(max_workers: usize, exceptions: ExceptionStorageConfig) -> Self {
        Self::with_sizer(max_workers, exceptions, Arc::new(default_pool_size))
    }

    /// Runner sized by `sizer`.
    pub fn with_sizer(max_workers: usize, exceptions: ExceptionStorageConfig, sizer: PoolSizer) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                name: "tempo-worker".to_string(),
                exceptions,
                max_workers,
                sizer,
                state: Mutex::new(PoolState {
                    ready: ReadyQueue::new(),
                    attached: HashMap::new(),
                    shutdown: false,
                }),
                available: Condvar::new(),
                live: AtomicUsize::new(0),
                target: AtomicUsize::new(0),
                next_worker: AtomicUsize::new(0),
                workers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Workers currently alive.
    pub fn worker_count(&self) -> usize {
        self.shared.live.load(Ordering::Acquire)
    }

    /// Workers the sizer currently asks for.
    pub fn target_workers(&self) -> usize {
        self.shared.target.load(Ordering::Acquire)
    }

    /// Handlers waiting for a worker.
    pub fn ready_count(&self) -> usize {
        self.shared.state.lock().ready.len()
    }
}

impl ReleaseRunner for FirstInFirstOutReleaseRunner {
    fn attach(&self, handler: &Arc<AsyncEventHandler>) -> RtResult<()> {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            return Err(raise(RtError::IllegalState("release runner is shut down")));
        }
        state.attached.insert(handler.id(), handler.ready_priority());
        self.shared.resize(&state)
    }

    fn detach(&self, handler: &AsyncEventHandler) {
        let mut state = self.shared.state.lock();
        if state.attached.remove(&handler.id()).is_none() {
            return;
        }
        let target: *const AsyncEventHandler = handler;
        state.ready.retain(|w| w.as_ptr() != target);
        if !state.shutdown {
            let _ = self.shared.resize(&state);
        }
    }

    fn release(&self, handler: Arc<AsyncEventHandler>) {
        let priority = handler.ready_priority();
        {
            let mut state = self.shared.state.lock();
            if state.shutdown {
                return;
            }
            state.ready.push_back(priority, Arc::downgrade(&handler));
        }
        self.shared.available.notify_one();
        trace!(handler = handler.name(), priority, "release queued");
    }

    fn priority_changed(&self, handler: &AsyncEventHandler) {
        let mut state = self.shared.state.lock();
        if let Some(priority) = state.attached.get_mut(&handler.id()) {
            *priority = handler.ready_priority();
            let _ = self.shared.resize(&state);
        }
    }

    fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
        }
        self.shared.available.notify_all();
        let me = thread::current().id();
        let workers = std::mem::take(&mut *self.shared.workers.lock());
        for (id, handle) in workers {
            if id != me {
                let _ = handle.join();
            }
        }
        info!(runner = %self.shared.name, "release runner shut down");
    }
}

impl Drop for FirstInFirstOutReleaseRunner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for FirstInFirstOutReleaseRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FirstInFirstOutReleaseRunner")
            .field("workers", &self.worker_count())
            .field("target", &self.target_workers())
            .field("max_workers", &self.shared.max_workers)
            .finish()
    }
}

struct BoundThread {
    wake: Sender<()>,
    thread: ThreadId,
    join: JoinHandle<()>,
}

/// Runner that dedicates one thread to each attached handler.
pub struct BoundReleaseRunner {
    exceptions: ExceptionStorageConfig,
    threads: Mutex<HashMap<u64, BoundThread>>,
    shut_down: AtomicBool,
}

impl BoundReleaseRunner {
    /// Runner with no handlers.
    pub fn new(exceptions: ExceptionStorageConfig) -> Self {
        Self {
            exceptions,
            threads: Mutex::new(HashMap::new()),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Handlers with a dedicated thread.
    pub fn bound_count(&self) -> usize {
        self.threads.lock().len()
    }
}

impl ReleaseRunner for BoundReleaseRunner {
    fn attach(&self, handler: &Arc<AsyncEventHandler>) -> RtResult<()> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(raise(RtError::IllegalState("release runner is shut down")));
        }
        let mut threads = self.threads.lock();
        if threads.contains_key(&handler.id()) {
            return Ok(());
        }
        let (wake, signals) = unbounded::<()>();
        let weak = Arc::downgrade(handler);
        let exceptions = self.exceptions.clone();
        let join = thread::Builder::new()
            .name(format!("tempo-bound-{}", handler.name()))
            .spawn(move || {
                ErrorStorage::install(&exceptions);
                while signals.recv().is_ok() {
                    let Some(handler) = weak.upgrade() else { break };
                    loop {
                        handler.run();
                        if !handler.settle() {
                            break;
                        }
                    }
                }
                ErrorStorage::uninstall();
            })
            .map_err(|_| raise(RtError::IllegalState("failed to spawn bound handler thread")))?;
        debug!(handler = handler.name(), "bound handler thread started");
        threads.insert(
            handler.id(),
            BoundThread {
                wake,
                thread: join.thread().id(),
                join,
            },
        );
        Ok(())
    }

    fn detach(&self, handler: &AsyncEventHandler) {
        // Dropping the sender ends the thread once it is idle.
        self.threads.lock().remove(&handler.id());
    }

    fn release(&self, handler: Arc<AsyncEventHandler>) {
        let threads = self.threads.lock();
        if let Some(bound) = threads.get(&handler.id()) {
            let _ = bound.wake.send(());
        }
    }

    fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let threads = std::mem::take(&mut *self.threads.lock());
        let me = thread::current().id();
        for (_, bound) in threads {
            drop(bound.wake);
            if bound.thread != me {
                let _ = bound.join.join();
            }
        }
    }
}

impl Drop for BoundReleaseRunner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for BoundReleaseRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundReleaseRunner")
            .field("bound", &self.bound_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Runtime;
    use crate::scheduler::PriorityParameters;
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
    fn test_default_pool_size() {
        let size = |handlers, distinct_priorities| {
            default_pool_size(PoolDemand {
                handlers,
                distinct_priorities,
                cpus: 2,
            })
        };
        assert_eq!(size(0, 0), 1);
        assert_eq!(size(3, 1), 2);
        assert_eq!(size(3, 2), 3);
        assert_eq!(size(10, 3), 6);
    }

    #[test]
    fn test_pool_tracks_attachments() {
        let rt = Runtime::new(Default::default()).unwrap();
        let runner = Arc::new(FirstInFirstOutReleaseRunner::with_sizer(
            8,
            ExceptionStorageConfig::default(),
            Arc::new(|demand: PoolDemand| demand.handlers),
        ));
        let handlers: Vec<_> = (0..3)
            .map(|_| rt.handler(|_| Ok(())).runner(runner.clone()).build().unwrap())
            .collect();
        assert_eq!(runner.target_workers(), 3);
        assert!(wait_for(|| runner.worker_count() == 3));

        drop(handlers);
        assert_eq!(runner.target_workers(), 1);
        assert!(wait_for(|| runner.worker_count() == 1));
        runner.shutdown();
    }

    #[test]
    fn test_releases_of_one_handler_stay_ordered() {
        let rt = Runtime::new(Default::default()).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler = rt
            .handler(move |cx| {
                sink.lock().push(cx.payload().as_long().unwrap_or(-1));
                Ok(())
            })
            .build()
            .unwrap();
        let event = rt.event();
        event.add_handler(&handler);
        for v in 0..100 {
            event.fire_long(v).unwrap();
        }
        assert!(wait_for(|| seen.lock().len() == 100));
        assert_eq!(*seen.lock(), (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_higher_priority_served_first() {
        let rt = Runtime::new(Default::default()).unwrap();
        let runner = Arc::new(FirstInFirstOutReleaseRunner::with_sizer(
            1,
            ExceptionStorageConfig::default(),
            Arc::new(|_| 1),
        ));
        let order = Arc::new(Mutex::new(Vec::new()));
        let gate = Arc::new((Mutex::new(false), Condvar::new()));

        let blocker = {
            let gate = gate.clone();
            rt.handler(move |_| {
                let (open, cv) = &*gate;
                let mut open = open.lock();
                while !*open {
                    cv.wait(&mut open);
                }
                Ok(())
            })
            .runner(runner.clone())
            .build()
            .unwrap()
        };
        let make = |name: &'static str, priority| {
            let order = order.clone();
            rt.handler(move |_| {
                order.lock().push(name);
                Ok(())
            })
            .priority(PriorityParameters::new(priority))
            .runner(runner.clone())
            .build()
            .unwrap()
        };
        let low = make("low", 12);
        let high = make("high", 30);

        blocker.release().unwrap();
        assert!(wait_for(|| runner.ready_count() == 0));
        low.release().unwrap();
        high.release().unwrap();
        {
            let (open, cv) = &*gate;
            *open.lock() = true;
            cv.notify_all();
        }
        assert!(wait_for(|| order.lock().len() == 2));
        assert_eq!(*order.lock(), vec!["high", "low"]);
        runner.shutdown();
    }

    #[test]
    fn test_bound_runner() {
        let rt = Runtime::new(Default::default()).unwrap();
        let runner = Arc::new(BoundReleaseRunner::new(ExceptionStorageConfig::default()));
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let handler = rt
            .handler(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .runner(runner.clone())
            .build()
            .unwrap();
        assert_eq!(runner.bound_count(), 1);

        for _ in 0..10 {
            handler.release().unwrap();
        }
        assert!(wait_for(|| count.load(Ordering::SeqCst) == 10));
        handler.destroy();
        assert_eq!(runner.bound_count(), 0);
        runner.shutdown();
    }
}
