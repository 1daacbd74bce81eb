//! # Runtime Context
//!
//! A [`Runtime`] owns what would otherwise be process-wide singletons: the
//! heap and immortal regions, the default scheduler, the default release
//! runner, the time dispatcher and the clock. Everything else is created
//! through it and borrows or clones from it.
//!
//! # Example
//!
//! ```rust,ignore
//! use tempo_runtime::{Runtime, RuntimeConfig};
//!
//! let rt = Runtime::new(RuntimeConfig::from_env())?;
//! let event = rt.event();
//! let handler = rt.handler(|cx| {
//!     tracing::info!(payload = ?cx.payload(), "released");
//!     Ok(())
//! }).build()?;
//! event.add_handler(&handler);
//! event.fire_long(42)?;
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::config::RuntimeConfig;
use crate::dispatcher::{ActiveEventDispatcher, TimeDispatcher};
use crate::error::{raise, ErrorStorage, RtError, RtResult};
use crate::event::{AsyncEvent, AsyncEventHandler, HandlerBuilder, ReleaseContext, Schedulable};
use crate::logging;
use crate::memory::{ContextGuard, ExecutionContext, MemoryArea};
use crate::monitor::{Monitor, MonitorControl, TaskControl};
use crate::release::{ReleaseKind, StartTime};
use crate::runner::{FirstInFirstOutReleaseRunner, PoolSizer, ReleaseRunner};
use crate::scheduler::{FirstInFirstOutScheduler, PriorityParameters, Scheduler};
use crate::thread::ThreadBuilder;
use crate::time::{AbsoluteTime, Clock, MonotonicClock};
use crate::timer::{OneShotTimer, PeriodicTimer};

/// Explicit runtime context.
pub struct Runtime {
    config: RuntimeConfig,
    heap: MemoryArea,
    immortal: MemoryArea,
    scheduler: Arc<dyn Scheduler>,
    runner: Arc<dyn ReleaseRunner>,
    time_dispatcher: Arc<TimeDispatcher>,
    clock: Arc<dyn Clock>,
    monitor_control: RwLock<MonitorControl>,
    shut_down: AtomicBool,
}

impl Runtime {
    /// Runtime over `config`, timed by a monotonic clock.
    pub fn new(config: RuntimeConfig) -> RtResult<Self> {
        RuntimeBuilder::new().config(config).build()
    }

    /// Builder for a runtime with a custom clock or pool sizing.
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    /// Configuration the runtime was built with.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// The heap region.
    pub fn heap(&self) -> &MemoryArea {
        &self.heap
    }

    /// The immortal region.
    pub fn immortal(&self) -> &MemoryArea {
        &self.immortal
    }

    /// Default scheduler.
    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    /// Default release runner.
    pub fn release_runner(&self) -> Arc<dyn ReleaseRunner> {
        self.runner.clone()
    }

    /// Dispatcher serving the runtime's timers.
    pub fn time_dispatcher(&self) -> &Arc<TimeDispatcher> {
        &self.time_dispatcher
    }

    /// Runtime clock.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Current time on the runtime clock.
    pub fn now(&self) -> AbsoluteTime {
        self.clock.now()
    }

    /// Make the calling thread a schedulable of this runtime.
    ///
    /// The thread gets error storage, a task control block registered with
    /// the scheduler, and an execution context based on the heap. Both are
    /// dropped with the returned guard.
    pub fn attach_current_thread(&self, priority: Option<PriorityParameters>) -> RtResult<AttachGuard> {
        let priority = priority.unwrap_or_else(|| PriorityParameters::new(self.scheduler.norm_priority()));
        self.scheduler.validate(&priority)?;
        let current = thread::current();
        let name = current.name().unwrap_or("attached").to_string();
        let task = TaskControl::new(name, priority.priority());
        let context = ExecutionContext::new(self.heap.clone(), task.clone()).install()?;
        let installed = ErrorStorage::install(&self.config.exceptions);
        self.scheduler.register(current.id(), &task);
        debug!(thread = ?current.id(), priority = priority.priority(), "thread attached");
        Ok(AttachGuard {
            scheduler: self.scheduler.clone(),
            thread: current.id(),
            installed,
            _task: task,
            _context: context,
        })
    }

    /// New scoped region of `size` bytes, or the configured default size.
    pub fn new_scoped(&self, size: Option<usize>) -> RtResult<MemoryArea> {
        MemoryArea::scoped(size.unwrap_or(self.config.memory.default_scope_size))
    }

    /// New enabled event with no handlers.
    pub fn event(&self) -> AsyncEvent {
        AsyncEvent::new(self.clock.clone())
    }

    /// Start building a handler running `logic`.
    pub fn handler<F>(&self, logic: F) -> HandlerBuilder<'_>
    where
        F: Fn(&ReleaseContext<'_>) -> RtResult<()> + Send + Sync + 'static,
    {
        HandlerBuilder::new(self, logic)
    }

    /// Start building a realtime thread.
    pub fn thread(&self) -> ThreadBuilder<'_> {
        ThreadBuilder::new(self)
    }

    /// Monitor guarding `value` under the default monitor control.
    pub fn monitor<T>(&self, value: T) -> Monitor<T> {
        Monitor::new(value, self.monitor_control())
    }

    /// Monitor control given to new monitors.
    pub fn monitor_control(&self) -> MonitorControl {
        *self.monitor_control.read()
    }

    /// Change the monitor control given to new monitors.
    ///
    /// Existing monitors keep theirs.
    pub fn set_monitor_control(&self, control: MonitorControl) -> RtResult<()> {
        if let Some(ceiling) = control.ceiling_priority() {
            self.scheduler.validate(&PriorityParameters::new(ceiling))?;
        }
        *self.monitor_control.write() = control;
        Ok(())
    }

    /// Timer firing once at `at`.
    pub fn one_shot_timer(&self, at: StartTime) -> RtResult<OneShotTimer> {
        OneShotTimer::new(self, at)
    }

    /// Timer firing every `period` from `start`.
    pub fn periodic_timer(&self, start: StartTime, period: std::time::Duration) -> RtResult<PeriodicTimer> {
        PeriodicTimer::new(self, start, period)
    }

    /// Release a periodic handler from a timer built from its parameters.
    ///
    /// Fails with `IllegalArgument` unless the handler's release parameters
    /// are periodic, and with `LateStart` under strict phasing when the start
    /// has already passed. The handler stays released for as long as the
    /// returned timer lives; a new period set on its release parameters
    /// takes effect from the next expiry.
    pub fn start_periodic(&self, handler: &Arc<AsyncEventHandler>) -> RtResult<PeriodicTimer> {
        let ReleaseKind::Periodic { start, period, phasing } = handler.release_parameters().kind() else {
            return Err(raise(RtError::IllegalArgument("handler release parameters are not periodic")));
        };
        let timer = self.periodic_timer(start, period)?.with_phasing(phasing);
        timer.follow(handler);
        timer.event().add_handler(handler);
        timer.start()?;
        Ok(timer)
    }

    /// New active event dispatcher named `name`.
    pub fn active_dispatcher(&self, name: &str) -> RtResult<ActiveEventDispatcher> {
        ActiveEventDispatcher::new(name, self.config.exceptions.clone())
    }

    /// Stop the release runner and the time dispatcher. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.runner.shutdown();
        self.time_dispatcher.stop();
        info!("runtime shut down");
    }

    /// Whether [`Runtime::shutdown`] ran.
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("scheduler", &self.scheduler.policy_name())
            .field("heap", &self.heap.id())
            .field("immortal", &self.immortal.id())
            .field("clock", &self.clock)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

/// Keeps the calling thread attached to a runtime; see
/// [`Runtime::attach_current_thread`].
#[must_use = "the thread is detached as soon as the guard is dropped"]
pub struct AttachGuard {
    scheduler: Arc<dyn Scheduler>,
    thread: thread::ThreadId,
    installed: bool,
    _task: Arc<TaskControl>,
    _context: ContextGuard,
}

impl Drop for AttachGuard {
    fn drop(&mut self) {
        self.scheduler.deregister(self.thread);
        if self.installed {
            ErrorStorage::uninstall();
        }
    }
}

impl fmt::Debug for AttachGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttachGuard").field("thread", &self.thread).finish()
    }
}

/// Builder for [`Runtime`].
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    clock: Option<Arc<dyn Clock>>,
    pool_sizer: Option<PoolSizer>,
    with_logging: bool,
}

impl RuntimeBuilder {
    /// Builder with the default configuration.
    pub fn new() -> Self {
        Self {
            config: RuntimeConfig::default(),
            clock: None,
            pool_sizer: None,
            with_logging: false,
        }
    }

    /// Configuration to build with.
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Clock to time the runtime by. Default: a monotonic clock.
    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Some(Arc::new(clock));
        self
    }

    /// Pool sizing function of the default release runner.
    pub fn pool_sizer(mut self, sizer: PoolSizer) -> Self {
        self.pool_sizer = Some(sizer);
        self
    }

    /// Install the `tracing` subscriber from the log configuration.
    pub fn with_logging(mut self, enabled: bool) -> Self {
        self.with_logging = enabled;
        self
    }

    /// Validate the configuration and start the runtime's threads.
    pub fn build(self) -> RtResult<Runtime> {
        let config = self.config;
        config.validate()?;
        if self.with_logging {
            logging::init(&config.log);
        }

        let clock = self.clock.unwrap_or_else(|| Arc::new(MonotonicClock::new()));
        let scheduler: Arc<dyn Scheduler> = Arc::new(FirstInFirstOutScheduler::new(&config.scheduler));
        let runner: Arc<dyn ReleaseRunner> = match self.pool_sizer {
            Some(sizer) => Arc::new(FirstInFirstOutReleaseRunner::with_sizer(
                config.scheduler.max_workers,
                config.exceptions.clone(),
                sizer,
            )),
            None => Arc::new(FirstInFirstOutReleaseRunner::new(
                config.scheduler.max_workers,
                config.exceptions.clone(),
            )),
        };
        let time_dispatcher = Arc::new(TimeDispatcher::new(clock.clone(), config.exceptions.clone())?);

        debug!(
            min_priority = config.scheduler.min_priority,
            max_priority = config.scheduler.max_priority,
            max_workers = config.scheduler.max_workers,
            "runtime started"
        );
        Ok(Runtime {
            heap: MemoryArea::heap(config.memory.heap_size),
            immortal: MemoryArea::immortal(config.memory.immortal_size),
            scheduler,
            runner,
            time_dispatcher,
            clock,
            monitor_control: RwLock::new(MonitorControl::default()),
            shut_down: AtomicBool::new(false),
            config,
        })
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfigBuilder;
    use crate::memory::current_task;
    use crate::release::ReleaseParameters;
    use crate::time::ManualClock;
    use std::time::Duration;

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = RuntimeConfigBuilder::new().priority_range(20, 10).build_unchecked();
        let err = Runtime::new(config).unwrap_err();
        assert!(matches!(err, RtError::Config(_)));
    }

    #[test]
    fn test_attach_current_thread() {
        let rt = Runtime::builder().clock(ManualClock::new()).build().unwrap();
        {
            let _guard = rt.attach_current_thread(Some(PriorityParameters::new(25))).unwrap();
            assert_eq!(current_task().base_priority(), 25);
            assert!(rt.attach_current_thread(Some(PriorityParameters::new(99))).is_err());
        }
    }

    #[test]
    fn test_monitor_control_default() {
        let rt = Runtime::builder().clock(ManualClock::new()).build().unwrap();
        assert_eq!(rt.monitor_control(), MonitorControl::PriorityInheritance);
        rt.set_monitor_control(MonitorControl::ceiling(30)).unwrap();
        assert_eq!(rt.monitor(0u32).control(), MonitorControl::ceiling(30));
        assert!(rt.set_monitor_control(MonitorControl::ceiling(500)).is_err());
    }

    #[test]
    fn test_start_periodic_requires_periodic_handler() {
        let rt = Runtime::builder().clock(ManualClock::new()).build().unwrap();
        let handler = rt.handler(|_| Ok(())).build().unwrap();
        assert!(matches!(rt.start_periodic(&handler), Err(RtError::IllegalArgument(_))));

        let params = ReleaseParameters::periodic(StartTime::default(), Duration::from_millis(10)).unwrap();
        handler.set_release_parameters(params);
        let timer = rt.start_periodic(&handler).unwrap();
        assert!(timer.is_running());
        assert!(timer.event().handled_by(&handler));
    }

    #[test]
    fn test_start_periodic_picks_up_new_period() {
        let clock = ManualClock::new();
        let rt = Runtime::builder().clock(clock.clone()).build().unwrap();
        let params = ReleaseParameters::periodic(StartTime::Relative(Duration::from_millis(10)), Duration::from_millis(10))
            .unwrap();
        let handler = rt.handler(|_| Ok(())).release(params.clone()).build().unwrap();
        let timer = rt.start_periodic(&handler).unwrap();
        let settle = |expected: u64| {
            let deadline = std::time::Instant::now() + Duration::from_secs(5);
            while timer.fire_count() < expected && std::time::Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(1));
            }
            assert_eq!(timer.fire_count(), expected);
        };

        clock.advance(Duration::from_millis(10));
        settle(1);
        assert_eq!(timer.fire_time(), Some(AbsoluteTime::from_millis(20)));

        params.set_period(Duration::from_millis(50)).unwrap();
        clock.advance(Duration::from_millis(10));
        settle(2);
        assert_eq!(timer.fire_time(), Some(AbsoluteTime::from_millis(70)));
        assert_eq!(timer.interval(), Duration::from_millis(50));

        clock.advance(Duration::from_millis(30));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(timer.fire_count(), 2);
        timer.stop();
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let rt = Runtime::builder().clock(ManualClock::new()).build().unwrap();
        rt.shutdown();
        rt.shutdown();
        assert!(rt.is_shut_down());
    }
}
