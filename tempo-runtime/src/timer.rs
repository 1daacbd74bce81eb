//! # Timers
//!
//! A timer is an [`AsyncEvent`] fired by the runtime's
//! [`TimeDispatcher`] when the clock reaches its fire time. Handlers are
//! attached to [`OneShotTimer::event`] or [`PeriodicTimer::event`] like to
//! any other event.
//!
//! Timer fires skip the `Except` overflow policy of their handlers: an
//! arrival that finds a full queue is dropped instead of failing the fire.
//!
//! A periodic timer resolves its first release with its [`PhasingPolicy`]
//! when started; release `n` is then due at `anchor + n * period`. A timer
//! driving a periodic handler re-reads the handler's period on every expiry
//! and, when it changed, continues from the last release with the new one.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::dispatcher::{DispatchSlot, TimeDispatcher, TimedFire};
use crate::error::{raise, RtError, RtResult};
use crate::event::{AsyncEvent, AsyncEventHandler, Fireable, Payload, Schedulable};
use crate::release::{first_release, FirstRelease, PhasingPolicy, ReleaseKind, StartTime};
use crate::runtime::Runtime;
use crate::time::{AbsoluteTime, Clock};

#[derive(Debug, Clone, Copy)]
enum Cadence {
    Once,
    Periodic { period: Duration, first: FirstRelease, n: u64 },
}

#[derive(Debug)]
struct TimerState {
    running: bool,
    fire_time: Option<AbsoluteTime>,
    cadence: Cadence,
}

struct TimerCore {
    event: AsyncEvent,
    state: Mutex<TimerState>,
    fires: AtomicU64,
    follows: Mutex<Option<Weak<AsyncEventHandler>>>,
}

impl TimerCore {
    /// Current period of the followed handler's release parameters.
    fn followed_period(&self) -> Option<Duration> {
        let handler = self.follows.lock().as_ref().and_then(Weak::upgrade)?;
        match handler.release_parameters().kind() {
            ReleaseKind::Periodic { period, .. } => Some(period),
            _ => None,
        }
    }
}

impl TimedFire for TimerCore {
    fn on_expiry(&self, now: AbsoluteTime) -> Option<AbsoluteTime> {
        let latest = self.followed_period();
        let next = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if !state.running {
                return None;
            }
            match &mut state.cadence {
                Cadence::Once => {
                    state.running = false;
                    state.fire_time = None;
                    None
                }
                Cadence::Periodic { period, first, n } => {
                    if let Some(latest) = latest.filter(|p| *p != *period) {
                        let last = if *n == 0 { first.release_at } else { first.nth(*period, *n) };
                        debug!(event = self.event.id(), old = ?*period, new = ?latest, %last, "timer period changed");
                        *first = FirstRelease {
                            release_at: last,
                            anchor: last,
                        };
                        *period = latest;
                        *n = 0;
                    }
                    *n += 1;
                    let next = first.nth(*period, *n);
                    state.fire_time = Some(next);
                    Some(next)
                }
            }
        };
        let count = self.fires.fetch_add(1, Ordering::AcqRel) + 1;
        trace!(event = self.event.id(), fire = count, %now, "timer expired");
        if let Err(e) = self.event.fire_from_timer() {
            debug!(event = self.event.id(), error = %e, "timer fire rejected by a handler");
        }
        next
    }
}

/// Registration shared by both timer kinds.
struct Timer {
    core: Arc<TimerCore>,
    dispatcher: Arc<TimeDispatcher>,
    clock: Arc<dyn Clock>,
    slot: DispatchSlot,
}

impl Timer {
    fn new(runtime: &Runtime, cadence: Cadence) -> RtResult<Self> {
        let core = Arc::new(TimerCore {
            event: runtime.event(),
            state: Mutex::new(TimerState {
                running: false,
                fire_time: None,
                cadence,
            }),
            fires: AtomicU64::new(0),
            follows: Mutex::new(None),
        });
        let dispatcher = runtime.time_dispatcher().clone();
        let target: Weak<dyn TimedFire> = Arc::downgrade(&core) as Weak<dyn TimedFire>;
        let slot = dispatcher.register(target)?;
        Ok(Self {
            core,
            dispatcher,
            clock: runtime.clock().clone(),
            slot,
        })
    }

    fn arm(&self, at: AbsoluteTime, cadence: Cadence) -> RtResult<()> {
        {
            let mut state = self.core.state.lock();
            state.running = true;
            state.fire_time = Some(at);
            state.cadence = cadence;
        }
        self.dispatcher.activate(self.slot)?;
        self.dispatcher.schedule(self.slot, at)?;
        debug!(event = self.core.event.id(), %at, "timer armed");
        Ok(())
    }

    fn ensure_stopped(&self) -> RtResult<()> {
        if self.is_running() {
            return Err(raise(RtError::IllegalState("timer is already running")));
        }
        Ok(())
    }

    fn stop(&self) -> bool {
        let was_running = {
            let mut state = self.core.state.lock();
            state.fire_time = None;
            std::mem::replace(&mut state.running, false)
        };
        let _ = self.dispatcher.cancel(self.slot);
        let _ = self.dispatcher.deactivate(self.slot);
        was_running
    }

    fn is_running(&self) -> bool {
        self.core.state.lock().running
    }

    fn fire_time(&self) -> Option<AbsoluteTime> {
        self.core.state.lock().fire_time
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let _ = self.dispatcher.deregister(self.slot);
    }
}

/// Timer that fires once at a given time.
pub struct OneShotTimer {
    timer: Timer,
    at: Mutex<StartTime>,
}

impl OneShotTimer {
    pub(crate) fn new(runtime: &Runtime, at: StartTime) -> RtResult<Self> {
        Ok(Self {
            timer: Timer::new(runtime, Cadence::Once)?,
            at: Mutex::new(at),
        })
    }

    /// Event fired on expiry.
    pub fn event(&self) -> &AsyncEvent {
        &self.timer.core.event
    }

    /// Arm the timer. A relative fire time counts from now; a time already
    /// passed fires immediately.
    pub fn start(&self) -> RtResult<()> {
        self.timer.ensure_stopped()?;
        let at = self.at.lock().resolve(self.timer.clock.now());
        self.timer.arm(at, Cadence::Once)
    }

    /// Disarm the timer. Returns whether it was running.
    pub fn stop(&self) -> bool {
        self.timer.stop()
    }

    /// Change the fire time; a running timer is rearmed with it.
    pub fn reschedule(&self, at: StartTime) -> RtResult<()> {
        *self.at.lock() = at;
        if self.timer.stop() {
            self.start()?;
        }
        Ok(())
    }

    /// Whether the timer is armed.
    pub fn is_running(&self) -> bool {
        self.timer.is_running()
    }

    /// Time of the next expiry while armed.
    pub fn fire_time(&self) -> Option<AbsoluteTime> {
        self.timer.fire_time()
    }

    /// Expiries so far.
    pub fn fire_count(&self) -> u64 {
        self.timer.core.fires.load(Ordering::Acquire)
    }
}

impl Fireable for OneShotTimer {
    fn fire_payload(&self, payload: Payload) -> RtResult<()> {
        self.event().fire_payload(payload)
    }

    fn is_enabled(&self) -> bool {
        self.event().is_enabled()
    }
}

impl fmt::Debug for OneShotTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OneShotTimer")
            .field("event", &self.event().id())
            .field("running", &self.is_running())
            .field("fire_time", &self.fire_time())
            .finish()
    }
}

#[derive(Debug, Clone, Copy)]
struct PeriodicPlan {
    start: StartTime,
    period: Duration,
    phasing: PhasingPolicy,
}

/// Timer that fires every period from a start time.
pub struct PeriodicTimer {
    timer: Timer,
    plan: Mutex<PeriodicPlan>,
}

impl PeriodicTimer {
    pub(crate) fn new(runtime: &Runtime, start: StartTime, period: Duration) -> RtResult<Self> {
        if period.is_zero() {
            return Err(raise(RtError::IllegalArgument("period must be positive")));
        }
        Ok(Self {
            timer: Timer::new(runtime, Cadence::Once)?,
            plan: Mutex::new(PeriodicPlan {
                start,
                period,
                phasing: PhasingPolicy::AdjustImmediate,
            }),
        })
    }

    /// Phasing used when the start time has already passed at `start()`.
    /// Default: `AdjustImmediate`.
    pub fn with_phasing(self, phasing: PhasingPolicy) -> Self {
        self.plan.lock().phasing = phasing;
        self
    }

    /// Event fired on every expiry.
    pub fn event(&self) -> &AsyncEvent {
        &self.timer.core.event
    }

    /// Arm the timer.
    ///
    /// Fails with `LateStart` under `StrictPhasing` when the start time has
    /// already passed.
    pub fn start(&self) -> RtResult<()> {
        self.timer.ensure_stopped()?;
        let plan = *self.plan.lock();
        let now = self.timer.clock.now();
        let first = first_release(plan.start.resolve(now), plan.period, plan.phasing, now)?;
        let cadence = Cadence::Periodic {
            period: plan.period,
            first,
            n: 0,
        };
        debug!(event = self.event().id(), first = %first.release_at, period = ?plan.period, "periodic timer started");
        self.timer.arm(first.release_at, cadence)
    }

    /// Disarm the timer. Returns whether it was running.
    pub fn stop(&self) -> bool {
        self.timer.stop()
    }

    /// Change the start time; a running timer is restarted with it.
    pub fn reschedule(&self, start: StartTime) -> RtResult<()> {
        self.plan.lock().start = start;
        if self.timer.stop() {
            self.start()?;
        }
        Ok(())
    }

    /// Change the period; a running timer is restarted with it.
    pub fn set_interval(&self, period: Duration) -> RtResult<()> {
        if period.is_zero() {
            return Err(raise(RtError::IllegalArgument("period must be positive")));
        }
        self.plan.lock().period = period;
        if self.timer.stop() {
            self.start()?;
        }
        Ok(())
    }

    /// Period between expiries.
    pub fn interval(&self) -> Duration {
        match self.timer.core.state.lock().cadence {
            Cadence::Periodic { period, .. } => period,
            Cadence::Once => self.plan.lock().period,
        }
    }

    /// Take the period from `handler`'s release parameters at every expiry.
    pub(crate) fn follow(&self, handler: &Arc<AsyncEventHandler>) {
        *self.timer.core.follows.lock() = Some(Arc::downgrade(handler));
    }

    /// Whether the timer is armed.
    pub fn is_running(&self) -> bool {
        self.timer.is_running()
    }

    /// Time of the next expiry while armed.
    pub fn fire_time(&self) -> Option<AbsoluteTime> {
        self.timer.fire_time()
    }

    /// Expiries so far.
    pub fn fire_count(&self) -> u64 {
        self.timer.core.fires.load(Ordering::Acquire)
    }
}

impl Fireable for PeriodicTimer {
    fn fire_payload(&self, payload: Payload) -> RtResult<()> {
        self.event().fire_payload(payload)
    }

    fn is_enabled(&self) -> bool {
        self.event().is_enabled()
    }
}

impl fmt::Debug for PeriodicTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeriodicTimer")
            .field("event", &self.event().id())
            .field("period", &self.interval())
            .field("running", &self.is_running())
            .field("fire_time", &self.fire_time())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::ManualClock;
    use std::thread;
    use std::time::Instant;

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
    fn test_one_shot_fires_once() {
        let clock = ManualClock::new();
        let rt = Runtime::builder().clock(clock.clone()).build().unwrap();
        let timer = rt.one_shot_timer(StartTime::Relative(Duration::from_millis(5))).unwrap();
        timer.start().unwrap();
        assert!(timer.is_running());
        assert!(timer.start().is_err());
        assert_eq!(timer.fire_time(), Some(AbsoluteTime::from_millis(5)));

        clock.advance(Duration::from_millis(5));
        assert!(wait_for(|| timer.fire_count() == 1));
        assert!(wait_for(|| !timer.is_running()));
        clock.advance(Duration::from_millis(50));
        thread::sleep(Duration::from_millis(10));
        assert_eq!(timer.fire_count(), 1);
    }

    #[test]
    fn test_stopped_timer_does_not_fire() {
        let clock = ManualClock::new();
        let rt = Runtime::builder().clock(clock.clone()).build().unwrap();
        let timer = rt.one_shot_timer(StartTime::Relative(Duration::from_millis(5))).unwrap();
        timer.start().unwrap();
        assert!(timer.stop());
        assert!(!timer.stop());
        clock.advance(Duration::from_millis(10));
        thread::sleep(Duration::from_millis(10));
        assert_eq!(timer.fire_count(), 0);
    }

    #[test]
    fn test_periodic_follows_period() {
        let clock = ManualClock::new();
        let rt = Runtime::builder().clock(clock.clone()).build().unwrap();
        let timer = rt
            .periodic_timer(StartTime::Relative(Duration::from_millis(10)), Duration::from_millis(10))
            .unwrap();
        timer.start().unwrap();
        for expected in 1..=3 {
            clock.advance(Duration::from_millis(10));
            assert!(wait_for(|| timer.fire_count() == expected));
        }
        assert_eq!(timer.fire_time(), Some(AbsoluteTime::from_millis(40)));
        timer.stop();
    }

    #[test]
    fn test_strict_phasing_rejects_past_start() {
        let clock = ManualClock::starting_at(AbsoluteTime::from_millis(2000));
        let rt = Runtime::builder().clock(clock).build().unwrap();
        let timer = rt
            .periodic_timer(StartTime::Absolute(AbsoluteTime::from_millis(1000)), Duration::from_millis(100))
            .unwrap()
            .with_phasing(PhasingPolicy::StrictPhasing);
        assert!(matches!(timer.start(), Err(RtError::LateStart { .. })));
        assert!(!timer.is_running());
    }

    #[test]
    fn test_dropping_timer_frees_its_slot() {
        let rt = Runtime::builder().clock(ManualClock::new()).build().unwrap();
        let before = rt.time_dispatcher().registered_count();
        let timer = rt.one_shot_timer(StartTime::default()).unwrap();
        assert_eq!(rt.time_dispatcher().registered_count(), before + 1);
        drop(timer);
        assert_eq!(rt.time_dispatcher().registered_count(), before);
    }
}
