//! Periodic, sporadic and aperiodic release parameters.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use super::policy::{MinimumInterarrivalPolicy, PhasingPolicy, QueueOverflowPolicy};
use crate::error::{raise, RtError, RtResult};
use crate::event::AsyncEventHandler;
use crate::time::AbsoluteTime;

/// Start of a periodic schedulable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartTime {
    /// Offset from the moment the schedulable is started.
    Relative(Duration),
    /// Fixed instant on the runtime clock.
    Absolute(AbsoluteTime),
}

impl StartTime {
    /// Nominal start for a schedulable started at `origin`.
    pub fn resolve(&self, origin: AbsoluteTime) -> AbsoluteTime {
        match self {
            StartTime::Relative(offset) => origin + *offset,
            StartTime::Absolute(at) => *at,
        }
    }
}

impl Default for StartTime {
    fn default() -> Self {
        StartTime::Relative(Duration::ZERO)
    }
}

/// Release pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseKind {
    /// Released every `period` from `start`.
    Periodic {
        /// Nominal first release.
        start: StartTime,
        /// Release period.
        period: Duration,
        /// Handling of a start in the past.
        phasing: PhasingPolicy,
    },
    /// Released on arrivals at least `minimum_interarrival` apart.
    Sporadic {
        /// Minimum interarrival time.
        minimum_interarrival: Duration,
        /// Handling of arrivals that come too close.
        mit_policy: MinimumInterarrivalPolicy,
    },
    /// Released on arrivals, unconstrained.
    Aperiodic,
}

/// Values of a [`ReleaseParameters`] object at one decision point.
#[derive(Clone)]
pub struct ReleaseSnapshot {
    /// Release pattern.
    pub kind: ReleaseKind,
    /// Execution time budget per release; zero means unbudgeted.
    pub cost: Duration,
    /// Explicit relative deadline; see [`ReleaseSnapshot::deadline`].
    pub explicit_deadline: Option<Duration>,
    /// Handling of arrivals that find the queue full.
    pub overflow_policy: QueueOverflowPolicy,
    /// Arrival queue length at creation.
    pub initial_queue_length: usize,
    /// Whether the schedulable may be woken by an interrupt while waiting for release.
    pub rousable: bool,
    /// Released when a release finishes after its deadline.
    pub miss_handler: Option<Arc<AsyncEventHandler>>,
    /// Released when a release runs longer than its cost.
    pub overrun_handler: Option<Arc<AsyncEventHandler>>,
}

impl ReleaseSnapshot {
    fn new(kind: ReleaseKind) -> Self {
        Self {
            kind,
            cost: Duration::ZERO,
            explicit_deadline: None,
            overflow_policy: QueueOverflowPolicy::default(),
            initial_queue_length: 0,
            rousable: false,
            miss_handler: None,
            overrun_handler: None,
        }
    }

    /// Relative deadline of each release.
    ///
    /// Defaults to the period (periodic) or the minimum interarrival time
    /// (sporadic); aperiodic releases have no deadline unless one is set.
    pub fn deadline(&self) -> Option<Duration> {
        self.explicit_deadline.or(match self.kind {
            ReleaseKind::Periodic { period, .. } => Some(period),
            ReleaseKind::Sporadic { minimum_interarrival, .. } => Some(minimum_interarrival),
            ReleaseKind::Aperiodic => None,
        })
    }

    /// Period of a periodic pattern.
    pub fn period(&self) -> Option<Duration> {
        match self.kind {
            ReleaseKind::Periodic { period, .. } => Some(period),
            _ => None,
        }
    }

    /// Minimum interarrival time and policy of a sporadic pattern.
    pub fn minimum_interarrival(&self) -> Option<(Duration, MinimumInterarrivalPolicy)> {
        match self.kind {
            ReleaseKind::Sporadic {
                minimum_interarrival,
                mit_policy,
            } => Some((minimum_interarrival, mit_policy)),
            _ => None,
        }
    }
}

impl fmt::Debug for ReleaseSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReleaseSnapshot")
            .field("kind", &self.kind)
            .field("cost", &self.cost)
            .field("deadline", &self.deadline())
            .field("overflow_policy", &self.overflow_policy)
            .field("initial_queue_length", &self.initial_queue_length)
            .field("rousable", &self.rousable)
            .field("miss_handler", &self.miss_handler.as_ref().map(|h| h.name().to_string()))
            .field("overrun_handler", &self.overrun_handler.as_ref().map(|h| h.name().to_string()))
            .finish()
    }
}

/// Shared release parameters.
///
/// One object may be bound to many schedulables. Each release reads a
/// [`ReleaseSnapshot`], so changes made through the setters reach every
/// bound schedulable at its next release and never affect one in flight.
/// Setters validate, return `&Self` for chaining, and leave the object
/// unchanged on error.
pub struct ReleaseParameters {
    inner: RwLock<ReleaseSnapshot>,
}

impl ReleaseParameters {
    fn with_kind(kind: ReleaseKind) -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(ReleaseSnapshot::new(kind)),
        })
    }

    /// Periodic release every `period` from `start`.
    pub fn periodic(start: StartTime, period: Duration) -> RtResult<Arc<Self>> {
        if period.is_zero() {
            return Err(raise(RtError::IllegalArgument("period must be positive")));
        }
        Ok(Self::with_kind(ReleaseKind::Periodic {
            start,
            period,
            phasing: PhasingPolicy::default(),
        }))
    }

    /// Sporadic release with the given minimum interarrival time.
    pub fn sporadic(minimum_interarrival: Duration) -> RtResult<Arc<Self>> {
        if minimum_interarrival.is_zero() {
            return Err(raise(RtError::IllegalArgument("minimum interarrival time must be positive")));
        }
        Ok(Self::with_kind(ReleaseKind::Sporadic {
            minimum_interarrival,
            mit_policy: MinimumInterarrivalPolicy::default(),
        }))
    }

    /// Aperiodic release.
    pub fn aperiodic() -> Arc<Self> {
        Self::with_kind(ReleaseKind::Aperiodic)
    }

    /// Independent copy of the current values.
    pub fn duplicate(&self) -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(self.snapshot()),
        })
    }

    /// Current values.
    pub fn snapshot(&self) -> ReleaseSnapshot {
        self.inner.read().clone()
    }

    /// Current release pattern.
    pub fn kind(&self) -> ReleaseKind {
        self.inner.read().kind
    }

    /// Feasibility is not analysed; every parameter set is feasible.
    pub fn is_feasible(&self) -> bool {
        true
    }

    /// Set cost and deadline together if the result is feasible.
    ///
    /// Always applies the change and returns `Ok(true)`.
    pub fn set_if_feasible(&self, cost: Duration, deadline: Option<Duration>) -> RtResult<bool> {
        Self::check_deadline(deadline)?;
        let mut inner = self.inner.write();
        inner.cost = cost;
        inner.explicit_deadline = deadline;
        Ok(true)
    }

    /// Set the per-release cost budget.
    pub fn set_cost(&self, cost: Duration) -> RtResult<&Self> {
        self.inner.write().cost = cost;
        Ok(self)
    }

    /// Set the relative deadline; `None` restores the default.
    pub fn set_deadline(&self, deadline: Option<Duration>) -> RtResult<&Self> {
        Self::check_deadline(deadline)?;
        self.inner.write().explicit_deadline = deadline;
        Ok(self)
    }

    fn check_deadline(deadline: Option<Duration>) -> RtResult<()> {
        if deadline.is_some_and(|d| d.is_zero()) {
            return Err(raise(RtError::IllegalArgument("deadline must be positive")));
        }
        Ok(())
    }

    /// Set the queue overflow policy.
    pub fn set_overflow_policy(&self, policy: QueueOverflowPolicy) -> RtResult<&Self> {
        self.inner.write().overflow_policy = policy;
        Ok(self)
    }

    /// Set the initial arrival queue length of schedulables created afterwards.
    pub fn set_initial_queue_length(&self, length: usize) -> RtResult<&Self> {
        self.inner.write().initial_queue_length = length;
        Ok(self)
    }

    /// Set whether interrupts rouse a schedulable waiting for release.
    pub fn set_rousable(&self, rousable: bool) -> RtResult<&Self> {
        self.inner.write().rousable = rousable;
        Ok(self)
    }

    /// Set the deadline miss handler.
    pub fn set_miss_handler(&self, handler: Option<Arc<AsyncEventHandler>>) -> RtResult<&Self> {
        self.inner.write().miss_handler = handler;
        Ok(self)
    }

    /// Set the cost overrun handler.
    pub fn set_overrun_handler(&self, handler: Option<Arc<AsyncEventHandler>>) -> RtResult<&Self> {
        self.inner.write().overrun_handler = handler;
        Ok(self)
    }

    /// Set the start of a periodic pattern.
    pub fn set_start(&self, at: StartTime) -> RtResult<&Self> {
        match &mut self.inner.write().kind {
            ReleaseKind::Periodic { start, .. } => *start = at,
            _ => return Err(raise(RtError::IllegalState("start applies to periodic parameters only"))),
        }
        Ok(self)
    }

    /// Set the period of a periodic pattern.
    pub fn set_period(&self, value: Duration) -> RtResult<&Self> {
        if value.is_zero() {
            return Err(raise(RtError::IllegalArgument("period must be positive")));
        }
        match &mut self.inner.write().kind {
            ReleaseKind::Periodic { period, .. } => *period = value,
            _ => return Err(raise(RtError::IllegalState("period applies to periodic parameters only"))),
        }
        Ok(self)
    }

    /// Set the phasing policy of a periodic pattern.
    pub fn set_phasing_policy(&self, policy: PhasingPolicy) -> RtResult<&Self> {
        match &mut self.inner.write().kind {
            ReleaseKind::Periodic { phasing, .. } => *phasing = policy,
            _ => return Err(raise(RtError::IllegalState("phasing applies to periodic parameters only"))),
        }
        Ok(self)
    }

    /// Set the minimum interarrival time of a sporadic pattern.
    pub fn set_minimum_interarrival(&self, value: Duration) -> RtResult<&Self> {
        if value.is_zero() {
            return Err(raise(RtError::IllegalArgument("minimum interarrival time must be positive")));
        }
        match &mut self.inner.write().kind {
            ReleaseKind::Sporadic {
                minimum_interarrival, ..
            } => *minimum_interarrival = value,
            _ => {
                return Err(raise(RtError::IllegalState(
                    "minimum interarrival applies to sporadic parameters only",
                )))
            }
        }
        Ok(self)
    }

    /// Set the minimum interarrival violation policy of a sporadic pattern.
    pub fn set_mit_violation_policy(&self, policy: MinimumInterarrivalPolicy) -> RtResult<&Self> {
        match &mut self.inner.write().kind {
            ReleaseKind::Sporadic { mit_policy, .. } => *mit_policy = policy,
            _ => {
                return Err(raise(RtError::IllegalState(
                    "interarrival policy applies to sporadic parameters only",
                )))
            }
        }
        Ok(self)
    }
}

impl fmt::Debug for ReleaseParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ReleaseParameters").field(&*self.inner.read()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_construction() {
        assert!(ReleaseParameters::periodic(StartTime::default(), Duration::ZERO).is_err());
        assert!(ReleaseParameters::sporadic(Duration::ZERO).is_err());
    }

    #[test]
    fn test_fluent_setters_chain() {
        let params = ReleaseParameters::aperiodic();
        params
            .set_cost(Duration::from_millis(2))
            .and_then(|p| p.set_overflow_policy(QueueOverflowPolicy::Replace))
            .and_then(|p| p.set_initial_queue_length(4))
            .unwrap();

        let snap = params.snapshot();
        assert_eq!(snap.cost, Duration::from_millis(2));
        assert_eq!(snap.overflow_policy, QueueOverflowPolicy::Replace);
        assert_eq!(snap.initial_queue_length, 4);
        assert_eq!(snap.deadline(), None);
    }

    #[test]
    fn test_default_deadlines() {
        let periodic = ReleaseParameters::periodic(StartTime::default(), Duration::from_millis(10)).unwrap();
        assert_eq!(periodic.snapshot().deadline(), Some(Duration::from_millis(10)));
        periodic.set_period(Duration::from_millis(20)).unwrap();
        assert_eq!(periodic.snapshot().deadline(), Some(Duration::from_millis(20)));
        periodic.set_deadline(Some(Duration::from_millis(5))).unwrap();
        assert_eq!(periodic.snapshot().deadline(), Some(Duration::from_millis(5)));

        let sporadic = ReleaseParameters::sporadic(Duration::from_millis(3)).unwrap();
        assert_eq!(sporadic.snapshot().deadline(), Some(Duration::from_millis(3)));
    }

    #[test]
    fn test_setters_validate_and_leave_state_untouched() {
        let params = ReleaseParameters::periodic(StartTime::default(), Duration::from_millis(10)).unwrap();
        assert!(params.set_deadline(Some(Duration::ZERO)).is_err());
        assert!(params.set_period(Duration::ZERO).is_err());
        assert!(matches!(
            params.set_minimum_interarrival(Duration::from_millis(1)),
            Err(RtError::IllegalState(_))
        ));
        assert_eq!(params.snapshot().period(), Some(Duration::from_millis(10)));
        assert_eq!(params.snapshot().explicit_deadline, None);
    }

    #[test]
    fn test_snapshot_is_not_retroactive() {
        let params = ReleaseParameters::sporadic(Duration::from_millis(5)).unwrap();
        let before = params.snapshot();
        params.set_minimum_interarrival(Duration::from_millis(50)).unwrap();
        assert_eq!(before.minimum_interarrival().map(|(d, _)| d), Some(Duration::from_millis(5)));
        assert_eq!(params.snapshot().minimum_interarrival().map(|(d, _)| d), Some(Duration::from_millis(50)));
    }

    #[test]
    fn test_always_feasible() {
        let params = ReleaseParameters::aperiodic();
        assert!(params.is_feasible());
        assert_eq!(params.set_if_feasible(Duration::from_secs(10), Some(Duration::from_millis(1))), Ok(true));
        assert_eq!(params.snapshot().cost, Duration::from_secs(10));
    }
}
