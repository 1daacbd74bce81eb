//! # Fixed-Priority Scheduling
//!
//! [`Scheduler`] abstracts the scheduling policy of the runtime. The
//! required policy is [`FirstInFirstOutScheduler`]: fixed-priority,
//! preemptive, FIFO within a priority level.
//!
//! ## Ready queue discipline
//!
//! ```text
//!  priority 38  [ h7 ]
//!  priority 20  [ h2, h5, h1 ]    ← h2 was preempted: back at the head
//!  priority 11  [ h3 ]
//! ```
//!
//! [`ReadyQueue`] implements this discipline for the release runners: a
//! newly ready schedulable joins the tail of its level, a preempted one
//! rejoins at the head, and the highest non-empty level is served first.
//!
//! Priorities are logical. They order the ready queues of the runners and
//! drive the monitor protocols; OS thread priorities are left untouched.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Weak};
use std::thread::ThreadId;

use parking_lot::Mutex;
use tracing::debug;

use crate::config::SchedulerConfig;
use crate::error::{raise, RtError, RtResult};
use crate::monitor::TaskControl;

/// Scheduling parameters of a fixed-priority schedulable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PriorityParameters {
    priority: i32,
}

impl PriorityParameters {
    /// Parameters at `priority`.
    pub const fn new(priority: i32) -> Self {
        Self { priority }
    }

    /// Priority.
    pub const fn priority(&self) -> i32 {
        self.priority
    }
}

/// Scheduling policy.
pub trait Scheduler: Send + Sync + fmt::Debug {
    /// Policy name for logs.
    fn policy_name(&self) -> &'static str;

    /// Lowest priority this scheduler accepts.
    fn min_priority(&self) -> i32;

    /// Highest priority this scheduler accepts.
    fn max_priority(&self) -> i32;

    /// Priority of schedulables that do not ask for one.
    fn norm_priority(&self) -> i32;

    /// Check that `params` is acceptable.
    fn validate(&self, params: &PriorityParameters) -> RtResult<()> {
        let p = params.priority();
        if p < self.min_priority() || p > self.max_priority() {
            return Err(raise(RtError::IllegalArgument("priority outside the scheduler's range")));
        }
        Ok(())
    }

    /// Bind `task` to `thread`.
    ///
    /// A priority previously requested through [`Scheduler::reschedule`]
    /// for that thread is applied now.
    fn register(&self, thread: ThreadId, task: &Arc<TaskControl>);

    /// Forget `thread`.
    fn deregister(&self, thread: ThreadId);

    /// Schedule `thread` as if it carried `params`.
    fn reschedule(&self, thread: ThreadId, params: PriorityParameters) -> RtResult<()>;

    /// Feasibility is not analysed; every task set is feasible.
    fn is_feasible(&self) -> bool {
        true
    }
}

/// Fixed-priority preemptive scheduler, FIFO within a priority level.
pub struct FirstInFirstOutScheduler {
    min: i32,
    max: i32,
    norm: i32,
    tasks: Mutex<HashMap<ThreadId, Weak<TaskControl>>>,
    requested: Mutex<HashMap<ThreadId, PriorityParameters>>,
}

impl FirstInFirstOutScheduler {
    /// Scheduler over the configured priority range.
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            min: config.min_priority,
            max: config.max_priority,
            norm: config.norm_priority,
            tasks: Mutex::new(HashMap::new()),
            requested: Mutex::new(HashMap::new()),
        }
    }

    /// Task bound to `thread`, if it is still alive.
    pub fn task_of(&self, thread: ThreadId) -> Option<Arc<TaskControl>> {
        self.tasks.lock().get(&thread).and_then(Weak::upgrade)
    }

    /// Number of registered threads.
    pub fn registered(&self) -> usize {
        let mut tasks = self.tasks.lock();
        tasks.retain(|_, task| task.strong_count() > 0);
        tasks.len()
    }
}

impl Scheduler for FirstInFirstOutScheduler {
    fn policy_name(&self) -> &'static str {
        "FIFO"
    }

    fn min_priority(&self) -> i32 {
        self.min
    }

    fn max_priority(&self) -> i32 {
        self.max
    }

    fn norm_priority(&self) -> i32 {
        self.norm
    }

    fn register(&self, thread: ThreadId, task: &Arc<TaskControl>) {
        if let Some(params) = self.requested.lock().remove(&thread) {
            task.set_base_priority(params.priority());
        }
        self.tasks.lock().insert(thread, Arc::downgrade(task));
    }

    fn deregister(&self, thread: ThreadId) {
        self.tasks.lock().remove(&thread);
        self.requested.lock().remove(&thread);
    }

    fn reschedule(&self, thread: ThreadId, params: PriorityParameters) -> RtResult<()> {
        self.validate(&params)?;
        match self.task_of(thread) {
            Some(task) => {
                debug!(task = task.name(), priority = params.priority(), "rescheduled");
                task.set_base_priority(params.priority());
            }
            None => {
                self.requested.lock().insert(thread, params);
            }
        }
        Ok(())
    }
}

impl fmt::Debug for FirstInFirstOutScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FirstInFirstOutScheduler")
            .field("min", &self.min)
            .field("max", &self.max)
            .field("norm", &self.norm)
            .finish()
    }
}

/// Ready queue: highest priority first, FIFO within a level.
#[derive(Debug)]
pub struct ReadyQueue<T> {
    levels: BTreeMap<i32, VecDeque<T>>,
    len: usize,
}

impl<T> ReadyQueue<T> {
    /// Empty queue.
    pub fn new() -> Self {
        Self {
            levels: BTreeMap::new(),
            len: 0,
        }
    }

    /// Append a newly ready item at the tail of its level.
    pub fn push_back(&mut self, priority: i32, item: T) {
        self.levels.entry(priority).or_default().push_back(item);
        self.len += 1;
    }

    /// Return a preempted item to the head of its level.
    pub fn push_front(&mut self, priority: i32, item: T) {
        self.levels.entry(priority).or_default().push_front(item);
        self.len += 1;
    }

    /// Remove the head of the highest non-empty level.
    pub fn pop_highest(&mut self) -> Option<(i32, T)> {
        let mut level = self.levels.last_entry()?;
        let priority = *level.key();
        let item = level.get_mut().pop_front();
        if level.get().is_empty() {
            level.remove();
        }
        let item = item?;
        self.len -= 1;
        Some((priority, item))
    }

    /// Highest priority with a ready item.
    pub fn peek_priority(&self) -> Option<i32> {
        self.levels.keys().next_back().copied()
    }

    /// Keep only the items matching `keep`.
    pub fn retain(&mut self, mut keep: impl FnMut(&T) -> bool) {
        for queue in self.levels.values_mut() {
            queue.retain(&mut keep);
        }
        self.levels.retain(|_, queue| !queue.is_empty());
        self.len = self.levels.values().map(VecDeque::len).sum();
    }

    /// Number of ready items.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether nothing is ready.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<T> Default for ReadyQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
