//! # Runtime Errors
//!
//! Every failure in the runtime is reported through [`RtError`]. There are
//! no return codes.
//!
//! ## Taxonomy
//!
//! - **Static faults** (`IllegalArgument`, `IllegalState`, `OutOfMemory`,
//!   `IllegalAssignment`, `MemoryAccess`, `UnsupportedOperation`): raised on
//!   paths that may themselves signal resource exhaustion. Their text is
//!   recorded into a per-thread [`ErrorStorage`] whose buffers are reserved
//!   up front, so recording never allocates.
//! - **Scheduling faults** (`CeilingViolation`, `MitViolation`,
//!   `ArrivalQueueOverflow`, `ProcessorAffinity`, `LateStart`): raised
//!   synchronously by the operation that detects them.
//! - **Interruption** (`Interrupted`): a blocking call observed a pending
//!   asynchronous interrupt.
//!
//! When several handlers fail during one fan-out, [`RtError::precedence`]
//! decides which failure the caller sees.

use std::cell::RefCell;
use std::fmt::{self, Write as _};
use std::time::Duration;

use thiserror::Error;

use crate::config::{ConfigError, ExceptionStorageConfig};
use crate::memory::{Generation, RegionId};
use crate::time::AbsoluteTime;

/// Result alias used throughout the runtime.
pub type RtResult<T> = Result<T, RtError>;

/// Tag identifying an error variant, used to index preallocated storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ErrorKind {
    /// Cross-region store that would break scope containment.
    IllegalAssignment,
    /// Region budget or allocation rate exhausted.
    OutOfMemory,
    /// Heap access from a no-heap context.
    MemoryAccess,
    /// Scoped region entered under a second parent.
    ScopedCycle,
    /// Region used while not on the caller's scope stack.
    InaccessibleArea,
    /// Priority ceiling protocol violation.
    CeilingViolation,
    /// Minimum interarrival time violation.
    MitViolation,
    /// Arrival queue overflow.
    ArrivalQueueOverflow,
    /// Invalid processor affinity.
    ProcessorAffinity,
    /// Strict phasing with a start time in the past.
    LateStart,
    /// Invalid argument.
    IllegalArgument,
    /// Operation not valid in the current state.
    IllegalState,
    /// Capability absent on this platform.
    UnsupportedOperation,
    /// Blocking call interrupted.
    Interrupted,
    /// Handle into a reclaimed region.
    StaleReference,
    /// Invalid runtime configuration.
    Config,
}

impl ErrorKind {
    /// Every kind, in storage index order.
    pub const ALL: [ErrorKind; 16] = [
        ErrorKind::IllegalAssignment,
        ErrorKind::OutOfMemory,
        ErrorKind::MemoryAccess,
        ErrorKind::ScopedCycle,
        ErrorKind::InaccessibleArea,
        ErrorKind::CeilingViolation,
        ErrorKind::MitViolation,
        ErrorKind::ArrivalQueueOverflow,
        ErrorKind::ProcessorAffinity,
        ErrorKind::LateStart,
        ErrorKind::IllegalArgument,
        ErrorKind::IllegalState,
        ErrorKind::UnsupportedOperation,
        ErrorKind::Interrupted,
        ErrorKind::StaleReference,
        ErrorKind::Config,
    ];

    /// Index of this kind in [`ErrorKind::ALL`].
    pub fn index(self) -> usize {
        self as usize
    }

    /// Short stable label (snake_case) for logs.
    pub fn as_label(self) -> &'static str {
        match self {
            ErrorKind::IllegalAssignment => "illegal_assignment",
            ErrorKind::OutOfMemory => "out_of_memory",
            ErrorKind::MemoryAccess => "memory_access",
            ErrorKind::ScopedCycle => "scoped_cycle",
            ErrorKind::InaccessibleArea => "inaccessible_area",
            ErrorKind::CeilingViolation => "ceiling_violation",
            ErrorKind::MitViolation => "mit_violation",
            ErrorKind::ArrivalQueueOverflow => "arrival_queue_overflow",
            ErrorKind::ProcessorAffinity => "processor_affinity",
            ErrorKind::LateStart => "late_start",
            ErrorKind::IllegalArgument => "illegal_argument",
            ErrorKind::IllegalState => "illegal_state",
            ErrorKind::UnsupportedOperation => "unsupported_operation",
            ErrorKind::Interrupted => "interrupted",
            ErrorKind::StaleReference => "stale_reference",
            ErrorKind::Config => "config",
        }
    }

    /// Whether this kind is recorded into preallocated storage.
    pub fn is_static(self) -> bool {
        matches!(
            self,
            ErrorKind::IllegalAssignment
                | ErrorKind::OutOfMemory
                | ErrorKind::MemoryAccess
                | ErrorKind::ScopedCycle
                | ErrorKind::InaccessibleArea
                | ErrorKind::IllegalArgument
                | ErrorKind::IllegalState
                | ErrorKind::UnsupportedOperation
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Errors produced by the runtime.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RtError {
    /// Storing a reference from `value` into an object allocated in `target`
    /// would let the object outlive its referent.
    #[error("illegal assignment: reference into {value} cannot be stored in an object of {target}")]
    IllegalAssignment {
        /// Region of the object receiving the reference.
        target: RegionId,
        /// Region the stored reference points into.
        value: RegionId,
    },

    /// Allocation exceeded a region budget or an allocation-rate budget.
    #[error("out of memory in {region}: requested {requested} bytes, {remaining} remaining")]
    OutOfMemory {
        /// Region the allocation targeted.
        region: RegionId,
        /// Requested size in bytes.
        requested: usize,
        /// Bytes still available under the violated budget.
        remaining: usize,
    },

    /// A no-heap context touched the heap.
    #[error("memory access error: {0}")]
    MemoryAccess(&'static str),

    /// A scoped region would acquire a second parent.
    #[error("scoped cycle: {region} is already parented by {parent:?}")]
    ScopedCycle {
        /// Region being entered.
        region: RegionId,
        /// Its current parent (`None` for the primordial scope).
        parent: Option<RegionId>,
    },

    /// A scoped region was used while not on the caller's scope stack.
    #[error("inaccessible area: {0} is not on the current scope stack")]
    InaccessibleArea(RegionId),

    /// Priority ceiling emulation violation.
    #[error("ceiling violation: priority {priority} exceeds ceiling {ceiling}")]
    CeilingViolation {
        /// Offending priority (base priority or a held ceiling).
        priority: i32,
        /// Ceiling of the monitor being acquired.
        ceiling: i32,
    },

    /// A sporadic arrival came strictly closer than the minimum interarrival time.
    #[error("minimum interarrival time violated: {interval:?} since last release, minimum {minimum:?}")]
    MitViolation {
        /// Observed interval since the last accepted arrival.
        interval: Duration,
        /// Configured minimum interarrival time.
        minimum: Duration,
    },

    /// The arrival queue of a handler is full under the `Except` policy.
    #[error("arrival time queue overflow (capacity {capacity})")]
    ArrivalQueueOverflow {
        /// Queue capacity at the time of overflow.
        capacity: usize,
    },

    /// Invalid processor affinity for a schedulable.
    #[error("processor affinity: {0}")]
    ProcessorAffinity(&'static str),

    /// Strict phasing requested with a start time already in the past.
    #[error("late start: nominal start {start} already passed at {now}")]
    LateStart {
        /// Nominal start time.
        start: AbsoluteTime,
        /// Time the start was attempted.
        now: AbsoluteTime,
    },

    /// Invalid argument.
    #[error("illegal argument: {0}")]
    IllegalArgument(&'static str),

    /// Operation not valid in the current state.
    #[error("illegal state: {0}")]
    IllegalState(&'static str),

    /// Capability absent in the current runtime or platform.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(&'static str),

    /// A blocking call was interrupted.
    #[error("interrupted")]
    Interrupted,

    /// A handle refers to a region that has been reclaimed since allocation.
    #[error("stale reference into {region}: allocated in generation {expected}, region is at {actual}")]
    StaleReference {
        /// Region of the handle.
        region: RegionId,
        /// Generation at allocation time.
        expected: Generation,
        /// Current region generation.
        actual: Generation,
    },

    /// Invalid runtime configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl RtError {
    /// Kind tag of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RtError::IllegalAssignment { .. } => ErrorKind::IllegalAssignment,
            RtError::OutOfMemory { .. } => ErrorKind::OutOfMemory,
            RtError::MemoryAccess(_) => ErrorKind::MemoryAccess,
            RtError::ScopedCycle { .. } => ErrorKind::ScopedCycle,
            RtError::InaccessibleArea(_) => ErrorKind::InaccessibleArea,
            RtError::CeilingViolation { .. } => ErrorKind::CeilingViolation,
            RtError::MitViolation { .. } => ErrorKind::MitViolation,
            RtError::ArrivalQueueOverflow { .. } => ErrorKind::ArrivalQueueOverflow,
            RtError::ProcessorAffinity(_) => ErrorKind::ProcessorAffinity,
            RtError::LateStart { .. } => ErrorKind::LateStart,
            RtError::IllegalArgument(_) => ErrorKind::IllegalArgument,
            RtError::IllegalState(_) => ErrorKind::IllegalState,
            RtError::UnsupportedOperation(_) => ErrorKind::UnsupportedOperation,
            RtError::Interrupted => ErrorKind::Interrupted,
            RtError::StaleReference { .. } => ErrorKind::StaleReference,
            RtError::Config(_) => ErrorKind::Config,
        }
    }

    /// Short stable label for logs.
    pub fn as_label(&self) -> &'static str {
        self.kind().as_label()
    }

    /// Rank used when several handlers fail in one fan-out.
    ///
    /// MIT violations outrank queue overflows, which outrank everything else.
    pub fn precedence(&self) -> u8 {
        match self {
            RtError::MitViolation { .. } => 2,
            RtError::ArrivalQueueOverflow { .. } => 1,
            _ => 0,
        }
    }

    /// Keep whichever of two errors has higher precedence.
    ///
    /// Ties keep the first error seen.
    pub fn prevailing(first: RtError, second: RtError) -> RtError {
        if second.precedence() > first.precedence() {
            second
        } else {
            first
        }
    }
}

/// Record a static fault into the calling thread's preallocated storage and
/// hand it back for propagation.
#[track_caller]
pub fn raise(err: RtError) -> RtError {
    if err.kind().is_static() {
        let location = std::panic::Location::caller();
        ErrorStorage::with_current(|storage| {
            storage.record(&err, &[TraceFrame::at(location)]);
        });
    }
    err
}

// ============================================================================
// Preallocated error storage
// ============================================================================

/// A stack frame description handed to [`ErrorStorage::record`].
#[derive(Debug, Clone, Copy)]
pub struct TraceFrame<'a> {
    /// Module or type name.
    pub type_name: &'a str,
    /// Function name.
    pub function: &'a str,
    /// Source file.
    pub file: &'a str,
    /// Source line.
    pub line: u32,
}

impl<'a> TraceFrame<'a> {
    /// Frame pointing at a caller location.
    pub fn at(location: &'a std::panic::Location<'a>) -> Self {
        Self {
            type_name: "",
            function: "",
            file: location.file(),
            line: location.line(),
        }
    }
}

/// Fixed-capacity text buffer that silently truncates.
#[derive(Debug)]
struct FixedText {
    bytes: Box<[u8]>,
    len: usize,
}

impl FixedText {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            bytes: vec![0u8; capacity].into_boxed_slice(),
            len: 0,
        }
    }

    fn clear(&mut self) {
        self.len = 0;
    }

    fn set(&mut self, text: &str) {
        self.clear();
        let _ = self.write_str(text);
    }

    fn as_str(&self) -> &str {
        // Writes only ever stop on a char boundary.
        std::str::from_utf8(&self.bytes[..self.len]).unwrap_or("")
    }
}

impl fmt::Write for FixedText {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = self.bytes.len() - self.len;
        let mut take = s.len().min(room);
        while !s.is_char_boundary(take) {
            take -= 1;
        }
        self.bytes[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}

#[derive(Debug)]
struct FrameRecord {
    type_name: FixedText,
    function: FixedText,
    file: FixedText,
    line: u32,
}

/// One preallocated error record.
#[derive(Debug)]
pub struct ErrorRecord {
    occupied: bool,
    message: FixedText,
    frames: Box<[FrameRecord]>,
    depth: usize,
}

impl ErrorRecord {
    fn new(config: &ExceptionStorageConfig) -> Self {
        let frames = (0..config.max_stack_trace_depth)
            .map(|_| FrameRecord {
                type_name: FixedText::with_capacity(config.max_type_name_length),
                function: FixedText::with_capacity(config.max_function_name_length),
                file: FixedText::with_capacity(config.max_file_name_length),
                line: 0,
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            occupied: false,
            message: FixedText::with_capacity(config.max_message_length),
            frames,
            depth: 0,
        }
    }

    /// Whether anything has been recorded.
    pub fn is_occupied(&self) -> bool {
        self.occupied
    }

    /// Recorded message, truncated to the configured length.
    pub fn message(&self) -> &str {
        self.message.as_str()
    }

    /// Number of recorded frames.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Recorded `(file, line)` of frame `index`.
    pub fn frame_location(&self, index: usize) -> Option<(&str, u32)> {
        if index >= self.depth {
            return None;
        }
        let frame = &self.frames[index];
        Some((frame.file.as_str(), frame.line))
    }

    /// Recorded `(type, function)` names of frame `index`.
    pub fn frame_names(&self, index: usize) -> Option<(&str, &str)> {
        if index >= self.depth {
            return None;
        }
        let frame = &self.frames[index];
        Some((frame.type_name.as_str(), frame.function.as_str()))
    }
}

/// Per-thread arena of error records, one per [`ErrorKind`].
///
/// All buffers are sized from [`ExceptionStorageConfig`] when the storage is
/// installed. Recording copies into them and truncates whatever does not fit.
#[derive(Debug)]
pub struct ErrorStorage {
    records: Vec<ErrorRecord>,
}

thread_local! {
    static STORAGE: RefCell<Option<ErrorStorage>> = const { RefCell::new(None) };
}

impl ErrorStorage {
    /// Preallocate storage for every error kind.
    pub fn new(config: &ExceptionStorageConfig) -> Self {
        Self {
            records: ErrorKind::ALL.iter().map(|_| ErrorRecord::new(config)).collect(),
        }
    }

    /// Install preallocated storage on the calling thread.
    ///
    /// Returns false if the thread already had storage.
    pub fn install(config: &ExceptionStorageConfig) -> bool {
        STORAGE.with(|cell| {
            let mut slot = cell.borrow_mut();
            if slot.is_some() {
                return false;
            }
            *slot = Some(ErrorStorage::new(config));
            true
        })
    }

    /// Remove the calling thread's storage.
    pub fn uninstall() {
        STORAGE.with(|cell| cell.borrow_mut().take());
    }

    /// Whether the calling thread has storage installed.
    pub fn is_installed() -> bool {
        STORAGE.with(|cell| cell.borrow().is_some())
    }

    /// Run `f` against the calling thread's storage, if installed.
    pub fn with_current<R>(f: impl FnOnce(&mut ErrorStorage) -> R) -> Option<R> {
        STORAGE.with(|cell| match cell.try_borrow_mut() {
            Ok(mut slot) => slot.as_mut().map(f),
            Err(_) => None,
        })
    }

    /// Record `err` with `frames` into the slot for its kind.
    pub fn record(&mut self, err: &RtError, frames: &[TraceFrame<'_>]) {
        let record = &mut self.records[err.kind().index()];
        record.message.clear();
        let _ = write!(record.message, "{}", err);
        let depth = frames.len().min(record.frames.len());
        for (slot, frame) in record.frames.iter_mut().zip(frames.iter()) {
            slot.type_name.set(frame.type_name);
            slot.function.set(frame.function);
            slot.file.set(frame.file);
            slot.line = frame.line;
        }
        record.depth = depth;
        record.occupied = true;
    }

    /// Record slot for `kind`.
    pub fn get(&self, kind: ErrorKind) -> &ErrorRecord {
        &self.records[kind.index()]
    }

    /// Copy out the last recorded message for `kind` on the calling thread.
    pub fn last_message(kind: ErrorKind) -> Option<String> {
        Self::with_current(|storage| {
            let record = storage.get(kind);
            record.is_occupied().then(|| record.message().to_string())
        })
        .flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_config() -> ExceptionStorageConfig {
        ExceptionStorageConfig {
            max_message_length: 16,
            max_stack_trace_depth: 2,
            max_type_name_length: 8,
            max_function_name_length: 8,
            max_file_name_length: 12,
        }
    }

    #[test]
    fn test_precedence_ordering() {
        let mit = RtError::MitViolation {
            interval: Duration::from_millis(1),
            minimum: Duration::from_millis(2),
        };
        let overflow = RtError::ArrivalQueueOverflow { capacity: 1 };
        let other = RtError::IllegalState("x");

        assert!(mit.precedence() > overflow.precedence());
        assert!(overflow.precedence() > other.precedence());
        assert_eq!(RtError::prevailing(other.clone(), overflow.clone()), overflow);
        assert_eq!(RtError::prevailing(overflow.clone(), mit.clone()), mit);
        assert_eq!(RtError::prevailing(mit.clone(), overflow), mit);
    }

    #[test]
    fn test_kind_indices_match_table() {
        for (i, kind) in ErrorKind::ALL.iter().enumerate() {
            assert_eq!(kind.index(), i);
        }
    }

    #[test]
    fn test_record_truncates_message() {
        let mut storage = ErrorStorage::new(&tiny_config());
        let err = RtError::IllegalArgument("a very long explanation of the failure");
        storage.record(&err, &[]);

        let record = storage.get(ErrorKind::IllegalArgument);
        assert!(record.is_occupied());
        assert_eq!(record.message().len(), 16);
        assert!(err.to_string().starts_with(record.message()));
    }

    #[test]
    fn test_record_truncates_frames() {
        let mut storage = ErrorStorage::new(&tiny_config());
        let frames = [
            TraceFrame { type_name: "MemoryArea", function: "enter", file: "memory/region.rs", line: 10 },
            TraceFrame { type_name: "Handle", function: "get", file: "h.rs", line: 20 },
            TraceFrame { type_name: "X", function: "y", file: "z.rs", line: 30 },
        ];
        storage.record(&RtError::IllegalState("s"), &frames);

        let record = storage.get(ErrorKind::IllegalState);
        assert_eq!(record.depth(), 2);
        assert_eq!(record.frame_names(0), Some(("MemoryAr", "enter")));
        assert_eq!(record.frame_location(0), Some(("memory/regio", 10)));
        assert_eq!(record.frame_location(2), None);
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        let mut text = FixedText::with_capacity(4);
        text.set("aé€");
        assert_eq!(text.as_str(), "aé");
    }

    #[test]
    fn test_raise_records_static_kinds_only() {
        std::thread::spawn(|| {
            assert!(ErrorStorage::install(&tiny_config()));
            assert!(!ErrorStorage::install(&tiny_config()));

            let _ = raise(RtError::UnsupportedOperation("nope"));
            let _ = raise(RtError::Interrupted);

            assert!(ErrorStorage::last_message(ErrorKind::UnsupportedOperation).is_some());
            assert!(ErrorStorage::last_message(ErrorKind::Interrupted).is_none());
            ErrorStorage::uninstall();
            assert!(!ErrorStorage::is_installed());
        })
        .join()
        .unwrap();
    }
}
