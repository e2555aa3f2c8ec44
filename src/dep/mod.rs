//! Dependency records over globally addressable memory.
//!
//! A dependency names a globally addressable location (unit, segment, offset)
//! and a kind. The dephash keys its producer/consumer chains by the canonical
//! location; the runtime never dereferences these addresses itself except in
//! the copy-in engine, which moves the named bytes through the transport.

pub(crate) mod dephash;

use crate::copyin::pool::CopyinBuffer;
use crate::task::{Task, TaskRef};
use smallvec::SmallVec;
use std::fmt;
use std::ptr::NonNull;
use std::sync::{Arc, OnceLock, Weak};

/// Global process (unit) id within the team.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitId(pub u32);

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "u{}", self.0)
    }
}

/// Memory segment id within a unit's globally addressable space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SegmentId(pub u16);

impl SegmentId {
    /// Pseudo-segment for raw local addresses that are used purely as
    /// ordering keys.
    pub const LOCAL: SegmentId = SegmentId(u16::MAX);
}

/// Phase tag. Monotonically increasing per process; the unit of
/// coarse-grained synchronization across processes.
pub type Phase = i32;

pub const PHASE_FIRST: Phase = 0;

/// Tasks that are not direct children of the root task carry this phase and
/// are never deferred.
pub const PHASE_ANY: Phase = i32::MIN;

/// A globally addressable location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GlobalPtr {
    pub unit: UnitId,
    pub segment: SegmentId,
    pub offset: u64,
}

impl GlobalPtr {
    pub fn new(unit: UnitId, segment: SegmentId, offset: u64) -> Self {
        Self {
            unit,
            segment,
            offset,
        }
    }

    /// A raw local address on `unit`, used as an ordering key only.
    pub fn local_addr(unit: UnitId, addr: usize) -> Self {
        Self {
            unit,
            segment: SegmentId::LOCAL,
            offset: addr as u64,
        }
    }
}

impl fmt::Display for GlobalPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:s{}+{:#x}", self.unit, self.segment.0, self.offset)
    }
}

/// Dependency kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepType {
    In,
    Out,
    InOut,
    /// Prefetch the named bytes locally before the owning task runs.
    Copyin,
    /// Reuse of an already requested copy-in in the same phase.
    CopyinR,
    /// Output side of a copy-in transfer, owned by the communication task.
    CopyinOut,
    /// Input dependency registered after the fact for a deferred send task.
    DelayedIn,
    /// Direct predecessor edge onto a referenced task, no address involved.
    Direct,
}

impl DepType {
    /// Reader-like kinds: ordered after the latest producer on the chain.
    pub(crate) fn is_input(self) -> bool {
        matches!(
            self,
            DepType::In | DepType::Copyin | DepType::CopyinR | DepType::DelayedIn
        )
    }

    /// Producer-like kinds: order writers after readers and prior writers.
    pub(crate) fn is_output(self) -> bool {
        matches!(self, DepType::Out | DepType::InOut | DepType::CopyinOut)
    }
}

/// Copy-in details: transfer size and optional caller-provided destination.
#[derive(Debug, Clone, Copy)]
pub struct CopyinSpec {
    pub size: usize,
    /// Destination buffer. When `None` the runtime allocates from its
    /// size-keyed pool and returns the buffer when the dependency retires.
    /// A caller-provided buffer must stay valid until the consumer finished.
    pub dest: Option<NonNull<u8>>,
}

/// A single dependency declaration attached to a task at submission.
#[derive(Debug, Clone)]
pub struct TaskDep {
    pub dep_type: DepType,
    pub ptr: GlobalPtr,
    /// Phase the dependency refers to; filled with the task's phase when
    /// left unset.
    pub phase: Option<Phase>,
    pub copyin: Option<CopyinSpec>,
    pub(crate) direct: Option<Arc<Task>>,
}

impl TaskDep {
    fn plain(dep_type: DepType, ptr: GlobalPtr) -> Self {
        Self {
            dep_type,
            ptr,
            phase: None,
            copyin: None,
            direct: None,
        }
    }

    pub fn input(ptr: GlobalPtr) -> Self {
        Self::plain(DepType::In, ptr)
    }

    pub fn output(ptr: GlobalPtr) -> Self {
        Self::plain(DepType::Out, ptr)
    }

    pub fn inout(ptr: GlobalPtr) -> Self {
        Self::plain(DepType::InOut, ptr)
    }

    /// Prefetch `size` bytes at `ptr` into a pool buffer before the task runs.
    pub fn copyin(ptr: GlobalPtr, size: usize) -> Self {
        let mut dep = Self::plain(DepType::Copyin, ptr);
        dep.copyin = Some(CopyinSpec { size, dest: None });
        dep
    }

    /// Prefetch `size` bytes at `ptr` into `dest` before the task runs.
    pub fn copyin_into(ptr: GlobalPtr, size: usize, dest: NonNull<u8>) -> Self {
        let mut dep = Self::plain(DepType::Copyin, ptr);
        dep.copyin = Some(CopyinSpec {
            size,
            dest: Some(dest),
        });
        dep
    }

    /// Direct predecessor edge onto the referenced task.
    pub fn direct(pred: &TaskRef) -> Self {
        let mut dep = Self::plain(
            DepType::Direct,
            GlobalPtr::local_addr(UnitId(0), 0),
        );
        dep.direct = Some(pred.task().clone());
        dep
    }

    /// Pin the dependency to an explicit phase.
    pub fn at_phase(mut self, phase: Phase) -> Self {
        self.phase = Some(phase);
        self
    }
}

/// Internal dependency record, the unit stored in dephash chains and in a
/// task's owned-dependency list.
pub(crate) struct DepRecord {
    pub dep_type: DepType,
    pub key: GlobalPtr,
    pub phase: Phase,
    /// Owning task.
    pub task: Weak<Task>,
    /// Producer record this dependency was matched against, set during
    /// registration. Copy-in consumers resolve their local bytes through it.
    pub producer: OnceLock<Arc<DepRecord>>,
    /// Transfer size and destination for copy-in kinds.
    pub copyin: Option<CopyinRecord>,
}

pub(crate) struct CopyinRecord {
    pub size: usize,
    /// Caller-provided destination address, if any.
    pub dest: Option<usize>,
    /// Pool buffer filled lazily by the communication task when no
    /// destination was provided. Dropping the record returns the buffer to
    /// its size class.
    pub buffer: OnceLock<CopyinBuffer>,
}

impl DepRecord {
    pub(crate) fn new(
        dep_type: DepType,
        key: GlobalPtr,
        phase: Phase,
        task: &Arc<Task>,
        copyin: Option<&CopyinSpec>,
    ) -> Arc<Self> {
        Arc::new(Self {
            dep_type,
            key,
            phase,
            task: Arc::downgrade(task),
            producer: OnceLock::new(),
            copyin: copyin.map(|c| CopyinRecord {
                size: c.size,
                dest: c.dest.map(|p| p.as_ptr() as usize),
                buffer: OnceLock::new(),
            }),
        })
    }

    /// Local address holding the copy-in bytes: the caller destination or
    /// the pool buffer.
    pub(crate) fn copyin_local_ptr(&self) -> Option<NonNull<u8>> {
        let c = self.copyin.as_ref()?;
        if let Some(dest) = c.dest {
            return NonNull::new(dest as *mut u8);
        }
        c.buffer.get().map(|b| b.ptr())
    }
}

impl fmt::Debug for DepRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DepRecord")
            .field("type", &self.dep_type)
            .field("key", &self.key)
            .field("phase", &self.phase)
            .finish_non_exhaustive()
    }
}

pub(crate) type DepList = SmallVec<[TaskDep; 4]>;
