//! Task descriptors and their life cycle.
//!
//! A task is an `Arc`-allocated descriptor owning a boxed body closure, the
//! dependency bookkeeping counters, the parent/child join counter and, once
//! it has suspended at least once, a switchable execution context. All state
//! transitions happen under the per-task lock; counters use atomics.

pub(crate) mod phase;

use crate::context::TaskContext;
use crate::dep::{DepRecord, Phase, UnitId};
use crate::transport::TransferHandle;
use bitflags::bitflags;
use parking_lot::{Mutex, MutexGuard};
use smallvec::SmallVec;
use std::fmt;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

/// Process-unique, monotonically increasing task id. Subsumes the instance
/// counter of reused descriptors: an id is never handed out twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

impl TaskId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        TaskId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Nascent,
    Created,
    Queued,
    Deferred,
    Running,
    Suspended,
    Blocked,
    Detached,
    Finished,
    Cancelled,
    Destroyed,
    Root,
    Dummy,
}

impl TaskState {
    pub(crate) fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Finished | TaskState::Cancelled | TaskState::Destroyed
        )
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TaskFlags: u32 {
        /// An external `TaskRef` exists; destruction is deferred to
        /// `taskref_free`/`task_wait`.
        const HAS_REF   = 1 << 0;
        /// Run on the picking worker's stack, no context, no suspension.
        const INLINE    = 1 << 1;
        /// Run eagerly at the point the task becomes runnable.
        const IMMEDIATE = 1 << 2;
        /// Communication task created by the copy-in engine.
        const COMMTASK  = 1 << 3;
        /// Public request for an inline (non-yielding) task.
        const NOYIELD   = 1 << 4;
    }
}

/// Effective priority levels. `COPYIN` is one below the maximum so prefetch
/// tasks outrun computation.
pub(crate) const PRIO_LOW: u8 = 0;
pub(crate) const PRIO_DEFAULT: u8 = 1;
pub(crate) const PRIO_HIGH: u8 = 2;
pub(crate) const PRIO_COPYIN: u8 = 3;

pub(crate) fn prio_is_high(prio: u8) -> bool {
    prio >= PRIO_HIGH
}

/// Priority requested at submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    Low,
    #[default]
    Default,
    High,
    /// Inherit the creating task's priority.
    Parent,
    /// High priority, run on the creator's stack without a context.
    Inline,
}

pub(crate) type TaskBody = Box<dyn FnOnce() + Send + 'static>;

/// Edge from a finished producer to a waiting consumer.
pub(crate) enum Successor {
    Local(Arc<Task>),
    Remote { unit: UnitId, consumer: TaskId },
}

/// State guarded by the per-task lock.
pub(crate) struct TaskMut {
    pub state: TaskState,
    pub successors: Vec<Successor>,
}

pub struct Task {
    pub(crate) id: TaskId,
    pub(crate) descr: &'static str,
    pub(crate) phase: Phase,
    pub(crate) parent: Option<Arc<Task>>,
    pub(crate) numa_hint: Option<usize>,
    root: bool,

    shared: Mutex<TaskMut>,
    flags: AtomicU32,
    prio: AtomicU8,

    pub(crate) num_children: AtomicI32,
    pub(crate) unresolved_deps: AtomicU32,
    pub(crate) unresolved_remote_deps: AtomicU32,

    body: Mutex<Option<TaskBody>>,
    pub(crate) context: Mutex<Option<TaskContext>>,
    pub(crate) deps_owned: Mutex<SmallVec<[Arc<DepRecord>; 4]>>,
    /// Handles an inline task detached on; drained by the wait engine.
    pub(crate) pending_handles: Mutex<SmallVec<[TransferHandle; 2]>>,
}

impl Task {
    pub(crate) fn new(
        body: TaskBody,
        prio: u8,
        flags: TaskFlags,
        phase: Phase,
        parent: Arc<Task>,
        descr: &'static str,
        numa_hint: Option<usize>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: TaskId::next(),
            descr,
            phase,
            parent: Some(parent),
            numa_hint,
            root: false,
            shared: Mutex::new(TaskMut {
                state: TaskState::Nascent,
                successors: Vec::new(),
            }),
            flags: AtomicU32::new(flags.bits()),
            prio: AtomicU8::new(prio),
            num_children: AtomicI32::new(0),
            unresolved_deps: AtomicU32::new(0),
            unresolved_remote_deps: AtomicU32::new(0),
            body: Mutex::new(Some(body)),
            context: Mutex::new(None),
            deps_owned: Mutex::new(SmallVec::new()),
            pending_handles: Mutex::new(SmallVec::new()),
        })
    }

    /// The singleton ancestor of all top-level tasks. Its fields are only
    /// mutated by the master thread.
    pub(crate) fn new_root() -> Arc<Self> {
        Arc::new(Self {
            id: TaskId::next(),
            descr: "root_task",
            phase: crate::dep::PHASE_ANY,
            parent: None,
            numa_hint: None,
            root: true,
            shared: Mutex::new(TaskMut {
                state: TaskState::Root,
                successors: Vec::new(),
            }),
            flags: AtomicU32::new(0),
            prio: AtomicU8::new(PRIO_DEFAULT),
            num_children: AtomicI32::new(0),
            unresolved_deps: AtomicU32::new(0),
            unresolved_remote_deps: AtomicU32::new(0),
            body: Mutex::new(None),
            context: Mutex::new(None),
            deps_owned: Mutex::new(SmallVec::new()),
            pending_handles: Mutex::new(SmallVec::new()),
        })
    }

    /// Placeholder producer bridging a remote consumer and a local producer
    /// that has not been created yet.
    pub(crate) fn new_dummy(phase: Phase, parent: Arc<Task>) -> Arc<Self> {
        Arc::new(Self {
            id: TaskId::next(),
            descr: "dummy",
            phase,
            parent: Some(parent),
            numa_hint: None,
            root: false,
            shared: Mutex::new(TaskMut {
                state: TaskState::Dummy,
                successors: Vec::new(),
            }),
            flags: AtomicU32::new(0),
            prio: AtomicU8::new(PRIO_DEFAULT),
            num_children: AtomicI32::new(0),
            unresolved_deps: AtomicU32::new(0),
            unresolved_remote_deps: AtomicU32::new(0),
            body: Mutex::new(None),
            context: Mutex::new(None),
            deps_owned: Mutex::new(SmallVec::new()),
            pending_handles: Mutex::new(SmallVec::new()),
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, TaskMut> {
        self.shared.lock()
    }

    pub(crate) fn state(&self) -> TaskState {
        self.shared.lock().state
    }

    pub(crate) fn is_root(&self) -> bool {
        self.root
    }

    pub(crate) fn has_flag(&self, flag: TaskFlags) -> bool {
        self.flags.load(Ordering::Acquire) & flag.bits() != 0
    }

    pub(crate) fn set_flag(&self, flag: TaskFlags) {
        self.flags.fetch_or(flag.bits(), Ordering::AcqRel);
    }

    pub(crate) fn clear_flag(&self, flag: TaskFlags) {
        self.flags.fetch_and(!flag.bits(), Ordering::AcqRel);
    }

    pub(crate) fn prio(&self) -> u8 {
        self.prio.load(Ordering::Relaxed)
    }

    pub(crate) fn set_prio(&self, prio: u8) {
        self.prio.store(prio, Ordering::Relaxed);
    }

    /// Both counters must reach zero before the task may run. They are
    /// monotone non-increasing after creation completes.
    pub(crate) fn is_runnable(&self) -> bool {
        self.unresolved_deps.load(Ordering::Acquire) == 0
            && self.unresolved_remote_deps.load(Ordering::Acquire) == 0
    }

    pub(crate) fn take_body(&self) -> Option<TaskBody> {
        self.body.lock().take()
    }

    pub(crate) fn take_context(&self) -> Option<TaskContext> {
        self.context.lock().take()
    }

    pub(crate) fn store_context(&self, ctx: TaskContext) {
        let prev = self.context.lock().replace(ctx);
        debug_assert!(prev.is_none(), "task {} already had a context", self.id);
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("descr", &self.descr)
            .field("phase", &self.phase)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// External handle to a submitted task.
pub struct TaskRef {
    task: Arc<Task>,
}

impl TaskRef {
    pub(crate) fn new(task: Arc<Task>) -> Self {
        Self { task }
    }

    pub(crate) fn task(&self) -> &Arc<Task> {
        &self.task
    }

    pub fn id(&self) -> TaskId {
        self.task.id
    }
}

impl fmt::Debug for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TaskRef").field(&self.task.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_monotone() {
        let a = TaskId::next();
        let b = TaskId::next();
        assert!(b.0 > a.0);
    }

    #[test]
    fn flag_ops() {
        let root = Task::new_root();
        let task = Task::new(
            Box::new(|| {}),
            PRIO_DEFAULT,
            TaskFlags::empty(),
            0,
            root,
            "flag_ops",
            None,
        );
        assert!(!task.has_flag(TaskFlags::HAS_REF));
        task.set_flag(TaskFlags::HAS_REF);
        assert!(task.has_flag(TaskFlags::HAS_REF));
        task.clear_flag(TaskFlags::HAS_REF);
        assert!(!task.has_flag(TaskFlags::HAS_REF));
    }

    #[test]
    fn runnable_counters() {
        let root = Task::new_root();
        let task = Task::new(
            Box::new(|| {}),
            PRIO_DEFAULT,
            TaskFlags::empty(),
            0,
            root,
            "counters",
            None,
        );
        assert!(task.is_runnable());
        task.unresolved_deps.fetch_add(1, Ordering::AcqRel);
        assert!(!task.is_runnable());
        task.unresolved_deps.fetch_sub(1, Ordering::AcqRel);
        assert!(task.is_runnable());
    }
}
