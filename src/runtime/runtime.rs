//! The public runtime handle.
//!
//! A `Runtime` owns one process's scheduler. The thread that builds it
//! becomes the master (thread 0); worker threads start lazily on first
//! submission. Dropping the runtime shuts the worker pool down.

use crate::dep::{DepList, GlobalPtr, Phase, SegmentId, TaskDep, UnitId};
use crate::error::Result;
use crate::runtime::builder::{Builder, RuntimeConfig};
use crate::sched::{current, RuntimeStats, Scheduler};
use crate::task::{Priority, TaskFlags, TaskRef};
use crate::transport::loopback::LoopbackFabric;
use crate::transport::Transport;
use std::sync::Arc;

pub struct Runtime {
    sched: Arc<Scheduler>,
}

impl Runtime {
    pub fn builder() -> Builder {
        Builder::new()
    }

    /// Build with default configuration over the given transport.
    pub fn new(transport: Arc<dyn Transport>) -> Result<Runtime> {
        Builder::new().build(transport)
    }

    /// Single-unit runtime over an in-process loopback transport.
    pub fn local() -> Result<Runtime> {
        Builder::new().build(LoopbackFabric::new(1).endpoint(0))
    }

    pub(crate) fn from_config(
        cfg: RuntimeConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Runtime> {
        let sched = Scheduler::new(cfg, transport);
        // The constructing thread is the master and participates in
        // scheduling from the completion calls.
        current::set_worker(sched.clone(), sched.threads[0].clone());
        current::swap_task(Some(sched.root.clone()));
        Ok(Runtime { sched })
    }

    /// Start building a task around `body`.
    pub fn task<F>(&self, body: F) -> TaskBuilder<'_>
    where
        F: FnOnce() + Send + 'static,
    {
        TaskBuilder {
            rt: self,
            body: Some(Box::new(body)),
            deps: DepList::new(),
            prio: Priority::Default,
            flags: TaskFlags::empty(),
            descr: "",
            numa_hint: None,
        }
    }

    /// Wait for all tasks of the current nesting level. On the root task
    /// with `local_only == false` this is a collective matching point
    /// across all units.
    pub fn task_complete(&self, local_only: bool) -> Result<()> {
        self.sched.task_complete(local_only)
    }

    /// Block until the referenced task finished, contributing to
    /// scheduling meanwhile. Consumes and destroys the reference.
    pub fn task_wait(&self, tr: TaskRef) -> Result<()> {
        self.sched.task_wait(tr)
    }

    /// Non-blocking completion poll. Clears the reference and returns true
    /// once the task reached a terminal state. With a single worker the
    /// poll executes at most one task to guarantee progress.
    pub fn task_test(&self, tr: &mut Option<TaskRef>) -> Result<bool> {
        self.sched.task_test(tr)
    }

    /// Drop an external reference without waiting.
    pub fn taskref_free(&self, tr: TaskRef) -> Result<()> {
        self.sched.taskref_free(tr)
    }

    pub fn phase_current(&self) -> Phase {
        self.sched.phases.current()
    }

    /// Advance to the next phase; subsequent top-level tasks belong to it.
    pub fn phase_advance(&self) -> Phase {
        self.sched.phases.advance()
    }

    /// Raise the process-wide cancellation flag. Running tasks abort at
    /// their next suspension point; queued tasks are dropped.
    pub fn cancel(&self) {
        self.sched.cancel()
    }

    pub fn rank(&self) -> UnitId {
        self.sched.remote.my_rank()
    }

    pub fn num_units(&self) -> usize {
        self.sched.remote.num_units()
    }

    pub fn num_threads(&self) -> usize {
        self.sched.cfg.num_threads
    }

    /// Ordering key for a raw local address.
    pub fn local_ptr(&self, addr: usize) -> GlobalPtr {
        GlobalPtr::local_addr(self.rank(), addr)
    }

    /// Globally addressable location in one of this unit's segments.
    pub fn global_ptr(&self, segment: SegmentId, offset: u64) -> GlobalPtr {
        GlobalPtr::new(self.rank(), segment, offset)
    }

    pub fn stats(&self) -> RuntimeStats {
        self.sched.stats()
    }

    /// Stop the worker pool and free pooled resources. Also runs on drop.
    pub fn shutdown(self) {
        drop(self);
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.sched.shutdown();
        // Unregister the master context, but only if it still points at
        // this runtime.
        if let Some(sched) = current::scheduler() {
            if Arc::ptr_eq(&sched, &self.sched) {
                current::clear_worker();
            }
        }
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("rank", &self.rank())
            .field("num_units", &self.num_units())
            .field("num_threads", &self.num_threads())
            .finish()
    }
}

/// Builder for a single task submission.
pub struct TaskBuilder<'rt> {
    rt: &'rt Runtime,
    body: Option<crate::task::TaskBody>,
    deps: DepList,
    prio: Priority,
    flags: TaskFlags,
    descr: &'static str,
    numa_hint: Option<usize>,
}

impl<'rt> TaskBuilder<'rt> {
    pub fn depends_on(mut self, dep: TaskDep) -> Self {
        self.deps.push(dep);
        self
    }

    pub fn deps<I: IntoIterator<Item = TaskDep>>(mut self, deps: I) -> Self {
        self.deps.extend(deps);
        self
    }

    pub fn priority(mut self, prio: Priority) -> Self {
        self.prio = prio;
        self
    }

    pub fn flags(mut self, flags: TaskFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn describe(mut self, descr: &'static str) -> Self {
        self.descr = descr;
        self
    }

    /// Steer the task toward a NUMA domain (honored with NUMA placement).
    pub fn numa_node(mut self, node: usize) -> Self {
        self.numa_hint = Some(node);
        self
    }

    /// Submit fire-and-forget. Returns `Ok` even when the task was deferred
    /// or dropped by an active cancellation.
    pub fn submit(mut self) -> Result<()> {
        let body = self.body.take().expect("task body already consumed");
        self.rt
            .sched
            .create_task(
                body,
                self.prio,
                self.flags,
                std::mem::take(&mut self.deps),
                self.descr,
                self.numa_hint,
                false,
            )
            .map(|_| ())
    }

    /// Submit and keep an external reference. `None` when an active
    /// cancellation dropped the task.
    pub fn submit_with_ref(mut self) -> Result<Option<TaskRef>> {
        let body = self.body.take().expect("task body already consumed");
        self.rt.sched.create_task(
            body,
            self.prio,
            self.flags,
            std::mem::take(&mut self.deps),
            self.descr,
            self.numa_hint,
            true,
        )
    }
}
