//! Scheduler: worker pool state, task life cycle, matching and completion.

pub(crate) mod current;
pub(crate) mod idle;
pub mod ops;
pub(crate) mod queue;
pub(crate) mod slots;
pub(crate) mod wait;
pub(crate) mod worker;

use crate::context::{self, in_coroutine, ContextPool, Outcome, ResumeSignal, TaskContext, YieldPoint};
use crate::copyin::CopyinEngine;
use crate::dep::dephash::DepHash;
use crate::dep::{DepList, Phase, PHASE_ANY, PHASE_FIRST};
use crate::error::{Result, TaskError};
use crate::remote::messages::RemoteMessage;
use crate::remote::RemoteEngine;
use crate::runtime::RuntimeConfig;
use crate::task::phase::PhaseManager;
use crate::task::{
    Priority, Successor, Task, TaskBody, TaskFlags, TaskId, TaskRef, TaskState, PRIO_DEFAULT,
    PRIO_HIGH, PRIO_LOW,
};
use crate::transport::Transport;
use crate::util::current_time_us;
use corosensei::CoroutineResult;
use idle::IdleCoordinator;
use parking_lot::Mutex;
use queue::TaskQueue;
use slots::HotSlots;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use wait::{WaitKind, WaitQueue};

/// Remote progress is paced to once per interval unless forced.
const REMOTE_PROGRESS_INTERVAL_US: u64 = 10_000;

pub(crate) struct ThreadData {
    pub thread_id: usize,
    pub numa_id: usize,
    pub slots: HotSlots,
    /// Task stashed by a yield for the worker to pick up first.
    next_task: Mutex<Option<Arc<Task>>>,
    pub last_steal: AtomicUsize,
    pub last_progress_us: AtomicU64,
    pub tasks_executed: AtomicU64,
    pub idle_us: AtomicU64,
}

impl ThreadData {
    fn new(thread_id: usize, numa_id: usize, num_threads: usize) -> Arc<Self> {
        Arc::new(Self {
            thread_id,
            numa_id,
            slots: HotSlots::new(),
            next_task: Mutex::new(None),
            // Start victim scans at a random peer to spread contention.
            last_steal: AtomicUsize::new(fastrand::usize(0..num_threads)),
            last_progress_us: AtomicU64::new(0),
            tasks_executed: AtomicU64::new(0),
            idle_us: AtomicU64::new(0),
        })
    }

    pub(crate) fn stash_next(&self, task: Arc<Task>) {
        let prev = self.next_task.lock().replace(task);
        debug_assert!(prev.is_none(), "yield stashed over an existing task");
    }

    fn take_stashed(&self) -> Option<Arc<Task>> {
        self.next_task.lock().take()
    }
}

pub(crate) struct Scheduler {
    pub cfg: RuntimeConfig,
    pub transport: Arc<dyn Transport>,
    pub threads: Vec<Arc<ThreadData>>,
    /// One two-priority queue per NUMA domain.
    queues: Vec<TaskQueue>,
    /// Tasks whose phase is not runnable yet.
    deferred: TaskQueue,
    pub dephash: DepHash,
    pub phases: PhaseManager,
    pub remote: RemoteEngine,
    pub copyin: CopyinEngine,
    pub waitq: WaitQueue,
    pub ctx_pool: ContextPool,
    pub idle: IdleCoordinator,
    pub root: Arc<Task>,

    parallel: AtomicBool,
    threads_running: AtomicBool,
    worker_poll_remote: AtomicBool,
    cancel_requested: AtomicBool,
    cancel_drained: AtomicBool,
    join_handles: Mutex<Vec<JoinHandle<()>>>,
    matching_us: AtomicU64,
}

impl Scheduler {
    pub(crate) fn new(cfg: RuntimeConfig, transport: Arc<dyn Transport>) -> Arc<Self> {
        let my_rank = transport.rank();
        let num_units = transport.num_units();
        Arc::new_cyclic(|weak: &std::sync::Weak<Scheduler>| {
            let handler = {
                let weak = weak.clone();
                Box::new(move |bytes: &[u8]| {
                    if let Some(sched) = weak.upgrade() {
                        sched.dispatch_remote(bytes);
                    }
                })
            };
            let remote = RemoteEngine::new(
                transport.clone(),
                cfg.msg_size,
                cfg.msg_count,
                cfg.amsgq_direct,
                cfg.amsgq_sync,
                handler,
            );
            Scheduler {
                threads: (0..cfg.num_threads)
                    .map(|i| {
                        ThreadData::new(
                            i,
                            i * cfg.num_numa_nodes / cfg.num_threads,
                            cfg.num_threads,
                        )
                    })
                    .collect(),
                queues: (0..cfg.num_numa_nodes).map(|_| TaskQueue::new()).collect(),
                deferred: TaskQueue::new(),
                dephash: DepHash::new(my_rank),
                phases: PhaseManager::new(num_units),
                remote,
                copyin: CopyinEngine::new(cfg.copyin_impl, cfg.copyin_wait),
                waitq: WaitQueue::new(),
                ctx_pool: ContextPool::new(cfg.num_threads, cfg.task_stack_size),
                idle: IdleCoordinator::new(cfg.idle_method, cfg.idle_sleep),
                root: Task::new_root(),
                transport,
                parallel: AtomicBool::new(true),
                threads_running: AtomicBool::new(false),
                worker_poll_remote: AtomicBool::new(false),
                cancel_requested: AtomicBool::new(false),
                cancel_drained: AtomicBool::new(false),
                join_handles: Mutex::new(Vec::new()),
                matching_us: AtomicU64::new(0),
                cfg,
            }
        })
    }

    pub(crate) fn parallel(&self) -> bool {
        self.parallel.load(Ordering::Acquire)
    }

    pub(crate) fn parallel_flag(&self) -> &AtomicBool {
        &self.parallel
    }

    pub(crate) fn threads_running(&self) -> bool {
        self.threads_running.load(Ordering::Acquire)
    }

    pub(crate) fn worker_poll_remote(&self) -> bool {
        self.worker_poll_remote.load(Ordering::Acquire)
    }

    pub(crate) fn cancellation_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::Acquire)
    }

    pub(crate) fn cancel(&self) {
        if !self.cancel_requested.swap(true, Ordering::AcqRel) {
            tracing::debug!("cancellation raised");
        }
        self.idle.wake_all();
    }

    fn reset_cancellation(&self) {
        self.cancel_requested.store(false, Ordering::Release);
        self.cancel_drained.store(false, Ordering::Release);
    }

    /// Once per cancellation, flush the deferred queue so deferred tasks
    /// reach their terminal state too.
    pub(crate) fn check_cancellation(&self) {
        if !self.cancellation_requested() {
            return;
        }
        if !self.cancel_drained.swap(true, Ordering::AcqRel) {
            for task in self.deferred.drain() {
                self.cancel_task(&task);
            }
        }
    }

    /// Start the worker threads on first use.
    pub(crate) fn ensure_threads_running(self: &Arc<Self>) {
        if self.threads_running.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(threads = self.cfg.num_threads, "starting worker pool");
        let mut handles = self.join_handles.lock();
        for td in self.threads.iter().skip(1) {
            let sched = self.clone();
            let td = td.clone();
            let handle = std::thread::Builder::new()
                .name(format!("taskmesh-worker-{}", td.thread_id))
                .stack_size(self.cfg.task_stack_size.max(1 << 21))
                .spawn(move || worker::thread_main(sched, td))
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }
    }

    // ------------------------------------------------------------------
    // Task acquisition
    // ------------------------------------------------------------------

    /// The six-step acquisition chain: stashed yield successor, own hot
    /// slots, last successful victim, same-NUMA victims, shared queues
    /// (local domain first), cross-NUMA victims.
    pub(crate) fn next_task(&self, td: &ThreadData) -> Option<Arc<Task>> {
        if let Some(task) = td.take_stashed() {
            return Some(task);
        }
        if let Some(task) = td.slots.take_front() {
            return Some(task);
        }

        let n = self.threads.len();
        let last = td.last_steal.load(Ordering::Relaxed);
        if last != td.thread_id && last < n {
            if let Some(task) = self.threads[last].slots.take_back() {
                return Some(task);
            }
        }

        let mut target = (td.thread_id + 1) % n;
        while target != td.thread_id {
            let victim = &self.threads[target];
            if victim.numa_id == td.numa_id {
                if let Some(task) = victim.slots.take_back() {
                    tracing::trace!(victim = target, "stole task from same-NUMA victim");
                    td.last_steal.store(target, Ordering::Relaxed);
                    return Some(task);
                }
            }
            target = (target + 1) % n;
        }

        let domains = self.queues.len();
        for i in 0..domains {
            if let Some(task) = self.queues[(td.numa_id + i) % domains].pop() {
                return Some(task);
            }
        }

        if domains > 1 {
            let mut target = (td.thread_id + 1) % n;
            while target != td.thread_id {
                let victim = &self.threads[target];
                if victim.numa_id != td.numa_id {
                    if let Some(task) = victim.slots.take_back() {
                        tracing::trace!(victim = target, "stole task across NUMA domains");
                        td.last_steal.store(target, Ordering::Relaxed);
                        return Some(task);
                    }
                }
                target = (target + 1) % n;
            }
        }

        None
    }

    /// Execute one task if any is available; used by the master's wait
    /// loops. Returns whether a task was found.
    pub(crate) fn run_one(&self, td: &Arc<ThreadData>) -> bool {
        let mut task = self.next_task(td);
        if task.is_none() {
            self.remote_progress(td, td.thread_id == 0);
            task = self.next_task(td);
        }
        let found = task.is_some();
        self.handle_task_internal(task, td);
        found
    }

    pub(crate) fn handle_task_internal(&self, task: Option<Arc<Task>>, td: &Arc<ThreadData>) {
        let Some(task) = task else { return };
        if task.has_flag(TaskFlags::INLINE) {
            self.handle_inline_task(&task);
        } else {
            self.handle_task(&task, td);
        }
    }

    // ------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------

    fn handle_task(&self, task: &Arc<Task>, td: &Arc<ThreadData>) {
        let aborting = self.cancellation_requested();
        {
            let mut m = task.lock();
            debug_assert!(
                matches!(m.state, TaskState::Queued | TaskState::Suspended),
                "task {} dispatched in state {:?}",
                task.id,
                m.state
            );
            if aborting && task.context.lock().is_none() {
                // Never started; no context to unwind.
                drop(m);
                self.cancel_task(task);
                return;
            }
            m.state = TaskState::Running;
        }
        debug_assert!(task.is_runnable(), "task {} dispatched with unresolved deps", task.id);

        let prev = current::swap_task(Some(task.clone()));
        let mut ctx = match task.take_context() {
            Some(ctx) => ctx,
            None => {
                let body = task.take_body().expect("task without a body");
                TaskContext::new(
                    self.ctx_pool.acquire(td.thread_id),
                    Arc::downgrade(task),
                    body,
                )
            }
        };

        let sig = if aborting {
            ResumeSignal::Abort
        } else {
            ResumeSignal::Continue
        };
        tracing::trace!(task = %task.id, descr = task.descr, "entering task");
        let result = ctx.resume(sig);
        context::clear_yielder();

        match result {
            CoroutineResult::Yield(yp) => {
                task.store_context(ctx);
                match yp {
                    YieldPoint::Yielded { delay } => self.requeue(td, task.clone(), delay),
                    YieldPoint::Blocked { handles } => {
                        self.waitq.enqueue(task.clone(), handles, WaitKind::Resume)
                    }
                    YieldPoint::Detached { handles } => {
                        self.waitq.enqueue(task.clone(), handles, WaitKind::Resume)
                    }
                }
            }
            CoroutineResult::Return(outcome) => {
                // The context goes back to its owner before the descriptor
                // can be recycled.
                self.ctx_pool.release(ctx.reclaim_stack());
                self.finish_task(task, outcome);
                td.tasks_executed.fetch_add(1, Ordering::Relaxed);
            }
        }
        current::swap_task(prev);
    }

    /// Inline tasks run on the picking thread's stack, without a context
    /// and without any suspension point.
    pub(crate) fn handle_inline_task(&self, task: &Arc<Task>) {
        {
            let mut m = task.lock();
            if self.cancellation_requested() {
                drop(m);
                self.cancel_task(task);
                return;
            }
            debug_assert!(
                matches!(m.state, TaskState::Queued | TaskState::Created),
                "inline task {} dispatched in state {:?}",
                task.id,
                m.state
            );
            m.state = TaskState::Running;
        }

        let prev = current::swap_task(Some(task.clone()));
        let body = task.take_body().expect("inline task without a body");
        let outcome = match panic::catch_unwind(AssertUnwindSafe(body)) {
            Ok(()) => Outcome::Finished,
            Err(payload) => {
                if payload.downcast_ref::<context::TaskAbort>().is_none() {
                    tracing::error!(task = %task.id, "inline task panicked, recording as cancelled");
                }
                Outcome::Cancelled
            }
        };

        // Implicit child join, executing tasks in place.
        if outcome == Outcome::Finished {
            while task.num_children.load(Ordering::Acquire) > 0 && !self.cancellation_requested() {
                if let Some(td) = current::thread_data() {
                    self.run_one(&td);
                } else {
                    break;
                }
            }
        }

        if task.state() == TaskState::Detached {
            let handles = std::mem::take(&mut *task.pending_handles.lock());
            self.waitq
                .enqueue(task.clone(), handles, WaitKind::FinishDetached);
        } else {
            self.finish_task(task, outcome);
        }

        current::swap_task(prev);
        if let Some(td) = current::thread_data() {
            td.tasks_executed.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn requeue(&self, td: &ThreadData, task: Arc<Task>, delay: i32) {
        let queue = &self.queues[td.numa_id.min(self.queues.len() - 1)];
        if delay == 0 {
            queue.push(task);
        } else if delay > 0 {
            queue.insert(task, delay as usize);
        } else {
            queue.pushback(task);
        }
    }

    // ------------------------------------------------------------------
    // Completion and release
    // ------------------------------------------------------------------

    pub(crate) fn finish_task(&self, task: &Arc<Task>, outcome: Outcome) {
        let (has_ref, drained) = {
            let mut m = task.lock();
            m.state = match outcome {
                Outcome::Finished => TaskState::Finished,
                Outcome::Cancelled => TaskState::Cancelled,
            };
            (
                task.has_flag(TaskFlags::HAS_REF),
                std::mem::take(&mut m.successors),
            )
        };
        tracing::trace!(task = %task.id, ?outcome, "task completed");
        self.release_successors(drained);

        let parent = task.parent.clone();
        if !has_ref {
            self.destroy_task(task);
        }
        if let Some(parent) = parent {
            let left = parent.num_children.fetch_sub(1, Ordering::AcqRel) - 1;
            debug_assert!(left >= 0, "child counter of {} went negative", parent.id);
            tracing::trace!(parent = %parent.id, left, "child finished");
        }
    }

    /// Completion path for a detached inline task whose handles finished.
    pub(crate) fn finish_detached(&self, task: &Arc<Task>) {
        debug_assert_eq!(task.state(), TaskState::Detached);
        self.finish_task(task, Outcome::Finished);
    }

    fn release_successors(&self, drained: Vec<Successor>) {
        for successor in drained {
            match successor {
                Successor::Local(consumer) => self.release_one_local_dep(&consumer),
                Successor::Remote { unit, consumer } => self.remote.send_release(unit, consumer),
            }
        }
    }

    pub(crate) fn release_one_local_dep(&self, consumer: &Arc<Task>) {
        let before = consumer.unresolved_deps.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(before > 0, "dependency counter of {} underflowed", consumer.id);
        if before == 1 && consumer.unresolved_remote_deps.load(Ordering::Acquire) == 0 {
            self.enqueue_runnable(consumer);
        }
    }

    fn handle_remote_release(&self, consumer: TaskId) {
        let Some(task) = self.remote.find_waiting(consumer) else {
            tracing::warn!(%consumer, "remote release for an unknown task");
            return;
        };
        let before = task.unresolved_remote_deps.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(before > 0);
        if before == 1 {
            self.remote.forget_waiting(consumer);
            if task.unresolved_deps.load(Ordering::Acquire) == 0 {
                self.enqueue_runnable(&task);
            }
        }
    }

    /// Cancel a task that has not started executing.
    pub(crate) fn cancel_task(&self, task: &Arc<Task>) {
        let proceed = {
            let mut m = task.lock();
            if matches!(
                m.state,
                TaskState::Nascent | TaskState::Created | TaskState::Queued | TaskState::Deferred
            ) {
                m.state = TaskState::Cancelled;
                true
            } else {
                false
            }
        };
        if !proceed {
            return;
        }
        tracing::trace!(task = %task.id, "task cancelled before execution");
        // Outstanding dependencies are released as if the task completed.
        let drained = std::mem::take(&mut task.lock().successors);
        self.release_successors(drained);
        let parent = task.parent.clone();
        if !task.has_flag(TaskFlags::HAS_REF) {
            self.destroy_task(task);
        }
        if let Some(parent) = parent {
            parent.num_children.fetch_sub(1, Ordering::AcqRel);
        }
    }

    pub(crate) fn destroy_task(&self, task: &Arc<Task>) {
        {
            let mut m = task.lock();
            if m.state == TaskState::Destroyed {
                return;
            }
            debug_assert!(m.state.is_terminal() || m.state == TaskState::Dummy);
            m.state = TaskState::Destroyed;
        }
        self.dephash.remove_task(task);
        self.remote.forget_waiting(task.id);
        if task.parent.as_ref().is_some_and(|p| p.is_root()) {
            self.phases.take_task(task.phase);
        }
    }

    // ------------------------------------------------------------------
    // Enqueueing
    // ------------------------------------------------------------------

    pub(crate) fn enqueue_runnable(&self, task: &Arc<Task>) {
        if self.cancellation_requested() {
            self.cancel_task(task);
            return;
        }

        let queueable = {
            let mut m = task.lock();
            match m.state {
                TaskState::Created if task.is_runnable() => {
                    m.state = TaskState::Queued;
                    true
                }
                TaskState::Suspended => true,
                _ => false,
            }
        };
        if !queueable {
            tracing::trace!(task = %task.id, state = ?task.state(), "not queueable");
            return;
        }

        // Tasks of a phase that is not runnable yet wait in the deferred
        // queue; the phase check and the enqueue are atomic against the
        // matching that releases them.
        if task.parent.as_ref().is_some_and(|p| p.is_root())
            && !self.phases.is_runnable(task.phase)
        {
            let mut deferred = self.deferred.lock();
            if !self.phases.is_runnable(task.phase) {
                let mut m = task.lock();
                if matches!(m.state, TaskState::Created | TaskState::Queued) {
                    tracing::trace!(task = %task.id, phase = task.phase, "deferring task");
                    m.state = TaskState::Deferred;
                    deferred.pushback(task.clone());
                    return;
                }
            }
        }

        // Immediate tasks bypass the queue entirely.
        if task.has_flag(TaskFlags::IMMEDIATE) {
            self.handle_inline_task(task);
            return;
        }

        let numa = if self.cfg.respect_numa {
            task.numa_hint
                .unwrap_or(0)
                .min(self.queues.len() - 1)
        } else {
            0
        };

        // Hot-slot hand-off when the enqueuing thread sits on the right
        // domain; the shared queue otherwise.
        let mut task_for_queue = task.clone();
        if let Some(td) = current::thread_data() {
            if td.numa_id == numa {
                match td.slots.push(task_for_queue) {
                    Ok(()) => return,
                    Err(back) => task_for_queue = back,
                }
            }
        }
        self.queues[numa].push(task_for_queue);
        self.idle.wake_one();
    }

    // ------------------------------------------------------------------
    // Creation
    // ------------------------------------------------------------------

    /// Internal submission used by the copy-in engine.
    pub(crate) fn spawn_internal(
        self: &Arc<Self>,
        body: TaskBody,
        prio: u8,
        flags: TaskFlags,
        deps: DepList,
        descr: &'static str,
    ) -> Result<()> {
        self.create_task_inner(body, prio, flags, deps, descr, None, false)
            .map(|_| ())
    }

    pub(crate) fn create_task(
        self: &Arc<Self>,
        body: TaskBody,
        prio: Priority,
        mut flags: TaskFlags,
        deps: DepList,
        descr: &'static str,
        numa_hint: Option<usize>,
        want_ref: bool,
    ) -> Result<Option<TaskRef>> {
        let parent = current::task().unwrap_or_else(|| self.root.clone());
        let prio = match prio {
            Priority::Low => PRIO_LOW,
            Priority::Default => PRIO_DEFAULT,
            Priority::High => PRIO_HIGH,
            Priority::Parent => parent.prio(),
            Priority::Inline => {
                flags |= TaskFlags::INLINE | TaskFlags::IMMEDIATE;
                PRIO_HIGH
            }
        };
        self.create_task_inner(body, prio, flags, deps, descr, numa_hint, want_ref)
    }

    fn create_task_inner(
        self: &Arc<Self>,
        body: TaskBody,
        prio: u8,
        mut flags: TaskFlags,
        deps: DepList,
        descr: &'static str,
        numa_hint: Option<usize>,
        want_ref: bool,
    ) -> Result<Option<TaskRef>> {
        if self.cancellation_requested() {
            tracing::warn!("ignoring task creation while cancelling");
            return Ok(None);
        }
        self.ensure_threads_running();

        // A task that must not suspend runs inline.
        if flags.intersects(TaskFlags::NOYIELD | TaskFlags::IMMEDIATE) {
            flags |= TaskFlags::INLINE;
        }

        let parent = current::task().unwrap_or_else(|| self.root.clone());
        let phase = if parent.is_root() {
            let phase = self.phases.current();
            self.phases.add_task(phase);
            phase
        } else {
            PHASE_ANY
        };

        let task = Task::new(body, prio, flags, phase, parent.clone(), descr, numa_hint);
        if want_ref {
            task.set_flag(TaskFlags::HAS_REF);
        }
        parent.num_children.fetch_add(1, Ordering::AcqRel);

        self.dephash.register_task(self, &task, deps)?;

        let runnable = {
            let mut m = task.lock();
            m.state = TaskState::Created;
            task.is_runnable()
        };
        tracing::trace!(
            task = %task.id,
            descr,
            phase,
            runnable,
            "task created"
        );
        if runnable {
            self.enqueue_runnable(&task);
        }

        Ok(want_ref.then(|| TaskRef::new(task)))
    }

    // ------------------------------------------------------------------
    // Remote progress and matching
    // ------------------------------------------------------------------

    pub(crate) fn remote_progress(&self, td: &ThreadData, force: bool) {
        self.waitq.poll(self);
        if self.remote.num_units() == 1 {
            return;
        }
        let now = current_time_us();
        let last = td.last_progress_us.load(Ordering::Relaxed);
        if force || now.saturating_sub(last) >= REMOTE_PROGRESS_INTERVAL_US {
            self.remote.progress();
            td.last_progress_us.store(now, Ordering::Relaxed);
        }
    }

    fn dispatch_remote(self: &Arc<Self>, bytes: &[u8]) {
        match RemoteMessage::decode(bytes) {
            Ok(RemoteMessage::RequestDep {
                key,
                phase,
                requester,
                consumer,
            }) => self
                .dephash
                .handle_remote_request(self, key, phase, requester, consumer),
            Ok(RemoteMessage::ReleaseDep { consumer }) => self.handle_remote_release(consumer),
            Ok(RemoteMessage::SendRequest {
                src,
                size,
                tag,
                phase,
                requester,
            }) => self
                .copyin
                .enqueue_delayed_send(src, size as usize, tag, requester, phase),
            Err(e) => tracing::warn!(error = %e, "dropping undecodable remote message"),
        }
    }

    /// The collective matching step closing the epoch up to `phase`.
    pub(crate) fn perform_matching(self: &Arc<Self>, phase: Phase) {
        if self.remote.num_units() == 1 {
            return;
        }
        let start = current_time_us();
        tracing::debug!(phase, "performing matching");

        // Flush in-flight dependency requests of every unit.
        if let Err(e) = self.remote.progress_blocking() {
            tracing::warn!(error = %e, "blocking progress failed during matching");
        }
        // Serve requests that waited for their producing phase.
        self.dephash.handle_deferred_remote(self, phase);
        // Create the send tasks requested by remote copy-ins.
        self.copyin.create_delayed_tasks(self);
        // Open the phase and release its deferred tasks.
        self.phases.set_runnable(phase);
        self.release_deferred_local();
        self.idle.wake_all();

        self.matching_us
            .fetch_add(current_time_us() - start, Ordering::Relaxed);
    }

    fn release_deferred_local(&self) {
        for task in self.deferred.drain() {
            {
                let mut m = task.lock();
                if m.state == TaskState::Deferred {
                    m.state = TaskState::Created;
                }
            }
            // Re-defers itself when its phase is still closed.
            self.enqueue_runnable(&task);
        }
    }

    // ------------------------------------------------------------------
    // Completion API
    // ------------------------------------------------------------------

    pub(crate) fn task_complete(self: &Arc<Self>, local_only: bool) -> Result<()> {
        if !self.threads_running() {
            if local_only {
                return Ok(());
            }
            // Participate in the collective matching even without local work.
            self.ensure_threads_running();
        }

        let td = current::thread_data()
            .ok_or(TaskError::Inval("task_complete outside the runtime"))?;
        let cur = current::task().unwrap_or_else(|| self.root.clone());

        if cur.is_root() {
            if td.thread_id != 0 {
                return Err(TaskError::Inval(
                    "task_complete on the root task is only valid on the master thread",
                ));
            }
            self.task_complete_root(&td, local_only)
        } else {
            self.task_complete_inner(&td, &cur)
        }
    }

    fn task_complete_root(self: &Arc<Self>, td: &Arc<ThreadData>, local_only: bool) -> Result<()> {
        if !local_only {
            let entry_phase = self.phases.current();
            self.perform_matching(entry_phase);
            self.worker_poll_remote.store(true, Ordering::Release);
        }
        self.idle.wake_all();

        while self.root.num_children.load(Ordering::Acquire) > 0 {
            self.check_cancellation();
            self.run_one(td);
        }

        // The epoch is closed: reset phases and, if a cancellation drained
        // it, rearm for the next one.
        if self.cancellation_requested() {
            self.reset_cancellation();
        }
        self.phases.set_runnable(PHASE_FIRST);
        self.worker_poll_remote.store(false, Ordering::Release);
        self.phases.reset();

        if !local_only {
            if let Err(e) = self.remote.progress_blocking() {
                tracing::warn!(error = %e, "blocking progress failed closing the epoch");
            }
        }
        Ok(())
    }

    fn task_complete_inner(self: &Arc<Self>, td: &Arc<ThreadData>, cur: &Arc<Task>) -> Result<()> {
        self.idle.wake_all();
        let suspendable = in_coroutine() && !cur.has_flag(TaskFlags::INLINE);
        while cur.num_children.load(Ordering::Acquire) > 0 {
            if self.cancellation_requested() {
                if in_coroutine() {
                    context::abort_current_task();
                }
                break;
            }
            if suspendable {
                ops::yield_now(-1)?;
            } else {
                self.run_one(td);
            }
        }
        Ok(())
    }

    pub(crate) fn task_wait(self: &Arc<Self>, tr: TaskRef) -> Result<()> {
        let task = tr.task().clone();
        if task.state() == TaskState::Destroyed {
            return Err(TaskError::Inval("wait on a destroyed task"));
        }
        let td = current::thread_data()
            .ok_or(TaskError::Inval("task_wait outside the runtime"))?;

        while !task.state().is_terminal() {
            if in_coroutine() {
                ops::yield_now(-1)?;
            } else {
                self.run_one(&td);
            }
        }

        task.clear_flag(TaskFlags::HAS_REF);
        self.destroy_task(&task);
        Ok(())
    }

    pub(crate) fn task_test(self: &Arc<Self>, tr: &mut Option<TaskRef>) -> Result<bool> {
        let Some(r) = tr.as_ref() else {
            return Err(TaskError::Inval("test on an empty task reference"));
        };
        let task = r.task().clone();

        // With a single worker the poll itself must make progress.
        if self.cfg.num_threads == 1 && !task.state().is_terminal() {
            if let Some(td) = current::thread_data() {
                self.run_one(&td);
            }
        }

        if task.state().is_terminal() {
            task.clear_flag(TaskFlags::HAS_REF);
            self.destroy_task(&task);
            *tr = None;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub(crate) fn taskref_free(&self, tr: TaskRef) -> Result<()> {
        let task = tr.task().clone();
        task.clear_flag(TaskFlags::HAS_REF);
        if task.state().is_terminal() {
            self.destroy_task(&task);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Shutdown and statistics
    // ------------------------------------------------------------------

    pub(crate) fn shutdown(&self) {
        if !self.parallel.swap(false, Ordering::AcqRel) {
            return;
        }
        self.idle.wake_all();
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.join_handles.lock());
        for handle in handles {
            if handle.join().is_err() {
                tracing::error!("a worker thread panicked during shutdown");
            }
        }
        self.threads_running.store(false, Ordering::Release);
        self.teardown_pending_tasks();
        self.ctx_pool.drain_all();

        let stats = self.stats();
        tracing::info!(
            tasks = stats.tasks_executed,
            idle_us = stats.idle_us,
            matching_us = stats.matching_us,
            "runtime shut down"
        );
    }

    /// Unwind every task left behind at shutdown. A suspended context is
    /// resumed with an abort so it unwinds on its own stack; dropping it
    /// suspended would leave live frames unexecuted.
    fn teardown_pending_tasks(&self) {
        let mut pending: Vec<Arc<Task>> = Vec::new();
        pending.extend(self.deferred.drain());
        for queue in &self.queues {
            pending.extend(queue.drain());
        }
        for td in &self.threads {
            if let Some(task) = td.take_stashed() {
                pending.push(task);
            }
            while let Some(task) = td.slots.take_front() {
                pending.push(task);
            }
        }
        pending.extend(self.waitq.drain_tasks());

        for task in pending {
            tracing::debug!(task = %task.id, "tearing down pending task");
            if let Some(mut ctx) = task.take_context() {
                let result = ctx.resume(ResumeSignal::Abort);
                context::clear_yielder();
                debug_assert!(matches!(result, CoroutineResult::Return(_)));
                self.ctx_pool.release(ctx.reclaim_stack());
            }
            let mut m = task.lock();
            if !m.state.is_terminal() {
                m.state = TaskState::Cancelled;
            }
        }
    }

    pub(crate) fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            tasks_executed: self
                .threads
                .iter()
                .map(|t| t.tasks_executed.load(Ordering::Relaxed))
                .sum(),
            idle_us: self
                .threads
                .iter()
                .map(|t| t.idle_us.load(Ordering::Relaxed))
                .sum(),
            matching_us: self.matching_us.load(Ordering::Relaxed),
            tasks_in_flight: self.phases.tasks_in_flight(),
            pending_remote_requests: self.dephash.pending_remote_requests(),
        }
    }
}

/// Aggregated runtime counters.
#[derive(Debug, Clone, Default)]
pub struct RuntimeStats {
    pub tasks_executed: u64,
    pub idle_us: u64,
    pub matching_us: u64,
    pub tasks_in_flight: usize,
    pub pending_remote_requests: usize,
}
