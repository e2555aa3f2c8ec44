//! Wait engine for tasks bound to transport handles.
//!
//! Blocked and detached tasks park here together with their outstanding
//! handles; progress ticks poll the handles and hand completed tasks back
//! to the scheduler. A detached inline task has no context to resume, so
//! its completion is finalized directly instead.

use crate::context::{self, in_coroutine, suspend_current, ResumeSignal, YieldPoint};
use crate::sched::{current, Scheduler};
use crate::task::{Task, TaskFlags, TaskState};
use crate::transport::TransferHandle;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::sync::Arc;

pub(crate) type Handles = SmallVec<[TransferHandle; 2]>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitKind {
    /// Suspended context; completion re-enqueues the task.
    Resume,
    /// Inline task that detached; completion finalizes it.
    FinishDetached,
}

struct WaitEntry {
    task: Arc<Task>,
    handles: Handles,
    kind: WaitKind,
}

pub(crate) struct WaitQueue {
    entries: Mutex<Vec<WaitEntry>>,
}

impl WaitQueue {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn enqueue(&self, task: Arc<Task>, handles: Handles, kind: WaitKind) {
        tracing::trace!(task = %task.id, ?kind, "parking task on the wait engine");
        self.entries.lock().push(WaitEntry {
            task,
            handles,
            kind,
        });
    }

    /// Shutdown support: hand every parked task back for teardown.
    pub(crate) fn drain_tasks(&self) -> Vec<Arc<Task>> {
        self.entries
            .lock()
            .drain(..)
            .map(|e| e.task)
            .collect()
    }

    /// Release every entry whose handles all completed. Under cancellation
    /// the handles are abandoned and the tasks released for teardown.
    pub(crate) fn poll(&self, sched: &Scheduler) {
        if self.entries.lock().is_empty() {
            return;
        }
        let cancelling = sched.cancellation_requested();
        let ready: Vec<WaitEntry> = {
            let mut entries = self.entries.lock();
            let (ready, waiting): (Vec<_>, Vec<_>) = entries
                .drain(..)
                .partition(|e| cancelling || e.handles.iter().all(TransferHandle::is_complete));
            *entries = waiting;
            ready
        };
        for entry in ready {
            match entry.kind {
                WaitKind::Resume => {
                    {
                        let mut m = entry.task.lock();
                        debug_assert!(matches!(
                            m.state,
                            TaskState::Blocked | TaskState::Detached | TaskState::Suspended
                        ));
                        m.state = TaskState::Suspended;
                    }
                    sched.enqueue_runnable(&entry.task);
                }
                WaitKind::FinishDetached => {
                    if cancelling {
                        sched.finish_task(&entry.task, context::Outcome::Cancelled);
                    } else {
                        sched.finish_detached(&entry.task);
                    }
                }
            }
        }
    }
}

fn can_suspend(task: &Arc<Task>) -> bool {
    in_coroutine()
        && !task.is_root()
        && !task.has_flag(TaskFlags::INLINE)
        && !task.has_flag(TaskFlags::IMMEDIATE)
}

/// Block the calling task until all handles completed. The task yields to
/// others and is woken by the wait engine; on the master thread or inside
/// an inline task this degrades to a progress-polling spin.
pub(crate) fn block_on_handles(handles: Handles) {
    if handles.iter().all(TransferHandle::is_complete) {
        return;
    }
    let task = current::task();
    match task {
        Some(t) if can_suspend(&t) => {
            t.lock().state = TaskState::Blocked;
            if matches!(
                suspend_current(YieldPoint::Blocked { handles }),
                ResumeSignal::Abort
            ) {
                context::abort_current_task();
            }
        }
        _ => spin_until_complete(&handles),
    }
}

/// Detach the calling task from its context: completion of the handles
/// completes the task. An inline task stashes the handles and returns; its
/// wrapper parks it on the wait engine.
pub(crate) fn detach_on_handles(handles: Handles) {
    if handles.iter().all(TransferHandle::is_complete) {
        return;
    }
    let Some(task) = current::task() else {
        spin_until_complete(&handles);
        return;
    };
    task.lock().state = TaskState::Detached;
    if can_suspend(&task) {
        // Re-entered under the same identity once the handles completed;
        // the body then runs to its end.
        if matches!(
            suspend_current(YieldPoint::Detached { handles }),
            ResumeSignal::Abort
        ) {
            context::abort_current_task();
        }
    } else {
        task.pending_handles.lock().extend(handles);
    }
}

fn spin_until_complete(handles: &Handles) {
    let sched = current::scheduler();
    while !handles.iter().all(TransferHandle::is_complete) {
        if let Some(s) = &sched {
            s.transport.progress();
            s.remote.progress();
        }
        std::hint::spin_loop();
    }
}
