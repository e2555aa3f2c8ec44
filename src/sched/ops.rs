//! Task-side operations, callable from inside task bodies.

use crate::context::{self, in_coroutine, suspend_current, ResumeSignal, YieldPoint};
use crate::error::{Result, TaskError};
use crate::sched::current;
use crate::task::{TaskFlags, TaskState};
use std::ptr::NonNull;

/// Cooperatively yield to another runnable task.
///
/// `delay` controls where the calling task is requeued: `0` at the head,
/// `> 0` that many positions from the head, `< 0` at the tail. Without
/// another runnable task (after forcing remote progress) the call returns
/// immediately. Yielding from an inline task is an error and leaves no
/// state behind.
pub fn yield_now(delay: i32) -> Result<()> {
    let Some(ctx) = current::worker() else {
        // Outside the runtime there is nothing to yield to.
        return Ok(());
    };
    let (sched, td) = (ctx.sched, ctx.td);
    if !sched.threads_running() {
        return Ok(());
    }
    let Some(cur) = current::task() else {
        return Ok(());
    };

    if sched.cancellation_requested() && in_coroutine() {
        context::abort_current_task();
    }

    if cur.has_flag(TaskFlags::INLINE) {
        return Err(TaskError::Inval("inline tasks cannot yield"));
    }

    if cur.is_root() || !in_coroutine() {
        // The master participates by executing a task in place; the root
        // task itself is never suspended.
        sched.run_one(&td);
        return Ok(());
    }

    // Only leave the current task when there is somewhere to go.
    let mut next = sched.next_task(&td);
    if next.is_none() {
        sched.remote_progress(&td, true);
        next = sched.next_task(&td);
    }
    let Some(next) = next else {
        return Ok(());
    };
    td.stash_next(next);

    cur.lock().state = TaskState::Suspended;
    match suspend_current(YieldPoint::Yielded { delay }) {
        ResumeSignal::Continue => Ok(()),
        ResumeSignal::Abort => context::abort_current_task(),
    }
}

/// Create a child task of the calling task. The parent completes only after
/// all its children finished (implicit join).
pub fn spawn<F>(body: F) -> Result<()>
where
    F: FnOnce() + Send + 'static,
{
    let sched = current::scheduler()
        .ok_or(TaskError::Inval("spawn outside the runtime"))?;
    sched
        .create_task(
            Box::new(body),
            crate::task::Priority::Parent,
            TaskFlags::empty(),
            crate::dep::DepList::new(),
            "",
            None,
            false,
        )
        .map(|_| ())
}

/// Local address of the calling task's `n`-th copy-in dependency, resolved
/// to the pool buffer or the caller-provided destination.
pub fn copyin_ptr(n: usize) -> Option<NonNull<u8>> {
    let task = current::task()?;
    crate::copyin::copyin_ptr(&task, n)
}

/// True when called from inside a task managed by the runtime.
pub fn in_task() -> bool {
    current::task().is_some_and(|t| !t.is_root())
}
