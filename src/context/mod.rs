//! Execution contexts and the per-thread context pool.
//!
//! A task that may suspend runs inside a stackful coroutine backed by a
//! pooled, guard-paged stack. Suspension is asymmetric: the task suspends
//! back into the worker's scheduler loop carrying a [`YieldPoint`], and the
//! worker decides where the task goes next. Resuming passes a
//! [`ResumeSignal`]; `Abort` makes the next suspension point unwind the task
//! body, which the coroutine boundary maps to a cancelled outcome — aborts
//! never escape into the scheduler.

pub(crate) mod stack;

use crate::task::{Task, TaskBody, TaskState};
use crate::transport::TransferHandle;
use corosensei::{Coroutine, CoroutineResult, Yielder};
use crossbeam_queue::SegQueue;
use smallvec::SmallVec;
use stack::{PooledStack, StackHandle};
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;
use std::sync::atomic::Ordering;
use std::sync::Weak;

/// Contexts cached per thread before surplus stacks are unmapped.
pub(crate) const PER_THREAD_CTX_CACHE: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResumeSignal {
    Continue,
    /// Unwind the task at its current suspension point.
    Abort,
}

/// What a suspended task asks of the worker it suspended into.
pub(crate) enum YieldPoint {
    /// Cooperative yield; requeue at `delay` positions from the head
    /// (head when 0, tail when negative).
    Yielded { delay: i32 },
    /// Waiting on transport handles; park on the wait engine.
    Blocked {
        handles: SmallVec<[TransferHandle; 2]>,
    },
    /// Detached on transport handles; completion re-enters the task.
    Detached {
        handles: SmallVec<[TransferHandle; 2]>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Finished,
    Cancelled,
}

/// Panic payload used to abort a task at a suspension point.
pub(crate) struct TaskAbort;

type TaskCoroutine = Coroutine<ResumeSignal, YieldPoint, Outcome, StackHandle>;

thread_local! {
    static CURRENT_YIELDER: Cell<Option<NonNull<Yielder<ResumeSignal, YieldPoint>>>> =
        const { Cell::new(None) };
}

/// True while executing inside a suspendable task on this thread.
pub(crate) fn in_coroutine() -> bool {
    CURRENT_YIELDER.with(|y| y.get().is_some())
}

/// Cleared by the worker after every resume; the pointer only ever refers to
/// the coroutine currently executing on this thread.
pub(crate) fn clear_yielder() {
    CURRENT_YIELDER.with(|y| y.set(None));
}

/// Suspend the calling task. Must only be called from inside a coroutine.
pub(crate) fn suspend_current(yp: YieldPoint) -> ResumeSignal {
    let ptr = CURRENT_YIELDER
        .with(|y| y.get())
        .expect("suspension outside a task context");
    // Safety: the yielder belongs to the coroutine executing on this thread
    // and outlives every suspension of that coroutine.
    let sig = unsafe { ptr.as_ref() }.suspend(yp);
    // The slot may have been overwritten while we were suspended.
    CURRENT_YIELDER.with(|y| y.set(Some(ptr)));
    sig
}

/// Abort the calling task; caught at the coroutine boundary.
pub(crate) fn abort_current_task() -> ! {
    panic::panic_any(TaskAbort)
}

pub(crate) struct TaskContext {
    // Declared before `stack`: the coroutine must drop (and, if suspended,
    // unwind) while its stack is still mapped.
    co: Option<TaskCoroutine>,
    stack: Option<Box<PooledStack>>,
}

impl TaskContext {
    pub(crate) fn new(stack: Box<PooledStack>, task: Weak<Task>, body: TaskBody) -> Self {
        let handle = StackHandle::from(&*stack);
        let co = Coroutine::with_stack(handle, move |yielder, first: ResumeSignal| {
            CURRENT_YIELDER.with(|y| y.set(Some(NonNull::from(yielder))));
            task_entry(first, task, body)
        });
        Self {
            co: Some(co),
            stack: Some(stack),
        }
    }

    pub(crate) fn resume(&mut self, sig: ResumeSignal) -> CoroutineResult<YieldPoint, Outcome> {
        self.co
            .as_mut()
            .expect("resume of a reclaimed context")
            .resume(sig)
    }

    /// Tear down the coroutine and recover the stack for the pool.
    pub(crate) fn reclaim_stack(mut self) -> Box<PooledStack> {
        self.co.take();
        self.stack.take().expect("context already reclaimed")
    }
}

// Safety: the coroutine only captures the task body (`Send`), a `Weak<Task>`
// (`Send`) and its stack handle; the stack itself is an owned mapping. A
// suspended context is only ever resumed by one worker at a time, guarded by
// the task state machine.
unsafe impl Send for TaskContext {}

/// Body wrapper running inside the coroutine.
fn task_entry(first: ResumeSignal, task: Weak<Task>, body: TaskBody) -> Outcome {
    if matches!(first, ResumeSignal::Abort) {
        return Outcome::Cancelled;
    }

    match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(()) => {}
        Err(payload) => {
            if payload.downcast_ref::<TaskAbort>().is_none() {
                // A forced unwind or a user panic; either way the task did
                // not complete. Return without suspending again.
                tracing::error!("task body panicked, recording the task as cancelled");
            }
            return Outcome::Cancelled;
        }
    }

    // Implicit join: a task completes only once all children finished.
    loop {
        let Some(t) = task.upgrade() else { break };
        if t.num_children.load(Ordering::Acquire) == 0 {
            break;
        }
        if crate::sched::current::cancellation_requested() {
            break;
        }
        t.lock().state = TaskState::Suspended;
        drop(t);
        if matches!(
            suspend_current(YieldPoint::Yielded { delay: -1 }),
            ResumeSignal::Abort
        ) {
            return Outcome::Cancelled;
        }
    }

    Outcome::Finished
}

/// Free lists of task stacks, one per thread. A stack released anywhere goes
/// back to the list of the thread that mapped it, keeping it on that
/// thread's NUMA domain.
pub(crate) struct ContextPool {
    free: Vec<SegQueue<Box<PooledStack>>>,
    stack_size: usize,
}

impl ContextPool {
    pub(crate) fn new(num_threads: usize, stack_size: usize) -> Self {
        Self {
            free: (0..num_threads).map(|_| SegQueue::new()).collect(),
            stack_size,
        }
    }

    pub(crate) fn acquire(&self, thread_id: usize) -> Box<PooledStack> {
        if let Some(stack) = self.free[thread_id].pop() {
            return stack;
        }
        match PooledStack::new(self.stack_size, thread_id) {
            Ok(stack) => Box::new(stack),
            Err(e) => panic!("failed to map a task stack of {} bytes: {e}", self.stack_size),
        }
    }

    pub(crate) fn release(&self, stack: Box<PooledStack>) {
        if !stack.check_canary() {
            tracing::warn!(
                "possible task stack overflow detected; consider raising TASKMESH_TASKSTACKSIZE"
            );
        }
        let owner = stack.owner;
        if self.free[owner].len() < PER_THREAD_CTX_CACHE {
            self.free[owner].push(stack);
        }
    }

    /// Called by each worker on exit for its own list; the master sweeps the
    /// residual lists afterwards.
    pub(crate) fn drain(&self, thread_id: usize) {
        while self.free[thread_id].pop().is_some() {}
    }

    pub(crate) fn drain_all(&self) {
        for id in 0..self.free.len() {
            self.drain(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaskFlags, PRIO_DEFAULT};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn mk_task() -> Arc<Task> {
        let root = Task::new_root();
        Task::new(
            Box::new(|| {}),
            PRIO_DEFAULT,
            TaskFlags::empty(),
            0,
            root,
            "ctx",
            None,
        )
    }

    #[test]
    fn run_to_completion() {
        let pool = ContextPool::new(1, 1 << 16);
        let task = mk_task();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let mut ctx = TaskContext::new(
            pool.acquire(0),
            Arc::downgrade(&task),
            Box::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
            }),
        );
        match ctx.resume(ResumeSignal::Continue) {
            CoroutineResult::Return(Outcome::Finished) => {}
            _ => panic!("expected the task to finish"),
        }
        clear_yielder();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        pool.release(ctx.reclaim_stack());
    }

    #[test]
    fn suspend_and_resume() {
        let pool = ContextPool::new(1, 1 << 16);
        let task = mk_task();
        let mut ctx = TaskContext::new(
            pool.acquire(0),
            Arc::downgrade(&task),
            Box::new(|| {
                let sig = suspend_current(YieldPoint::Yielded { delay: 0 });
                assert_eq!(sig, ResumeSignal::Continue);
            }),
        );
        match ctx.resume(ResumeSignal::Continue) {
            CoroutineResult::Yield(YieldPoint::Yielded { delay: 0 }) => {}
            _ => panic!("expected a suspension"),
        }
        clear_yielder();
        match ctx.resume(ResumeSignal::Continue) {
            CoroutineResult::Return(Outcome::Finished) => {}
            _ => panic!("expected completion"),
        }
        clear_yielder();
        pool.release(ctx.reclaim_stack());
    }

    #[test]
    fn abort_at_suspension_point() {
        let pool = ContextPool::new(1, 1 << 16);
        let task = mk_task();
        let mut ctx = TaskContext::new(
            pool.acquire(0),
            Arc::downgrade(&task),
            Box::new(|| {
                if matches!(
                    suspend_current(YieldPoint::Yielded { delay: 0 }),
                    ResumeSignal::Abort
                ) {
                    abort_current_task();
                }
                unreachable!("abort must unwind the body");
            }),
        );
        assert!(matches!(
            ctx.resume(ResumeSignal::Continue),
            CoroutineResult::Yield(_)
        ));
        clear_yielder();
        match ctx.resume(ResumeSignal::Abort) {
            CoroutineResult::Return(Outcome::Cancelled) => {}
            _ => panic!("expected cancellation"),
        }
        clear_yielder();
        pool.release(ctx.reclaim_stack());
    }

    #[test]
    fn stacks_return_to_owner_list() {
        let pool = ContextPool::new(2, 1 << 16);
        let stack = pool.acquire(1);
        assert_eq!(stack.owner, 1);
        pool.release(stack);
        // Reacquiring on the owner thread reuses the cached stack.
        let again = pool.acquire(1);
        assert_eq!(again.owner, 1);
        pool.release(again);
        pool.drain_all();
    }
}
