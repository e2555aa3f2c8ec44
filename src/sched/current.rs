//! Thread-local scheduling context.
//!
//! Every participating thread (the master and all workers) carries a
//! reference to the scheduler, its own thread data and the task it is
//! currently executing. Task bodies reach the runtime through these
//! accessors instead of ambient globals.

use crate::sched::{Scheduler, ThreadData};
use crate::task::Task;
use std::cell::RefCell;
use std::sync::Arc;

#[derive(Clone)]
pub(crate) struct WorkerCtx {
    pub sched: Arc<Scheduler>,
    pub td: Arc<ThreadData>,
}

thread_local! {
    static WORKER: RefCell<Option<WorkerCtx>> = const { RefCell::new(None) };
    static CURRENT_TASK: RefCell<Option<Arc<Task>>> = const { RefCell::new(None) };
}

pub(crate) fn set_worker(sched: Arc<Scheduler>, td: Arc<ThreadData>) {
    WORKER.with(|w| *w.borrow_mut() = Some(WorkerCtx { sched, td }));
}

pub(crate) fn clear_worker() {
    WORKER.with(|w| *w.borrow_mut() = None);
    CURRENT_TASK.with(|t| *t.borrow_mut() = None);
}

pub(crate) fn worker() -> Option<WorkerCtx> {
    WORKER.with(|w| w.borrow().clone())
}

pub(crate) fn scheduler() -> Option<Arc<Scheduler>> {
    WORKER.with(|w| w.borrow().as_ref().map(|c| c.sched.clone()))
}

pub(crate) fn thread_data() -> Option<Arc<ThreadData>> {
    WORKER.with(|w| w.borrow().as_ref().map(|c| c.td.clone()))
}

pub(crate) fn swap_task(task: Option<Arc<Task>>) -> Option<Arc<Task>> {
    CURRENT_TASK.with(|t| std::mem::replace(&mut *t.borrow_mut(), task))
}

pub(crate) fn task() -> Option<Arc<Task>> {
    CURRENT_TASK.with(|t| t.borrow().clone())
}

pub(crate) fn cancellation_requested() -> bool {
    scheduler().is_some_and(|s| s.cancellation_requested())
}
