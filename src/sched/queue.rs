//! Shared task queues.
//!
//! A `TaskQueue` is a pair of mutex-guarded deques, one per priority band.
//! `pop` drains the high band before the low band. The owning worker pushes
//! and pops at the head (LIFO locality); stealers take from the tail (FIFO).

use crate::task::{prio_is_high, Task};
use parking_lot::{Mutex, MutexGuard};
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Default)]
pub(crate) struct QueueInner {
    high: VecDeque<Arc<Task>>,
    low: VecDeque<Arc<Task>>,
}

impl QueueInner {
    fn deque_for(&mut self, task: &Task) -> &mut VecDeque<Arc<Task>> {
        if prio_is_high(task.prio()) {
            &mut self.high
        } else {
            &mut self.low
        }
    }

    pub(crate) fn push(&mut self, task: Arc<Task>) {
        self.deque_for(&task).push_front(task);
    }

    pub(crate) fn pushback(&mut self, task: Arc<Task>) {
        self.deque_for(&task).push_back(task);
    }

    pub(crate) fn insert(&mut self, task: Arc<Task>, pos: usize) {
        let deque = self.deque_for(&task);
        let pos = pos.min(deque.len());
        deque.insert(pos, task);
    }

    pub(crate) fn pop(&mut self) -> Option<Arc<Task>> {
        self.high.pop_front().or_else(|| self.low.pop_front())
    }

    pub(crate) fn popback(&mut self) -> Option<Arc<Task>> {
        self.high.pop_back().or_else(|| self.low.pop_back())
    }

    pub(crate) fn remove(&mut self, task: &Arc<Task>) -> bool {
        for deque in [&mut self.high, &mut self.low] {
            if let Some(idx) = deque.iter().position(|t| Arc::ptr_eq(t, task)) {
                deque.remove(idx);
                return true;
            }
        }
        false
    }

    pub(crate) fn drain(&mut self) -> Vec<Arc<Task>> {
        self.high.drain(..).chain(self.low.drain(..)).collect()
    }
}

pub(crate) struct TaskQueue {
    inner: Mutex<QueueInner>,
}

impl TaskQueue {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
        }
    }

    /// Lock the queue for a compound operation (deferral needs the phase
    /// check and the enqueue to be atomic).
    pub(crate) fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock()
    }

    pub(crate) fn push(&self, task: Arc<Task>) {
        self.inner.lock().push(task);
    }

    pub(crate) fn pushback(&self, task: Arc<Task>) {
        self.inner.lock().pushback(task);
    }

    pub(crate) fn insert(&self, task: Arc<Task>, pos: usize) {
        self.inner.lock().insert(task, pos);
    }

    pub(crate) fn pop(&self) -> Option<Arc<Task>> {
        self.inner.lock().pop()
    }

    pub(crate) fn popback(&self) -> Option<Arc<Task>> {
        self.inner.lock().popback()
    }

    /// Unlink a queued task, e.g. when it is claimed through another path.
    #[allow(dead_code)]
    pub(crate) fn remove(&self, task: &Arc<Task>) -> bool {
        self.inner.lock().remove(task)
    }

    pub(crate) fn drain(&self) -> Vec<Arc<Task>> {
        self.inner.lock().drain()
    }

    /// Splice the whole content of `src` onto the front of `self`.
    /// Locks destination first, then source.
    #[allow(dead_code)]
    pub(crate) fn move_from(&self, src: &TaskQueue) {
        let mut dst = self.inner.lock();
        let mut src = src.inner.lock();
        let mut high = std::mem::take(&mut src.high);
        high.append(&mut dst.high);
        dst.high = high;
        let mut low = std::mem::take(&mut src.low);
        low.append(&mut dst.low);
        dst.low = low;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaskFlags, PRIO_DEFAULT, PRIO_HIGH, PRIO_LOW};

    fn mk(prio: u8) -> Arc<Task> {
        let root = Task::new_root();
        Task::new(
            Box::new(|| {}),
            prio,
            TaskFlags::empty(),
            0,
            root,
            "q",
            None,
        )
    }

    #[test]
    fn high_band_drains_first() {
        let q = TaskQueue::new();
        let lo = mk(PRIO_LOW);
        let hi = mk(PRIO_HIGH);
        q.push(lo.clone());
        q.push(hi.clone());
        assert!(Arc::ptr_eq(&q.pop().unwrap(), &hi));
        assert!(Arc::ptr_eq(&q.pop().unwrap(), &lo));
        assert!(q.pop().is_none());
    }

    #[test]
    fn owner_lifo_stealer_fifo() {
        let q = TaskQueue::new();
        let a = mk(PRIO_DEFAULT);
        let b = mk(PRIO_DEFAULT);
        q.push(a.clone());
        q.push(b.clone());
        // Owner sees the most recent push first.
        assert!(Arc::ptr_eq(&q.pop().unwrap(), &b));
        // A stealer takes the oldest entry.
        q.push(a.clone());
        q.push(b.clone());
        assert!(Arc::ptr_eq(&q.popback().unwrap(), &a));
    }

    #[test]
    fn insert_at_position() {
        let q = TaskQueue::new();
        let a = mk(PRIO_DEFAULT);
        let b = mk(PRIO_DEFAULT);
        let c = mk(PRIO_DEFAULT);
        q.pushback(a.clone());
        q.pushback(b.clone());
        q.insert(c.clone(), 1);
        assert!(Arc::ptr_eq(&q.pop().unwrap(), &a));
        assert!(Arc::ptr_eq(&q.pop().unwrap(), &c));
        assert!(Arc::ptr_eq(&q.pop().unwrap(), &b));
    }

    #[test]
    fn remove_and_move() {
        let q = TaskQueue::new();
        let other = TaskQueue::new();
        let a = mk(PRIO_DEFAULT);
        let b = mk(PRIO_DEFAULT);
        q.pushback(a.clone());
        other.pushback(b.clone());
        assert!(q.remove(&a));
        assert!(!q.remove(&a));
        q.pushback(a.clone());
        q.move_from(&other);
        // Spliced content sits in front of the existing content.
        assert!(Arc::ptr_eq(&q.pop().unwrap(), &b));
        assert!(Arc::ptr_eq(&q.pop().unwrap(), &a));
    }
}
