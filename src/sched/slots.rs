//! Per-worker hot slots.
//!
//! A small fixed array of CAS pointer cells used as a zero-lock hand-off
//! from producers to the owning worker. The owner scans front-to-back,
//! stealers scan back-to-front. Slots hold a raw `Arc::into_raw` pointer;
//! every successful CAS transfers ownership of that reference.

use crate::task::Task;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

pub(crate) const THREAD_SLOTS: usize = 8;

pub(crate) struct HotSlots {
    slots: [AtomicPtr<Task>; THREAD_SLOTS],
}

impl HotSlots {
    pub(crate) fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| AtomicPtr::new(std::ptr::null_mut())),
        }
    }

    /// Try to park `task` in an empty slot; hands the task back when all
    /// slots are taken so the caller can fall through to the shared queue.
    pub(crate) fn push(&self, task: Arc<Task>) -> Result<(), Arc<Task>> {
        let raw = Arc::into_raw(task) as *mut Task;
        for slot in &self.slots {
            if slot
                .compare_exchange(
                    std::ptr::null_mut(),
                    raw,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                return Ok(());
            }
        }
        // Safety: `raw` came from `Arc::into_raw` above and was not stored.
        Err(unsafe { Arc::from_raw(raw) })
    }

    fn take_at(&self, idx: usize) -> Option<Arc<Task>> {
        let current = self.slots[idx].load(Ordering::Acquire);
        if current.is_null() {
            return None;
        }
        if self.slots[idx]
            .compare_exchange(
                current,
                std::ptr::null_mut(),
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
        {
            // Safety: the pointer was produced by `Arc::into_raw` in `push`
            // and the successful CAS makes us its unique consumer.
            return Some(unsafe { Arc::from_raw(current) });
        }
        None
    }

    /// Owner side: first occupied slot.
    pub(crate) fn take_front(&self) -> Option<Arc<Task>> {
        (0..THREAD_SLOTS).find_map(|i| self.take_at(i))
    }

    /// Stealer side: last occupied slot.
    pub(crate) fn take_back(&self) -> Option<Arc<Task>> {
        (0..THREAD_SLOTS).rev().find_map(|i| self.take_at(i))
    }
}

impl Drop for HotSlots {
    fn drop(&mut self) {
        while self.take_front().is_some() {}
    }
}

// Safety: slots only hold `Arc::into_raw` pointers whose ownership is
// transferred by CAS; `Task` itself is Send + Sync.
unsafe impl Send for HotSlots {}
unsafe impl Sync for HotSlots {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaskFlags, PRIO_DEFAULT};

    fn mk() -> Arc<Task> {
        let root = Task::new_root();
        Task::new(
            Box::new(|| {}),
            PRIO_DEFAULT,
            TaskFlags::empty(),
            0,
            root,
            "slot",
            None,
        )
    }

    #[test]
    fn push_take_roundtrip() {
        let slots = HotSlots::new();
        let task = mk();
        slots.push(task.clone()).unwrap();
        let got = slots.take_front().unwrap();
        assert!(Arc::ptr_eq(&got, &task));
        assert!(slots.take_front().is_none());
    }

    #[test]
    fn overflow_returns_task() {
        let slots = HotSlots::new();
        for _ in 0..THREAD_SLOTS {
            slots.push(mk()).unwrap();
        }
        let extra = mk();
        let back = slots.push(extra.clone()).unwrap_err();
        assert!(Arc::ptr_eq(&back, &extra));
    }

    #[test]
    fn stealer_takes_from_the_back() {
        let slots = HotSlots::new();
        let first = mk();
        let second = mk();
        slots.push(first.clone()).unwrap();
        slots.push(second.clone()).unwrap();
        assert!(Arc::ptr_eq(&slots.take_back().unwrap(), &second));
        assert!(Arc::ptr_eq(&slots.take_front().unwrap(), &first));
    }

    #[test]
    fn drop_releases_references() {
        let task = mk();
        {
            let slots = HotSlots::new();
            slots.push(task.clone()).unwrap();
        }
        // The slot's reference went away with the array.
        assert_eq!(Arc::strong_count(&task), 1);
    }
}
