//! Phase bookkeeping.
//!
//! The submitter advances the phase counter; matching declares phases
//! runnable. Tasks of a not-yet-runnable phase sit in the deferred queue.
//! Each phase carries a count of its tasks so statistics and matching can
//! conclude it.

use crate::dep::{Phase, PHASE_ANY, PHASE_FIRST};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicI32, Ordering};

pub(crate) struct PhaseManager {
    current: AtomicI32,
    runnable: AtomicI32,
    counts: Mutex<FxHashMap<Phase, usize>>,
    num_units: usize,
}

impl PhaseManager {
    pub(crate) fn new(num_units: usize) -> Self {
        Self {
            current: AtomicI32::new(PHASE_FIRST),
            runnable: AtomicI32::new(PHASE_FIRST),
            counts: Mutex::new(FxHashMap::default()),
            num_units,
        }
    }

    pub(crate) fn current(&self) -> Phase {
        self.current.load(Ordering::Acquire)
    }

    pub(crate) fn advance(&self) -> Phase {
        self.current.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// With a single unit there is no matching and every phase is runnable.
    pub(crate) fn is_runnable(&self, phase: Phase) -> bool {
        self.num_units == 1 || phase == PHASE_ANY || phase <= self.runnable.load(Ordering::Acquire)
    }

    pub(crate) fn set_runnable(&self, phase: Phase) {
        self.runnable.store(phase, Ordering::Release);
    }

    pub(crate) fn add_task(&self, phase: Phase) {
        *self.counts.lock().entry(phase).or_insert(0) += 1;
    }

    pub(crate) fn take_task(&self, phase: Phase) {
        let mut counts = self.counts.lock();
        if let Some(n) = counts.get_mut(&phase) {
            *n -= 1;
            if *n == 0 {
                counts.remove(&phase);
            }
        }
    }

    pub(crate) fn tasks_in_flight(&self) -> usize {
        self.counts.lock().values().sum()
    }

    /// Reset after a completed root epoch. Externally referenced tasks may
    /// still hold their phase slot until the reference is released.
    pub(crate) fn reset(&self) {
        self.current.store(PHASE_FIRST, Ordering::Release);
        self.runnable.store(PHASE_FIRST, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_unit_is_always_runnable() {
        let p = PhaseManager::new(1);
        assert!(p.is_runnable(17));
    }

    #[test]
    fn multi_unit_gates_on_watermark() {
        let p = PhaseManager::new(2);
        assert!(p.is_runnable(PHASE_FIRST));
        assert!(!p.is_runnable(1));
        assert!(p.is_runnable(PHASE_ANY));
        p.set_runnable(3);
        assert!(p.is_runnable(3));
        assert!(!p.is_runnable(4));
    }

    #[test]
    fn counts_balance() {
        let p = PhaseManager::new(2);
        p.add_task(0);
        p.add_task(0);
        p.add_task(1);
        assert_eq!(p.tasks_in_flight(), 3);
        p.take_task(0);
        p.take_task(0);
        p.take_task(1);
        assert_eq!(p.tasks_in_flight(), 0);
    }
}
