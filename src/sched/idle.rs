//! Idle-thread policy.
//!
//! Out of work and past the grace period, a worker either busy-polls,
//! naps for a configured duration, or parks on a condition variable until a
//! producer wakes it. The mutex guards only the sleep/wake handshake and is
//! never held across task work.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleMethod {
    Poll,
    Usleep,
    Wait,
}

pub(crate) struct IdleCoordinator {
    method: IdleMethod,
    sleep: Duration,
    lock: Mutex<()>,
    cond: Condvar,
}

impl IdleCoordinator {
    pub(crate) fn new(method: IdleMethod, sleep: Duration) -> Self {
        Self {
            method,
            sleep,
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    /// Park the calling worker according to the policy. `parallel` is
    /// re-checked under the lock so a shutdown wake cannot be missed.
    pub(crate) fn wait_for_work(&self, parallel: &AtomicBool) {
        match self.method {
            IdleMethod::Poll => {}
            IdleMethod::Usleep => std::thread::sleep(self.sleep),
            IdleMethod::Wait => {
                let mut guard = self.lock.lock();
                if parallel.load(Ordering::Acquire) {
                    self.cond.wait(&mut guard);
                }
            }
        }
    }

    pub(crate) fn wake_one(&self) {
        if self.method == IdleMethod::Wait {
            let _guard = self.lock.lock();
            self.cond.notify_one();
        }
    }

    pub(crate) fn wake_all(&self) {
        if self.method == IdleMethod::Wait {
            let _guard = self.lock.lock();
            self.cond.notify_all();
        }
    }
}
