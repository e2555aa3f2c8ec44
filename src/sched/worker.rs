//! Worker thread main loop.
//!
//! Workers spin on: cancellation check, task acquisition (own slots, last
//! victim, same-NUMA steal, shared queues, cross-NUMA steal), execution,
//! remote progress (thread 1 is the designated poller), and idle backoff
//! with a short grace period before the configured idle policy kicks in.

use crate::sched::{current, Scheduler, ThreadData};
use crate::util;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Grace period before an idle thread falls back to the idle policy.
const IDLE_GRACE: Duration = Duration::from_micros(1000);

/// Nap length while under grace, to reduce contention on the queues.
const GRACE_SLEEP: Duration = Duration::from_micros(100);

pub(crate) fn thread_main(sched: Arc<Scheduler>, td: Arc<ThreadData>) {
    if sched.cfg.bind_threads {
        util::pin_to_core(td.thread_id);
    }
    current::set_worker(sched.clone(), td.clone());
    current::swap_task(Some(sched.root.clone()));

    tracing::debug!(thread = td.thread_id, numa = td.numa_id, "worker starting");

    let mut idle_since: Option<Instant> = None;
    while sched.parallel() {
        sched.check_cancellation();

        let task = sched.next_task(&td);
        let found = task.is_some();
        sched.handle_task_internal(task, &td);

        if (!found || sched.worker_poll_remote()) && td.thread_id == 1 {
            // Designated poller for remote progress.
            sched.remote_progress(&td, !found);
        }

        if found {
            if let Some(since) = idle_since.take() {
                td.idle_us
                    .fetch_add(since.elapsed().as_micros() as u64, Ordering::Relaxed);
            }
        } else {
            match idle_since {
                None => idle_since = Some(Instant::now()),
                Some(since) if since.elapsed() > IDLE_GRACE => {
                    sched.idle.wait_for_work(sched.parallel_flag());
                    idle_since = Some(Instant::now());
                }
                Some(_) => {}
            }
            std::thread::sleep(GRACE_SLEEP);
        }
    }

    if let Some(since) = idle_since {
        td.idle_us
            .fetch_add(since.elapsed().as_micros() as u64, Ordering::Relaxed);
    }

    // Each worker frees its own contexts; the master sweeps the rest.
    sched.ctx_pool.drain(td.thread_id);
    current::clear_worker();
    tracing::debug!(thread = td.thread_id, "worker exiting");
}
