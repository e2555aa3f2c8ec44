//! Runtime configuration.
//!
//! Defaults come from the environment (`TASKMESH_*`); builder setters win.

use crate::copyin::{CopyinImpl, CopyinWait};
use crate::context::stack::DEFAULT_TASK_STACK_SIZE;
use crate::error::Result;
use crate::remote::amsgq::{DEFAULT_MSG_COUNT, DEFAULT_MSG_SIZE};
use crate::runtime::Runtime;
use crate::sched::idle::IdleMethod;
use crate::transport::Transport;
use crate::util::{self, env};
use std::sync::Arc;
use std::time::Duration;

/// Default idle nap when `THREAD_IDLE=USLEEP` carries no duration.
const IDLE_DEFAULT_USLEEP_US: u64 = 1000;

#[derive(Debug, Clone)]
pub(crate) struct RuntimeConfig {
    pub num_threads: usize,
    pub bind_threads: bool,
    pub respect_numa: bool,
    pub num_numa_nodes: usize,
    pub idle_method: IdleMethod,
    pub idle_sleep: Duration,
    pub task_stack_size: usize,
    pub copyin_impl: CopyinImpl,
    pub copyin_wait: CopyinWait,
    pub amsgq_direct: bool,
    pub amsgq_sync: bool,
    pub msg_size: usize,
    pub msg_count: usize,
}

#[derive(Debug, Default)]
pub struct Builder {
    worker_threads: Option<usize>,
    bind_threads: Option<bool>,
    respect_numa: Option<bool>,
    idle_method: Option<IdleMethod>,
    idle_sleep: Option<Duration>,
    task_stack_size: Option<usize>,
    copyin_impl: Option<CopyinImpl>,
    copyin_wait: Option<CopyinWait>,
    amsgq_direct: Option<bool>,
    amsgq_sync: Option<bool>,
    msg_size: Option<usize>,
    msg_count: Option<usize>,
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of worker threads, master included. Defaults to
    /// `TASKMESH_NUMTHREADS` or the hardware parallelism.
    pub fn worker_threads(mut self, n: usize) -> Self {
        assert!(n > 0, "worker threads cannot be set to 0");
        self.worker_threads = Some(n);
        self
    }

    /// Pin worker threads to cores.
    pub fn bind_threads(mut self, yes: bool) -> Self {
        self.bind_threads = Some(yes);
        self
    }

    /// Respect NUMA placement when enqueueing and stealing.
    pub fn respect_numa(mut self, yes: bool) -> Self {
        self.respect_numa = Some(yes);
        self
    }

    pub fn idle_method(mut self, method: IdleMethod) -> Self {
        self.idle_method = Some(method);
        self
    }

    pub fn idle_sleep(mut self, sleep: Duration) -> Self {
        self.idle_sleep = Some(sleep);
        self
    }

    /// Per-task stack size in bytes, rounded up to the page size.
    pub fn task_stack_size(mut self, bytes: usize) -> Self {
        self.task_stack_size = Some(bytes);
        self
    }

    pub fn copyin_impl(mut self, impl_kind: CopyinImpl) -> Self {
        self.copyin_impl = Some(impl_kind);
        self
    }

    pub fn copyin_wait(mut self, wait: CopyinWait) -> Self {
        self.copyin_wait = Some(wait);
        self
    }

    /// Bypass asynchronous send buffering in the message queue.
    pub fn amsgq_direct(mut self, yes: bool) -> Self {
        self.amsgq_direct = Some(yes);
        self
    }

    /// Use synchronous send semantics in the message queue.
    pub fn amsgq_sync(mut self, yes: bool) -> Self {
        self.amsgq_sync = Some(yes);
        self
    }

    pub fn message_size(mut self, bytes: usize) -> Self {
        self.msg_size = Some(bytes);
        self
    }

    pub fn message_count(mut self, count: usize) -> Self {
        self.msg_count = Some(count);
        self
    }

    fn resolve(self) -> RuntimeConfig {
        let num_threads = self
            .worker_threads
            .or_else(|| env::number("NUMTHREADS"))
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or_else(|_| {
                        tracing::warn!("failed to query core count, using 2 threads");
                        2
                    })
            })
            .max(1);

        let bind_threads = self
            .bind_threads
            .or_else(|| env::boolean("THREAD_AFFINITY"))
            .unwrap_or(false);

        let respect_numa = self
            .respect_numa
            .or_else(|| env::boolean("THREAD_PLACE_NUMA"))
            .unwrap_or(false);
        let num_numa_nodes = if respect_numa {
            util::num_numa_nodes().min(num_threads.max(1))
        } else {
            1
        };

        let idle_method = self
            .idle_method
            .or_else(|| {
                env::str2enum(
                    "THREAD_IDLE",
                    &[
                        ("POLL", IdleMethod::Poll),
                        ("USLEEP", IdleMethod::Usleep),
                        ("WAIT", IdleMethod::Wait),
                    ],
                )
            })
            .unwrap_or(IdleMethod::Usleep);

        let idle_sleep = self.idle_sleep.unwrap_or_else(|| {
            Duration::from_micros(
                env::micros("THREAD_IDLE_SLEEP").unwrap_or(IDLE_DEFAULT_USLEEP_US),
            )
        });

        let task_stack_size = util::round_to_page(
            self.task_stack_size
                .or_else(|| env::size("TASKSTACKSIZE"))
                .unwrap_or(DEFAULT_TASK_STACK_SIZE),
        );

        let copyin_impl = self
            .copyin_impl
            .or_else(|| {
                env::str2enum(
                    "COPYIN_IMPL",
                    &[("GET", CopyinImpl::Get), ("SENDRECV", CopyinImpl::Sendrecv)],
                )
            })
            .unwrap_or(CopyinImpl::Get);

        let copyin_wait = self
            .copyin_wait
            .or_else(|| {
                env::str2enum(
                    "COPYIN_WAIT",
                    &[
                        ("BLOCK", CopyinWait::Block),
                        ("DETACH", CopyinWait::Detach),
                        ("DETACH_INLINE", CopyinWait::DetachInline),
                        ("YIELD", CopyinWait::Yield),
                        ("TESTYIELD", CopyinWait::Yield),
                    ],
                )
            })
            .unwrap_or(CopyinWait::DetachInline);

        let amsgq_sync = self
            .amsgq_sync
            .or_else(|| env::boolean("AMSGQ_SENDRECV_SYNC"))
            .unwrap_or(true);
        let amsgq_direct = self
            .amsgq_direct
            .or_else(|| env::boolean("AMSGQ_SENDRECV_DIRECT"))
            .unwrap_or(!amsgq_sync);

        RuntimeConfig {
            num_threads,
            bind_threads,
            respect_numa,
            num_numa_nodes,
            idle_method,
            idle_sleep,
            task_stack_size,
            copyin_impl,
            copyin_wait,
            amsgq_direct,
            amsgq_sync,
            msg_size: self.msg_size.unwrap_or(DEFAULT_MSG_SIZE),
            msg_count: self.msg_count.unwrap_or(DEFAULT_MSG_COUNT),
        }
    }

    pub fn build(self, transport: Arc<dyn Transport>) -> Result<Runtime> {
        let cfg = self.resolve();
        tracing::info!(
            threads = cfg.num_threads,
            numa_nodes = cfg.num_numa_nodes,
            stack = cfg.task_stack_size,
            "building runtime"
        );
        Runtime::from_config(cfg, transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let cfg = Builder::new()
            .worker_threads(3)
            .idle_method(IdleMethod::Poll)
            .task_stack_size(1)
            .copyin_impl(CopyinImpl::Sendrecv)
            .resolve();
        assert_eq!(cfg.num_threads, 3);
        assert_eq!(cfg.idle_method, IdleMethod::Poll);
        // Rounded up to a full page.
        assert_eq!(cfg.task_stack_size, crate::util::page_size());
        assert_eq!(cfg.copyin_impl, CopyinImpl::Sendrecv);
        assert!(cfg.amsgq_sync);
        assert!(!cfg.amsgq_direct);
    }
}
