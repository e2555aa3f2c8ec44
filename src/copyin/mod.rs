//! Copy-in engine.
//!
//! A `Copyin` dependency declares "make `size` bytes at global address `src`
//! available locally before this task runs". The engine turns that into a
//! high-priority communication task whose completion resolves the consumer's
//! dependency: either a one-sided get with an input dependency on the source
//! (`GET`), or a send-request to the owner, which creates a deferred send
//! task ordered behind the producer, paired with a tagged receive
//! (`SENDRECV`). Buffers come from a size-keyed pool unless the caller
//! provided a destination.

pub(crate) mod pool;

use crate::context::in_coroutine;
use crate::dep::{CopyinSpec, DepRecord, DepType, GlobalPtr, Phase, TaskDep, UnitId};
use crate::error::Result;
use crate::sched::{current, ops, wait, Scheduler};
use crate::task::{Task, TaskFlags, PRIO_COPYIN, PRIO_LOW};
use crate::transport::{Tag, TransferHandle};
use parking_lot::Mutex;
use pool::BufferPool;
use smallvec::{smallvec, SmallVec};
use std::ptr::NonNull;
use std::sync::Arc;

/// Copy-in tags share the transport tag space with nothing else.
const COPYIN_TAG_BASE: u32 = 0x4350_0000;

fn copyin_tag(tag: u32) -> Tag {
    Tag(COPYIN_TAG_BASE | (tag & 0x00FF_FFFF))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyinImpl {
    /// One-sided get guarded by an input dependency on the source.
    Get,
    /// Two-sided: a send request to the owner plus matching send/recv tasks.
    Sendrecv,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyinWait {
    /// Suspend the communication task until the handle completes.
    Block,
    /// Detach: the task completes when the handle does.
    Detach,
    /// Detach from an inline (non-yielding) communication task.
    DetachInline,
    /// Test-yield loop at lowered priority.
    Yield,
}

struct DelayedSend {
    src: GlobalPtr,
    size: usize,
    tag: u32,
    requester: UnitId,
    phase: Phase,
}

pub(crate) struct CopyinEngine {
    impl_kind: CopyinImpl,
    wait_kind: CopyinWait,
    pool: BufferPool,
    /// Send tasks requested by remote consumers, created at the next
    /// matching point so the producer exists.
    delayed: Mutex<Vec<DelayedSend>>,
}

impl CopyinEngine {
    pub(crate) fn new(impl_kind: CopyinImpl, wait_kind: CopyinWait) -> Self {
        Self {
            impl_kind,
            wait_kind,
            pool: BufferPool::new(),
            delayed: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn buffer_pool(&self) -> &BufferPool {
        &self.pool
    }

    fn comm_flags(&self) -> TaskFlags {
        let mut flags = TaskFlags::COMMTASK;
        if self.wait_kind == CopyinWait::DetachInline {
            flags |= TaskFlags::NOYIELD;
        }
        flags
    }

    /// Create the communication task backing a `Copyin` dependency of a
    /// consumer in `phase`.
    pub(crate) fn create_comm_task(
        &self,
        sched: &Arc<Scheduler>,
        dep: &TaskDep,
        phase: Phase,
    ) -> Result<()> {
        let spec = dep
            .copyin
            .expect("copy-in dependency without a transfer spec");
        match self.impl_kind {
            CopyinImpl::Get => self.create_get_task(sched, dep.ptr, spec, phase),
            CopyinImpl::Sendrecv => self.create_recv_task(sched, dep.ptr, spec, phase),
        }
    }

    fn copyin_out_deps(
        me: UnitId,
        ptr: GlobalPtr,
        spec: CopyinSpec,
        phase: Phase,
    ) -> SmallVec<[TaskDep; 4]> {
        let mut deps: SmallVec<[TaskDep; 4]> = smallvec![TaskDep {
            dep_type: DepType::CopyinOut,
            ptr,
            phase: Some(phase),
            copyin: Some(spec),
            direct: None,
        }];
        // An explicit destination also acts as a local output so later
        // readers of that buffer order behind the transfer.
        if let Some(dest) = spec.dest {
            deps.push(TaskDep {
                dep_type: DepType::Out,
                ptr: GlobalPtr::local_addr(me, dest.as_ptr() as usize),
                phase: Some(phase),
                copyin: None,
                direct: None,
            });
        }
        deps
    }

    fn create_get_task(
        &self,
        sched: &Arc<Scheduler>,
        src: GlobalPtr,
        spec: CopyinSpec,
        phase: Phase,
    ) -> Result<()> {
        let mut deps = Self::copyin_out_deps(sched.remote.my_rank(), src, spec, phase);
        deps.insert(
            0,
            TaskDep {
                dep_type: DepType::In,
                ptr: src,
                phase: Some(phase),
                copyin: None,
                direct: None,
            },
        );

        let size = spec.size;
        tracing::trace!(%src, size, phase, "creating copy-in get task");
        sched.spawn_internal(
            Box::new(move || copyin_get_body(src, size)),
            PRIO_COPYIN,
            self.comm_flags(),
            deps,
            "copyin (get)",
        )
    }

    fn create_recv_task(
        &self,
        sched: &Arc<Scheduler>,
        src: GlobalPtr,
        spec: CopyinSpec,
        phase: Phase,
    ) -> Result<()> {
        let me = sched.remote.my_rank();
        let (local_src, owner, tag) = if src.unit == me {
            (Some(src), me, 0)
        } else {
            let tag = sched.remote.next_tag();
            sched
                .remote
                .send_sendrequest(src.unit, src, spec.size, tag, phase);
            (None, src.unit, tag)
        };

        let deps = Self::copyin_out_deps(me, src, spec, phase);
        let size = spec.size;
        tracing::trace!(%src, size, tag, phase, "creating copy-in recv task");
        sched.spawn_internal(
            Box::new(move || copyin_recv_body(local_src, owner, tag, size)),
            PRIO_COPYIN,
            self.comm_flags(),
            deps,
            "copyin (recv)",
        )
    }

    /// Owner side of `SENDRECV`: remember the request; the send task is
    /// created at the next matching point with a delayed input dependency on
    /// the source, so it orders behind the producer.
    pub(crate) fn enqueue_delayed_send(
        &self,
        src: GlobalPtr,
        size: usize,
        tag: u32,
        requester: UnitId,
        phase: Phase,
    ) {
        tracing::trace!(%src, size, tag, %requester, phase, "deferring copy-in send task");
        self.delayed.lock().push(DelayedSend {
            src,
            size,
            tag,
            requester,
            phase,
        });
    }

    pub(crate) fn create_delayed_tasks(&self, sched: &Arc<Scheduler>) {
        let drained: Vec<DelayedSend> = std::mem::take(&mut *self.delayed.lock());
        for d in drained {
            let deps: SmallVec<[TaskDep; 4]> = smallvec![TaskDep {
                dep_type: DepType::DelayedIn,
                ptr: d.src,
                phase: Some(d.phase),
                copyin: None,
                direct: None,
            }];
            let (src, size, tag, requester) = (d.src, d.size, d.tag, d.requester);
            if let Err(e) = sched.spawn_internal(
                Box::new(move || copyin_send_body(src, size, tag, requester)),
                PRIO_COPYIN,
                self.comm_flags(),
                deps,
                "copyin (send)",
            ) {
                tracing::warn!(error = %e, "failed to create deferred copy-in send task");
            }
        }
    }

    fn wait_for_handle(&self, sched: &Arc<Scheduler>, handle: TransferHandle) {
        match self.wait_kind {
            CopyinWait::Block => wait::block_on_handles(smallvec![handle]),
            CopyinWait::Detach | CopyinWait::DetachInline => {
                wait::detach_on_handles(smallvec![handle])
            }
            CopyinWait::Yield => {
                // Lower the priority so computation overlaps the transfer.
                let task = current::task();
                if let Some(t) = &task {
                    t.set_prio(PRIO_LOW);
                }
                while !handle.is_complete() {
                    sched.transport.progress();
                    if in_coroutine() {
                        let _ = ops::yield_now(-1);
                    }
                }
                if let Some(t) = &task {
                    t.set_prio(PRIO_COPYIN);
                }
            }
        }
    }
}

/// Locate the task's `CopyinOut` record and make sure it has a destination,
/// allocating from the pool when the caller did not provide one.
fn prepare_dep(task: &Arc<Task>, sched: &Arc<Scheduler>) -> Arc<DepRecord> {
    let rec = task
        .deps_owned
        .lock()
        .iter()
        .find(|r| r.dep_type == DepType::CopyinOut)
        .cloned()
        .expect("copy-in task without a CopyinOut dependency");
    let info = rec
        .copyin
        .as_ref()
        .expect("CopyinOut record without transfer info");
    if info.dest.is_none() && info.buffer.get().is_none() {
        let buf = sched.copyin.buffer_pool().acquire(info.size);
        let _ = info.buffer.set(buf);
    }
    rec
}

fn comm_context() -> Option<(Arc<Scheduler>, Arc<Task>)> {
    let sched = current::scheduler()?;
    let task = current::task()?;
    Some((sched, task))
}

fn copyin_get_body(src: GlobalPtr, size: usize) {
    let Some((sched, task)) = comm_context() else { return };
    let rec = prepare_dep(&task, &sched);
    let dst = rec
        .copyin_local_ptr()
        .expect("copy-in transfer without a destination");
    tracing::trace!(%src, size, "posting copy-in get");
    // Safety: the destination is the pooled buffer (kept alive by the
    // dependency record) or the caller's buffer (valid per API contract).
    match unsafe { sched.transport.get_into(src, dst, size) } {
        Ok(handle) => sched.copyin.wait_for_handle(&sched, handle),
        Err(e) => tracing::error!(%src, size, error = %e, "copy-in get failed"),
    }
}

fn copyin_recv_body(local_src: Option<GlobalPtr>, owner: UnitId, tag: u32, size: usize) {
    let Some((sched, task)) = comm_context() else { return };
    let rec = prepare_dep(&task, &sched);
    let dst = rec
        .copyin_local_ptr()
        .expect("copy-in transfer without a destination");

    if let Some(src) = local_src {
        // Same-unit prefetch degenerates to a local copy.
        tracing::trace!(%src, size, "local copy-in");
        // Safety: as above; source resolution is bounds-checked.
        if let Err(e) = unsafe { sched.transport.get_into(src, dst, size) } {
            tracing::error!(%src, size, error = %e, "local copy-in failed");
        }
        return;
    }

    tracing::trace!(%owner, tag, size, "posting copy-in recv");
    // Safety: destination validity as above.
    match unsafe {
        sched
            .transport
            .recv_into(Some(owner), copyin_tag(tag), dst, size)
    } {
        Ok(handle) => sched.copyin.wait_for_handle(&sched, handle),
        Err(e) => tracing::error!(%owner, tag, error = %e, "copy-in recv failed"),
    }
}

fn copyin_send_body(src: GlobalPtr, size: usize, tag: u32, requester: UnitId) {
    let Some((sched, _task)) = comm_context() else { return };
    let Some((base, seg_len)) = sched.transport.local_base(src.segment) else {
        tracing::error!(%src, "copy-in send task on unknown segment");
        return;
    };
    let end = src.offset as usize + size;
    if end > seg_len {
        tracing::error!(%src, size, "copy-in send beyond segment end");
        return;
    }
    tracing::trace!(%requester, tag, size, "posting copy-in send");
    // Safety: the range was bounds-checked against the registered segment.
    let data = unsafe { std::slice::from_raw_parts(base.as_ptr().add(src.offset as usize), size) };
    match sched.transport.send(requester, copyin_tag(tag), data) {
        Ok(handle) => sched.copyin.wait_for_handle(&sched, handle),
        Err(e) => tracing::error!(%requester, tag, error = %e, "copy-in send failed"),
    }
}

/// Local address of the calling task's `n`-th copy-in dependency.
pub(crate) fn copyin_ptr(task: &Arc<Task>, n: usize) -> Option<NonNull<u8>> {
    let deps = task.deps_owned.lock();
    let rec = deps
        .iter()
        .filter(|r| matches!(r.dep_type, DepType::Copyin | DepType::CopyinR))
        .nth(n)?;
    let producer = rec.producer.get()?;
    if producer.dep_type == DepType::CopyinOut {
        producer.copyin_local_ptr()
    } else {
        // The data already lives at the address named by the producer's
        // output dependency.
        NonNull::new(producer.key.offset as *mut u8)
    }
}
