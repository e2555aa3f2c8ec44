//! Remote-message engine.
//!
//! Glue between the dependency engine and the active-message queue: posts
//! dependency requests to producer units, ships release notifications back,
//! dispatches copy-in send requests, and tracks the local tasks that wait
//! for remote producers.

pub(crate) mod amsgq;
pub(crate) mod messages;

use crate::dep::{GlobalPtr, Phase, UnitId};
use crate::error::{Result, TaskError};
use crate::task::{Task, TaskId};
use crate::transport::Transport;
use amsgq::{AmsgQueue, MessageHandler};
use dashmap::DashMap;
use messages::RemoteMessage;
use rustc_hash::FxBuildHasher;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

pub(crate) struct RemoteEngine {
    transport: Arc<dyn Transport>,
    amsgq: Arc<AmsgQueue>,
    /// Local consumers with unresolved remote dependencies, found again when
    /// their release notification arrives.
    waiting: DashMap<TaskId, Weak<Task>, FxBuildHasher>,
    /// Tags for copy-in send/recv pairs; unique per requesting unit.
    tag_counter: AtomicU32,
}

impl RemoteEngine {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        msg_size: usize,
        msg_count: usize,
        direct_send: bool,
        sync_send: bool,
        handler: MessageHandler,
    ) -> Self {
        let amsgq = AmsgQueue::new(
            transport.clone(),
            msg_size,
            msg_count,
            direct_send,
            sync_send,
            handler,
        );
        Self {
            transport,
            amsgq,
            waiting: DashMap::with_hasher(FxBuildHasher::default()),
            tag_counter: AtomicU32::new(1),
        }
    }

    pub(crate) fn my_rank(&self) -> UnitId {
        self.transport.rank()
    }

    pub(crate) fn num_units(&self) -> usize {
        self.transport.num_units()
    }

    pub(crate) fn next_tag(&self) -> u32 {
        self.tag_counter.fetch_add(1, Ordering::Relaxed)
    }

    /// Nonblocking progress: transport tick plus one drain of the message
    /// ring. A busy processing mutex is not an error here.
    pub(crate) fn progress(&self) {
        if self.num_units() == 1 {
            return;
        }
        self.transport.progress();
        match self.amsgq.process() {
            Ok(()) | Err(TaskError::Again) => {}
            Err(e) => tracing::warn!(error = %e, "active message processing failed"),
        }
    }

    /// Collective blocking round, used by matching.
    pub(crate) fn progress_blocking(&self) -> Result<()> {
        if self.num_units() == 1 {
            return Ok(());
        }
        self.amsgq.process_blocking()
    }

    fn post(&self, target: UnitId, msg: &RemoteMessage) {
        let bytes = msg.encode();
        loop {
            match self.amsgq.trysend(target, &bytes) {
                Ok(()) => return,
                Err(TaskError::Again) => self.progress(),
                Err(e) => {
                    // No recovery path without fault tolerance; surface loudly.
                    panic!("failed to post remote message to {target}: {e}");
                }
            }
        }
    }

    pub(crate) fn send_dep_request(
        &self,
        owner: UnitId,
        key: GlobalPtr,
        phase: Phase,
        consumer: TaskId,
    ) {
        tracing::trace!(%owner, %key, phase, %consumer, "requesting remote dependency");
        self.post(
            owner,
            &RemoteMessage::RequestDep {
                key,
                phase,
                requester: self.my_rank(),
                consumer,
            },
        );
    }

    pub(crate) fn send_release(&self, unit: UnitId, consumer: TaskId) {
        tracing::trace!(%unit, %consumer, "releasing remote successor");
        self.post(unit, &RemoteMessage::ReleaseDep { consumer });
    }

    pub(crate) fn send_sendrequest(
        &self,
        owner: UnitId,
        src: GlobalPtr,
        size: usize,
        tag: u32,
        phase: Phase,
    ) {
        tracing::trace!(%owner, %src, size, tag, phase, "posting copy-in send request");
        self.post(
            owner,
            &RemoteMessage::SendRequest {
                src,
                size: size as u64,
                tag,
                phase,
                requester: self.my_rank(),
            },
        );
    }

    /// Track a consumer until all its remote dependencies resolved.
    pub(crate) fn register_waiting(&self, task: &Arc<Task>) {
        self.waiting.insert(task.id, Arc::downgrade(task));
    }

    pub(crate) fn find_waiting(&self, id: TaskId) -> Option<Arc<Task>> {
        self.waiting.get(&id).and_then(|w| w.upgrade())
    }

    pub(crate) fn forget_waiting(&self, id: TaskId) {
        self.waiting.remove(&id);
    }
}
