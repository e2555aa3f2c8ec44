//! The dephash: per-address producer/consumer chains and their matching.
//!
//! Chains are kept in a sharded map keyed by the canonical global address;
//! shard locks act as the per-bucket locks. Registration appends records in
//! submission order, so scanning a chain back-to-front yields the most
//! recent producer first.
//!
//! Lock discipline: a chain shard lock may be taken first and task locks
//! under it, never the other way around. `deps_owned` is drained before
//! touching chains.

use crate::dep::{DepList, DepRecord, DepType, GlobalPtr, Phase, TaskDep, PHASE_ANY};
use crate::error::Result;
use crate::sched::Scheduler;
use crate::task::{Successor, Task, TaskId, TaskState};
use crate::dep::UnitId;
use dashmap::DashMap;
use parking_lot::Mutex;
use rustc_hash::FxBuildHasher;
use smallvec::SmallVec;
use std::sync::Arc;

type Chain = Vec<Arc<DepRecord>>;

/// A dependency request from a remote consumer that could not be satisfied
/// yet because the producing phase has not been matched.
pub(crate) struct RemoteRequest {
    pub key: GlobalPtr,
    pub phase: Phase,
    pub requester: UnitId,
    pub consumer: TaskId,
}

pub(crate) struct DepHash {
    chains: DashMap<GlobalPtr, Chain, FxBuildHasher>,
    deferred_remote: Mutex<Vec<RemoteRequest>>,
    /// Live dummy producers, with the key their placeholder record sits on.
    dummies: Mutex<Vec<(GlobalPtr, Arc<Task>)>>,
    my_rank: UnitId,
}

impl DepHash {
    pub(crate) fn new(my_rank: UnitId) -> Self {
        Self {
            chains: DashMap::with_hasher(FxBuildHasher::default()),
            deferred_remote: Mutex::new(Vec::new()),
            dummies: Mutex::new(Vec::new()),
            my_rank,
        }
    }

    fn resolve_phase(&self, sched: &Scheduler, task: &Task, dep: &TaskDep) -> Phase {
        match dep.phase {
            Some(p) => p,
            None if task.phase == PHASE_ANY => sched.phases.current(),
            None => task.phase,
        }
    }

    /// Register all declared dependencies of a freshly created task. The
    /// task is still `Nascent`, so concurrent releases cannot enqueue it
    /// before registration finished.
    pub(crate) fn register_task(
        &self,
        sched: &Arc<Scheduler>,
        task: &Arc<Task>,
        deps: DepList,
    ) -> Result<()> {
        // Copy-in dependencies need their communication task in the chain
        // before the consumer can link against it. Created first, outside
        // any chain lock: task creation recurses into registration.
        for dep in deps.iter().filter(|d| d.dep_type == DepType::Copyin) {
            let phase = self.resolve_phase(sched, task, dep);
            if !self.find_copyin_out(dep.ptr, phase) {
                sched.copyin.create_comm_task(sched, dep, phase)?;
            }
        }

        for dep in deps {
            self.register_dep(sched, task, dep);
        }
        Ok(())
    }

    fn register_dep(&self, sched: &Arc<Scheduler>, task: &Arc<Task>, dep: TaskDep) {
        let phase = self.resolve_phase(sched, task, &dep);

        if dep.dep_type == DepType::Direct {
            if let Some(pred) = dep.direct {
                add_local_edge(task, &pred);
            }
            return;
        }

        // Input dependencies on memory owned by another unit become remote
        // dependencies: the owner ships a completion notification. Copy-in
        // kinds always match locally against their communication task.
        let remote = dep.ptr.unit != self.my_rank
            && matches!(dep.dep_type, DepType::In | DepType::DelayedIn);
        if remote {
            task.unresolved_remote_deps
                .fetch_add(1, std::sync::atomic::Ordering::AcqRel);
            sched.remote.register_waiting(task);
            sched
                .remote
                .send_dep_request(dep.ptr.unit, dep.ptr, phase, task.id);
            return;
        }

        if dep.dep_type.is_input() {
            self.register_input(task, &dep, phase);
        } else {
            self.register_output(task, &dep, phase);
        }
    }

    fn register_input(&self, task: &Arc<Task>, dep: &TaskDep, phase: Phase) {
        let rec = {
            let mut chain = self.chains.entry(dep.ptr).or_default();

            let effective = match dep.dep_type {
                // A second copy-in of the same location and phase rides on
                // the first transfer.
                DepType::Copyin
                    if chain
                        .iter()
                        .any(|r| r.dep_type == DepType::Copyin && r.phase == phase) =>
                {
                    DepType::CopyinR
                }
                other => other,
            };

            let producer = match effective {
                DepType::Copyin | DepType::CopyinR => chain
                    .iter()
                    .rev()
                    .find(|r| r.dep_type == DepType::CopyinOut && r.phase == phase),
                _ => chain
                    .iter()
                    .rev()
                    .find(|r| r.dep_type.is_output() && r.phase <= phase),
            }
            .cloned();

            let rec = DepRecord::new(effective, dep.ptr, phase, task, dep.copyin.as_ref());
            if let Some(prod_rec) = producer {
                if let Some(ptask) = prod_rec.task.upgrade() {
                    if !Arc::ptr_eq(&ptask, task) {
                        add_local_edge(task, &ptask);
                    }
                }
                let _ = rec.producer.set(prod_rec);
            }
            chain.push(rec.clone());
            rec
        };
        task.deps_owned.lock().push(rec);
    }

    fn register_output(&self, task: &Arc<Task>, dep: &TaskDep, phase: Phase) {
        let rec = {
            let mut chain = self.chains.entry(dep.ptr).or_default();

            self.capture_dummy(&mut chain, task, phase);

            // Order the writer after every reader since the last producer
            // (write-after-read) and after that producer itself
            // (write-after-write / read-after-write for InOut).
            let mut preds: SmallVec<[Arc<Task>; 4]> = SmallVec::new();
            for r in chain.iter().rev() {
                let is_output = r.dep_type.is_output();
                if let Some(t) = r.task.upgrade() {
                    if !Arc::ptr_eq(&t, task) {
                        preds.push(t);
                    }
                }
                if is_output {
                    break;
                }
            }
            for pred in preds {
                add_local_edge(task, &pred);
            }

            let rec = DepRecord::new(dep.dep_type, dep.ptr, phase, task, dep.copyin.as_ref());
            chain.push(rec.clone());
            rec
        };
        task.deps_owned.lock().push(rec);
    }

    /// A freshly registered local producer takes over the remote successors
    /// parked on a dummy placeholder, retiring it.
    fn capture_dummy(&self, chain: &mut Chain, producer: &Arc<Task>, phase: Phase) {
        let idx = chain.iter().position(|r| {
            r.phase >= phase
                && matches!(
                    r.task.upgrade().map(|t| t.state()),
                    Some(TaskState::Dummy)
                )
        });
        let Some(idx) = idx else { return };
        let rec = chain.remove(idx);
        let Some(dummy) = rec.task.upgrade() else { return };
        tracing::trace!(dummy = %dummy.id, producer = %producer.id, "capturing dummy producer");
        let moved = {
            let mut dm = dummy.lock();
            dm.state = TaskState::Destroyed;
            std::mem::take(&mut dm.successors)
        };
        producer.lock().successors.extend(moved);
        self.dummies.lock().retain(|(_, d)| !Arc::ptr_eq(d, &dummy));
    }

    fn find_copyin_out(&self, key: GlobalPtr, phase: Phase) -> bool {
        self.chains.get(&key).is_some_and(|chain| {
            chain
                .iter()
                .any(|r| r.dep_type == DepType::CopyinOut && r.phase == phase)
        })
    }

    /// Incoming dependency request from a remote consumer.
    pub(crate) fn handle_remote_request(
        &self,
        sched: &Arc<Scheduler>,
        key: GlobalPtr,
        phase: Phase,
        requester: UnitId,
        consumer: TaskId,
    ) {
        if sched.phases.is_runnable(phase) {
            // The producing phase was already matched; every producer that
            // will ever exist for it is known, except for creation racing
            // within the current phase, which a dummy bridges.
            self.satisfy_remote_request(sched, key, phase, requester, consumer, true);
        } else {
            tracing::trace!(%key, phase, %requester, "deferring remote dependency request");
            self.deferred_remote.lock().push(RemoteRequest {
                key,
                phase,
                requester,
                consumer,
            });
        }
    }

    fn satisfy_remote_request(
        &self,
        sched: &Arc<Scheduler>,
        key: GlobalPtr,
        phase: Phase,
        requester: UnitId,
        consumer: TaskId,
        may_install_dummy: bool,
    ) {
        let producer: Option<Arc<Task>> = self.chains.get(&key).and_then(|chain| {
            chain
                .iter()
                .rev()
                .find(|r| r.dep_type.is_output() && r.phase <= phase)
                .and_then(|r| r.task.upgrade())
        });

        match producer {
            Some(p) => {
                let released = {
                    let mut pm = p.lock();
                    if pm.state.is_terminal() {
                        true
                    } else {
                        pm.successors.push(Successor::Remote {
                            unit: requester,
                            consumer,
                        });
                        false
                    }
                };
                if released {
                    sched.remote.send_release(requester, consumer);
                }
            }
            None if may_install_dummy => {
                let dummy = Task::new_dummy(phase, sched.root.clone());
                dummy.lock().successors.push(Successor::Remote {
                    unit: requester,
                    consumer,
                });
                let rec = DepRecord::new(DepType::Out, key, phase, &dummy, None);
                self.chains.entry(key).or_default().push(rec);
                self.dummies.lock().push((key, dummy));
                tracing::trace!(%key, phase, %requester, "installed dummy producer");
            }
            None => {
                // Matching concluded: no writer exists, the value is already
                // visible.
                sched.remote.send_release(requester, consumer);
            }
        }
    }

    /// Matching step: serve every deferred remote request up to `phase` and
    /// retire expired dummies.
    pub(crate) fn handle_deferred_remote(&self, sched: &Arc<Scheduler>, phase: Phase) {
        let ready: Vec<RemoteRequest> = {
            let mut deferred = self.deferred_remote.lock();
            let (ready, later): (Vec<_>, Vec<_>) =
                deferred.drain(..).partition(|r| r.phase <= phase);
            *deferred = later;
            ready
        };
        for req in ready {
            self.satisfy_remote_request(sched, req.key, req.phase, req.requester, req.consumer, false);
        }
        self.retire_dummies(sched, phase);
    }

    fn retire_dummies(&self, sched: &Arc<Scheduler>, phase: Phase) {
        let expired: Vec<(GlobalPtr, Arc<Task>)> = {
            let mut dummies = self.dummies.lock();
            let (expired, alive): (Vec<_>, Vec<_>) =
                dummies.drain(..).partition(|(_, d)| d.phase <= phase);
            *dummies = alive;
            expired
        };
        for (key, dummy) in expired {
            if let Some(mut chain) = self.chains.get_mut(&key) {
                chain.retain(|r| !std::ptr::eq(r.task.as_ptr(), Arc::as_ptr(&dummy)));
            }
            let successors = {
                let mut dm = dummy.lock();
                if dm.state != TaskState::Dummy {
                    continue;
                }
                dm.state = TaskState::Destroyed;
                std::mem::take(&mut dm.successors)
            };
            tracing::trace!(dummy = %dummy.id, "retiring uncaptured dummy");
            for s in successors {
                match s {
                    Successor::Remote { unit, consumer } => {
                        sched.remote.send_release(unit, consumer)
                    }
                    Successor::Local(t) => sched.release_one_local_dep(&t),
                }
            }
        }
    }

    /// Drop every chain record owned by `task`. Records still referenced as
    /// a consumer's producer link stay alive through that link.
    pub(crate) fn remove_task(&self, task: &Arc<Task>) {
        let records: SmallVec<[Arc<DepRecord>; 4]> =
            std::mem::take(&mut *task.deps_owned.lock());
        for rec in records {
            let mut remove_key = false;
            if let Some(mut chain) = self.chains.get_mut(&rec.key) {
                if let Some(idx) = chain.iter().position(|r| Arc::ptr_eq(r, &rec)) {
                    chain.remove(idx);
                }
                remove_key = chain.is_empty();
            }
            if remove_key {
                self.chains.remove_if(&rec.key, |_, chain| chain.is_empty());
            }
        }
    }

    pub(crate) fn pending_remote_requests(&self) -> usize {
        self.deferred_remote.lock().len()
    }
}

/// Install a predecessor edge unless the producer already reached a terminal
/// state. Checked and linked under the producer's lock so a concurrent
/// completion cannot lose the successor.
fn add_local_edge(consumer: &Arc<Task>, producer: &Arc<Task>) {
    let mut pm = producer.lock();
    if pm.state.is_terminal() {
        return;
    }
    consumer
        .unresolved_deps
        .fetch_add(1, std::sync::atomic::Ordering::AcqRel);
    pm.successors.push(Successor::Local(consumer.clone()));
    tracing::trace!(
        producer = %producer.id,
        consumer = %consumer.id,
        "installed local dependency edge"
    );
}
