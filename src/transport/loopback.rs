//! In-process loopback transport.
//!
//! Backs the test suite: every "process" is a thread holding one endpoint of
//! a shared fabric. Get/put copy directly between registered segments,
//! tagged sends rendezvous with posted receives (or park in a mailbox), and
//! the collectives are generation-counted rendezvous points. One-sided
//! operations complete at the call; ordering between units is entirely the
//! runtime's job, exactly as on a real interconnect.

use crate::dep::{GlobalPtr, SegmentId, UnitId};
use crate::error::{Result, TaskError};
use crate::transport::{CountsExchange, Tag, TransferHandle, Transport};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::Arc;

struct Segment {
    ptr: NonNull<u8>,
    len: usize,
}

impl Segment {
    fn new(len: usize) -> Self {
        let layout = Layout::from_size_align(len.max(1), 16).expect("segment layout");
        // Safety: layout has non-zero size.
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).expect("segment allocation failed");
        Self { ptr, len }
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.len.max(1), 16).unwrap();
        // Safety: allocated with the same layout in `new`.
        unsafe { dealloc(self.ptr.as_ptr(), layout) };
    }
}

struct PostedRecv {
    from: Option<UnitId>,
    tag: Tag,
    dst: usize,
    cap: usize,
    handle: TransferHandle,
}

struct PendingMsg {
    from: UnitId,
    tag: Tag,
    data: Vec<u8>,
}

#[derive(Default)]
struct UnitState {
    segments: Mutex<FxHashMap<SegmentId, Segment>>,
    // Lock order: `posted` before `mailbox`; both sides of the rendezvous
    // hold `posted` across the whole matching step.
    posted: Mutex<Vec<PostedRecv>>,
    mailbox: Mutex<Vec<PendingMsg>>,
}

// Safety: segment memory and posted destinations are raw addresses whose
// validity is guaranteed by the callers of the unsafe transport methods;
// all shared bookkeeping is mutex-guarded.
unsafe impl Send for UnitState {}
unsafe impl Sync for UnitState {}

#[derive(Default)]
struct BarrierState {
    generation: u64,
    arrived: usize,
    waiters: Vec<TransferHandle>,
}

struct AlltoallState {
    rows: Vec<Option<Vec<i64>>>,
    outs: Vec<Option<CountsExchange>>,
    arrived: usize,
}

struct FabricShared {
    num_units: usize,
    units: Vec<UnitState>,
    barrier: Mutex<BarrierState>,
    alltoall: Mutex<AlltoallState>,
}

/// A set of loopback endpoints sharing one in-process fabric.
pub struct LoopbackFabric {
    shared: Arc<FabricShared>,
}

impl LoopbackFabric {
    pub fn new(num_units: usize) -> Self {
        assert!(num_units > 0);
        Self {
            shared: Arc::new(FabricShared {
                num_units,
                units: (0..num_units).map(|_| UnitState::default()).collect(),
                barrier: Mutex::new(BarrierState::default()),
                alltoall: Mutex::new(AlltoallState {
                    rows: vec![None; num_units],
                    outs: (0..num_units).map(|_| None).collect(),
                    arrived: 0,
                }),
            }),
        }
    }

    pub fn endpoint(&self, rank: usize) -> Arc<LoopbackTransport> {
        assert!(rank < self.shared.num_units);
        Arc::new(LoopbackTransport {
            rank: UnitId(rank as u32),
            shared: self.shared.clone(),
        })
    }

    pub fn endpoints(&self) -> Vec<Arc<LoopbackTransport>> {
        (0..self.shared.num_units).map(|r| self.endpoint(r)).collect()
    }
}

pub struct LoopbackTransport {
    rank: UnitId,
    shared: Arc<FabricShared>,
}

impl LoopbackTransport {
    fn unit(&self, unit: UnitId) -> Result<&UnitState> {
        self.shared
            .units
            .get(unit.0 as usize)
            .ok_or(TaskError::Inval("unknown unit"))
    }

    fn resolve(&self, ptr: GlobalPtr, len: usize) -> Result<NonNull<u8>> {
        if ptr.segment == SegmentId::LOCAL {
            return Err(TaskError::Inval(
                "raw local addresses carry no transferable memory",
            ));
        }
        let unit = self.unit(ptr.unit)?;
        let segments = unit.segments.lock();
        let seg = segments
            .get(&ptr.segment)
            .ok_or(TaskError::Inval("unknown segment"))?;
        let end = ptr
            .offset
            .checked_add(len as u64)
            .ok_or(TaskError::Inval("offset overflow"))?;
        if end > seg.len as u64 {
            return Err(TaskError::Inval("access beyond segment end"));
        }
        // Safety: offset is within the allocation checked above.
        Ok(unsafe { NonNull::new_unchecked(seg.ptr.as_ptr().add(ptr.offset as usize)) })
    }

    /// Register a zero-initialized segment on this endpoint's unit.
    pub fn register_segment(&self, segment: SegmentId, len: usize) {
        assert_ne!(segment, SegmentId::LOCAL, "LOCAL is reserved");
        let unit = &self.shared.units[self.rank.0 as usize];
        let prev = unit.segments.lock().insert(segment, Segment::new(len));
        assert!(prev.is_none(), "segment registered twice");
    }

    /// Test helper: write bytes into a locally owned segment.
    pub fn write_segment(&self, segment: SegmentId, offset: u64, data: &[u8]) {
        let dst = self
            .resolve(GlobalPtr::new(self.rank, segment, offset), data.len())
            .expect("write_segment out of bounds");
        // Safety: resolve() bounds-checked the range.
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), dst.as_ptr(), data.len()) };
    }

    /// Test helper: read bytes from a locally owned segment.
    pub fn read_segment(&self, segment: SegmentId, offset: u64, out: &mut [u8]) {
        let src = self
            .resolve(GlobalPtr::new(self.rank, segment, offset), out.len())
            .expect("read_segment out of bounds");
        // Safety: resolve() bounds-checked the range.
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), out.as_mut_ptr(), out.len()) };
    }
}

impl Transport for LoopbackTransport {
    fn rank(&self) -> UnitId {
        self.rank
    }

    fn num_units(&self) -> usize {
        self.shared.num_units
    }

    fn progress(&self) {}

    unsafe fn get_into(
        &self,
        src: GlobalPtr,
        dst: NonNull<u8>,
        len: usize,
    ) -> Result<TransferHandle> {
        let from = self.resolve(src, len)?;
        std::ptr::copy_nonoverlapping(from.as_ptr(), dst.as_ptr(), len);
        Ok(TransferHandle::completed())
    }

    unsafe fn put_from(
        &self,
        dst: GlobalPtr,
        src: NonNull<u8>,
        len: usize,
    ) -> Result<TransferHandle> {
        let to = self.resolve(dst, len)?;
        std::ptr::copy_nonoverlapping(src.as_ptr(), to.as_ptr(), len);
        Ok(TransferHandle::completed())
    }

    fn send(&self, to: UnitId, tag: Tag, data: &[u8]) -> Result<TransferHandle> {
        let target = self.unit(to)?;
        let mut posted = target.posted.lock();
        let matching = posted.iter().position(|r| {
            r.tag == tag && (r.from.is_none() || r.from == Some(self.rank))
        });
        if let Some(idx) = matching {
            if posted[idx].cap < data.len() {
                return Err(TaskError::Other(format!(
                    "message of {} bytes exceeds posted buffer of {} bytes",
                    data.len(),
                    posted[idx].cap
                )));
            }
            let recv = posted.remove(idx);
            // Safety: the poster guarantees dst validity until completion.
            unsafe {
                std::ptr::copy_nonoverlapping(data.as_ptr(), recv.dst as *mut u8, data.len())
            };
            recv.handle.complete(data.len(), self.rank);
        } else {
            target.mailbox.lock().push(PendingMsg {
                from: self.rank,
                tag,
                data: data.to_vec(),
            });
        }
        Ok(TransferHandle::completed())
    }

    unsafe fn recv_into(
        &self,
        from: Option<UnitId>,
        tag: Tag,
        dst: NonNull<u8>,
        cap: usize,
    ) -> Result<TransferHandle> {
        let me = self.unit(self.rank)?;
        let mut posted = me.posted.lock();
        let mut mailbox = me.mailbox.lock();
        let matching = mailbox.iter().position(|m| {
            m.tag == tag && (from.is_none() || from == Some(m.from))
        });
        if let Some(idx) = matching {
            let msg = mailbox.remove(idx);
            if msg.data.len() > cap {
                return Err(TaskError::Other(format!(
                    "message of {} bytes exceeds receive buffer of {} bytes",
                    msg.data.len(),
                    cap
                )));
            }
            std::ptr::copy_nonoverlapping(msg.data.as_ptr(), dst.as_ptr(), msg.data.len());
            let handle = TransferHandle::pending();
            handle.complete(msg.data.len(), msg.from);
            return Ok(handle);
        }
        let handle = TransferHandle::pending();
        posted.push(PostedRecv {
            from,
            tag,
            dst: dst.as_ptr() as usize,
            cap,
            handle: handle.clone(),
        });
        Ok(handle)
    }

    fn ibarrier(&self) -> Result<TransferHandle> {
        let mut state = self.shared.barrier.lock();
        let handle = TransferHandle::pending();
        state.waiters.push(handle.clone());
        state.arrived += 1;
        if state.arrived == self.shared.num_units {
            state.arrived = 0;
            state.generation += 1;
            for w in state.waiters.drain(..) {
                w.complete(0, self.rank);
            }
        }
        Ok(handle)
    }

    fn ialltoall_counts(&self, counts: &[i64]) -> Result<CountsExchange> {
        if counts.len() != self.shared.num_units {
            return Err(TaskError::Inval("count vector length mismatch"));
        }
        let mut state = self.shared.alltoall.lock();
        let me = self.rank.0 as usize;
        debug_assert!(state.rows[me].is_none(), "overlapping alltoall rounds");
        let ex = CountsExchange::new();
        state.rows[me] = Some(counts.to_vec());
        state.outs[me] = Some(ex.clone());
        state.arrived += 1;
        if state.arrived == self.shared.num_units {
            let n = self.shared.num_units;
            let rows: Vec<Vec<i64>> = state.rows.iter_mut().map(|r| r.take().unwrap()).collect();
            for (j, out) in state.outs.iter_mut().enumerate() {
                let result = (0..n).map(|i| rows[i][j]).collect();
                out.take().unwrap().fulfill(result);
            }
            state.arrived = 0;
        }
        Ok(ex)
    }

    fn local_base(&self, segment: SegmentId) -> Option<(NonNull<u8>, usize)> {
        let unit = &self.shared.units[self.rank.0 as usize];
        let segments = unit.segments.lock();
        segments.get(&segment).map(|s| (s.ptr, s.len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn get_copies_between_units() {
        let fabric = LoopbackFabric::new(2);
        let a = fabric.endpoint(0);
        let b = fabric.endpoint(1);
        a.register_segment(SegmentId(1), 64);
        a.write_segment(SegmentId(1), 0, b"hello");

        let mut buf = [0u8; 5];
        let src = GlobalPtr::new(UnitId(0), SegmentId(1), 0);
        let h = unsafe {
            b.get_into(src, NonNull::new(buf.as_mut_ptr()).unwrap(), 5)
                .unwrap()
        };
        assert!(h.is_complete());
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn send_matches_posted_recv_and_mailbox() {
        let fabric = LoopbackFabric::new(2);
        let a = fabric.endpoint(0);
        let b = fabric.endpoint(1);

        // Mailbox path: send first, then recv.
        a.send(UnitId(1), Tag(7), b"abc").unwrap();
        let mut buf = [0u8; 8];
        let h = unsafe {
            b.recv_into(None, Tag(7), NonNull::new(buf.as_mut_ptr()).unwrap(), 8)
                .unwrap()
        };
        assert!(h.is_complete());
        assert_eq!(h.completed_len(), 3);
        assert_eq!(h.source(), UnitId(0));
        assert_eq!(&buf[..3], b"abc");

        // Rendezvous path: recv first, then send.
        let mut buf2 = [0u8; 4];
        let h2 = unsafe {
            b.recv_into(
                Some(UnitId(0)),
                Tag(9),
                NonNull::new(buf2.as_mut_ptr()).unwrap(),
                4,
            )
            .unwrap()
        };
        assert!(!h2.is_complete());
        a.send(UnitId(1), Tag(9), b"wxyz").unwrap();
        assert!(h2.is_complete());
        assert_eq!(&buf2, b"wxyz");
    }

    #[test]
    fn oversized_message_fails_gracefully() {
        let fabric = LoopbackFabric::new(2);
        let a = fabric.endpoint(0);
        let b = fabric.endpoint(1);
        let mut buf = [0u8; 4];
        let _ = unsafe {
            b.recv_into(None, Tag(1), NonNull::new(buf.as_mut_ptr()).unwrap(), 4)
                .unwrap()
        };
        assert!(a.send(UnitId(1), Tag(1), &[0u8; 8]).is_err());
        // An exactly-sized payload still goes through.
        assert!(a.send(UnitId(1), Tag(1), &[1u8; 4]).is_ok());
    }

    #[test]
    fn barrier_and_alltoall_rendezvous() {
        let fabric = LoopbackFabric::new(3);
        let eps = fabric.endpoints();
        let handles: Vec<_> = eps
            .iter()
            .map(|ep| {
                let ep = ep.clone();
                thread::spawn(move || {
                    let h = ep.ibarrier().unwrap();
                    while !h.is_complete() {
                        std::hint::spin_loop();
                    }
                    let me = ep.rank().0 as i64;
                    let ex = ep.ialltoall_counts(&[me, me + 10, me + 20]).unwrap();
                    while !ex.is_complete() {
                        std::hint::spin_loop();
                    }
                    ex.take_result().unwrap()
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        // Unit j receives row entry j from every unit i: counts[i][j].
        assert_eq!(results[0], vec![0, 1, 2]);
        assert_eq!(results[1], vec![10, 11, 12]);
        assert_eq!(results[2], vec![20, 21, 22]);
    }
}
