//! Transport contract.
//!
//! The runtime consumes exactly these primitives from the one-sided
//! messaging layer: nonblocking get/put with a handle, tagged send/recv,
//! nonblocking barrier and all-to-all count exchange, a progress tick and
//! team membership. Everything else (connection setup, memory registration)
//! belongs to the implementation behind the trait.

pub mod loopback;

use crate::dep::{GlobalPtr, SegmentId, UnitId};
use crate::error::Result;
use parking_lot::Mutex;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

/// Message tag for point-to-point sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tag(pub u32);

#[derive(Debug, Default)]
struct HandleState {
    done: AtomicBool,
    len: AtomicUsize,
    source: AtomicU32,
}

/// Completion handle for a nonblocking transport operation.
///
/// Cloning shares the completion state; for receives the completing side
/// records the payload length and source unit.
#[derive(Debug, Clone)]
pub struct TransferHandle {
    state: Arc<HandleState>,
}

impl TransferHandle {
    pub fn pending() -> Self {
        Self {
            state: Arc::new(HandleState::default()),
        }
    }

    pub fn completed() -> Self {
        let h = Self::pending();
        h.state.done.store(true, Ordering::Release);
        h
    }

    pub fn complete(&self, len: usize, source: UnitId) {
        self.state.len.store(len, Ordering::Release);
        self.state.source.store(source.0, Ordering::Release);
        self.state.done.store(true, Ordering::Release);
    }

    pub fn is_complete(&self) -> bool {
        self.state.done.load(Ordering::Acquire)
    }

    pub fn completed_len(&self) -> usize {
        self.state.len.load(Ordering::Acquire)
    }

    pub fn source(&self) -> UnitId {
        UnitId(self.state.source.load(Ordering::Acquire))
    }
}

/// Result slot of a nonblocking all-to-all count exchange.
#[derive(Debug, Clone)]
pub struct CountsExchange {
    handle: TransferHandle,
    result: Arc<Mutex<Option<Vec<i64>>>>,
}

impl CountsExchange {
    pub fn new() -> Self {
        Self {
            handle: TransferHandle::pending(),
            result: Arc::new(Mutex::new(None)),
        }
    }

    pub fn fulfill(&self, counts: Vec<i64>) {
        *self.result.lock() = Some(counts);
        self.handle.complete(0, UnitId(0));
    }

    pub fn is_complete(&self) -> bool {
        self.handle.is_complete()
    }

    pub fn take_result(&self) -> Option<Vec<i64>> {
        self.result.lock().take()
    }
}

impl Default for CountsExchange {
    fn default() -> Self {
        Self::new()
    }
}

pub trait Transport: Send + Sync + 'static {
    fn rank(&self) -> UnitId;

    fn num_units(&self) -> usize;

    /// Nonblocking progress tick. Called periodically by workers.
    fn progress(&self);

    /// One-sided read of `len` bytes at `src` into `dst`.
    ///
    /// # Safety
    /// `dst` must stay valid and unaliased until the handle completes.
    unsafe fn get_into(&self, src: GlobalPtr, dst: NonNull<u8>, len: usize)
        -> Result<TransferHandle>;

    /// One-sided write of `len` bytes from `src` to `dst`.
    ///
    /// # Safety
    /// `src` must stay valid until the handle completes.
    unsafe fn put_from(&self, dst: GlobalPtr, src: NonNull<u8>, len: usize)
        -> Result<TransferHandle>;

    /// Buffered tagged send; the data is captured at the call.
    fn send(&self, to: UnitId, tag: Tag, data: &[u8]) -> Result<TransferHandle>;

    /// Post a tagged receive into `dst` (capacity `cap`). `from = None`
    /// accepts any source. Completion records length and source.
    ///
    /// # Safety
    /// `dst` must stay valid and unaliased until the handle completes.
    unsafe fn recv_into(
        &self,
        from: Option<UnitId>,
        tag: Tag,
        dst: NonNull<u8>,
        cap: usize,
    ) -> Result<TransferHandle>;

    /// Nonblocking barrier across all units.
    fn ibarrier(&self) -> Result<TransferHandle>;

    /// Nonblocking all-to-all exchange of per-peer counts. Entry `i` of the
    /// result is what unit `i` sent to the caller.
    fn ialltoall_counts(&self, counts: &[i64]) -> Result<CountsExchange>;

    /// Base address and length of a locally owned segment, if the transport
    /// exposes local segment memory.
    fn local_base(&self, segment: SegmentId) -> Option<(NonNull<u8>, usize)>;
}
