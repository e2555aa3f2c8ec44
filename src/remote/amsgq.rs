//! Active-message queue.
//!
//! A fixed ring of pre-posted receives of a declared size, a bounded set of
//! tracked asynchronous sends, nonblocking draining of completed receives,
//! and a blocking round protocol used by matching: flush outgoing sends,
//! then either a barrier (synchronous-send mode) or an all-to-all exchange
//! of per-round send counts that lets every unit drain exactly the messages
//! of the round, followed by a final barrier closing it.

use crate::dep::UnitId;
use crate::error::{Result, TaskError};
use crate::transport::{Tag, TransferHandle, Transport};
use parking_lot::{Mutex, MutexGuard};
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::Arc;

/// Tag shared by all active messages of a runtime.
const AMSG_TAG: Tag = Tag(0xA3A0);

pub(crate) const DEFAULT_MSG_SIZE: usize = 512;
pub(crate) const DEFAULT_MSG_COUNT: usize = 64;

pub(crate) type MessageHandler = Box<dyn Fn(&[u8]) + Send + Sync>;

struct RecvBuf {
    ptr: NonNull<u8>,
    len: usize,
}

impl RecvBuf {
    fn new(len: usize) -> Self {
        let layout = Layout::from_size_align(len.max(1), 8).unwrap();
        // Safety: non-zero size.
        let raw = unsafe { alloc_zeroed(layout) };
        Self {
            ptr: NonNull::new(raw).expect("receive buffer allocation failed"),
            len,
        }
    }
}

impl Drop for RecvBuf {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.len.max(1), 8).unwrap();
        // Safety: allocated in `new` with the same layout.
        unsafe { dealloc(self.ptr.as_ptr(), layout) };
    }
}

// Safety: the buffer is only written by the transport between posting and
// completion and only read by the processing side afterwards; the
// processing mutex serializes all access.
unsafe impl Send for RecvBuf {}
unsafe impl Sync for RecvBuf {}

struct RecvSlot {
    buf: RecvBuf,
    handle: Mutex<TransferHandle>,
}

struct SendState {
    inflight: Vec<TransferHandle>,
    /// Per-peer messages sent since the last round (asynchronous mode).
    send_count: Vec<i64>,
}

struct RecvCounts {
    /// Per-peer messages received since the last round (asynchronous mode).
    recv_count: Vec<i64>,
}

pub(crate) struct AmsgQueue {
    transport: Arc<dyn Transport>,
    msg_size: usize,
    msg_count: usize,
    direct_send: bool,
    sync_send: bool,
    recv_slots: Vec<RecvSlot>,
    send_state: Mutex<SendState>,
    processing: Mutex<RecvCounts>,
    handler: MessageHandler,
}

impl AmsgQueue {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        msg_size: usize,
        msg_count: usize,
        direct_send: bool,
        sync_send: bool,
        handler: MessageHandler,
    ) -> Arc<Self> {
        let num_units = transport.num_units();
        let queue = Arc::new(Self {
            recv_slots: (0..msg_count)
                .map(|_| RecvSlot {
                    buf: RecvBuf::new(msg_size),
                    handle: Mutex::new(TransferHandle::completed()),
                })
                .collect(),
            send_state: Mutex::new(SendState {
                inflight: Vec::new(),
                send_count: vec![0; num_units],
            }),
            processing: Mutex::new(RecvCounts {
                recv_count: vec![0; num_units],
            }),
            transport,
            msg_size,
            msg_count,
            direct_send,
            sync_send,
            handler,
        });

        // Pre-post the whole receive ring.
        for slot in &queue.recv_slots {
            // Safety: the slot buffer lives as long as the queue and is only
            // touched by the processing side after completion.
            let handle = unsafe {
                queue
                    .transport
                    .recv_into(None, AMSG_TAG, slot.buf.ptr, queue.msg_size)
            }
            .expect("failed to pre-post a receive");
            *slot.handle.lock() = handle;
        }
        queue
    }

    /// Post one active message. `Again` means the send window is full or the
    /// transport refused transiently; the caller retries after progress.
    pub(crate) fn trysend(&self, target: UnitId, data: &[u8]) -> Result<()> {
        if data.len() > self.msg_size {
            return Err(TaskError::Inval("message exceeds the pre-posted buffer size"));
        }

        let mut state = self.send_state.lock();
        if !self.direct_send {
            if state.inflight.len() >= self.msg_count {
                state.inflight.retain(|h| !h.is_complete());
                if state.inflight.len() >= self.msg_count {
                    return Err(TaskError::Again);
                }
            }
        }

        let handle = self.transport.send(target, AMSG_TAG, data).map_err(|e| {
            tracing::warn!(peer = %target, error = %e, "active message send failed");
            TaskError::Again
        })?;

        if !self.direct_send {
            state.inflight.push(handle);
        }
        if !self.sync_send {
            state.send_count[target.0 as usize] += 1;
        }
        Ok(())
    }

    /// One sweep over the receive ring: dispatch everything completed and
    /// repost the buffers.
    fn drain_ready(&self, counts: &mut RecvCounts) -> usize {
        let mut num_msg = 0;
        for slot in &self.recv_slots {
            let mut handle = slot.handle.lock();
            if !handle.is_complete() {
                continue;
            }
            let len = handle.completed_len();
            let source = handle.source();
            debug_assert!(len <= self.msg_size);
            if !self.sync_send {
                counts.recv_count[source.0 as usize] += 1;
            }
            // Safety: the transport completed the receive; the buffer holds
            // `len` initialized bytes and no receive is outstanding on it.
            let payload = unsafe { std::slice::from_raw_parts(slot.buf.ptr.as_ptr(), len) };
            (self.handler)(payload);
            // Safety: same slot buffer, reposted after processing.
            *handle = unsafe {
                self.transport
                    .recv_into(None, AMSG_TAG, slot.buf.ptr, self.msg_size)
            }
            .expect("failed to repost a receive");
            num_msg += 1;
        }
        num_msg
    }

    /// Nonblocking progress. `Again` when another thread is processing.
    pub(crate) fn process(&self) -> Result<()> {
        let Some(mut counts) = self.processing.try_lock() else {
            return Err(TaskError::Again);
        };
        self.drain_ready(&mut counts);
        Ok(())
    }

    fn all_sends_complete(&self) -> bool {
        if self.direct_send {
            return true;
        }
        let mut state = self.send_state.lock();
        state.inflight.retain(|h| !h.is_complete());
        state.inflight.is_empty()
    }

    fn round_complete(recv_round: &[i64], counts: &RecvCounts) -> bool {
        recv_round
            .iter()
            .zip(&counts.recv_count)
            .all(|(round, got)| round - got <= 0)
    }

    /// Collective blocking round. Every unit must call this at the same
    /// matching point.
    pub(crate) fn process_blocking(&self) -> Result<()> {
        let mut counts = self.processing.lock();

        // Snapshot this round's send counts; messages posted from here on
        // belong to the next round.
        let send_round: Vec<i64> = if self.sync_send {
            Vec::new()
        } else {
            let mut state = self.send_state.lock();
            let round = state.send_count.clone();
            state.send_count.iter_mut().for_each(|c| *c = 0);
            round
        };

        let mut send_flag = false;
        let mut barrier = None;
        let mut exchange = None;
        loop {
            while self.drain_ready(&mut counts) > 0 {}

            let collective_done = match (&barrier, &exchange) {
                (Some(h), _) => TransferHandle::is_complete(h),
                (_, Some(x)) => crate::transport::CountsExchange::is_complete(x),
                _ => false,
            };

            if !send_flag && self.all_sends_complete() {
                send_flag = true;
                if self.sync_send {
                    barrier = Some(self.transport.ibarrier()?);
                } else {
                    exchange = Some(self.transport.ialltoall_counts(&send_round)?);
                }
            }

            if send_flag && collective_done {
                break;
            }
            self.transport.progress();
            std::hint::spin_loop();
        }

        // Drain the stragglers of this round, then balance the counters.
        if !self.sync_send {
            let recv_round = exchange
                .and_then(|x| x.take_result())
                .expect("count exchange completed without a result");
            while !Self::round_complete(&recv_round, &counts) {
                self.drain_ready(&mut counts);
                self.transport.progress();
            }
            for (got, round) in counts.recv_count.iter_mut().zip(&recv_round) {
                *got -= round;
            }
        }

        // Close the round; nothing sent afterwards can be mistaken for it.
        let closing = self.transport.ibarrier()?;
        while !closing.is_complete() {
            self.drain_ready(&mut counts);
            self.transport.progress();
        }
        Ok(())
    }

    /// Per-peer recv/send counters must be balanced at the end of a round.
    #[cfg(test)]
    pub(crate) fn assert_drained(&self) {
        if self.sync_send {
            return;
        }
        let counts: MutexGuard<'_, RecvCounts> = self.processing.lock();
        let state = self.send_state.lock();
        for (unit, (&sent, &got)) in state.send_count.iter().zip(&counts.recv_count).enumerate() {
            debug_assert_eq!(sent, 0, "unaccounted sends to unit {unit}");
            debug_assert_eq!(got, 0, "unaccounted receives from unit {unit}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::loopback::LoopbackFabric;
    use parking_lot::Mutex as PlMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn pair(sync_send: bool) -> (Arc<AmsgQueue>, Arc<AmsgQueue>, Arc<PlMutex<Vec<Vec<u8>>>>) {
        let fabric = LoopbackFabric::new(2);
        let got = Arc::new(PlMutex::new(Vec::new()));
        let sink = got.clone();
        let q0 = AmsgQueue::new(
            fabric.endpoint(0),
            64,
            4,
            false,
            sync_send,
            Box::new(|_| {}),
        );
        let q1 = AmsgQueue::new(
            fabric.endpoint(1),
            64,
            4,
            false,
            sync_send,
            Box::new(move |bytes| sink.lock().push(bytes.to_vec())),
        );
        (q0, q1, got)
    }

    #[test]
    fn send_and_drain() {
        let (q0, q1, got) = pair(true);
        q0.trysend(UnitId(1), b"ping").unwrap();
        q1.process().unwrap();
        assert_eq!(got.lock().as_slice(), &[b"ping".to_vec()]);
        // The buffer was reposted: a second message arrives too.
        q0.trysend(UnitId(1), b"pong").unwrap();
        q1.process().unwrap();
        assert_eq!(got.lock().len(), 2);
    }

    #[test]
    fn oversized_message_is_rejected() {
        let (q0, _q1, _) = pair(true);
        let exact = vec![7u8; 64];
        assert!(q0.trysend(UnitId(1), &exact).is_ok());
        let too_big = vec![7u8; 65];
        assert!(matches!(
            q0.trysend(UnitId(1), &too_big),
            Err(TaskError::Inval(_))
        ));
    }

    #[test]
    fn blocking_round_counts_balance() {
        let fabric = LoopbackFabric::new(2);
        let seen = Arc::new(AtomicUsize::new(0));
        let queues: Vec<Arc<AmsgQueue>> = (0..2)
            .map(|r| {
                let seen = seen.clone();
                AmsgQueue::new(
                    fabric.endpoint(r),
                    64,
                    4,
                    false,
                    false,
                    Box::new(move |_| {
                        seen.fetch_add(1, Ordering::SeqCst);
                    }),
                )
            })
            .collect();

        let handles: Vec<_> = queues
            .into_iter()
            .enumerate()
            .map(|(rank, q)| {
                thread::spawn(move || {
                    let peer = UnitId(1 - rank as u32);
                    for _ in 0..3 {
                        while matches!(q.trysend(peer, b"msg"), Err(TaskError::Again)) {
                            let _ = q.process();
                        }
                    }
                    q.process_blocking().unwrap();
                    q.assert_drained();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        // Every unit received all three messages within the round.
        assert_eq!(seen.load(Ordering::SeqCst), 6);
    }
}
