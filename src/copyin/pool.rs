//! Size-keyed buffer pools for copy-in transfers.
//!
//! One free list per distinct transfer size. Every allocation carries a
//! magic word in a small header; a corrupt header on release points at a
//! task writing before the start of its prefetch buffer.

use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use std::alloc::{alloc, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::Arc;

const MEMPOOL_MAGIC: u64 = 0xC0FF_EE00_AB5E_1CED;

/// Header in front of every pooled allocation; keeps the payload 16-aligned.
const HEADER: usize = 16;

fn layout_for(size: usize) -> Layout {
    Layout::from_size_align(HEADER + size, 16).expect("copy-in buffer layout")
}

struct RawBuf(NonNull<u8>);

// Safety: a raw buffer is exclusively owned by whoever popped it.
unsafe impl Send for RawBuf {}

pub(crate) struct SizeClass {
    size: usize,
    free: SegQueue<RawBuf>,
}

impl Drop for SizeClass {
    fn drop(&mut self) {
        while let Some(RawBuf(raw)) = self.free.pop() {
            // Safety: allocated in `BufferPool::acquire` with this layout.
            unsafe { dealloc(raw.as_ptr(), layout_for(self.size)) };
        }
    }
}

pub(crate) struct BufferPool {
    classes: Mutex<Vec<Arc<SizeClass>>>,
}

impl BufferPool {
    pub(crate) fn new() -> Self {
        Self {
            classes: Mutex::new(Vec::new()),
        }
    }

    fn class_for(&self, size: usize) -> Arc<SizeClass> {
        let mut classes = self.classes.lock();
        if let Some(class) = classes.iter().find(|c| c.size == size) {
            return class.clone();
        }
        let class = Arc::new(SizeClass {
            size,
            free: SegQueue::new(),
        });
        classes.push(class.clone());
        class
    }

    pub(crate) fn acquire(&self, size: usize) -> CopyinBuffer {
        let class = self.class_for(size);
        let raw = match class.free.pop() {
            Some(RawBuf(raw)) => raw,
            None => {
                // Safety: layout has non-zero size.
                let raw = unsafe { alloc(layout_for(size)) };
                let raw = NonNull::new(raw).expect("copy-in buffer allocation failed");
                // Safety: the header is the first word of the allocation.
                unsafe { raw.as_ptr().cast::<u64>().write(MEMPOOL_MAGIC) };
                raw
            }
        };
        CopyinBuffer { raw, class }
    }

    /// Free buffers currently pooled for `size` (test support).
    #[cfg(test)]
    pub(crate) fn pooled(&self, size: usize) -> usize {
        self.classes
            .lock()
            .iter()
            .find(|c| c.size == size)
            .map_or(0, |c| c.free.len())
    }
}

/// A pooled prefetch buffer. Dropping it returns the memory to its size
/// class after validating the header magic.
pub(crate) struct CopyinBuffer {
    raw: NonNull<u8>,
    class: Arc<SizeClass>,
}

impl CopyinBuffer {
    pub(crate) fn ptr(&self) -> NonNull<u8> {
        // Safety: payload begins right after the header.
        unsafe { NonNull::new_unchecked(self.raw.as_ptr().add(HEADER)) }
    }

    #[cfg(test)]
    pub(crate) fn size(&self) -> usize {
        self.class.size
    }
}

impl Drop for CopyinBuffer {
    fn drop(&mut self) {
        // Safety: the header was written when the buffer was allocated.
        let magic = unsafe { self.raw.as_ptr().cast::<u64>().read() };
        if magic != MEMPOOL_MAGIC {
            tracing::warn!(
                size = self.class.size,
                "corrupt copy-in buffer header detected, dropping the buffer"
            );
            return;
        }
        self.class.free.push(RawBuf(self.raw));
    }
}

// Safety: the payload is uniquely written by the communication task and only
// read by consumers ordered after it; the allocation itself has no interior
// state.
unsafe impl Send for CopyinBuffer {}
unsafe impl Sync for CopyinBuffer {}

impl std::fmt::Debug for CopyinBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CopyinBuffer")
            .field("size", &self.class.size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_return_to_their_size_class() {
        let pool = BufferPool::new();
        let buf = pool.acquire(256);
        assert_eq!(buf.size(), 256);
        assert_eq!(pool.pooled(256), 0);
        drop(buf);
        assert_eq!(pool.pooled(256), 1);
        // Reacquire reuses the pooled allocation.
        let again = pool.acquire(256);
        assert_eq!(pool.pooled(256), 0);
        drop(again);
    }

    #[test]
    fn distinct_sizes_use_distinct_classes() {
        let pool = BufferPool::new();
        let a = pool.acquire(64);
        let b = pool.acquire(128);
        drop(a);
        drop(b);
        assert_eq!(pool.pooled(64), 1);
        assert_eq!(pool.pooled(128), 1);
    }

    #[test]
    fn corrupted_header_is_not_repooled() {
        let pool = BufferPool::new();
        let buf = pool.acquire(32);
        // Write before the payload start, into the header.
        unsafe { buf.ptr().as_ptr().sub(HEADER).cast::<u64>().write(0) };
        drop(buf);
        assert_eq!(pool.pooled(32), 0);
    }

    #[test]
    fn payload_is_usable() {
        let pool = BufferPool::new();
        let buf = pool.acquire(16);
        unsafe {
            std::ptr::write_bytes(buf.ptr().as_ptr(), 0x5A, 16);
            assert_eq!(buf.ptr().as_ptr().add(15).read(), 0x5A);
        }
    }
}
