//! Task stacks.
//!
//! Each stack is an anonymous mapping with an inaccessible guard page below
//! and above the usable region. The usable window is unprotected after the
//! reservation, so an overflow runs into `PROT_NONE` memory instead of a
//! neighboring allocation. Debug builds additionally keep a canary word at
//! the deep end of the usable region, checked when the stack returns to its
//! owner's free list.

use crate::util::{page_size, round_to_page};
use corosensei::stack::{Stack, StackPointer};
use nix::sys::mman::{mmap_anonymous, mprotect, munmap, MapFlags, ProtFlags};
use std::ffi::c_void;
use std::io;
use std::num::NonZeroUsize;
use std::ptr::NonNull;

/// Default 2 MiB of usable stack per task.
pub(crate) const DEFAULT_TASK_STACK_SIZE: usize = 1 << 21;

#[cfg(debug_assertions)]
const CANARY: u64 = 0xDEAD_BEEF_DEAD_BEEF;

pub(crate) struct PooledStack {
    map: NonNull<c_void>,
    map_len: usize,
    usable: usize,
    page: usize,
    /// Thread that mapped the stack; it returns to this thread's free list.
    pub(crate) owner: usize,
}

impl PooledStack {
    pub(crate) fn new(stack_size: usize, owner: usize) -> io::Result<Self> {
        let page = page_size();
        let usable = round_to_page(stack_size.max(page));
        let map_len = usable + 2 * page;

        // Reserve everything inaccessible, then open the usable window. The
        // pages at both ends stay PROT_NONE as guards.
        let map = unsafe {
            mmap_anonymous(
                None,
                NonZeroUsize::new(map_len).unwrap(),
                ProtFlags::PROT_NONE,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_STACK,
            )
        }
        .map_err(io::Error::from)?;

        let usable_start =
            unsafe { NonNull::new_unchecked(map.as_ptr().cast::<u8>().add(page).cast()) };
        if let Err(e) = unsafe {
            mprotect(
                usable_start,
                usable,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            )
        } {
            let _ = unsafe { munmap(map, map_len) };
            return Err(io::Error::from(e));
        }

        let stack = Self {
            map,
            map_len,
            usable,
            page,
            owner,
        };

        #[cfg(debug_assertions)]
        // Safety: the canary slot is the first word of the usable window.
        unsafe {
            (stack.limit_addr() as *mut u64).write(CANARY);
        }

        Ok(stack)
    }

    fn limit_addr(&self) -> usize {
        self.map.as_ptr() as usize + self.page
    }

    fn base_addr(&self) -> usize {
        self.limit_addr() + self.usable
    }

    /// False if the deep-end canary was clobbered. Guard pages catch most
    /// overflows with a fault; the canary catches sparse writes that skip
    /// the guard.
    pub(crate) fn check_canary(&self) -> bool {
        #[cfg(debug_assertions)]
        // Safety: the slot was written in `new` and stays mapped.
        unsafe {
            if (self.limit_addr() as *const u64).read() != CANARY {
                return false;
            }
        }
        true
    }

    #[cfg(all(test, debug_assertions))]
    fn clobber_canary(&self) {
        unsafe { (self.limit_addr() as *mut u64).write(0) };
    }
}

impl Drop for PooledStack {
    fn drop(&mut self) {
        // Safety: mapping created in `new` with this length.
        if let Err(e) = unsafe { munmap(self.map, self.map_len) } {
            tracing::warn!(error = %e, "failed to unmap task stack");
        }
    }
}

// Safety: the stack is a raw private mapping without interior references;
// ownership moves between threads through the context pool.
unsafe impl Send for PooledStack {}
unsafe impl Sync for PooledStack {}

/// Cheap stack descriptor handed to the coroutine. The backing
/// [`PooledStack`] is owned by the task context and outlives the coroutine.
#[derive(Clone, Copy)]
pub(crate) struct StackHandle {
    base: StackPointer,
    limit: StackPointer,
}

impl From<&PooledStack> for StackHandle {
    fn from(stack: &PooledStack) -> Self {
        Self {
            base: StackPointer::new(stack.base_addr()).unwrap(),
            limit: StackPointer::new(stack.limit_addr()).unwrap(),
        }
    }
}

// Safety: `base` is the highest usable address (page aligned, which
// satisfies the platform stack alignment), `limit` the lowest; the range is
// mapped read/write for the lifetime of the owning context.
unsafe impl Stack for StackHandle {
    fn base(&self) -> StackPointer {
        self.base
    }

    fn limit(&self) -> StackPointer {
        self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_and_aligns() {
        let page = page_size();
        let stack = PooledStack::new(1000, 0).unwrap();
        assert_eq!(stack.usable, page);
        assert_eq!(stack.base_addr() % page, 0);
        assert!(stack.check_canary());
    }

    #[test]
    fn usable_window_is_writable() {
        let stack = PooledStack::new(DEFAULT_TASK_STACK_SIZE, 0).unwrap();
        // Touch the top and near-bottom of the usable window.
        unsafe {
            let top = (stack.base_addr() as *mut u8).sub(1);
            top.write(0xAB);
            let low = (stack.limit_addr() as *mut u8).add(8);
            low.write(0xCD);
            assert_eq!(top.read(), 0xAB);
        }
        assert!(stack.check_canary());
    }

    #[cfg(debug_assertions)]
    #[test]
    fn clobbered_canary_is_detected() {
        let stack = PooledStack::new(1 << 16, 0).unwrap();
        stack.clobber_canary();
        assert!(!stack.check_canary());
    }
}
