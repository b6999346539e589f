//! Virtual-memory primitives backing the object heap.
//!
//! The heap range is reserved up front as one `PROT_NONE` mapping and pages
//! come online by committing pieces of it against a bounded page budget. The
//! budget stands in for the machine's physical page allocator: when it is
//! exhausted, commits fail with out-of-resources and the caller has to cope,
//! exactly as it would if `palloc` returned null.

use std::ptr::null_mut;
use std::sync::atomic::{AtomicUsize, Ordering};

pub const PAGE_SIZE: usize = 4096;
pub const SIZE_2MB: usize = 2 * 1024 * 1024;
pub const SIZE_1GB: usize = 1024 * 1024 * 1024;
pub const SIZE_512GB: usize = 512 * SIZE_1GB;
pub const SIZE_512MB: usize = 512 * 1024 * 1024;

/// Pages per 2 MiB huge page.
pub const PAGES_PER_HUGE: usize = SIZE_2MB / PAGE_SIZE;

/// A `PROT_NONE` reservation of the whole heap virtual range.
pub struct Reservation {
    start: *mut u8,
    len: usize,
}

unsafe impl Send for Reservation {}
unsafe impl Sync for Reservation {}

impl Reservation {
    pub fn reserve(len: usize) -> Option<Reservation> {
        unsafe {
            let map = libc::mmap(
                null_mut(),
                len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANON | libc::MAP_NORESERVE,
                -1,
                0,
            );
            if map == libc::MAP_FAILED {
                log::warn!("mem: failed to reserve {} of address space", crate::utils::human_size(len));
                return None;
            }
            Some(Reservation {
                start: map as *mut u8,
                len,
            })
        }
    }

    pub fn start(&self) -> *mut u8 {
        self.start
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn contains(&self, ptr: usize) -> bool {
        let start = self.start as usize;
        ptr >= start && ptr < start + self.len
    }

    /// Make `len` bytes at `offset` readable and writeable. Fresh commits read
    /// as zero.
    pub fn commit(&self, offset: usize, len: usize) {
        debug_assert!(offset + len <= self.len);
        unsafe {
            let rc = libc::mprotect(
                self.start.add(offset) as *mut _,
                len,
                libc::PROT_READ | libc::PROT_WRITE,
            );
            assert_eq!(rc, 0, "mem: mprotect commit failed");
        }
    }

    /// Return `len` bytes at `offset` to the reserved (inaccessible) state and
    /// drop their backing. A later commit reads as zero again.
    pub fn decommit(&self, offset: usize, len: usize) {
        debug_assert!(offset + len <= self.len);
        unsafe {
            let map = libc::mmap(
                self.start.add(offset) as *mut _,
                len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANON | libc::MAP_NORESERVE | libc::MAP_FIXED,
                -1,
                0,
            );
            assert_ne!(map, libc::MAP_FAILED, "mem: decommit remap failed");
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.start as *mut _, self.len);
        }
    }
}

/// Bounded accounting of 4 KiB pages, the stand-in for the physical page
/// allocator. Directory pages and heap backing both draw from it.
pub struct PageBudget {
    remaining: AtomicUsize,
}

impl PageBudget {
    pub fn new(pages: usize) -> PageBudget {
        PageBudget {
            remaining: AtomicUsize::new(pages),
        }
    }

    /// Take `pages` pages out of the budget. Fails (taking nothing) when the
    /// budget cannot cover the whole request.
    pub fn charge(&self, pages: usize) -> bool {
        let mut cur = self.remaining.load(Ordering::Relaxed);
        loop {
            if cur < pages {
                return false;
            }
            match self.remaining.compare_exchange_weak(
                cur,
                cur - pages,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(now) => cur = now,
            }
        }
    }

    pub fn uncharge(&self, pages: usize) {
        self.remaining.fetch_add(pages, Ordering::Relaxed);
    }

    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Relaxed)
    }
}
