//! Software rendition of the four-level page tables covering the object heap.
//!
//! Entries carry the bits the heap and the collector care about: `present`
//! and `huge_page` drive lazy materialisation, `dirty` is the per-page
//! remembered-set bit (set by the reference-write entry point, cleared by
//! dirty iteration). Tables below the top level are allocated on demand and
//! charged to the page budget like any other directory page.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::sync::atomic::{AtomicU64, Ordering};

use modular_bitfield::prelude::*;

use crate::mem::PageBudget;

pub const ENTRY_COUNT: usize = 512;

#[bitfield(bits = 64)]
#[derive(Clone, Copy)]
pub struct EntryBits {
    pub present: bool,
    pub writeable: bool,
    pub huge_page: bool,
    pub dirty: bool,
    #[skip]
    __: B8,
    pub frame: B40,
    #[skip]
    __: B12,
}

// Raw masks for the atomic read-modify-write paths. `entry_masks_match` below
// keeps them honest against the bitfield layout.
pub const ENTRY_PRESENT: u64 = 1 << 0;
pub const ENTRY_DIRTY: u64 = 1 << 3;

impl EntryBits {
    #[inline]
    pub fn to_raw(self) -> u64 {
        u64::from_le_bytes(self.into_bytes())
    }

    #[inline]
    pub fn from_raw(raw: u64) -> EntryBits {
        EntryBits::from_bytes(raw.to_le_bytes())
    }
}

/// One page-table slot. Atomic because the write barrier sets dirty bits
/// outside the heap's region locks.
#[repr(transparent)]
pub struct PageEntry(AtomicU64);

impl PageEntry {
    #[inline]
    pub fn get(&self) -> EntryBits {
        EntryBits::from_raw(self.0.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn set(&self, bits: EntryBits) {
        self.0.store(bits.to_raw(), Ordering::Relaxed);
    }

    #[inline]
    pub fn is_present(&self) -> bool {
        self.0.load(Ordering::Relaxed) & ENTRY_PRESENT != 0
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.0.load(Ordering::Relaxed) & ENTRY_DIRTY != 0
    }

    #[inline]
    pub fn mark_dirty(&self) {
        self.0.fetch_or(ENTRY_DIRTY, Ordering::Relaxed);
    }

    #[inline]
    pub fn clear_dirty(&self) {
        self.0.fetch_and(!ENTRY_DIRTY, Ordering::Relaxed);
    }

    pub fn clear(&self) {
        self.0.store(0, Ordering::Relaxed);
    }

    /// Child table this entry points at. Only meaningful for present,
    /// non-huge entries of the upper levels.
    #[inline]
    pub fn table(&self) -> *mut PageTable {
        ((self.get().frame() as usize) << 12) as *mut PageTable
    }
}

#[repr(C, align(4096))]
pub struct PageTable {
    pub entries: [PageEntry; ENTRY_COUNT],
}

impl PageTable {
    /// Allocate a zeroed table, charging one directory page to the budget.
    pub fn alloc(budget: &PageBudget) -> Option<*mut PageTable> {
        if !budget.charge(1) {
            return None;
        }
        unsafe {
            let table = alloc_zeroed(Layout::new::<PageTable>()) as *mut PageTable;
            if table.is_null() {
                budget.uncharge(1);
                return None;
            }
            Some(table)
        }
    }

    /// # Safety
    /// `table` must have come from [`PageTable::alloc`] and must no longer be
    /// referenced by any entry.
    pub unsafe fn free(table: *mut PageTable, budget: &PageBudget) {
        dealloc(table as *mut u8, Layout::new::<PageTable>());
        budget.uncharge(1);
    }

    /// Make sure `entry` points at a child table, allocating one on demand.
    /// The caller must hold the lock region covering the entry.
    pub fn setup_level(entry: &PageEntry, budget: &PageBudget) -> Option<*mut PageTable> {
        if entry.is_present() {
            return Some(entry.table());
        }
        let table = PageTable::alloc(budget)?;
        entry.set(
            EntryBits::new()
                .with_present(true)
                .with_writeable(true)
                .with_frame((table as usize >> 12) as u64),
        );
        Some(table)
    }
}

// Index helpers, all relative to the heap base.

#[inline]
pub fn pml4_index(offset: usize) -> usize {
    offset >> 39
}

#[inline]
pub fn pml3_index(offset: usize) -> usize {
    (offset >> 30) & (ENTRY_COUNT - 1)
}

#[inline]
pub fn pml2_index(offset: usize) -> usize {
    (offset >> 21) & (ENTRY_COUNT - 1)
}

#[inline]
pub fn pml1_index(offset: usize) -> usize {
    (offset >> 12) & (ENTRY_COUNT - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_masks_match() {
        let present = EntryBits::new().with_present(true);
        assert_eq!(present.to_raw(), ENTRY_PRESENT);
        let dirty = EntryBits::new().with_dirty(true);
        assert_eq!(dirty.to_raw(), ENTRY_DIRTY);
    }

    #[test]
    fn frame_round_trips_table_pointer() {
        let budget = PageBudget::new(4);
        let table = PageTable::alloc(&budget).unwrap();
        let entry = PageEntry(AtomicU64::new(0));
        entry.set(
            EntryBits::new()
                .with_present(true)
                .with_frame((table as usize >> 12) as u64),
        );
        assert_eq!(entry.table(), table);
        entry.mark_dirty();
        assert!(entry.is_dirty());
        assert_eq!(entry.table(), table, "dirty bit must not disturb the frame");
        entry.clear_dirty();
        assert!(!entry.is_dirty());
        unsafe { PageTable::free(table, &budget) };
        assert_eq!(budget.remaining(), 4);
    }

    #[test]
    fn indexing_splits_offsets() {
        let off = (3usize << 39) | (17 << 30) | (42 << 21) | (511 << 12) | 0xfff;
        assert_eq!(pml4_index(off), 3);
        assert_eq!(pml3_index(off), 17);
        assert_eq!(pml2_index(off), 42);
        assert_eq!(pml1_index(off), 511);
    }
}
