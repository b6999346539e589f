//! The object heap: a fixed virtual range split into 26 top-level pools of
//! 512 GiB, one per power-of-two size class (16 B .. 512 MiB). Each pool is
//! 512 subpools of 1 GiB, striped into `cpu_count` lock regions.
//!
//! The page tables are the allocator's only bookkeeping: an unbacked slot
//! is, by construction, free, and a backed slot is free exactly when its
//! header colour is blue. Virtual capacity comes online by materialising
//! page-table entries as the free-slot search walks the pool.

use std::ptr::NonNull;

use parking_lot::lock_api::RawMutex as RawMutexTrait;
use parking_lot::RawMutex as RawLock;

use crate::mem::{
    PageBudget, Reservation, PAGES_PER_HUGE, PAGE_SIZE, SIZE_1GB, SIZE_2MB, SIZE_512GB, SIZE_512MB,
};
use crate::object::{Object, COLOR_BLUE};
use crate::page_table::{
    pml1_index, pml2_index, pml3_index, EntryBits, PageEntry, PageTable, ENTRY_COUNT,
};
use crate::utils::{align_down, human_size};
use crate::Error;

pub const POOL_COUNT: usize = 26;
pub const SUBPOOL_COUNT: usize = 512;

/// Pool 0 holds 2^4-byte objects.
pub const MIN_RANK_SHIFT: usize = 4;

pub const HEAP_LEN: usize = POOL_COUNT * SIZE_512GB;

pub struct Heap {
    reservation: Reservation,
    budget: PageBudget,
    pml4: Box<PageTable>,
    locks: Box<[RawLock]>,
    subpools_per_lock: usize,
    regions_per_pool: usize,
}

impl Heap {
    /// Reserve the heap range and install the top-level directories, one per
    /// pool. Fails with out-of-resources when the budget cannot cover the
    /// directory pages.
    pub fn new(cpu_count: usize, budget_pages: usize) -> Result<Heap, Error> {
        assert!(cpu_count >= 1 && cpu_count < 512);
        let reservation = Reservation::reserve(HEAP_LEN).ok_or(Error::OutOfResources)?;
        let budget = PageBudget::new(budget_pages);

        let pml4: Box<PageTable> = unsafe {
            let raw = std::alloc::alloc_zeroed(std::alloc::Layout::new::<PageTable>());
            assert!(!raw.is_null(), "heap: top-level table allocation failed");
            Box::from_raw(raw as *mut PageTable)
        };
        for pool in 0..POOL_COUNT {
            if PageTable::setup_level(&pml4.entries[pool], &budget).is_none() {
                // Free what made it in; the partial heap is unusable.
                for installed in 0..pool {
                    unsafe { PageTable::free(pml4.entries[installed].table(), &budget) };
                }
                return Err(Error::OutOfResources);
            }
        }

        let subpools_per_lock = SUBPOOL_COUNT / cpu_count;
        let regions_per_pool = (SUBPOOL_COUNT + subpools_per_lock - 1) / subpools_per_lock;
        let locks = (0..POOL_COUNT * regions_per_pool)
            .map(|_| RawLock::INIT)
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Ok(Heap {
            reservation,
            budget,
            pml4,
            locks,
            subpools_per_lock,
            regions_per_pool,
        })
    }

    #[inline]
    pub fn base(&self) -> usize {
        self.reservation.start() as usize
    }

    pub fn budget(&self) -> &PageBudget {
        &self.budget
    }

    pub fn contains(&self, addr: usize) -> bool {
        self.reservation.contains(addr)
    }

    /// Size class of pool `p` is `2^(p+4)` bytes.
    #[inline]
    pub fn pool_object_size(pool: usize) -> usize {
        1 << (pool + MIN_RANK_SHIFT)
    }

    /// Pool for an allocation request. Size 0 maps to the smallest class;
    /// anything past 512 MiB is unserviceable.
    pub fn pool_for(size: usize) -> Option<usize> {
        if size > SIZE_512MB {
            return None;
        }
        let aligned = size.next_power_of_two().max(1 << MIN_RANK_SHIFT);
        Some(aligned.trailing_zeros() as usize - MIN_RANK_SHIFT)
    }

    fn region_lock(&self, pool: usize, subpool: usize) -> &RawLock {
        &self.locks[pool * self.regions_per_pool + subpool / self.subpools_per_lock]
    }

    /// Lock a region directly, for pinning down the try-lock skip behaviour
    /// in tests. Never used on allocation paths.
    #[cfg(test)]
    pub(crate) fn lock_region_for_test(&self, pool: usize, subpool: usize) -> &RawLock {
        let lock = self.region_lock(pool, subpool);
        lock.lock();
        lock
    }

    fn pml3_table(&self, pool: usize) -> &PageTable {
        unsafe { &*self.pml4.entries[pool].table() }
    }

    /// Find a blue slot in the right size class, recolour it under the
    /// region lock and return it. Null when every reachable region is
    /// exhausted or contended away.
    pub fn alloc(&self, size: usize, color: u8) -> Option<NonNull<Object>> {
        debug_assert_ne!(color, COLOR_BLUE);
        let pool = Self::pool_for(size)?;
        let object_size = Self::pool_object_size(pool);
        let pml3_table = self.pml3_table(pool);

        let mut held: Option<&RawLock> = None;
        let mut no_more_pages = false;
        let mut allocated = None;

        let mut subpool = 0;
        'search: while subpool < SUBPOOL_COUNT {
            if subpool % self.subpools_per_lock == 0 {
                if let Some(lock) = held.take() {
                    unsafe { lock.unlock() };
                }
                let lock = self.region_lock(pool, subpool);
                if !lock.try_lock() {
                    // Region is locked, skip it entirely. It is fine to not
                    // come back later: there are as many regions as running
                    // cores and this code is not preemptible.
                    subpool += self.subpools_per_lock;
                    continue;
                }
                held = Some(lock);
            }

            let pml3e = &pml3_table.entries[pml3_index(subpool * SIZE_1GB)];
            if !pml3e.is_present() {
                if no_more_pages {
                    subpool += 1;
                    continue;
                }
                if PageTable::setup_level(pml3e, &self.budget).is_none() {
                    log::warn!("heap: out of memory trying to setup subpool");
                    no_more_pages = true;
                    subpool += 1;
                    continue;
                }
            }

            let subpool_off = pool * SIZE_512GB + subpool * SIZE_1GB;
            let found = if object_size >= SIZE_2MB {
                self.search_subpool_huge(pml3e, subpool_off, object_size, &mut no_more_pages)
            } else {
                self.search_subpool_paged(pml3e, subpool_off, object_size, &mut no_more_pages)
            };

            if let Some(obj) = found {
                unsafe {
                    obj.as_ref().set_color(color);
                    obj.as_ref().set_rank(pool as u8);
                }
                allocated = Some(obj);
                break 'search;
            }

            subpool += 1;
        }

        if let Some(lock) = held.take() {
            unsafe { lock.unlock() };
        }
        allocated
    }

    /// Size classes of 2 MiB and up: one present check per object at the
    /// huge-page level, backing whole objects with contiguous huge pages.
    fn search_subpool_huge(
        &self,
        pml3e: &PageEntry,
        subpool_off: usize,
        object_size: usize,
        no_more_pages: &mut bool,
    ) -> Option<NonNull<Object>> {
        let pml2_table = unsafe { &*pml3e.table() };
        let mut off = subpool_off;
        while off < subpool_off + SIZE_1GB {
            let pml2i = pml2_index(off);
            if !pml2_table.entries[pml2i].is_present() {
                if *no_more_pages || !self.commit_huge_object(pml2_table, pml2i, off, object_size) {
                    *no_more_pages = true;
                    off += object_size;
                    continue;
                }
            }
            let obj = (self.base() + off) as *mut Object;
            if unsafe { (*obj).color() } == COLOR_BLUE {
                return NonNull::new(obj);
            }
            off += object_size;
        }
        None
    }

    /// Size classes below 2 MiB: the huge-page entries are table pointers,
    /// materialised on demand, and the search walks 4 KiB pages.
    fn search_subpool_paged(
        &self,
        pml3e: &PageEntry,
        subpool_off: usize,
        object_size: usize,
        no_more_pages: &mut bool,
    ) -> Option<NonNull<Object>> {
        let pml2_table = unsafe { &*pml3e.table() };
        for pml2i in 0..ENTRY_COUNT {
            let pml2e = &pml2_table.entries[pml2i];
            if !pml2e.is_present() {
                if *no_more_pages {
                    continue;
                }
                if PageTable::setup_level(pml2e, &self.budget).is_none() {
                    log::warn!("heap: out of memory trying to setup PML2 for 4KB pools");
                    *no_more_pages = true;
                    continue;
                }
            }
            let pml1_table = unsafe { &*pml2e.table() };
            let pml2_off = subpool_off + pml2i * SIZE_2MB;

            if object_size >= PAGE_SIZE {
                // One present check per object at the page level.
                let mut off = pml2_off;
                while off < pml2_off + SIZE_2MB {
                    let pml1i = pml1_index(off);
                    if !pml1_table.entries[pml1i].is_present() {
                        if *no_more_pages
                            || !self.commit_paged_object(pml1_table, pml1i, off, object_size)
                        {
                            *no_more_pages = true;
                            off += object_size;
                            continue;
                        }
                    }
                    let obj = (self.base() + off) as *mut Object;
                    if unsafe { (*obj).color() } == COLOR_BLUE {
                        return NonNull::new(obj);
                    }
                    off += object_size;
                }
            } else {
                // Multiple objects per page: materialise pages one by one
                // and scan every slot inside.
                for pml1i in 0..ENTRY_COUNT {
                    let pml1e = &pml1_table.entries[pml1i];
                    let page_off = pml2_off + pml1i * PAGE_SIZE;
                    if !pml1e.is_present() {
                        if *no_more_pages {
                            continue;
                        }
                        if !self.budget.charge(1) {
                            log::warn!(
                                "heap: out of memory allocating 4kb card for {} object",
                                human_size(object_size)
                            );
                            *no_more_pages = true;
                            continue;
                        }
                        self.reservation.commit(page_off, PAGE_SIZE);
                        pml1e.set(self.leaf_entry(page_off, false));
                    }
                    let mut off = page_off;
                    while off < page_off + PAGE_SIZE {
                        let obj = (self.base() + off) as *mut Object;
                        if unsafe { (*obj).color() } == COLOR_BLUE {
                            return NonNull::new(obj);
                        }
                        off += object_size;
                    }
                }
            }
        }
        None
    }

    fn leaf_entry(&self, off: usize, huge: bool) -> EntryBits {
        EntryBits::new()
            .with_present(true)
            .with_writeable(true)
            .with_huge_page(huge)
            .with_frame(((self.base() + off) >> 12) as u64)
    }

    /// Back a whole >= 2 MiB object with contiguous huge pages, rolling the
    /// partial allocation back on OOM so no half-mapped dead region is left
    /// behind.
    fn commit_huge_object(
        &self,
        pml2_table: &PageTable,
        first: usize,
        off: usize,
        object_size: usize,
    ) -> bool {
        let count = object_size / SIZE_2MB;
        for i in 0..count {
            if !self.budget.charge(PAGES_PER_HUGE) {
                log::warn!(
                    "heap: out of memory allocating {} object (with 2MB pages)",
                    human_size(object_size)
                );
                for j in 0..i {
                    pml2_table.entries[first + j].clear();
                    self.reservation.decommit(off + j * SIZE_2MB, SIZE_2MB);
                    self.budget.uncharge(PAGES_PER_HUGE);
                }
                return false;
            }
            self.reservation.commit(off + i * SIZE_2MB, SIZE_2MB);
            pml2_table.entries[first + i].set(self.leaf_entry(off + i * SIZE_2MB, true));
        }
        true
    }

    /// Back a 4 KiB .. 2 MiB object with small pages, with the same rollback
    /// discipline.
    fn commit_paged_object(
        &self,
        pml1_table: &PageTable,
        first: usize,
        off: usize,
        object_size: usize,
    ) -> bool {
        let count = object_size / PAGE_SIZE;
        for i in 0..count {
            if !self.budget.charge(1) {
                log::warn!(
                    "heap: out of memory allocating {} object (with 4KB pages)",
                    human_size(object_size)
                );
                for j in 0..i {
                    pml1_table.entries[first + j].clear();
                    self.reservation.decommit(off + j * PAGE_SIZE, PAGE_SIZE);
                    self.budget.uncharge(1);
                }
                return false;
            }
            self.reservation.commit(off + i * PAGE_SIZE, PAGE_SIZE);
            pml1_table.entries[first + i].set(self.leaf_entry(off + i * PAGE_SIZE, false));
        }
        true
    }

    /// Resolve an arbitrary pointer, interior ones included, to the object
    /// whose slot contains it. Null when outside the heap, on an unbacked
    /// page, or on a free slot.
    pub fn find(&self, ptr: usize) -> Option<NonNull<Object>> {
        let base = self.base();
        if ptr < base || ptr >= base + HEAP_LEN {
            return None;
        }
        let off = ptr - base;
        let pool = off / SIZE_512GB;
        let size = Self::pool_object_size(pool);

        let pml3e = &self.pml3_table(pool).entries[pml3_index(off)];
        if !pml3e.is_present() {
            return None;
        }
        let pml2_table = unsafe { &*pml3e.table() };
        let pml2e = &pml2_table.entries[pml2_index(off)];
        if !pml2e.is_present() {
            return None;
        }
        // Below 2 MiB the leaf level is PML1, check it as well.
        if size < SIZE_2MB {
            let pml1_table = unsafe { &*pml2e.table() };
            if !pml1_table.entries[pml1_index(off)].is_present() {
                return None;
            }
        }

        let obj = (base + align_down(off, size)) as *mut Object;
        if unsafe { (*obj).color() } == COLOR_BLUE {
            return None;
        }
        NonNull::new(obj)
    }

    /// Set the remembered-set bit for the page holding `addr`. The hardware
    /// would do this on any store; here the reference-write entry point is
    /// the only writer the collector cares about.
    pub fn mark_dirty(&self, addr: usize) {
        let base = self.base();
        debug_assert!(addr >= base && addr < base + HEAP_LEN);
        let off = addr - base;
        let pool = off / SIZE_512GB;
        let pml3e = &self.pml3_table(pool).entries[pml3_index(off)];
        debug_assert!(pml3e.is_present());
        let pml2_table = unsafe { &*pml3e.table() };
        let pml2e = &pml2_table.entries[pml2_index(off)];
        debug_assert!(pml2e.is_present());
        if Self::pool_object_size(pool) >= SIZE_2MB {
            pml2e.mark_dirty();
        } else {
            let pml1_table = unsafe { &*pml2e.table() };
            pml1_table.entries[pml1_index(off)].mark_dirty();
        }
    }

    /// Visit every live (non-blue) slot.
    pub fn iterate_objects(&self, mut callback: impl FnMut(*mut Object)) {
        self.walk_pools(&mut |off| {
            let obj = (self.base() + off) as *mut Object;
            if unsafe { (*obj).color() } != COLOR_BLUE {
                callback(obj);
            }
        });
    }

    /// Visit every slot on a dirty page, clearing each page's dirty bit only
    /// after its slots were visited. For the >= 2 MiB classes the huge-page
    /// dirty bit is authoritative.
    pub fn iterate_dirty_objects(&self, mut callback: impl FnMut(*mut Object)) {
        for pool in 0..POOL_COUNT {
            let object_size = Self::pool_object_size(pool);
            let pml3_table = self.pml3_table(pool);
            let mut held: Option<&RawLock> = None;

            for subpool in 0..SUBPOOL_COUNT {
                if subpool % self.subpools_per_lock == 0 {
                    if let Some(lock) = held.take() {
                        unsafe { lock.unlock() };
                    }
                    let lock = self.region_lock(pool, subpool);
                    lock.lock();
                    held = Some(lock);
                }

                let pml3e = &pml3_table.entries[pml3_index(subpool * SIZE_1GB)];
                if !pml3e.is_present() {
                    continue;
                }
                let pml2_table = unsafe { &*pml3e.table() };
                let subpool_off = pool * SIZE_512GB + subpool * SIZE_1GB;

                for pml2i in 0..ENTRY_COUNT {
                    let pml2e = &pml2_table.entries[pml2i];
                    if !pml2e.is_present() {
                        continue;
                    }
                    let pml2_off = subpool_off + pml2i * SIZE_2MB;

                    if object_size >= SIZE_2MB {
                        if !pml2e.is_dirty() {
                            continue;
                        }
                        self.visit_page_slots(pml2_off, SIZE_2MB, object_size, &mut callback);
                        // Clear after visiting so no write is lost between
                        // read-dirty and clear-dirty.
                        pml2e.clear_dirty();
                    } else {
                        let pml1_table = unsafe { &*pml2e.table() };
                        for pml1i in 0..ENTRY_COUNT {
                            let pml1e = &pml1_table.entries[pml1i];
                            if !pml1e.is_present() || !pml1e.is_dirty() {
                                continue;
                            }
                            let page_off = pml2_off + pml1i * PAGE_SIZE;
                            self.visit_page_slots(page_off, PAGE_SIZE, object_size, &mut callback);
                            pml1e.clear_dirty();
                        }
                    }
                }
            }

            if let Some(lock) = held.take() {
                unsafe { lock.unlock() };
            }
        }
    }

    /// Visit every object slot intersecting `[page_off, page_off + len)`.
    fn visit_page_slots(
        &self,
        page_off: usize,
        len: usize,
        object_size: usize,
        callback: &mut impl FnMut(*mut Object),
    ) {
        let mut off = align_down(page_off, object_size);
        while off < page_off + len {
            callback((self.base() + off) as *mut Object);
            off += object_size;
        }
    }

    /// Walk every backed slot of every pool under the region locks.
    fn walk_pools(&self, visit: &mut impl FnMut(usize)) {
        for pool in 0..POOL_COUNT {
            let object_size = Self::pool_object_size(pool);
            let pml3_table = self.pml3_table(pool);
            let mut held: Option<&RawLock> = None;

            for subpool in 0..SUBPOOL_COUNT {
                if subpool % self.subpools_per_lock == 0 {
                    if let Some(lock) = held.take() {
                        unsafe { lock.unlock() };
                    }
                    let lock = self.region_lock(pool, subpool);
                    lock.lock();
                    held = Some(lock);
                }

                let pml3e = &pml3_table.entries[pml3_index(subpool * SIZE_1GB)];
                if !pml3e.is_present() {
                    continue;
                }
                let pml2_table = unsafe { &*pml3e.table() };
                let subpool_off = pool * SIZE_512GB + subpool * SIZE_1GB;

                if object_size >= SIZE_2MB {
                    let mut off = subpool_off;
                    while off < subpool_off + SIZE_1GB {
                        if pml2_table.entries[pml2_index(off)].is_present() {
                            visit(off);
                        }
                        off += object_size;
                    }
                } else {
                    for pml2i in 0..ENTRY_COUNT {
                        let pml2e = &pml2_table.entries[pml2i];
                        if !pml2e.is_present() {
                            continue;
                        }
                        let pml1_table = unsafe { &*pml2e.table() };
                        let pml2_off = subpool_off + pml2i * SIZE_2MB;

                        if object_size >= PAGE_SIZE {
                            let mut off = pml2_off;
                            while off < pml2_off + SIZE_2MB {
                                if pml1_table.entries[pml1_index(off)].is_present() {
                                    visit(off);
                                }
                                off += object_size;
                            }
                        } else {
                            for pml1i in 0..ENTRY_COUNT {
                                if !pml1_table.entries[pml1i].is_present() {
                                    continue;
                                }
                                let page_off = pml2_off + pml1i * PAGE_SIZE;
                                let mut off = page_off;
                                while off < page_off + PAGE_SIZE {
                                    visit(off);
                                    off += object_size;
                                }
                            }
                        }
                    }
                }
            }

            if let Some(lock) = held.take() {
                unsafe { lock.unlock() };
            }
        }
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        for pool in 0..POOL_COUNT {
            let pml4e = &self.pml4.entries[pool];
            if !pml4e.is_present() {
                continue;
            }
            let pml3_table = pml4e.table();
            unsafe {
                for pml3e in &(*pml3_table).entries {
                    if !pml3e.is_present() {
                        continue;
                    }
                    let pml2_table = pml3e.table();
                    for pml2e in &(*pml2_table).entries {
                        if pml2e.is_present() && !pml2e.get().huge_page() {
                            PageTable::free(pml2e.table(), &self.budget);
                        }
                    }
                    PageTable::free(pml2_table, &self.budget);
                }
                PageTable::free(pml3_table, &self.budget);
            }
        }
    }
}
