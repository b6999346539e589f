//! The semaphore every higher-level synchronisation primitive bottoms out
//! in. Go lineage: a permit counter with a waiter counter and a tree-shaped
//! wait queue, with optional direct ticket handoff to the head waiter.
//!
//! Ordering contract (missed wakeups hinge on it): acquire increments
//! `nwait` *before* its second fast-path attempt, and release increments
//! `value` *before* it loads `nwait`.

use std::cell::Cell;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::lock_api::RawMutex as RawMutexTrait;
use parking_lot::RawMutex as RawLock;

use crate::scheduler::{Scheduler, WaitingThread};

pub struct Semaphore {
    value: AtomicU32,
    nwait: AtomicU32,
    lock: RawLock,
    /// Queue head; the head of each bucket carries `wait_tail` for O(1)
    /// append. Guarded by `lock`.
    waiters: Cell<*mut WaitingThread>,
}

unsafe impl Send for Semaphore {}
unsafe impl Sync for Semaphore {}

impl Semaphore {
    pub const fn new(permits: u32) -> Semaphore {
        Semaphore {
            value: AtomicU32::new(permits),
            nwait: AtomicU32::new(0),
            lock: RawLock::INIT,
            waiters: Cell::new(std::ptr::null_mut()),
        }
    }

    pub fn permits(&self) -> u32 {
        self.value.load(Ordering::SeqCst)
    }

    pub fn waiters(&self) -> u32 {
        self.nwait.load(Ordering::SeqCst)
    }

    fn can_acquire(&self) -> bool {
        loop {
            let v = self.value.load(Ordering::SeqCst);
            if v == 0 {
                return false;
            }
            if self
                .value
                .compare_exchange_weak(v, v - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Link `wt` into the wait queue. LIFO substitutes `wt` at the head,
    /// inheriting the displaced head's tail metadata; FIFO appends through
    /// the head's `wait_tail`.
    ///
    /// # Safety
    /// `lock` must be held and `wt` must be unlinked.
    unsafe fn queue(&self, wt: *mut WaitingThread, lifo: bool) {
        let head = self.waiters.get();
        if head.is_null() {
            (*wt).wait_link.set(std::ptr::null_mut());
            (*wt).wait_tail.set(std::ptr::null_mut());
            self.waiters.set(wt);
            return;
        }
        if lifo {
            // Substitute wt in head's place in the queue.
            self.waiters.set(wt);
            (*wt).ticket
                .store((*head).ticket.load(Ordering::Relaxed), Ordering::Relaxed);
            (*wt).wait_link.set(head);
            (*wt).wait_tail.set((*head).wait_tail.get());
            if (*wt).wait_tail.get().is_null() {
                (*wt).wait_tail.set(head);
            }
            (*head).wait_tail.set(std::ptr::null_mut());
        } else {
            // Append wt at the tail of the head's wait list.
            if (*head).wait_tail.get().is_null() {
                (*head).wait_link.set(wt);
            } else {
                (*(*head).wait_tail.get()).wait_link.set(wt);
            }
            (*head).wait_tail.set(wt);
            (*wt).wait_link.set(std::ptr::null_mut());
        }
    }

    /// Unlink and return the head waiter.
    ///
    /// # Safety
    /// `lock` must be held and the queue must be non-empty.
    unsafe fn dequeue(&self) -> *mut WaitingThread {
        let wt = self.waiters.get();
        debug_assert!(!wt.is_null());
        let link = (*wt).wait_link.get();
        if !link.is_null() {
            // Substitute the second waiter into the head position.
            self.waiters.set(link);
            (*link)
                .ticket
                .store((*wt).ticket.load(Ordering::Relaxed), Ordering::Relaxed);
            if !(*link).wait_link.get().is_null() {
                (*link).wait_tail.set((*wt).wait_tail.get());
            } else {
                (*link).wait_tail.set(std::ptr::null_mut());
            }
            (*wt).wait_link.set(std::ptr::null_mut());
            (*wt).wait_tail.set(std::ptr::null_mut());
        } else {
            self.waiters.set(std::ptr::null_mut());
        }
        (*wt).ticket.store(0, Ordering::Relaxed);
        wt
    }

    /// Take one permit, blocking until available. `lifo` queues the caller
    /// at the head instead of the tail.
    pub fn acquire(&self, sched: &Scheduler, lifo: bool) {
        // Easy case.
        if self.can_acquire() {
            return;
        }

        // Harder case:
        //   increment waiter count
        //   try can_acquire one more time, return if succeeded
        //   enqueue itself as a waiter
        //   sleep
        //   (waiter descriptor is dequeued by signaler)
        let wt = sched.acquire_waiting_thread();
        unsafe {
            *(*wt).thread.get() = Some(Scheduler::current());
        }

        loop {
            self.lock.lock();

            // Add ourselves to nwait to disable the easy case in release.
            self.nwait.fetch_add(1, Ordering::SeqCst);

            // Check can_acquire to avoid a missed wakeup.
            if self.can_acquire() {
                self.nwait.fetch_sub(1, Ordering::SeqCst);
                unsafe { self.lock.unlock() };
                break;
            }

            // Any release after the check above knows we are waiting (nwait
            // is set), so go to sleep.
            unsafe {
                self.queue(wt, lifo);
            }
            sched.park(Some(&self.lock));

            if unsafe { (*wt).ticket.load(Ordering::SeqCst) } != 0 || self.can_acquire() {
                break;
            }
        }

        unsafe { sched.release_waiting_thread(wt) };
    }

    /// Put one permit back. With `handoff`, the dequeued waiter gets the
    /// permit ticketed directly and the caller yields so the waiter runs on
    /// the remainder of this time slice.
    pub fn release(&self, sched: &Scheduler, handoff: bool) {
        self.value.fetch_add(1, Ordering::SeqCst);

        // Easy case: no waiters? This load must happen after the add above,
        // to avoid a missed wakeup against the loop in acquire.
        if self.nwait.load(Ordering::SeqCst) == 0 {
            return;
        }

        // Harder case: search for a waiter and wake it.
        self.lock.lock();
        if self.nwait.load(Ordering::SeqCst) == 0 {
            // The count was already consumed by another thread, no need to
            // wake anyone.
            unsafe { self.lock.unlock() };
            return;
        }
        let wt = unsafe { self.dequeue() };
        self.nwait.fetch_sub(1, Ordering::SeqCst);
        unsafe { self.lock.unlock() };

        let handed = if handoff && self.can_acquire() {
            unsafe { (*wt).ticket.store(1, Ordering::SeqCst) };
            true
        } else {
            false
        };

        // After ready() the waiter may already be running and may have
        // recycled the descriptor, so nothing reads wt past this point.
        let thread = unsafe { (*(*wt).thread.get()).clone().expect("waiter without thread") };
        sched.ready(&thread);

        if handed && Scheduler::try_current().is_some() {
            // Direct handoff: the waiter was queued on our core, yielding
            // hands it the rest of the slice. Only worth it in the starving
            // regime; without handoff another acquirer may take the permit
            // while we reschedule, which would make the wakeup wasted.
            sched.yield_now();
        }
    }
}
