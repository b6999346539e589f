//! Waitables: the native side of the managed `WaitHandle` family. A
//! waitable is a counted channel-like gate — sends accumulate up to the
//! capacity, waits consume them, closing releases everybody. Two-way select
//! races a pair of waitables through a shared ticket, which is how timed
//! waits are composed against a timer waitable.

use std::cell::Cell;
use std::collections::BinaryHeap;
use std::ptr::null_mut;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::lock_api::RawMutex as RawMutexTrait;
use parking_lot::{Condvar, Mutex, RawMutex as RawLock};
use rustc_hash::FxHashMap;

use crate::scheduler::{Scheduler, WaitingThread};
use crate::Runtime;

/// Wait result: the waitable was closed.
pub const WAIT_CLOSED: i32 = 0;
/// Wait result: woken without a delivery; try again.
pub const WAIT_SPURIOUS: i32 = 1;
/// Wait result: a send was received.
pub const WAIT_RECEIVED: i32 = 2;

const TICKET_RECEIVED: u32 = 2;
const TICKET_CLOSED: u32 = 3;
const TICKET_SENT: u32 = 4;

/// Plain FIFO of waiting-thread descriptors, guarded by the waitable lock.
struct WaitQueue {
    head: Cell<*mut WaitingThread>,
    tail: Cell<*mut WaitingThread>,
}

impl WaitQueue {
    const fn new() -> WaitQueue {
        WaitQueue {
            head: Cell::new(null_mut()),
            tail: Cell::new(null_mut()),
        }
    }

    unsafe fn push_back(&self, wt: *mut WaitingThread) {
        (*wt).wait_link.set(null_mut());
        let tail = self.tail.get();
        if tail.is_null() {
            self.head.set(wt);
        } else {
            (*tail).wait_link.set(wt);
        }
        self.tail.set(wt);
    }

    unsafe fn pop_front(&self) -> Option<*mut WaitingThread> {
        let head = self.head.get();
        if head.is_null() {
            return None;
        }
        let next = (*head).wait_link.get();
        self.head.set(next);
        if next.is_null() {
            self.tail.set(null_mut());
        }
        (*head).wait_link.set(null_mut());
        Some(head)
    }

    /// Unlink `wt` if still queued; no-op when a signaller already popped
    /// it.
    unsafe fn remove(&self, wt: *mut WaitingThread) {
        let mut prev: *mut WaitingThread = null_mut();
        let mut cur = self.head.get();
        while !cur.is_null() {
            if cur == wt {
                let next = (*cur).wait_link.get();
                if prev.is_null() {
                    self.head.set(next);
                } else {
                    (*prev).wait_link.set(next);
                }
                if self.tail.get() == cur {
                    self.tail.set(prev);
                }
                (*cur).wait_link.set(null_mut());
                return;
            }
            prev = cur;
            cur = (*cur).wait_link.get();
        }
    }
}

pub struct Waitable {
    lock: RawLock,
    open: Cell<bool>,
    /// Pending sends, bounded by `capacity`.
    count: Cell<u64>,
    capacity: u64,
    receivers: WaitQueue,
    senders: WaitQueue,
}

unsafe impl Send for Waitable {}
unsafe impl Sync for Waitable {}

impl Waitable {
    pub fn new(capacity: u64) -> Waitable {
        Waitable {
            lock: RawLock::INIT,
            open: Cell::new(true),
            count: Cell::new(0),
            capacity: capacity.max(1),
            receivers: WaitQueue::new(),
            senders: WaitQueue::new(),
        }
    }

    /// Pop receivers until one wins its select race (non-select receivers
    /// always win).
    unsafe fn pop_live_receiver(&self) -> Option<*mut WaitingThread> {
        while let Some(rx) = self.receivers.pop_front() {
            let won = match &*(*rx).select_done.get() {
                Some(done) => done
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok(),
                None => true,
            };
            if won {
                return Some(rx);
            }
            // Select loser: the winning arm wakes the thread, this entry is
            // dead.
        }
        None
    }

    unsafe fn wake(&self, sched: &Scheduler, wt: *mut WaitingThread, ticket: u32) {
        (*wt).ticket.store(ticket, Ordering::SeqCst);
        let thread = (*(*wt).thread.get()).clone().expect("waiter without thread");
        sched.ready(&thread);
    }

    /// Deliver one send. `false` when closed, or full with `block` unset.
    pub fn send(&self, sched: &Scheduler, block: bool) -> bool {
        self.lock.lock();
        if !self.open.get() {
            unsafe { self.lock.unlock() };
            return false;
        }
        unsafe {
            if let Some(rx) = self.pop_live_receiver() {
                self.wake(sched, rx, TICKET_RECEIVED);
                self.lock.unlock();
                return true;
            }
            if self.count.get() < self.capacity {
                self.count.set(self.count.get() + 1);
                self.lock.unlock();
                return true;
            }
            if !block {
                self.lock.unlock();
                return false;
            }
            // Full: wait for a receiver to make room.
            let wt = sched.acquire_waiting_thread();
            *(*wt).thread.get() = Some(Scheduler::current());
            self.senders.push_back(wt);
            sched.park(Some(&self.lock));
            let accepted = (*wt).ticket.load(Ordering::SeqCst) == TICKET_SENT;
            sched.release_waiting_thread(wt);
            accepted
        }
    }

    /// Complete a wait without sleeping, when possible. Caller holds the
    /// lock; a `WAIT_RECEIVED` consumes the delivery and refills from a
    /// pending sender.
    unsafe fn poll_locked(&self, sched: &Scheduler) -> Option<i32> {
        if self.count.get() > 0 {
            self.count.set(self.count.get() - 1);
            // Room freed: accept one pending sender in its place.
            if let Some(tx) = self.senders.pop_front() {
                self.count.set(self.count.get() + 1);
                self.wake(sched, tx, TICKET_SENT);
            }
            return Some(WAIT_RECEIVED);
        }
        if !self.open.get() {
            return Some(WAIT_CLOSED);
        }
        None
    }

    /// Would `poll_locked` complete, without consuming anything. Caller
    /// holds the lock.
    fn peek_locked(&self) -> bool {
        self.count.get() > 0 || !self.open.get()
    }

    /// Consume one send: `WAIT_RECEIVED`, `WAIT_CLOSED`, or `WAIT_SPURIOUS`
    /// when empty and not blocking.
    pub fn wait(&self, sched: &Scheduler, block: bool) -> i32 {
        self.lock.lock();
        unsafe {
            if let Some(result) = self.poll_locked(sched) {
                self.lock.unlock();
                return result;
            }
            if !block {
                self.lock.unlock();
                return WAIT_SPURIOUS;
            }
            let wt = sched.acquire_waiting_thread();
            *(*wt).thread.get() = Some(Scheduler::current());
            self.receivers.push_back(wt);
            sched.park(Some(&self.lock));
            let result = match (*wt).ticket.load(Ordering::SeqCst) {
                TICKET_RECEIVED => WAIT_RECEIVED,
                TICKET_CLOSED => WAIT_CLOSED,
                _ => WAIT_SPURIOUS,
            };
            sched.release_waiting_thread(wt);
            result
        }
    }

    /// Close the waitable and release every waiter on both sides.
    pub fn close(&self, sched: &Scheduler) {
        self.lock.lock();
        self.open.set(false);
        unsafe {
            while let Some(rx) = self.pop_live_receiver() {
                self.wake(sched, rx, TICKET_CLOSED);
            }
            while let Some(tx) = self.senders.pop_front() {
                self.wake(sched, tx, TICKET_CLOSED);
            }
            self.lock.unlock();
        }
    }

    /// Would a wait complete right now? Consumes the delivery when so.
    fn poll(&self, sched: &Scheduler) -> Option<i32> {
        self.lock.lock();
        let result = unsafe { self.poll_locked(sched) };
        unsafe { self.lock.unlock() };
        result
    }

    /// Wait on whichever of `a` and `b` fires first: 0 for `a`, 1 for `b`,
    /// -1 when not blocking and neither is ready. Ties go to `a`.
    pub fn select2(a: &Arc<Waitable>, b: &Arc<Waitable>, sched: &Scheduler, block: bool) -> i32 {
        if a.poll(sched).is_some() {
            return 0;
        }
        if b.poll(sched).is_some() {
            return 1;
        }
        if !block {
            return -1;
        }

        let done = Arc::new(AtomicBool::new(false));
        let current = Scheduler::current();
        let wta = sched.acquire_waiting_thread();
        let wtb = sched.acquire_waiting_thread();
        unsafe {
            *(*wta).thread.get() = Some(current.clone());
            *(*wta).select_done.get() = Some(done.clone());
            *(*wtb).thread.get() = Some(current);
            *(*wtb).select_done.get() = Some(done.clone());

            // Register on `a`, re-polling under its lock so nothing can fire
            // in the gap between the poll above and the enqueue.
            a.lock.lock();
            if a.poll_locked(sched).is_some() {
                a.lock.unlock();
                sched.release_waiting_thread(wta);
                sched.release_waiting_thread(wtb);
                return 0;
            }
            a.receivers.push_back(wta);
            a.lock.unlock();

            b.lock.lock();
            if b.peek_locked() {
                // Claim our own ticket before consuming, so a sender on `a`
                // that already won the race keeps its delivery and we keep
                // b's.
                let won = done
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok();
                if won {
                    let _ = b.poll_locked(sched);
                }
                b.lock.unlock();
                a.lock.lock();
                a.receivers.remove(wta);
                a.lock.unlock();
                if !won {
                    // `a` fired concurrently and committed a wakeup to us:
                    // absorb it before the descriptors go back to the pool.
                    sched.park(None);
                }
                sched.release_waiting_thread(wta);
                sched.release_waiting_thread(wtb);
                return if won { 1 } else { 0 };
            }
            b.receivers.push_back(wtb);
            b.lock.unlock();

            sched.park(None);

            // One arm won and woke us; pull the loser entry back out.
            a.lock.lock();
            a.receivers.remove(wta);
            a.lock.unlock();
            b.lock.lock();
            b.receivers.remove(wtb);
            b.lock.unlock();

            let fired_a = (*wta).ticket.load(Ordering::SeqCst) != 0;
            sched.release_waiting_thread(wta);
            sched.release_waiting_thread(wtb);
            if fired_a {
                0
            } else {
                1
            }
        }
    }
}

/// Handle table binding `u64` handles to waitables for the managed side.
pub struct WaitableTable {
    handles: Mutex<FxHashMap<u64, Arc<Waitable>>>,
    next: AtomicU64,
}

impl WaitableTable {
    pub fn new() -> WaitableTable {
        WaitableTable {
            handles: Mutex::new(FxHashMap::default()),
            next: AtomicU64::new(1),
        }
    }

    pub fn insert(&self, waitable: Arc<Waitable>) -> u64 {
        let handle = self.next.fetch_add(1, Ordering::Relaxed);
        self.handles.lock().insert(handle, waitable);
        handle
    }

    pub fn get(&self, handle: u64) -> Option<Arc<Waitable>> {
        self.handles.lock().get(&handle).cloned()
    }

    pub fn remove(&self, handle: u64) -> Option<Arc<Waitable>> {
        self.handles.lock().remove(&handle)
    }
}

impl Default for WaitableTable {
    fn default() -> WaitableTable {
        WaitableTable::new()
    }
}

struct TimerEntry {
    deadline_us: u64,
    seq: u64,
    waitable: Arc<Waitable>,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline_us == other.deadline_us && self.seq == other.seq
    }
}
impl Eq for TimerEntry {}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reversed: BinaryHeap is a max-heap and the soonest deadline must
        // surface first.
        other
            .deadline_us
            .cmp(&self.deadline_us)
            .then(other.seq.cmp(&self.seq))
    }
}

struct TimerState {
    queue: BinaryHeap<TimerEntry>,
    seq: u64,
    shutdown: bool,
}

/// The poller: one native thread delivering timer waitables at their
/// micro-deadlines. `microtime` is monotonic from runtime start.
pub struct Timer {
    state: Mutex<TimerState>,
    cv: Condvar,
    start: Instant,
}

impl Timer {
    pub fn new() -> Timer {
        Timer {
            state: Mutex::new(TimerState {
                queue: BinaryHeap::new(),
                seq: 0,
                shutdown: false,
            }),
            cv: Condvar::new(),
            start: Instant::now(),
        }
    }

    /// Microseconds since runtime start; no defined epoch, only growth.
    pub fn microtime(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }

    pub fn register(&self, deadline_us: u64, waitable: Arc<Waitable>) {
        let mut state = self.state.lock();
        let seq = state.seq;
        state.seq += 1;
        state.queue.push(TimerEntry {
            deadline_us,
            seq,
            waitable,
        });
        self.cv.notify_one();
    }

    /// Kick the poller so it re-evaluates its next deadline.
    pub fn wake(&self, _when_us: u64) {
        self.cv.notify_one();
    }

    pub fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.cv.notify_one();
    }

    /// Poller thread body.
    pub(crate) fn run(&self, sched: &Scheduler) {
        let mut state = self.state.lock();
        loop {
            if state.shutdown {
                return;
            }
            let now = self.microtime();
            match state.queue.peek() {
                Some(entry) if entry.deadline_us <= now => {
                    let entry = state.queue.pop().expect("peeked entry");
                    drop(state);
                    // Non-blocking: a full or released waitable just drops
                    // the tick.
                    entry.waitable.send(sched, false);
                    state = self.state.lock();
                }
                Some(entry) => {
                    let deadline = self.start + Duration::from_micros(entry.deadline_us);
                    self.cv.wait_until(&mut state, deadline);
                }
                None => {
                    self.cv.wait(&mut state);
                }
            }
        }
    }
}

impl Default for Timer {
    fn default() -> Timer {
        Timer::new()
    }
}

impl Runtime {
    /// `CreateWaitable(count)`: a counted waitable holding at most `count`
    /// pending sends.
    pub fn create_waitable(&self, count: u64) -> u64 {
        self.waitables.insert(Arc::new(Waitable::new(count)))
    }

    /// `ReleaseWaitable`: drop the handle and close the waitable.
    pub fn release_waitable(&self, handle: u64) {
        if let Some(w) = self.waitables.remove(handle) {
            w.close(&self.scheduler);
        }
    }

    /// `WaitableSend`.
    pub fn waitable_send(&self, handle: u64, block: bool) -> bool {
        match self.waitables.get(handle) {
            Some(w) => w.send(&self.scheduler, block),
            None => false,
        }
    }

    /// `WaitableWait`: 0 close, 1 spurious, 2 received.
    pub fn waitable_wait(&self, handle: u64, block: bool) -> i32 {
        match self.waitables.get(handle) {
            Some(w) => w.wait(&self.scheduler, block),
            None => WAIT_CLOSED,
        }
    }

    /// `WaitableSelect2`: 0 or 1 for the arm that fired, -1 when not
    /// blocking and neither is ready.
    pub fn waitable_select2(&self, a: u64, b: u64, block: bool) -> i32 {
        let (wa, wb) = match (self.waitables.get(a), self.waitables.get(b)) {
            (Some(wa), Some(wb)) => (wa, wb),
            (None, _) => return 0,
            (_, None) => return 1,
        };
        Waitable::select2(&wa, &wb, &self.scheduler, block)
    }

    /// `WaitableAfter`: a single-send waitable delivered at the given
    /// micro-deadline.
    pub fn waitable_after(&self, micros: u64) -> u64 {
        let waitable = Arc::new(Waitable::new(1));
        let handle = self.waitables.insert(waitable.clone());
        self.timer.register(self.timer.microtime() + micros, waitable);
        handle
    }

    pub fn microtime(&self) -> u64 {
        self.timer.microtime()
    }

    /// Wake the poller if it would otherwise sleep past `when_us`.
    pub fn wake_poller(&self, when_us: u64) {
        self.timer.wake(when_us);
    }
}
