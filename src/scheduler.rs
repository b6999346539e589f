//! Cooperative core-token scheduler.
//!
//! Managed threads are OS threads that only run while holding one of
//! `cpu_count` core tokens. A thread gives its core up when it parks, yields
//! or blocks externally; the core is then handed to the next runnable thread
//! (local queue first, then the global queue, then stealing) or marked idle.
//! `ready` makes a thread runnable and grants it an idle core immediately
//! when one exists.
//!
//! Suspension is safepoint-based: `suspend` raises a per-thread flag and
//! waits until the target is provably stopped — either it is not running
//! user code at all, or it acknowledged the flag at a safepoint poll. While
//! a thread is suspended its `gc_local_data` may be read and written by the
//! suspender.

use std::cell::{Cell, RefCell, UnsafeCell};
use std::collections::VecDeque;
use std::ptr::null_mut;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use atomic::Atomic;
use crossbeam_deque::{Injector, Steal, Stealer, Worker};
use parking_lot::lock_api::RawMutex as RawMutexTrait;
use parking_lot::{Condvar, Mutex, MutexGuard, RawMutex as RawLock};
use rustc_hash::FxHashSet;

use crate::frame::Frame;
use crate::gc::LogBuffer;

const NO_CORE: usize = usize::MAX;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum ThreadState {
    /// Queued or granted, will run user code next.
    Runnable = 0,
    /// Holding a core and executing user code.
    Running = 1,
    /// Off the run queues, waiting for a `ready`.
    Parked = 2,
    /// Blocked outside managed code (native wait); safe for suspension.
    Waiting = 3,
    Dead = 4,
}

/// Per-thread collector state, written by the thread itself with preemption
/// disabled and by the collector while the thread is suspended.
pub struct GcLocalData {
    pub alloc_color: AtomicU8,
    pub trace_on: AtomicBool,
    pub snoop: AtomicBool,
    log: UnsafeCell<LogBuffer>,
    snooped: UnsafeCell<FxHashSet<usize>>,
}

impl GcLocalData {
    fn new(alloc_color: u8) -> GcLocalData {
        GcLocalData {
            alloc_color: AtomicU8::new(alloc_color),
            trace_on: AtomicBool::new(false),
            snoop: AtomicBool::new(false),
            log: UnsafeCell::new(LogBuffer::new()),
            snooped: UnsafeCell::new(FxHashSet::default()),
        }
    }

    /// # Safety
    /// Caller must be the owning thread with preemption disabled, or any
    /// thread while the owner is suspended or dead.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn log_mut(&self) -> &mut LogBuffer {
        &mut *self.log.get()
    }

    /// # Safety
    /// Same protocol as [`GcLocalData::log_mut`].
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn snooped_mut(&self) -> &mut FxHashSet<usize> {
        &mut *self.snooped.get()
    }
}

struct SuspendFlags {
    requested: bool,
    stopped: bool,
}

pub struct Thread {
    pub id: u64,
    pub name: String,
    state: Atomic<ThreadState>,
    core: AtomicUsize,
    permit: Mutex<Option<usize>>,
    permit_cv: Condvar,
    suspend: Mutex<SuspendFlags>,
    suspend_cv: Condvar,
    suspend_requested: AtomicBool,
    preempt_count: AtomicU32,
    pub gc_local_data: GcLocalData,
    top_frame: AtomicPtr<Frame>,
    /// Bytecode offset of the last throw-capable point, recorded by jitted
    /// code right before it can raise.
    il_offset: AtomicU32,
    join_running: Mutex<bool>,
    join_cv: Condvar,
}

unsafe impl Send for Thread {}
unsafe impl Sync for Thread {}

impl Thread {
    fn new(id: u64, name: &str, alloc_color: u8) -> Thread {
        Thread {
            id,
            name: name.to_owned(),
            state: Atomic::new(ThreadState::Runnable),
            core: AtomicUsize::new(NO_CORE),
            permit: Mutex::new(None),
            permit_cv: Condvar::new(),
            suspend: Mutex::new(SuspendFlags {
                requested: false,
                stopped: false,
            }),
            suspend_cv: Condvar::new(),
            suspend_requested: AtomicBool::new(false),
            preempt_count: AtomicU32::new(0),
            gc_local_data: GcLocalData::new(alloc_color),
            top_frame: AtomicPtr::new(null_mut()),
            il_offset: AtomicU32::new(0),
            join_running: Mutex::new(true),
            join_cv: Condvar::new(),
        }
    }

    pub fn state(&self) -> ThreadState {
        self.state.load(Ordering::Acquire)
    }

    #[inline]
    fn core(&self) -> usize {
        self.core.load(Ordering::Relaxed)
    }

    fn release_core(&self) -> usize {
        let core = self.core.swap(NO_CORE, Ordering::Relaxed);
        debug_assert_ne!(core, NO_CORE);
        core
    }

    /// Top of this thread's shadow-stack chain.
    pub fn top_frame(&self) -> *mut Frame {
        self.top_frame.load(Ordering::Relaxed)
    }

    pub fn set_top_frame(&self, frame: *mut Frame) {
        self.top_frame.store(frame, Ordering::Relaxed);
    }

    pub fn il_offset(&self) -> u32 {
        self.il_offset.load(Ordering::Relaxed)
    }

    pub fn set_il_offset(&self, offset: u32) {
        self.il_offset.store(offset, Ordering::Relaxed);
    }

    #[inline]
    pub fn preempt_disable(&self) {
        self.preempt_count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn preempt_enable(&self) {
        let prev = self.preempt_count.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0, "unbalanced preempt_enable");
    }

    #[inline]
    pub fn is_preemption(&self) -> bool {
        self.preempt_count.load(Ordering::Relaxed) == 0
    }

    /// Block until granted a core, then pass the pending safepoint (if any)
    /// and enter the running state.
    fn wait_for_permit(&self) {
        let core = {
            let mut permit = self.permit.lock();
            loop {
                if let Some(core) = permit.take() {
                    break core;
                }
                self.permit_cv.wait(&mut permit);
            }
        };
        self.safepoint_check();
        self.core.store(core, Ordering::Relaxed);
        self.state.store(ThreadState::Running, Ordering::Release);
    }

    /// Re-evaluate a pending suspend after a state transition away from
    /// `Running`.
    fn wake_suspender(&self) {
        if self.suspend_requested.load(Ordering::Acquire) {
            let _flags = self.suspend.lock();
            self.suspend_cv.notify_all();
        }
    }

    /// Safepoint poll: if a suspend was requested, acknowledge it and block
    /// until resumed.
    pub fn safepoint_check(&self) {
        if !self.suspend_requested.load(Ordering::Acquire) {
            return;
        }
        let mut flags = self.suspend.lock();
        while flags.requested {
            flags.stopped = true;
            self.suspend_cv.notify_all();
            self.suspend_cv.wait(&mut flags);
        }
        flags.stopped = false;
    }
}

/// Proof that a thread is stopped at a safepoint; reading its
/// `gc_local_data` is permitted until `resume`.
pub struct SuspendState {
    thread: Arc<Thread>,
}

impl SuspendState {
    pub fn thread(&self) -> &Arc<Thread> {
        &self.thread
    }
}

/// A waiting-thread descriptor, pooled and linked into semaphore and
/// waitable queues. Fields other than `ticket` are guarded by the owning
/// queue's lock.
pub struct WaitingThread {
    pub thread: UnsafeCell<Option<Arc<Thread>>>,
    pub ticket: AtomicU32,
    pub wait_link: Cell<*mut WaitingThread>,
    pub wait_tail: Cell<*mut WaitingThread>,
    pub select_done: UnsafeCell<Option<Arc<AtomicBool>>>,
}

unsafe impl Send for WaitingThread {}
unsafe impl Sync for WaitingThread {}

impl WaitingThread {
    fn new() -> WaitingThread {
        WaitingThread {
            thread: UnsafeCell::new(None),
            ticket: AtomicU32::new(0),
            wait_link: Cell::new(null_mut()),
            wait_tail: Cell::new(null_mut()),
            select_done: UnsafeCell::new(None),
        }
    }
}

/// Local run queue of one virtual core. Only the holder of the core token
/// (or the claimant of an idle core) touches the worker end; everyone else
/// goes through the matching stealer.
struct CoreQueue {
    worker: Worker<Arc<Thread>>,
}

unsafe impl Sync for CoreQueue {}

struct SchedState {
    idle: Vec<usize>,
    core_waiters: VecDeque<Arc<Thread>>,
}

pub struct Scheduler {
    cpu_count: usize,
    cores: Box<[CoreQueue]>,
    stealers: Box<[Stealer<Arc<Thread>>]>,
    injector: Injector<Arc<Thread>>,
    sched: Mutex<SchedState>,
    all_threads: Mutex<Vec<Arc<Thread>>>,
    wt_pool: Mutex<Vec<*mut WaitingThread>>,
    next_id: AtomicU64,
}

unsafe impl Send for Scheduler {}
unsafe impl Sync for Scheduler {}

thread_local! {
    static CURRENT: RefCell<Option<Arc<Thread>>> = RefCell::new(None);
}

impl Scheduler {
    pub fn new(cpu_count: usize) -> Scheduler {
        assert!(cpu_count >= 1 && cpu_count < 512);
        let mut cores = Vec::with_capacity(cpu_count);
        let mut stealers = Vec::with_capacity(cpu_count);
        for _ in 0..cpu_count {
            let worker = Worker::new_fifo();
            stealers.push(worker.stealer());
            cores.push(CoreQueue { worker });
        }
        Scheduler {
            cpu_count,
            cores: cores.into_boxed_slice(),
            stealers: stealers.into_boxed_slice(),
            injector: Injector::new(),
            sched: Mutex::new(SchedState {
                idle: (0..cpu_count).collect(),
                core_waiters: VecDeque::new(),
            }),
            all_threads: Mutex::new(Vec::new()),
            wt_pool: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn cpu_count(&self) -> usize {
        self.cpu_count
    }

    /// The managed thread running on this OS thread. Panics outside managed
    /// context.
    pub fn current() -> Arc<Thread> {
        Self::try_current().expect("not on a managed thread")
    }

    pub fn try_current() -> Option<Arc<Thread>> {
        CURRENT.with(|c| c.borrow().clone())
    }

    pub(crate) fn make_thread(&self, name: &str, alloc_color: u8) -> Arc<Thread> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        Arc::new(Thread::new(id, name, alloc_color))
    }

    pub(crate) fn set_current(t: Arc<Thread>) {
        CURRENT.with(|c| *c.borrow_mut() = Some(t));
    }

    /// Enter managed execution on this OS thread: bind the thread control
    /// block and block until a core is granted.
    pub(crate) fn enter_thread(&self, t: &Arc<Thread>) {
        Self::set_current(t.clone());
        t.wait_for_permit();
    }

    /// Bind an already-registered thread to the calling OS thread and take a
    /// core, waiting for one to free up if need be.
    pub(crate) fn attach_current(&self, t: &Arc<Thread>) {
        Self::set_current(t.clone());
        self.acquire_core_blocking(t);
    }

    pub(crate) fn clear_current() {
        CURRENT.with(|c| c.borrow_mut().take());
    }

    /// Register a thread in the all-threads list. Entering the list is what
    /// makes a thread visible to collection handshakes.
    pub(crate) fn register(&self, t: Arc<Thread>) {
        if Self::try_current().is_some() {
            // Handshakes hold the list lock while waiting on safepoints, so
            // a managed thread must not block on it in the running state.
            self.block_external(|| self.all_threads.lock().push(t));
        } else {
            self.all_threads.lock().push(t);
        }
    }

    pub fn lock_all_threads(&self) -> MutexGuard<'_, Vec<Arc<Thread>>> {
        self.all_threads.lock()
    }

    /// Make `t` runnable. An idle core picks it up immediately; otherwise it
    /// queues on the readying core's local queue (the global queue when the
    /// caller is not managed).
    pub fn ready(&self, t: &Arc<Thread>) {
        t.state.store(ThreadState::Runnable, Ordering::Release);
        if let Some(core) = self.take_idle_core() {
            self.grant(t, core);
            return;
        }
        match Self::try_current() {
            Some(cur) if cur.core() != NO_CORE => {
                self.cores[cur.core()].worker.push(t.clone());
            }
            _ => self.injector.push(t.clone()),
        }
        self.kick_idle();
    }

    /// Park the current thread. `wait_lock`, when given, is released after
    /// the thread can no longer miss a wakeup — the park-atomicity contract
    /// the semaphore depends on.
    pub fn park(&self, wait_lock: Option<&RawLock>) {
        let t = Self::current();
        debug_assert!(t.is_preemption(), "parking with preemption disabled");
        t.state.store(ThreadState::Parked, Ordering::Release);
        t.wake_suspender();
        if let Some(lock) = wait_lock {
            unsafe { lock.unlock() };
        }
        let core = t.release_core();
        self.dispatch_core(core);
        t.wait_for_permit();
    }

    /// Give up the core, staying runnable on the local queue.
    pub fn yield_now(&self) {
        let t = Self::current();
        debug_assert!(t.is_preemption(), "yielding with preemption disabled");
        t.state.store(ThreadState::Runnable, Ordering::Release);
        self.cores[t.core()].worker.push(t.clone());
        let core = t.release_core();
        self.dispatch_core(core);
        t.wait_for_permit();
    }

    /// Give up the core and a fresh time slice: requeue on the global queue.
    pub fn schedule(&self) {
        let t = Self::current();
        debug_assert!(t.is_preemption(), "rescheduling with preemption disabled");
        t.state.store(ThreadState::Runnable, Ordering::Release);
        self.injector.push(t.clone());
        let core = t.release_core();
        self.dispatch_core(core);
        t.wait_for_permit();
    }

    /// Terminate the current thread: mark dead, leave the all-threads list,
    /// pass the core on and wake joiners. The caller must not run managed
    /// code afterwards.
    pub(crate) fn exit_current(&self, t: &Arc<Thread>) {
        t.state.store(ThreadState::Dead, Ordering::Release);
        t.wake_suspender();
        {
            let mut all = self.all_threads.lock();
            all.retain(|x| !Arc::ptr_eq(x, t));
        }
        let core = t.release_core();
        self.dispatch_core(core);
        {
            let mut running = t.join_running.lock();
            *running = false;
            t.join_cv.notify_all();
        }
        Self::clear_current();
    }

    /// Drop the current thread and schedule another in its place. The
    /// calling OS thread leaves managed execution and should wind down.
    pub fn drop_current(&self) {
        let t = Self::current();
        self.exit_current(&t);
    }

    /// Disable preemption for the current thread; nestable.
    pub fn preempt_disable(&self) {
        Self::current().preempt_disable();
    }

    /// Re-enable preemption for the current thread.
    pub fn preempt_enable(&self) {
        Self::current().preempt_enable();
    }

    /// Is the current thread preemptible?
    pub fn is_preemption(&self) -> bool {
        Self::current().is_preemption()
    }

    /// Wait for `t` to finish. Releases the caller's core while blocked.
    pub fn join(&self, t: &Arc<Thread>) {
        let wait = || {
            let mut running = t.join_running.lock();
            while *running {
                t.join_cv.wait(&mut running);
            }
        };
        if Self::try_current().is_some() {
            self.block_external(wait);
        } else {
            wait();
        }
    }

    /// Suspend `t` at its next safepoint (immediately when it is not running
    /// user code). Until `resume`, `t.gc_local_data` may be accessed.
    pub fn suspend(&self, t: &Arc<Thread>) -> SuspendState {
        let mut flags = t.suspend.lock();
        flags.requested = true;
        t.suspend_requested.store(true, Ordering::Release);
        while t.state.load(Ordering::Acquire) == ThreadState::Running && !flags.stopped {
            t.suspend_cv.wait(&mut flags);
        }
        SuspendState { thread: t.clone() }
    }

    pub fn resume(&self, state: SuspendState) {
        let t = state.thread;
        let mut flags = t.suspend.lock();
        flags.requested = false;
        t.suspend_requested.store(false, Ordering::Release);
        drop(flags);
        t.suspend_cv.notify_all();
    }

    /// Safepoint poll for the current thread.
    pub fn safepoint(&self) {
        if let Some(t) = Self::try_current() {
            t.safepoint_check();
        }
    }

    /// Run `f` outside managed execution: the core is given up first and
    /// reacquired afterwards, so `f` may block on foreign locks without
    /// stalling the scheduler or collection handshakes.
    pub fn block_external<R>(&self, f: impl FnOnce() -> R) -> R {
        let t = Self::current();
        debug_assert!(t.is_preemption(), "blocking with preemption disabled");
        t.state.store(ThreadState::Waiting, Ordering::Release);
        t.wake_suspender();
        let core = t.release_core();
        self.dispatch_core(core);
        let r = f();
        self.acquire_core_blocking(&t);
        r
    }

    /// Block until a core is available and take it.
    pub(crate) fn acquire_core_blocking(&self, t: &Arc<Thread>) {
        t.state.store(ThreadState::Runnable, Ordering::Release);
        {
            let mut sched = self.sched.lock();
            if let Some(core) = sched.idle.pop() {
                drop(sched);
                self.grant(t, core);
            } else {
                sched.core_waiters.push_back(t.clone());
            }
        }
        t.wait_for_permit();
    }

    fn grant(&self, t: &Arc<Thread>, core: usize) {
        let mut permit = t.permit.lock();
        debug_assert!(permit.is_none(), "thread granted twice");
        *permit = Some(core);
        t.permit_cv.notify_one();
    }

    fn take_idle_core(&self) -> Option<usize> {
        self.sched.lock().idle.pop()
    }

    /// Pop the next runnable thread for `core`: local queue, then the global
    /// queue, then stealing from the other cores. The caller must own `core`
    /// (hold its token or have claimed it idle).
    fn find_work(&self, core: usize) -> Option<Arc<Thread>> {
        if let Some(t) = self.cores[core].worker.pop() {
            return Some(t);
        }
        loop {
            match self.injector.steal_batch_and_pop(&self.cores[core].worker) {
                Steal::Success(t) => return Some(t),
                Steal::Empty => break,
                Steal::Retry => continue,
            }
        }
        for (i, stealer) in self.stealers.iter().enumerate() {
            if i == core {
                continue;
            }
            loop {
                match stealer.steal_batch_and_pop(&self.cores[core].worker) {
                    Steal::Success(t) => return Some(t),
                    Steal::Empty => break,
                    Steal::Retry => continue,
                }
            }
        }
        None
    }

    /// Hand a freed core to the next runnable thread, or mark it idle. The
    /// re-check under the scheduler lock pairs with `kick_idle` so an
    /// enqueue cannot slip between "queues empty" and "core idle".
    fn dispatch_core(&self, core: usize) {
        if let Some(t) = self.find_work(core) {
            self.grant(&t, core);
            return;
        }
        let mut sched = self.sched.lock();
        if let Some(t) = sched.core_waiters.pop_front() {
            drop(sched);
            self.grant(&t, core);
            return;
        }
        if let Some(t) = self.find_work(core) {
            drop(sched);
            self.grant(&t, core);
            return;
        }
        sched.idle.push(core);
    }

    /// Pair queued work with idle cores.
    fn kick_idle(&self) {
        loop {
            let mut sched = self.sched.lock();
            let core = match sched.idle.pop() {
                Some(core) => core,
                None => return,
            };
            drop(sched);
            // The core was claimed off the idle list, so touching its worker
            // end is ours to do.
            match self.find_work(core) {
                Some(t) => self.grant(&t, core),
                None => {
                    self.sched.lock().idle.push(core);
                    return;
                }
            }
        }
    }

    pub fn acquire_waiting_thread(&self) -> *mut WaitingThread {
        let mut pool = self.wt_pool.lock();
        pool.pop()
            .unwrap_or_else(|| Box::into_raw(Box::new(WaitingThread::new())))
    }

    /// # Safety
    /// `wt` must come from `acquire_waiting_thread` of this scheduler and be
    /// unlinked from every queue.
    pub unsafe fn release_waiting_thread(&self, wt: *mut WaitingThread) {
        (*wt).ticket.store(0, Ordering::Relaxed);
        (*wt).wait_link.set(null_mut());
        (*wt).wait_tail.set(null_mut());
        *(*wt).thread.get() = None;
        *(*wt).select_done.get() = None;
        self.wt_pool.lock().push(wt);
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        for wt in self.wt_pool.get_mut().drain(..) {
            unsafe { drop(Box::from_raw(wt)) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn run_managed(
        sched: &Arc<Scheduler>,
        name: &str,
        f: impl FnOnce(Arc<Thread>) + Send + 'static,
    ) -> (Arc<Thread>, std::thread::JoinHandle<()>) {
        let t = sched.make_thread(name, 1);
        sched.all_threads.lock().push(t.clone());
        let sched2 = sched.clone();
        let t2 = t.clone();
        let handle = std::thread::spawn(move || {
            Scheduler::set_current(t2.clone());
            t2.wait_for_permit();
            f(t2.clone());
            sched2.exit_current(&t2);
        });
        sched.ready(&t);
        (t, handle)
    }

    #[test]
    fn park_and_ready_round_trip() {
        let sched = Arc::new(Scheduler::new(2));
        let turns = Arc::new(AtomicUsize::new(0));
        let turns2 = turns.clone();
        let sched2 = sched.clone();
        let (t, handle) = run_managed(&sched, "worker", move |_| {
            turns2.fetch_add(1, Ordering::SeqCst);
            sched2.park(None);
            turns2.fetch_add(1, Ordering::SeqCst);
        });
        while turns.load(Ordering::SeqCst) == 0 {
            std::thread::yield_now();
        }
        while t.state() != ThreadState::Parked {
            std::thread::yield_now();
        }
        sched.ready(&t);
        handle.join().unwrap();
        assert_eq!(turns.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn suspend_blocks_until_safepoint() {
        let sched = Arc::new(Scheduler::new(2));
        let stop = Arc::new(AtomicBool::new(false));
        let stop2 = stop.clone();
        let (t, handle) = run_managed(&sched, "worker", move |me| {
            while !stop2.load(Ordering::SeqCst) {
                me.safepoint_check();
                std::hint::spin_loop();
            }
        });
        while t.state() != ThreadState::Running {
            std::thread::yield_now();
        }
        let state = sched.suspend(&t);
        // While suspended the worker makes no progress past its poll.
        assert!(t.suspend_requested.load(Ordering::SeqCst));
        sched.resume(state);
        stop.store(true, Ordering::SeqCst);
        handle.join().unwrap();
    }

    #[test]
    fn more_threads_than_cores_all_finish() {
        let sched = Arc::new(Scheduler::new(2));
        let done = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for i in 0..8 {
            let done2 = done.clone();
            let sched2 = sched.clone();
            let (_, h) = run_managed(&sched, &format!("w{}", i), move |_| {
                for _ in 0..3 {
                    sched2.yield_now();
                }
                done2.fetch_add(1, Ordering::SeqCst);
            });
            handles.push(h);
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(done.load(Ordering::SeqCst), 8);
    }
}
