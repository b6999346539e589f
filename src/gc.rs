//! The on-the-fly collector: concurrent mark-and-sweep in the
//! Doligez/Gonzalez/Piquer style. Mutators never stop together; instead the
//! collector walks them one by one through four suspend-publish-resume
//! handshakes:
//!
//! 1. snoop on — new reference writes enter per-thread snooped sets
//! 2. trace on — the write barrier starts capturing pre-image snapshots
//! 3. colour flip + harvest — allocation colour becomes the new black,
//!    snooped sets, runtime globals and every mutator shadow stack seed the
//!    root set
//! 4. trace off — after marking, the barrier goes quiet again
//!
//! Between 3 and the mark, a live pre-existing object is reachable from a
//! harvested root, from another live object, or through a log snapshot whose
//! captured fields are traversed instead of the live ones. Objects allocated
//! after 3 are born black and stay out of this cycle entirely.

use std::ptr::{null_mut, NonNull};
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashSet;

use crate::frame::Frame;
use crate::object::{read_ref_field, write_ref_field, Object, COLOR_A, COLOR_B, COLOR_BLUE};
use crate::scheduler::{Scheduler, Thread};
use crate::sync::{Conditional, Mutex as GcMutex};
use crate::types::Type;
use crate::Runtime;

const LOG_CHUNK: usize = 256;

struct LogChunk {
    slots: Box<[*mut Object]>,
    used: usize,
}

/// Per-thread pre-image buffer. Records are `[object, len, values..]` and
/// published log pointers point at the values, so chunks must never move:
/// the buffer grows by whole chunks and recycles nothing until `clear`.
pub struct LogBuffer {
    chunks: Vec<LogChunk>,
}

unsafe impl Send for LogBuffer {}

impl Default for LogBuffer {
    fn default() -> LogBuffer {
        LogBuffer::new()
    }
}

impl LogBuffer {
    pub fn new() -> LogBuffer {
        LogBuffer { chunks: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.iter().all(|c| c.used == 0)
    }

    /// Reserve a record for `o` with `n` value slots and return the pointer
    /// to the (uninitialised) values.
    pub fn reserve(&mut self, o: *mut Object, n: usize) -> *mut *mut Object {
        let need = n + 2;
        let fits = self
            .chunks
            .last()
            .map_or(false, |c| c.slots.len() - c.used >= need);
        if !fits {
            let cap = LOG_CHUNK.max(need);
            self.chunks.push(LogChunk {
                slots: vec![null_mut(); cap].into_boxed_slice(),
                used: 0,
            });
        }
        let chunk = self.chunks.last_mut().expect("chunk just pushed");
        let start = chunk.used;
        chunk.slots[start] = o;
        chunk.slots[start + 1] = n as *mut Object;
        chunk.used += need;
        unsafe { chunk.slots.as_mut_ptr().add(start + 2) }
    }

    /// Roll back the record just reserved; the publish lost the race.
    pub fn unreserve(&mut self, n: usize) {
        let chunk = self.chunks.last_mut().expect("unreserve without reserve");
        chunk.used -= n + 2;
    }

    /// Visit the logged object of every record.
    pub fn for_each_object(&self, mut f: impl FnMut(*mut Object)) {
        for chunk in &self.chunks {
            let mut i = 0;
            while i < chunk.used {
                let o = chunk.slots[i];
                let n = chunk.slots[i + 1] as usize;
                f(o);
                i += n + 2;
            }
        }
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
    }
}

struct RetiredLocals {
    logs: Vec<LogBuffer>,
    snooped: Vec<FxHashSet<usize>>,
}

pub(crate) struct Conductor {
    pub running: AtomicBool,
    pub shutdown: AtomicBool,
    pub mutex: GcMutex,
    pub wake: Conditional,
    pub done: Conditional,
}

pub(crate) struct GcGlobals {
    all_objects: AtomicPtr<Object>,
    color_black: AtomicU8,
    color_white: AtomicU8,
    roots: Mutex<FxHashSet<usize>>,
    retired: Mutex<RetiredLocals>,
    pub(crate) conductor: Conductor,
}

impl GcGlobals {
    pub(crate) fn new() -> GcGlobals {
        GcGlobals {
            all_objects: AtomicPtr::new(null_mut()),
            color_black: AtomicU8::new(COLOR_A),
            color_white: AtomicU8::new(COLOR_B),
            roots: Mutex::new(FxHashSet::default()),
            retired: Mutex::new(RetiredLocals {
                logs: Vec::new(),
                snooped: Vec::new(),
            }),
            conductor: Conductor {
                // Starts true: bring-up waits for the collector thread's
                // first gc_done broadcast, so no later wake can race its
                // startup.
                running: AtomicBool::new(true),
                shutdown: AtomicBool::new(false),
                mutex: GcMutex::new(),
                wake: Conditional::new(),
                done: Conditional::new(),
            },
        }
    }

    pub(crate) fn color_black(&self) -> u8 {
        self.color_black.load(Ordering::Relaxed)
    }

    pub(crate) fn color_white(&self) -> u8 {
        self.color_white.load(Ordering::Relaxed)
    }
}

impl Runtime {
    /// Allocate a managed object of `size` bytes (header included), born in
    /// the caller's allocation colour and linked into the all-objects list.
    /// Null means the heap wants a collection.
    pub fn gc_new(&self, ty: *mut Type, size: usize) -> Option<NonNull<Object>> {
        // Allocation is a safepoint.
        self.scheduler.safepoint();
        let thread = Scheduler::current();
        thread.preempt_disable();

        let color = thread.gc_local_data.alloc_color.load(Ordering::Relaxed);
        let obj = match self.heap.alloc(size, color) {
            Some(obj) => obj,
            None => {
                thread.preempt_enable();
                return None;
            }
        };

        unsafe {
            let o = obj.as_ptr();
            // The slot may be recycled from a swept object: scrub the
            // payload and the stale header links before publishing.
            let slot_size = crate::heap::Heap::pool_object_size((*o).rank() as usize);
            std::ptr::write_bytes(
                (o as *mut u8).add(crate::object::HEADER_SIZE),
                0,
                slot_size - crate::object::HEADER_SIZE,
            );
            (*o).set_ty(ty);
            (*o).clear_log_pointer();
            (*o).set_chunk_next(null_mut());

            // Push onto the all-objects list.
            let mut head = self.gc.all_objects.load(Ordering::Relaxed);
            loop {
                (*o).set_next(head);
                match self.gc.all_objects.compare_exchange_weak(
                    head,
                    o,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(now) => head = now,
                }
            }
        }

        thread.preempt_enable();
        Some(obj)
    }

    /// The write barrier: every store of a managed reference goes through
    /// here. While tracing is on, the first write to a white object captures
    /// a snapshot of its managed-pointer fields before the store; while
    /// snooping is on, the new referent is recorded as a tentative root.
    ///
    /// # Safety
    /// `o` must be a live object and `offset` one of its type's managed
    /// pointer offsets.
    pub unsafe fn gc_update(&self, o: *mut Object, offset: usize, new: *mut Object) {
        let thread = Scheduler::current();
        thread.preempt_disable();
        let gcl = &thread.gc_local_data;

        if gcl.trace_on.load(Ordering::Relaxed)
            && (*o).color() == self.gc.color_white()
            && (*o).log_pointer().is_null()
        {
            let offsets = &(*(*o).ty()).managed_pointer_offsets;
            let log = gcl.log_mut();
            let values = log.reserve(o, offsets.len());
            for (i, &field_off) in offsets.iter().enumerate() {
                *values.add(i) = read_ref_field(o, field_off);
            }
            // Double-checked publish: another mutator may have captured the
            // snapshot first, in which case ours is rolled back unpublished.
            if !(*o).publish_log_pointer(values) {
                log.unreserve(offsets.len());
            }
        }

        write_ref_field(o, offset, new);
        self.heap.mark_dirty(o as usize + offset);

        if gcl.snoop.load(Ordering::Relaxed) && !new.is_null() {
            gcl.snooped_mut().insert(new as usize);
        }

        thread.preempt_enable();
    }

    /// Threads participating in this cycle. Latched once at cycle start;
    /// threads created later allocate black and are left alone.
    pub(crate) fn snapshot_threads(&self) -> Vec<Arc<Thread>> {
        let current = Scheduler::try_current();
        self.scheduler
            .lock_all_threads()
            .iter()
            .filter(|t| current.as_ref().map_or(true, |c| !Arc::ptr_eq(c, t)))
            .cloned()
            .collect()
    }

    /// Suspend every snapshot thread in turn at a safepoint, run `f` on it,
    /// resume. The all-threads lock is held for the duration of the
    /// iteration.
    fn handshake(&self, threads: &[Arc<Thread>], mut f: impl FnMut(&Arc<Thread>)) {
        let _guard = self.scheduler.lock_all_threads();
        for t in threads {
            if t.state() == crate::scheduler::ThreadState::Dead {
                continue;
            }
            let state = self.scheduler.suspend(t);
            f(t);
            self.scheduler.resume(state);
        }
    }

    /// Handshakes 1 and 2: snoop on, then trace on. The gap between them
    /// leaves room for threads to be created against the old flags.
    pub(crate) fn initiate_collection_cycle(&self, threads: &[Arc<Thread>]) {
        self.handshake(threads, |t| {
            t.gc_local_data.snoop.store(true, Ordering::Relaxed);
        });
        self.handshake(threads, |t| {
            t.gc_local_data.trace_on.store(true, Ordering::Relaxed);
        });
    }

    /// Handshake 3: flip the colours, re-colour every mutator's allocations
    /// black, stop snooping, and seed the root set from the snooped sets,
    /// the shadow stacks and the runtime globals.
    pub(crate) fn harvest_roots(&self, threads: &[Arc<Thread>]) {
        // Single writer: every mutator is paused between the flag writes.
        let black = self.gc.color_black.load(Ordering::Relaxed);
        let white = self.gc.color_white.load(Ordering::Relaxed);
        self.gc.color_black.store(white, Ordering::Relaxed);
        self.gc.color_white.store(black, Ordering::Relaxed);
        let black = white;

        self.handshake(threads, |t| {
            t.gc_local_data.alloc_color.store(black, Ordering::Relaxed);
            t.gc_local_data.snoop.store(false, Ordering::Relaxed);
        });

        let mut roots = self.gc.roots.lock();
        self.handshake(threads, |t| {
            // Drain the snooped set.
            let snooped = unsafe { t.gc_local_data.snooped_mut() };
            for &o in snooped.iter() {
                roots.insert(o);
            }
            snooped.clear();
            // Thread-local state: every object rooted on the shadow stack.
            let mut frame = t.top_frame();
            while !frame.is_null() {
                unsafe {
                    for i in 0..(*frame).object_count as usize {
                        let slot = *Frame::object_slot(frame, i);
                        if let Some(obj) = self.heap.find(slot as usize) {
                            roots.insert(obj.as_ptr() as usize);
                        }
                    }
                    frame = (*frame).prev;
                }
            }
        });

        // Sets retired by threads that exited since the snoop started.
        let mut retired = self.gc.retired.lock();
        for set in retired.snooped.drain(..) {
            for o in set {
                roots.insert(o);
            }
        }
        drop(retired);

        // Runtime globals.
        if let Some(root) = self.corelib.root() {
            roots.insert(root.as_ptr() as usize);
        }
    }

    /// Mark everything reachable from the harvested roots. A white object
    /// with a published log pointer is traversed through its snapshot, not
    /// its live fields.
    pub(crate) fn trace_heap(&self) {
        let mut mark_stack: Vec<*mut Object> = self
            .gc
            .roots
            .lock()
            .iter()
            .map(|&o| o as *mut Object)
            .collect();

        while let Some(o) = mark_stack.pop() {
            unsafe { self.trace(o, &mut mark_stack) };
        }
    }

    unsafe fn trace(&self, o: *mut Object, mark_stack: &mut Vec<*mut Object>) {
        if (*o).color() != self.gc.color_white() {
            return;
        }
        let offsets = &(*(*o).ty()).managed_pointer_offsets;

        let log = (*o).log_pointer();
        if log.is_null() {
            // Replica of the live fields, re-checked against a snapshot
            // published while we were reading.
            let replica: Vec<*mut Object> = offsets
                .iter()
                .map(|&off| read_ref_field(o, off))
                .collect();
            let log = (*o).log_pointer();
            if log.is_null() {
                for referent in replica {
                    if !referent.is_null() {
                        debug_assert_ne!((*referent).color(), COLOR_BLUE);
                        mark_stack.push(referent);
                    }
                }
            } else {
                self.push_log_snapshot(log, offsets.len(), mark_stack);
            }
        } else {
            self.push_log_snapshot(log, offsets.len(), mark_stack);
        }

        (*o).set_color(self.gc.color_black());
    }

    unsafe fn push_log_snapshot(
        &self,
        log: *mut *mut Object,
        count: usize,
        mark_stack: &mut Vec<*mut Object>,
    ) {
        for i in 0..count {
            let referent = *log.add(i);
            if !referent.is_null() {
                mark_stack.push(referent);
            }
        }
    }

    /// Handshake 4 and the sweep: stop tracing, then excise every
    /// still-white node from the all-objects list and return its slot to the
    /// heap by recolouring it blue. The all-threads lock is held to
    /// serialise with thread creation only.
    pub(crate) fn sweep_cycle(&self, threads: &[Arc<Thread>]) {
        self.handshake(threads, |t| {
            t.gc_local_data.trace_on.store(false, Ordering::Relaxed);
        });

        let _guard = self.scheduler.lock_all_threads();
        let white = self.gc.color_white();

        let mut last: *mut Object = null_mut();
        let mut swept = self.gc.all_objects.load(Ordering::Relaxed);
        unsafe {
            while !swept.is_null() {
                let next = (*swept).next();
                if (*swept).color() == white {
                    if last.is_null() {
                        // Removing the head races with concurrent pushes.
                        match self.gc.all_objects.compare_exchange(
                            swept,
                            next,
                            Ordering::Relaxed,
                            Ordering::Relaxed,
                        ) {
                            Ok(_) => {}
                            Err(new_head) => {
                                // Newer objects were pushed; walk down from
                                // the new head to the node in hand and
                                // unlink it there.
                                let mut cursor = new_head;
                                while (*cursor).next() != swept {
                                    cursor = (*cursor).next();
                                }
                                (*cursor).set_next(next);
                                last = cursor;
                            }
                        }
                    } else {
                        (*last).set_next(next);
                    }
                    // A real finaliser queue would take the object here;
                    // finalisation is a no-op, so the slot goes straight
                    // back to the heap.
                    log::trace!("gc: freed {:p}", swept);
                    (*swept).set_color(COLOR_BLUE);
                } else {
                    last = swept;
                }
                swept = next;
            }
        }
    }

    /// Clear every published log pointer and reset the per-thread buffers
    /// and the root set for the next cycle.
    pub(crate) fn prepare_next_collection(&self, threads: &[Arc<Thread>]) {
        self.gc.roots.lock().clear();

        self.handshake(threads, |t| unsafe {
            let log = t.gc_local_data.log_mut();
            log.for_each_object(|o| (*o).clear_log_pointer());
            log.clear();
        });

        let mut retired = self.gc.retired.lock();
        for log in retired.logs.drain(..) {
            log.for_each_object(|o| unsafe { (*o).clear_log_pointer() });
        }
        retired.snooped.clear();
    }

    pub(crate) fn gc_collection_cycle(&self) {
        log::trace!("gc: starting collection");
        let threads = self.snapshot_threads();
        self.initiate_collection_cycle(&threads);
        self.harvest_roots(&threads);
        self.trace_heap();
        self.sweep_cycle(&threads);
        self.prepare_next_collection(&threads);
        log::trace!("gc: collection done");
    }

    /// Body of the dedicated collector thread: park on the conductor until a
    /// request arrives, collect, repeat.
    pub(crate) fn gc_thread_main(&self) {
        log::trace!("gc: GC thread started");
        let sched = &self.scheduler;
        let c = &self.gc.conductor;
        loop {
            log::trace!("gc: going to sleep");
            c.mutex.lock(sched);
            c.running.store(false, Ordering::SeqCst);
            c.done.broadcast(sched);
            while !c.running.load(Ordering::SeqCst) {
                c.wake.wait(sched, &c.mutex);
            }
            c.mutex.unlock(sched);

            if c.shutdown.load(Ordering::SeqCst) {
                return;
            }
            self.gc_collection_cycle();
        }
    }

    pub(crate) fn conductor_wake_locked(&self) {
        let c = &self.gc.conductor;
        // Idempotent: if the collector is already running or requested,
        // there is nothing to signal.
        if !c.running.swap(true, Ordering::SeqCst) {
            c.wake.signal(&self.scheduler);
        }
    }

    /// Request a collection without waiting for it.
    pub fn gc_wake(&self) {
        let c = &self.gc.conductor;
        c.mutex.lock(&self.scheduler);
        self.conductor_wake_locked();
        c.mutex.unlock(&self.scheduler);
    }

    /// Request a collection and block until the cycle completes.
    pub fn gc_wait(&self) {
        let c = &self.gc.conductor;
        c.mutex.lock(&self.scheduler);
        self.conductor_wake_locked();
        while c.running.load(Ordering::SeqCst) {
            c.done.wait(&self.scheduler, &c.mutex);
        }
        c.mutex.unlock(&self.scheduler);
    }

    /// Retire the calling thread's collector-visible state so published log
    /// pointers and snooped roots survive until the cycle that owns them
    /// finishes. Must run before the thread leaves the running state for
    /// good.
    pub(crate) fn retire_thread_local(&self, t: &Thread) {
        let log = std::mem::take(unsafe { t.gc_local_data.log_mut() });
        let snooped = std::mem::take(unsafe { t.gc_local_data.snooped_mut() });
        if log.is_empty() && snooped.is_empty() {
            return;
        }
        let mut retired = self.gc.retired.lock();
        if !log.is_empty() {
            retired.logs.push(log);
        }
        if !snooped.is_empty() {
            retired.snooped.push(snooped);
        }
    }

    /// Walk the all-objects list. Only meaningful while no sweep is racing.
    pub(crate) fn all_objects_count(&self) -> usize {
        let mut count = 0;
        let mut cursor = self.gc.all_objects.load(Ordering::Relaxed);
        while !cursor.is_null() {
            count += 1;
            cursor = unsafe { (*cursor).next() };
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_buffer_records_are_stable() {
        let mut log = LogBuffer::new();
        let o1 = 0x1000 as *mut Object;
        let o2 = 0x2000 as *mut Object;
        let v1 = log.reserve(o1, 2);
        unsafe {
            *v1 = 0xa as *mut Object;
            *v1.add(1) = 0xb as *mut Object;
        }
        // A large record forces a fresh chunk without moving the first.
        let v2 = log.reserve(o2, LOG_CHUNK);
        unsafe {
            *v2 = 0xc as *mut Object;
            assert_eq!(*v1, 0xa as *mut Object);
            assert_eq!(*v1.add(1), 0xb as *mut Object);
        }
        let mut seen = Vec::new();
        log.for_each_object(|o| seen.push(o));
        assert_eq!(seen, vec![o1, o2]);
    }

    #[test]
    fn log_buffer_unreserve_rolls_back() {
        let mut log = LogBuffer::new();
        let o = 0x1000 as *mut Object;
        let _ = log.reserve(o, 3);
        log.unreserve(3);
        assert!(log.is_empty());
        let mut seen = 0;
        log.for_each_object(|_| seen += 1);
        assert_eq!(seen, 0);
    }
}
