//! Cross-subsystem scenarios: allocation driving collection, the write
//! barrier preserving pre-images, semaphore ordering and handoff, waitables
//! and the exception path. Runtimes reserve the whole heap range, so the
//! tests that build one serialise on a lock.

use std::ptr::null_mut;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::frame::{Frame, FrameBuffer};
use crate::heap::Heap;
use crate::mem::{SIZE_2MB, SIZE_512MB};
use crate::object::{Object, COLOR_BLUE};
use crate::scheduler::Scheduler;
use crate::semaphore::Semaphore;
use crate::types::{ExceptionClause, MethodInfo, Type};
use crate::{Runtime, RuntimeOptions, RuntimeRef};

static SERIAL: Mutex<()> = Mutex::new(());

fn runtime(cpu_count: usize, page_budget: usize) -> RuntimeRef {
    let _ = env_logger::builder().is_test(true).try_init();
    Runtime::new(RuntimeOptions {
        cpu_count: Some(cpu_count),
        page_budget,
    })
    .expect("runtime init")
}

/// A managed node with two reference fields right after the header.
fn node_type(rt: &Runtime) -> *mut Type {
    let mut ty = Type::new("Node", rt.corelib().object_type(), 16);
    ty.managed_pointer_offsets = vec![40, 48];
    Box::into_raw(Box::new(ty))
}

const LEFT: usize = 40;
const RIGHT: usize = 48;

/// Objects the corelib roots through every cycle: the root object, the
/// empty string, the out-of-memory exception and its message.
const CORELIB_LIVE: usize = 4;

#[test]
fn allocation_oom_triggers_collection_and_retry() {
    let _serial = SERIAL.lock();
    let rt = runtime(2, 1024);
    let attached = rt.attach("test/main");
    let ty = node_type(&rt);
    let size = unsafe { (*ty).allocation_size() };

    // Keep three nodes alive on the shadow stack.
    let frame = FrameBuffer::new(null_mut(), 3);
    frame.push(attached.thread());
    for i in 0..3 {
        let obj = rt.gc_new(ty, size).expect("warm-up alloc");
        unsafe { Frame::set_object(frame.frame(), i, obj.as_ptr()) };
    }

    // Fill the rest of the budget with garbage until the heap gives up.
    let mut garbage = 0usize;
    while rt.gc_new(ty, size).is_some() {
        garbage += 1;
        assert!(garbage < 200_000, "budget never exhausted");
    }
    assert!(garbage > 0);

    rt.gc_wait();

    // Only the rooted nodes and the corelib plumbing survived.
    assert_eq!(rt.all_objects_count(), CORELIB_LIVE + 3);
    let black = rt.gc.color_black();
    rt.heap().iterate_objects(|o| unsafe {
        assert_eq!((*o).color(), black, "live object left unmarked");
    });

    // The freed slots are reusable right away.
    assert!(rt.gc_new(ty, size).is_some());
    assert_eq!(rt.all_objects_count(), CORELIB_LIVE + 4);

    drop(attached);
}

#[test]
fn consecutive_collections_preserve_live_set() {
    let _serial = SERIAL.lock();
    let rt = runtime(2, 1024);
    let attached = rt.attach("test/main");
    let ty = node_type(&rt);
    let size = unsafe { (*ty).allocation_size() };

    let frame = FrameBuffer::new(null_mut(), 2);
    frame.push(attached.thread());
    for i in 0..2 {
        let obj = rt.gc_new(ty, size).expect("alloc");
        unsafe { Frame::set_object(frame.frame(), i, obj.as_ptr()) };
    }
    // An unreachable cycle: the collector must not be fooled by the
    // mutual references.
    let a = rt.gc_new(ty, size).expect("alloc").as_ptr();
    let b = rt.gc_new(ty, size).expect("alloc").as_ptr();
    unsafe {
        rt.gc_update(a, LEFT, b);
        rt.gc_update(b, RIGHT, a);
    }

    rt.gc_wait();
    let after_first = rt.all_objects_count();
    assert_eq!(after_first, CORELIB_LIVE + 2, "cycle not collected");

    // With no mutator activity the second collection is a no-op on the
    // live set.
    rt.gc_wait();
    assert_eq!(rt.all_objects_count(), after_first);

    drop(attached);
}

#[test]
fn write_barrier_preserves_preimage() {
    let _serial = SERIAL.lock();
    let rt = runtime(2, 1024);
    let attached = rt.attach("test/driver");
    let ty = node_type(&rt);
    let size = unsafe { (*ty).allocation_size() };

    let stage = Arc::new(AtomicUsize::new(0));
    let y_cell = Arc::new(AtomicUsize::new(0));

    let rtc: Arc<Runtime> = (*rt).clone();
    let stage_w = stage.clone();
    let y_w = y_cell.clone();
    let ty_addr = ty as usize;
    let worker = rt.spawn("test/mutator", move || {
        let ty = ty_addr as *mut Type;
        let me = Scheduler::current();
        let frame = FrameBuffer::new(null_mut(), 1);
        frame.push(&me);

        let x = rtc.gc_new(ty, size).expect("alloc x").as_ptr();
        let y = rtc.gc_new(ty, size).expect("alloc y").as_ptr();
        unsafe {
            rtc.gc_update(x, LEFT, y);
            // Only x is rooted; y lives through x.left alone.
            Frame::set_object(frame.frame(), 0, x);
        }
        y_w.store(y as usize, Ordering::SeqCst);
        stage_w.store(1, Ordering::SeqCst);

        while stage_w.load(Ordering::SeqCst) < 2 {
            rtc.safepoint();
            std::thread::yield_now();
        }

        // Tracing is on and x is white: this store must log the pre-image
        // pointing at y before the null lands.
        unsafe { rtc.gc_update(x, LEFT, null_mut()) };
        stage_w.store(3, Ordering::SeqCst);

        while stage_w.load(Ordering::SeqCst) < 4 {
            rtc.safepoint();
            std::thread::yield_now();
        }
    });

    while stage.load(Ordering::SeqCst) < 1 {
        rt.scheduler().yield_now();
    }

    // Drive handshakes 1-3 from here; the worker pauses at its polls.
    let threads = rt.snapshot_threads();
    rt.initiate_collection_cycle(&threads);
    rt.harvest_roots(&threads);
    stage.store(2, Ordering::SeqCst);

    while stage.load(Ordering::SeqCst) < 3 {
        rt.scheduler().yield_now();
    }

    rt.trace_heap();
    rt.sweep_cycle(&threads);
    rt.prepare_next_collection(&threads);

    let y = y_cell.load(Ordering::SeqCst) as *mut Object;
    unsafe {
        assert_eq!(
            (*y).color(),
            rt.gc.color_black(),
            "pre-image referent was lost by the barrier"
        );
    }

    stage.store(4, Ordering::SeqCst);
    rt.join(&worker);
    drop(attached);
}

fn semaphore_wake_order(lifo: bool) -> Vec<usize> {
    let rt = runtime(2, 1024);
    let attached = rt.attach("test/main");
    let sem = Arc::new(Semaphore::new(0));
    let order = Arc::new(Mutex::new(Vec::new()));

    let mut workers = Vec::new();
    for i in 0..4 {
        let rtc: Arc<Runtime> = (*rt).clone();
        let sem2 = sem.clone();
        let order2 = order.clone();
        workers.push(rt.spawn(&format!("test/w{}", i), move || {
            sem2.acquire(rtc.scheduler(), lifo);
            order2.lock().push(i);
        }));
        // Pin the enqueue order: wait until worker i is queued.
        while sem.waiters() < (i + 1) as u32 {
            rt.scheduler().yield_now();
        }
    }

    for served in 1..=4usize {
        sem.release(rt.scheduler(), false);
        // One release wakes exactly one waiter; wait for it to finish so
        // completion order mirrors wake order.
        while order.lock().len() < served {
            rt.scheduler().yield_now();
        }
    }

    for w in workers {
        rt.join(&w);
    }
    let result = order.lock().clone();
    drop(attached);
    result
}

#[test]
fn semaphore_fifo_wakes_in_arrival_order() {
    let _serial = SERIAL.lock();
    assert_eq!(semaphore_wake_order(false), vec![0, 1, 2, 3]);
}

#[test]
fn semaphore_lifo_wakes_in_reverse_order() {
    let _serial = SERIAL.lock();
    assert_eq!(semaphore_wake_order(true), vec![3, 2, 1, 0]);
}

#[test]
fn semaphore_handoff_serves_every_waiter() {
    let _serial = SERIAL.lock();
    let rt = runtime(2, 1024);
    let attached = rt.attach("test/main");
    let sem = Arc::new(Semaphore::new(1));
    const ROUNDS: usize = 25;
    let served: Arc<Vec<AtomicUsize>> =
        Arc::new((0..5).map(|_| AtomicUsize::new(0)).collect());

    let mut workers = Vec::new();
    for i in 0..5 {
        let rtc: Arc<Runtime> = (*rt).clone();
        let sem2 = sem.clone();
        let served2 = served.clone();
        workers.push(rt.spawn(&format!("test/w{}", i), move || {
            for _ in 0..ROUNDS {
                sem2.acquire(rtc.scheduler(), false);
                served2[i].fetch_add(1, Ordering::SeqCst);
                // Direct handoff: the permit and the rest of the slice go
                // to the queue head, so nobody starves.
                sem2.release(rtc.scheduler(), true);
            }
        }));
    }

    for w in workers {
        rt.join(&w);
    }
    for (i, count) in served.iter().enumerate() {
        assert_eq!(count.load(Ordering::SeqCst), ROUNDS, "waiter {} starved", i);
    }
    drop(attached);
}

#[test]
fn barrier_write_sets_dirty_bit_once() {
    let _serial = SERIAL.lock();
    let rt = runtime(2, 1024);
    let attached = rt.attach("test/main");
    let ty = node_type(&rt);
    let size = unsafe { (*ty).allocation_size() };

    let x = rt.gc_new(ty, size).expect("alloc").as_ptr();
    let y = rt.gc_new(ty, size).expect("alloc").as_ptr();
    // Drain dirty state left behind by allocation and corelib setup.
    rt.heap().iterate_dirty_objects(|_| {});

    unsafe { rt.gc_update(x, LEFT, y) };

    let mut hits = 0;
    rt.heap().iterate_dirty_objects(|o| {
        if o == x {
            hits += 1;
        }
    });
    assert_eq!(hits, 1, "dirtied object not visited exactly once");

    let mut again = 0;
    rt.heap().iterate_dirty_objects(|o| {
        if o == x {
            again += 1;
        }
    });
    assert_eq!(again, 0, "dirty bit survived the first iteration");

    drop(attached);
}

#[test]
fn concurrent_allocations_get_distinct_slots() {
    let _serial = SERIAL.lock();
    let rt = runtime(2, 1024);
    let attached = rt.attach("test/main");
    let ty = node_type(&rt);
    let size = unsafe { (*ty).allocation_size() };
    let ty_addr = ty as usize;

    let slots: Arc<Vec<AtomicUsize>> = Arc::new((0..2).map(|_| AtomicUsize::new(0)).collect());
    let mut workers = Vec::new();
    for i in 0..2 {
        let rtc: Arc<Runtime> = (*rt).clone();
        let slots2 = slots.clone();
        workers.push(rt.spawn(&format!("test/alloc{}", i), move || {
            let ty = ty_addr as *mut Type;
            for _ in 0..64 {
                let obj = rtc.gc_new(ty, size).expect("alloc");
                // Remember one slot; mostly this hammers the lock regions.
                slots2[i].store(obj.as_ptr() as usize, Ordering::SeqCst);
            }
        }));
    }
    for w in workers {
        rt.join(&w);
    }
    let a = slots[0].load(Ordering::SeqCst);
    let b = slots[1].load(Ordering::SeqCst);
    assert_ne!(a, 0);
    assert_ne!(b, 0);
    assert_ne!(a, b);
    drop(attached);
}

#[test]
fn waitable_counted_send_and_wait() {
    let _serial = SERIAL.lock();
    let rt = runtime(2, 1024);
    let attached = rt.attach("test/main");

    let h = rt.create_waitable(2);
    assert_eq!(rt.waitable_wait(h, false), crate::waitable::WAIT_SPURIOUS);
    assert!(rt.waitable_send(h, false));
    assert!(rt.waitable_send(h, false));
    // Capacity reached.
    assert!(!rt.waitable_send(h, false));
    assert_eq!(rt.waitable_wait(h, false), crate::waitable::WAIT_RECEIVED);
    assert_eq!(rt.waitable_wait(h, false), crate::waitable::WAIT_RECEIVED);
    assert_eq!(rt.waitable_wait(h, false), crate::waitable::WAIT_SPURIOUS);

    // Closing releases waiters with the close result.
    let rtc: Arc<Runtime> = (*rt).clone();
    let result = Arc::new(AtomicUsize::new(usize::MAX));
    let result2 = result.clone();
    let waiter = rt.spawn("test/waiter", move || {
        result2.store(rtc.waitable_wait(h, true) as usize, Ordering::SeqCst);
    });
    // Let the waiter queue up before closing.
    for _ in 0..20 {
        rt.scheduler().yield_now();
    }
    rt.release_waitable(h);
    rt.join(&waiter);
    assert_eq!(
        result.load(Ordering::SeqCst),
        crate::waitable::WAIT_CLOSED as usize
    );
    assert!(!rt.waitable_send(h, false));

    drop(attached);
}

#[test]
fn waitable_blocking_receive_gets_sent_value() {
    let _serial = SERIAL.lock();
    let rt = runtime(2, 1024);
    let attached = rt.attach("test/main");
    let h = rt.create_waitable(1);

    let rtc: Arc<Runtime> = (*rt).clone();
    let done = Arc::new(AtomicUsize::new(0));
    let done2 = done.clone();
    let waiter = rt.spawn("test/rx", move || {
        let r = rtc.waitable_wait(h, true);
        done2.store(r as usize + 100, Ordering::SeqCst);
    });
    for _ in 0..20 {
        rt.scheduler().yield_now();
    }
    assert!(rt.waitable_send(h, true));
    rt.join(&waiter);
    assert_eq!(
        done.load(Ordering::SeqCst),
        crate::waitable::WAIT_RECEIVED as usize + 100
    );
    drop(attached);
}

#[test]
fn timed_wait_composes_select_with_timer() {
    let _serial = SERIAL.lock();
    let rt = runtime(2, 1024);
    let attached = rt.attach("test/main");

    // Timeout path: nothing sends on the target, the timer arm fires.
    let target = rt.create_waitable(1);
    let timer = rt.waitable_after(2_000);
    assert_eq!(rt.waitable_select2(target, timer, true), 1);

    // Ready path: the target already holds a send, ties go to it.
    assert!(rt.waitable_send(target, false));
    let timer2 = rt.waitable_after(1_000_000);
    assert_eq!(rt.waitable_select2(target, timer2, true), 0);

    rt.release_waitable(target);
    rt.release_waitable(timer);
    rt.release_waitable(timer2);
    drop(attached);
}

#[test]
fn mutex_excludes_and_conditional_signals() {
    let _serial = SERIAL.lock();
    let rt = runtime(2, 1024);
    let attached = rt.attach("test/main");

    struct Shared {
        mutex: crate::sync::Mutex,
        value: std::cell::UnsafeCell<u64>,
    }
    unsafe impl Sync for Shared {}
    unsafe impl Send for Shared {}

    let shared = Arc::new(Shared {
        mutex: crate::sync::Mutex::new(),
        value: std::cell::UnsafeCell::new(0),
    });

    let mut workers = Vec::new();
    for i in 0..4 {
        let rtc: Arc<Runtime> = (*rt).clone();
        let shared2 = shared.clone();
        workers.push(rt.spawn(&format!("test/m{}", i), move || {
            for _ in 0..500 {
                shared2.mutex.lock(rtc.scheduler());
                unsafe { *shared2.value.get() += 1 };
                shared2.mutex.unlock(rtc.scheduler());
            }
        }));
    }
    for w in workers {
        rt.join(&w);
    }
    shared.mutex.lock(rt.scheduler());
    assert_eq!(unsafe { *shared.value.get() }, 2000);
    shared.mutex.unlock(rt.scheduler());

    // Conditional: a waiter sleeps until the flag flips under the mutex.
    struct Gate {
        mutex: crate::sync::Mutex,
        cond: crate::sync::Conditional,
        ready: std::sync::atomic::AtomicBool,
    }
    let gate = Arc::new(Gate {
        mutex: crate::sync::Mutex::new(),
        cond: crate::sync::Conditional::new(),
        ready: std::sync::atomic::AtomicBool::new(false),
    });
    let rtc: Arc<Runtime> = (*rt).clone();
    let gate2 = gate.clone();
    let woke = Arc::new(AtomicUsize::new(0));
    let woke2 = woke.clone();
    let waiter = rt.spawn("test/cond", move || {
        gate2.mutex.lock(rtc.scheduler());
        while !gate2.ready.load(Ordering::SeqCst) {
            gate2.cond.wait(rtc.scheduler(), &gate2.mutex);
        }
        gate2.mutex.unlock(rtc.scheduler());
        woke2.store(1, Ordering::SeqCst);
    });
    for _ in 0..20 {
        rt.scheduler().yield_now();
    }
    gate.mutex.lock(rt.scheduler());
    gate.ready.store(true, Ordering::SeqCst);
    gate.cond.signal(rt.scheduler());
    gate.mutex.unlock(rt.scheduler());
    rt.join(&waiter);
    assert_eq!(woke.load(Ordering::SeqCst), 1);

    drop(attached);
}

#[test]
fn throw_unwinds_to_matching_clause() {
    let _serial = SERIAL.lock();
    let rt = runtime(2, 1024);
    let attached = rt.attach("test/main");
    let corelib = rt.corelib();

    // Outer method catches exceptions over its whole body at offset 64.
    let mut outer = MethodInfo::new("Outer", corelib.object_type(), 1);
    outer.clauses.push(ExceptionClause {
        try_start: 0,
        try_end: u32::MAX,
        handler: 64,
        catch_type: corelib.exception_type(),
    });
    let outer = Box::into_raw(Box::new(outer));
    let inner = Box::into_raw(Box::new(MethodInfo::new(
        "Inner",
        corelib.object_type(),
        1,
    )));

    let outer_frame = FrameBuffer::new(outer, 1);
    outer_frame.push(attached.thread());
    let inner_frame = FrameBuffer::new(inner, 1);
    inner_frame.push(attached.thread());

    let exception = rt
        .new_exception(corelib.exception_type(), "boom")
        .expect("exception alloc");
    unsafe { Frame::set_object(inner_frame.frame(), 0, exception.as_ptr()) };

    let unwind = rt.throw(exception.as_ptr());
    assert_eq!(unwind.frame, outer_frame.frame());
    assert_eq!(unwind.handler, 64);
    assert_eq!(unwind.exception, exception.as_ptr());
    // Frames above the handler are unlinked.
    assert_eq!(attached.thread().top_frame(), outer_frame.frame());
    assert_eq!(unsafe { rt.exception_message(unwind.exception) }, "boom");

    unsafe {
        drop(Box::from_raw(outer));
        drop(Box::from_raw(inner));
    }
    drop(attached);
}

#[test]
fn persistent_oom_throws_managed_exception() {
    let _serial = SERIAL.lock();
    // Small budget: corelib fits, not much else does.
    let rt = runtime(2, 128);
    let attached = rt.attach("test/main");
    let corelib = rt.corelib();
    let ty = node_type(&rt);

    // Root everything we allocate so collection cannot help.
    const SLOTS: usize = 8192;
    let mut main = MethodInfo::new("Main", corelib.object_type(), SLOTS);
    main.clauses.push(ExceptionClause {
        try_start: 0,
        try_end: u32::MAX,
        handler: 8,
        catch_type: corelib.exception_type(),
    });
    let main = Box::into_raw(Box::new(main));
    let frame = FrameBuffer::new(main, SLOTS);
    frame.push(attached.thread());

    let mut slot = 0usize;
    let unwind = loop {
        match rt.new_object(ty) {
            Ok(obj) => {
                assert!(slot < SLOTS, "budget outlived the frame");
                unsafe { Frame::set_object(frame.frame(), slot, obj.as_ptr()) };
                slot += 1;
            }
            Err(unwind) => break unwind,
        }
    };
    assert!(slot > 0, "nothing allocated before the OOM");

    assert_eq!(unwind.handler, 8);
    unsafe {
        assert_eq!(
            (*unwind.exception).ty(),
            corelib.oom_type(),
            "expected the preallocated out-of-memory exception"
        );
    }

    unsafe { drop(Box::from_raw(main)) };
    drop(attached);
}

#[test]
fn internal_calls_resolve_by_name() {
    let _serial = SERIAL.lock();
    let rt = runtime(2, 1024);
    let attached = rt.attach("test/main");
    let corelib = rt.corelib();

    let create = corelib
        .resolve_internal_call("CreateWaitable")
        .expect("CreateWaitable binding");
    let send = corelib
        .resolve_internal_call("WaitableSend")
        .expect("WaitableSend binding");
    let wait = corelib
        .resolve_internal_call("WaitableWait")
        .expect("WaitableWait binding");
    let release = corelib
        .resolve_internal_call("ReleaseWaitable")
        .expect("ReleaseWaitable binding");
    assert_eq!(
        corelib.resolve_internal_call("NoSuchImport").err(),
        Some(crate::Error::NotFound)
    );

    let rtc: Arc<Runtime> = (*rt).clone();
    let handle = create(&rtc, &[1]);
    assert_eq!(send(&rtc, &[handle, 0]), 1);
    assert_eq!(wait(&rtc, &[handle, 0]), crate::waitable::WAIT_RECEIVED as u64);
    release(&rtc, &[handle]);

    drop(attached);
}

#[test]
fn strings_round_trip_and_append() {
    let _serial = SERIAL.lock();
    let rt = runtime(2, 1024);
    let attached = rt.attach("test/main");

    let s = rt.new_string("kernel/gc").expect("string alloc");
    unsafe {
        assert_eq!(rt.string_value(s.as_ptr()), "kernel/gc");
        let appended = rt
            .string_append_str(s.as_ptr(), ": going to sleep")
            .expect("append alloc");
        assert_eq!(rt.string_value(appended.as_ptr()), "kernel/gc: going to sleep");
        // The original is a fresh copy away, untouched.
        assert_eq!(rt.string_value(s.as_ptr()), "kernel/gc");
    }
    drop(attached);
}

#[test]
fn largest_size_class_boundary() {
    let _serial = SERIAL.lock();
    // Standalone heap: the budget is accounting, the pages are untouched
    // until written.
    let heap = Heap::new(2, 140_000).expect("heap init");
    let obj = heap.alloc(SIZE_512MB, 1).expect("512MiB slot");
    let off = obj.as_ptr() as usize - heap.base();
    assert_eq!(off / crate::mem::SIZE_512GB, 25);
    assert_eq!(
        heap.find(obj.as_ptr() as usize + SIZE_512MB - SIZE_2MB),
        Some(obj)
    );
    assert!(heap.alloc(SIZE_512MB + 1, 1).is_none());
    unsafe { obj.as_ref().set_color(COLOR_BLUE) };
}
