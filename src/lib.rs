//! Pentagon runtime core, hosted: the managed-object heap over a reserved
//! virtual range, the on-the-fly mark-and-sweep collector, and the
//! cooperative core-token scheduler with the Go-style semaphore under every
//! synchronisation primitive.
//!
//! A [`Runtime`] owns all three plus the waitable surface and the corelib
//! descriptors. Managed threads are spawned or attached through it; jitted
//! code would consume the same entry points the tests do: `gc_new`,
//! `gc_update`, `set_top_frame`, `throw` and the waitable internal calls.

pub mod corelib;
pub mod frame;
pub mod gc;
pub mod heap;
pub mod mem;
pub mod object;
pub mod page_table;
pub mod scheduler;
pub mod semaphore;
pub mod sync;
pub mod types;
pub mod utils;
pub mod waitable;

#[cfg(test)]
mod tests;

use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use corelib::Corelib;
use frame::Unwind;
use gc::GcGlobals;
use heap::Heap;
use object::Object;
use scheduler::{Scheduler, Thread};
use types::Type;
use waitable::{Timer, WaitableTable};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// No physical pages or directory pages left.
    OutOfResources,
    /// The request can never be satisfied (e.g. past the largest size
    /// class).
    InvalidArgument,
    /// Metadata token or name did not resolve.
    NotFound,
    /// A jitted-code sanity check failed.
    RangeViolation,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::OutOfResources => write!(f, "out of resources"),
            Error::InvalidArgument => write!(f, "invalid argument"),
            Error::NotFound => write!(f, "not found"),
            Error::RangeViolation => write!(f, "range violation"),
        }
    }
}

impl std::error::Error for Error {}

pub struct RuntimeOptions {
    /// Virtual cores; also the heap's lock-region count per pool. Defaults
    /// to the machine's logical CPU count.
    pub cpu_count: Option<usize>,
    /// Physical page budget (4 KiB units) shared by heap backing and
    /// page-table directories.
    pub page_budget: usize,
}

impl Default for RuntimeOptions {
    fn default() -> RuntimeOptions {
        RuntimeOptions {
            cpu_count: None,
            page_budget: 16 * 1024,
        }
    }
}

pub struct Runtime {
    pub(crate) heap: Heap,
    pub(crate) scheduler: Scheduler,
    pub(crate) gc: GcGlobals,
    pub(crate) timer: Timer,
    pub(crate) waitables: WaitableTable,
    pub(crate) corelib: Corelib,
}

impl Runtime {
    /// Bring the runtime up: heap, scheduler, the dedicated collector
    /// thread, the timer poller and the corelib root.
    pub fn new(options: RuntimeOptions) -> Result<RuntimeRef, Error> {
        let cpu_count = options
            .cpu_count
            .unwrap_or_else(num_cpus::get)
            .clamp(1, 511);
        let heap = Heap::new(cpu_count, options.page_budget)?;

        let rt = Arc::new(Runtime {
            heap,
            scheduler: Scheduler::new(cpu_count),
            gc: GcGlobals::new(),
            timer: Timer::new(),
            waitables: WaitableTable::new(),
            corelib: Corelib::new(),
        });

        let gc_thread = rt.spawn("kernel/gc", {
            let rt = rt.clone();
            move || rt.gc_thread_main()
        });

        let timer_thread = std::thread::Builder::new()
            .name("kernel/poller".to_owned())
            .spawn({
                let rt = rt.clone();
                move || rt.timer.run(&rt.scheduler)
            })
            .expect("spawning the poller thread");

        {
            let _attached = rt.attach("kernel/init");
            rt.corelib.init(&rt)?;
            // Wait for the collector to reach its conductor: requests made
            // before it parks would otherwise be lost to its startup.
            let c = &rt.gc.conductor;
            c.mutex.lock(&rt.scheduler);
            while c.running.load(Ordering::SeqCst) {
                c.done.wait(&rt.scheduler, &c.mutex);
            }
            c.mutex.unlock(&rt.scheduler);
        }

        Ok(RuntimeRef {
            inner: rt,
            gc_thread,
            timer_thread: Some(timer_thread),
        })
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn corelib(&self) -> &Corelib {
        &self.corelib
    }

    /// Spawn a managed thread. It becomes visible to collection handshakes
    /// before it first runs and leaves the all-threads list when it exits.
    pub fn spawn(
        self: &Arc<Self>,
        name: &str,
        f: impl FnOnce() + Send + 'static,
    ) -> Arc<Thread> {
        let t = self.scheduler.make_thread(name, self.gc.color_black());
        self.scheduler.register(t.clone());
        let rt = self.clone();
        let thread = t.clone();
        std::thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                rt.scheduler.enter_thread(&thread);
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f));
                // Running -> Dead directly: the retire below must not race
                // a handshake reading this thread's collector state.
                rt.retire_thread_local(&thread);
                rt.scheduler.exit_current(&thread);
                if let Err(payload) = result {
                    std::panic::resume_unwind(payload);
                }
            })
            .expect("spawning a managed thread");
        self.scheduler.ready(&t);
        t
    }

    /// Make the calling OS thread managed until the guard drops. The way
    /// into the runtime for main and for tests.
    pub fn attach(self: &Arc<Self>, name: &str) -> AttachGuard {
        let t = self.scheduler.make_thread(name, self.gc.color_black());
        self.scheduler.register(t.clone());
        self.scheduler.attach_current(&t);
        AttachGuard {
            runtime: self.clone(),
            thread: t,
        }
    }

    /// Wait for a managed thread to finish.
    pub fn join(&self, t: &Arc<Thread>) {
        self.scheduler.join(t);
    }

    /// Allocate a managed instance of `ty`, turning allocation failure into
    /// a synchronous collection and retry; a persistent failure throws the
    /// managed out-of-memory exception.
    pub fn new_object(&self, ty: *mut Type) -> Result<NonNull<Object>, Unwind> {
        let size = unsafe { (*ty).allocation_size() };
        if let Some(obj) = self.gc_new(ty, size) {
            return Ok(obj);
        }
        self.gc_wait();
        if let Some(obj) = self.gc_new(ty, size) {
            return Ok(obj);
        }
        log::warn!("gc: allocation of {} failed after collection", unsafe {
            &(*ty).name
        });
        Err(self.throw(self.corelib.oom_exception()))
    }

    /// Resolve a pointer to the object whose slot contains it.
    pub fn find(&self, ptr: usize) -> Option<NonNull<Object>> {
        self.heap.find(ptr)
    }

    /// Explicit safepoint poll, as jitted code emits at function entries and
    /// backward branches.
    pub fn safepoint(&self) {
        self.scheduler.safepoint();
    }
}

/// Owning handle for a runtime: dropping it shuts the collector and the
/// poller down. Managed threads still running keep the runtime memory alive
/// until they exit.
pub struct RuntimeRef {
    inner: Arc<Runtime>,
    gc_thread: Arc<Thread>,
    timer_thread: Option<std::thread::JoinHandle<()>>,
}

impl std::ops::Deref for RuntimeRef {
    type Target = Arc<Runtime>;

    fn deref(&self) -> &Arc<Runtime> {
        &self.inner
    }
}

impl Drop for RuntimeRef {
    fn drop(&mut self) {
        {
            let _attached = self.inner.attach("kernel/shutdown");
            let c = &self.inner.gc.conductor;
            c.mutex.lock(&self.inner.scheduler);
            c.shutdown.store(true, Ordering::SeqCst);
            self.inner.conductor_wake_locked();
            c.mutex.unlock(&self.inner.scheduler);
        }
        self.inner.scheduler.join(&self.gc_thread);
        self.inner.timer.shutdown();
        if let Some(handle) = self.timer_thread.take() {
            let _ = handle.join();
        }
    }
}

/// Detaches on drop: the thread leaves the all-threads list and gives its
/// core back.
pub struct AttachGuard {
    runtime: Arc<Runtime>,
    thread: Arc<Thread>,
}

impl AttachGuard {
    pub fn thread(&self) -> &Arc<Thread> {
        &self.thread
    }
}

impl Drop for AttachGuard {
    fn drop(&mut self) {
        self.runtime.retire_thread_local(&self.thread);
        self.runtime.scheduler.exit_current(&self.thread);
    }
}
