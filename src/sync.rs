//! Mutex and conditional variable, both built on the semaphore. These are
//! the primitives the collector's conductor and the managed synchronisation
//! surface run on.

use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use crate::scheduler::Scheduler;
use crate::semaphore::Semaphore;

const LOCKED: i32 = 1;
const WAITER_SHIFT: i32 = 1;
const WAITER_ONE: i32 = 1 << WAITER_SHIFT;

/// Two-state mutex: a CAS fast path, and a contended path that registers in
/// the waiter count packed into `state` and sleeps on the semaphore. LIFO
/// acquisition keeps tail latency short for barging callers.
pub struct Mutex {
    state: AtomicI32,
    semaphore: Semaphore,
}

impl Mutex {
    pub const fn new() -> Mutex {
        Mutex {
            state: AtomicI32::new(0),
            semaphore: Semaphore::new(0),
        }
    }

    pub fn lock(&self, sched: &Scheduler) {
        if self
            .state
            .compare_exchange(0, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }
        self.lock_slow(sched);
    }

    fn lock_slow(&self, sched: &Scheduler) {
        let mut registered = false;
        loop {
            let v = self.state.load(Ordering::Relaxed);
            if v & LOCKED == 0 {
                if self
                    .state
                    .compare_exchange_weak(v, v | LOCKED, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    if registered {
                        self.state.fetch_sub(WAITER_ONE, Ordering::Relaxed);
                    }
                    return;
                }
                continue;
            }
            if !registered {
                self.state.fetch_add(WAITER_ONE, Ordering::Relaxed);
                registered = true;
            }
            self.semaphore.acquire(sched, true);
            self.state.fetch_sub(WAITER_ONE, Ordering::Relaxed);
            registered = false;
        }
    }

    pub fn try_lock(&self) -> bool {
        self.state
            .compare_exchange(0, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub fn unlock(&self, sched: &Scheduler) {
        let prev = self.state.fetch_and(!LOCKED, Ordering::Release);
        debug_assert!(prev & LOCKED != 0, "unlock of unlocked mutex");
        if prev >> WAITER_SHIFT != 0 {
            self.semaphore.release(sched, true);
        }
    }
}

impl Default for Mutex {
    fn default() -> Mutex {
        Mutex::new()
    }
}

/// Conditional variable: a waiter counter in front of a semaphore. The
/// counter is what keeps a signal with no waiters from banking a wakeup.
pub struct Conditional {
    waiters: AtomicU32,
    semaphore: Semaphore,
}

impl Conditional {
    pub const fn new() -> Conditional {
        Conditional {
            waiters: AtomicU32::new(0),
            semaphore: Semaphore::new(0),
        }
    }

    /// Atomically release `mutex` and wait for a signal; relocks before
    /// returning.
    pub fn wait(&self, sched: &Scheduler, mutex: &Mutex) {
        self.waiters.fetch_add(1, Ordering::SeqCst);
        mutex.unlock(sched);
        self.semaphore.acquire(sched, false);
        mutex.lock(sched);
    }

    pub fn signal(&self, sched: &Scheduler) {
        loop {
            let w = self.waiters.load(Ordering::SeqCst);
            if w == 0 {
                return;
            }
            if self
                .waiters
                .compare_exchange_weak(w, w - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                self.semaphore.release(sched, false);
                return;
            }
        }
    }

    pub fn broadcast(&self, sched: &Scheduler) {
        loop {
            let w = self.waiters.load(Ordering::SeqCst);
            if w == 0 {
                return;
            }
            if self
                .waiters
                .compare_exchange_weak(w, 0, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                for _ in 0..w {
                    self.semaphore.release(sched, false);
                }
                return;
            }
        }
    }
}

impl Default for Conditional {
    fn default() -> Conditional {
        Conditional::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutex_fast_path() {
        let sched = Scheduler::new(1);
        let m = Mutex::new();
        assert!(m.try_lock());
        assert!(!m.try_lock());
        m.unlock(&sched);
        assert!(m.try_lock());
        m.unlock(&sched);
    }

    #[test]
    fn signal_without_waiters_is_dropped() {
        let sched = Scheduler::new(1);
        let cond = Conditional::new();
        cond.signal(&sched);
        cond.broadcast(&sched);
        // No permits banked: a later waiter must not wake spuriously off
        // these.
        assert_eq!(cond.waiters.load(Ordering::SeqCst), 0);
    }
}
