//! A reader-writer lock implementation.

use ksched::{Discipline, WaitOutcome, WaitQueue, global};
use kspin::SpinNoIrq;

use crate::{current_task, finish_wait};

struct RwState {
    readers: u32,
    writer: bool,
}

/// A [`lock_api::RawRwLock`] implementation.
///
/// Readers share the lock while no writer holds it; a writer waits for
/// the reader count to drain. Hand-over is direct: a leaving writer wakes
/// every queued reader (their count is credited before they run), and the
/// last leaving reader wakes one queued writer with the write flag
/// already set.
pub struct RawRwLock {
    state: SpinNoIrq<RwState>,
    readers_wq: SpinNoIrq<Option<WaitQueue>>,
    writers_wq: SpinNoIrq<Option<WaitQueue>>,
}

impl RawRwLock {
    /// Creates a new unlocked [`RawRwLock`].
    pub const fn new() -> Self {
        Self {
            state: SpinNoIrq::new(RwState {
                readers: 0,
                writer: false,
            }),
            readers_wq: SpinNoIrq::new(None),
            writers_wq: SpinNoIrq::new(None),
        }
    }

    fn readers_wq(&self) -> WaitQueue {
        self.readers_wq
            .lock()
            .get_or_insert_with(|| WaitQueue::new(Discipline::Fifo))
            .clone()
    }

    fn writers_wq(&self) -> WaitQueue {
        self.writers_wq
            .lock()
            .get_or_insert_with(|| WaitQueue::new(Discipline::Priority))
            .clone()
    }
}

impl Default for RawRwLock {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl lock_api::RawRwLock for RawRwLock {
    type GuardMarker = lock_api::GuardSend;

    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = RawRwLock::new();

    #[inline]
    fn lock_shared(&self) {
        let kernel = global();
        let guard = kernel.dispatch_guard();
        let mut state = self.state.lock();
        if !state.writer {
            state.readers += 1;
            return;
        }
        let task = current_task();
        let wq = self.readers_wq();
        wq.enqueue(kernel, &task, None);
        drop(state);
        drop(guard);
        kernel.suspend(&task);
        // The leaving writer already counted us in.
        if finish_wait(&task).is_err() {
            panic!("reader wait interrupted");
        }
    }

    #[inline]
    fn try_lock_shared(&self) -> bool {
        let mut state = self.state.lock();
        if state.writer {
            return false;
        }
        state.readers += 1;
        true
    }

    #[inline]
    unsafe fn unlock_shared(&self) {
        let kernel = global();
        let _guard = kernel.dispatch_guard();
        let mut state = self.state.lock();
        state.readers -= 1;
        if state.readers == 0 && !state.writer {
            // Hand the lock to one queued writer.
            if self.writers_wq().extract_one(kernel).is_some() {
                state.writer = true;
            }
        }
    }

    #[inline]
    fn lock_exclusive(&self) {
        let kernel = global();
        let guard = kernel.dispatch_guard();
        let mut state = self.state.lock();
        if !state.writer && state.readers == 0 {
            state.writer = true;
            return;
        }
        let task = current_task();
        let wq = self.writers_wq();
        wq.enqueue(kernel, &task, None);
        drop(state);
        drop(guard);
        kernel.suspend(&task);
        // The write flag was set on hand-over.
        if finish_wait(&task).is_err() {
            panic!("writer wait interrupted");
        }
    }

    #[inline]
    fn try_lock_exclusive(&self) -> bool {
        let mut state = self.state.lock();
        if state.writer || state.readers != 0 {
            return false;
        }
        state.writer = true;
        true
    }

    #[inline]
    unsafe fn unlock_exclusive(&self) {
        let kernel = global();
        let _guard = kernel.dispatch_guard();
        let mut state = self.state.lock();
        state.writer = false;
        // Credit every queued reader before any of them runs; if none,
        // hand over to the next writer.
        let woken = self.readers_wq().extract_all(kernel, WaitOutcome::Satisfied);
        if woken > 0 {
            state.readers += woken as u32;
        } else if self.writers_wq().extract_one(kernel).is_some() {
            state.writer = true;
        }
    }
}

/// A reader-writer lock.
pub type RwLock<T> = lock_api::RwLock<RawRwLock, T>;
/// A read guard for a [`RwLock`].
pub type RwLockReadGuard<'a, T> = lock_api::RwLockReadGuard<'a, RawRwLock, T>;
/// A write guard for a [`RwLock`].
pub type RwLockWriteGuard<'a, T> = lock_api::RwLockWriteGuard<'a, RawRwLock, T>;
