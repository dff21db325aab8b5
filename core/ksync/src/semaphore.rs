//! A counting semaphore implementation.

use ksched::{Discipline, WaitOutcome, WaitQueue, global};
use kspin::SpinNoIrq;

use crate::{SyncError, SyncResult, Wait, current_task, finish_wait};

/// A counting semaphore.
///
/// `obtain` takes a unit of the resource or blocks until one is handed
/// over; `release` gives one back. When waiters are queued, `release`
/// transfers the unit directly to the head waiter instead of bumping the
/// count, so a newly woken task never races the next caller for it.
pub struct Semaphore {
    count: SpinNoIrq<u32>,
    wq: WaitQueue,
}

impl Semaphore {
    /// Creates a semaphore with `permits` available units; waiters queue
    /// in FIFO order.
    pub fn new(permits: u32) -> Self {
        Self::with_discipline(permits, Discipline::Fifo)
    }

    /// Creates a semaphore with the given wake-order discipline.
    pub fn with_discipline(permits: u32, discipline: Discipline) -> Self {
        Self {
            count: SpinNoIrq::new(permits),
            wq: WaitQueue::new(discipline),
        }
    }

    /// Takes one unit, blocking according to `wait` when none is
    /// available.
    pub fn obtain(&self, wait: Wait) -> SyncResult {
        let kernel = global();
        let guard = kernel.dispatch_guard();
        let mut count = self.count.lock();
        if *count > 0 {
            *count -= 1;
            return Ok(());
        }
        if let Wait::No = wait {
            return Err(SyncError::WouldBlock);
        }
        let task = current_task();
        self.wq.enqueue(kernel, &task, wait.timeout());
        drop(count);
        drop(guard);
        kernel.suspend(&task);
        finish_wait(&task)
    }

    /// Takes one unit if immediately available.
    pub fn try_obtain(&self) -> bool {
        self.obtain(Wait::No).is_ok()
    }

    /// Returns one unit, waking the head waiter if there is one.
    ///
    /// Never blocks; callable from interrupt context.
    pub fn release(&self) {
        let kernel = global();
        let _guard = kernel.dispatch_guard();
        let mut count = self.count.lock();
        if self.wq.extract_one(kernel).is_none() {
            *count += 1;
        }
    }

    /// Wakes every waiter with a flushed outcome. Returns how many were
    /// woken.
    pub fn flush(&self) -> usize {
        let kernel = global();
        let _guard = kernel.dispatch_guard();
        let _count = self.count.lock();
        self.wq.extract_all(kernel, WaitOutcome::Flushed)
    }

    /// Currently available units.
    pub fn permits(&self) -> u32 {
        *self.count.lock()
    }

    /// Number of blocked tasks.
    pub fn waiting(&self) -> usize {
        self.wq.len()
    }
}
