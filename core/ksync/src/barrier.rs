//! An N-arrival barrier.

use ksched::{Discipline, WaitOutcome, WaitQueue, global};

use crate::{SyncError, SyncResult, Wait, current_task, finish_wait};

/// A barrier released by its Nth arrival.
///
/// Every `wait` call blocks until `count` tasks have accumulated; the
/// last arrival wakes all of them at once and never blocks itself.
pub struct Barrier {
    count: usize,
    wq: WaitQueue,
}

impl Barrier {
    /// Creates a barrier released by every `count`th arrival.
    ///
    /// # Panics
    ///
    /// Panics if `count` is zero.
    pub fn new(count: usize) -> Self {
        assert!(count > 0, "barrier needs a release count");
        Self {
            count,
            wq: WaitQueue::new(Discipline::Fifo),
        }
    }

    /// Arrives at the barrier. Returns `Ok(true)` for the arrival that
    /// released it, `Ok(false)` for the released waiters.
    ///
    /// The decision to wait is taken atomically with the waiter count, so
    /// two racing "last" arrivals cannot both block.
    pub fn wait(&self, wait: Wait) -> SyncResult<bool> {
        let kernel = global();
        let guard = kernel.dispatch_guard();
        if let Wait::No = wait {
            // Without blocking, only the releasing arrival can succeed.
            if self.wq.len() + 1 >= self.count {
                let _ = self.wq.extract_all(kernel, WaitOutcome::Satisfied);
                return Ok(true);
            }
            return Err(SyncError::WouldBlock);
        }
        let task = current_task();
        let queued = self
            .wq
            .enqueue_unless(kernel, &task, wait.timeout(), |n| n + 1 >= self.count);
        if !queued {
            let _ = self.wq.extract_all(kernel, WaitOutcome::Satisfied);
            return Ok(true);
        }
        drop(guard);
        kernel.suspend(&task);
        finish_wait(&task)?;
        Ok(false)
    }

    /// Wakes every waiter with a flushed outcome without releasing the
    /// barrier; returns how many were woken.
    pub fn flush(&self) -> usize {
        let kernel = global();
        let _guard = kernel.dispatch_guard();
        self.wq.flush(kernel)
    }

    /// Arrivals currently blocked.
    pub fn waiting(&self) -> usize {
        self.wq.len()
    }

    /// The release count.
    pub fn count(&self) -> usize {
        self.count
    }
}
