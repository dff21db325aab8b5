//! A blocking mutex implementation.

use ksched::{Discipline, WaitQueue, global};
use kspin::SpinNoIrq;

use crate::{current_task, finish_wait};

/// A [`lock_api::RawMutex`] implementation.
///
/// The owner is tracked by task id. A contended `lock` blocks the caller
/// on a priority-ordered wait queue; `unlock` hands ownership directly to
/// the head waiter, so the lock is never observably free while tasks are
/// queued.
///
/// Re-acquiring a held mutex and releasing one owned by another task are
/// invariant violations and panic.
pub struct RawMutex {
    /// Owning task id; 0 when free.
    owner_id: SpinNoIrq<u64>,
    wq: SpinNoIrq<Option<WaitQueue>>,
}

impl RawMutex {
    /// Creates a new unlocked [`RawMutex`].
    #[inline(always)]
    pub const fn new() -> Self {
        Self {
            owner_id: SpinNoIrq::new(0),
            wq: SpinNoIrq::new(None),
        }
    }

    fn wq(&self) -> WaitQueue {
        self.wq
            .lock()
            .get_or_insert_with(|| WaitQueue::new(Discipline::Priority))
            .clone()
    }
}

impl Default for RawMutex {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl lock_api::RawMutex for RawMutex {
    type GuardMarker = lock_api::GuardSend;

    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = RawMutex::new();

    #[inline(always)]
    fn lock(&self) {
        let kernel = global();
        let guard = kernel.dispatch_guard();
        let task = current_task();
        let current_id = task.id().as_u64();
        let mut owner_id = self.owner_id.lock();
        if *owner_id == 0 {
            *owner_id = current_id;
            return;
        }
        assert_ne!(
            *owner_id,
            current_id,
            "{} tried to acquire mutex it already owns",
            task.id_name()
        );
        let wq = self.wq();
        wq.enqueue(kernel, &task, None);
        drop(owner_id);
        drop(guard);
        kernel.suspend(&task);
        // Ownership was transferred by the unlocker.
        if finish_wait(&task).is_err() {
            panic!("mutex wait interrupted");
        }
    }

    #[inline(always)]
    fn try_lock(&self) -> bool {
        let task = current_task();
        let mut owner_id = self.owner_id.lock();
        if *owner_id == 0 {
            *owner_id = task.id().as_u64();
            true
        } else {
            false
        }
    }

    #[inline(always)]
    unsafe fn unlock(&self) {
        let kernel = global();
        let _guard = kernel.dispatch_guard();
        let task = current_task();
        let mut owner_id = self.owner_id.lock();
        assert_eq!(
            *owner_id,
            task.id().as_u64(),
            "{} tried to release mutex it doesn't own",
            task.id_name()
        );
        let next = self
            .wq()
            .extract_one_prepared(kernel, |t| *owner_id = t.id().as_u64());
        if next.is_none() {
            *owner_id = 0;
        }
    }

    #[inline(always)]
    fn is_locked(&self) -> bool {
        *self.owner_id.lock() != 0
    }
}

/// An alias of [`lock_api::Mutex`].
pub type Mutex<T> = lock_api::Mutex<RawMutex, T>;
/// An alias of [`lock_api::MutexGuard`].
pub type MutexGuard<'a, T> = lock_api::MutexGuard<'a, RawMutex, T>;
