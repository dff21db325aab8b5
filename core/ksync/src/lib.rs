// SPDX-License-Identifier: Apache-2.0

//! Kernel synchronization primitives.
//!
//! This crate provides the blocking synchronization objects of the krte
//! executive. Each one is a thin admission-policy layer over a
//! [`ksched::WaitQueue`]; the queue handles blocking, waking, timeouts and
//! wake ordering, while the object evaluates its resource condition under
//! its own lock:
//!
//! - [`Semaphore`]: counting semaphore with direct ownership hand-off
//! - [`MessageQueue`]: bounded queue of fixed-size messages
//! - [`Barrier`]: N-arrival rendezvous with an all-at-once wake
//! - [`RwLock`]: reader-writer lock (multiple readers or one writer)
//! - [`Mutex`]: owner-checked mutual exclusion lock
//! - [`spin`]: re-export of `kspin` for spinlocks
//!
//! Blocking calls take a [`Wait`] policy and report how the wait ended:
//! satisfaction returns the value, a timeout or flush comes back as a
//! [`SyncError`]. Waiting is only legal from task context; the executive
//! must have been installed with [`ksched::init_kernel`].
//!
//! # Examples
//!
//! ## Semaphore
//! ```no_run
//! use ksync::{Semaphore, Wait};
//!
//! let sem = Semaphore::new(3);
//!
//! fn task(sem: &Semaphore) {
//!     sem.obtain(Wait::Forever).unwrap();
//!     // do work with the resource
//!     sem.release();
//! }
//! ```
//!
//! ## Message queue
//! ```no_run
//! use ksync::{MessageQueue, Wait};
//!
//! let mq = MessageQueue::new(16, 64);
//!
//! fn producer(mq: &MessageQueue) {
//!     mq.send(b"ping", Wait::Forever).unwrap();
//! }
//!
//! fn consumer(mq: &MessageQueue) {
//!     let msg = mq.receive(Wait::Forever).unwrap();
//!     let _ = msg;
//! }
//! ```

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use core::fmt;

use axerrno::AxError;
use ksched::{KtaskRef, Tick, WaitOutcome};

pub use kspin as spin;

mod barrier;
mod msgqueue;
mod mutex;
mod rwlock;
mod semaphore;

pub use ksched::Discipline;

pub use self::{
    barrier::Barrier,
    msgqueue::MessageQueue,
    mutex::{Mutex, MutexGuard, RawMutex},
    rwlock::{RawRwLock, RwLock, RwLockReadGuard, RwLockWriteGuard},
    semaphore::Semaphore,
};

/// How long a blocking call may wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// Fail immediately instead of blocking.
    No,
    /// Wait until the condition is handed over.
    Forever,
    /// Wait at most this many ticks.
    For(Tick),
}

impl Wait {
    pub(crate) fn timeout(self) -> Option<Tick> {
        match self {
            Wait::No | Wait::Forever => None,
            Wait::For(ticks) => Some(ticks),
        }
    }
}

/// Recoverable, caller-visible failures of a synchronization call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncError {
    /// The condition is not available and the caller chose not to wait.
    WouldBlock,
    /// The wait's timeout expired.
    TimedOut,
    /// The object was flushed (or the wait cancelled) while waiting.
    Flushed,
    /// The message exceeds the queue's maximum message size.
    TooLong,
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            SyncError::WouldBlock => "resource unavailable",
            SyncError::TimedOut => "timed out",
            SyncError::Flushed => "flushed while waiting",
            SyncError::TooLong => "message too long",
        };
        f.write_str(msg)
    }
}

impl core::error::Error for SyncError {}

impl From<SyncError> for AxError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::WouldBlock => AxError::WouldBlock,
            SyncError::TimedOut => AxError::TimedOut,
            SyncError::Flushed => AxError::Interrupted,
            SyncError::TooLong => AxError::InvalidInput,
        }
    }
}

/// Result type of the synchronization calls.
pub type SyncResult<T = ()> = Result<T, SyncError>;

/// The calling task.
///
/// # Panics
///
/// Panics outside task context; waiting is a task-only operation.
pub(crate) fn current_task() -> KtaskRef {
    match ksched::current() {
        Some(task) => task,
        None => panic!("blocking wait from non-task context"),
    }
}

/// Maps the recorded outcome of a completed wait to the caller's result.
///
/// # Panics
///
/// Panics if no outcome was recorded; a task cannot legally resume from a
/// wait any other way.
pub(crate) fn finish_wait(task: &KtaskRef) -> SyncResult<()> {
    match task.wait_outcome() {
        Some(WaitOutcome::Satisfied) => Ok(()),
        Some(WaitOutcome::Timeout) => Err(SyncError::TimedOut),
        Some(WaitOutcome::Flushed) => Err(SyncError::Flushed),
        None => panic!("task {} resumed without a wait outcome", task.id_name()),
    }
}
