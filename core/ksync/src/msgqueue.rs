//! A bounded queue of fixed-maximum-size messages.

use alloc::{collections::VecDeque, vec::Vec};

use ksched::{Discipline, WaitQueue, global};
use kspin::SpinNoIrq;

use crate::{SyncError, SyncResult, Wait, current_task, finish_wait};

/// A bounded message queue.
///
/// `send` copies a message into a free buffer or, when the queue is full,
/// blocks the sender; `receive` takes the oldest message or blocks until
/// one arrives. A message sent while receivers are blocked is handed to
/// the head receiver directly, without touching the buffer.
///
/// One wait queue serves both sides: waiters are receivers exactly when
/// the buffer is empty and senders exactly when it is full; the queue can
/// never hold both.
pub struct MessageQueue {
    buffers: SpinNoIrq<VecDeque<Vec<u8>>>,
    capacity: usize,
    max_msg_size: usize,
    wq: WaitQueue,
}

impl MessageQueue {
    /// Creates a queue holding at most `capacity` messages of at most
    /// `max_msg_size` bytes; waiters queue in FIFO order.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize, max_msg_size: usize) -> Self {
        Self::with_discipline(capacity, max_msg_size, Discipline::Fifo)
    }

    /// Creates a queue with the given wake-order discipline.
    pub fn with_discipline(capacity: usize, max_msg_size: usize, discipline: Discipline) -> Self {
        assert!(capacity > 0, "message queue needs at least one buffer");
        Self {
            buffers: SpinNoIrq::new(VecDeque::with_capacity(capacity)),
            capacity,
            max_msg_size,
            wq: WaitQueue::new(discipline),
        }
    }

    /// Appends a message, blocking according to `wait` when the queue is
    /// full.
    pub fn send(&self, msg: &[u8], wait: Wait) -> SyncResult {
        self.post(msg, wait, false)
    }

    /// Prepends a message, so it is received before anything already
    /// buffered.
    pub fn urgent(&self, msg: &[u8], wait: Wait) -> SyncResult {
        self.post(msg, wait, true)
    }

    fn post(&self, msg: &[u8], wait: Wait, to_front: bool) -> SyncResult {
        if msg.len() > self.max_msg_size {
            return Err(SyncError::TooLong);
        }
        let kernel = global();
        let guard = kernel.dispatch_guard();
        let mut buffers = self.buffers.lock();
        if buffers.is_empty() {
            // Any waiters are receivers; hand the message straight over.
            let receiver = self
                .wq
                .extract_one_prepared(kernel, |t| t.set_wait_payload(msg.to_vec()));
            if receiver.is_some() {
                return Ok(());
            }
        }
        if buffers.len() < self.capacity {
            if to_front {
                buffers.push_front(msg.to_vec());
            } else {
                buffers.push_back(msg.to_vec());
            }
            return Ok(());
        }
        if let Wait::No = wait {
            return Err(SyncError::WouldBlock);
        }
        // Full: the sender parks its message in its own payload slot and
        // queues until a receiver frees a buffer.
        let task = current_task();
        task.set_wait_payload(msg.to_vec());
        self.wq.enqueue(kernel, &task, wait.timeout());
        drop(buffers);
        drop(guard);
        kernel.suspend(&task);
        finish_wait(&task)
    }

    /// Takes the oldest message, blocking according to `wait` when the
    /// queue is empty.
    pub fn receive(&self, wait: Wait) -> SyncResult<Vec<u8>> {
        let kernel = global();
        let guard = kernel.dispatch_guard();
        let mut buffers = self.buffers.lock();
        if let Some(msg) = buffers.pop_front() {
            // A freed buffer un-blocks the head sender, if any.
            let mut handed = None;
            let _ = self
                .wq
                .extract_one_prepared(kernel, |t| handed = t.take_wait_payload());
            if let Some(pending) = handed {
                buffers.push_back(pending);
            }
            return Ok(msg);
        }
        if let Wait::No = wait {
            return Err(SyncError::WouldBlock);
        }
        let task = current_task();
        self.wq.enqueue(kernel, &task, wait.timeout());
        drop(buffers);
        drop(guard);
        kernel.suspend(&task);
        finish_wait(&task)?;
        match task.take_wait_payload() {
            Some(msg) => Ok(msg),
            None => panic!("woken receiver holds no message"),
        }
    }

    /// Drops every buffered message; returns how many were dropped.
    ///
    /// Blocked tasks are not disturbed, but senders blocked on the
    /// previously full queue move their messages into the freed buffers.
    pub fn flush_pending(&self) -> usize {
        let kernel = global();
        let _guard = kernel.dispatch_guard();
        let mut buffers = self.buffers.lock();
        let n = buffers.len();
        let was_full = n == self.capacity;
        buffers.clear();
        if was_full {
            while buffers.len() < self.capacity {
                let mut handed = None;
                if self
                    .wq
                    .extract_one_prepared(kernel, |t| handed = t.take_wait_payload())
                    .is_none()
                {
                    break;
                }
                if let Some(pending) = handed {
                    buffers.push_back(pending);
                }
            }
        }
        n
    }

    /// Wakes every blocked sender or receiver with a flushed outcome;
    /// returns how many were woken.
    pub fn flush_waiting(&self) -> usize {
        let kernel = global();
        let _guard = kernel.dispatch_guard();
        self.wq.flush(kernel)
    }

    /// Number of tasks blocked on the queue (senders or receivers).
    pub fn waiting(&self) -> usize {
        self.wq.len()
    }

    /// Number of buffered messages.
    pub fn len(&self) -> usize {
        self.buffers.lock().len()
    }

    /// Whether no message is buffered.
    pub fn is_empty(&self) -> bool {
        self.buffers.lock().is_empty()
    }

    /// Maximum number of buffered messages.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Maximum size of one message, in bytes.
    pub fn max_msg_size(&self) -> usize {
        self.max_msg_size
    }
}
