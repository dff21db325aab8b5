//! The generic blocking/waking engine.
//!
//! A wait queue holds the tasks blocked on one resource, in FIFO or
//! priority order. It never evaluates the resource condition itself;
//! admission rules belong to the policy layer above. What it guarantees:
//!
//! - a task is linked into at most one wait queue at a time;
//! - removal from the queue and cancellation of the task's timeout entry
//!   happen together, under the queue's lock;
//! - exactly one of [`WaitOutcome::Satisfied`], [`WaitOutcome::Timeout`]
//!   or [`WaitOutcome::Flushed`] is recorded per wait.

use alloc::{collections::VecDeque, sync::Arc};

use kspin::SpinNoIrq;

use crate::{
    Kernel,
    task::{KtaskRef, Priority, WaitOutcome},
    timers::Tick,
};

/// Wake-order policy of a wait queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discipline {
    /// Waiters wake in arrival order.
    Fifo,
    /// Waiters wake in priority order, arrival order among equals.
    Priority,
}

pub(crate) struct WaitShared {
    discipline: Discipline,
    list: SpinNoIrq<VecDeque<KtaskRef>>,
}

/// A queue of blocked tasks with a wake-order discipline.
///
/// Cloning yields another handle to the same queue.
#[derive(Clone)]
pub struct WaitQueue {
    shared: Arc<WaitShared>,
}

impl WaitQueue {
    /// Creates an empty queue with the given discipline.
    pub fn new(discipline: Discipline) -> Self {
        Self {
            shared: Arc::new(WaitShared {
                discipline,
                list: SpinNoIrq::new(VecDeque::new()),
            }),
        }
    }

    /// The queue's wake-order discipline.
    pub fn discipline(&self) -> Discipline {
        self.shared.discipline
    }

    /// Number of blocked tasks.
    pub fn len(&self) -> usize {
        self.shared.list.lock().len()
    }

    /// Whether no task is blocked here.
    pub fn is_empty(&self) -> bool {
        self.shared.list.lock().is_empty()
    }

    /// Blocks `task` on this queue, arming its timeout entry if a
    /// timeout is given.
    ///
    /// The caller must be (or act for) `task` itself, in task context.
    /// The call only runs the blocking protocol; suspension happens in
    /// [`Kernel::suspend`] once the caller has dropped its own locks.
    ///
    /// # Panics
    ///
    /// Panics if the task is already queued somewhere or its timer entry
    /// is already armed; both mean corrupted kernel state.
    pub fn enqueue(&self, kernel: &Kernel, task: &KtaskRef, timeout: Option<Tick>) {
        let queued = self.enqueue_unless(kernel, task, timeout, |_| false);
        debug_assert!(queued);
    }

    /// Like [`WaitQueue::enqueue`], except that `complete` is consulted
    /// first, under the queue's lock, with the current number of waiters:
    /// if it returns `true` the task is not enqueued and the call returns
    /// `false`.
    ///
    /// This is the admission hook for all-or-nothing objects (a barrier's
    /// releasing arrival must decide and skip the queue atomically).
    pub fn enqueue_unless(
        &self,
        kernel: &Kernel,
        task: &KtaskRef,
        timeout: Option<Tick>,
        complete: impl FnOnce(usize) -> bool,
    ) -> bool {
        let mut list = self.shared.list.lock();
        if complete(list.len()) {
            return false;
        }
        {
            let mut w = task.wait.lock();
            assert!(
                w.queue.is_none(),
                "task {} is already on a wait queue",
                task.id_name()
            );
            w.queue = Some(self.shared.clone());
            w.outcome = None;
            w.payload = None;
        }
        let pos = match self.shared.discipline {
            Discipline::Fifo => list.len(),
            Discipline::Priority => list
                .iter()
                .position(|t| t.priority() > task.priority())
                .unwrap_or(list.len()),
        };
        list.insert(pos, task.clone());
        trace!("task {} waits (timeout {:?})", task.id_name(), timeout);
        if let Some(ticks) = timeout {
            let ts = kernel.timer_set(task.home_cpu());
            task.set_deadline(ts.now() + ticks);
            if ts.arm(task.timer_handle(), ticks).is_err() {
                panic!("task {} timer entry already armed", task.id_name());
            }
        }
        kernel.block_task(task);
        true
    }

    /// Wakes the head waiter with [`WaitOutcome::Satisfied`].
    pub fn extract_one(&self, kernel: &Kernel) -> Option<KtaskRef> {
        self.extract_one_prepared(kernel, |_| {})
    }

    /// Wakes the head waiter, running `prep` on it after removal but
    /// before it can resume. Used to hand over a payload race-free.
    pub fn extract_one_prepared(
        &self,
        kernel: &Kernel,
        prep: impl FnOnce(&KtaskRef),
    ) -> Option<KtaskRef> {
        let mut list = self.shared.list.lock();
        let task = list.pop_front()?;
        prep(&task);
        finish_extract(kernel, &task, WaitOutcome::Satisfied);
        Some(task)
    }

    /// Wakes every waiter, in queue order, recording `outcome` for each.
    /// Returns how many were woken.
    pub fn extract_all(&self, kernel: &Kernel, outcome: WaitOutcome) -> usize {
        let mut list = self.shared.list.lock();
        let mut woken = 0;
        while let Some(task) = list.pop_front() {
            finish_extract(kernel, &task, outcome);
            woken += 1;
        }
        woken
    }

    /// Wakes every waiter with [`WaitOutcome::Flushed`].
    pub fn flush(&self, kernel: &Kernel) -> usize {
        self.extract_all(kernel, WaitOutcome::Flushed)
    }

    /// Removes a specific task (a signal or cancellation interrupting its
    /// wait), waking it with [`WaitOutcome::Flushed`]. No-op if the task
    /// is not queued here.
    pub fn extract(&self, kernel: &Kernel, task: &KtaskRef) -> bool {
        WaitShared::extract(kernel, &self.shared, task)
    }
}

impl WaitShared {
    /// Targeted removal; see [`WaitQueue::extract`].
    pub(crate) fn extract(kernel: &Kernel, shared: &Arc<WaitShared>, task: &KtaskRef) -> bool {
        let mut list = shared.list.lock();
        let Some(pos) = list.iter().position(|t| Arc::ptr_eq(t, task)) else {
            return false;
        };
        let _ = list.remove(pos);
        finish_extract(kernel, task, WaitOutcome::Flushed);
        true
    }

    /// Timeout expiry: extracts `task` if, under the queue lock, it is
    /// still waiting here. Losing the race to a concurrent satisfier is
    /// the normal case and a no-op, which is what keeps the outcomes
    /// mutually exclusive.
    pub(crate) fn timeout_extract(
        kernel: &Kernel,
        shared: &Arc<WaitShared>,
        task: &KtaskRef,
    ) -> bool {
        let mut list = shared.list.lock();
        let still_here = {
            let w = task.wait.lock();
            w.queue.as_ref().is_some_and(|q| Arc::ptr_eq(q, shared))
        };
        if !still_here {
            return false;
        }
        let Some(pos) = list.iter().position(|t| Arc::ptr_eq(t, task)) else {
            return false;
        };
        let _ = list.remove(pos);
        finish_extract(kernel, task, WaitOutcome::Timeout);
        true
    }

    /// Priority change for a queued task: re-sorts it under the queue
    /// lock (position is only meaningful for priority discipline).
    pub(crate) fn reposition(shared: &Arc<WaitShared>, task: &KtaskRef, prio: Priority) {
        let mut list = shared.list.lock();
        {
            let w = task.wait.lock();
            if !w.queue.as_ref().is_some_and(|q| Arc::ptr_eq(q, shared)) {
                // Extracted while we were acquiring the lock.
                task.set_prio_raw(prio);
                return;
            }
        }
        task.set_prio_raw(prio);
        if shared.discipline == Discipline::Priority {
            if let Some(pos) = list.iter().position(|t| Arc::ptr_eq(t, task)) {
                let _ = list.remove(pos);
                let new_pos = list
                    .iter()
                    .position(|t| t.priority() > prio)
                    .unwrap_or(list.len());
                list.insert(new_pos, task.clone());
            }
        }
    }
}

/// Completes a wait: clears the queue reference, records the outcome,
/// cancels the timeout entry, and makes the task runnable again. Runs
/// under the queue's lock.
fn finish_extract(kernel: &Kernel, task: &KtaskRef, outcome: WaitOutcome) {
    {
        let mut w = task.wait.lock();
        w.queue = None;
        w.outcome = Some(outcome);
    }
    kernel.timer_set(task.home_cpu()).cancel(task.timer_handle());
    task.set_deadline(0);
    trace!("task {} woken: {:?}", task.id_name(), outcome);
    kernel.make_ready(task);
}

#[cfg(test)]
mod tests {
    use alloc::string::ToString;

    use super::*;
    use crate::{Kernel, TaskConfig, TaskState};

    fn ready_task(kernel: &Kernel, name: &str, prio: Priority) -> KtaskRef {
        let task = kernel
            .new_task(TaskConfig {
                name: name.to_string(),
                priority: prio,
                affinity: None,
            })
            .unwrap();
        kernel.start(&task);
        task
    }

    /// Advance the tick source without entering interrupt context, so
    /// state transitions can be observed before any dispatch.
    fn drive(kernel: &Kernel, ticks: Tick) {
        for _ in 0..ticks {
            kernel
                .timer_set(0)
                .advance(1, |action, at| kernel.run_timer_action(action, at));
        }
    }

    #[test]
    fn priority_discipline_wakes_urgent_first_fifo_among_equals() {
        let k = Kernel::new(1);
        let wq = WaitQueue::new(Discipline::Priority);
        let a = ready_task(&k, "a", 5);
        let b = ready_task(&k, "b", 3);
        let c = ready_task(&k, "c", 5);
        wq.enqueue(&k, &a, None);
        wq.enqueue(&k, &b, None);
        wq.enqueue(&k, &c, None);

        let order: alloc::vec::Vec<_> = (0..3)
            .map(|_| wq.extract_one(&k).unwrap().id())
            .collect();
        assert_eq!(order, alloc::vec![b.id(), a.id(), c.id()]);
        assert!(wq.extract_one(&k).is_none());
    }

    #[test]
    fn fifo_discipline_ignores_priority() {
        let k = Kernel::new(1);
        let wq = WaitQueue::new(Discipline::Fifo);
        let a = ready_task(&k, "a", 5);
        let b = ready_task(&k, "b", 3);
        wq.enqueue(&k, &a, None);
        wq.enqueue(&k, &b, None);
        assert_eq!(wq.extract_one(&k).unwrap().id(), a.id());
        assert_eq!(wq.extract_one(&k).unwrap().id(), b.id());
    }

    #[test]
    fn timeout_fires_and_records_timeout_outcome() {
        let k = Kernel::new(1);
        let wq = WaitQueue::new(Discipline::Fifo);
        let a = ready_task(&k, "a", 5);
        wq.enqueue(&k, &a, Some(3));
        assert_eq!(a.state(), TaskState::Blocked);
        assert!(a.is_waiting());
        assert_eq!(a.deadline(), Some(3));

        drive(&k, 2);
        assert_eq!(a.state(), TaskState::Blocked);
        drive(&k, 1);
        assert_eq!(a.state(), TaskState::Ready);
        assert_eq!(a.wait_outcome(), Some(WaitOutcome::Timeout));
        assert!(!a.is_waiting());
        assert!(wq.is_empty());
    }

    #[test]
    fn satisfaction_cancels_the_timeout() {
        let k = Kernel::new(1);
        let wq = WaitQueue::new(Discipline::Fifo);
        let a = ready_task(&k, "a", 5);
        wq.enqueue(&k, &a, Some(3));

        assert_eq!(wq.extract_one(&k).unwrap().id(), a.id());
        assert_eq!(a.wait_outcome(), Some(WaitOutcome::Satisfied));
        assert_eq!(k.timer_set(0).remaining(a.timer_handle()), None);

        // The old timeout never fires: the outcome stays Satisfied.
        drive(&k, 10);
        assert_eq!(a.wait_outcome(), Some(WaitOutcome::Satisfied));
    }

    #[test]
    fn extract_all_leaves_timeouts_inactive() {
        let k = Kernel::new(1);
        let wq = WaitQueue::new(Discipline::Priority);
        let a = ready_task(&k, "a", 5);
        let b = ready_task(&k, "b", 6);
        wq.enqueue(&k, &a, Some(50));
        wq.enqueue(&k, &b, None);

        assert_eq!(wq.extract_all(&k, WaitOutcome::Flushed), 2);
        for t in [&a, &b] {
            assert_eq!(t.state(), TaskState::Ready);
            assert_eq!(t.wait_outcome(), Some(WaitOutcome::Flushed));
            assert_eq!(k.timer_set(0).remaining(t.timer_handle()), None);
        }
        drive(&k, 60);
        assert_eq!(a.wait_outcome(), Some(WaitOutcome::Flushed));
    }

    #[test]
    fn targeted_extract_is_idempotent() {
        let k = Kernel::new(1);
        let wq = WaitQueue::new(Discipline::Fifo);
        let a = ready_task(&k, "a", 5);
        wq.enqueue(&k, &a, None);
        assert!(wq.extract(&k, &a));
        assert!(!wq.extract(&k, &a));
        assert_eq!(a.wait_outcome(), Some(WaitOutcome::Flushed));
    }

    #[test]
    #[should_panic(expected = "already on a wait queue")]
    fn double_enqueue_is_fatal() {
        let k = Kernel::new(1);
        let wq = WaitQueue::new(Discipline::Fifo);
        let other = WaitQueue::new(Discipline::Fifo);
        let a = ready_task(&k, "a", 5);
        wq.enqueue(&k, &a, None);
        other.enqueue(&k, &a, None);
    }

    #[test]
    fn priority_change_repositions_queued_task() {
        let k = Kernel::new(1);
        let wq = WaitQueue::new(Discipline::Priority);
        let a = ready_task(&k, "a", 5);
        let b = ready_task(&k, "b", 6);
        wq.enqueue(&k, &a, None);
        wq.enqueue(&k, &b, None);

        k.set_priority(&b, 2).unwrap();
        assert_eq!(wq.extract_one(&k).unwrap().id(), b.id());
        assert_eq!(wq.extract_one(&k).unwrap().id(), a.id());
    }

    #[test]
    fn enqueue_unless_skips_the_completing_arrival() {
        let k = Kernel::new(1);
        let wq = WaitQueue::new(Discipline::Fifo);
        let a = ready_task(&k, "a", 5);
        let b = ready_task(&k, "b", 5);
        assert!(wq.enqueue_unless(&k, &a, None, |n| n + 1 >= 2));
        assert!(!wq.enqueue_unless(&k, &b, None, |n| n + 1 >= 2));
        assert_eq!(b.state(), TaskState::Ready);
        assert_eq!(wq.len(), 1);
    }

    #[test]
    fn deletion_extracts_from_queue_and_timer_set() {
        let k = Kernel::new(1);
        let wq = WaitQueue::new(Discipline::Fifo);
        let a = ready_task(&k, "a", 5);
        wq.enqueue(&k, &a, Some(10));
        assert!(a.is_waiting());

        k.delete_task(&a).unwrap();
        assert_eq!(a.state(), TaskState::Terminated);
        assert!(wq.is_empty());
        assert_eq!(k.timer_set(0).pending(), 0);
        // The embedded entry is gone with the task.
        assert!(!k.timer_set(0).cancel(a.timer_handle()));
    }

    #[test]
    fn sleep_wakes_with_satisfied_outcome() {
        let k = Kernel::new(1);
        let a = ready_task(&k, "a", 5);
        k.sleep(&a, 4);
        assert_eq!(a.state(), TaskState::Blocked);
        drive(&k, 3);
        assert_eq!(a.state(), TaskState::Blocked);
        drive(&k, 1);
        assert_eq!(a.state(), TaskState::Ready);
        assert_eq!(a.wait_outcome(), Some(WaitOutcome::Satisfied));
    }

    #[test]
    fn woken_task_preempts_less_urgent_executing() {
        let k = Kernel::new(1);
        let low = ready_task(&k, "low", 100);
        let high = ready_task(&k, "high", 10);
        let wq = WaitQueue::new(Discipline::Fifo);
        wq.enqueue(&k, &high, None);
        k.dispatch(0);
        assert_eq!(k.cpu(0).executing().unwrap().id(), low.id());

        let _ = wq.extract_one(&k);
        assert!(k.cpu(0).dispatch_needed());
        k.dispatch(0);
        assert_eq!(k.cpu(0).executing().unwrap().id(), high.id());
        assert_eq!(low.state(), TaskState::Ready);
    }
}
