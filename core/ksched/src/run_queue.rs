//! Ready queues and heir selection.
//!
//! Each scheduler instance owns a subset of the processors and one ready
//! queue: an array of FIFO buckets, one per priority level, with a bitmap
//! for constant-time highest-ready lookup. Insertion at a level goes to
//! the tail, so equal-priority tasks run in arrival order.

use alloc::{collections::VecDeque, sync::Arc, vec::Vec};

use axerrno::{AxError, AxResult};
use kspin::SpinNoIrq;

use crate::{
    CpuMask, Kernel, PRIORITY_LEVELS, port,
    task::{IDLE_PRIORITY, KtaskRef, Priority, TaskId, TaskState},
    wait_queue::WaitShared,
};

const BITMAP_WORDS: usize = PRIORITY_LEVELS / 64;

pub(crate) struct ReadyQueue {
    bitmap: [u64; BITMAP_WORDS],
    buckets: Vec<VecDeque<KtaskRef>>,
}

impl ReadyQueue {
    fn new() -> Self {
        Self {
            bitmap: [0; BITMAP_WORDS],
            buckets: (0..PRIORITY_LEVELS).map(|_| VecDeque::new()).collect(),
        }
    }

    fn set_bit(&mut self, prio: usize) {
        self.bitmap[prio / 64] |= 1 << (prio % 64);
    }

    fn clear_bit(&mut self, prio: usize) {
        self.bitmap[prio / 64] &= !(1 << (prio % 64));
    }

    pub(crate) fn enqueue(&mut self, task: KtaskRef) {
        let prio = task.priority() as usize;
        self.buckets[prio].push_back(task);
        self.set_bit(prio);
    }

    /// Unlinks `task`; returns whether it was queued. The task's priority
    /// names its bucket.
    pub(crate) fn remove(&mut self, task: &KtaskRef) -> bool {
        let prio = task.priority() as usize;
        let bucket = &mut self.buckets[prio];
        let Some(pos) = bucket.iter().position(|t| Arc::ptr_eq(t, task)) else {
            return false;
        };
        let _ = bucket.remove(pos);
        if bucket.is_empty() {
            self.clear_bit(prio);
        }
        true
    }

    /// Most urgent ready task eligible for `cpu`, skipping tasks already
    /// claimed as heir elsewhere.
    pub(crate) fn select(&self, cpu: usize, excluded: &[TaskId]) -> Option<KtaskRef> {
        for (word_idx, &word) in self.bitmap.iter().enumerate() {
            let mut bits = word;
            while bits != 0 {
                let prio = word_idx * 64 + bits.trailing_zeros() as usize;
                for task in &self.buckets[prio] {
                    if task.affinity_includes(cpu) && !excluded.contains(&task.id()) {
                        return Some(task.clone());
                    }
                }
                bits &= bits - 1;
            }
        }
        None
    }
}

/// One scheduler instance, bound to a subset of the processors.
pub(crate) struct Scheduler {
    index: usize,
    cpus: CpuMask,
    pub(crate) ready: SpinNoIrq<ReadyQueue>,
}

impl Scheduler {
    pub(crate) fn new(index: usize, cpus: CpuMask) -> Self {
        Self {
            index,
            cpus,
            ready: SpinNoIrq::new(ReadyQueue::new()),
        }
    }

    pub(crate) fn owns_cpu(&self, cpu: usize) -> bool {
        self.cpus.get(cpu)
    }
}

impl Kernel {
    /// Moves a blocked task into its scheduler's ready set and recomputes
    /// heirs. No-op for a task that is already runnable.
    pub fn make_ready(&self, task: &KtaskRef) {
        let sched = self.scheduler_of(task);
        {
            let mut rq = sched.ready.lock();
            match task.state() {
                TaskState::Blocked => {
                    task.set_state(TaskState::Ready);
                    rq.enqueue(task.clone());
                    trace!("task {} ready", task.id_name());
                }
                TaskState::Ready | TaskState::Scheduled | TaskState::Terminated => return,
            }
            self.update_heirs(sched, &mut rq);
        }
        port::resume(task);
    }

    /// Removes a runnable task from the ready set (it is blocking).
    ///
    /// # Panics
    ///
    /// Panics if the task is already blocked or terminated; that is
    /// corrupted scheduler state, not a recoverable condition.
    pub(crate) fn block_task(&self, task: &KtaskRef) {
        let sched = self.scheduler_of(task);
        let mut rq = sched.ready.lock();
        match task.state() {
            TaskState::Ready => {
                rq.remove(task);
                task.set_state(TaskState::Blocked);
            }
            TaskState::Scheduled => {
                task.set_state(TaskState::Blocked);
                if let Some(cpu) = task.scheduled_on() {
                    self.cpu(cpu).set_dispatch_needed(true);
                }
            }
            TaskState::Blocked => panic!("task {} blocked twice", task.id_name()),
            TaskState::Terminated => panic!("blocking terminated task {}", task.id_name()),
        }
        trace!("task {} blocked", task.id_name());
        self.update_heirs(sched, &mut rq);
    }

    /// Removes a task from the ready set without state assumptions (the
    /// deletion path).
    pub(crate) fn extract_task(&self, task: &KtaskRef) {
        let sched = self.scheduler_of(task);
        let mut rq = sched.ready.lock();
        rq.remove(task);
        self.update_heirs(sched, &mut rq);
    }

    /// Re-queues the task behind its equal-priority peers and lets the
    /// dispatcher re-decide the processor.
    pub fn yield_task(&self, task: &KtaskRef) {
        let sched = self.scheduler_of(task);
        {
            let mut rq = sched.ready.lock();
            match task.state() {
                TaskState::Scheduled => {
                    task.set_state(TaskState::Ready);
                    rq.enqueue(task.clone());
                }
                TaskState::Ready => {
                    if rq.remove(task) {
                        rq.enqueue(task.clone());
                    }
                }
                TaskState::Blocked | TaskState::Terminated => return,
            }
            self.update_heirs(sched, &mut rq);
        }
        if let Some(cpu) = task.scheduled_on() {
            self.dispatch(cpu);
        }
    }

    /// Changes a task's priority, repositioning it in whichever structure
    /// currently orders it (ready bucket, or a priority wait queue).
    pub fn set_priority(&self, task: &KtaskRef, prio: Priority) -> AxResult<()> {
        if prio >= IDLE_PRIORITY {
            return Err(AxError::InvalidInput);
        }
        if let Some(shared) = task.waiting_on() {
            WaitShared::reposition(&shared, task, prio);
            return Ok(());
        }
        let sched = self.scheduler_of(task);
        let mut rq = sched.ready.lock();
        let requeue = task.state() == TaskState::Ready && rq.remove(task);
        task.set_prio_raw(prio);
        if requeue {
            rq.enqueue(task.clone());
        }
        self.update_heirs(sched, &mut rq);
        Ok(())
    }

    /// Recomputes the heirs of one scheduler instance.
    pub(crate) fn reschedule(&self, scheduler: usize) {
        let sched = self.scheduler(scheduler);
        let mut rq = sched.ready.lock();
        self.update_heirs(sched, &mut rq);
    }

    /// Picks a heir for every processor of `sched`.
    ///
    /// Selection runs under the instance's ready-queue lock; a task is
    /// claimed by at most one processor per pass, which keeps a task from
    /// being scheduled on two processors at once.
    pub(crate) fn update_heirs(&self, sched: &Scheduler, rq: &mut ReadyQueue) {
        let mut claimed: Vec<TaskId> = Vec::new();
        for cpu in 0..self.num_cpus() {
            if !sched.owns_cpu(cpu) {
                continue;
            }
            let ctx = self.cpu(cpu);
            let mut slots = ctx.slots.lock();
            let exec_prio = slots
                .executing
                .as_ref()
                .filter(|t| t.state() == TaskState::Scheduled)
                .map(|t| t.priority());
            let candidate = rq.select(cpu, &claimed);
            let new_heir = match (candidate, exec_prio) {
                (Some(c), Some(ep)) if c.priority() < ep => Some(c),
                (Some(c), None) => Some(c),
                _ => None,
            };
            match new_heir {
                Some(heir) => {
                    claimed.push(heir.id());
                    let differs = slots
                        .executing
                        .as_ref()
                        .is_none_or(|e| !Arc::ptr_eq(e, &heir));
                    trace!("sched {} cpu {} heir: {}", sched.index, cpu, heir.id_name());
                    slots.heir = Some(heir);
                    drop(slots);
                    if differs {
                        ctx.set_dispatch_needed(true);
                        if ctx.dispatch_disable_level() == 0 && cpu != port::current_cpu() {
                            port::wake_cpu(cpu);
                        }
                    }
                }
                None => {
                    slots.heir = None;
                }
            }
        }
    }
}
