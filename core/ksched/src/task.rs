//! The task control block and task lifecycle operations.

use alloc::{
    string::String,
    sync::{Arc, Weak},
    vec::Vec,
};
use core::{
    fmt,
    sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering},
};

use axerrno::{AxError, AxResult};
use kspin::SpinNoIrq;

use crate::{
    CpuMask, Kernel,
    timers::{Tick, TimerAction, TimerHandle},
    wait_queue::WaitShared,
};

/// A shared reference to a task.
pub type KtaskRef = Arc<Ktask>;

/// A weak reference to a task.
pub type WeakKtaskRef = Weak<Ktask>;

/// Task priority. Numerically lower values are more urgent.
pub type Priority = u8;

/// Default priority for new tasks.
pub const DEFAULT_PRIORITY: Priority = 128;

/// Priority of the per-processor idle tasks. Reserved; ordinary tasks
/// must use a more urgent value.
pub const IDLE_PRIORITY: Priority = 255;

pub(crate) const CPU_NONE: usize = usize::MAX;

/// Unique task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

impl TaskId {
    fn alloc() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// The numeric value of the id.
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

/// Scheduling state of a task.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Runnable, linked into its scheduler's ready queue.
    Ready = 1,
    /// Holding a processor (or selected to). Not in any ready queue.
    Scheduled = 2,
    /// Not runnable: waiting on a queue, sleeping, or not yet started.
    Blocked = 3,
    /// Deleted; never runs again.
    Terminated = 4,
}

impl TaskState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Ready,
            2 => Self::Scheduled,
            3 => Self::Blocked,
            _ => Self::Terminated,
        }
    }
}

/// How a completed wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The awaited condition was handed to the task.
    Satisfied,
    /// The wait's timeout expired first.
    Timeout,
    /// The queue was flushed (or the wait cancelled) before satisfaction.
    Flushed,
}

/// Wait-related TCB fields, owned by the wait-queue component.
pub(crate) struct WaitState {
    /// The queue the task is blocked on, if any. A reference, never
    /// ownership.
    pub(crate) queue: Option<Arc<WaitShared>>,
    /// Outcome of the most recently completed wait.
    pub(crate) outcome: Option<WaitOutcome>,
    /// Payload slot for queue-specific hand-off (message transfer).
    pub(crate) payload: Option<Vec<u8>>,
}

/// Creation parameters for [`Kernel::new_task`].
pub struct TaskConfig {
    /// Task name, for diagnostics.
    pub name: String,
    /// Initial priority.
    pub priority: Priority,
    /// Processors the task may run on. `None` means all of them.
    pub affinity: Option<CpuMask>,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            priority: DEFAULT_PRIORITY,
            affinity: None,
        }
    }
}

/// The task control block.
///
/// The scheduler, timer, and wait-queue components hold `Arc` links into
/// this structure but never own it; the invariant they maintain is that
/// those links are consistent or the task is in none of them.
pub struct Ktask {
    id: TaskId,
    name: String,
    state: AtomicU8,
    prio: AtomicU8,
    affinity: SpinNoIrq<CpuMask>,
    home_scheduler: usize,
    home_cpu: usize,
    scheduled_on: AtomicUsize,
    /// Embedded timer entry, armed for timeouts and sleeps.
    timer: TimerHandle,
    /// Absolute tick at which the pending timeout fires (0 = none).
    deadline: AtomicU64,
    pub(crate) wait: SpinNoIrq<WaitState>,
    #[cfg(any(test, feature = "test"))]
    pub(crate) thread: SpinNoIrq<Option<std::thread::Thread>>,
}

impl Ktask {
    /// The task's unique id.
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// The task's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// "name#id" form for diagnostics.
    pub fn id_name(&self) -> String {
        alloc::format!("{}#{}", self.name, self.id.0)
    }

    /// Current scheduling state.
    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_state(&self, state: TaskState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Current priority.
    pub fn priority(&self) -> Priority {
        self.prio.load(Ordering::SeqCst)
    }

    pub(crate) fn set_prio_raw(&self, prio: Priority) {
        self.prio.store(prio, Ordering::SeqCst);
    }

    /// The processors this task may run on.
    pub fn affinity(&self) -> CpuMask {
        self.affinity.lock().clone()
    }

    pub(crate) fn affinity_includes(&self, cpu: usize) -> bool {
        self.affinity.lock().get(cpu)
    }

    /// The scheduler instance the task belongs to.
    pub fn home_scheduler(&self) -> usize {
        self.home_scheduler
    }

    /// The processor owning the task's embedded timer entry.
    pub fn home_cpu(&self) -> usize {
        self.home_cpu
    }

    /// The processor currently running this task, if any.
    pub fn scheduled_on(&self) -> Option<usize> {
        match self.scheduled_on.load(Ordering::SeqCst) {
            CPU_NONE => None,
            cpu => Some(cpu),
        }
    }

    pub(crate) fn set_scheduled_on(&self, cpu: usize) {
        self.scheduled_on.store(cpu, Ordering::SeqCst);
    }

    pub(crate) fn timer_handle(&self) -> TimerHandle {
        self.timer
    }

    /// Absolute tick of the pending timeout, if one is armed.
    pub fn deadline(&self) -> Option<Tick> {
        match self.deadline.load(Ordering::SeqCst) {
            0 => None,
            t => Some(t),
        }
    }

    pub(crate) fn set_deadline(&self, tick: Tick) {
        self.deadline.store(tick, Ordering::SeqCst);
    }

    /// Outcome of the most recently completed wait.
    pub fn wait_outcome(&self) -> Option<WaitOutcome> {
        self.wait.lock().outcome
    }

    /// Whether the task is currently linked into a wait queue.
    pub fn is_waiting(&self) -> bool {
        self.wait.lock().queue.is_some()
    }

    pub(crate) fn waiting_on(&self) -> Option<Arc<WaitShared>> {
        self.wait.lock().queue.clone()
    }

    /// Stores a payload to hand to this task when it is woken.
    ///
    /// Used by message-passing layers; the slot is cleared when the task
    /// starts its next wait.
    pub fn set_wait_payload(&self, payload: Vec<u8>) {
        self.wait.lock().payload = Some(payload);
    }

    /// Takes the payload handed to this task by its waker.
    pub fn take_wait_payload(&self) -> Option<Vec<u8>> {
        self.wait.lock().payload.take()
    }

    #[cfg(any(test, feature = "test"))]
    pub(crate) fn set_thread(&self, thread: std::thread::Thread) {
        *self.thread.lock() = Some(thread);
    }
}

impl fmt::Debug for Ktask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ktask")
            .field("id", &self.id.0)
            .field("name", &self.name)
            .field("state", &self.state())
            .field("prio", &self.priority())
            .finish()
    }
}

impl Kernel {
    /// Creates a dormant task. It does not run until [`Kernel::start`].
    ///
    /// Fails if the priority is reserved or the affinity matches no
    /// scheduler instance.
    pub fn new_task(&self, config: TaskConfig) -> AxResult<KtaskRef> {
        if config.priority >= IDLE_PRIORITY {
            return Err(AxError::InvalidInput);
        }
        self.new_task_inner(config)
    }

    pub(crate) fn new_task_inner(&self, config: TaskConfig) -> AxResult<KtaskRef> {
        let affinity = match config.affinity {
            Some(mask) => mask,
            None => {
                let mut all = CpuMask::new();
                for cpu in 0..self.num_cpus() {
                    all.set(cpu, true);
                }
                all
            }
        };
        let home_scheduler = (0..self.num_schedulers())
            .find(|&i| {
                (0..self.num_cpus()).any(|cpu| affinity.get(cpu) && self.scheduler(i).owns_cpu(cpu))
            })
            .ok_or(AxError::InvalidInput)?;
        let home_cpu = (0..self.num_cpus())
            .find(|&cpu| affinity.get(cpu) && self.scheduler(home_scheduler).owns_cpu(cpu))
            .ok_or(AxError::InvalidInput)?;

        let task = Arc::new_cyclic(|weak: &Weak<Ktask>| Ktask {
            id: TaskId::alloc(),
            name: config.name,
            state: AtomicU8::new(TaskState::Blocked as u8),
            prio: AtomicU8::new(config.priority),
            affinity: SpinNoIrq::new(affinity),
            home_scheduler,
            home_cpu,
            scheduled_on: AtomicUsize::new(CPU_NONE),
            timer: self
                .timer_set(home_cpu)
                .create(TimerAction::TaskTimeout(weak.clone())),
            deadline: AtomicU64::new(0),
            wait: SpinNoIrq::new(WaitState {
                queue: None,
                outcome: None,
                payload: None,
            }),
            #[cfg(any(test, feature = "test"))]
            thread: SpinNoIrq::new(None),
        });
        debug!("task {} created (prio {})", task.id_name(), task.priority());
        Ok(task)
    }

    /// Makes a dormant task runnable.
    pub fn start(&self, task: &KtaskRef) {
        self.make_ready(task);
    }

    /// Deletes a task: extracts it from any wait queue, disarms and frees
    /// its timer entry, and removes it from the ready set.
    ///
    /// The task must not be running; stop it first.
    pub fn delete_task(&self, task: &KtaskRef) -> AxResult<()> {
        if task.state() == TaskState::Scheduled {
            return Err(AxError::BadState);
        }
        if let Some(shared) = task.waiting_on() {
            WaitShared::extract(self, &shared, task);
        }
        let ts = self.timer_set(task.home_cpu());
        ts.cancel(task.timer_handle());
        ts.destroy(task.timer_handle());
        self.extract_task(task);
        task.set_state(TaskState::Terminated);
        debug!("task {} deleted", task.id_name());
        Ok(())
    }

    /// Restricts the processors `task` may run on.
    ///
    /// The new mask must share a processor with the task's scheduler
    /// instance.
    pub fn set_affinity(&self, task: &KtaskRef, mask: CpuMask) -> AxResult<()> {
        let sched = self.scheduler_of(task);
        if !(0..self.num_cpus()).any(|cpu| mask.get(cpu) && sched.owns_cpu(cpu)) {
            return Err(AxError::InvalidInput);
        }
        *task.affinity.lock() = mask;
        self.reschedule(task.home_scheduler());
        Ok(())
    }

    /// Blocks the calling task for `ticks` ticks of its home processor's
    /// timer set.
    pub fn sleep(&self, task: &KtaskRef, ticks: Tick) {
        {
            let mut w = task.wait.lock();
            assert!(w.queue.is_none(), "sleeping task is on a wait queue");
            w.outcome = None;
        }
        let ts = self.timer_set(task.home_cpu());
        task.set_deadline(ts.now() + ticks);
        if ts.arm(task.timer_handle(), ticks).is_err() {
            panic!("task {} timer entry already armed", task.id_name());
        }
        self.block_task(task);
        self.suspend(task);
    }

    /// Timer-entry expiry for `task`: either a wait timed out or a sleep
    /// finished.
    pub(crate) fn timer_expired(&self, task: &KtaskRef) {
        task.set_deadline(0);
        if let Some(shared) = task.waiting_on() {
            if WaitShared::timeout_extract(self, &shared, task) {
                trace!("task {} timed out", task.id_name());
            }
            return;
        }
        if task.state() == TaskState::Blocked {
            task.wait.lock().outcome = Some(WaitOutcome::Satisfied);
            self.make_ready(task);
        }
    }
}
