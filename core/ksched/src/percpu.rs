//! Per-processor context and the dispatch protocol.
//!
//! Each processor carries a dispatch-disable depth: while it is non-zero
//! the processor's running task is not switched out even when a more
//! urgent task becomes ready; the switch is recorded and performed when
//! the depth returns to zero.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use kspin::SpinNoIrq;

use crate::{
    Kernel, port,
    task::{CPU_NONE, KtaskRef, TaskState},
    timers::{Tick, TimerAction},
};

pub(crate) struct CpuSlots {
    pub(crate) executing: Option<KtaskRef>,
    pub(crate) heir: Option<KtaskRef>,
}

/// Per-processor state: dispatch-disable depth, deferred-dispatch flag,
/// ISR nest level, and the executing/heir task slots.
pub struct CpuContext {
    cpu_id: usize,
    dispatch_disable_level: AtomicU32,
    dispatch_needed: AtomicBool,
    isr_nest_level: AtomicU32,
    pub(crate) slots: SpinNoIrq<CpuSlots>,
}

impl CpuContext {
    pub(crate) fn new(cpu_id: usize) -> Self {
        Self {
            cpu_id,
            dispatch_disable_level: AtomicU32::new(0),
            dispatch_needed: AtomicBool::new(false),
            isr_nest_level: AtomicU32::new(0),
            slots: SpinNoIrq::new(CpuSlots {
                executing: None,
                heir: None,
            }),
        }
    }

    /// Index of this processor.
    pub fn id(&self) -> usize {
        self.cpu_id
    }

    /// The task currently holding this processor.
    pub fn executing(&self) -> Option<KtaskRef> {
        self.slots.lock().executing.clone()
    }

    /// The task selected to receive this processor next.
    pub fn heir(&self) -> Option<KtaskRef> {
        self.slots.lock().heir.clone()
    }

    /// Current dispatch-disable depth.
    pub fn dispatch_disable_level(&self) -> u32 {
        self.dispatch_disable_level.load(Ordering::SeqCst)
    }

    /// Whether a dispatch is pending for this processor.
    pub fn dispatch_needed(&self) -> bool {
        self.dispatch_needed.load(Ordering::SeqCst)
    }

    /// Current interrupt nest level.
    pub fn isr_nest_level(&self) -> u32 {
        self.isr_nest_level.load(Ordering::SeqCst)
    }

    pub(crate) fn set_dispatch_needed(&self, needed: bool) {
        self.dispatch_needed.store(needed, Ordering::SeqCst);
    }
}

/// RAII section with dispatching deferred on one processor.
pub struct DispatchGuard<'a> {
    kernel: &'a Kernel,
    cpu: usize,
}

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        self.kernel.dispatch_enable(self.cpu);
    }
}

impl Kernel {
    /// Defers dispatching on the calling processor until the returned
    /// guard is dropped.
    pub fn dispatch_guard(&self) -> DispatchGuard<'_> {
        let cpu = port::current_cpu();
        self.dispatch_disable(cpu);
        DispatchGuard { kernel: self, cpu }
    }

    /// Bumps the dispatch-disable depth of `cpu`. Returns the new depth.
    pub fn dispatch_disable(&self, cpu: usize) -> u32 {
        self.cpu(cpu)
            .dispatch_disable_level
            .fetch_add(1, Ordering::SeqCst)
            + 1
    }

    /// Drops the dispatch-disable depth of `cpu`; at zero, performs any
    /// deferred dispatch.
    pub fn dispatch_enable(&self, cpu: usize) {
        let ctx = self.cpu(cpu);
        let prev = ctx.dispatch_disable_level.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "dispatch-disable underflow");
        if prev == 1 && ctx.isr_nest_level() == 0 && ctx.dispatch_needed() {
            self.dispatch(cpu);
        }
    }

    /// Performs the context-switch decision for `cpu`: if a heir has been
    /// selected and differs from the executing task, the processor is
    /// handed over.
    ///
    /// Deferred (no-op apart from flagging) while the dispatch-disable
    /// depth is non-zero.
    pub fn dispatch(&self, cpu: usize) {
        let ctx = self.cpu(cpu);
        if ctx.dispatch_disable_level() > 0 || ctx.isr_nest_level() > 0 {
            ctx.set_dispatch_needed(true);
            return;
        }
        let sched = self.scheduler_for_cpu(cpu);
        loop {
            ctx.set_dispatch_needed(false);
            let mut rq = sched.ready.lock();
            let mut slots = ctx.slots.lock();
            let Some(heir) = slots.heir.take() else {
                return;
            };
            if heir.state() != TaskState::Ready {
                // The heir went away while dispatching was deferred.
                drop(slots);
                self.update_heirs(sched, &mut rq);
                drop(rq);
                if !ctx.dispatch_needed() {
                    return;
                }
                continue;
            }
            let same = slots
                .executing
                .as_ref()
                .is_some_and(|e| Arc::ptr_eq(e, &heir));
            rq.remove(&heir);
            heir.set_state(TaskState::Scheduled);
            heir.set_scheduled_on(cpu);
            if same {
                return;
            }
            let prev = slots.executing.replace(heir.clone());
            if let Some(p) = &prev {
                p.set_scheduled_on(CPU_NONE);
                if p.state() == TaskState::Scheduled {
                    p.set_state(TaskState::Ready);
                    rq.enqueue(p.clone());
                }
            }
            drop(slots);
            drop(rq);
            trace!(
                "cpu {} dispatch: {} -> {}",
                cpu,
                prev.as_ref().map_or_else(|| "idle".into(), |p| p.id_name()),
                heir.id_name()
            );
            port::context_switch(prev.as_ref(), &heir);
            if !ctx.dispatch_needed() {
                return;
            }
        }
    }

    /// Installs `task` as the executing task of `cpu`.
    ///
    /// Bootstrap hook: ports call this once per processor for the task
    /// whose context the processor is already running.
    pub fn adopt(&self, cpu: usize, task: &KtaskRef) {
        let sched = self.scheduler_of(task);
        let mut rq = sched.ready.lock();
        rq.remove(task);
        task.set_state(TaskState::Scheduled);
        task.set_scheduled_on(cpu);
        let mut slots = self.cpu(cpu).slots.lock();
        slots.executing = Some(task.clone());
    }

    /// Enters interrupt context on `cpu`.
    pub fn interrupt_enter(&self, cpu: usize) {
        let ctx = self.cpu(cpu);
        ctx.isr_nest_level.fetch_add(1, Ordering::SeqCst);
        ctx.dispatch_disable_level.fetch_add(1, Ordering::SeqCst);
    }

    /// Leaves interrupt context on `cpu`, dispatching if an action taken
    /// by the handler changed the heir.
    pub fn interrupt_exit(&self, cpu: usize) {
        let ctx = self.cpu(cpu);
        let nest = ctx.isr_nest_level.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(nest > 0, "interrupt nest underflow");
        self.dispatch_enable(cpu);
    }

    /// Tick entry point: advances `cpu`'s timer set by `elapsed` ticks
    /// from interrupt context and fires every due entry.
    pub fn tick(&self, cpu: usize, elapsed: Tick) {
        self.interrupt_enter(cpu);
        self.timer_set(cpu)
            .advance(elapsed, |action, at| self.run_timer_action(action, at));
        self.interrupt_exit(cpu);
    }

    pub(crate) fn run_timer_action(&self, action: TimerAction, at: Tick) {
        match action {
            TimerAction::TaskTimeout(weak) => {
                if let Some(task) = weak.upgrade() {
                    self.timer_expired(&task);
                }
            }
            TimerAction::Callback(f) => f(at),
        }
    }

    /// Parks the caller until `task` (the caller's own TCB) leaves the
    /// blocked state. On bare-metal ports this runs the dispatcher
    /// instead; the call returns when the task is next scheduled.
    pub fn suspend(&self, task: &KtaskRef) {
        cfg_if::cfg_if! {
            if #[cfg(any(test, feature = "test"))] {
                port::suspend(task);
            } else {
                let _ = task;
                self.dispatch(port::current_cpu());
            }
        }
    }
}

// Hooks for kspin's dispatch-deferring lock guards.
#[cfg(all(target_os = "none", not(feature = "test")))]
mod guard_if {
    use super::*;

    struct GuardIfImpl;

    #[crate_interface::impl_interface]
    impl kspin::KernelGuardIf for GuardIfImpl {
        fn disable_dispatch() {
            if let Some(kernel) = crate::api::try_global() {
                kernel.dispatch_disable(port::current_cpu());
            }
        }

        fn enable_dispatch() {
            if let Some(kernel) = crate::api::try_global() {
                kernel.dispatch_enable(port::current_cpu());
            }
        }

        fn local_irq_save_and_disable() -> usize {
            port::irq_save()
        }

        fn local_irq_restore(flags: usize) {
            port::irq_restore(flags)
        }
    }
}
