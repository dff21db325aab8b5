// SPDX-License-Identifier: Apache-2.0

//! Scheduling and blocking-synchronization core of the krte executive.
//!
//! This crate decides which task runs next, tracks time-based expirations,
//! and implements the generic "block a task until some condition or
//! timeout" protocol that the higher-level synchronization objects are
//! built on. It contains:
//!
//! - [`Ktask`]: the per-task state record, including the embedded timer
//!   entry used for timeouts.
//! - [`TimerSet`]: the per-processor set of pending expirations, kept as a
//!   delta chain.
//! - [`WaitQueue`]: the generic blocking/waking engine with FIFO and
//!   priority disciplines.
//! - Per-processor ready queues, heir selection, and the dispatch-disable
//!   protocol, all reachable through [`Kernel`].
//!
//! Hardware is reached only through the port layer ([`port`]): a tick
//! source drives [`Kernel::tick`], and CPU-specific code supplies
//! interrupt masking, the processor id, and the context switch.
//!
//! Lock order, everywhere: wait-queue lock, then timer-set lock, then
//! ready-queue lock, then per-processor slots. Timer actions run with
//! the timer-set lock released, which is what lets a firing timeout take
//! the wait-queue lock first like everyone else.
//!
//! # Cargo Features
//!
//! - `test`: Hosted mode. Tasks are backed by std threads so blocking
//!   calls really block; used by the test suites.
//! - `smp`: Multi-core build (real spinlock state).

#![cfg_attr(not(any(test, feature = "test")), no_std)]

#[macro_use]
extern crate log;

extern crate alloc;

use alloc::{sync::Arc, vec::Vec};

mod api;
mod percpu;
mod run_queue;
mod task;
mod timers;
mod wait_queue;

pub mod port;

pub use api::{current, global, init_kernel, try_global};
#[cfg(any(test, feature = "test"))]
pub use api::{JoinHandle, init_scheduler, spawn, spawn_with, yield_now};
pub use percpu::{CpuContext, DispatchGuard};
pub use task::{
    DEFAULT_PRIORITY, IDLE_PRIORITY, Ktask, KtaskRef, Priority, TaskConfig, TaskId, TaskState,
    WaitOutcome, WeakKtaskRef,
};
pub use timers::{Tick, TimerAction, TimerError, TimerHandle, TimerSet};
pub use wait_queue::{Discipline, WaitQueue};

use run_queue::Scheduler;

/// Compile-time cap on the number of processors.
pub const MAX_CPUS: usize = 8;

/// Number of distinct task priority levels.
pub const PRIORITY_LEVELS: usize = 256;

/// Affinity mask over the processors of one executive instance.
pub type CpuMask = cpumask::CpuMask<MAX_CPUS>;

/// One executive instance: the per-processor contexts, the scheduler
/// instances (each bound to a subset of processors), and one timer set
/// per processor.
///
/// Everything is sized at construction and lives for the lifetime of the
/// kernel; per-processor state is reached through [`Kernel::cpu`] rather
/// than ambient statics.
pub struct Kernel {
    cpus: Vec<CpuContext>,
    schedulers: Vec<Scheduler>,
    timers: Vec<TimerSet>,
}

impl Kernel {
    /// Creates an executive with `num_cpus` processors driven by a single
    /// scheduler instance.
    pub fn new(num_cpus: usize) -> Arc<Self> {
        let mut all = CpuMask::new();
        for cpu in 0..num_cpus {
            all.set(cpu, true);
        }
        Self::with_instances(num_cpus, &[all])
    }

    /// Creates an executive with `num_cpus` processors partitioned among
    /// one scheduler instance per entry of `instances`.
    ///
    /// # Panics
    ///
    /// Panics if `num_cpus` is zero or exceeds [`MAX_CPUS`], or if a mask
    /// names no processor below `num_cpus`.
    pub fn with_instances(num_cpus: usize, instances: &[CpuMask]) -> Arc<Self> {
        assert!(num_cpus > 0 && num_cpus <= MAX_CPUS, "bad processor count");
        let cpus = (0..num_cpus).map(CpuContext::new).collect();
        let timers = (0..num_cpus).map(TimerSet::new).collect();
        let schedulers = instances
            .iter()
            .enumerate()
            .map(|(index, mask)| {
                assert!(
                    (0..num_cpus).any(|cpu| mask.get(cpu)),
                    "scheduler instance {index} owns no processor"
                );
                Scheduler::new(index, mask.clone())
            })
            .collect();
        let kernel = Kernel {
            cpus,
            schedulers,
            timers,
        };
        kernel.create_idle_tasks(num_cpus);
        Arc::new(kernel)
    }

    /// The context of processor `cpu`.
    pub fn cpu(&self, cpu: usize) -> &CpuContext {
        &self.cpus[cpu]
    }

    /// Number of processors.
    pub fn num_cpus(&self) -> usize {
        self.cpus.len()
    }

    /// The timer set owned by processor `cpu`.
    pub fn timer_set(&self, cpu: usize) -> &TimerSet {
        &self.timers[cpu]
    }

    pub(crate) fn scheduler(&self, index: usize) -> &Scheduler {
        &self.schedulers[index]
    }

    pub(crate) fn num_schedulers(&self) -> usize {
        self.schedulers.len()
    }

    pub(crate) fn scheduler_of(&self, task: &KtaskRef) -> &Scheduler {
        &self.schedulers[task.home_scheduler()]
    }

    pub(crate) fn scheduler_for_cpu(&self, cpu: usize) -> &Scheduler {
        self.schedulers
            .iter()
            .find(|s| s.owns_cpu(cpu))
            .unwrap_or(&self.schedulers[0])
    }

    fn create_idle_tasks(&self, num_cpus: usize) {
        for cpu in 0..num_cpus {
            let mut mask = CpuMask::new();
            mask.set(cpu, true);
            let idle = self
                .new_task_inner(TaskConfig {
                    name: alloc::format!("idle{cpu}"),
                    priority: IDLE_PRIORITY,
                    affinity: Some(mask),
                })
                .expect("idle task creation cannot fail");
            self.make_ready(&idle);
        }
    }
}
