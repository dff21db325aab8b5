//! Convenience surface: the process-global executive handle, the
//! current-task accessor, and hosted task spawning.

use alloc::sync::Arc;

use lazyinit::LazyInit;

use crate::{Kernel, port, task::KtaskRef};

static KERNEL: LazyInit<Arc<Kernel>> = LazyInit::new();

/// Installs the process-global executive. Call once at startup, before
/// anything blocks.
pub fn init_kernel(kernel: Arc<Kernel>) {
    KERNEL.init_once(kernel);
}

/// The global executive, if one has been installed.
pub fn try_global() -> Option<&'static Arc<Kernel>> {
    if KERNEL.is_inited() { Some(&KERNEL) } else { None }
}

/// The global executive.
///
/// # Panics
///
/// Panics if [`init_kernel`] has not run.
pub fn global() -> &'static Arc<Kernel> {
    match try_global() {
        Some(kernel) => kernel,
        None => panic!("executive not initialized"),
    }
}

/// The task executing the caller, if the caller runs in task context.
pub fn current() -> Option<KtaskRef> {
    port::current()
}

#[cfg(any(test, feature = "test"))]
mod hosted {
    use super::*;
    use crate::task::TaskConfig;

    /// Hosted bootstrap: installs a single-processor executive and adopts
    /// the calling thread as the `main` task. Call once per process.
    pub fn init_scheduler() {
        if KERNEL.is_inited() {
            return;
        }
        let kernel = Kernel::new(1);
        init_kernel(kernel.clone());
        let main = kernel
            .new_task(TaskConfig {
                name: "main".into(),
                ..Default::default()
            })
            .expect("main task");
        main.set_thread(std::thread::current());
        kernel.adopt(0, &main);
        port::set_current(Some(main));
    }

    /// A handle to a hosted task; dropping it detaches the task.
    pub struct JoinHandle {
        task: KtaskRef,
        inner: std::thread::JoinHandle<()>,
    }

    impl JoinHandle {
        /// The spawned task.
        pub fn task(&self) -> &KtaskRef {
            &self.task
        }

        /// Waits until the task finishes.
        pub fn join(self) {
            let _ = self.inner.join();
        }
    }

    /// Spawns a hosted task with default configuration.
    pub fn spawn<F>(f: F) -> JoinHandle
    where
        F: FnOnce() + Send + 'static,
    {
        spawn_with(TaskConfig::default(), f)
    }

    /// Spawns a hosted task: a TCB in the global executive backed by a
    /// std thread.
    pub fn spawn_with<F>(config: TaskConfig, f: F) -> JoinHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let kernel = global().clone();
        let task = kernel.new_task(config).expect("task config");
        kernel.start(&task);
        let worker = task.clone();
        let inner = std::thread::spawn(move || {
            worker.set_thread(std::thread::current());
            port::set_current(Some(worker.clone()));
            f();
            port::set_current(None);
            let _ = kernel.delete_task(&worker);
        });
        JoinHandle { task, inner }
    }

    /// Lets other runnable tasks proceed.
    pub fn yield_now() {
        if let Some(kernel) = try_global() {
            if let Some(task) = current() {
                kernel.yield_task(&task);
            }
        }
        std::thread::yield_now();
    }
}

#[cfg(any(test, feature = "test"))]
pub use hosted::{JoinHandle, init_scheduler, spawn, spawn_with, yield_now};

#[cfg(test)]
mod tests {
    use std::sync::{
        Once,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    };

    use super::*;
    use crate::task::TaskConfig;

    static INIT: Once = Once::new();

    #[test]
    fn spawn_runs_and_joins() {
        INIT.call_once(init_scheduler);

        static N: AtomicUsize = AtomicUsize::new(0);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                spawn(|| {
                    N.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();
        for h in handles {
            h.join();
        }
        assert_eq!(N.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn current_names_the_running_task() {
        INIT.call_once(init_scheduler);

        static SAW_NAME: AtomicBool = AtomicBool::new(false);
        let h = spawn_with(
            TaskConfig {
                name: "worker".into(),
                ..Default::default()
            },
            || {
                let me = current();
                SAW_NAME.store(
                    me.is_some_and(|t| t.name() == "worker"),
                    Ordering::SeqCst,
                );
            },
        );
        h.join();
        assert!(SAW_NAME.load(Ordering::SeqCst));
    }

    #[test]
    fn spawned_task_can_sleep_on_the_tick_source() {
        INIT.call_once(init_scheduler);

        static WOKE: AtomicBool = AtomicBool::new(false);
        let h = spawn(|| {
            let kernel = global();
            let me = current().unwrap();
            kernel.sleep(&me, 3);
            WOKE.store(true, Ordering::SeqCst);
        });
        // Drive the tick source until the sleeper wakes.
        let kernel = global();
        for _ in 0..1000 {
            kernel.tick(0, 1);
            if WOKE.load(Ordering::SeqCst) {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        h.join();
        assert!(WOKE.load(Ordering::SeqCst));
    }
}
