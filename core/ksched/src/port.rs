//! The port layer: everything the core needs from CPU-specific code.
//!
//! On bare-metal targets these calls reach the board support package
//! through [`KernelPortIf`]. In hosted mode (the `test` feature) tasks
//! are backed by std threads: "blocking" parks the backing thread and
//! "waking" unparks it, so the blocking protocol is exercised for real
//! without any context-switch assembly.

use crate::task::KtaskRef;

cfg_if::cfg_if! {
    if #[cfg(any(test, feature = "test"))] {
        use std::cell::RefCell;

        use crate::task::TaskState;

        std::thread_local! {
            static CURRENT: RefCell<Option<KtaskRef>> = const { RefCell::new(None) };
        }

        /// Index of the processor executing the caller.
        pub fn current_cpu() -> usize {
            0
        }

        pub(crate) fn set_current(task: Option<KtaskRef>) {
            CURRENT.with(|c| *c.borrow_mut() = task);
        }

        /// The current task. A host thread the executive has never seen
        /// before is adopted on first use, so every thread may block.
        pub(crate) fn current() -> Option<KtaskRef> {
            if let Some(task) = CURRENT.with(|c| c.borrow().clone()) {
                return Some(task);
            }
            let kernel = crate::api::try_global()?;
            let task = kernel
                .new_task(crate::task::TaskConfig {
                    name: "host".into(),
                    ..Default::default()
                })
                .ok()?;
            task.set_thread(std::thread::current());
            kernel.start(&task);
            set_current(Some(task.clone()));
            Some(task)
        }

        /// Parks the calling thread until `task` leaves the blocked state.
        ///
        /// Only parks when the caller's thread actually backs `task`;
        /// harness-driven TCBs without a thread return immediately.
        pub(crate) fn suspend(task: &KtaskRef) {
            let backs_caller = current().is_some_and(|c| alloc::sync::Arc::ptr_eq(&c, task));
            if !backs_caller {
                return;
            }
            while task.state() == TaskState::Blocked {
                std::thread::park();
            }
        }

        /// Unparks the thread backing `task`, if any.
        pub(crate) fn resume(task: &KtaskRef) {
            let thread = task.thread.lock().clone();
            if let Some(thread) = thread {
                thread.unpark();
            }
        }

        pub(crate) fn context_switch(_prev: Option<&KtaskRef>, _next: &KtaskRef) {}

        pub(crate) fn wake_cpu(_cpu: usize) {}
    } else {
        /// CPU-specific operations supplied by the board support package.
        #[crate_interface::def_interface]
        pub trait KernelPortIf {
            /// Index of the processor executing the caller.
            fn current_cpu() -> usize;

            /// Save and disable local interrupts, returning saved flags.
            fn local_irq_save() -> usize;

            /// Restore local interrupts from saved flags.
            fn local_irq_restore(flags: usize);

            /// Switch to `next`'s context. `prev` is `None` when the
            /// processor was idle.
            fn context_switch(prev: Option<&KtaskRef>, next: &KtaskRef);

            /// Kick another processor so it runs its dispatcher.
            fn wake_cpu(cpu: usize);
        }

        /// Index of the processor executing the caller.
        pub fn current_cpu() -> usize {
            crate_interface::call_interface!(KernelPortIf::current_cpu)
        }

        pub(crate) fn current() -> Option<KtaskRef> {
            crate::api::try_global().and_then(|k| k.cpu(current_cpu()).executing())
        }

        pub(crate) fn resume(_task: &KtaskRef) {}

        pub(crate) fn context_switch(prev: Option<&KtaskRef>, next: &KtaskRef) {
            crate_interface::call_interface!(KernelPortIf::context_switch, prev, next)
        }

        pub(crate) fn wake_cpu(cpu: usize) {
            crate_interface::call_interface!(KernelPortIf::wake_cpu, cpu)
        }

        #[cfg(target_os = "none")]
        pub(crate) fn irq_save() -> usize {
            crate_interface::call_interface!(KernelPortIf::local_irq_save)
        }

        #[cfg(target_os = "none")]
        pub(crate) fn irq_restore(flags: usize) {
            crate_interface::call_interface!(KernelPortIf::local_irq_restore, flags)
        }
    }
}
