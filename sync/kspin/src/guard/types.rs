//! Concrete guard type implementations.

use super::BaseGuard;

/// No-op guard (does nothing).
#[derive(Debug, Clone, Copy)]
pub struct NoOp;

impl BaseGuard for NoOp {
    type State = ();

    #[inline(always)]
    fn acquire() -> Self::State {}

    #[inline(always)]
    fn release(_state: Self::State) {}
}

impl NoOp {
    /// Create a new no-op guard.
    #[inline(always)]
    pub const fn new() -> Self {
        Self
    }
}

impl Default for NoOp {
    fn default() -> Self {
        Self
    }
}

// Kernel-mode guards
#[cfg(target_os = "none")]
mod kernel {
    use super::*;

    /// Guard that saves/restores IRQ state.
    #[derive(Debug)]
    pub struct IrqSave(pub(super) usize);

    /// Guard that defers task dispatching.
    #[derive(Debug)]
    pub struct NoDispatch;

    /// Guard that defers dispatching and disables IRQs.
    #[derive(Debug)]
    pub struct NoDispatchIrqSave(pub(super) usize);

    // IrqSave implementation
    impl BaseGuard for IrqSave {
        type State = usize;

        #[inline]
        fn acquire() -> Self::State {
            crate_interface::call_interface!(crate::guard::KernelGuardIf::local_irq_save_and_disable)
        }

        #[inline]
        fn release(state: Self::State) {
            crate_interface::call_interface!(crate::guard::KernelGuardIf::local_irq_restore, state)
        }
    }

    impl IrqSave {
        /// Create a new guard, entering the critical section.
        #[inline]
        pub fn new() -> Self {
            Self(<Self as BaseGuard>::acquire())
        }
    }

    impl Drop for IrqSave {
        #[inline]
        fn drop(&mut self) {
            <Self as BaseGuard>::release(self.0)
        }
    }

    impl Default for IrqSave {
        #[inline]
        fn default() -> Self {
            Self::new()
        }
    }

    // NoDispatch implementation
    impl BaseGuard for NoDispatch {
        type State = ();

        #[inline]
        fn acquire() -> Self::State {
            #[cfg(feature = "dispatch")]
            crate_interface::call_interface!(crate::guard::KernelGuardIf::disable_dispatch);
        }

        #[inline]
        fn release(_state: Self::State) {
            #[cfg(feature = "dispatch")]
            crate_interface::call_interface!(crate::guard::KernelGuardIf::enable_dispatch);
        }
    }

    impl NoDispatch {
        /// Create a new guard, entering the critical section.
        #[inline]
        pub fn new() -> Self {
            <Self as BaseGuard>::acquire();
            Self
        }
    }

    impl Drop for NoDispatch {
        #[inline]
        fn drop(&mut self) {
            <Self as BaseGuard>::release(())
        }
    }

    impl Default for NoDispatch {
        #[inline]
        fn default() -> Self {
            Self::new()
        }
    }

    // NoDispatchIrqSave implementation
    impl BaseGuard for NoDispatchIrqSave {
        type State = usize;

        #[inline]
        fn acquire() -> Self::State {
            // Order: defer dispatching first, then disable IRQs
            #[cfg(feature = "dispatch")]
            crate_interface::call_interface!(crate::guard::KernelGuardIf::disable_dispatch);

            crate_interface::call_interface!(crate::guard::KernelGuardIf::local_irq_save_and_disable)
        }

        #[inline]
        fn release(state: Self::State) {
            // Order: restore IRQs first, then re-allow dispatching
            crate_interface::call_interface!(crate::guard::KernelGuardIf::local_irq_restore, state);

            #[cfg(feature = "dispatch")]
            crate_interface::call_interface!(crate::guard::KernelGuardIf::enable_dispatch);
        }
    }

    impl NoDispatchIrqSave {
        /// Create a new guard, entering the critical section.
        #[inline]
        pub fn new() -> Self {
            Self(<Self as BaseGuard>::acquire())
        }
    }

    impl Drop for NoDispatchIrqSave {
        #[inline]
        fn drop(&mut self) {
            <Self as BaseGuard>::release(self.0)
        }
    }

    impl Default for NoDispatchIrqSave {
        #[inline]
        fn default() -> Self {
            Self::new()
        }
    }
}

// User-mode aliases (all no-ops)
#[cfg(not(target_os = "none"))]
pub use NoOp as IrqSave;
#[cfg(not(target_os = "none"))]
pub use NoOp as NoDispatch;
#[cfg(not(target_os = "none"))]
pub use NoOp as NoDispatchIrqSave;
#[cfg(target_os = "none")]
pub use kernel::*;
