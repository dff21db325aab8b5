// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), no_std)]
#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

//! # Architecture
//!
//! The crate is organized into two main components:
//!
//! ## Guards (`guard` module)
//!
//! RAII guards that manage critical sections:
//! - [`NoOp`]: No protection (for IRQ-disabled contexts)
//! - [`NoDispatch`]: Defers task dispatching on the local processor
//! - [`IrqSave`]: Saves/restores IRQ state
//! - [`NoDispatchIrqSave`]: Defers dispatching and disables IRQs
//!
//! ## Locks (`lock` module)
//!
//! Generic spinlock implementation [`SpinLock<G, T>`] parameterized
//! by guard type.
//!
//! # Feature Flags
//!
//! - `smp`: Enable for multi-core systems (adds atomic lock state)
//! - `dispatch`: Enable dispatch deferral (requires implementing
//!   [`KernelGuardIf`])
//!
//! # Usage Patterns
//!
//! ```rust,ignore
//! use kspin::SpinNoIrq;
//!
//! static TICKS: SpinNoIrq<u64> = SpinNoIrq::new(0);
//!
//! fn tick_handler() {
//!     // Safe to use in IRQ context
//!     let mut ticks = TICKS.lock();
//!     *ticks += 1;
//! }
//! ```
//!
//! ## Implementing KernelGuardIf
//!
//! ```rust,ignore
//! use kspin::KernelGuardIf;
//!
//! struct GuardHooks;
//!
//! #[crate_interface::impl_interface]
//! impl KernelGuardIf for GuardHooks {
//!     fn disable_dispatch() { /* bump the dispatch-disable depth */ }
//!     fn enable_dispatch() { /* drop the depth, dispatch if it hit zero */ }
//!     fn local_irq_save_and_disable() -> usize { 0 }
//!     fn local_irq_restore(flags: usize) { let _ = flags; }
//! }
//! ```

mod guard;
mod lock;

pub use guard::{BaseGuard, IrqSave, KernelGuardIf, NoDispatch, NoDispatchIrqSave, NoOp};
pub use lock::{SpinLock, SpinLockGuard};

/// Raw spinlock with no guards.
///
/// **Warning**: Must only be used in contexts where dispatching and IRQs
/// are already disabled.
pub type SpinRaw<T> = SpinLock<NoOp, T>;

/// Guard for [`SpinRaw`].
pub type SpinRawGuard<'a, T> = SpinLockGuard<'a, NoOp, T>;

/// Spinlock that defers task dispatching while held.
///
/// Suitable when IRQ handlers never touch the same data.
pub type SpinNoDispatch<T> = SpinLock<NoDispatch, T>;

/// Guard for [`SpinNoDispatch`].
pub type SpinNoDispatchGuard<'a, T> = SpinLockGuard<'a, NoDispatch, T>;

/// Spinlock that disables IRQs and defers task dispatching while held.
///
/// This is the safest option and can be used from any context
/// including interrupt handlers.
pub type SpinNoIrq<T> = SpinLock<NoDispatchIrqSave, T>;

/// Guard for [`SpinNoIrq`].
pub type SpinNoIrqGuard<'a, T> = SpinLockGuard<'a, NoDispatchIrqSave, T>;
