//! # Architecture Abstraction Layer
//!
//! Provides a hardware abstraction boundary for the scheduler. The kernel
//! only talks to a [`Port`]: a clock, a periodic tick source, and the
//! continuation primitive that saves one task's execution state and resumes
//! another's.
//!
//! Interrupt masking is not part of the trait. The kernel takes every
//! critical section through [`critical_section::with`], and each port
//! supplies the implementation behind it:
//! - [`cortex_m4`]: SysTick clock and tick, PendSV context switch; masking
//!   comes from `cortex-m`'s `critical-section-single-core` backend.
//! - [`sim`]: hosted simulation, one OS thread per task with a single CPU
//!   baton passed between them; registers its own backend with
//!   `critical_section::set_impl!`.

use core::fmt::Debug;

use crate::task::TaskId;

#[cfg(all(feature = "cortex-m4", target_arch = "arm"))]
pub mod cortex_m4;

#[cfg(any(test, feature = "std"))]
pub mod sim;

/// Saved execution state of a task (registers, resume point, stack pointer).
pub trait Continuation: Copy + Debug + Send + 'static {
    /// Placeholder for a task whose context has not been initialized.
    const EMPTY: Self;
}

/// First code every task runs: `entry(kernel, task_index)`. Never returns.
pub type Trampoline = extern "C" fn(usize, usize) -> !;

/// Receives the periodic timer interrupt.
pub trait TickHandler: Sync {
    fn on_tick(&self);
}

/// Unrecoverable conditions. The kernel reports them to [`Port::halt`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Fault {
    /// A task overran its stack slice and clobbered its guard word.
    #[error("stack overflow in task {task}")]
    StackOverflow { task: TaskId },
}

/// Everything the kernel needs from the hardware.
pub trait Port: Sync + Sized + 'static {
    type Context: Continuation;

    /// Bytes added to every task's requested stack for the context the port
    /// saves on it.
    const CONTEXT_OVERHEAD: usize;

    /// Free-running millisecond clock; wraps.
    fn now_ms(&self) -> u32;

    /// Free-running microsecond clock; wraps.
    fn now_us(&self) -> u32;

    /// Start calling `handler.on_tick()` every `interval_ms` milliseconds.
    fn timer_arm(&'static self, interval_ms: u32, handler: &'static dyn TickHandler);

    /// Stop the periodic tick.
    fn timer_disarm(&self);

    /// Build the initial continuation of a task so that the first resume
    /// calls `entry(a0, a1)` on `stack`.
    ///
    /// # Safety
    /// `stack` must not be used by anything else for the rest of the
    /// program, and `ctx` must stay at a fixed address.
    unsafe fn init_context(
        &'static self,
        ctx: &mut Self::Context,
        stack: &'static mut [u8],
        entry: Trampoline,
        a0: usize,
        a1: usize,
    );

    /// Save the running task's state into `from` and resume `to`. From the
    /// caller's point of view this returns when the task is resumed again.
    ///
    /// # Safety
    /// Must be called inside a critical section, with `from` pointing at the
    /// continuation of the running task and `to` at an initialized one.
    unsafe fn switch(&self, from: *mut Self::Context, to: *const Self::Context);

    /// Resume `first` for the first time, abandoning the caller's context.
    ///
    /// # Safety
    /// `first` must be an initialized continuation. Called once.
    unsafe fn launch(&'static self, first: *const Self::Context) -> !;

    /// Sleep until the next interrupt, or return immediately if the port
    /// cannot.
    fn wait_for_interrupt(&self);

    /// Report `fault` and stop the system.
    fn halt(&self, fault: Fault) -> !;
}
