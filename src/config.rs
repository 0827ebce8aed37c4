//! # Spindle Configuration
//!
//! Compile-time constants governing the scheduler and its ports.
//! All limits are fixed at compile time; nothing is allocated dynamically.

/// Maximum number of tasks the task table holds, **including** the
/// reserved idle task at index 0. Applications can register
/// `MAX_TASKS - 1` tasks of their own.
pub const MAX_TASKS: usize = 8;

/// Clock tick frequency in Hz. The millisecond clock advances once per tick.
pub const TICK_HZ: u32 = 1000;

/// Interval, in milliseconds, between preemption ticks when the scheduler
/// runs in [`Mode::Preemptive`](crate::scheduler::Mode::Preemptive).
/// A task of priority `w` keeps the CPU for up to `w` consecutive intervals.
pub const PREEMPT_INTERVAL_MS: u32 = 1;

/// Priority weight given to tasks that do not ask for anything else,
/// and to the idle task.
pub const DEFAULT_PRIORITY: u8 = 1;

/// Stack bytes requested for a task that does not ask for anything else.
pub const DEFAULT_STACK_SIZE: usize = 512;

/// Stack bytes reserved for the idle task. The idle task only polls the
/// task table and waits for interrupts, so it needs very little.
pub const IDLE_STACK_SIZE: usize = 256;

/// Alignment of every stack slice carved out of the arena (AAPCS requires 8).
pub const STACK_ALIGN: usize = 8;

/// Guard word written at the lowest address of every stack slice.
/// Stacks grow downward, so an overflowing task clobbers it first.
pub const STACK_CANARY: u32 = 0x5AFE_C0DE;

/// Lock owner id stored while a lock is unowned.
pub const NO_OWNER: u8 = u8::MAX;

/// System clock frequency in Hz (default for STM32F4 at 16 MHz HSI).
pub const SYSTEM_CLOCK_HZ: u32 = 16_000_000;
