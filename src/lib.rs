//! # Spindle: a single-core task scheduler
//!
//! An interrupt-driven real-time scheduler for small microcontrollers, with
//! cooperative and preemptive multitasking, weighted round robin, priority
//! donation, and blocking synchronization built on top of it.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                    Application Tasks                   │
//! ├──────────────────┬──────────────────┬──────────────────┤
//! │  Mutex /         │    Semaphore     │  Queue / Stack   │
//! │  ScopedLock      │   semaphore.rs   │  collections/    │
//! │  mutex.rs        │                  │                  │
//! ├──────────────────┴──────────────────┴──────────────────┤
//! │        Executive trait · Kernel facade (kernel.rs)     │
//! │   register · start · yield · delay · set_priority      │
//! ├──────────────────┬──────────────────┬──────────────────┤
//! │  Scheduler       │  Task Model      │  Stack Arena     │
//! │  scheduler.rs    │  task.rs         │  arena.rs        │
//! │  ─ select()      │  ─ descriptor    │  ─ carve()       │
//! │  ─ donate()      │  ─ state         │  ─ guard words   │
//! ├──────────────────┴──────────────────┴──────────────────┤
//! │     Port trait (arch/) · critical-section backends     │
//! ├───────────────────────────┬────────────────────────────┤
//! │  arch/cortex_m4.rs        │  arch/sim.rs               │
//! │  PendSV · SysTick · PSP   │  threads + one CPU baton   │
//! └───────────────────────────┴────────────────────────────┘
//! ```
//!
//! ## Scheduling Model
//!
//! Tasks are visited in table order. A task picked by the switcher gets a
//! slice of `priority` ticks; a higher weight means a longer turn, never a
//! jump of the queue. Tasks that sleep are skipped until their deadline,
//! and the idle task at index 0 is always ready, so there is always
//! something to run.
//!
//! A task that blocks on a held [`Mutex`](mutex::Mutex) lends its weight to
//! the owner until the owner unlocks, so a low-weight holder is not starved
//! by the tasks between it and the waiter.
//!
//! ## Memory Model
//!
//! - **No heap**: the task table and every container are fixed-size
//! - **One stack arena**: handed to [`Kernel::start`](kernel::Kernel::start)
//!   and carved into guarded per-task slices
//! - **Critical sections**: all shared kernel state sits in a
//!   [`critical_section::Mutex`] and is only borrowed inside
//!   [`critical_section::with`]; the active port provides the backend

#![cfg_attr(not(any(test, feature = "std")), no_std)]

pub mod arch;
pub mod arena;
pub mod collections;
pub mod config;
pub mod error;
pub mod kernel;
pub mod mutex;
pub mod scheduler;
pub mod semaphore;
pub mod task;
pub mod time;

#[cfg(test)]
pub(crate) mod test_util;

pub use collections::{Queue, Stack};
pub use error::{Error, Rejected};
pub use kernel::{Executive, Kernel};
pub use mutex::{Mutex, ScopedLock};
pub use scheduler::Mode;
pub use semaphore::Semaphore;
pub use task::{TaskEntry, TaskId, TaskState};
