//! # Task Descriptor
//!
//! Defines the task model for Spindle. Each task owns a slice of the stack
//! arena, a saved continuation, and the bookkeeping the context switcher
//! needs to pick it: a priority weight, the slot credit left in its current
//! slice, and an optional "ready-not-before" deadline.

use core::fmt;

use crate::arch::Continuation;
use crate::arena::StackGuard;
use crate::config::{DEFAULT_PRIORITY, IDLE_STACK_SIZE};
use crate::time::{Deadline, Timestamp};

// ---------------------------------------------------------------------------
// Task identity
// ---------------------------------------------------------------------------

/// Identity of a registered task: its index in the task table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub(crate) u8);

impl TaskId {
    /// The reserved idle task.
    pub const IDLE: TaskId = TaskId(0);

    #[inline]
    pub const fn get(self) -> u8 {
        self.0
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Task state machine
// ---------------------------------------------------------------------------

/// Execution state of a task.
///
/// ```text
///   ┌──────────┐      select()       ┌─────────┐
///   │  Ready   │ ──────────────────► │ Running │
///   └──────────┘ ◄────────────────── └─────────┘
///        ▲          yield / tick          │
///        │                                │ delay() / contended lock
///        │         deadline passed ┌──────┴─────┐
///        └──────────────────────── │ Sleeping / │
///              or next poll        │  Waiting   │
///                                  └────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Eligible to run.
    Ready,
    /// Currently holds the CPU.
    Running,
    /// Blocked until its ready-not-before deadline passes.
    Sleeping,
    /// Polling a lock held by another task.
    Waiting,
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// A task body. The kernel calls it in a loop, yielding between calls,
/// so a body that returns is simply run again.
#[derive(Debug, Clone, Copy)]
pub enum TaskEntry {
    Plain(fn()),
    WithArg(fn(usize), usize),
}

impl TaskEntry {
    #[inline]
    pub fn run(self) {
        match self {
            TaskEntry::Plain(body) => body(),
            TaskEntry::WithArg(body, arg) => body(arg),
        }
    }
}

// ---------------------------------------------------------------------------
// Task descriptor
// ---------------------------------------------------------------------------

/// One slot of the task table.
///
/// Owned by the [`Scheduler`](crate::scheduler::Scheduler); mutated only by
/// the switcher, or by the owning task's own calls while it is current.
#[derive(Debug, Clone, Copy)]
pub struct TaskDescriptor<C> {
    pub id: TaskId,
    pub state: TaskState,
    /// `None` marks the reserved idle task.
    pub entry: Option<TaskEntry>,
    /// Stack bytes requested at registration, excluding context overhead.
    pub stack_size: usize,
    /// Saved continuation. Written by the port on every switch away.
    pub context: C,
    /// Weight set by the application.
    pub base_priority: u8,
    /// Weight the switcher uses; raised above `base_priority` by donation.
    pub priority: u8,
    /// Ticks left in the current slice.
    pub credit: u8,
    pub ready_at: Option<Deadline>,
    /// Installed at boot when the arena is partitioned.
    pub guard: Option<StackGuard>,
}

impl<C: Continuation> TaskDescriptor<C> {
    /// The reserved idle task. Unregistered slots also hold this value;
    /// they are never scheduled because they lie past `task_count`.
    pub const IDLE: Self = Self {
        id: TaskId::IDLE,
        state: TaskState::Ready,
        entry: None,
        stack_size: IDLE_STACK_SIZE,
        context: C::EMPTY,
        base_priority: DEFAULT_PRIORITY,
        priority: DEFAULT_PRIORITY,
        credit: 0,
        ready_at: None,
        guard: None,
    };

    pub fn new(id: TaskId, entry: TaskEntry, stack_size: usize, priority: u8) -> Self {
        let priority = priority.max(1);
        Self {
            id,
            entry: Some(entry),
            stack_size,
            base_priority: priority,
            priority,
            ..Self::IDLE
        }
    }

    #[inline]
    pub fn is_idle(&self) -> bool {
        self.entry.is_none()
    }

    /// Whether the switcher may pick this task at `now`.
    #[inline]
    pub fn is_eligible(&self, now: Timestamp) -> bool {
        self.ready_at.map_or(true, |deadline| deadline.has_passed(now))
    }

    /// Raise the effective priority to at least `priority`.
    #[inline]
    pub fn donate(&mut self, priority: u8) {
        self.priority = self.priority.max(priority);
    }

    #[inline]
    pub fn restore_priority(&mut self) {
        self.priority = self.base_priority;
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
