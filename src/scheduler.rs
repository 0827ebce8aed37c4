//! # Scheduler
//!
//! The context switcher's decision logic. Holds the task table and picks
//! the next task to run; performing the switch itself is left to the
//! [`Port`](crate::arch::Port), so everything here is plain data and can be
//! unit-tested on the host.
//!
//! ## Scheduling Algorithm
//!
//! Weighted round robin over the task table:
//! 1. **Scan**: starting after the current task, walk the table cyclically
//!    and pick the first task whose ready-not-before deadline has passed.
//!    The idle task (index 0) is always eligible, so the scan ends within
//!    one lap.
//! 2. **Slice**: the picked task is given `credit = priority` ticks.
//! 3. **Tick**: in preemptive mode each tick that lands on the same task
//!    spends one credit instead of rescanning. At zero credit, scan again.
//!    Priority therefore buys a longer slice, never an earlier one: a
//!    running task is not preempted mid-slice by a higher weight.
//!
//! ## Priority Donation
//!
//! A task that waits on a lock raises the owner's effective priority to
//! `max(owner, waiter)`, which lengthens the owner's next slices until it
//! releases the lock and falls back to its base priority.

use crate::arch::Continuation;
use crate::config::MAX_TASKS;
use crate::error::Error;
use crate::task::{TaskDescriptor, TaskEntry, TaskId, TaskState};
use crate::time::{Deadline, Timestamp};

/// When the switcher runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Only at explicit yields, delays and blocking calls.
    Cooperative,
    /// Also from the periodic tick.
    Preemptive,
}

/// Why the switcher was entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchReason {
    Yield,
    Sleep,
    Wait,
    Tick,
}

/// A switch the port has to carry out, as task table indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Switch {
    pub from: usize,
    pub to: usize,
}

// ---------------------------------------------------------------------------
// Scheduler struct
// ---------------------------------------------------------------------------

/// The task table plus the switcher's bookkeeping.
///
/// ## Design Notes
///
/// - All tasks are stored inline in a fixed-size array (no heap)
/// - Index 0 is the idle task and is present from construction
/// - The table is frozen once [`boot`](Self::boot) has run
pub struct Scheduler<C> {
    tasks: [TaskDescriptor<C>; MAX_TASKS],
    task_count: usize,
    current: usize,
    mode: Option<Mode>,
    ticks: u64,
}

impl<C: Continuation> Scheduler<C> {
    /// Create a scheduler holding only the idle task.
    pub const fn new() -> Self {
        Self {
            tasks: [TaskDescriptor::<C>::IDLE; MAX_TASKS],
            task_count: 1,
            current: 0,
            mode: None,
            ticks: 0,
        }
    }

    /// Append a task to the table.
    pub fn register(
        &mut self,
        entry: TaskEntry,
        stack_size: usize,
        priority: u8,
    ) -> Result<TaskId, Error> {
        if self.mode.is_some() {
            return Err(Error::AlreadyStarted);
        }
        if self.task_count >= MAX_TASKS {
            return Err(Error::CapacityExceeded);
        }

        let id = TaskId(self.task_count as u8);
        self.tasks[self.task_count] = TaskDescriptor::new(id, entry, stack_size, priority);
        self.task_count += 1;
        Ok(id)
    }

    /// Freeze the table and make the idle task current.
    pub fn boot(&mut self, mode: Mode) -> Result<(), Error> {
        if self.mode.is_some() {
            return Err(Error::AlreadyStarted);
        }
        self.mode = Some(mode);
        self.current = 0;
        let idle = &mut self.tasks[0];
        idle.state = TaskState::Running;
        idle.credit = idle.priority;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Selection
    // -----------------------------------------------------------------------

    /// Pick the task to run next.
    ///
    /// Returns `None` when the current task keeps the CPU, either because a
    /// tick landed inside its slice or because the scan came back to it.
    pub fn select(&mut self, reason: SwitchReason, now: Timestamp) -> Option<Switch> {
        let from = self.current;

        if reason == SwitchReason::Tick {
            let task = &mut self.tasks[from];
            task.credit = task.credit.saturating_sub(1);
            if task.credit > 0 && task.state == TaskState::Running && task.is_eligible(now) {
                return None;
            }
        }

        let to = self.scan(now);

        let outgoing = &mut self.tasks[from];
        if outgoing.state == TaskState::Running {
            outgoing.state = TaskState::Ready;
        }

        let incoming = &mut self.tasks[to];
        incoming.state = TaskState::Running;
        incoming.ready_at = None;
        incoming.credit = incoming.priority;
        self.current = to;

        (to != from).then_some(Switch { from, to })
    }

    /// First eligible task after the current one, wrapping around.
    fn scan(&self, now: Timestamp) -> usize {
        (1..=self.task_count)
            .map(|step| (self.current + step) % self.task_count)
            .find(|&index| self.tasks[index].is_eligible(now))
            .unwrap_or(0)
    }

    /// Whether any task other than idle could run at `now`.
    pub fn has_ready_task(&self, now: Timestamp) -> bool {
        self.tasks[1..self.task_count]
            .iter()
            .any(|task| task.is_eligible(now))
    }

    // -----------------------------------------------------------------------
    // Current task transitions
    // -----------------------------------------------------------------------

    /// Put the current task to sleep until `deadline`. Its remaining slice
    /// is forfeited.
    pub fn sleep_current(&mut self, deadline: Deadline) {
        let task = &mut self.tasks[self.current];
        task.state = TaskState::Sleeping;
        task.ready_at = Some(deadline);
        task.credit = 0;
    }

    /// Mark the current task as polling a lock.
    pub fn mark_waiting(&mut self) {
        self.tasks[self.current].state = TaskState::Waiting;
    }

    /// Raise `owner`'s effective priority to at least the current task's.
    /// Returns the owner's effective priority afterwards.
    pub fn donate(&mut self, owner: TaskId) -> Option<u8> {
        let donor = self.tasks[self.current].priority;
        let task = self.tasks[..self.task_count].get_mut(owner.index())?;
        task.donate(donor);
        Some(task.priority)
    }

    /// Drop any donated priority of the current task.
    pub fn restore_priority(&mut self) {
        self.tasks[self.current].restore_priority();
    }

    /// Set the base weight of `id`. The effective weight follows it,
    /// except that an active donation is kept until the next restore.
    pub fn set_priority(&mut self, id: TaskId, priority: u8) -> Result<(), Error> {
        if id == TaskId::IDLE {
            return Err(Error::ReservedTask);
        }
        let task = self.task_mut(id)?;
        let priority = priority.max(1);
        let donated = task.priority > task.base_priority;
        task.base_priority = priority;
        task.priority = if donated {
            task.priority.max(priority)
        } else {
            priority
        };
        Ok(())
    }

    /// Count one timer tick.
    pub fn tick(&mut self) {
        self.ticks = self.ticks.wrapping_add(1);
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn current(&self) -> TaskId {
        self.tasks[self.current].id
    }

    pub fn current_task(&self) -> &TaskDescriptor<C> {
        &self.tasks[self.current]
    }

    pub fn task_count(&self) -> usize {
        self.task_count
    }

    pub fn mode(&self) -> Option<Mode> {
        self.mode
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// The registered tasks, idle included.
    pub fn tasks(&self) -> &[TaskDescriptor<C>] {
        &self.tasks[..self.task_count]
    }

    pub(crate) fn tasks_mut(&mut self) -> &mut [TaskDescriptor<C>] {
        &mut self.tasks[..self.task_count]
    }

    pub fn task(&self, id: TaskId) -> Result<&TaskDescriptor<C>, Error> {
        self.tasks().get(id.index()).ok_or(Error::NoSuchTask)
    }

    fn task_mut(&mut self, id: TaskId) -> Result<&mut TaskDescriptor<C>, Error> {
        self.tasks_mut().get_mut(id.index()).ok_or(Error::NoSuchTask)
    }

    /// Raw pointers to the two continuations of `switch`, for the port.
    pub(crate) fn contexts(&mut self, switch: Switch) -> (*mut C, *const C) {
        (
            core::ptr::addr_of_mut!(self.tasks[switch.from].context),
            core::ptr::addr_of!(self.tasks[switch.to].context),
        )
    }
}

impl<C: Continuation> Default for Scheduler<C> {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
