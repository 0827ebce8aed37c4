//! # Kernel
//!
//! The scheduler facade. A [`Kernel`] owns a [`Port`] and the task table,
//! and is normally declared as a `static` so tasks and interrupt handlers
//! can reach it.
//!
//! ## Startup Sequence
//!
//! ```text
//! main()
//!   ├─► KERNEL.register()    ← Add tasks (×N), before boot only
//!   └─► KERNEL.start()       ← Boot the scheduler (no return on success)
//!         ├─► Carve the stack arena, one guarded slice per task
//!         ├─► Build every task's initial continuation (trampoline)
//!         ├─► Arm the periodic tick (preemptive mode only)
//!         └─► Launch the idle task (index 0)
//! ```
//!
//! ## Switch Path
//!
//! Every switch, whether a task asked for it (`yield_now`, a delay, a
//! contended lock) or the tick forced it, goes through one routine that
//! runs entirely inside a critical section: update the task table, check
//! the outgoing task's stack guard, pick the next task, and hand both
//! continuations to [`Port::switch`].

use core::cell::RefCell;
use core::convert::Infallible;

use critical_section::{CriticalSection, Mutex as CsMutex};

use crate::arch::{Fault, Port, TickHandler, Trampoline};
use crate::arena::{StackArena, StackSlice};
use crate::config::{MAX_TASKS, PREEMPT_INTERVAL_MS};
use crate::error::Error;
use crate::scheduler::{Mode, Scheduler, SwitchReason};
use crate::task::{TaskEntry, TaskId, TaskState};
use crate::time::{Deadline, Timestamp};

// ---------------------------------------------------------------------------
// Executive: what the blocking primitives need from a scheduler
// ---------------------------------------------------------------------------

/// The services locks and containers build on. [`Kernel`] is the real
/// implementation; tests substitute a mock.
pub trait Executive: Sync {
    fn current_task_id(&self) -> TaskId;

    /// Give up the CPU to the next eligible task.
    fn yield_now(&self);

    fn now_ms(&self) -> u32;

    /// Yield while waiting on a lock. `owner` is asked for the lock's
    /// holder inside the switch's critical section; if it names one, the
    /// caller donates its priority to it and is marked as waiting. A lock
    /// released since the caller's last attempt gets no donation.
    fn wait_on(&self, owner: impl FnOnce() -> Option<TaskId>);

    /// Drop any priority donated to the calling task.
    fn restore_priority(&self);
}

// ---------------------------------------------------------------------------
// Kernel
// ---------------------------------------------------------------------------

/// A scheduler instance bound to a port.
pub struct Kernel<P: Port> {
    port: P,
    sched: CsMutex<RefCell<Scheduler<P::Context>>>,
}

impl<P: Port> Kernel<P> {
    pub const fn new(port: P) -> Self {
        Self {
            port,
            sched: CsMutex::new(RefCell::new(Scheduler::new())),
        }
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    fn with_scheduler<R>(&self, f: impl FnOnce(&mut Scheduler<P::Context>) -> R) -> R {
        critical_section::with(|cs| f(&mut self.sched.borrow_ref_mut(cs)))
    }

    fn timestamp(&self) -> Timestamp {
        Timestamp {
            ms: self.port.now_ms(),
            us: self.port.now_us(),
        }
    }

    // -----------------------------------------------------------------------
    // Setup
    // -----------------------------------------------------------------------

    /// Create a new task and register it with the scheduler.
    ///
    /// # Parameters
    /// - `entry`: Task body. It is called in a loop, with a yield between
    ///   calls, so it may either return or run forever.
    /// - `stack_bytes`: Stack the task needs, excluding the port's context
    ///   overhead.
    /// - `priority`: Weight; the task keeps the CPU for up to `priority`
    ///   ticks per turn. 0 is treated as 1.
    ///
    /// # Returns
    /// - `Ok(id)`: The task's identity.
    /// - `Err(Error::CapacityExceeded)`: The table (`MAX_TASKS`, idle
    ///   included) is full.
    /// - `Err(Error::AlreadyStarted)`: Tasks cannot be added after boot.
    ///
    /// # Example
    /// ```ignore
    /// KERNEL.register(TaskEntry::WithArg(blink, 13), DEFAULT_STACK_SIZE, 2)?;
    /// ```
    pub fn register(
        &self,
        entry: TaskEntry,
        stack_bytes: usize,
        priority: u8,
    ) -> Result<TaskId, Error> {
        let id = self.with_scheduler(|sched| sched.register(entry, stack_bytes, priority))?;
        tracing::debug!(task = id.get(), stack_bytes, priority, "task registered");
        Ok(id)
    }

    /// Boot the scheduler. **Does not return** unless booting fails.
    ///
    /// Partitions `arena` into one guarded stack slice per task (idle
    /// included), installs each task's initial continuation, arms the tick
    /// in preemptive mode and transfers control to the idle task.
    ///
    /// # Errors
    /// - `Error::AlreadyStarted`: The kernel has already booted.
    /// - `Error::ArenaExhausted`: `arena` cannot hold every stack. Nothing
    ///   has been started in that case.
    pub fn start(&'static self, mode: Mode, arena: &'static mut [u8]) -> Result<Infallible, Error> {
        let kernel = self as *const Self as usize;
        let entry: Trampoline = trampoline::<P>;

        let (first, task_count) = critical_section::with(|cs| {
            let mut sched = self.sched.borrow_ref_mut(cs);
            if sched.mode().is_some() {
                return Err(Error::AlreadyStarted);
            }

            // Carve every slice before touching any task, so a failure
            // leaves nothing half-started.
            let mut arena = StackArena::new(arena);
            let mut slices: [Option<StackSlice>; MAX_TASKS] = [const { None }; MAX_TASKS];
            for (slot, task) in slices.iter_mut().zip(sched.tasks()) {
                let bytes = task.stack_size.saturating_add(P::CONTEXT_OVERHEAD);
                *slot = Some(arena.carve(bytes)?);
            }

            for (index, (task, slice)) in sched.tasks_mut().iter_mut().zip(slices).enumerate() {
                let Some(StackSlice { stack, guard }) = slice else {
                    continue;
                };
                task.guard = Some(guard);
                // SAFETY: each slice is carved from the 'static arena exactly
                // once, and the context lives in this 'static kernel.
                unsafe {
                    self.port.init_context(&mut task.context, stack, entry, kernel, index);
                }
            }

            sched.boot(mode)?;
            tracing::info!(
                ?mode,
                tasks = sched.task_count(),
                arena_left = arena.remaining(),
                "scheduler starting"
            );
            Ok((
                core::ptr::addr_of!(sched.tasks()[0].context),
                sched.task_count(),
            ))
        })?;

        if mode == Mode::Preemptive {
            self.port.timer_arm(PREEMPT_INTERVAL_MS, self);
            tracing::debug!(interval_ms = PREEMPT_INTERVAL_MS, task_count, "preemption tick armed");
        }

        // SAFETY: `first` is the idle task's continuation, initialized above.
        unsafe { self.port.launch(first) }
    }

    // -----------------------------------------------------------------------
    // Switching
    // -----------------------------------------------------------------------

    /// The single switch routine. `prepare` updates the task table for
    /// `reason` before the next task is picked. Does nothing before boot.
    fn reschedule(&self, reason: SwitchReason, prepare: impl FnOnce(&mut Scheduler<P::Context>)) {
        critical_section::with(|cs| {
            let now = self.timestamp();
            let contexts = {
                let mut sched = self.sched.borrow_ref_mut(cs);
                if sched.mode().is_none() {
                    return;
                }
                prepare(&mut sched);
                if reason == SwitchReason::Tick {
                    sched.tick();
                }

                let outgoing = sched.current_task();
                if let Some(guard) = outgoing.guard {
                    if !guard.is_intact() {
                        let task = outgoing.id;
                        tracing::error!(task = task.get(), "stack guard corrupted");
                        self.port.halt(Fault::StackOverflow { task });
                    }
                }

                let Some(switch) = sched.select(reason, now) else {
                    return;
                };
                tracing::trace!(from = switch.from, to = switch.to, ?reason, "switch");
                sched.contexts(switch)
            };

            let (from, to) = contexts;
            // SAFETY: both continuations live in the task table of this
            // kernel, the borrow of the table has ended, and interrupts are
            // still masked.
            unsafe { self.port.switch(from, to) };
        });
    }

    /// Voluntarily give up the CPU. Returns immediately before boot.
    pub fn yield_now(&self) {
        self.reschedule(SwitchReason::Yield, |_| {});
    }

    fn sleep_until(&self, deadline: Deadline) {
        if self.mode().is_none() {
            while !deadline.has_passed(self.timestamp()) {
                self.port.wait_for_interrupt();
            }
            return;
        }
        self.reschedule(SwitchReason::Sleep, |sched| sched.sleep_current(deadline));
    }

    /// Suspend the calling task for at least `ms` milliseconds.
    pub fn delay_ms(&self, ms: u32) {
        let deadline = self.port.now_ms().wrapping_add(ms);
        self.sleep_until(Deadline::Millis(deadline));
    }

    /// Suspend the calling task for at least `us` microseconds.
    pub fn delay_us(&self, us: u32) {
        let deadline = self.port.now_us().wrapping_add(us);
        self.sleep_until(Deadline::Micros(deadline));
    }

    /// Suspend the calling task until the millisecond clock reads `at`.
    pub fn delay_until_ms(&self, at: u32) {
        self.sleep_until(Deadline::Millis(at));
    }

    /// Suspend the calling task until the microsecond clock reads `at`.
    pub fn delay_until_us(&self, at: u32) {
        self.sleep_until(Deadline::Micros(at));
    }

    /// Body of the idle task: sleep the core when nobody else can run.
    fn idle(&self) {
        let now = self.timestamp();
        if !self.with_scheduler(|sched| sched.has_ready_task(now)) {
            self.port.wait_for_interrupt();
        }
    }

    // -----------------------------------------------------------------------
    // Priorities
    // -----------------------------------------------------------------------

    /// Set the base and effective weight of `id`.
    pub fn set_priority(&self, id: TaskId, priority: u8) -> Result<(), Error> {
        self.with_scheduler(|sched| sched.set_priority(id, priority))?;
        tracing::debug!(task = id.get(), priority, "priority changed");
        Ok(())
    }

    /// Set the base and effective weight of the calling task.
    pub fn set_current_priority(&self, priority: u8) -> Result<(), Error> {
        self.set_priority(self.current_task_id(), priority)
    }

    fn donate_and_wait(&self, owner: impl FnOnce() -> Option<TaskId>) {
        self.reschedule(SwitchReason::Wait, |sched| {
            // Still inside the switch's critical section, so the owner
            // cannot release the lock between this check and the donation.
            let Some(owner) = owner() else {
                return;
            };
            if let Some(priority) = sched.donate(owner) {
                tracing::trace!(owner = owner.get(), priority, "priority donated");
            }
            sched.mark_waiting();
        });
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    pub fn current_task_id(&self) -> TaskId {
        self.with_scheduler(|sched| sched.current())
    }

    pub fn now_ms(&self) -> u32 {
        self.port.now_ms()
    }

    pub fn now_us(&self) -> u32 {
        self.port.now_us()
    }

    /// Registered tasks, idle included.
    pub fn task_count(&self) -> usize {
        self.with_scheduler(|sched| sched.task_count())
    }

    /// `None` until the kernel has booted.
    pub fn mode(&self) -> Option<Mode> {
        self.with_scheduler(|sched| sched.mode())
    }

    /// Preemption ticks handled since boot.
    pub fn ticks(&self) -> u64 {
        self.with_scheduler(|sched| sched.ticks())
    }

    pub fn task_state(&self, id: TaskId) -> Result<TaskState, Error> {
        self.with_scheduler(|sched| sched.task(id).map(|task| task.state))
    }

    pub fn base_priority(&self, id: TaskId) -> Result<u8, Error> {
        self.with_scheduler(|sched| sched.task(id).map(|task| task.base_priority))
    }

    /// The weight the switcher uses, including any donation.
    pub fn effective_priority(&self, id: TaskId) -> Result<u8, Error> {
        self.with_scheduler(|sched| sched.task(id).map(|task| task.priority))
    }

    /// Execute a closure with interrupts masked.
    pub fn critical_section<R>(&self, f: impl FnOnce(CriticalSection<'_>) -> R) -> R {
        critical_section::with(f)
    }
}

impl<P: Port> TickHandler for Kernel<P> {
    fn on_tick(&self) {
        self.reschedule(SwitchReason::Tick, |_| {});
    }
}

impl<P: Port> Executive for Kernel<P> {
    fn current_task_id(&self) -> TaskId {
        Kernel::current_task_id(self)
    }

    fn yield_now(&self) {
        Kernel::yield_now(self);
    }

    fn now_ms(&self) -> u32 {
        Kernel::now_ms(self)
    }

    fn wait_on(&self, owner: impl FnOnce() -> Option<TaskId>) {
        self.donate_and_wait(owner);
    }

    fn restore_priority(&self) {
        self.with_scheduler(|sched| sched.restore_priority());
    }
}

// ---------------------------------------------------------------------------
// Trampoline
// ---------------------------------------------------------------------------

/// First code of every task. Runs the task body forever, yielding between
/// calls; the idle task (no body) polls for work instead.
extern "C" fn trampoline<P: Port>(kernel: usize, index: usize) -> ! {
    // SAFETY: `start` passes the address of a 'static `Kernel<P>`.
    let kernel = unsafe { &*(kernel as *const Kernel<P>) };
    let entry = kernel.with_scheduler(|sched| sched.tasks().get(index).and_then(|task| task.entry));
    loop {
        match entry {
            Some(entry) => entry.run(),
            None => kernel.idle(),
        }
        kernel.yield_now();
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::sim::SimPort;
    use crate::config::DEFAULT_STACK_SIZE;
    use std::thread;
    use std::time::{Duration, Instant};

    fn noop() {}

    #[test]
    fn test_register_reports_ids_and_capacity() {
        static KERNEL: Kernel<SimPort> = Kernel::new(SimPort::new());
        for expected in 1..MAX_TASKS {
            let id = KERNEL
                .register(TaskEntry::Plain(noop), DEFAULT_STACK_SIZE, 1)
                .unwrap();
            assert_eq!(id.index(), expected);
        }
        assert_eq!(
            KERNEL.register(TaskEntry::Plain(noop), DEFAULT_STACK_SIZE, 1),
            Err(Error::CapacityExceeded)
        );
        assert_eq!(KERNEL.task_count(), MAX_TASKS);
        assert_eq!(KERNEL.mode(), None);
    }

    #[test]
    fn test_start_with_small_arena_fails_cleanly() {
        static KERNEL: Kernel<SimPort> = Kernel::new(SimPort::new());
        KERNEL
            .register(TaskEntry::Plain(noop), DEFAULT_STACK_SIZE, 1)
            .unwrap();
        let arena = Box::leak(vec![0u8; 64].into_boxed_slice());
        assert_eq!(
            KERNEL.start(Mode::Cooperative, arena).err(),
            Some(Error::ArenaExhausted)
        );
        // Still unbooted, so registration stays open.
        assert_eq!(KERNEL.mode(), None);
        assert!(KERNEL.register(TaskEntry::Plain(noop), 64, 1).is_ok());
    }

    #[test]
    fn test_priorities_before_boot() {
        static KERNEL: Kernel<SimPort> = Kernel::new(SimPort::new());
        let id = KERNEL.register(TaskEntry::Plain(noop), 128, 2).unwrap();
        KERNEL.set_priority(id, 6).unwrap();
        assert_eq!(KERNEL.base_priority(id), Ok(6));
        assert_eq!(KERNEL.effective_priority(id), Ok(6));
        assert_eq!(KERNEL.task_state(id), Ok(TaskState::Ready));

        // Before boot the caller counts as the idle task.
        assert_eq!(KERNEL.current_task_id(), TaskId::IDLE);
        assert_eq!(KERNEL.set_current_priority(3), Err(Error::ReservedTask));
        assert_eq!(KERNEL.task_state(TaskId(4)), Err(Error::NoSuchTask));
    }

    #[test]
    fn test_yield_and_delay_before_boot() {
        static KERNEL: Kernel<SimPort> = Kernel::new(SimPort::new());
        KERNEL.yield_now();

        let start = KERNEL.now_us();
        KERNEL.delay_ms(2);
        assert!(KERNEL.now_us().wrapping_sub(start) >= 2_000);
        assert_eq!(KERNEL.ticks(), 0);
    }

    #[test]
    fn test_corrupted_guard_halts_on_next_switch() {
        static KERNEL: Kernel<SimPort> = Kernel::new(SimPort::new());

        fn overrun() {
            KERNEL.with_scheduler(|sched| {
                if let Some(guard) = sched.current_task().guard {
                    guard.clobber();
                }
            });
            KERNEL.yield_now();
        }

        let victim = KERNEL
            .register(TaskEntry::Plain(overrun), DEFAULT_STACK_SIZE, 1)
            .unwrap();
        let arena = Box::leak(vec![0u8; 16 * 1024].into_boxed_slice());
        thread::spawn(move || KERNEL.start(Mode::Cooperative, arena));

        let deadline = Instant::now() + Duration::from_secs(10);
        while KERNEL.port().fault().is_none() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(
            KERNEL.port().fault(),
            Some(Fault::StackOverflow { task: victim })
        );
    }
}
