//! # Hosted Simulation Port
//!
//! Runs Spindle on a development machine. Every task is an OS thread, but
//! only the thread holding the simulated CPU (the *baton*) executes; all
//! others sit parked on a condition variable. [`Port::switch`] hands the
//! baton to the target task and parks the caller until someone hands it
//! back, which gives the same "the call that suspended me returns later"
//! behaviour as a real context switch.
//!
//! ## Interrupts
//!
//! A background thread plays the timer: every interval it raises a pending
//! tick flag. The tick is *delivered* (the registered [`TickHandler`] runs)
//! only on the baton-holding task thread, and only at points where a real
//! core could take it with interrupts unmasked:
//!
//! - leaving the outermost critical section,
//! - reading the clock,
//! - waiting for an interrupt.
//!
//! ## Critical Sections
//!
//! This module registers the process-wide [`critical_section`]
//! implementation. On a task thread, acquiring it masks that thread's
//! simulated core; mutual exclusion follows from the baton, since only one
//! task of a core runs at a time. Host threads (tests, the boot thread) have
//! no core and serialize on one global lock instead, like the
//! `critical-section` crate's own `std` backend.
//!
//! ## Clocks
//!
//! [`SimPort::new`] reads the host's monotonic clock. [`SimPort::with_manual_clock`]
//! starts at zero and only moves when [`SimPort::advance`] is called, which
//! makes delay tests deterministic.

use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use critical_section::RawRestoreState;

use super::{Continuation, Fault, Port, TickHandler, Trampoline};

/// Host stack given to every simulated task thread. The requested stack
/// slice is far too small for hosted code, so it only sets a lower bound.
const MIN_THREAD_STACK: usize = 256 * 1024;

/// How long an idle simulated core naps in `wait_for_interrupt`.
const IDLE_NAP: Duration = Duration::from_micros(100);

thread_local! {
    /// The core a simulated task thread belongs to; `None` on host threads.
    /// Ticks are only ever delivered on a core's own task threads.
    static CORE: Cell<Option<&'static SimPort>> = const { Cell::new(None) };
    /// Set while this thread runs the tick handler, so it is not re-entered.
    static IN_TICK: Cell<bool> = const { Cell::new(false) };
    /// The host lock, while this host thread is inside a critical section.
    static HOST_SECTION: RefCell<Option<MutexGuard<'static, ()>>> = const { RefCell::new(None) };
}

/// Serializes critical sections taken on host threads.
static HOST_LOCK: Mutex<()> = Mutex::new(());

// ---------------------------------------------------------------------------
// Continuation
// ---------------------------------------------------------------------------

/// A simulated task is identified by the slot of its thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimContext {
    slot: usize,
}

impl Continuation for SimContext {
    const EMPTY: Self = SimContext { slot: usize::MAX };
}

// ---------------------------------------------------------------------------
// Port state
// ---------------------------------------------------------------------------

enum Clock {
    Wall(OnceLock<Instant>),
    Manual(AtomicU64),
}

impl Clock {
    fn micros(&self) -> u64 {
        match self {
            Clock::Wall(epoch) => epoch.get_or_init(Instant::now).elapsed().as_micros() as u64,
            Clock::Manual(us) => us.load(Ordering::Acquire),
        }
    }
}

struct Cpu {
    running: Option<usize>,
}

/// Hosted [`Port`] implementation. Declare it as a `static` next to the
/// kernel that uses it.
pub struct SimPort {
    clock: Clock,
    cpu: Mutex<Cpu>,
    turn: Condvar,
    masked: AtomicBool,
    tick_pending: AtomicBool,
    armed: AtomicBool,
    interval_ms: AtomicU32,
    handler: Mutex<Option<&'static dyn TickHandler>>,
    next_slot: AtomicUsize,
    fault: Mutex<Option<Fault>>,
}

impl SimPort {
    /// A port whose clocks follow the host's monotonic clock.
    pub const fn new() -> Self {
        Self::with_clock(Clock::Wall(OnceLock::new()))
    }

    /// A port whose clocks start at zero and move only on [`advance`](Self::advance).
    pub const fn with_manual_clock() -> Self {
        Self::with_clock(Clock::Manual(AtomicU64::new(0)))
    }

    const fn with_clock(clock: Clock) -> Self {
        Self {
            clock,
            cpu: Mutex::new(Cpu { running: None }),
            turn: Condvar::new(),
            masked: AtomicBool::new(false),
            tick_pending: AtomicBool::new(false),
            armed: AtomicBool::new(false),
            interval_ms: AtomicU32::new(1),
            handler: Mutex::new(None),
            next_slot: AtomicUsize::new(0),
            fault: Mutex::new(None),
        }
    }

    /// Move a manual clock forward. Has no effect on a wall clock.
    pub fn advance(&self, by: Duration) {
        if let Clock::Manual(us) = &self.clock {
            us.fetch_add(by.as_micros() as u64, Ordering::AcqRel);
        }
    }

    /// The fault this core halted on, if it has.
    pub fn fault(&self) -> Option<Fault> {
        *self.fault.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_cpu(&self) -> MutexGuard<'_, Cpu> {
        self.cpu.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Park the calling thread until the baton belongs to `slot`.
    fn await_turn(&self, slot: usize) {
        let mut cpu = self.lock_cpu();
        while cpu.running != Some(slot) {
            cpu = self.turn.wait(cpu).unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn hand_over(&self, slot: usize) {
        self.lock_cpu().running = Some(slot);
        self.turn.notify_all();
    }

    fn is_own_thread(&self) -> bool {
        CORE.get().is_some_and(|core| std::ptr::eq(core, self))
    }

    /// Run the tick handler if a tick is pending and this thread may take it.
    fn deliver_pending(&self) {
        if !self.armed.load(Ordering::Acquire)
            || self.masked.load(Ordering::Acquire)
            || IN_TICK.get()
            || !self.is_own_thread()
        {
            return;
        }
        if !self.tick_pending.swap(false, Ordering::AcqRel) {
            return;
        }
        let handler = *self.handler.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handler) = handler {
            IN_TICK.set(true);
            handler.on_tick();
            IN_TICK.set(false);
        }
    }
}

impl Default for SimPort {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Critical sections
// ---------------------------------------------------------------------------

struct SimCriticalSection;
critical_section::set_impl!(SimCriticalSection);

// SAFETY: on a task thread the section masks the thread's own core, and only
// the baton holder of a core runs; host threads exclude each other through
// `HOST_LOCK`. Both paths nest: only the outermost release unmasks.
unsafe impl critical_section::Impl for SimCriticalSection {
    unsafe fn acquire() -> RawRestoreState {
        match CORE.get() {
            Some(core) => !core.masked.swap(true, Ordering::AcqRel),
            None => HOST_SECTION.with_borrow_mut(|held| {
                if held.is_some() {
                    return false;
                }
                *held = Some(HOST_LOCK.lock().unwrap_or_else(PoisonError::into_inner));
                true
            }),
        }
    }

    unsafe fn release(was_enabled: RawRestoreState) {
        if !was_enabled {
            return;
        }
        match CORE.get() {
            Some(core) => {
                core.masked.store(false, Ordering::Release);
                core.deliver_pending();
            }
            None => HOST_SECTION.with_borrow_mut(|held| drop(held.take())),
        }
    }
}

// ---------------------------------------------------------------------------
// Port implementation
// ---------------------------------------------------------------------------

impl Port for SimPort {
    type Context = SimContext;

    const CONTEXT_OVERHEAD: usize = 0;

    fn now_ms(&self) -> u32 {
        self.deliver_pending();
        (self.clock.micros() / 1_000) as u32
    }

    fn now_us(&self) -> u32 {
        self.deliver_pending();
        self.clock.micros() as u32
    }

    fn timer_arm(&'static self, interval_ms: u32, handler: &'static dyn TickHandler) {
        *self.handler.lock().unwrap_or_else(PoisonError::into_inner) = Some(handler);
        self.interval_ms.store(interval_ms.max(1), Ordering::Release);
        if self.armed.swap(true, Ordering::AcqRel) {
            return;
        }

        let spawned = thread::Builder::new()
            .name("spindle-tick".into())
            .spawn(move || {
                while self.armed.load(Ordering::Acquire) {
                    let interval = self.interval_ms.load(Ordering::Acquire);
                    thread::sleep(Duration::from_millis(u64::from(interval)));
                    if self.armed.load(Ordering::Acquire) {
                        self.tick_pending.store(true, Ordering::Release);
                    }
                }
            });
        if let Err(err) = spawned {
            tracing::error!(%err, "failed to start the simulated tick source");
            self.armed.store(false, Ordering::Release);
        }
    }

    fn timer_disarm(&self) {
        self.armed.store(false, Ordering::Release);
        self.tick_pending.store(false, Ordering::Release);
    }

    unsafe fn init_context(
        &'static self,
        ctx: &mut SimContext,
        stack: &'static mut [u8],
        entry: Trampoline,
        a0: usize,
        a1: usize,
    ) {
        let slot = self.next_slot.fetch_add(1, Ordering::AcqRel);
        *ctx = SimContext { slot };

        let spawned = thread::Builder::new()
            .name(format!("spindle-task-{slot}"))
            .stack_size(stack.len().max(MIN_THREAD_STACK))
            .spawn(move || {
                CORE.set(Some(self));
                self.await_turn(slot);
                // A fresh task starts with interrupts enabled, whatever the
                // task that switched to it had masked.
                self.masked.store(false, Ordering::Release);
                entry(a0, a1)
            });
        if let Err(err) = spawned {
            tracing::error!(%err, slot, "failed to spawn simulated task thread");
            std::process::abort();
        }
    }

    unsafe fn switch(&self, from: *mut SimContext, to: *const SimContext) {
        // SAFETY: the caller guarantees both pointers name initialized
        // continuations that stay put while the switch is in flight.
        let (me, next) = unsafe { ((*from).slot, (*to).slot) };
        if me == next {
            return;
        }
        let mut cpu = self.lock_cpu();
        cpu.running = Some(next);
        self.turn.notify_all();
        while cpu.running != Some(me) {
            cpu = self.turn.wait(cpu).unwrap_or_else(PoisonError::into_inner);
        }
    }

    unsafe fn launch(&'static self, first: *const SimContext) -> ! {
        // SAFETY: `first` was initialized by `init_context`.
        let slot = unsafe { (*first).slot };
        self.masked.store(false, Ordering::Release);
        self.hand_over(slot);
        loop {
            thread::park();
        }
    }

    fn wait_for_interrupt(&self) {
        thread::sleep(IDLE_NAP);
        self.deliver_pending();
    }

    /// Stop the simulated core: the baton is never handed on, so every task
    /// of this core stays parked. The fault stays readable via
    /// [`SimPort::fault`].
    fn halt(&self, fault: Fault) -> ! {
        tracing::error!(%fault, "simulated core halted");
        *self.fault.lock().unwrap_or_else(PoisonError::into_inner) = Some(fault);
        self.timer_disarm();
        loop {
            thread::park();
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_moves_only_when_advanced() {
        let port = SimPort::with_manual_clock();
        assert_eq!(port.now_ms(), 0);
        assert_eq!(port.now_us(), 0);

        port.advance(Duration::from_micros(2_500));
        assert_eq!(port.now_ms(), 2);
        assert_eq!(port.now_us(), 2_500);
    }

    #[test]
    fn test_wall_clock_is_monotonic() {
        let port = SimPort::new();
        let first = port.now_us();
        thread::sleep(Duration::from_millis(2));
        assert!(port.now_us().wrapping_sub(first) >= 1_000);
    }

    #[test]
    fn test_host_critical_sections_nest_and_release() {
        let nested = critical_section::with(|_| critical_section::with(|_| 3));
        assert_eq!(nested, 3);
        // Fully released, so another host thread gets in.
        let other = thread::spawn(|| critical_section::with(|_| 7)).join().unwrap();
        assert_eq!(other, 7);
    }

    #[test]
    fn test_task_thread_sections_mask_their_core() {
        static PORT: SimPort = SimPort::new();
        thread::spawn(|| {
            CORE.set(Some(&PORT));
            critical_section::with(|_| {
                critical_section::with(|_| ());
                assert!(PORT.masked.load(Ordering::Acquire));
            });
            assert!(!PORT.masked.load(Ordering::Acquire));
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_ticks_are_not_delivered_off_task_threads() {
        struct Counter(AtomicU32);
        impl TickHandler for Counter {
            fn on_tick(&self) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }
        static PORT: SimPort = SimPort::new();
        static COUNTER: Counter = Counter(AtomicU32::new(0));

        *PORT.handler.lock().unwrap() = Some(&COUNTER);
        PORT.armed.store(true, Ordering::Release);
        PORT.tick_pending.store(true, Ordering::Release);
        PORT.now_ms();
        PORT.wait_for_interrupt();
        assert_eq!(COUNTER.0.load(Ordering::Relaxed), 0);
        assert!(PORT.tick_pending.load(Ordering::Acquire));
    }
}
