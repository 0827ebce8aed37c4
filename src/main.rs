//! # Spindle Example Firmware
//!
//! Runs the preemptive scheduler on a Cortex-M4 with five tasks that
//! exercise every primitive:
//!
//! | Task | Priority | Behavior |
//! |------|----------|----------|
//! | `heartbeat` (×2) | 1 | Toggles a counter at a fixed period via `delay_until_ms` |
//! | `sampler` | 2 | Produces a reading every 10ms into a bounded queue |
//! | `aggregator` | 2 | Drains the queue, updates a lock-protected total, signals every 16 samples |
//! | `number_cruncher` | 3 | Never yields; only preemption takes the CPU away |
//!
//! ## Expected Dynamics
//!
//! 1. The cruncher keeps the CPU for three ticks per turn, everyone else
//!    for one or two, so the sleeping tasks still wake on time.
//! 2. The aggregator and the sampler hand readings over through the queue;
//!    when the aggregator falls behind, `enqueue_timeout` gives up and the
//!    reading is dropped instead of blocking the sampler forever.
//! 3. Contention on `TOTAL_LOCK` lends the waiter's weight to the holder.

#![no_std]
#![no_main]

use core::sync::atomic::{AtomicU32, Ordering};

use cortex_m_rt::entry;
use panic_halt as _;

use spindle::arch::cortex_m4::CortexM4;
use spindle::config::DEFAULT_STACK_SIZE;
use spindle::{Kernel, Mode, Mutex, Queue, Semaphore, TaskEntry};

type Os = Kernel<CortexM4>;

static KERNEL: Os = Kernel::new(CortexM4::new());

static SAMPLES: Queue<Os, u16, 8> = Queue::new(&KERNEL);
static TOTAL_LOCK: Mutex<Os> = Mutex::new(&KERNEL);
static BATCH_DONE: Semaphore<Os> = Semaphore::new(&KERNEL, false);

static TOTAL: AtomicU32 = AtomicU32::new(0);
static HEARTBEATS: [AtomicU32; 2] = [AtomicU32::new(0), AtomicU32::new(0)];

// ---------------------------------------------------------------------------
// Task entry points
// ---------------------------------------------------------------------------

/// **Heartbeat** (Priority 1)
///
/// `arg` selects the counter and sets the period (`250ms × (arg + 1)`).
/// Uses absolute deadlines so the period does not drift with the time the
/// body itself takes.
fn heartbeat(arg: usize) {
    let period = 250 * (arg as u32 + 1);
    let mut next = KERNEL.now_ms();
    loop {
        HEARTBEATS[arg].fetch_add(1, Ordering::Relaxed);
        next = next.wrapping_add(period);
        KERNEL.delay_until_ms(next);
    }
}

/// **Sampler** (Priority 2)
///
/// Stands in for an ADC: produces a reading every 10ms.
fn sampler() {
    let mut reading: u16 = 0;
    loop {
        reading = reading.wrapping_mul(31).wrapping_add(7) & 0x0FFF;
        // Drop the reading if the aggregator is more than 5ms behind.
        let _ = SAMPLES.enqueue_timeout(reading, 5);
        KERNEL.delay_ms(10);
    }
}

/// **Aggregator** (Priority 2)
fn aggregator() {
    let mut batch = 0u32;
    loop {
        let Ok(reading) = SAMPLES.dequeue_timeout(100) else {
            continue;
        };
        if let Ok(_guard) = TOTAL_LOCK.scoped() {
            // Read-modify-write, only safe under the lock.
            let total = TOTAL.load(Ordering::Relaxed);
            TOTAL.store(total.wrapping_add(u32::from(reading)), Ordering::Relaxed);
        }
        batch += 1;
        if batch == 16 {
            batch = 0;
            BATCH_DONE.give();
        }
    }
}

/// **Number Cruncher** (Priority 3)
///
/// Never yields. Between batches it resets the total, which needs the lock
/// and so competes with the aggregator.
fn number_cruncher() {
    let mut acc: u32 = 0;
    loop {
        for _ in 0..10_000 {
            acc = acc.wrapping_mul(1_103_515_245).wrapping_add(12_345);
        }
        if BATCH_DONE.try_take().is_ok() {
            if let Ok(_guard) = TOTAL_LOCK.scoped_timeout(20) {
                TOTAL.store(acc & 0xFF, Ordering::Relaxed);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Main entry point
// ---------------------------------------------------------------------------

/// Firmware entry point. Registers the tasks and boots the scheduler in
/// preemptive mode. Does not return.
#[entry]
fn main() -> ! {
    let mut cp = cortex_m::Peripherals::take().expect("core peripherals already taken");
    KERNEL.port().configure(&mut cp.SYST);

    // --- Create tasks ---
    for arg in 0..HEARTBEATS.len() {
        KERNEL
            .register(TaskEntry::WithArg(heartbeat, arg), DEFAULT_STACK_SIZE, 1)
            .expect("Failed to register heartbeat");
    }
    KERNEL
        .register(TaskEntry::Plain(sampler), DEFAULT_STACK_SIZE, 2)
        .expect("Failed to register sampler");
    KERNEL
        .register(TaskEntry::Plain(aggregator), DEFAULT_STACK_SIZE, 2)
        .expect("Failed to register aggregator");
    KERNEL
        .register(TaskEntry::Plain(number_cruncher), DEFAULT_STACK_SIZE, 3)
        .expect("Failed to register number_cruncher");

    let arena: &'static mut [u8; 8192] =
        cortex_m::singleton!(: [u8; 8192] = [0; 8192]).expect("arena already taken");

    // Start the scheduler. Only returns if booting failed.
    match KERNEL.start(Mode::Preemptive, arena) {
        Ok(never) => match never {},
        Err(_) => loop {
            cortex_m::asm::bkpt();
        },
    }
}
