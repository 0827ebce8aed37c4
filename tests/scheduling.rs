//! Scheduling behaviour on the simulator port: round robin, delays,
//! preemption.

mod common;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use common::{boot, wait_until};
use spindle::arch::sim::SimPort;
use spindle::{Error, Kernel, Mode, TaskEntry};

#[test]
fn cooperative_tasks_take_turns() {
    static KERNEL: Kernel<SimPort> = Kernel::new(SimPort::new());
    static COUNTS: [AtomicU32; 3] = [AtomicU32::new(0), AtomicU32::new(0), AtomicU32::new(0)];
    static SNAPSHOT: [AtomicU32; 3] = [AtomicU32::new(0), AtomicU32::new(0), AtomicU32::new(0)];
    static SNAPPED: AtomicBool = AtomicBool::new(false);
    static RESTART: AtomicU32 = AtomicU32::new(0);

    fn body(arg: usize) {
        let count = COUNTS[arg].fetch_add(1, Ordering::Relaxed) + 1;
        if arg == 0 && count == 500 {
            // Every other task is suspended right now, so this is a
            // consistent view of the table.
            for (snap, count) in SNAPSHOT.iter().zip(&COUNTS) {
                snap.store(count.load(Ordering::Relaxed), Ordering::Relaxed);
            }
            let arena: &'static mut [u8] = Box::leak(Box::new([0u8; 64]));
            let again = KERNEL.start(Mode::Cooperative, arena).err();
            RESTART.store(u32::from(again == Some(Error::AlreadyStarted)), Ordering::Relaxed);
            SNAPPED.store(true, Ordering::Release);
        }
        KERNEL.yield_now();
    }

    for arg in 0..3 {
        KERNEL.register(TaskEntry::WithArg(body, arg), 256, 1).unwrap();
    }
    boot(&KERNEL, Mode::Cooperative);

    assert!(wait_until(Duration::from_secs(30), || SNAPPED.load(Ordering::Acquire)));
    let snapshot: Vec<u32> = SNAPSHOT.iter().map(|c| c.load(Ordering::Relaxed)).collect();
    for count in &snapshot {
        assert!((499..=500).contains(count), "{snapshot:?}");
    }
    assert_eq!(RESTART.load(Ordering::Relaxed), 1);
}

#[test]
fn delays_never_wake_early_on_manual_clock() {
    static KERNEL: Kernel<SimPort> = Kernel::new(SimPort::with_manual_clock());
    static EARLY: AtomicU32 = AtomicU32::new(0);
    static WAKES: AtomicU32 = AtomicU32::new(0);

    fn sleep_ms() {
        let start = KERNEL.now_ms();
        KERNEL.delay_ms(5);
        if KERNEL.now_ms().wrapping_sub(start) < 5 {
            EARLY.fetch_add(1, Ordering::Relaxed);
        }
        WAKES.fetch_add(1, Ordering::Relaxed);
    }

    fn sleep_us() {
        let start = KERNEL.now_us();
        KERNEL.delay_us(1_500);
        if KERNEL.now_us().wrapping_sub(start) < 1_500 {
            EARLY.fetch_add(1, Ordering::Relaxed);
        }
        WAKES.fetch_add(1, Ordering::Relaxed);
    }

    fn sleep_until() {
        let target = KERNEL.now_ms().wrapping_add(3);
        KERNEL.delay_until_ms(target);
        if (KERNEL.now_ms().wrapping_sub(target) as i32) < 0 {
            EARLY.fetch_add(1, Ordering::Relaxed);
        }
        WAKES.fetch_add(1, Ordering::Relaxed);
    }

    KERNEL.register(TaskEntry::Plain(sleep_ms), 256, 1).unwrap();
    KERNEL.register(TaskEntry::Plain(sleep_us), 256, 2).unwrap();
    KERNEL.register(TaskEntry::Plain(sleep_until), 256, 1).unwrap();
    boot(&KERNEL, Mode::Cooperative);

    let woke = wait_until(Duration::from_secs(30), || {
        KERNEL.port().advance(Duration::from_micros(250));
        WAKES.load(Ordering::Relaxed) >= 30
    });
    assert!(woke);
    assert_eq!(EARLY.load(Ordering::Relaxed), 0);
}

#[test]
fn preemption_takes_cpu_from_a_task_that_never_yields() {
    static KERNEL: Kernel<SimPort> = Kernel::new(SimPort::new());
    static SPINS: AtomicU32 = AtomicU32::new(0);
    static TURNS: AtomicU32 = AtomicU32::new(0);

    fn hog() {
        loop {
            SPINS.fetch_add(1, Ordering::Relaxed);
            // Reading the clock is where the simulator takes interrupts.
            let _ = KERNEL.now_ms();
        }
    }

    fn counter() {
        TURNS.fetch_add(1, Ordering::Relaxed);
    }

    KERNEL.register(TaskEntry::Plain(hog), 256, 3).unwrap();
    KERNEL.register(TaskEntry::Plain(counter), 256, 1).unwrap();
    boot(&KERNEL, Mode::Preemptive);

    assert!(wait_until(Duration::from_secs(30), || TURNS.load(Ordering::Relaxed) >= 50));
    assert!(SPINS.load(Ordering::Relaxed) > 0);
}

#[test]
fn preemptive_delays_never_wake_early() {
    static KERNEL: Kernel<SimPort> = Kernel::new(SimPort::new());
    static EARLY: AtomicU32 = AtomicU32::new(0);
    static WAKES: AtomicU32 = AtomicU32::new(0);

    fn sleeper() {
        let start = KERNEL.now_us();
        KERNEL.delay_ms(2);
        if KERNEL.now_us().wrapping_sub(start) < 2_000 {
            EARLY.fetch_add(1, Ordering::Relaxed);
        }
        WAKES.fetch_add(1, Ordering::Relaxed);
    }

    fn busy() {
        let _ = KERNEL.now_ms();
    }

    KERNEL.register(TaskEntry::Plain(sleeper), 256, 1).unwrap();
    KERNEL.register(TaskEntry::Plain(busy), 256, 2).unwrap();
    boot(&KERNEL, Mode::Preemptive);

    assert!(wait_until(Duration::from_secs(30), || WAKES.load(Ordering::Relaxed) >= 20));
    assert_eq!(EARLY.load(Ordering::Relaxed), 0);
}
