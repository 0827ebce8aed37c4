//! Helpers shared by the simulator-driven integration tests.

#![allow(dead_code)]

use std::thread;
use std::time::{Duration, Instant};

use spindle::arch::sim::SimPort;
use spindle::{Kernel, Mode};

pub const ARENA_BYTES: usize = 16 * 1024;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Boot `kernel` on a thread of its own; `start` never returns on success.
pub fn boot(kernel: &'static Kernel<SimPort>, mode: Mode) {
    init_tracing();
    let arena: &'static mut [u8] = Box::leak(vec![0u8; ARENA_BYTES].into_boxed_slice());
    thread::Builder::new()
        .name("boot".into())
        .spawn(move || {
            if let Err(err) = kernel.start(mode, arena) {
                panic!("kernel failed to start: {err}");
            }
        })
        .expect("spawn boot thread");
}

/// Poll `done` until it holds or `limit` passes. Returns whether it held.
pub fn wait_until(limit: Duration, done: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    done()
}
