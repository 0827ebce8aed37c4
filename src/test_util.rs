//! A scripted [`Executive`] for exercising locks and containers without
//! booting a kernel. Time only moves when someone yields.

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Mutex;

use crate::config::NO_OWNER;
use crate::kernel::Executive;
use crate::task::TaskId;

type Interruption = Box<dyn FnOnce() + Send>;

pub struct MockExecutive {
    current: AtomicU8,
    clock: AtomicU32,
    yields: AtomicU32,
    donated_to: AtomicU8,
    restores: AtomicU32,
    before_next_wait: Mutex<Option<Interruption>>,
}

impl MockExecutive {
    /// A fresh executive with task 1 running, leaked so locks can borrow
    /// it for `'static`.
    pub fn leak() -> &'static Self {
        Box::leak(Box::new(Self {
            current: AtomicU8::new(1),
            clock: AtomicU32::new(0),
            yields: AtomicU32::new(0),
            donated_to: AtomicU8::new(NO_OWNER),
            restores: AtomicU32::new(0),
            before_next_wait: Mutex::new(None),
        }))
    }

    /// Pretend the CPU now belongs to task `id`.
    pub fn run_as(&self, id: u8) {
        self.current.store(id, Ordering::Relaxed);
    }

    /// Run `f` at the start of the next [`Executive::wait_on`], as if
    /// another task got the CPU between the failed attempt and the wait.
    pub fn interrupt_next_wait(&self, f: impl FnOnce() + Send + 'static) {
        *self.before_next_wait.lock().unwrap() = Some(Box::new(f));
    }

    pub fn yields(&self) -> u32 {
        self.yields.load(Ordering::Relaxed)
    }

    pub fn donated_to(&self) -> Option<u8> {
        match self.donated_to.load(Ordering::Relaxed) {
            NO_OWNER => None,
            id => Some(id),
        }
    }

    pub fn restores(&self) -> u32 {
        self.restores.load(Ordering::Relaxed)
    }
}

impl Executive for MockExecutive {
    fn current_task_id(&self) -> TaskId {
        TaskId(self.current.load(Ordering::Relaxed))
    }

    /// Every yield lets one millisecond pass.
    fn yield_now(&self) {
        self.yields.fetch_add(1, Ordering::Relaxed);
        self.clock.fetch_add(1, Ordering::Relaxed);
    }

    fn now_ms(&self) -> u32 {
        self.clock.load(Ordering::Relaxed)
    }

    fn wait_on(&self, owner: impl FnOnce() -> Option<TaskId>) {
        let interruption = self.before_next_wait.lock().unwrap().take();
        if let Some(interruption) = interruption {
            interruption();
        }
        if let Some(owner) = owner() {
            self.donated_to.store(owner.get(), Ordering::Relaxed);
        }
        self.yield_now();
    }

    fn restore_priority(&self) {
        self.restores.fetch_add(1, Ordering::Relaxed);
    }
}
