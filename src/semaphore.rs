//! # Semaphore
//!
//! A binary signal between tasks (or from an interrupt to a task). Unlike
//! [`Mutex`](crate::mutex::Mutex) it has no owner: any task may `give`, and
//! a `take` by one task consumes the signal for everyone. Giving an
//! already-available semaphore is a no-op.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::error::Error;
use crate::kernel::Executive;
use crate::time;

pub struct Semaphore<E: Executive + 'static> {
    exec: &'static E,
    available: AtomicBool,
}

impl<E: Executive + 'static> Semaphore<E> {
    pub const fn new(exec: &'static E, available: bool) -> Self {
        Self {
            exec,
            available: AtomicBool::new(available),
        }
    }

    /// Make the signal available.
    pub fn give(&self) {
        critical_section::with(|_| self.available.store(true, Ordering::Relaxed));
    }

    /// Consume the signal if it is available right now.
    pub fn try_take(&self) -> Result<(), Error> {
        critical_section::with(|_| {
            if self.available.load(Ordering::Relaxed) {
                self.available.store(false, Ordering::Relaxed);
                Ok(())
            } else {
                Err(Error::WouldBlock)
            }
        })
    }

    /// Block until the signal is available, then consume it.
    pub fn take(&self) {
        while self.try_take().is_err() {
            self.exec.yield_now();
        }
    }

    /// Block for at most `timeout_ms` milliseconds.
    pub fn take_timeout(&self, timeout_ms: u32) -> Result<(), Error> {
        let deadline = self.exec.now_ms().wrapping_add(timeout_ms);
        loop {
            if self.try_take().is_ok() {
                return Ok(());
            }
            if time::reached(self.exec.now_ms(), deadline) {
                return Err(Error::Timeout);
            }
            self.exec.yield_now();
        }
    }

    pub fn available(&self) -> bool {
        critical_section::with(|_| self.available.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::MockExecutive;

    #[test]
    fn test_give_then_take() {
        let exec = MockExecutive::leak();
        let signal = Semaphore::new(exec, false);
        assert_eq!(signal.try_take(), Err(Error::WouldBlock));

        signal.give();
        signal.give();
        assert!(signal.available());
        signal.take();
        assert!(!signal.available());
        assert_eq!(exec.yields(), 0);
    }

    #[test]
    fn test_any_task_may_give_and_take() {
        let exec = MockExecutive::leak();
        let signal = Semaphore::new(exec, true);
        exec.run_as(4);
        assert_eq!(signal.try_take(), Ok(()));
        exec.run_as(2);
        signal.give();
        exec.run_as(5);
        assert_eq!(signal.take_timeout(0), Ok(()));
    }

    #[test]
    fn test_take_timeout_expires() {
        let exec = MockExecutive::leak();
        let signal = Semaphore::new(exec, false);
        assert_eq!(signal.take_timeout(4), Err(Error::Timeout));
        assert_eq!(exec.yields(), 4);
        assert!(!signal.available());
    }
}
