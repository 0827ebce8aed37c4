//! # Mutex
//!
//! An ownership-tracked lock for tasks. The test-and-set runs inside a
//! critical section, so it is atomic on a single core without any
//! read-modify-write instructions. A task that finds the lock taken does
//! not spin: it lends its priority to the owner and yields, retrying each
//! time the switcher comes back to it.
//!
//! Only the owner may unlock. Locking a mutex the caller already owns fails
//! with [`Error::AlreadyOwned`] instead of deadlocking.
//!
//! ```ignore
//! static LOCK: Mutex<Kernel<SimPort>> = Mutex::new(&KERNEL);
//!
//! fn task() {
//!     let _guard = LOCK.scoped().unwrap();
//!     // ... exclusive access until `_guard` drops ...
//! }
//! ```

use core::marker::PhantomData;
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use crate::config::NO_OWNER;
use crate::error::Error;
use crate::kernel::Executive;
use crate::task::TaskId;
use crate::time;

pub struct Mutex<E: Executive + 'static> {
    exec: &'static E,
    available: AtomicBool,
    /// Meaningful only while the lock is taken.
    owner: AtomicU8,
}

impl<E: Executive + 'static> Mutex<E> {
    pub const fn new(exec: &'static E) -> Self {
        Self {
            exec,
            available: AtomicBool::new(true),
            owner: AtomicU8::new(NO_OWNER),
        }
    }

    /// The executive this lock blocks on.
    pub fn executive(&self) -> &'static E {
        self.exec
    }

    /// One test-and-set attempt.
    fn try_acquire(&self) -> Result<(), Error> {
        let me = self.exec.current_task_id();
        critical_section::with(|_| {
            if self.available.load(Ordering::Relaxed) {
                self.available.store(false, Ordering::Relaxed);
                self.owner.store(me.get(), Ordering::Relaxed);
                Ok(())
            } else if self.owner.load(Ordering::Relaxed) == me.get() {
                Err(Error::AlreadyOwned)
            } else {
                Err(Error::WouldBlock)
            }
        })
    }

    fn acquire(&self, deadline: Option<u32>) -> Result<(), Error> {
        loop {
            match self.try_acquire() {
                Err(Error::WouldBlock) => {}
                done => return done,
            }
            if let Some(deadline) = deadline {
                if time::reached(self.exec.now_ms(), deadline) {
                    return Err(Error::Timeout);
                }
            }
            self.exec.wait_on(|| self.owner());
        }
    }

    /// Block until the lock is acquired.
    pub fn lock(&self) -> Result<(), Error> {
        self.acquire(None)
    }

    /// Block for at most `timeout_ms` milliseconds.
    pub fn lock_timeout(&self, timeout_ms: u32) -> Result<(), Error> {
        let deadline = self.exec.now_ms().wrapping_add(timeout_ms);
        self.acquire(Some(deadline))
    }

    /// Acquire the lock only if it is free right now.
    pub fn lock_immediate(&self) -> Result<(), Error> {
        self.try_acquire()
    }

    /// Release the lock. Fails with [`Error::OwnershipViolation`], leaving
    /// the lock untouched, unless the caller owns it.
    ///
    /// A successful unlock drops every priority donated to the caller and
    /// returns it to its base weight, even if it still holds other locks
    /// with waiters. Those waiters donate again on their next attempt.
    pub fn unlock(&self) -> Result<(), Error> {
        let me = self.exec.current_task_id();
        let released = critical_section::with(|_| {
            let owned = !self.available.load(Ordering::Relaxed)
                && self.owner.load(Ordering::Relaxed) == me.get();
            if owned {
                self.owner.store(NO_OWNER, Ordering::Relaxed);
                self.available.store(true, Ordering::Relaxed);
            }
            owned
        });
        if !released {
            tracing::warn!(caller = me.get(), "unlock by a task that does not own the lock");
            return Err(Error::OwnershipViolation);
        }

        self.exec.restore_priority();
        Ok(())
    }

    pub fn available(&self) -> bool {
        critical_section::with(|_| self.available.load(Ordering::Relaxed))
    }

    /// The task holding the lock, if any.
    pub fn owner(&self) -> Option<TaskId> {
        critical_section::with(|_| {
            if self.available.load(Ordering::Relaxed) {
                None
            } else {
                Some(TaskId(self.owner.load(Ordering::Relaxed)))
            }
        })
    }

    /// Lock and return a guard that unlocks on drop.
    pub fn scoped(&self) -> Result<ScopedLock<'_, E>, Error> {
        self.lock()?;
        Ok(ScopedLock::held(self))
    }

    /// [`scoped`](Self::scoped) with a timeout.
    pub fn scoped_timeout(&self, timeout_ms: u32) -> Result<ScopedLock<'_, E>, Error> {
        self.lock_timeout(timeout_ms)?;
        Ok(ScopedLock::held(self))
    }
}

// ---------------------------------------------------------------------------
// Scoped guard
// ---------------------------------------------------------------------------

/// Holds a [`Mutex`] until dropped. Tied to the task that locked it, so it
/// cannot be sent elsewhere.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct ScopedLock<'a, E: Executive + 'static> {
    mutex: &'a Mutex<E>,
    _task_bound: PhantomData<*const ()>,
}

impl<'a, E: Executive + 'static> ScopedLock<'a, E> {
    /// Block until `mutex` is locked.
    pub fn new(mutex: &'a Mutex<E>) -> Result<Self, Error> {
        mutex.scoped()
    }

    fn held(mutex: &'a Mutex<E>) -> Self {
        Self {
            mutex,
            _task_bound: PhantomData,
        }
    }
}

impl<E: Executive + 'static> Drop for ScopedLock<'_, E> {
    fn drop(&mut self) {
        let released = self.mutex.unlock();
        debug_assert!(released.is_ok(), "scoped lock released by a non-owner");
    }
}
