//! # Bounded Containers
//!
//! Fixed-capacity [`Queue`] (FIFO ring buffer) and [`Stack`] (LIFO) shared
//! between tasks. Each container embeds a [`Mutex`] that every inserting or
//! removing operation holds; the storage itself is additionally only ever
//! mutated inside a critical section, so the lock-free status reads
//! (`len`, `is_empty`, `is_full`) never see a half-applied update.
//!
//! ## Blocking forms
//!
//! | Operation        | Full / empty                         |
//! |------------------|--------------------------------------|
//! | `enqueue`/`push` | `Err(Rejected { CapacityExceeded })` |
//! | `dequeue`/`pop`  | `Err(Error::Empty)`                  |
//! | `*_timeout(ms)`  | retry until `ms` elapse, then `Timeout` |
//!
//! A refused insert always hands the item back, and a failed operation
//! never alters the contents.
//!
//! The index type `I` (`u8` by default) sets how large the capacity may
//! be; a capacity it cannot address is rejected at compile time.

mod queue;
mod stack;

pub use queue::Queue;
pub use stack::Stack;

use crate::error::Error;
use crate::kernel::Executive;
use crate::mutex::{Mutex, ScopedLock};
use crate::time;

mod sealed {
    pub trait Sealed {}
}

/// Unsigned integer types usable as container indices.
pub trait Index: sealed::Sealed + Copy + 'static {
    /// Largest capacity the type can address.
    const MAX: usize;
    const ZERO: Self;

    fn get(self) -> usize;

    /// Callers only pass values up to [`MAX`](Self::MAX).
    fn from_usize(value: usize) -> Self;
}

macro_rules! impl_index {
    ($($ty:ty),*) => {
        $(
            impl sealed::Sealed for $ty {}

            impl Index for $ty {
                const MAX: usize = <$ty>::MAX as usize;
                const ZERO: Self = 0;

                #[inline]
                fn get(self) -> usize {
                    self as usize
                }

                #[inline]
                fn from_usize(value: usize) -> Self {
                    value as $ty
                }
            }
        )*
    };
}

impl_index!(u8, u16, u32, usize);

/// Hold `lock` at a moment when `ready()` is true, retrying until
/// `timeout_ms` has elapsed.
fn lock_when<'a, E, F>(lock: &'a Mutex<E>, timeout_ms: u32, mut ready: F) -> Result<ScopedLock<'a, E>, Error>
where
    E: Executive + 'static,
    F: FnMut() -> bool,
{
    let exec = lock.executive();
    let deadline = exec.now_ms().wrapping_add(timeout_ms);
    loop {
        let guard = lock.scoped_timeout(time::remaining(exec.now_ms(), deadline))?;
        if ready() {
            return Ok(guard);
        }
        drop(guard);
        if time::reached(exec.now_ms(), deadline) {
            return Err(Error::Timeout);
        }
        exec.yield_now();
    }
}
