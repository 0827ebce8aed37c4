//! # Stack Arena
//!
//! At boot the kernel carves one reserved memory region into per-task stack
//! slices. Every slice starts on a [`STACK_ALIGN`] boundary and carries a
//! guard word at its lowest address. Stacks grow downward, so a task that
//! overruns its slice clobbers its own guard before it reaches the
//! neighbouring slice; the switcher checks the guard of every task it
//! switches away from.
//!
//! ```text
//!  low address                                              high address
//!  ┌──────┬──────────────────┬──────┬──────────────────┬──────┬────────
//!  │guard │   task 0 stack ◄─│guard │   task 1 stack ◄─│guard │  ...
//!  └──────┴──────────────────┴──────┴──────────────────┴──────┴────────
//! ```

use core::mem;

use crate::config::{STACK_ALIGN, STACK_CANARY};
use crate::error::Error;

/// Bytes each slice gives up to its guard word. Rounded up to the stack
/// alignment so the usable region above it stays aligned.
pub const GUARD_SIZE: usize = if STACK_ALIGN > 4 { STACK_ALIGN } else { 4 };

/// A bump allocator over the arena handed to `Kernel::start`.
pub struct StackArena {
    rest: &'static mut [u8],
}

impl StackArena {
    pub fn new(memory: &'static mut [u8]) -> Self {
        Self { rest: memory }
    }

    /// Bytes not handed out yet (before alignment padding).
    pub fn remaining(&self) -> usize {
        self.rest.len()
    }

    /// Carve a slice with `bytes` of usable stack above a fresh guard word.
    pub fn carve(&mut self, bytes: usize) -> Result<StackSlice, Error> {
        let padding = self.rest.as_ptr().align_offset(STACK_ALIGN);
        let total = bytes
            .checked_next_multiple_of(STACK_ALIGN)
            .and_then(|usable| usable.checked_add(padding + GUARD_SIZE))
            .ok_or(Error::ArenaExhausted)?;
        if total > self.rest.len() {
            return Err(Error::ArenaExhausted);
        }

        let rest = mem::take(&mut self.rest);
        let (slice, tail) = rest.split_at_mut(total);
        self.rest = tail;

        let (guard_bytes, stack) = slice[padding..].split_at_mut(GUARD_SIZE);
        guard_bytes[..4].copy_from_slice(&STACK_CANARY.to_ne_bytes());
        let guard = StackGuard {
            addr: guard_bytes.as_ptr() as usize,
        };
        Ok(StackSlice { stack, guard })
    }
}

/// A task's stack region together with the guard beneath it.
pub struct StackSlice {
    pub stack: &'static mut [u8],
    pub guard: StackGuard,
}

/// Address of a guard word written by [`StackArena::carve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackGuard {
    addr: usize,
}

impl StackGuard {
    /// Whether the guard word still holds [`STACK_CANARY`].
    #[inline]
    pub fn is_intact(&self) -> bool {
        // SAFETY: `addr` points at the first word of a guard carved out of
        // a `'static` arena and aligned to `STACK_ALIGN`; the arena lives as
        // long as the kernel that holds this guard.
        let word = unsafe { core::ptr::read_volatile(self.addr as *const u32) };
        word == STACK_CANARY
    }

    /// Overwrite the guard word, as a stack overrun would.
    #[cfg(test)]
    pub(crate) fn clobber(&self) {
        // SAFETY: see `is_intact`.
        unsafe { core::ptr::write_volatile(self.addr as *mut u32, !STACK_CANARY) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leak_arena(len: usize) -> &'static mut [u8] {
        Box::leak(vec![0u8; len].into_boxed_slice())
    }

    #[test]
    fn test_slices_are_aligned_and_disjoint() {
        let mut arena = StackArena::new(leak_arena(1024));
        let a = arena.carve(100).unwrap();
        let b = arena.carve(60).unwrap();

        assert_eq!(a.stack.as_ptr() as usize % STACK_ALIGN, 0);
        assert_eq!(b.stack.as_ptr() as usize % STACK_ALIGN, 0);
        assert_eq!(a.stack.len(), 104);
        assert_eq!(b.stack.len(), 64);

        let a_end = a.stack.as_ptr() as usize + a.stack.len();
        assert!(a_end <= b.stack.as_ptr() as usize - GUARD_SIZE);
    }

    #[test]
    fn test_exhaustion_is_reported() {
        let mut arena = StackArena::new(leak_arena(256));
        assert!(arena.carve(128).is_ok());
        assert_eq!(arena.carve(512).err(), Some(Error::ArenaExhausted));
        assert_eq!(arena.carve(usize::MAX - 4).err(), Some(Error::ArenaExhausted));
    }

    #[test]
    fn test_guard_detects_overflow() {
        let mut arena = StackArena::new(leak_arena(512));
        let low = arena.carve(64).unwrap();
        let mut high = arena.carve(64).unwrap();
        assert!(low.guard.is_intact());
        assert!(high.guard.is_intact());

        // Simulate `high` growing past the bottom of its slice.
        unsafe {
            let below = high.stack.as_mut_ptr().sub(GUARD_SIZE);
            core::ptr::write_bytes(below, 0xAA, GUARD_SIZE);
        }
        assert!(!high.guard.is_intact());
        assert!(low.guard.is_intact());
    }
}
