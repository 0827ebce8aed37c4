use core::cell::UnsafeCell;
use core::mem::MaybeUninit;

use super::{lock_when, Index};
use crate::error::{Error, Rejected};
use crate::kernel::Executive;
use crate::mutex::{Mutex, ScopedLock};

/// A bounded LIFO stack of `N` items.
pub struct Stack<E: Executive + 'static, T, const N: usize, I: Index = u8> {
    lock: Mutex<E>,
    slots: UnsafeCell<Slots<T, N, I>>,
}

// SAFETY: as for `Queue`, storage is only reached inside critical sections
// or under the embedded lock.
unsafe impl<E: Executive + 'static, T: Send, const N: usize, I: Index> Sync for Stack<E, T, N, I> {}

impl<E: Executive + 'static, T, const N: usize, I: Index> Stack<E, T, N, I> {
    pub const fn new(exec: &'static E) -> Self {
        const { assert!(N > 0 && N <= I::MAX, "capacity out of range for the index type") };
        Self {
            lock: Mutex::new(exec),
            slots: UnsafeCell::new(Slots {
                items: [const { MaybeUninit::uninit() }; N],
                len: I::ZERO,
            }),
        }
    }

    fn with_slots<R>(&self, f: impl FnOnce(&mut Slots<T, N, I>) -> R) -> R {
        critical_section::with(|_| {
            // SAFETY: interrupts are masked for the whole borrow, and callers
            // hold the embedded lock, so no `slots_locked` view is alive.
            f(unsafe { &mut *self.slots.get() })
        })
    }

    fn with_slots_ref<R>(&self, f: impl FnOnce(&Slots<T, N, I>) -> R) -> R {
        critical_section::with(|_| {
            // SAFETY: shared borrow; mutable ones only exist inside critical
            // sections, which cannot overlap this one.
            f(unsafe { &*self.slots.get() })
        })
    }

    fn slots_locked<'g>(&'g self, _guard: &'g ScopedLock<'_, E>) -> &'g Slots<T, N, I> {
        // SAFETY: every mutation holds the embedded lock, which the caller
        // proves it holds.
        unsafe { &*self.slots.get() }
    }

    fn insert(&self, item: T) -> Result<(), Rejected<T>> {
        self.with_slots(|slots| slots.push(item))
            .map_err(|item| Rejected::new(Error::CapacityExceeded, item))
    }

    fn remove(&self) -> Result<T, Error> {
        self.with_slots(Slots::pop).ok_or(Error::Empty)
    }

    pub fn push(&self, item: T) -> Result<(), Rejected<T>> {
        match self.lock.scoped() {
            Ok(_guard) => self.insert(item),
            Err(error) => Err(Rejected::new(error, item)),
        }
    }

    pub fn push_timeout(&self, item: T, timeout_ms: u32) -> Result<(), Rejected<T>> {
        match lock_when(&self.lock, timeout_ms, || !self.is_full()) {
            Ok(_guard) => self.insert(item),
            Err(error) => Err(Rejected::new(error, item)),
        }
    }

    pub fn pop(&self) -> Result<T, Error> {
        let _guard = self.lock.scoped()?;
        self.remove()
    }

    pub fn pop_timeout(&self, timeout_ms: u32) -> Result<T, Error> {
        let _guard = lock_when(&self.lock, timeout_ms, || !self.is_empty())?;
        self.remove()
    }

    /// A copy of the most recently pushed item, left in place.
    pub fn top(&self) -> Result<T, Error>
    where
        T: Clone,
    {
        let guard = self.lock.scoped()?;
        self.slots_locked(&guard).top().cloned().ok_or(Error::Empty)
    }

    pub fn clear(&self) -> Result<(), Error> {
        let _guard = self.lock.scoped()?;
        while let Some(item) = self.with_slots(Slots::pop) {
            drop(item);
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.with_slots_ref(|slots| slots.len.get())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == N
    }

    pub const fn capacity(&self) -> usize {
        N
    }
}

impl<E: Executive + 'static, T, const N: usize, I: Index> Drop for Stack<E, T, N, I> {
    fn drop(&mut self) {
        let slots = self.slots.get_mut();
        while slots.pop().is_some() {}
    }
}

struct Slots<T, const N: usize, I> {
    items: [MaybeUninit<T>; N],
    len: I,
}

impl<T, const N: usize, I: Index> Slots<T, N, I> {
    fn push(&mut self, item: T) -> Result<(), T> {
        let len = self.len.get();
        if len == N {
            return Err(item);
        }
        self.items[len].write(item);
        self.len = I::from_usize(len + 1);
        Ok(())
    }

    fn pop(&mut self) -> Option<T> {
        let top = self.len.get().checked_sub(1)?;
        self.len = I::from_usize(top);
        // SAFETY: slots below the old `len` are initialized, and lowering
        // `len` first hands ownership of this one to the caller.
        Some(unsafe { self.items[top].assume_init_read() })
    }

    fn top(&self) -> Option<&T> {
        let top = self.len.get().checked_sub(1)?;
        // SAFETY: slots below `len` are initialized.
        Some(unsafe { self.items[top].assume_init_ref() })
    }
}
