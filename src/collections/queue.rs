use core::cell::UnsafeCell;
use core::mem::MaybeUninit;

use super::{lock_when, Index};
use crate::error::{Error, Rejected};
use crate::kernel::Executive;
use crate::mutex::{Mutex, ScopedLock};

/// A bounded FIFO queue of `N` items.
///
/// ```ignore
/// static READINGS: Queue<Kernel<CortexM4>, u16, 8> = Queue::new(&KERNEL);
///
/// READINGS.enqueue_timeout(sample, 10).ok();
/// let next = READINGS.dequeue_timeout(100)?;
/// ```
pub struct Queue<E: Executive + 'static, T, const N: usize, I: Index = u8> {
    lock: Mutex<E>,
    ring: UnsafeCell<Ring<T, N, I>>,
}

// SAFETY: the ring is only reached inside critical sections or while the
// embedded lock is held, and items move between tasks by value.
unsafe impl<E: Executive + 'static, T: Send, const N: usize, I: Index> Sync for Queue<E, T, N, I> {}

impl<E: Executive + 'static, T, const N: usize, I: Index> Queue<E, T, N, I> {
    pub const fn new(exec: &'static E) -> Self {
        const { assert!(N > 0 && N <= I::MAX, "capacity out of range for the index type") };
        Self {
            lock: Mutex::new(exec),
            ring: UnsafeCell::new(Ring {
                slots: [const { MaybeUninit::uninit() }; N],
                head: I::ZERO,
                len: I::ZERO,
            }),
        }
    }

    /// Mutable access. Callers also hold the embedded lock, so no
    /// [`ring_locked`](Self::ring_locked) view is alive meanwhile.
    fn with_ring<R>(&self, f: impl FnOnce(&mut Ring<T, N, I>) -> R) -> R {
        critical_section::with(|_| {
            // SAFETY: interrupts are masked, so no other task is inside the
            // ring, and the borrow ends with the critical section.
            f(unsafe { &mut *self.ring.get() })
        })
    }

    /// Read-only access for the lock-free status reads. Shared, so it may
    /// overlap a `ring_locked` view held by a preempted `peek`.
    fn with_ring_ref<R>(&self, f: impl FnOnce(&Ring<T, N, I>) -> R) -> R {
        critical_section::with(|_| {
            // SAFETY: every mutable borrow is confined to a critical section,
            // and none can start while this one runs.
            f(unsafe { &*self.ring.get() })
        })
    }

    /// Read-only view for as long as the embedded lock is held. Every
    /// mutation also holds the lock, so the ring cannot change meanwhile.
    fn ring_locked<'g>(&'g self, _guard: &'g ScopedLock<'_, E>) -> &'g Ring<T, N, I> {
        // SAFETY: see above.
        unsafe { &*self.ring.get() }
    }

    fn insert(&self, item: T) -> Result<(), Rejected<T>> {
        self.with_ring(|ring| ring.push_back(item))
            .map_err(|item| Rejected::new(Error::CapacityExceeded, item))
    }

    fn remove(&self) -> Result<T, Error> {
        self.with_ring(Ring::pop_front).ok_or(Error::Empty)
    }

    /// Append `item`, failing with `CapacityExceeded` if the queue is full.
    pub fn enqueue(&self, item: T) -> Result<(), Rejected<T>> {
        match self.lock.scoped() {
            Ok(_guard) => self.insert(item),
            Err(error) => Err(Rejected::new(error, item)),
        }
    }

    /// Append `item`, waiting up to `timeout_ms` for room.
    pub fn enqueue_timeout(&self, item: T, timeout_ms: u32) -> Result<(), Rejected<T>> {
        match lock_when(&self.lock, timeout_ms, || !self.is_full()) {
            Ok(_guard) => self.insert(item),
            Err(error) => Err(Rejected::new(error, item)),
        }
    }

    /// Remove the oldest item, failing with `Empty` if there is none.
    pub fn dequeue(&self) -> Result<T, Error> {
        let _guard = self.lock.scoped()?;
        self.remove()
    }

    /// Remove the oldest item, waiting up to `timeout_ms` for one.
    pub fn dequeue_timeout(&self, timeout_ms: u32) -> Result<T, Error> {
        let _guard = lock_when(&self.lock, timeout_ms, || !self.is_empty())?;
        self.remove()
    }

    /// A copy of the oldest item, left in place.
    pub fn peek(&self) -> Result<T, Error>
    where
        T: Clone,
    {
        let guard = self.lock.scoped()?;
        self.ring_locked(&guard).front().cloned().ok_or(Error::Empty)
    }

    /// Drop every queued item.
    pub fn clear(&self) -> Result<(), Error> {
        let _guard = self.lock.scoped()?;
        // One item per critical section, so destructors run with
        // interrupts enabled.
        while let Some(item) = self.with_ring(Ring::pop_front) {
            drop(item);
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.with_ring_ref(|ring| ring.len.get())
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

impl<E: Executive + 'static, T, const N: usize, I: Index> Drop for Queue<E, T, N, I> {
    fn drop(&mut self) {
        let ring = self.ring.get_mut();
        while ring.pop_front().is_some() {}
    }
}

// ---------------------------------------------------------------------------
// Ring buffer
// ---------------------------------------------------------------------------

struct Ring<T, const N: usize, I> {
    slots: [MaybeUninit<T>; N],
    head: I,
    len: I,
}

impl<T, const N: usize, I: Index> Ring<T, N, I> {
    fn push_back(&mut self, item: T) -> Result<(), T> {
        let len = self.len.get();
        if len == N {
            return Err(item);
        }
        let tail = (self.head.get() + len) % N;
        self.slots[tail].write(item);
        self.len = I::from_usize(len + 1);
        Ok(())
    }

    fn pop_front(&mut self) -> Option<T> {
        let len = self.len.get();
        if len == 0 {
            return None;
        }
        let head = self.head.get();
        // SAFETY: the `len` slots starting at `head` are initialized.
        let item = unsafe { self.slots[head].assume_init_read() };
        self.head = I::from_usize((head + 1) % N);
        self.len = I::from_usize(len - 1);
        Some(item)
    }

    fn front(&self) -> Option<&T> {
        if self.len.get() == 0 {
            return None;
        }
        // SAFETY: a non-empty ring has an initialized slot at `head`.
        Some(unsafe { self.slots[self.head.get()].assume_init_ref() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::MockExecutive;
    use std::cell::Cell;
    use std::sync::Arc;

    #[test]
    fn test_fifo_order_over_repeated_fill_and_drain() {
        let exec = MockExecutive::leak();
        let queue: Queue<_, u32, 4> = Queue::new(exec);
        let mut next = 0;
        for round in 0..5 {
            // Vary the fill level so head wraps at different points.
            let fill = 1 + round % 4;
            for _ in 0..fill {
                queue.enqueue(next).unwrap();
                next += 1;
            }
            let drained: Vec<u32> = core::iter::from_fn(|| queue.dequeue().ok()).collect();
            let expected: Vec<u32> = (next - fill..next).collect();
            assert_eq!(drained, expected);
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn test_full_queue_hands_item_back() {
        let exec = MockExecutive::leak();
        let queue: Queue<_, &str, 2> = Queue::new(exec);
        queue.enqueue("a").unwrap();
        queue.enqueue("b").unwrap();
        assert!(queue.is_full());

        let rejected = queue.enqueue("c").unwrap_err();
        assert_eq!(rejected.error, Error::CapacityExceeded);
        assert_eq!(rejected.into_inner(), "c");
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dequeue(), Ok("a"));
    }

    #[test]
    fn test_empty_queue_reports_empty() {
        let exec = MockExecutive::leak();
        let queue: Queue<_, u8, 3> = Queue::new(exec);
        assert_eq!(queue.dequeue(), Err(Error::Empty));
        assert_eq!(queue.peek(), Err(Error::Empty));
        assert_eq!(queue.capacity(), 3);
    }

    #[test]
    fn test_enqueue_timeout_on_full_queue_leaves_contents() {
        let exec = MockExecutive::leak();
        let queue: Queue<_, u32, 2> = Queue::new(exec);
        queue.enqueue(1).unwrap();
        queue.enqueue(2).unwrap();

        let start = exec.now_ms();
        let rejected = queue.enqueue_timeout(3, 3).unwrap_err();
        assert_eq!(rejected, Rejected::new(Error::Timeout, 3));
        assert_eq!(exec.now_ms().wrapping_sub(start), 3);

        assert_eq!(queue.dequeue(), Ok(1));
        assert_eq!(queue.dequeue(), Ok(2));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_dequeue_timeout_on_empty_queue() {
        let exec = MockExecutive::leak();
        let queue: Queue<_, u32, 2> = Queue::new(exec);
        assert_eq!(queue.dequeue_timeout(2), Err(Error::Timeout));
        assert_eq!(exec.yields(), 2);

        queue.enqueue(9).unwrap();
        assert_eq!(queue.dequeue_timeout(2), Ok(9));
        assert_eq!(exec.yields(), 2);
    }

    #[test]
    fn test_peek_leaves_item_in_place() {
        let exec = MockExecutive::leak();
        let queue: Queue<_, u32, 2> = Queue::new(exec);
        queue.enqueue(5).unwrap();
        queue.enqueue(6).unwrap();
        assert_eq!(queue.peek(), Ok(5));
        assert_eq!(queue.len(), 2);
        assert!(queue.lock.available());
    }

    #[test]
    fn test_status_reads_while_peek_clones() {
        #[derive(Debug, PartialEq)]
        struct Reading(u32);

        thread_local! {
            static WATCHED: Cell<Option<&'static Queue<MockExecutive, Reading, 2>>> =
                const { Cell::new(None) };
        }

        impl Clone for Reading {
            fn clone(&self) -> Self {
                // What a task preempting `peek` mid-clone would observe.
                if let Some(queue) = WATCHED.get() {
                    assert_eq!(queue.len(), 2);
                    assert!(queue.is_full());
                    assert!(!queue.is_empty());
                }
                Reading(self.0)
            }
        }

        let exec = MockExecutive::leak();
        let queue: &'static Queue<_, Reading, 2> = Box::leak(Box::new(Queue::new(exec)));
        queue.enqueue(Reading(1)).unwrap();
        queue.enqueue(Reading(2)).unwrap();
        WATCHED.set(Some(queue));
        assert_eq!(queue.peek(), Ok(Reading(1)));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_clear_and_drop_release_items() {
        let exec = MockExecutive::leak();
        let token = Arc::new(());
        {
            let queue: Queue<_, Arc<()>, 4> = Queue::new(exec);
            queue.enqueue(token.clone()).unwrap();
            queue.enqueue(token.clone()).unwrap();
            queue.clear().unwrap();
            assert_eq!(Arc::strong_count(&token), 1);
            assert!(queue.is_empty());

            queue.enqueue(token.clone()).unwrap();
            assert_eq!(Arc::strong_count(&token), 2);
        }
        assert_eq!(Arc::strong_count(&token), 1);
    }

    #[test]
    fn test_wide_index_allows_large_capacity() {
        let exec = MockExecutive::leak();
        let queue: Queue<_, u16, 300, u16> = Queue::new(exec);
        for value in 0..300 {
            queue.enqueue(value).unwrap();
        }
        assert!(queue.is_full());
        assert_eq!(queue.dequeue(), Ok(0));
        queue.enqueue(300).unwrap();
        assert_eq!(queue.len(), 300);
    }
}
