//! Bounded work-stealing deque
//!
//! Chase-Lev discipline over a fixed ring: the owning worker pushes and
//! pops at the bottom (LIFO, newest first for cache reuse), other workers
//! steal at the top (oldest first, preserving the owner's locality). All
//! operations are non-blocking; `push` fails when the ring is full and the
//! caller spills to the global rings instead.
//!
//! The ring never grows, which removes the classic Chase-Lev buffer-swap
//! and leaves a single CAS on the top index as the only contended path.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{fence, AtomicIsize, Ordering};

use crossbeam::utils::CachePadded;

/// Outcome of a steal attempt
pub(crate) enum StealResult<T> {
    /// Claimed the oldest item
    Taken(T),
    /// Nothing to steal
    Empty,
    /// Lost a race; the caller may try again or move to another victim
    Retry,
}

/// Fixed-capacity work-stealing deque
///
/// `push` and `pop` are owner-only (enforced by the `unsafe` contract);
/// `steal` may be called from any thread.
pub(crate) struct StealDeque<T> {
    buffer: Box<[UnsafeCell<MaybeUninit<T>>]>,
    mask: usize,
    /// Owner end. Only the owner writes it (stores are plain); stealers
    /// read it to bound their range.
    bottom: CachePadded<AtomicIsize>,
    /// Thief end, advanced by CAS. Invariant: `bottom >= top`.
    top: CachePadded<AtomicIsize>,
}

unsafe impl<T: Send> Send for StealDeque<T> {}
unsafe impl<T: Send> Sync for StealDeque<T> {}

impl<T> StealDeque<T> {
    /// Capacity is rounded up to a power of two
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2).next_power_of_two();
        let buffer = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            buffer,
            mask: capacity - 1,
            bottom: CachePadded::new(AtomicIsize::new(0)),
            top: CachePadded::new(AtomicIsize::new(0)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Approximate occupancy; exact only when quiescent
    pub fn len(&self) -> usize {
        let b = self.bottom.load(Ordering::Relaxed);
        let t = self.top.load(Ordering::Relaxed);
        (b - t).max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    fn slot(&self, index: isize) -> *mut MaybeUninit<T> {
        self.buffer[index as usize & self.mask].get()
    }

    /// Push at the bottom. Fails with the value when the ring is full.
    ///
    /// # Safety
    /// Owner-only: must be called from the worker thread owning this deque.
    pub unsafe fn push(&self, value: T) -> Result<(), T> {
        let b = self.bottom.load(Ordering::Relaxed);
        let t = self.top.load(Ordering::Acquire);
        if b - t >= self.capacity() as isize {
            return Err(value);
        }
        unsafe { (*self.slot(b)).write(value) };
        self.bottom.store(b + 1, Ordering::Release);
        Ok(())
    }

    /// Pop at the bottom (newest item).
    ///
    /// # Safety
    /// Owner-only: must be called from the worker thread owning this deque.
    pub unsafe fn pop(&self) -> Option<T> {
        let b = self.bottom.load(Ordering::Relaxed) - 1;
        self.bottom.store(b, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        let t = self.top.load(Ordering::Relaxed);

        if t > b {
            // Already empty; restore
            self.bottom.store(b + 1, Ordering::Relaxed);
            return None;
        }

        if t < b {
            return Some(unsafe { (*self.slot(b)).assume_init_read() });
        }

        // Exactly one item left: race the stealers for it
        let won = self
            .top
            .compare_exchange(t, t + 1, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok();
        self.bottom.store(b + 1, Ordering::Relaxed);
        if won {
            Some(unsafe { (*self.slot(b)).assume_init_read() })
        } else {
            None
        }
    }

    /// Steal at the top (oldest item). Callable from any thread.
    pub fn steal(&self) -> StealResult<T> {
        let t = self.top.load(Ordering::Acquire);
        fence(Ordering::SeqCst);
        let b = self.bottom.load(Ordering::Acquire);
        if t >= b {
            return StealResult::Empty;
        }

        // Copy out before claiming; the bytes are only materialized if the
        // CAS wins, so a lost race never double-drops.
        let value = unsafe { std::ptr::read(self.slot(t)) };
        if self
            .top
            .compare_exchange(t, t + 1, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
        {
            StealResult::Taken(unsafe { value.assume_init() })
        } else {
            StealResult::Retry
        }
    }
}

impl<T> Drop for StealDeque<T> {
    fn drop(&mut self) {
        let b = *self.bottom.get_mut();
        let t = *self.top.get_mut();
        for index in t..b {
            unsafe { (*self.slot(index)).assume_init_drop() };
        }
    }
}
