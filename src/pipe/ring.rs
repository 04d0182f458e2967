//! Queue storage for a pipe.
//!
//! Bounded pipes use a heap-backed SPSC ring with cache-line separated head
//! and tail indices. Unbounded pipes (HWM 0) fall back to a lock-free
//! segmented queue.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_queue::SegQueue;

/// Cache-line aligned wrapper to keep producer and consumer indices apart.
#[repr(C, align(64))]
#[derive(Default)]
pub(crate) struct CachePadded<T>(pub T);

/// Fixed-size single-producer/single-consumer ring.
///
/// `head` is written only by the producer, `tail` only by the consumer.
/// The producer publishes a slot with a Release store of `head`; the consumer
/// observes it with an Acquire load (and symmetrically for `tail`).
pub(crate) struct SpscRing<T> {
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
    mask: usize,
    buffer: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

// SAFETY: slots are handed from exactly one producer to exactly one consumer;
// ownership of each `T` moves across threads, never shared.
unsafe impl<T: Send> Send for SpscRing<T> {}
unsafe impl<T: Send> Sync for SpscRing<T> {}

impl<T> SpscRing<T> {
    /// Create a ring holding at least `min_slots` items (rounded to a power of 2).
    pub fn with_min_slots(min_slots: usize) -> Self {
        let cap = min_slots.max(1).next_power_of_two();
        let mut buffer = Vec::with_capacity(cap);
        for _ in 0..cap {
            buffer.push(UnsafeCell::new(MaybeUninit::uninit()));
        }
        Self {
            head: CachePadded(AtomicUsize::new(0)),
            tail: CachePadded(AtomicUsize::new(0)),
            mask: cap - 1,
            buffer: buffer.into_boxed_slice(),
        }
    }

    pub fn slots(&self) -> usize {
        self.buffer.len()
    }

    pub fn len(&self) -> usize {
        let head = self.head.0.load(Ordering::Acquire);
        let tail = self.tail.0.load(Ordering::Acquire);
        head.wrapping_sub(tail)
    }

    /// Append an item. Returns it back if every slot is in use.
    ///
    /// # Safety
    /// At most one thread may call `push` at any time.
    pub unsafe fn push(&self, item: T) -> Result<(), T> {
        let head = self.head.0.load(Ordering::Relaxed);
        let tail = self.tail.0.load(Ordering::Acquire);
        if head.wrapping_sub(tail) >= self.buffer.len() {
            return Err(item);
        }
        let slot = &self.buffer[head & self.mask];
        // SAFETY: slot is outside [tail, head) so the consumer is not reading it.
        unsafe { (*slot.get()).write(item) };
        self.head.0.store(head.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Remove the oldest item.
    ///
    /// # Safety
    /// At most one thread may call `pop` at any time.
    pub unsafe fn pop(&self) -> Option<T> {
        let tail = self.tail.0.load(Ordering::Relaxed);
        let head = self.head.0.load(Ordering::Acquire);
        if tail == head {
            return None;
        }
        let slot = &self.buffer[tail & self.mask];
        // SAFETY: slot is inside [tail, head): written by the producer and made
        // visible by the Acquire load of `head` above.
        let item = unsafe { (*slot.get()).assume_init_read() };
        self.tail.0.store(tail.wrapping_add(1), Ordering::Release);
        Some(item)
    }
}

impl<T> Drop for SpscRing<T> {
    fn drop(&mut self) {
        let head = *self.head.0.get_mut();
        let mut tail = *self.tail.0.get_mut();
        while tail != head {
            // SAFETY: exclusive access; every slot in [tail, head) is initialised.
            unsafe { self.buffer[tail & self.mask].get_mut().assume_init_drop() };
            tail = tail.wrapping_add(1);
        }
    }
}

/// Storage backing a pipe, chosen from its capacity.
pub(crate) enum Queue<T> {
    Bounded(SpscRing<T>),
    Unbounded(SegQueue<T>),
}

impl<T> Queue<T> {
    /// Capacity 0 means unbounded.
    pub fn for_capacity(capacity: usize) -> Self {
        if capacity == 0 {
            Queue::Unbounded(SegQueue::new())
        } else {
            Queue::Bounded(SpscRing::with_min_slots(capacity))
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Queue::Bounded(ring) => ring.len(),
            Queue::Unbounded(queue) => queue.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// # Safety
    /// Single producer, see [`SpscRing::push`].
    pub unsafe fn push(&self, item: T) -> Result<(), T> {
        match self {
            Queue::Bounded(ring) => unsafe { ring.push(item) },
            Queue::Unbounded(queue) => {
                queue.push(item);
                Ok(())
            }
        }
    }

    /// # Safety
    /// Single consumer, see [`SpscRing::pop`].
    pub unsafe fn pop(&self) -> Option<T> {
        match self {
            Queue::Bounded(ring) => unsafe { ring.pop() },
            Queue::Unbounded(queue) => queue.pop(),
        }
    }
}
