//! Bounded single-producer/single-consumer message pipe.
//!
//! A pipe is created as a pair of halves sharing one reference-counted queue:
//! - `PipeWriter`: the producer half (enqueue, mute bookkeeping)
//! - `PipeReader`: the consumer half (dequeue, take, release)
//!
//! Occupancy counts messages accepted and not yet released. A plain
//! `try_dequeue` releases immediately; a relay uses `take` and returns the
//! slot later through a `Releaser` once the message was consumed downstream.
//!
//! ```text
//!   PipeWriter ──try_enqueue──▶ [ ring ] ──take/try_dequeue──▶ PipeReader
//!        ▲                                                        │
//!        └──────────── writable signal ◀── release ◀──────────────┘
//! ```

mod ring;
mod signal;

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use tracing::trace;

use crate::message::Message;
use ring::{CachePadded, Queue};

pub use signal::Signal;

/// Mute state attached to every pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuteState {
    /// Producer may enqueue.
    Active,
    /// Occupancy reached capacity; producer action is governed by flow policy.
    Muted,
    /// Terminal; no further operations.
    Closed,
}

const STATE_ACTIVE: u8 = 0;
const STATE_MUTED: u8 = 1;
const STATE_CLOSED: u8 = 2;

impl MuteState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            STATE_ACTIVE => MuteState::Active,
            STATE_MUTED => MuteState::Muted,
            _ => MuteState::Closed,
        }
    }
}

/// Errors returned by `try_enqueue`. The message is handed back.
#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    #[error("pipe is at its high-water mark")]
    Full(Message),

    #[error("pipe is closed")]
    Closed(Message),
}

impl EnqueueError {
    pub fn into_message(self) -> Message {
        match self {
            EnqueueError::Full(msg) | EnqueueError::Closed(msg) => msg,
        }
    }
}

/// Errors returned by `try_dequeue` and `take`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DequeueError {
    #[error("pipe is empty")]
    Empty,

    #[error("pipe is closed")]
    Closed,
}

/// State shared by the two halves of a pipe.
struct PipeShared {
    queue: Queue<Message>,
    capacity: usize,
    occupancy: CachePadded<AtomicUsize>,
    state: AtomicU8,
    /// Messages removed from the queue (by take or dequeue), lifetime total.
    taken: AtomicU64,
    /// Slots returned to the producer, lifetime total. Drives credit frames.
    released: AtomicU64,
    /// Set once the consumer side closed; the producer observes it via state.
    reader_gone: AtomicBool,
    readable: Signal,
    writable: Signal,
    readable_hook: OnceLock<Arc<Signal>>,
    writable_hook: OnceLock<Arc<Signal>>,
    upstream: Option<Releaser>,
}

impl PipeShared {
    fn state(&self) -> MuteState {
        MuteState::from_raw(self.state.load(Ordering::SeqCst))
    }

    fn is_closed(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STATE_CLOSED
    }

    fn has_room(&self) -> bool {
        self.capacity == 0 || self.occupancy.0.load(Ordering::SeqCst) < self.capacity
    }

    /// Claim one slot. Fails without side effects when the pipe is full.
    fn reserve_slot(&self) -> bool {
        if self.capacity == 0 {
            self.occupancy.0.fetch_add(1, Ordering::SeqCst);
            return true;
        }
        self.occupancy
            .0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |occ| {
                (occ < self.capacity).then_some(occ + 1)
            })
            .is_ok()
    }

    /// Active -> Muted when the pipe is at capacity.
    ///
    /// Re-checks afterwards: a release racing with the transition may have
    /// freed a slot before the Muted store became visible.
    fn mute_if_full(&self) {
        if self.has_room() {
            return;
        }
        if self
            .state
            .compare_exchange(STATE_ACTIVE, STATE_MUTED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            trace!(
                capacity = self.capacity,
                "Pipe reached high-water mark, muted"
            );
            self.unmute_if_room();
        }
    }

    /// Muted -> Active when a slot is free. Returns true on transition.
    fn unmute_if_room(&self) -> bool {
        if !self.has_room() {
            return false;
        }
        let unmuted = self
            .state
            .compare_exchange(STATE_MUTED, STATE_ACTIVE, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if unmuted {
            trace!(capacity = self.capacity, "Pipe below high-water mark, active");
        }
        unmuted
    }

    /// Return `count` slots to the producer.
    fn release(&self, count: u64) -> u64 {
        let outstanding = self
            .taken
            .load(Ordering::SeqCst)
            .saturating_sub(self.released.load(Ordering::SeqCst));
        let count = count.min(outstanding);
        if count == 0 {
            return 0;
        }

        let freed = count as usize;
        let previous = self.occupancy.0.fetch_sub(freed, Ordering::SeqCst);
        debug_assert!(
            previous >= freed,
            "released {} slots with occupancy {}",
            freed,
            previous
        );
        self.released.fetch_add(count, Ordering::SeqCst);

        self.unmute_if_room();
        self.notify_writable();

        if let Some(upstream) = &self.upstream {
            upstream.release(count);
        }
        count
    }

    fn close(&self) -> bool {
        let prev = self.state.swap(STATE_CLOSED, Ordering::SeqCst);
        self.notify_readable();
        self.notify_writable();
        prev != STATE_CLOSED
    }

    fn notify_readable(&self) {
        self.readable.notify();
        if let Some(hook) = self.readable_hook.get() {
            hook.notify();
        }
    }

    fn notify_writable(&self) {
        self.writable.notify();
        if let Some(hook) = self.writable_hook.get() {
            hook.notify();
        }
    }
}

/// Create a pipe with the given capacity (0 = unbounded).
pub fn pipe(capacity: usize) -> (PipeWriter, PipeReader) {
    PipeBuilder::new(capacity).build()
}

/// Builder for pipes that need notification hooks or upstream chaining.
#[derive(Debug, Default)]
pub struct PipeBuilder {
    capacity: usize,
    readable_hook: Option<Arc<Signal>>,
    writable_hook: Option<Arc<Signal>>,
    upstream: Option<Releaser>,
}

impl PipeBuilder {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            ..Default::default()
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Also notify `signal` whenever a message is enqueued or the pipe closes.
    pub fn notify_readable(mut self, signal: Arc<Signal>) -> Self {
        self.readable_hook = Some(signal);
        self
    }

    /// Also notify `signal` whenever a slot is released or the pipe closes.
    pub fn notify_writable(mut self, signal: Arc<Signal>) -> Self {
        self.writable_hook = Some(signal);
        self
    }

    /// Forward every release of this pipe to `upstream`.
    ///
    /// Used for in-process hand-off: when the subscriber consumes from its
    /// inbound pipe, the publisher-side slot is returned at the same moment.
    pub fn upstream(mut self, upstream: Releaser) -> Self {
        self.upstream = Some(upstream);
        self
    }

    pub fn build(self) -> (PipeWriter, PipeReader) {
        let readable_hook = OnceLock::new();
        if let Some(hook) = self.readable_hook {
            let _ = readable_hook.set(hook);
        }
        let writable_hook = OnceLock::new();
        if let Some(hook) = self.writable_hook {
            let _ = writable_hook.set(hook);
        }

        let shared = Arc::new(PipeShared {
            queue: Queue::for_capacity(self.capacity),
            capacity: self.capacity,
            occupancy: CachePadded(AtomicUsize::new(0)),
            state: AtomicU8::new(STATE_ACTIVE),
            taken: AtomicU64::new(0),
            released: AtomicU64::new(0),
            reader_gone: AtomicBool::new(false),
            readable: Signal::new(),
            writable: Signal::new(),
            readable_hook,
            writable_hook,
            upstream: self.upstream,
        });

        (
            PipeWriter {
                shared: shared.clone(),
            },
            PipeReader { shared },
        )
    }
}

/// Producer half of a pipe.
pub struct PipeWriter {
    shared: Arc<PipeShared>,
}

impl std::fmt::Debug for PipeWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeWriter")
            .field("capacity", &self.shared.capacity)
            .field("occupancy", &self.occupancy())
            .field("state", &self.state())
            .finish()
    }
}

impl PipeWriter {
    /// Append a message if the pipe is below its high-water mark.
    pub fn try_enqueue(&mut self, msg: Message) -> Result<(), EnqueueError> {
        let shared = &*self.shared;
        if shared.is_closed() {
            return Err(EnqueueError::Closed(msg));
        }
        // The slot is claimed before the message becomes visible, so the
        // consumer can never release it ahead of the increment.
        if !shared.reserve_slot() {
            return Err(EnqueueError::Full(msg));
        }

        // SAFETY: `PipeWriter` is the only producer and `&mut self` serialises it.
        if let Err(msg) = unsafe { shared.queue.push(msg) } {
            shared.occupancy.0.fetch_sub(1, Ordering::SeqCst);
            return Err(EnqueueError::Full(msg));
        }
        shared.notify_readable();
        Ok(())
    }

    /// Enqueue, then mute if this filled the pipe.
    pub(crate) fn enqueue_and_mute(&mut self, msg: Message) -> Result<(), EnqueueError> {
        self.try_enqueue(msg)?;
        self.shared.mute_if_full();
        Ok(())
    }

    pub fn has_room(&self) -> bool {
        self.shared.has_room()
    }

    pub fn occupancy(&self) -> usize {
        self.shared.occupancy.0.load(Ordering::SeqCst)
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Current state, with a stale Muted corrected if a slot has since been freed.
    pub fn state(&self) -> MuteState {
        self.shared.unmute_if_room();
        self.shared.state()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Lifetime count of slots returned by the consumer side.
    pub fn released_total(&self) -> u64 {
        self.shared.released.load(Ordering::SeqCst)
    }

    /// True once the reader half closed or was dropped.
    pub fn reader_gone(&self) -> bool {
        self.shared.reader_gone.load(Ordering::SeqCst)
    }

    /// Signal notified on every release and on close.
    pub fn writable_signal(&self) -> &Signal {
        &self.shared.writable
    }

    /// Register an additional writable hook. Returns false if one is already set.
    pub fn watch_writable(&self, signal: Arc<Signal>) -> bool {
        self.shared.writable_hook.set(signal).is_ok()
    }

    /// Handle that can observe and close this pipe without owning a half.
    pub fn handle(&self) -> PipeHandle {
        PipeHandle {
            shared: self.shared.clone(),
        }
    }

    /// Close the pipe. Queued messages are discarded.
    pub fn close(&self) {
        if self.shared.close() {
            trace!("Pipe closed by producer");
        }
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        self.close();
    }
}

/// Consumer half of a pipe.
pub struct PipeReader {
    shared: Arc<PipeShared>,
}

impl std::fmt::Debug for PipeReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeReader")
            .field("capacity", &self.shared.capacity)
            .field("queued", &self.shared.queue.len())
            .finish()
    }
}

impl PipeReader {
    /// Remove the head message and return its slot to the producer.
    pub fn try_dequeue(&mut self) -> Result<Message, DequeueError> {
        let msg = self.take()?;
        self.shared.release(1);
        Ok(msg)
    }

    /// Remove the head message but keep its slot accounted.
    ///
    /// The slot is returned later through [`Releaser::release`].
    pub fn take(&mut self) -> Result<Message, DequeueError> {
        let shared = &*self.shared;
        if shared.is_closed() {
            return Err(DequeueError::Closed);
        }
        // SAFETY: `PipeReader` is the only consumer and `&mut self` serialises it.
        match unsafe { shared.queue.pop() } {
            Some(msg) => {
                shared.taken.fetch_add(1, Ordering::SeqCst);
                Ok(msg)
            }
            None => Err(DequeueError::Empty),
        }
    }

    /// Handle for returning slots of taken messages.
    pub fn releaser(&self) -> Releaser {
        Releaser {
            shared: self.shared.clone(),
        }
    }

    /// True when a message is queued (and the pipe is open).
    pub fn is_readable(&self) -> bool {
        !self.shared.is_closed() && !self.shared.queue.is_empty()
    }

    pub fn queued(&self) -> usize {
        self.shared.queue.len()
    }

    pub fn occupancy(&self) -> usize {
        self.shared.occupancy.0.load(Ordering::SeqCst)
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Signal notified on every enqueue and on close.
    pub fn readable_signal(&self) -> &Signal {
        &self.shared.readable
    }

    /// Register an additional readable hook. Returns false if one is already set.
    pub fn watch_readable(&self, signal: Arc<Signal>) -> bool {
        self.shared.readable_hook.set(signal).is_ok()
    }

    /// Close the pipe and discard whatever is still queued.
    pub fn close(&mut self) {
        self.shared.reader_gone.store(true, Ordering::SeqCst);
        let first = self.shared.close();
        let mut discarded = 0usize;
        // SAFETY: still the only consumer.
        while unsafe { self.shared.queue.pop() }.is_some() {
            discarded += 1;
        }
        if first || discarded > 0 {
            trace!(discarded, "Pipe closed by consumer");
        }
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        self.close();
    }
}

/// Returns slots of taken messages to the producer side of a pipe.
///
/// Only one thread should release a given pipe at a time; excess releases
/// beyond what was taken are ignored.
#[derive(Clone)]
pub struct Releaser {
    shared: Arc<PipeShared>,
}

impl std::fmt::Debug for Releaser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Releaser")
            .field("capacity", &self.shared.capacity)
            .finish()
    }
}

impl Releaser {
    /// Return up to `count` slots; yields how many were actually released.
    pub fn release(&self, count: u64) -> u64 {
        self.shared.release(count)
    }

    /// Slots currently taken but not yet released.
    pub fn outstanding(&self) -> u64 {
        self.shared
            .taken
            .load(Ordering::SeqCst)
            .saturating_sub(self.shared.released.load(Ordering::SeqCst))
    }
}

/// Shared handle to a pipe for registries that must close it from outside.
#[derive(Clone)]
pub struct PipeHandle {
    shared: Arc<PipeShared>,
}

impl std::fmt::Debug for PipeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeHandle")
            .field("capacity", &self.shared.capacity)
            .field("state", &self.shared.state())
            .finish()
    }
}

impl PipeHandle {
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    pub fn occupancy(&self) -> usize {
        self.shared.occupancy.0.load(Ordering::SeqCst)
    }

    /// Close the pipe, waking both sides. Returns false if it was already closed.
    pub fn close(&self) -> bool {
        self.shared.close()
    }
}
