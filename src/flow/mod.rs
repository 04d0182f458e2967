//! Flow control on the producer side of a pipe.
//!
//! `MuteStateMachine` wraps a `PipeWriter` and applies the configured
//! `FlowPolicy` once the pipe reaches its high-water mark:
//! - `Drop`: the message is discarded and the call still succeeds
//! - `Block`: the caller gets `WouldBlock`, or is suspended until the consumer
//!   frees a slot, the timeout elapses, or the pipe closes

use std::time::{Duration, Instant};

use serde::Deserialize;
use tracing::{debug, trace};

use crate::message::Message;
use crate::pipe::{EnqueueError, MuteState, PipeWriter};

/// Result type for flow-controlled operations.
pub type Result<T> = std::result::Result<T, FlowError>;

/// Outcomes of a publish or receive that the caller must handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FlowError {
    #[error("operation would block")]
    WouldBlock,

    #[error("operation timed out")]
    TimedOut,

    #[error("pipe or socket closed")]
    Closed,
}

/// Successful publish outcomes for a single pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Message enqueued.
    Delivered,
    /// Pipe muted under DROP policy; message intentionally discarded.
    Dropped,
}

/// Behaviour of a publisher-side pipe at its high-water mark.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowPolicy {
    /// Discard silently; never blocks the caller.
    #[default]
    Drop,
    /// Suspend the caller or fail with would-block/timeout; never discards.
    Block,
}

/// Bounded wait for blocking operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Do not wait at all.
    Immediate,
    /// Wait until the condition holds or the pipe closes.
    Infinite,
    /// Wait at most this long.
    After(Duration),
}

impl Timeout {
    /// Socket-option style conversion: 0 = immediate, negative = infinite.
    pub fn from_millis(ms: i64) -> Self {
        match ms {
            0 => Timeout::Immediate,
            ms if ms < 0 => Timeout::Infinite,
            ms => Timeout::After(Duration::from_millis(ms as u64)),
        }
    }

    /// Absolute deadline starting now. `None` means no deadline.
    pub fn deadline(&self) -> Option<Instant> {
        match self {
            Timeout::Immediate => Some(Instant::now()),
            Timeout::Infinite => None,
            Timeout::After(d) => Some(Instant::now() + *d),
        }
    }

    /// True when a call must not wait, either by flag or by timeout.
    pub fn is_immediate(&self, non_blocking: bool) -> bool {
        non_blocking || matches!(self, Timeout::Immediate)
    }
}

impl Default for Timeout {
    fn default() -> Self {
        Timeout::Infinite
    }
}

/// Producer-side state machine enforcing the flow policy on one pipe.
#[derive(Debug)]
pub struct MuteStateMachine {
    writer: PipeWriter,
    policy: FlowPolicy,
}

impl MuteStateMachine {
    /// Policy and HWM (the writer's capacity) are fixed from here on.
    pub fn new(writer: PipeWriter, policy: FlowPolicy) -> Self {
        Self { writer, policy }
    }

    pub fn policy(&self) -> FlowPolicy {
        self.policy
    }

    pub fn state(&self) -> MuteState {
        self.writer.state()
    }

    pub fn occupancy(&self) -> usize {
        self.writer.occupancy()
    }

    pub fn capacity(&self) -> usize {
        self.writer.capacity()
    }

    pub fn is_closed(&self) -> bool {
        self.writer.is_closed()
    }

    /// Publish one message through this pipe.
    pub fn publish(
        &mut self,
        msg: Message,
        non_blocking: bool,
        timeout: Timeout,
    ) -> Result<Delivery> {
        match self.writer.state() {
            MuteState::Closed => Err(FlowError::Closed),
            MuteState::Active => self.deliver(msg),
            MuteState::Muted => match self.policy {
                FlowPolicy::Drop => {
                    trace!("Pipe muted, dropping message");
                    Ok(Delivery::Dropped)
                }
                FlowPolicy::Block => {
                    if timeout.is_immediate(non_blocking) {
                        return Err(FlowError::WouldBlock);
                    }
                    self.wait_for_room(timeout.deadline())?;
                    self.deliver(msg)
                }
            },
        }
    }

    /// True if a BLOCK pipe would have to wait before accepting a message.
    pub(crate) fn must_wait(&self) -> bool {
        self.policy == FlowPolicy::Block
            && !self.writer.is_closed()
            && self.writer.state() == MuteState::Muted
    }

    /// Suspend until the pipe has room, the deadline passes, or it closes.
    pub(crate) fn wait_for_room(&self, deadline: Option<Instant>) -> Result<()> {
        let writer = &self.writer;
        debug!(
            occupancy = writer.occupancy(),
            capacity = writer.capacity(),
            "Publisher blocked at high-water mark"
        );
        let ready = writer
            .writable_signal()
            .wait_until(|| writer.is_closed() || writer.has_room(), deadline);

        if writer.is_closed() {
            Err(FlowError::Closed)
        } else if ready {
            Ok(())
        } else {
            Err(FlowError::TimedOut)
        }
    }

    /// Enqueue a message; the pipe is expected to have room.
    fn deliver(&mut self, msg: Message) -> Result<Delivery> {
        match self.writer.enqueue_and_mute(msg) {
            Ok(()) => Ok(Delivery::Delivered),
            Err(EnqueueError::Closed(_)) => Err(FlowError::Closed),
            // Only reachable if the state was stale; resolve per policy.
            Err(EnqueueError::Full(_)) => match self.policy {
                FlowPolicy::Drop => Ok(Delivery::Dropped),
                FlowPolicy::Block => Err(FlowError::WouldBlock),
            },
        }
    }

    /// Close the underlying pipe, waking any suspended producer.
    pub fn close(&self) {
        self.writer.close();
    }
}
