//! Publisher side: fan-out of every message to all attached subscribers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use super::{PeerId, PeerRegistry};
use crate::flow::{Delivery, FlowError, FlowPolicy, MuteStateMachine, Result, Timeout};
use crate::message::Message;
use crate::pipe::{PipeHandle, PipeWriter};

/// Per-peer outcome counts of a single publish call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishSummary {
    pub delivered: usize,
    pub dropped: usize,
}

struct OutboundPeer {
    machine: Mutex<MuteStateMachine>,
    /// Closes the pipe even while a publisher holds `machine`.
    handle: PipeHandle,
}

/// Registry of outbound pipes, one per connected subscriber.
pub struct PublisherCore {
    peers: PeerRegistry<OutboundPeer>,
    /// Serialises publishers so every pipe keeps a single producer.
    publish_lock: Mutex<()>,
    closed: AtomicBool,
}

impl Default for PublisherCore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PublisherCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublisherCore")
            .field("peers", &self.peers.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl PublisherCore {
    pub fn new() -> Self {
        Self {
            peers: PeerRegistry::new(),
            publish_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    /// Attach the producer half of a new outbound pipe for `peer`.
    ///
    /// The pipe's capacity is its HWM; `policy` is fixed for the pipe's life.
    pub fn attach(&self, peer: PeerId, writer: PipeWriter, policy: FlowPolicy) -> Result<()> {
        if self.is_closed() {
            writer.close();
            return Err(FlowError::Closed);
        }
        let capacity = writer.capacity();
        let entry = Arc::new(OutboundPeer {
            handle: writer.handle(),
            machine: Mutex::new(MuteStateMachine::new(writer, policy)),
        });
        if let Some(previous) = self.peers.insert(peer, entry) {
            previous.handle.close();
        }
        // close() may have drained the registry between the check and the insert
        if self.is_closed() {
            self.detach(peer);
            return Err(FlowError::Closed);
        }
        info!(peer = %peer, hwm = capacity, policy = ?policy, "Subscriber attached");
        Ok(())
    }

    /// Remove a peer, closing its pipe and discarding undelivered messages.
    pub fn detach(&self, peer: PeerId) -> bool {
        match self.peers.remove(peer) {
            Some(entry) => {
                entry.handle.close();
                info!(peer = %peer, "Subscriber detached");
                true
            }
            None => false,
        }
    }

    /// Publish `msg` to every attached peer.
    ///
    /// BLOCK pipes are settled before anything is delivered: a muted one makes
    /// a non-blocking call fail with `WouldBlock`, and a blocking call waits
    /// until every muted BLOCK pipe has room (one deadline for all of them).
    /// Only then is the message handed to each pipe. DROP pipes never affect
    /// the outcome. Publishing with no peers succeeds with an empty summary.
    pub fn publish(
        &self,
        msg: Message,
        non_blocking: bool,
        timeout: Timeout,
    ) -> Result<PublishSummary> {
        if self.is_closed() {
            return Err(FlowError::Closed);
        }
        let _serial = self.publish_lock.lock();
        let peers = self.peers.snapshot();
        let deadline = timeout.deadline();

        for (peer, entry) in &peers {
            let machine = entry.machine.lock();
            if !machine.must_wait() {
                continue;
            }
            if timeout.is_immediate(non_blocking) {
                return Err(FlowError::WouldBlock);
            }
            match machine.wait_for_room(deadline) {
                Ok(()) => {}
                Err(FlowError::Closed) => {
                    debug!(peer = %peer, "Peer departed while publisher was blocked");
                }
                Err(e) => return Err(e),
            }
        }

        if self.is_closed() {
            return Err(FlowError::Closed);
        }

        let mut summary = PublishSummary::default();
        for (peer, entry) in &peers {
            let mut machine = entry.machine.lock();
            match machine.publish(msg.clone(), true, Timeout::Immediate) {
                Ok(Delivery::Delivered) => summary.delivered += 1,
                Ok(Delivery::Dropped) => summary.dropped += 1,
                Err(FlowError::Closed) => {
                    debug!(peer = %peer, "Skipping closed pipe");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(summary)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.peers
            .snapshot()
            .into_iter()
            .map(|(peer, _)| peer)
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close every pipe and reject later publishes. Blocked publishers wake
    /// with `Closed`.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let peers = self.peers.drain();
        for (_, entry) in &peers {
            entry.handle.close();
        }
        debug!(peers = peers.len(), "Publisher core closed");
    }
}
