//! Subscriber side: fair-rotation receive across inbound pipes.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use super::{PeerId, PeerRegistry};
use crate::flow::{FlowError, Result, Timeout};
use crate::message::Message;
use crate::pipe::{PipeBuilder, PipeReader, PipeWriter, Signal};

struct InboundPeer {
    reader: Mutex<PipeReader>,
}

/// Registry of inbound pipes, one per connected publisher.
///
/// Every inbound pipe notifies one core-wide signal, so a blocked receiver
/// wakes on the first message from any peer.
pub struct SubscriberCore {
    peers: PeerRegistry<InboundPeer>,
    signal: Arc<Signal>,
    /// Id of the peer served last; the next receive starts after it.
    last_served: AtomicU64,
    closed: AtomicBool,
}

impl Default for SubscriberCore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SubscriberCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberCore")
            .field("peers", &self.peers.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl SubscriberCore {
    pub fn new() -> Self {
        Self {
            peers: PeerRegistry::new(),
            signal: Arc::new(Signal::new()),
            last_served: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Create the inbound pipe for `peer` with the given receive HWM.
    pub fn attach(&self, peer: PeerId, capacity: usize) -> Result<PipeWriter> {
        self.attach_pipe(peer, PipeBuilder::new(capacity))
    }

    /// Create the inbound pipe from a prepared builder.
    ///
    /// The builder's readable hook is replaced by the core-wide signal.
    pub fn attach_pipe(&self, peer: PeerId, builder: PipeBuilder) -> Result<PipeWriter> {
        if self.is_closed() {
            return Err(FlowError::Closed);
        }
        let capacity = builder.capacity();
        let (writer, reader) = builder.notify_readable(self.signal.clone()).build();
        let entry = Arc::new(InboundPeer {
            reader: Mutex::new(reader),
        });
        if let Some(previous) = self.peers.insert(peer, entry) {
            previous.reader.lock().close();
        }
        if self.is_closed() {
            self.detach(peer);
            return Err(FlowError::Closed);
        }
        self.signal.notify();
        info!(peer = %peer, hwm = capacity, "Publisher attached");
        Ok(writer)
    }

    /// Remove a peer, closing its pipe and discarding what it still holds.
    pub fn detach(&self, peer: PeerId) -> bool {
        match self.peers.remove(peer) {
            Some(entry) => {
                entry.reader.lock().close();
                self.signal.notify();
                info!(peer = %peer, "Publisher detached");
                true
            }
            None => false,
        }
    }

    /// Receive the next message, rotating fairly over peers.
    pub fn receive(&self, non_blocking: bool, timeout: Timeout) -> Result<Message> {
        let deadline = timeout.deadline();
        loop {
            match self.try_receive() {
                Err(FlowError::WouldBlock) => {}
                other => return other,
            }
            if timeout.is_immediate(non_blocking) {
                return Err(FlowError::WouldBlock);
            }
            let ready = self
                .signal
                .wait_until(|| self.is_closed() || self.any_readable(), deadline);
            if !ready {
                return Err(FlowError::TimedOut);
            }
        }
    }

    /// One pass over all peers, starting after the one served last.
    fn try_receive(&self) -> Result<Message> {
        if self.is_closed() {
            return Err(FlowError::Closed);
        }
        let peers = self.peers.snapshot();
        if peers.is_empty() {
            return Err(FlowError::WouldBlock);
        }

        let last = self.last_served.load(Ordering::Relaxed);
        let start = peers.partition_point(|(peer, _)| peer.as_u64() <= last);
        let count = peers.len();
        for offset in 0..count {
            let (peer, entry) = &peers[(start + offset) % count];
            let mut reader = entry.reader.lock();
            if let Ok(msg) = reader.try_dequeue() {
                self.last_served.store(peer.as_u64(), Ordering::Relaxed);
                return Ok(msg);
            }
        }
        Err(FlowError::WouldBlock)
    }

    fn any_readable(&self) -> bool {
        self.peers
            .snapshot()
            .iter()
            .any(|(_, entry)| entry.reader.lock().is_readable())
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close every inbound pipe; blocked receivers wake with `Closed`.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let peers = self.peers.drain();
        for (_, entry) in &peers {
            entry.reader.lock().close();
        }
        self.signal.notify();
        debug!(peers = peers.len(), "Subscriber core closed");
    }
}
