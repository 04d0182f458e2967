//! In-process transport: hand messages straight into the peer's inbound pipe.
//!
//! An inproc connection is two pipes and a relay task:
//!
//! ```text
//! PublisherCore ─▶ outbound ─take─▶ relay ─try_enqueue─▶ inbound ─▶ SubscriberCore
//!                     ▲                                     │
//!                     └──────── upstream release ◀──────────┘
//! ```
//!
//! The inbound pipe is built with the outbound pipe's `Releaser` as upstream,
//! so a dequeue by the subscriber returns the publisher-side slot at once.

use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::debug;

use super::{pump, Result, TransportAdapter, TransportError};
use crate::fanout::PeerId;
use crate::message::Message;
use crate::pipe::{EnqueueError, PipeReader, PipeWriter, Signal};

/// Adapter whose peer is the producer half of a local inbound pipe.
#[derive(Debug)]
pub struct InprocAdapter {
    peer: PipeWriter,
}

impl InprocAdapter {
    pub fn new(peer: PipeWriter) -> Self {
        Self { peer }
    }

    pub fn is_closed(&self) -> bool {
        self.peer.is_closed()
    }
}

impl TransportAdapter for InprocAdapter {
    fn drainable(&self) -> bool {
        // A closed peer is reported by `forward`.
        self.peer.is_closed() || self.peer.has_room()
    }

    fn forward(&mut self, msg: Message) -> Result<()> {
        self.peer.try_enqueue(msg).map_err(|e| match e {
            EnqueueError::Full(_) => TransportError::NotDrainable,
            EnqueueError::Closed(_) => TransportError::PeerClosed,
        })
    }

    fn on_peer_available(&mut self, signal: Arc<Signal>) {
        if !self.peer.watch_writable(signal) {
            debug!("Inbound pipe already has a writable hook");
        }
    }
}

/// Spawn the relay moving `outbound` into the adapter's inbound pipe.
///
/// `wake` must be the readable hook of `outbound`; it is also installed as
/// the inbound pipe's writable hook. `on_exit` runs once either side closes.
pub fn spawn_relay<F>(
    handle: &Handle,
    peer: PeerId,
    mut outbound: PipeReader,
    mut adapter: InprocAdapter,
    wake: Arc<Signal>,
    on_exit: F,
) -> JoinHandle<()>
where
    F: FnOnce() + Send + 'static,
{
    adapter.on_peer_available(wake.clone());
    handle.spawn(async move {
        loop {
            match pump(&mut outbound, &mut adapter) {
                Ok(_) => {}
                Err(e) => {
                    debug!(peer = %peer, reason = %e, "Inproc relay stopping");
                    break;
                }
            }
            if adapter.is_closed() {
                debug!(peer = %peer, "Inproc subscriber side closed");
                break;
            }
            wake.notified().await;
        }
        on_exit();
    })
}
