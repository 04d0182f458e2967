//! Transport adapters: moving accepted messages from a pipe toward a peer.
//!
//! Supports:
//! - TCP: length-prefixed frames over a network stream
//! - IPC: the same frames over a Unix domain socket
//! - inproc: direct hand-off into the peer's inbound pipe
//!
//! Every transport is driven by the same [`pump`] loop, so pipe occupancy
//! reflects real backpressure regardless of which transport carries it: the
//! driver only takes a message out of the pipe when its adapter can make
//! progress with it.

pub mod endpoint;
pub mod frame;
pub mod inproc;
pub mod stream;

use std::sync::Arc;

use crate::message::Message;
use crate::pipe::{DequeueError, PipeReader, Signal};

pub use endpoint::Endpoint;
pub use inproc::InprocAdapter;
pub use stream::StreamAdapter;

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors from transports, endpoints and the frame codec.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("frame of {size} bytes exceeds the limit of {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("peer closed the connection")]
    PeerClosed,

    #[error("local pipe closed")]
    PipeClosed,

    #[error("adapter cannot accept a message right now")]
    NotDrainable,
}

/// Collaborator that carries messages from a local pipe to a peer.
pub trait TransportAdapter {
    /// True if `forward` can make progress now.
    fn drainable(&self) -> bool;

    /// Hand one message to the peer side.
    fn forward(&mut self, msg: Message) -> Result<()>;

    /// Register the signal to notify when the adapter becomes drainable again.
    fn on_peer_available(&mut self, signal: Arc<Signal>);
}

/// Move messages from `reader` to `adapter` while the adapter can take them.
///
/// Messages are taken, not dequeued: their slots stay accounted on the
/// producer side until the far end reports consumption. Returns how many
/// messages were forwarded, or `PipeClosed` once the pipe is closed.
pub fn pump<A>(reader: &mut PipeReader, adapter: &mut A) -> Result<usize>
where
    A: TransportAdapter + ?Sized,
{
    let mut forwarded = 0;
    while adapter.drainable() {
        match reader.take() {
            Ok(msg) => {
                adapter.forward(msg)?;
                forwarded += 1;
            }
            Err(DequeueError::Empty) => break,
            Err(DequeueError::Closed) => return Err(TransportError::PipeClosed),
        }
    }
    if forwarded == 0 && reader.is_closed() {
        return Err(TransportError::PipeClosed);
    }
    Ok(forwarded)
}
