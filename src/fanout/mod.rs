//! Per-peer pipe registries for the two socket cores.
//!
//! - `PublisherCore`: one outbound pipe per subscriber, fans out each message
//! - `SubscriberCore`: one inbound pipe per publisher, fair-rotation receive
//!
//! Registries are sharded maps so attaching or detaching a peer never blocks
//! publish/receive on other peers.

mod publisher;
mod subscriber;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

pub use publisher::{PublishSummary, PublisherCore};
pub use subscriber::SubscriberCore;

static NEXT_PEER_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of a connected peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId(u64);

impl PeerId {
    /// Allocate the next identifier. Identifiers increase monotonically.
    pub fn next() -> Self {
        PeerId(NEXT_PEER_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

/// Concurrent map from peer to per-peer state.
pub(crate) struct PeerRegistry<T> {
    peers: DashMap<PeerId, Arc<T>>,
}

impl<T> PeerRegistry<T> {
    pub fn new() -> Self {
        Self {
            peers: DashMap::new(),
        }
    }

    /// Returns the previous entry, if the peer was already registered.
    pub fn insert(&self, peer: PeerId, entry: Arc<T>) -> Option<Arc<T>> {
        self.peers.insert(peer, entry)
    }

    pub fn remove(&self, peer: PeerId) -> Option<Arc<T>> {
        self.peers.remove(&peer).map(|(_, entry)| entry)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Current entries ordered by peer id.
    pub fn snapshot(&self) -> Vec<(PeerId, Arc<T>)> {
        let mut entries: Vec<_> = self
            .peers
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        entries.sort_unstable_by_key(|(peer, _)| *peer);
        entries
    }

    /// Remove and return every entry.
    pub fn drain(&self) -> Vec<(PeerId, Arc<T>)> {
        let entries = self.snapshot();
        for (peer, _) in &entries {
            self.peers.remove(peer);
        }
        entries
    }
}
