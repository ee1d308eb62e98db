//! Downstream listener and per-peer sessions
//!
//! Each accepted BSC connection gets its own session with a handshake
//! sub-state machine mirroring the upstream one, scoped per peer: one
//! misbehaving peer never affects the others or the MSC link. The
//! registry is owned by the engine task; the accept loop only hands
//! sockets over as events.

use std::collections::HashMap;
use std::net::SocketAddr;

use bytes::Bytes;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::engine::Event;
use crate::types::PeerId;

/// Per-peer session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingHandshake,
    Ready,
    Closed,
}

/// One downstream session
pub(crate) struct Peer {
    pub(crate) addr: SocketAddr,
    pub(crate) state: SessionState,
    pub(crate) identity: Option<String>,
    /// Bounded outbound queue; overflow closes this peer
    pub(crate) tx: mpsc::Sender<Bytes>,
    /// Keepalive intervals without an acknowledgment
    pub(crate) unacked: u32,
    pub(crate) reader: Option<JoinHandle<()>>,
    pub(crate) writer: Option<JoinHandle<()>>,
}

impl Peer {
    pub(crate) fn new(addr: SocketAddr, tx: mpsc::Sender<Bytes>) -> Self {
        Self {
            addr,
            state: SessionState::AwaitingHandshake,
            identity: None,
            tx,
            unacked: 0,
            reader: None,
            writer: None,
        }
    }

    /// Drop the session's I/O. Both tasks are aborted: the reader so a
    /// closed peer produces no further frames, the writer because it may
    /// be blocked in `write_all` on a socket that is not draining.
    pub(crate) fn close(&mut self) {
        self.state = SessionState::Closed;
        if let Some(task) = self.reader.take() {
            task.abort();
        }
        if let Some(task) = self.writer.take() {
            task.abort();
        }
    }
}

/// All live downstream sessions, bounded by the configured maximum.
pub(crate) struct DownstreamRegistry {
    peers: HashMap<PeerId, Peer>,
    next_id: u64,
    max_peers: usize,
}

impl DownstreamRegistry {
    pub(crate) fn new(max_peers: usize) -> Self {
        Self {
            peers: HashMap::new(),
            next_id: 1,
            max_peers,
        }
    }

    pub(crate) fn at_capacity(&self) -> bool {
        self.peers.len() >= self.max_peers
    }

    /// Register a new session. Callers check capacity first; this returns
    /// the identity the engine tags the peer's traffic with.
    pub(crate) fn insert(&mut self, peer: Peer) -> PeerId {
        let id = PeerId(self.next_id);
        self.next_id += 1;
        self.peers.insert(id, peer);
        id
    }

    pub(crate) fn get_mut(&mut self, id: PeerId) -> Option<&mut Peer> {
        self.peers.get_mut(&id)
    }

    pub(crate) fn remove(&mut self, id: PeerId) -> Option<Peer> {
        self.peers.remove(&id)
    }

    pub(crate) fn contains(&self, id: PeerId) -> bool {
        self.peers.contains_key(&id)
    }

    pub(crate) fn ids(&self) -> Vec<PeerId> {
        self.peers.keys().copied().collect()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = (PeerId, &mut Peer)> {
        self.peers.iter_mut().map(|(id, peer)| (*id, peer))
    }

    pub(crate) fn len(&self) -> usize {
        self.peers.len()
    }
}

/// Accept BSC connections one at a time and hand them to the engine.
/// Transient accept failures are logged and the listener keeps going.
pub(crate) async fn accept_loop(listener: TcpListener, events: mpsc::Sender<Event>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                if events.send(Event::Accepted(stream, addr)).await.is_err() {
                    // Engine gone; nothing left to accept for
                    return;
                }
            }
            Err(e) => {
                warn!(error = %e, "accept failed, listener continuing");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_peer() -> Peer {
        let (tx, _rx) = mpsc::channel(1);
        Peer::new("127.0.0.1:9999".parse().unwrap(), tx)
    }

    #[test]
    fn registry_ids_are_never_reused() {
        let mut registry = DownstreamRegistry::new(4);
        let a = registry.insert(dummy_peer());
        registry.remove(a);
        let b = registry.insert(dummy_peer());
        assert_ne!(a, b);
    }

    #[test]
    fn capacity_is_enforced_by_caller_check() {
        let mut registry = DownstreamRegistry::new(2);
        registry.insert(dummy_peer());
        assert!(!registry.at_capacity());
        registry.insert(dummy_peer());
        assert!(registry.at_capacity());
    }

    #[test]
    fn close_is_idempotent_without_tasks() {
        let mut peer = dummy_peer();
        peer.close();
        peer.close();
        assert_eq!(peer.state, SessionState::Closed);
    }
}
