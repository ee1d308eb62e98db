//! Context routing table
//!
//! Maps each established SCCP context (the downstream peer's local
//! reference) to the peer that owns it. Entries are created in exactly one
//! place, a downstream CR, and removed by RLC, or wholesale when the
//! owning peer closes. The table lives inside the engine task and is never
//! shared, so it needs no synchronization.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::types::PeerId;

/// Context → owning downstream peer
#[derive(Debug, Default)]
pub struct Router {
    entries: HashMap<u32, PeerId>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a context a downstream peer is establishing. At most one
    /// peer may own a context at a time: a claim colliding with another
    /// live owner is refused, and the caller drops the frame.
    pub fn claim(&mut self, context: u32, peer: PeerId) -> bool {
        match self.entries.get(&context) {
            Some(&owner) if owner != peer => {
                warn!(%peer, context, %owner, "context already owned, dropping CR");
                false
            }
            _ => {
                debug!(%peer, context, "context established");
                self.entries.insert(context, peer);
                true
            }
        }
    }

    /// Owner of a context, if any.
    pub fn lookup(&self, context: u32) -> Option<PeerId> {
        self.entries.get(&context).copied()
    }

    /// Remove a context after its release completed.
    pub fn release(&mut self, context: u32) {
        if self.entries.remove(&context).is_some() {
            debug!(context, "context released");
        }
    }

    /// Drop every entry a peer owns. Called when that peer closes;
    /// returns how many entries went away.
    pub fn purge_peer(&mut self, peer: PeerId) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, owner| *owner != peer);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: PeerId = PeerId(1);
    const B: PeerId = PeerId(2);

    #[test]
    fn contexts_route_to_their_owner() {
        let mut router = Router::new();
        assert!(router.claim(7, A));
        assert!(router.claim(9, B));

        assert_eq!(router.lookup(7), Some(A));
        assert_eq!(router.lookup(9), Some(B));
        assert_eq!(router.lookup(8), None);
    }

    #[test]
    fn claims_cannot_steal_a_live_context() {
        let mut router = Router::new();
        assert!(router.claim(7, A));
        assert!(!router.claim(7, B));
        assert_eq!(router.lookup(7), Some(A));

        // Re-claim by the same owner is a no-op, not a conflict
        assert!(router.claim(7, A));
    }

    #[test]
    fn release_removes_one_entry() {
        let mut router = Router::new();
        router.claim(7, A);
        router.claim(9, A);
        router.release(7);

        assert_eq!(router.lookup(7), None);
        assert_eq!(router.lookup(9), Some(A));

        // Releasing an unknown context is harmless
        router.release(7);
    }

    #[test]
    fn purge_removes_everything_a_peer_owns() {
        let mut router = Router::new();
        router.claim(7, A);
        router.claim(8, A);
        router.claim(9, B);

        assert_eq!(router.purge_peer(A), 2);
        assert_eq!(router.lookup(7), None);
        assert_eq!(router.lookup(8), None);
        assert_eq!(router.lookup(9), Some(B));
        assert_eq!(router.len(), 1);
    }
}
