//! Common identifiers shared across the relay core

use std::fmt;

/// Identity of one downstream peer in the registry. Assigned from a
/// monotonic counter on accept; never reused within a process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bsc#{}", self.0)
    }
}

/// Direction a frame is travelling through the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// From the MSC, towards a downstream peer
    FromUpstream,
    /// From a downstream peer, towards the MSC
    FromDownstream,
}
