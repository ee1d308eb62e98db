//! Frame filtering/patching hook
//!
//! Applied to every payload frame right before forwarding. Pure function
//! of (direction, frame): it may replace the frame, drop it, or pass it
//! through; it has no other effect. Address-substitution rules for
//! specific SCCP payloads slot in here; frame kinds without a rule pass
//! through unmodified.

use crate::ipa::Frame;
use crate::types::Direction;

/// Outcome of the filter for one frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterAction {
    /// Forward this (possibly rewritten) frame
    Forward(Frame),
    /// Drop the frame entirely
    Drop,
}

/// Apply the patch rules to a payload frame about to be forwarded. The
/// default rule set is empty, so every frame passes through untouched;
/// undeliverable frames are the router's problem, not the filter's.
pub fn apply(_direction: Direction, frame: Frame) -> FilterAction {
    FilterAction::Forward(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipa::Proto;
    use crate::sccp;

    #[test]
    fn default_rules_are_identity() {
        let frames = [
            Frame::new(Proto::Sccp, sccp::dt1(7, b"payload")),
            Frame::new(Proto::Other(0x42), vec![1, 2, 3]),
        ];
        for frame in frames {
            assert_eq!(
                apply(Direction::FromUpstream, frame.clone()),
                FilterAction::Forward(frame.clone())
            );
            assert_eq!(
                apply(Direction::FromDownstream, frame.clone()),
                FilterAction::Forward(frame)
            );
        }
    }
}
