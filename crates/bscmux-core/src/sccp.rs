//! Connection-oriented SCCP classification
//!
//! The relay never interprets SCCP beyond what routing needs: the message
//! type and the 3-octet local reference that identifies the session
//! context. A downstream CR carries the peer's source reference, the
//! context that peer establishes. Everything the MSC sends back (CC, DT1,
//! RLSD, RLC) addresses that context in its destination reference. RLC
//! completes a release and retires the context in either direction.

use bytes::{BufMut, Bytes, BytesMut};

/// SCCP message types the relay understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Connection Request
    Cr = 0x01,
    /// Connection Confirm
    Cc = 0x02,
    /// Released
    Rlsd = 0x04,
    /// Release Complete
    Rlc = 0x05,
    /// Data Form 1
    Dt1 = 0x06,
}

impl MessageType {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Cr),
            0x02 => Some(Self::Cc),
            0x04 => Some(Self::Rlsd),
            0x05 => Some(Self::Rlc),
            0x06 => Some(Self::Dt1),
            _ => None,
        }
    }
}

/// What a frame arriving from a downstream peer means for routing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FromDownstream {
    /// CR: the peer establishes this context (its source reference)
    Opens(u32),
    /// RLC: the peer's side of a release completed; its own reference
    /// sits in the source field
    Releases(u32),
    /// Forwarded upstream unchanged; no routing-table effect
    Transit,
}

/// What a frame arriving from the MSC means for routing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FromUpstream {
    /// Addresses an established context via its destination reference
    Addressed { context: u32, releases: bool },
    /// No usable reference; cannot be delivered to any one peer
    Unroutable,
}

fn reference_at(payload: &[u8], offset: usize) -> Option<u32> {
    let bytes = payload.get(offset..offset + 3)?;
    Some(u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]]))
}

/// Classify a payload coming from a downstream peer.
pub fn classify_downstream(payload: &[u8]) -> FromDownstream {
    let Some(msg_type) = payload.first().copied().and_then(MessageType::from_u8) else {
        return FromDownstream::Transit;
    };

    match msg_type {
        MessageType::Cr => match reference_at(payload, 1) {
            Some(source_ref) => FromDownstream::Opens(source_ref),
            None => FromDownstream::Transit,
        },
        // RLC: destination reference first, then the sender's own source
        // reference, which is the context this relay tracks
        MessageType::Rlc => match reference_at(payload, 4) {
            Some(source_ref) => FromDownstream::Releases(source_ref),
            None => FromDownstream::Transit,
        },
        _ => FromDownstream::Transit,
    }
}

/// Classify a payload coming from the MSC.
pub fn classify_upstream(payload: &[u8]) -> FromUpstream {
    let Some(msg_type) = payload.first().copied().and_then(MessageType::from_u8) else {
        return FromUpstream::Unroutable;
    };

    match msg_type {
        // CR from the MSC would open an MSC-originated connection, which
        // this relay has no owner for
        MessageType::Cr => FromUpstream::Unroutable,
        MessageType::Cc | MessageType::Rlsd | MessageType::Rlc | MessageType::Dt1 => {
            match reference_at(payload, 1) {
                Some(context) => FromUpstream::Addressed {
                    context,
                    releases: msg_type == MessageType::Rlc,
                },
                None => FromUpstream::Unroutable,
            }
        }
    }
}

fn put_reference(buf: &mut BytesMut, reference: u32) {
    buf.put_uint(u64::from(reference) & 0x00FF_FFFF, 3);
}

/// Encode a Connection Request. Used by peers and tests; the relay itself
/// only forwards.
pub fn cr(source_ref: u32, data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + data.len());
    buf.put_u8(MessageType::Cr as u8);
    put_reference(&mut buf, source_ref);
    buf.put_slice(data);
    buf.freeze()
}

/// Encode a Connection Confirm.
pub fn cc(destination_ref: u32, source_ref: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(7);
    buf.put_u8(MessageType::Cc as u8);
    put_reference(&mut buf, destination_ref);
    put_reference(&mut buf, source_ref);
    buf.freeze()
}

/// Encode a Data Form 1.
pub fn dt1(destination_ref: u32, data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(5 + data.len());
    buf.put_u8(MessageType::Dt1 as u8);
    put_reference(&mut buf, destination_ref);
    buf.put_u8(0); // no segmenting
    buf.put_slice(data);
    buf.freeze()
}

/// Encode a Released.
pub fn rlsd(destination_ref: u32, source_ref: u32, cause: u8) -> Bytes {
    let mut buf = BytesMut::with_capacity(8);
    buf.put_u8(MessageType::Rlsd as u8);
    put_reference(&mut buf, destination_ref);
    put_reference(&mut buf, source_ref);
    buf.put_u8(cause);
    buf.freeze()
}

/// Encode a Release Complete.
pub fn rlc(destination_ref: u32, source_ref: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(7);
    buf.put_u8(MessageType::Rlc as u8);
    put_reference(&mut buf, destination_ref);
    put_reference(&mut buf, source_ref);
    buf.freeze()
}
