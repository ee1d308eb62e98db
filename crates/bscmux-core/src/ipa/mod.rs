//! IPA multiplex framing
//!
//! Every message on the wire is one frame: a big-endian `u16` length that
//! covers the protocol byte and the payload, then one protocol byte, then
//! the payload. Two protocol identifiers matter to the relay: `0xFE`
//! carries the control exchange (identity handshake, keepalive) and `0xFD`
//! carries the SCCP traffic that gets routed. Everything else is preserved
//! as [`Proto::Other`].

pub mod control;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::errors::TransportError;

/// Control protocol identifier (handshake/keepalive)
pub const PROTO_CONTROL: u8 = 0xFE;

/// SCCP payload protocol identifier (routed traffic)
pub const PROTO_SCCP: u8 = 0xFD;

/// Length of the frame header: u16 length field
const HEADER_LEN: usize = 2;

/// Protocol identifier carried in every frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proto {
    /// Handshake/keepalive, consumed by the session that received it
    Control,
    /// Connection-oriented SCCP, routed by local reference
    Sccp,
    /// Anything else; carried opaquely
    Other(u8),
}

impl Proto {
    fn from_wire(byte: u8) -> Self {
        match byte {
            PROTO_CONTROL => Self::Control,
            PROTO_SCCP => Self::Sccp,
            other => Self::Other(other),
        }
    }

    fn to_wire(self) -> u8 {
        match self {
            Self::Control => PROTO_CONTROL,
            Self::Sccp => PROTO_SCCP,
            Self::Other(byte) => byte,
        }
    }
}

/// One parsed frame. Immutable; produced by [`FrameCodec`], consumed by the
/// router or a session state machine within the dispatch that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub proto: Proto,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(proto: Proto, payload: impl Into<Bytes>) -> Self {
        Self {
            proto,
            payload: payload.into(),
        }
    }

    /// Serialize back to wire bytes. Exact inverse of decoding:
    /// `decode(encode(f)) == f` for every frame whose payload fits
    /// the length field.
    pub fn encode(&self) -> Bytes {
        let body_len = 1 + self.payload.len();
        let mut buf = BytesMut::with_capacity(HEADER_LEN + body_len);
        buf.put_u16(body_len as u16);
        buf.put_u8(self.proto.to_wire());
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}

/// Incremental frame parser with a per-connection accumulator.
///
/// Bytes are appended with [`feed`](Self::feed); [`next_frame`](Self::next_frame)
/// yields a frame once the declared length is fully buffered, so arbitrary
/// partial arrivals reassemble to the same frames as a single delivery.
#[derive(Debug)]
pub struct FrameCodec {
    buf: BytesMut,
    max_frame_len: usize,
}

impl FrameCodec {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(4096),
            max_frame_len,
        }
    }

    /// Append newly received bytes to the accumulator.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Buffer exposed for reading directly from a socket.
    pub fn read_buf(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Pull the next complete frame out of the accumulator, if one is
    /// fully buffered. `Ok(None)` means more bytes are needed.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, TransportError> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let declared = u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize;
        if declared == 0 {
            return Err(TransportError::Malformed("zero-length frame"));
        }
        if declared > self.max_frame_len {
            return Err(TransportError::FrameTooLarge {
                len: declared,
                max: self.max_frame_len,
            });
        }
        if self.buf.len() < HEADER_LEN + declared {
            return Ok(None);
        }

        self.buf.advance(HEADER_LEN);
        let mut body = self.buf.split_to(declared);
        let proto = Proto::from_wire(body.get_u8());
        Ok(Some(Frame {
            proto,
            payload: body.freeze(),
        }))
    }

    /// Report end-of-stream. Leftover bytes mean the peer closed the
    /// connection in the middle of a frame.
    pub fn finish(&self) -> Result<(), TransportError> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(TransportError::TruncatedStream)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_whole(bytes: &[u8], max: usize) -> Vec<Frame> {
        let mut codec = FrameCodec::new(max);
        codec.feed(bytes);
        let mut frames = Vec::new();
        while let Some(frame) = codec.next_frame().unwrap() {
            frames.push(frame);
        }
        codec.finish().unwrap();
        frames
    }

    #[test]
    fn round_trip() {
        let frames = [
            Frame::new(Proto::Control, vec![0x06]),
            Frame::new(Proto::Sccp, vec![0x01, 0x00, 0x00, 0x07, 0xAA]),
            Frame::new(Proto::Other(0x00), Vec::new()),
        ];

        for frame in frames {
            let decoded = decode_whole(&frame.encode(), 4096);
            assert_eq!(decoded, vec![frame]);
        }
    }

    #[test]
    fn partial_delivery_reassembles() {
        let frame = Frame::new(Proto::Sccp, (0u8..100).collect::<Vec<_>>());
        let wire = frame.encode();

        // Every split point, including mid-header
        for split in 0..wire.len() {
            let mut codec = FrameCodec::new(4096);
            codec.feed(&wire[..split]);
            assert_eq!(codec.next_frame().unwrap(), None);
            codec.feed(&wire[split..]);
            assert_eq!(codec.next_frame().unwrap(), Some(frame.clone()));
            codec.finish().unwrap();
        }

        // Byte-at-a-time
        let mut codec = FrameCodec::new(4096);
        for byte in wire.iter() {
            codec.feed(std::slice::from_ref(byte));
        }
        assert_eq!(codec.next_frame().unwrap(), Some(frame));
    }

    #[test]
    fn several_frames_in_one_buffer() {
        let a = Frame::new(Proto::Control, vec![0x00]);
        let b = Frame::new(Proto::Sccp, vec![0x06, 1, 2, 3]);
        let mut wire = a.encode().to_vec();
        wire.extend_from_slice(&b.encode());

        assert_eq!(decode_whole(&wire, 4096), vec![a, b]);
    }

    #[test]
    fn oversized_frame_rejected() {
        let frame = Frame::new(Proto::Sccp, vec![0u8; 64]);
        let mut codec = FrameCodec::new(16);
        codec.feed(&frame.encode());
        assert!(matches!(
            codec.next_frame(),
            Err(TransportError::FrameTooLarge { len: 65, max: 16 })
        ));
    }

    #[test]
    fn zero_length_rejected() {
        let mut codec = FrameCodec::new(4096);
        codec.feed(&[0x00, 0x00, 0xFD]);
        assert!(matches!(
            codec.next_frame(),
            Err(TransportError::Malformed(_))
        ));
    }

    #[test]
    fn truncated_stream_reported_at_eof() {
        let frame = Frame::new(Proto::Sccp, vec![1, 2, 3, 4]);
        let wire = frame.encode();

        let mut codec = FrameCodec::new(4096);
        codec.feed(&wire[..wire.len() - 1]);
        assert_eq!(codec.next_frame().unwrap(), None);
        assert!(matches!(codec.finish(), Err(TransportError::TruncatedStream)));
    }
}
