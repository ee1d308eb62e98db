//! Control protocol carried on [`Proto::Control`] frames
//!
//! The identity exchange brings a link to `Ready`: the connecting side
//! announces itself with [`ControlMessage::IdRequest`], the accepting side
//! replies with [`ControlMessage::IdAck`]. Ping/Pong is the liveness probe
//! pair. Message type numbering follows the IPA control protocol.

use bytes::{BufMut, Bytes, BytesMut};

use super::{Frame, Proto};
use crate::errors::TransportError;

const MSG_PING: u8 = 0x00;
const MSG_PONG: u8 = 0x01;
const MSG_ID_REQUEST: u8 = 0x04;
const MSG_ID_ACK: u8 = 0x06;

/// One control message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Liveness probe
    Ping,
    /// Liveness acknowledgment
    Pong,
    /// Identity announcement from the connecting side
    IdRequest { identity: String },
    /// Handshake acknowledgment from the accepting side
    IdAck,
}

impl ControlMessage {
    /// Decode the payload of a control frame.
    pub fn decode(payload: &[u8]) -> Result<Self, TransportError> {
        let (&msg_type, rest) = payload
            .split_first()
            .ok_or(TransportError::Malformed("empty control message"))?;

        match msg_type {
            MSG_PING => Ok(Self::Ping),
            MSG_PONG => Ok(Self::Pong),
            MSG_ID_REQUEST => {
                let identity = std::str::from_utf8(rest)
                    .map_err(|_| TransportError::Malformed("identity is not UTF-8"))?;
                Ok(Self::IdRequest {
                    identity: identity.to_string(),
                })
            }
            MSG_ID_ACK => Ok(Self::IdAck),
            _ => Err(TransportError::Malformed("unknown control message type")),
        }
    }

    /// Encode to a control frame payload.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(16);
        match self {
            Self::Ping => buf.put_u8(MSG_PING),
            Self::Pong => buf.put_u8(MSG_PONG),
            Self::IdRequest { identity } => {
                buf.put_u8(MSG_ID_REQUEST);
                buf.put_slice(identity.as_bytes());
            }
            Self::IdAck => buf.put_u8(MSG_ID_ACK),
        }
        buf.freeze()
    }

    /// Wrap into a ready-to-send control frame.
    pub fn to_frame(&self) -> Frame {
        Frame::new(Proto::Control, self.encode())
    }
}
