//! Error types for the relay core

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, RelayError>;

/// Top-level relay error
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("upstream failure: {0}")]
    Upstream(#[from] UpstreamFatal),

    #[error("could not listen on {addr}: {source}")]
    ListenFailed {
        addr: String,
        source: std::io::Error,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Connection-scoped framing/stream errors. Closing the affected
/// connection is the only remedy; these never escalate past it.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("frame of {len} bytes exceeds maximum {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("stream closed mid-frame")]
    TruncatedStream,

    #[error("malformed frame: {0}")]
    Malformed(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Process-scoped failures of the single upstream link. The relay has no
/// value without its upstream, so all of these terminate the process.
#[derive(Debug, Error)]
pub enum UpstreamFatal {
    #[error("connect to MSC {addr} failed: {reason}")]
    ConnectFailed { addr: String, reason: String },

    #[error("MSC handshake failed: {0}")]
    HandshakeFailed(&'static str),

    #[error("MSC connection lost")]
    ConnectionLost,

    #[error("MSC keepalive expired after {missed} missed intervals")]
    KeepaliveTimeout { missed: u32 },
}
