//! # bscmux relay core
//!
//! A BSC multiplexer: one persistent upstream connection to an MSC, many
//! downstream BSC peers, and a routing table that keeps every SCCP
//! context with the peer that established it.
//!
//! - **ipa**: length-prefixed frame transport and the control exchange
//! - **sccp**: payload classification by message type and local reference
//! - **router** / **filter**: context routing and the patch hook
//! - **upstream** / **downstream**: the two session state machines
//! - **engine**: the single dispatch task that owns all of the above
//! - **supervisor**: process lifecycle, fatal-vs-recoverable decisions
//!
//! ## Example
//! ```rust,ignore
//! use bscmux_core::{RelayConfig, Supervisor};
//!
//! let cfg = RelayConfig::default();
//! Supervisor::run(cfg).await?;
//! ```

pub mod config;
pub mod downstream;
pub mod errors;
pub mod filter;
pub mod ipa;
pub mod router;
pub mod sccp;
pub mod supervisor;
pub mod types;
pub mod upstream;

mod engine;

// Re-exports
pub use config::RelayConfig;
pub use downstream::SessionState;
pub use errors::{RelayError, Result, TransportError, UpstreamFatal};
pub use ipa::{Frame, FrameCodec, Proto};
pub use supervisor::{Relay, Supervisor};
pub use types::{Direction, PeerId};
pub use upstream::UpstreamState;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
