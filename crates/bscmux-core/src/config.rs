//! Relay configuration

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::errors::RelayError;

/// Complete relay configuration. Loaded from an optional TOML file with
/// `BSCMUX_*` environment overrides; every field has a default.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// MSC address to connect out to
    pub msc_addr: String,
    /// Local address to accept BSC connections on
    pub listen_addr: String,
    /// Identity announced to the MSC during the handshake
    pub unit_id: String,
    /// Maximum declared frame length accepted from any peer
    pub max_frame_len: usize,
    /// Maximum concurrent downstream peers
    pub max_peers: usize,
    /// Per-peer outbound queue depth; overflow closes the peer
    pub outbound_queue_depth: usize,
    /// Upstream outbound queue depth; when full the engine stops
    /// draining downstream traffic (global backpressure)
    pub upstream_queue_depth: usize,
    /// Engine event queue depth
    pub event_queue_depth: usize,
    /// Keepalive probe interval (ms)
    pub keepalive_interval_ms: u64,
    /// Missed intervals before a session is considered dead
    pub max_missed_keepalives: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            msc_addr: "127.0.0.1:5000".to_string(),
            listen_addr: "0.0.0.0:5000".to_string(),
            unit_id: "bscmux".to_string(),
            max_frame_len: 4096,
            max_peers: 64,
            outbound_queue_depth: 128,
            upstream_queue_depth: 256,
            event_queue_depth: 256,
            keepalive_interval_ms: 20_000,
            max_missed_keepalives: 3,
        }
    }
}

impl RelayConfig {
    /// Load configuration: defaults, then the given file (must exist when
    /// named explicitly), then `BSCMUX_*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, RelayError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("BSCMUX").try_parsing(true),
        );

        builder
            .build()
            .and_then(config::Config::try_deserialize)
            .map_err(|e| RelayError::Config(e.to_string()))
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }
}
