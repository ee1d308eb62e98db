//! Upstream MSC session
//!
//! Exactly one per process. The relay connects out, announces itself with
//! an `IdRequest`, and is traffic-ready once the MSC acks. Every failure
//! of this link is process-fatal: the relay is pointless without its MSC,
//! so the supervisor shuts down instead of retrying.

use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::RelayConfig;
use crate::engine::{self, Event};
use crate::errors::UpstreamFatal;
use crate::ipa::control::ControlMessage;

/// Upstream link state ladder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamState {
    Disconnected,
    Connecting,
    AwaitingHandshake,
    Ready,
    Closed,
}

/// The engine's handle on the MSC connection
pub(crate) struct UpstreamLink {
    pub(crate) tx: mpsc::Sender<Bytes>,
    pub(crate) state: UpstreamState,
    /// Keepalive intervals without an acknowledgment
    pub(crate) unacked: u32,
    pub(crate) reader: Option<JoinHandle<()>>,
    pub(crate) writer: Option<JoinHandle<()>>,
}

impl UpstreamLink {
    /// Connect to the MSC and start the handshake. Returns with the link
    /// in `AwaitingHandshake`; the engine completes the ladder when the
    /// ack frame arrives.
    pub(crate) async fn connect(
        cfg: &RelayConfig,
        events: mpsc::Sender<Event>,
    ) -> Result<Self, UpstreamFatal> {
        info!(msc = %cfg.msc_addr, "connecting to MSC");

        let stream = TcpStream::connect(&cfg.msc_addr)
            .await
            .map_err(|e| UpstreamFatal::ConnectFailed {
                addr: cfg.msc_addr.clone(),
                reason: e.to_string(),
            })?;

        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::channel(cfg.upstream_queue_depth);

        let writer = engine::spawn_writer(write_half, rx, events.clone(), Event::Upstream);
        let reader = engine::spawn_reader(read_half, cfg.max_frame_len, events, Event::Upstream);

        let id_request = ControlMessage::IdRequest {
            identity: cfg.unit_id.clone(),
        };
        tx.send(id_request.to_frame().encode())
            .await
            .map_err(|_| UpstreamFatal::HandshakeFailed("link closed before handshake"))?;

        debug!(identity = %cfg.unit_id, "identity announced, awaiting MSC ack");

        Ok(Self {
            tx,
            state: UpstreamState::AwaitingHandshake,
            unacked: 0,
            reader: Some(reader),
            writer: Some(writer),
        })
    }

    /// The MSC acknowledged our identity.
    pub(crate) fn handshake_acked(&mut self) {
        if self.state == UpstreamState::AwaitingHandshake {
            info!("MSC handshake complete, upstream ready");
            self.state = UpstreamState::Ready;
            self.unacked = 0;
        } else {
            debug!(state = ?self.state, "ignoring redundant handshake ack");
        }
    }

    pub(crate) fn note_pong(&mut self) {
        self.unacked = 0;
    }

    /// One keepalive interval elapsed. `Ok(true)` means a probe should be
    /// sent; expiry of the configured missed-interval budget is fatal.
    pub(crate) fn bump_tick(&mut self, max_missed: u32) -> Result<bool, UpstreamFatal> {
        self.unacked += 1;
        if self.unacked > max_missed {
            self.state = UpstreamState::Closed;
            return Err(UpstreamFatal::KeepaliveTimeout { missed: max_missed });
        }
        Ok(self.state == UpstreamState::Ready)
    }

    /// Tear the link down: abort its I/O tasks and mark it closed.
    pub(crate) fn close(&mut self) {
        self.state = UpstreamState::Closed;
        if let Some(task) = self.reader.take() {
            task.abort();
        }
        if let Some(task) = self.writer.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idle_link() -> (UpstreamLink, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(8);
        (
            UpstreamLink {
                tx,
                state: UpstreamState::AwaitingHandshake,
                unacked: 0,
                reader: None,
                writer: None,
            },
            rx,
        )
    }

    #[test]
    fn handshake_ack_reaches_ready_once() {
        let (mut link, _rx) = idle_link();
        link.handshake_acked();
        assert_eq!(link.state, UpstreamState::Ready);
        link.handshake_acked();
        assert_eq!(link.state, UpstreamState::Ready);
    }

    #[test]
    fn keepalive_budget_expires_fatally() {
        let (mut link, _rx) = idle_link();
        link.handshake_acked();

        assert!(link.bump_tick(2).unwrap());
        assert!(link.bump_tick(2).unwrap());
        let err = link.bump_tick(2).unwrap_err();
        assert!(matches!(err, UpstreamFatal::KeepaliveTimeout { missed: 2 }));
        assert_eq!(link.state, UpstreamState::Closed);
    }

    #[test]
    fn pong_resets_the_budget() {
        let (mut link, _rx) = idle_link();
        link.handshake_acked();

        link.bump_tick(2).unwrap();
        link.bump_tick(2).unwrap();
        link.note_pong();
        assert!(link.bump_tick(2).is_ok());
    }

    #[test]
    fn stalled_handshake_also_expires() {
        // Still AwaitingHandshake: no probes are sent, but the budget runs
        let (mut link, _rx) = idle_link();
        assert!(!link.bump_tick(1).unwrap());
        assert!(link.bump_tick(1).is_err());
    }
}
