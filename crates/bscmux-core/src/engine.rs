//! Event dispatch engine
//!
//! The engine task owns every piece of routing state (the router table,
//! the downstream registry, the upstream link) and consumes a single
//! bounded event channel. Handlers run to completion one at a time, so
//! none of that state needs synchronization. Per-socket reader and writer
//! tasks only move bytes; readiness itself is the runtime's job.
//!
//! Backpressure falls out of the queue shapes: a downstream peer whose
//! bounded outbound queue overflows is closed on the spot, while a full
//! upstream queue makes the engine block, which in turn stops draining
//! reader events and lets TCP flow control throttle every peer.

use std::net::SocketAddr;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::downstream::{DownstreamRegistry, Peer, SessionState};
use crate::errors::{RelayError, TransportError, UpstreamFatal};
use crate::filter::{self, FilterAction};
use crate::ipa::control::ControlMessage;
use crate::ipa::{Frame, FrameCodec, Proto};
use crate::router::Router;
use crate::sccp::{self, FromDownstream, FromUpstream};
use crate::types::{Direction, PeerId};
use crate::upstream::{UpstreamLink, UpstreamState};

/// Something happened on one connection
#[derive(Debug)]
pub(crate) enum LinkEvent {
    /// A complete frame arrived
    Frame(Frame),
    /// The connection ended, cleanly or with a transport error
    Closed(Option<TransportError>),
}

/// Everything the engine reacts to
#[derive(Debug)]
pub(crate) enum Event {
    Upstream(LinkEvent),
    Accepted(TcpStream, SocketAddr),
    Downstream(PeerId, LinkEvent),
    /// One keepalive interval elapsed
    Tick,
    /// Emit a resource report (SIGUSR1)
    Report,
    /// Orderly shutdown requested
    Shutdown,
}

/// Spawn the read side of a connection: decode frames, emit events.
/// A decode error or EOF emits a final `Closed` event and ends the task.
pub(crate) fn spawn_reader(
    mut half: OwnedReadHalf,
    max_frame_len: usize,
    events: mpsc::Sender<Event>,
    wrap: impl Fn(LinkEvent) -> Event + Send + 'static,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut codec = FrameCodec::new(max_frame_len);
        loop {
            loop {
                match codec.next_frame() {
                    Ok(Some(frame)) => {
                        if events.send(wrap(LinkEvent::Frame(frame))).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        let _ = events.send(wrap(LinkEvent::Closed(Some(err)))).await;
                        return;
                    }
                }
            }

            match half.read_buf(codec.read_buf()).await {
                Ok(0) => {
                    let closed = match codec.finish() {
                        Ok(()) => LinkEvent::Closed(None),
                        Err(err) => LinkEvent::Closed(Some(err)),
                    };
                    let _ = events.send(wrap(closed)).await;
                    return;
                }
                Ok(_) => {}
                Err(err) => {
                    let _ = events
                        .send(wrap(LinkEvent::Closed(Some(err.into()))))
                        .await;
                    return;
                }
            }
        }
    })
}

/// Spawn the write side of a connection: drain the outbound queue into
/// the socket. Ends when the queue's senders are dropped; a write error
/// emits a `Closed` event.
pub(crate) fn spawn_writer(
    mut half: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<Bytes>,
    events: mpsc::Sender<Event>,
    wrap: impl Fn(LinkEvent) -> Event + Send + 'static,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(bytes) = outbound.recv().await {
            if let Err(err) = half.write_all(&bytes).await {
                let _ = events
                    .send(wrap(LinkEvent::Closed(Some(err.into()))))
                    .await;
                return;
            }
        }
    })
}

/// The relay's single dispatch task
pub(crate) struct Engine {
    cfg: RelayConfig,
    router: Router,
    registry: DownstreamRegistry,
    upstream: UpstreamLink,
    events: mpsc::Receiver<Event>,
    events_tx: mpsc::Sender<Event>,
}

impl Engine {
    pub(crate) fn new(
        cfg: RelayConfig,
        upstream: UpstreamLink,
        events: mpsc::Receiver<Event>,
        events_tx: mpsc::Sender<Event>,
    ) -> Self {
        let registry = DownstreamRegistry::new(cfg.max_peers);
        Self {
            cfg,
            router: Router::new(),
            registry,
            upstream,
            events,
            events_tx,
        }
    }

    /// Dispatch events until shutdown (Ok) or an upstream-fatal condition
    /// (Err). Either way every downstream session is closed before
    /// returning, so the supervisor only has to report the outcome.
    pub(crate) async fn run(mut self) -> Result<(), RelayError> {
        let outcome = loop {
            let Some(event) = self.events.recv().await else {
                break Err(RelayError::Internal("event channel closed".to_string()));
            };

            let step = match event {
                Event::Upstream(ev) => self.on_upstream(ev).await,
                Event::Accepted(stream, addr) => {
                    self.on_accepted(stream, addr);
                    Ok(())
                }
                Event::Downstream(id, ev) => self.on_downstream(id, ev).await,
                Event::Tick => self.on_tick(),
                Event::Report => {
                    self.report();
                    Ok(())
                }
                Event::Shutdown => {
                    info!("shutdown requested");
                    break Ok(());
                }
            };

            if let Err(fatal) = step {
                break Err(RelayError::Upstream(fatal));
            }
        };

        self.shutdown_all();
        outcome
    }

    fn shutdown_all(&mut self) {
        for id in self.registry.ids() {
            self.close_peer(id, "relay shutting down");
        }
        self.upstream.close();
    }

    // -- Upstream ----------------------------------------------------------

    async fn on_upstream(&mut self, event: LinkEvent) -> Result<(), UpstreamFatal> {
        match event {
            LinkEvent::Frame(frame) => match frame.proto {
                Proto::Control => self.on_upstream_control(&frame).await,
                Proto::Sccp | Proto::Other(_) => {
                    if self.upstream.state != UpstreamState::Ready {
                        return Err(UpstreamFatal::HandshakeFailed(
                            "payload frame before handshake completion",
                        ));
                    }
                    self.route_from_upstream(frame);
                    Ok(())
                }
            },
            LinkEvent::Closed(err) => {
                match err {
                    Some(err) => warn!(error = %err, "MSC connection failed"),
                    None => warn!("MSC closed the connection"),
                }
                Err(UpstreamFatal::ConnectionLost)
            }
        }
    }

    async fn on_upstream_control(&mut self, frame: &Frame) -> Result<(), UpstreamFatal> {
        let msg = match ControlMessage::decode(&frame.payload) {
            Ok(msg) => msg,
            Err(err) => {
                warn!(error = %err, "malformed control message from MSC");
                return Err(UpstreamFatal::ConnectionLost);
            }
        };

        if self.upstream.state == UpstreamState::AwaitingHandshake {
            return match msg {
                ControlMessage::IdAck => {
                    self.upstream.handshake_acked();
                    Ok(())
                }
                _ => Err(UpstreamFatal::HandshakeFailed(
                    "expected identity ack from MSC",
                )),
            };
        }

        match msg {
            ControlMessage::Ping => {
                let pong = ControlMessage::Pong.to_frame().encode();
                self.upstream
                    .tx
                    .send(pong)
                    .await
                    .map_err(|_| UpstreamFatal::ConnectionLost)?;
            }
            ControlMessage::Pong => self.upstream.note_pong(),
            ControlMessage::IdRequest { .. } | ControlMessage::IdAck => {
                debug!(?msg, "ignoring unexpected control message from MSC");
            }
        }
        Ok(())
    }

    /// Classify an MSC frame, find the owning peer, forward. A missing
    /// owner is an expected teardown race: warn and drop, never fail.
    fn route_from_upstream(&mut self, frame: Frame) {
        let frame = match filter::apply(Direction::FromUpstream, frame) {
            FilterAction::Forward(frame) => frame,
            FilterAction::Drop => {
                debug!("filter dropped frame from MSC");
                return;
            }
        };

        let (context, releases) = match sccp::classify_upstream(&frame.payload) {
            FromUpstream::Addressed { context, releases } => (context, releases),
            FromUpstream::Unroutable => {
                warn!("unroutable frame from MSC dropped");
                return;
            }
        };

        let Some(peer_id) = self.router.lookup(context) else {
            warn!(context, "no owner for context, dropping MSC frame");
            return;
        };

        self.forward_to_peer(peer_id, &frame);
        if releases {
            self.router.release(context);
        }
    }

    /// Enqueue a frame on a peer's bounded outbound queue. Overflow means
    /// the peer is too slow to live: close it, leave everyone else alone.
    fn forward_to_peer(&mut self, id: PeerId, frame: &Frame) {
        let Some(peer) = self.registry.get_mut(id) else {
            debug!(%id, "owner vanished before delivery");
            return;
        };

        match peer.tx.try_send(frame.encode()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(%id, "outbound queue overflow");
                self.close_peer(id, "outbound queue overflow");
            }
            Err(TrySendError::Closed(_)) => {
                self.close_peer(id, "writer gone");
            }
        }
    }

    // -- Downstream --------------------------------------------------------

    fn on_accepted(&mut self, stream: TcpStream, addr: SocketAddr) {
        if self.registry.at_capacity() {
            warn!(%addr, max = self.cfg.max_peers, "peer limit reached, refusing connection");
            drop(stream);
            return;
        }

        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::channel(self.cfg.outbound_queue_depth);
        let id = self.registry.insert(Peer::new(addr, tx));

        let writer = spawn_writer(write_half, rx, self.events_tx.clone(), move |ev| {
            Event::Downstream(id, ev)
        });
        let reader = spawn_reader(
            read_half,
            self.cfg.max_frame_len,
            self.events_tx.clone(),
            move |ev| Event::Downstream(id, ev),
        );
        if let Some(peer) = self.registry.get_mut(id) {
            peer.reader = Some(reader);
            peer.writer = Some(writer);
        }
        info!(%id, %addr, "BSC connected, awaiting handshake");
    }

    async fn on_downstream(&mut self, id: PeerId, event: LinkEvent) -> Result<(), UpstreamFatal> {
        if !self.registry.contains(id) {
            // Late event from a session already torn down
            debug!(%id, "event for unknown peer ignored");
            return Ok(());
        }

        match event {
            LinkEvent::Frame(frame) => match frame.proto {
                Proto::Control => {
                    self.on_downstream_control(id, &frame);
                    Ok(())
                }
                Proto::Sccp | Proto::Other(_) => self.forward_to_upstream(id, frame).await,
            },
            LinkEvent::Closed(err) => {
                match err {
                    Some(err) => warn!(%id, error = %err, "BSC connection failed"),
                    None => info!(%id, "BSC disconnected"),
                }
                self.close_peer(id, "connection closed");
                Ok(())
            }
        }
    }

    fn on_downstream_control(&mut self, id: PeerId, frame: &Frame) {
        let msg = match ControlMessage::decode(&frame.payload) {
            Ok(msg) => msg,
            Err(err) => {
                warn!(%id, error = %err, "malformed control message");
                self.close_peer(id, "malformed control message");
                return;
            }
        };

        let Some(peer) = self.registry.get_mut(id) else {
            return;
        };

        match msg {
            ControlMessage::IdRequest { identity } => {
                if peer.state == SessionState::AwaitingHandshake {
                    info!(%id, %identity, "BSC identified, session ready");
                    peer.identity = Some(identity);
                    peer.state = SessionState::Ready;
                    peer.unacked = 0;
                    let ack = ControlMessage::IdAck.to_frame();
                    self.forward_to_peer(id, &ack);
                } else {
                    debug!(%id, "ignoring repeated identity announcement");
                }
            }
            ControlMessage::Ping => {
                let pong = ControlMessage::Pong.to_frame();
                self.forward_to_peer(id, &pong);
            }
            ControlMessage::Pong => peer.unacked = 0,
            ControlMessage::IdAck => {
                debug!(%id, "ignoring unexpected control message");
            }
        }
    }

    /// Tag a peer's payload frame with its identity, note any routing
    /// effect, and multiplex it onto the MSC link. The `.await` on the
    /// upstream queue is the global backpressure point.
    async fn forward_to_upstream(&mut self, id: PeerId, frame: Frame) -> Result<(), UpstreamFatal> {
        let state = self
            .registry
            .get_mut(id)
            .map(|peer| peer.state)
            .unwrap_or(SessionState::Closed);
        if state != SessionState::Ready {
            warn!(%id, "payload frame before handshake completion dropped");
            return Ok(());
        }

        let frame = match filter::apply(Direction::FromDownstream, frame) {
            FilterAction::Forward(frame) => frame,
            FilterAction::Drop => {
                debug!(%id, "filter dropped frame from BSC");
                return Ok(());
            }
        };

        let mut released = None;
        match sccp::classify_downstream(&frame.payload) {
            FromDownstream::Opens(context) => {
                if !self.router.claim(context, id) {
                    return Ok(());
                }
            }
            FromDownstream::Releases(context) => {
                // A peer may only retire a context it established itself
                if self.router.lookup(context) == Some(id) {
                    released = Some(context);
                } else {
                    warn!(%id, context, "release names a context the peer does not own");
                }
            }
            FromDownstream::Transit => {}
        }

        self.upstream
            .tx
            .send(frame.encode())
            .await
            .map_err(|_| UpstreamFatal::ConnectionLost)?;

        if let Some(context) = released {
            self.router.release(context);
        }
        Ok(())
    }

    fn close_peer(&mut self, id: PeerId, reason: &str) {
        if let Some(mut peer) = self.registry.remove(id) {
            peer.close();
            let purged = self.router.purge_peer(id);
            info!(%id, addr = %peer.addr, reason, purged, "BSC session closed");
        }
    }

    // -- Liveness ----------------------------------------------------------

    /// One keepalive interval elapsed: probe every ready session, expire
    /// the ones whose acknowledgment budget ran out. Only the upstream
    /// expiry is fatal.
    fn on_tick(&mut self) -> Result<(), UpstreamFatal> {
        let send_upstream_ping = self.upstream.bump_tick(self.cfg.max_missed_keepalives)?;
        if send_upstream_ping {
            let ping = ControlMessage::Ping.to_frame().encode();
            match self.upstream.tx.try_send(ping) {
                Ok(()) => {}
                // Full queue means global backpressure is already in
                // force; the probe can wait for the next interval
                Err(TrySendError::Full(_)) => debug!("upstream queue full, skipping probe"),
                Err(TrySendError::Closed(_)) => return Err(UpstreamFatal::ConnectionLost),
            }
        }

        let ping = ControlMessage::Ping.to_frame();
        let mut expired = Vec::new();
        let mut probe = Vec::new();
        for (id, peer) in self.registry.iter_mut() {
            peer.unacked += 1;
            if peer.unacked > self.cfg.max_missed_keepalives {
                expired.push(id);
            } else if peer.state == SessionState::Ready {
                probe.push(id);
            }
        }

        for id in expired {
            warn!(%id, "keepalive expired");
            self.close_peer(id, "keepalive expired");
        }
        for id in probe {
            self.forward_to_peer(id, &ping);
        }
        Ok(())
    }

    fn report(&self) {
        info!(
            peers = self.registry.len(),
            routes = self.router.len(),
            upstream = ?self.upstream.state,
            "resource report"
        );
    }
}
