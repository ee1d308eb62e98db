//! End-to-end relay scenarios over real sockets
//!
//! A fake MSC listens on localhost, the relay connects out to it, and
//! fake BSC peers connect into the relay. Everything speaks the real wire
//! format through the public codec API.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use bscmux_core::ipa::control::ControlMessage;
use bscmux_core::ipa::{Frame, FrameCodec, Proto};
use bscmux_core::{sccp, Relay, RelayConfig, RelayError, Supervisor, UpstreamFatal};

const RECV_TIMEOUT: Duration = Duration::from_secs(2);
const QUIET_TIMEOUT: Duration = Duration::from_millis(300);

/// One framed endpoint in a test: a socket plus its decode accumulator.
struct Wire {
    stream: TcpStream,
    codec: FrameCodec,
}

impl Wire {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            codec: FrameCodec::new(4096),
        }
    }

    async fn send(&mut self, frame: &Frame) {
        self.stream
            .write_all(&frame.encode())
            .await
            .expect("test send failed");
    }

    /// Next frame, or `None` once the connection is gone.
    async fn recv(&mut self) -> Option<Frame> {
        loop {
            match self.codec.next_frame() {
                Ok(Some(frame)) => return Some(frame),
                Ok(None) => {}
                Err(_) => return None,
            }
            match self.stream.read_buf(self.codec.read_buf()).await {
                Ok(0) | Err(_) => return None,
                Ok(_) => {}
            }
        }
    }

    async fn expect_frame(&mut self) -> Frame {
        timeout(RECV_TIMEOUT, self.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection closed while expecting a frame")
    }

    async fn expect_quiet(&mut self) {
        if let Ok(frame) = timeout(QUIET_TIMEOUT, self.recv()).await {
            panic!("expected no traffic, got {frame:?}");
        }
    }

    /// Drain whatever is still in flight and require the connection to
    /// close underneath us.
    async fn expect_eof(&mut self) {
        timeout(RECV_TIMEOUT, async {
            while self.recv().await.is_some() {}
        })
        .await
        .expect("timed out waiting for the connection to close");
    }
}

fn test_config() -> RelayConfig {
    RelayConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        ..RelayConfig::default()
    }
}

/// Start the relay against a fake MSC and complete the upstream
/// handshake. Returns the running relay and the MSC side of its link.
async fn start_relay(mut cfg: RelayConfig) -> (Relay, Wire) {
    let msc_listener = TcpListener::bind("127.0.0.1:0").await.expect("msc bind");
    cfg.msc_addr = msc_listener.local_addr().expect("msc addr").to_string();

    let (relay, accepted) = tokio::join!(Supervisor::start(cfg), msc_listener.accept());
    let relay = relay.expect("relay startup");
    let (stream, _) = accepted.expect("msc accept");

    let mut msc = Wire::new(stream);
    let hello = msc.expect_frame().await;
    assert_eq!(hello.proto, Proto::Control);
    assert!(matches!(
        ControlMessage::decode(&hello.payload),
        Ok(ControlMessage::IdRequest { .. })
    ));
    msc.send(&ControlMessage::IdAck.to_frame()).await;

    (relay, msc)
}

/// Connect a fake BSC to the relay and complete its handshake.
async fn connect_peer(relay: &Relay, identity: &str) -> Wire {
    let stream = TcpStream::connect(relay.local_addr).await.expect("peer connect");
    let mut peer = Wire::new(stream);
    peer.send(
        &ControlMessage::IdRequest {
            identity: identity.to_string(),
        }
        .to_frame(),
    )
    .await;

    let ack = peer.expect_frame().await;
    assert_eq!(
        ControlMessage::decode(&ack.payload).expect("decodable ack"),
        ControlMessage::IdAck
    );
    peer
}

fn sccp_frame(payload: bytes::Bytes) -> Frame {
    Frame::new(Proto::Sccp, payload)
}

#[tokio::test]
async fn context_routing_isolates_peers() {
    let (relay, mut msc) = start_relay(test_config()).await;

    let mut a = connect_peer(&relay, "bsc-a").await;
    let mut b = connect_peer(&relay, "bsc-b").await;

    a.send(&sccp_frame(sccp::cr(7, b"from-a"))).await;
    b.send(&sccp_frame(sccp::cr(9, b"from-b"))).await;

    // Both CRs reach the MSC over the one multiplexed link; ordering
    // across connections is not guaranteed
    let first = msc.expect_frame().await;
    let second = msc.expect_frame().await;
    let mut seen = vec![first.payload, second.payload];
    seen.sort();
    let mut expected = vec![sccp::cr(7, b"from-a"), sccp::cr(9, b"from-b")];
    expected.sort();
    assert_eq!(seen, expected);

    // An MSC frame referencing context 7 reaches A and never B
    msc.send(&sccp_frame(sccp::dt1(7, b"to-a"))).await;
    let delivered = a.expect_frame().await;
    assert_eq!(delivered.payload, sccp::dt1(7, b"to-a"));
    b.expect_quiet().await;

    relay.shutdown().await;
    relay.wait().await.expect("clean shutdown");
}

#[tokio::test]
async fn closed_peer_contexts_are_dropped_not_misdelivered() {
    let (relay, mut msc) = start_relay(test_config()).await;

    let a = connect_peer(&relay, "bsc-a").await;
    let mut b = connect_peer(&relay, "bsc-b").await;

    {
        let mut a = a;
        a.send(&sccp_frame(sccp::cr(7, b""))).await;
        msc.expect_frame().await;
        // A departs; the relay purges its routing entries
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Late MSC traffic for the dead context vanishes quietly
    msc.send(&sccp_frame(sccp::dt1(7, b"late"))).await;
    b.expect_quiet().await;

    // The relay is still fully alive for the survivor
    b.send(&sccp_frame(sccp::cr(9, b"still-here"))).await;
    assert_eq!(msc.expect_frame().await.payload, sccp::cr(9, b"still-here"));

    relay.shutdown().await;
    relay.wait().await.expect("clean shutdown");
}

#[tokio::test]
async fn silent_peer_expires_by_keepalive() {
    let cfg = RelayConfig {
        keepalive_interval_ms: 50,
        max_missed_keepalives: 2,
        ..test_config()
    };
    let (relay, msc) = start_relay(cfg).await;

    // The MSC keeps its own link alive by answering probes
    tokio::spawn(async move {
        let mut msc = msc;
        while let Some(frame) = msc.recv().await {
            if frame.proto == Proto::Control
                && matches!(
                    ControlMessage::decode(&frame.payload),
                    Ok(ControlMessage::Ping)
                )
            {
                msc.send(&ControlMessage::Pong.to_frame()).await;
            }
        }
    });

    // The peer completes its handshake and then never answers a probe
    let mut peer = connect_peer(&relay, "bsc-mute").await;
    peer.expect_eof().await;

    relay.shutdown().await;
    relay.wait().await.expect("clean shutdown");
}

#[tokio::test]
async fn refused_msc_fails_startup_before_the_listener_binds() {
    // Take a local port the relay would try to listen on; if the relay
    // bound its listener before connecting upstream, this would surface
    // as a listen failure instead of the connect failure we expect
    let occupied = TcpListener::bind("127.0.0.1:0").await.expect("occupy port");
    let listen_addr = occupied.local_addr().expect("addr").to_string();

    // A port with nobody behind it
    let ghost = TcpListener::bind("127.0.0.1:0").await.expect("ghost bind");
    let msc_addr = ghost.local_addr().expect("addr").to_string();
    drop(ghost);

    let cfg = RelayConfig {
        msc_addr,
        listen_addr,
        ..RelayConfig::default()
    };

    let err = Supervisor::start(cfg).await.err().expect("startup must fail");
    assert!(matches!(
        err,
        RelayError::Upstream(UpstreamFatal::ConnectFailed { .. })
    ));
}

#[tokio::test]
async fn peer_limit_refuses_extra_connections() {
    let cfg = RelayConfig {
        max_peers: 1,
        ..test_config()
    };
    let (relay, mut msc) = start_relay(cfg).await;

    let mut a = connect_peer(&relay, "bsc-a").await;

    // The second connection is refused outright; its handshake attempt
    // may already hit a closed socket
    let stream = TcpStream::connect(relay.local_addr).await.expect("connect");
    let mut b = Wire::new(stream);
    let hello = ControlMessage::IdRequest {
        identity: "bsc-b".to_string(),
    }
    .to_frame();
    let _ = b.stream.write_all(&hello.encode()).await;
    b.expect_eof().await;

    // The admitted peer is unaffected
    a.send(&sccp_frame(sccp::cr(7, b""))).await;
    assert_eq!(msc.expect_frame().await.payload, sccp::cr(7, b""));

    relay.shutdown().await;
    relay.wait().await.expect("clean shutdown");
}

#[tokio::test]
async fn oversized_frame_closes_only_its_sender() {
    let (relay, mut msc) = start_relay(test_config()).await;

    let mut a = connect_peer(&relay, "bsc-a").await;
    let mut b = connect_peer(&relay, "bsc-b").await;

    // Declared length far beyond max_frame_len
    a.stream
        .write_all(&[0xFF, 0xFF, 0xFD])
        .await
        .expect("raw write");
    a.expect_eof().await;

    b.send(&sccp_frame(sccp::cr(9, b"fine"))).await;
    assert_eq!(msc.expect_frame().await.payload, sccp::cr(9, b"fine"));

    relay.shutdown().await;
    relay.wait().await.expect("clean shutdown");
}
