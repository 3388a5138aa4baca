//! End-to-end transport tests over localhost TCP.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::time::timeout;

use streamnet::engine::EngineHooks;
use streamnet::error::ErrorKind;
use streamnet::packet::{
    PacketClient, PacketHooks, PacketServer, PacketServerHooks, PacketLink,
};
use streamnet::server::ConnectionId;
use streamnet::{Client, Connection, NetContext};

const WAIT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(200);

/// `RUST_LOG=streamnet=trace cargo test` shows the transport internals.
fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

async fn assert_quiet<T: std::fmt::Debug>(rx: &mut mpsc::UnboundedReceiver<T>) {
    if let Ok(ev) = timeout(QUIET, rx.recv()).await {
        panic!("unexpected event: {ev:?}");
    }
}

#[derive(Debug, PartialEq)]
enum SrvEv {
    Started,
    Aborted,
    PeerConnected(ConnectionId),
    PeerDisconnected(ConnectionId),
}

#[derive(Debug, PartialEq)]
enum PeerEv {
    Handshake(Vec<u8>),
    Packet(Vec<u8>),
    Error(ErrorKind),
}

#[derive(Debug, PartialEq)]
enum ClientEv {
    Connect,
    Disconnect,
    Handshake(Vec<u8>),
    Packet(Vec<u8>),
    Error(ErrorKind),
}

#[derive(Debug)]
enum RawEv {
    Resolve,
    Connect,
    Disconnect,
    Receive(Vec<u8>),
    Error(ErrorKind),
}

/// Per-peer hooks that record everything and echo data packets back.
struct PeerRecorder {
    tx: mpsc::UnboundedSender<(ConnectionId, PeerEv)>,
    id: ConnectionId,
    server: Arc<OnceLock<PacketServer>>,
}

impl PacketHooks for PeerRecorder {
    fn on_handshake(&self, payload: bytes::Bytes) {
        let _ = self.tx.send((self.id, PeerEv::Handshake(payload.to_vec())));
    }

    fn on_packet(&self, payload: bytes::Bytes) {
        let _ = self.tx.send((self.id, PeerEv::Packet(payload.to_vec())));
        if let Some(server) = self.server.get() {
            server.send_packet(self.id, &payload);
        }
    }

    fn on_error(&self, kind: ErrorKind, _err: &std::io::Error) {
        let _ = self.tx.send((self.id, PeerEv::Error(kind)));
    }
}

struct ServerRecorder {
    tx: mpsc::UnboundedSender<SrvEv>,
    peer_tx: mpsc::UnboundedSender<(ConnectionId, PeerEv)>,
    server: Arc<OnceLock<PacketServer>>,
}

impl PacketServerHooks for ServerRecorder {
    fn on_start(&self) {
        let _ = self.tx.send(SrvEv::Started);
    }

    fn on_abort(&self) {
        let _ = self.tx.send(SrvEv::Aborted);
    }

    fn peer_hooks(&self, id: ConnectionId, _peer: std::net::SocketAddr) -> Arc<dyn PacketHooks> {
        Arc::new(PeerRecorder {
            tx: self.peer_tx.clone(),
            id,
            server: Arc::clone(&self.server),
        })
    }

    fn on_peer_connected(&self, conn: &Arc<Connection>) {
        let _ = self.tx.send(SrvEv::PeerConnected(conn.id()));
    }

    fn on_peer_disconnected(&self, conn: &Arc<Connection>) {
        let _ = self.tx.send(SrvEv::PeerDisconnected(conn.id()));
    }
}

struct ClientRecorder {
    tx: mpsc::UnboundedSender<ClientEv>,
}

impl PacketHooks for ClientRecorder {
    fn on_connect(&self) {
        let _ = self.tx.send(ClientEv::Connect);
    }

    fn on_disconnect(&self) {
        let _ = self.tx.send(ClientEv::Disconnect);
    }

    fn on_handshake(&self, payload: bytes::Bytes) {
        let _ = self.tx.send(ClientEv::Handshake(payload.to_vec()));
    }

    fn on_packet(&self, payload: bytes::Bytes) {
        let _ = self.tx.send(ClientEv::Packet(payload.to_vec()));
    }

    fn on_error(&self, kind: ErrorKind, _err: &std::io::Error) {
        let _ = self.tx.send(ClientEv::Error(kind));
    }
}

struct RawRecorder {
    tx: mpsc::UnboundedSender<RawEv>,
}

impl EngineHooks for RawRecorder {
    fn on_resolve(&self) {
        let _ = self.tx.send(RawEv::Resolve);
    }

    fn on_connect(&self) {
        let _ = self.tx.send(RawEv::Connect);
    }

    fn on_disconnect(&self) {
        let _ = self.tx.send(RawEv::Disconnect);
    }

    fn on_receive(&self, data: &[u8]) {
        let _ = self.tx.send(RawEv::Receive(data.to_vec()));
    }

    fn on_error(&self, kind: ErrorKind, _err: &std::io::Error) {
        let _ = self.tx.send(RawEv::Error(kind));
    }
}

struct TestServer {
    server: Arc<OnceLock<PacketServer>>,
    events: mpsc::UnboundedReceiver<SrvEv>,
    peers: mpsc::UnboundedReceiver<(ConnectionId, PeerEv)>,
}

impl TestServer {
    fn handle(&self) -> &PacketServer {
        self.server.get().expect("server not started")
    }
}

/// Start a packet server on an ephemeral port and wait until it accepts.
async fn start_server(ctx: &NetContext) -> TestServer {
    let (tx, mut events) = mpsc::unbounded_channel();
    let (peer_tx, peers) = mpsc::unbounded_channel();
    let slot = Arc::new(OnceLock::new());
    let server = PacketServer::new(
        ctx.clone(),
        Arc::new(ServerRecorder {
            tx,
            peer_tx,
            server: Arc::clone(&slot),
        }),
    );
    server.start(0);
    let _ = slot.set(server);
    assert_eq!(recv(&mut events).await, SrvEv::Started);
    TestServer {
        server: slot,
        events,
        peers,
    }
}

/// Connect a packet client to the given port and wait until it is online.
async fn connect_client(
    ctx: &NetContext,
    port: u16,
) -> (PacketClient, mpsc::UnboundedReceiver<ClientEv>) {
    let (tx, mut events) = mpsc::unbounded_channel();
    let client = PacketClient::new(ctx.clone(), Arc::new(ClientRecorder { tx }));
    client.add_endpoint(([127, 0, 0, 1], port).into());
    client.connect();
    assert_eq!(recv(&mut events).await, ClientEv::Connect);
    (client, events)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_packet_echo_round_trip() {
    init_tracing();
    let ctx = NetContext::from_handle(Handle::current());
    let mut srv = start_server(&ctx).await;
    let (client, mut client_rx) = connect_client(&ctx, srv.handle().port()).await;

    let id = match recv(&mut srv.events).await {
        SrvEv::PeerConnected(id) => id,
        other => panic!("expected peer connect, got {other:?}"),
    };
    assert_eq!(srv.handle().connection_count(), 1);

    // Server opens with its handshake, client answers with its own, then
    // sends data that the peer hooks echo back.
    srv.handle().send_handshake(id, b"welcome");
    assert_eq!(
        recv(&mut client_rx).await,
        ClientEv::Handshake(b"welcome".to_vec())
    );

    client.send_handshake(b"hi there");
    assert_eq!(
        recv(&mut srv.peers).await,
        (id, PeerEv::Handshake(b"hi there".to_vec()))
    );

    client.send_packet(b"ping");
    assert_eq!(
        recv(&mut srv.peers).await,
        (id, PeerEv::Packet(b"ping".to_vec()))
    );
    assert_eq!(recv(&mut client_rx).await, ClientEv::Packet(b"ping".to_vec()));

    client.disconnect();
    assert_eq!(recv(&mut client_rx).await, ClientEv::Disconnect);
    assert_eq!(recv(&mut srv.events).await, SrvEv::PeerDisconnected(id));
    assert_eq!(srv.handle().connection_count(), 0);

    srv.handle().close();
    assert_eq!(recv(&mut srv.events).await, SrvEv::Aborted);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_handshake_sent_exactly_once_under_racing_senders() {
    init_tracing();
    let ctx = NetContext::from_handle(Handle::current());
    let mut srv = start_server(&ctx).await;
    let (client, _client_rx) = connect_client(&ctx, srv.handle().port()).await;

    let id = match recv(&mut srv.events).await {
        SrvEv::PeerConnected(id) => id,
        other => panic!("expected peer connect, got {other:?}"),
    };

    let link: Arc<PacketLink> = Arc::clone(client.link());
    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let link = Arc::clone(&link);
            tokio::spawn(async move {
                link.send_handshake(b"once");
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }
    client.send_packet(b"after");

    assert_eq!(
        recv(&mut srv.peers).await,
        (id, PeerEv::Handshake(b"once".to_vec()))
    );
    assert_eq!(
        recv(&mut srv.peers).await,
        (id, PeerEv::Packet(b"after".to_vec()))
    );
    assert_quiet(&mut srv.peers).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_first_data_packet_consumes_handshake_slot() {
    init_tracing();
    let ctx = NetContext::from_handle(Handle::current());
    let mut srv = start_server(&ctx).await;
    let (client, _client_rx) = connect_client(&ctx, srv.handle().port()).await;

    let id = match recv(&mut srv.events).await {
        SrvEv::PeerConnected(id) => id,
        other => panic!("expected peer connect, got {other:?}"),
    };

    // Data first: the receiver still treats the first frame as the
    // handshake, and a later send_handshake is a no-op.
    client.send_packet(b"data-first");
    client.send_handshake(b"too late");

    assert_eq!(
        recv(&mut srv.peers).await,
        (id, PeerEv::Handshake(b"data-first".to_vec()))
    );
    assert_quiet(&mut srv.peers).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_resolve_then_connect() {
    init_tracing();
    let ctx = NetContext::from_handle(Handle::current());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let (tx, mut events) = mpsc::unbounded_channel();
    let client = Client::new(ctx, Arc::new(RawRecorder { tx }));

    client.resolve("localhost".to_string(), port);
    assert!(matches!(recv(&mut events).await, RawEv::Resolve));
    assert!(!client.endpoints().is_empty());

    // Candidates are tried in order; whichever address family resolves
    // first, the 127.0.0.1 listener is eventually reached.
    client.connect();
    assert!(matches!(recv(&mut events).await, RawEv::Connect));
    assert!(client.is_online());

    // A second connect while online is rejected without side effects.
    client.connect();
    assert!(matches!(
        recv(&mut events).await,
        RawEv::Error(ErrorKind::AlreadyConnected)
    ));
    assert!(client.is_online());

    client.disconnect();
    assert!(matches!(recv(&mut events).await, RawEv::Disconnect));
    assert!(!client.is_online());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_connect_failure_reports_once() {
    init_tracing();
    let ctx = NetContext::from_handle(Handle::current());

    // Grab a port that nothing is listening on.
    let dead_port = {
        let reserved = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        reserved.local_addr().unwrap().port()
    };

    let (tx, mut events) = mpsc::unbounded_channel();
    let client = Client::new(ctx, Arc::new(RawRecorder { tx }));
    client.add_endpoint(([127, 0, 0, 1], dead_port).into());
    client.add_endpoint(([127, 0, 0, 1], dead_port).into());
    client.connect();

    // Both candidates fail but exactly one error surfaces.
    assert!(matches!(
        recv(&mut events).await,
        RawEv::Error(ErrorKind::ConnectFailed)
    ));
    assert_quiet(&mut events).await;
    assert!(!client.is_online());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_server_close_disconnects_all_peers() {
    init_tracing();
    let ctx = NetContext::from_handle(Handle::current());
    let mut srv = start_server(&ctx).await;
    let port = srv.handle().port();

    let (_client_a, mut rx_a) = connect_client(&ctx, port).await;
    let (_client_b, mut rx_b) = connect_client(&ctx, port).await;
    for _ in 0..2 {
        assert!(matches!(
            recv(&mut srv.events).await,
            SrvEv::PeerConnected(_)
        ));
    }
    assert_eq!(srv.handle().connection_count(), 2);

    srv.handle().close();

    // Each peer is torn down, then the server reports the abort.
    for _ in 0..2 {
        assert!(matches!(
            recv(&mut srv.events).await,
            SrvEv::PeerDisconnected(_)
        ));
    }
    assert_eq!(recv(&mut srv.events).await, SrvEv::Aborted);
    assert_eq!(srv.handle().connection_count(), 0);
    assert!(!srv.handle().is_online());

    // The peers may see a ConnectionClosed error before the disconnect
    // depending on who observes the close first.
    wait_for_disconnect(&mut rx_a).await;
    wait_for_disconnect(&mut rx_b).await;
}

async fn wait_for_disconnect(rx: &mut mpsc::UnboundedReceiver<ClientEv>) {
    loop {
        match recv(rx).await {
            ClientEv::Disconnect => break,
            ClientEv::Error(_) | ClientEv::Handshake(_) | ClientEv::Packet(_) => continue,
            other => panic!("unexpected event while waiting for disconnect: {other:?}"),
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_protocol_violation_drops_peer() {
    init_tracing();
    let ctx = NetContext::from_handle(Handle::current());
    let mut srv = start_server(&ctx).await;

    // Raw byte client: no framing, free to send garbage.
    let (tx, mut raw_rx) = mpsc::unbounded_channel();
    let client = Client::new(ctx, Arc::new(RawRecorder { tx }));
    client.add_endpoint(([127, 0, 0, 1], srv.handle().port()).into());
    client.connect();
    assert!(matches!(recv(&mut raw_rx).await, RawEv::Connect));
    let id = match recv(&mut srv.events).await {
        SrvEv::PeerConnected(id) => id,
        other => panic!("expected peer connect, got {other:?}"),
    };

    // 17+ bytes with a bad head tag: rejected as soon as buffered.
    client.send(&b"XX_GARBAGE_STREAM_NOT_A_FRAME"[..]);

    assert_eq!(
        recv(&mut srv.peers).await,
        (id, PeerEv::Error(ErrorKind::ProtocolViolation))
    );
    assert_eq!(recv(&mut srv.events).await, SrvEv::PeerDisconnected(id));
    assert_eq!(srv.handle().connection_count(), 0);

    // The client sees the drop from its end too.
    loop {
        match recv(&mut raw_rx).await {
            RawEv::Disconnect => break,
            RawEv::Error(_) | RawEv::Receive(_) => continue,
            other => panic!("unexpected event: {other:?}"),
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_large_payload_crosses_read_chunks() {
    init_tracing();
    let ctx = NetContext::from_handle(Handle::current());
    let mut srv = start_server(&ctx).await;
    let (client, mut client_rx) = connect_client(&ctx, srv.handle().port()).await;

    let id = match recv(&mut srv.events).await {
        SrvEv::PeerConnected(id) => id,
        other => panic!("expected peer connect, got {other:?}"),
    };
    srv.handle().send_handshake(id, b"welcome");
    assert_eq!(
        recv(&mut client_rx).await,
        ClientEv::Handshake(b"welcome".to_vec())
    );
    client.send_handshake(b"");
    assert_eq!(recv(&mut srv.peers).await, (id, PeerEv::Handshake(vec![])));

    // Well past the read chunk size, so reassembly spans many reads.
    let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    client.send_packet(&payload);

    assert_eq!(
        recv(&mut srv.peers).await,
        (id, PeerEv::Packet(payload.clone()))
    );
    // Echoed straight back by the peer hooks.
    assert_eq!(recv(&mut client_rx).await, ClientEv::Packet(payload));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_double_disconnect_fires_once() {
    init_tracing();
    let ctx = NetContext::from_handle(Handle::current());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let (tx, mut events) = mpsc::unbounded_channel();
    let client = Client::new(ctx, Arc::new(RawRecorder { tx }));
    client.add_endpoint(([127, 0, 0, 1], port).into());
    client.connect();
    assert!(matches!(recv(&mut events).await, RawEv::Connect));

    // Two racing teardowns collapse into one: a single disconnect hook,
    // then silence.
    client.disconnect();
    client.disconnect();

    assert!(matches!(recv(&mut events).await, RawEv::Disconnect));
    assert_quiet(&mut events).await;
    assert!(!client.is_online());
}

/// Hooks that count ticks and ignore everything else.
struct TickCounter {
    ticks: Arc<AtomicUsize>,
}

impl EngineHooks for TickCounter {
    fn on_tick(&self) {
        self.ticks.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_tick_runs_from_construction_to_destruction() {
    init_tracing();
    let ctx = NetContext::from_handle(Handle::current());
    let ticks = Arc::new(AtomicUsize::new(0));
    let client = Client::new(
        ctx,
        Arc::new(TickCounter {
            ticks: Arc::clone(&ticks),
        }),
    );

    // Never connected; the tick fires anyway.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(ticks.load(Ordering::SeqCst) > 0);

    // Dropping the client destroys its engine, which stops the tick; the
    // destructor does not return while a hook is still running.
    drop(client);
    let after_drop = ticks.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(ticks.load(Ordering::SeqCst), after_drop);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_senders_share_one_write_loop() {
    init_tracing();
    let ctx = NetContext::from_handle(Handle::current());
    let mut srv = start_server(&ctx).await;
    let (client, _client_rx) = connect_client(&ctx, srv.handle().port()).await;

    let id = match recv(&mut srv.events).await {
        SrvEv::PeerConnected(id) => id,
        other => panic!("expected peer connect, got {other:?}"),
    };
    client.send_handshake(b"hs");
    assert_eq!(
        recv(&mut srv.peers).await,
        (id, PeerEv::Handshake(b"hs".to_vec()))
    );

    // Sends from many tasks all funnel through the single write loop; an
    // interleaved or duplicated write would corrupt the framing and show
    // up as a violation or a mangled payload on the peer.
    const TASKS: usize = 8;
    const PER_TASK: usize = 20;
    let link: Arc<PacketLink> = Arc::clone(client.link());
    let handles: Vec<_> = (0..TASKS)
        .map(|t| {
            let link = Arc::clone(&link);
            tokio::spawn(async move {
                for i in 0..PER_TASK {
                    link.send_packet(format!("task{t}-msg{i}").as_bytes());
                }
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }

    let mut got = Vec::with_capacity(TASKS * PER_TASK);
    for _ in 0..TASKS * PER_TASK {
        match recv(&mut srv.peers).await {
            (got_id, PeerEv::Packet(payload)) => {
                assert_eq!(got_id, id);
                got.push(payload);
            }
            other => panic!("expected intact packet, got {other:?}"),
        }
    }
    // Order across tasks is arbitrary; within a task it is FIFO, and
    // every payload arrives exactly once.
    got.sort();
    let mut expected: Vec<Vec<u8>> = (0..TASKS)
        .flat_map(|t| (0..PER_TASK).map(move |i| format!("task{t}-msg{i}").into_bytes()))
        .collect();
    expected.sort();
    assert_eq!(got, expected);
    assert_quiet(&mut srv.peers).await;
}
