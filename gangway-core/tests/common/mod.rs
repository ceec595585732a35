//! Shared test doubles for the upgrader and connection integration tests.
#![allow(dead_code)]

use std::{
    io,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::{AsyncReadExt, AsyncWriteExt};
use gangway_core::{
    BoxedIo, Components, ConnInfo, ConnectionEncrypter, ConnectionEvent, ConnectionGater,
    ConnectionManager, Direction, EventBus, MemoryPeerStore, MemoryRegistrar, Metrics,
    MultiaddrConn, MuxedStream, MuxerInit, PeerId, ProtocolName, SecuredIo, StreamMeta,
    StreamMuxer, StreamMuxerFactory, Upgrader, UpgraderConfig,
    muxing::IncomingStreamHook,
};
use tokio_util::compat::TokioAsyncReadCompatExt;

pub type CallLog = Arc<Mutex<Vec<&'static str>>>;

/// Opt-in log output for debugging test runs: `RUST_LOG=trace cargo test`.
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

/// A deterministic peer id for tests.
pub fn peer_id(seed: u8) -> PeerId {
    let key = ed25519_dalek::SigningKey::from_bytes(&[seed; 32]);
    PeerId::from_public_key(&key.verifying_key())
}

/// An in-memory transport connection and the remote's half of it.
pub fn conn_pair(remote_addr: &str) -> (MultiaddrConn, BoxedIo) {
    let (local, remote) = tokio::io::duplex(4096);
    let conn = MultiaddrConn::new(
        Box::new(local.compat()),
        remote_addr.parse().expect("valid multiaddr"),
    );
    (conn, Box::new(remote.compat()))
}

/// Poll `pred` until it holds, failing the test after two seconds.
pub async fn wait_until(mut pred: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !pred() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

// ---------------------------------------------------------------------------
// collaborators
// ---------------------------------------------------------------------------

pub struct TestManager {
    pub accept: AtomicBool,
    pub released: AtomicUsize,
    log: CallLog,
}

#[async_trait]
impl ConnectionManager for TestManager {
    async fn accept_incoming_connection(&self, _conn: &ConnInfo) -> bool {
        self.log.lock().unwrap().push("accept_incoming_connection");
        self.accept.load(Ordering::SeqCst)
    }

    fn after_upgrade_inbound(&self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct TestGater {
    deny: Mutex<Option<&'static str>>,
    log: CallLog,
}

impl TestGater {
    /// Deny the named checkpoint from now on.
    pub fn deny(&self, method: &'static str) {
        *self.deny.lock().unwrap() = Some(method);
    }

    fn check(&self, method: &'static str) -> bool {
        self.log.lock().unwrap().push(method);
        *self.deny.lock().unwrap() == Some(method)
    }
}

#[async_trait]
impl ConnectionGater for TestGater {
    async fn deny_inbound_connection(&self, _conn: &ConnInfo) -> bool {
        self.check("deny_inbound_connection")
    }

    async fn deny_outbound_connection(&self, _peer: &PeerId, _conn: &ConnInfo) -> bool {
        self.check("deny_outbound_connection")
    }

    async fn deny_inbound_encrypted_connection(&self, _peer: &PeerId, _conn: &ConnInfo) -> bool {
        self.check("deny_inbound_encrypted_connection")
    }

    async fn deny_outbound_encrypted_connection(&self, _peer: &PeerId, _conn: &ConnInfo) -> bool {
        self.check("deny_outbound_encrypted_connection")
    }

    async fn deny_inbound_upgraded_connection(&self, _peer: &PeerId, _conn: &ConnInfo) -> bool {
        self.check("deny_inbound_upgraded_connection")
    }

    async fn deny_outbound_upgraded_connection(&self, _peer: &PeerId, _conn: &ConnInfo) -> bool {
        self.check("deny_outbound_upgraded_connection")
    }
}

#[derive(Default)]
pub struct RecordingBus {
    events: Mutex<Vec<ConnectionEvent>>,
}

impl RecordingBus {
    pub fn kinds(&self) -> Vec<&'static str> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|event| match event {
                ConnectionEvent::Opened(_) => "open",
                ConnectionEvent::Closed(_) => "close",
            })
            .collect()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.kinds().iter().filter(|k| **k == kind).count()
    }
}

impl EventBus for RecordingBus {
    fn dispatch(&self, event: ConnectionEvent) {
        self.events.lock().unwrap().push(event);
    }
}

#[derive(Default)]
pub struct RecordingMetrics {
    pub protocol_streams: AtomicUsize,
}

impl Metrics for RecordingMetrics {
    fn track_protocol_stream(&self, _protocol: &ProtocolName, _connection: &gangway_core::Connection) {
        self.protocol_streams.fetch_add(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// encrypters
// ---------------------------------------------------------------------------

/// Hands the stream through untouched, authenticating a fixed peer.
pub struct PassthroughEncrypter {
    protocol: &'static str,
    peer: PeerId,
}

impl PassthroughEncrypter {
    pub fn new(protocol: &'static str, peer: PeerId) -> Arc<Self> {
        Arc::new(PassthroughEncrypter { protocol, peer })
    }
}

#[async_trait]
impl ConnectionEncrypter for PassthroughEncrypter {
    fn protocol(&self) -> ProtocolName {
        self.protocol.into()
    }

    async fn secure_inbound(&self, io: BoxedIo) -> io::Result<SecuredIo> {
        Ok(SecuredIo {
            io,
            remote_peer: self.peer,
        })
    }

    async fn secure_outbound(
        &self,
        io: BoxedIo,
        remote_peer: Option<PeerId>,
    ) -> io::Result<SecuredIo> {
        if let Some(expected) = remote_peer {
            if expected != self.peer {
                return Err(io::Error::other(
                    "remote peer does not match the expected identity",
                ));
            }
        }
        Ok(SecuredIo {
            io,
            remote_peer: self.peer,
        })
    }
}

pub struct FailingEncrypter;

#[async_trait]
impl ConnectionEncrypter for FailingEncrypter {
    fn protocol(&self) -> ProtocolName {
        "/noise".into()
    }

    async fn secure_inbound(&self, _io: BoxedIo) -> io::Result<SecuredIo> {
        Err(io::Error::other("handshake rejected"))
    }

    async fn secure_outbound(
        &self,
        _io: BoxedIo,
        _remote_peer: Option<PeerId>,
    ) -> io::Result<SecuredIo> {
        Err(io::Error::other("handshake rejected"))
    }
}

// ---------------------------------------------------------------------------
// mock muxer
// ---------------------------------------------------------------------------

pub struct MockMuxerFactory {
    protocol: &'static str,
    created: Mutex<Vec<Arc<MockMuxer>>>,
}

impl MockMuxerFactory {
    pub fn new(protocol: &'static str) -> Arc<Self> {
        Arc::new(MockMuxerFactory {
            protocol,
            created: Mutex::new(Vec::new()),
        })
    }

    /// The muxer created for the most recent connection.
    pub fn muxer(&self) -> Arc<MockMuxer> {
        self.created
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no muxer created yet")
    }
}

impl StreamMuxerFactory for MockMuxerFactory {
    fn protocol(&self) -> ProtocolName {
        self.protocol.into()
    }

    fn create_stream_muxer(&self, init: MuxerInit) -> (Box<dyn StreamMuxer>, BoxedIo) {
        let (socket, pipe) = tokio::io::duplex(4096);
        let socket: BoxedIo = Box::new(socket.compat());
        let (mut socket_read, socket_write) = socket.split();
        let muxer = Arc::new(MockMuxer {
            direction: init.direction,
            on_incoming: init.on_incoming_stream,
            sink: Mutex::new(Some(socket_write)),
            streams: Mutex::new(Vec::new()),
            outbound_remotes: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });
        self.created.lock().unwrap().push(muxer.clone());

        // a real muxer notices its socket going away; emulate that
        let watcher = muxer.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 256];
            loop {
                match socket_read.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            watcher.shutdown();
        });

        (Box::new(SharedMuxer(muxer)), Box::new(pipe.compat()))
    }
}

pub struct MockMuxer {
    pub direction: Direction,
    on_incoming: IncomingStreamHook,
    sink: Mutex<Option<futures::io::WriteHalf<BoxedIo>>>,
    streams: Mutex<Vec<Arc<StreamMeta>>>,
    outbound_remotes: Mutex<Vec<BoxedIo>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl MockMuxer {
    /// Simulate the remote opening a substream; returns the remote's half.
    pub fn inject_inbound(&self) -> BoxedIo {
        let (local, remote) = tokio::io::duplex(4096);
        let meta = StreamMeta::new(
            self.next_id.fetch_add(1, Ordering::SeqCst),
            Direction::Inbound,
        );
        self.streams.lock().unwrap().push(meta.clone());
        (self.on_incoming)(MuxedStream::new(meta, Box::new(local.compat())));
        Box::new(remote.compat())
    }

    /// The remote half of the most recently opened outbound stream.
    pub fn last_outbound_remote(&self) -> BoxedIo {
        self.outbound_remotes
            .lock()
            .unwrap()
            .pop()
            .expect("no outbound stream opened")
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for meta in self.streams.lock().unwrap().iter() {
            meta.record_close();
        }
        // dropping a split write half does not propagate EOF; close it
        if let Some(mut sink) = self.sink.lock().unwrap().take() {
            tokio::spawn(async move {
                let _ = sink.close().await;
            });
        }
    }
}

struct SharedMuxer(Arc<MockMuxer>);

#[async_trait]
impl StreamMuxer for SharedMuxer {
    async fn open_stream(&self) -> io::Result<MuxedStream> {
        if self.0.closed.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "muxer closed"));
        }
        let (local, remote) = tokio::io::duplex(4096);
        let meta = StreamMeta::new(
            self.0.next_id.fetch_add(1, Ordering::SeqCst),
            Direction::Outbound,
        );
        self.0.streams.lock().unwrap().push(meta.clone());
        self.0
            .outbound_remotes
            .lock()
            .unwrap()
            .push(Box::new(remote.compat()));
        Ok(MuxedStream::new(meta, Box::new(local.compat())))
    }

    fn streams(&self) -> Vec<Arc<StreamMeta>> {
        let mut streams = self.0.streams.lock().unwrap();
        streams.retain(|meta| meta.is_live());
        streams.clone()
    }

    async fn close(&self) -> io::Result<()> {
        self.0.shutdown();
        Ok(())
    }

    fn abort(&self) {
        self.0.shutdown();
    }
}

// ---------------------------------------------------------------------------
// harness
// ---------------------------------------------------------------------------

/// Everything an upgrade test needs, wired to recording doubles.
pub struct TestCtx {
    pub manager: Arc<TestManager>,
    pub gater: Arc<TestGater>,
    pub bus: Arc<RecordingBus>,
    pub registrar: Arc<MemoryRegistrar>,
    pub peer_store: Arc<MemoryPeerStore>,
    pub metrics: Arc<RecordingMetrics>,
    pub log: CallLog,
}

impl TestCtx {
    pub fn new() -> Self {
        let log: CallLog = Arc::new(Mutex::new(Vec::new()));
        TestCtx {
            manager: Arc::new(TestManager {
                accept: AtomicBool::new(true),
                released: AtomicUsize::new(0),
                log: log.clone(),
            }),
            gater: Arc::new(TestGater {
                deny: Mutex::new(None),
                log: log.clone(),
            }),
            bus: Arc::new(RecordingBus::default()),
            registrar: Arc::new(MemoryRegistrar::new()),
            peer_store: Arc::new(MemoryPeerStore::new()),
            metrics: Arc::new(RecordingMetrics::default()),
            log,
        }
    }

    pub fn components(&self) -> Components {
        Components {
            manager: self.manager.clone(),
            gater: Some(self.gater.clone()),
            protector: None,
            registrar: self.registrar.clone(),
            peer_store: self.peer_store.clone(),
            events: self.bus.clone(),
            metrics: Some(self.metrics.clone()),
        }
    }

    pub fn upgrader(
        &self,
        encrypters: Vec<Arc<dyn ConnectionEncrypter>>,
        muxers: Vec<Arc<dyn StreamMuxerFactory>>,
    ) -> Upgrader {
        self.upgrader_with_timeout(encrypters, muxers, Duration::from_secs(5))
    }

    pub fn upgrader_with_timeout(
        &self,
        encrypters: Vec<Arc<dyn ConnectionEncrypter>>,
        muxers: Vec<Arc<dyn StreamMuxerFactory>>,
        inbound_upgrade_timeout: Duration,
    ) -> Upgrader {
        Upgrader::new(
            self.components(),
            UpgraderConfig {
                connection_encrypters: encrypters,
                stream_muxers: muxers,
                inbound_upgrade_timeout,
            },
        )
    }

    pub fn checkpoints(&self) -> Vec<&'static str> {
        self.log.lock().unwrap().clone()
    }
}
