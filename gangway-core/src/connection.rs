use std::{
    fmt, io,
    pin::pin,
    sync::{Arc, Mutex, OnceLock, Weak},
    time::Duration,
};

use futures::{AsyncReadExt, AsyncWriteExt};
use gangway_select::dialer_select;
use multiaddr::Multiaddr;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::{
    components::Components,
    conn::{BoxedIo, ConnInfo, MultiaddrConn, Timeline},
    event::ConnectionEvent,
    identity::PeerId,
    muxing::{IncomingStreamHook, MuxedStream, MuxerInit, StreamMeta, StreamMuxer,
        StreamMuxerFactory},
    protocol::ProtocolName,
    registrar::{DEFAULT_MAX_OUTBOUND_STREAMS, RegistrarError},
    router,
};

/// Bound on protocol selection in [`Connection::new_stream`] when the
/// caller supplies no signal. Applies to negotiation only, never to
/// subsequent stream use.
pub const DEFAULT_PROTOCOL_SELECT_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a graceful close waits for in-flight bytes to drain.
const GRACEFUL_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl std::ops::Not for Direction {
    type Output = Direction;

    fn not(self) -> Self::Output {
        match self {
            Direction::Inbound => Direction::Outbound,
            Direction::Outbound => Direction::Inbound,
        }
    }
}

impl Direction {
    pub fn is_inbound(self) -> bool {
        matches!(self, Direction::Inbound)
    }

    pub fn is_outbound(self) -> bool {
        matches!(self, Direction::Outbound)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Status {
    Open,
    Closing,
    Closed,
}

/// Caps imposed upstream on a connection (relayed or resource-managed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectionLimits {
    pub bytes: Option<u64>,
    pub duration: Option<Duration>,
}

/// Reasons opening or routing a single stream failed. Fatal only to that
/// stream.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("connection has no stream multiplexer")]
    MuxerUnavailable,

    #[error("connection is not open")]
    ConnectionClosed,

    #[error("no protocols were offered")]
    NoProtocols,

    #[error("too many inbound streams for protocol {protocol} (limit {limit})")]
    TooManyInboundStreams { protocol: ProtocolName, limit: usize },

    #[error("too many outbound streams for protocol {protocol} ({count} open, limit {limit})")]
    TooManyOutboundStreams {
        protocol: ProtocolName,
        count: usize,
        limit: usize,
    },

    #[error("protocol {0} does not run on a limited connection")]
    LimitedConnection(ProtocolName),

    #[error(transparent)]
    Registrar(#[from] RegistrarError),

    #[error(transparent)]
    Negotiation(#[from] gangway_select::NegotiationError),

    #[error("protocol selection timed out")]
    Timeout,

    #[error("stream opening aborted by caller")]
    Aborted,

    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Clone, Default)]
pub struct NewStreamOpts {
    /// Cancels protocol selection; without it a default timeout applies.
    pub signal: Option<CancellationToken>,

    /// Fallback outbound cap, consulted when the registrar has none for
    /// the protocol.
    pub max_outbound_streams: Option<usize>,
}

pub(crate) struct ConnectionInit {
    pub components: Arc<Components>,
    pub conn: MultiaddrConn,
    pub direction: Direction,
    pub remote_peer: PeerId,
    pub encryption: ProtocolName,
    pub muxer_factory: Option<Arc<dyn StreamMuxerFactory>>,
    pub limits: Option<ConnectionLimits>,
}

/// An upgraded peer connection.
///
/// Owns the transport stream (through a driver task) and the installed
/// muxer. Dispatches `Opened` on assembly and `Closed` exactly once, after
/// the transport close completed.
pub struct Connection {
    info: ConnInfo,
    remote_peer: PeerId,
    direction: Direction,
    encryption: ProtocolName,
    multiplexer: Option<ProtocolName>,
    limits: Option<ConnectionLimits>,
    status: Mutex<Status>,
    muxer: Option<Box<dyn StreamMuxer>>,
    driver: DriverHandle,
    components: Arc<Components>,
    /// Serializes the per-protocol count check against the install step.
    stream_gate: tokio::sync::Mutex<()>,
}

impl Connection {
    pub(crate) fn assemble(init: ConnectionInit) -> Arc<Connection> {
        let ConnectionInit {
            components,
            conn,
            direction,
            remote_peer,
            encryption,
            muxer_factory,
            limits,
        } = init;

        // the incoming-stream hook outlives this scope inside the muxer; it
        // closes over a publish-once cell that is filled right after the
        // connection exists
        let cell: Arc<OnceLock<Weak<Connection>>> = Arc::new(OnceLock::new());
        let (muxer, mux_io, multiplexer) = match muxer_factory {
            Some(factory) => {
                let (muxer, socket) = factory.create_stream_muxer(MuxerInit {
                    direction,
                    on_incoming_stream: incoming_stream_hook(cell.clone()),
                });
                (Some(muxer), Some(socket), Some(factory.protocol()))
            }
            None => (None, None, None),
        };

        let (io, info) = conn.into_parts();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        tokio::spawn(drive_transport(io, mux_io, info.clone(), cmd_rx));

        info.record_upgraded();

        let connection = Arc::new(Connection {
            info: info.clone(),
            remote_peer,
            direction,
            encryption,
            multiplexer,
            limits,
            status: Mutex::new(Status::Open),
            muxer,
            driver: DriverHandle { tx: cmd_tx },
            components: components.clone(),
            stream_gate: tokio::sync::Mutex::new(()),
        });

        components
            .events
            .dispatch(ConnectionEvent::Opened(connection.clone()));

        // close-observed one-shot; registered after `Opened` went out so the
        // two events cannot invert even when the transport dies instantly
        {
            let weak = Arc::downgrade(&connection);
            info.on_close(move |_| {
                if let Some(connection) = weak.upgrade() {
                    tokio::spawn(connection.finalize_close());
                }
            });
        }

        let _ = cell.set(Arc::downgrade(&connection));
        connection
    }

    pub fn remote_addr(&self) -> &Multiaddr {
        self.info.remote_addr()
    }

    pub fn remote_peer(&self) -> PeerId {
        self.remote_peer
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Name of the negotiated crypto protocol, or `"native"` when
    /// encryption was skipped.
    pub fn encryption(&self) -> &ProtocolName {
        &self.encryption
    }

    /// Name of the installed muxer; `None` means streams cannot be opened.
    pub fn multiplexer(&self) -> Option<&ProtocolName> {
        self.multiplexer.as_ref()
    }

    pub fn limits(&self) -> Option<ConnectionLimits> {
        self.limits
    }

    pub fn status(&self) -> Status {
        *self.status.lock().expect("status lock")
    }

    pub fn timeline(&self) -> Timeline {
        self.info.timeline()
    }

    pub fn info(&self) -> &ConnInfo {
        &self.info
    }

    pub(crate) fn components(&self) -> &Arc<Components> {
        &self.components
    }

    pub(crate) fn stream_gate(&self) -> &tokio::sync::Mutex<()> {
        &self.stream_gate
    }

    /// Live streams of the installed muxer; empty without one.
    pub fn streams(&self) -> Vec<Arc<StreamMeta>> {
        self.muxer
            .as_ref()
            .map(|muxer| muxer.streams())
            .unwrap_or_default()
    }

    pub(crate) fn count_streams(&self, direction: Direction, protocol: &ProtocolName) -> usize {
        self.streams()
            .iter()
            .filter(|meta| {
                meta.direction() == direction
                    && meta.is_live()
                    && meta.protocol().as_ref() == Some(protocol)
            })
            .count()
    }

    /// Open an outbound stream speaking one of `protocols` (in preference
    /// order).
    pub async fn new_stream(
        &self,
        protocols: Vec<ProtocolName>,
        opts: NewStreamOpts,
    ) -> Result<MuxedStream, StreamError> {
        let muxer = self.muxer.as_ref().ok_or(StreamError::MuxerUnavailable)?;
        if protocols.is_empty() {
            return Err(StreamError::NoProtocols);
        }
        if self.status() != Status::Open {
            return Err(StreamError::ConnectionClosed);
        }

        let stream = muxer.open_stream().await?;
        tracing::trace!(stream_id = stream.id(), ?protocols, "negotiating outbound stream");
        let (meta, io) = stream.into_parts();

        match self.negotiate_outbound(&meta, io, protocols, &opts).await {
            Ok(stream) => Ok(stream),
            Err(err) => {
                // the failed negotiation dropped the stream; make the muxer
                // forget it too
                meta.record_close();
                Err(err)
            }
        }
    }

    async fn negotiate_outbound(
        &self,
        meta: &Arc<StreamMeta>,
        io: BoxedIo,
        protocols: Vec<ProtocolName>,
        opts: &NewStreamOpts,
    ) -> Result<MuxedStream, StreamError> {
        let yield_bytes = protocols.len() == 1;
        let select = dialer_select(io, protocols, yield_bytes);
        let (negotiated, chosen) = match &opts.signal {
            Some(signal) => {
                tokio::select! {
                    _ = signal.cancelled() => return Err(StreamError::Aborted),
                    result = select => result?,
                }
            }
            None => match tokio::time::timeout(DEFAULT_PROTOCOL_SELECT_TIMEOUT, select).await {
                Ok(result) => result?,
                Err(_) => return Err(StreamError::Timeout),
            },
        };
        let protocol = ProtocolName::from(chosen);

        {
            let _gate = self.stream_gate.lock().await;
            let limit = self.outgoing_stream_limit(&protocol, opts);
            let count = self.count_streams(Direction::Outbound, &protocol);
            if count >= limit {
                return Err(StreamError::TooManyOutboundStreams {
                    protocol,
                    count,
                    limit,
                });
            }
            meta.set_protocol(protocol.clone());
        }

        self.components
            .peer_store
            .merge(&self.remote_peer, std::slice::from_ref(&protocol))
            .await;
        if let Some(metrics) = &self.components.metrics {
            metrics.track_protocol_stream(&protocol, self);
        }
        tracing::trace!(stream_id = meta.id(), %protocol, "outbound stream negotiated");
        Ok(MuxedStream::new(meta.clone(), Box::new(negotiated)))
    }

    /// Registrar cap wins, then the caller's, then the default.
    fn outgoing_stream_limit(&self, protocol: &ProtocolName, opts: &NewStreamOpts) -> usize {
        let registered = match self.components.registrar.entry(protocol) {
            Ok(entry) => entry.options.max_outbound_streams,
            Err(RegistrarError::UnhandledProtocol(_)) => None,
        };
        registered
            .or(opts.max_outbound_streams)
            .unwrap_or(DEFAULT_MAX_OUTBOUND_STREAMS)
    }

    /// Gracefully close: muxer first, then the transport. A no-op on an
    /// already closing or closed connection, tolerant of concurrent
    /// callers.
    pub async fn close(&self) -> io::Result<()> {
        {
            let mut status = self.status.lock().expect("status lock");
            if *status != Status::Open {
                return Ok(());
            }
            *status = Status::Closing;
        }
        tracing::debug!(peer = %self.remote_peer, "closing connection");
        if let Some(muxer) = &self.muxer {
            if let Err(err) = muxer.close().await {
                tracing::debug!(peer = %self.remote_peer, %err, "muxer close failed");
            }
        }
        self.driver.close().await;
        Ok(())
    }

    /// Tear down without flushing: transport first, then the muxer.
    /// Fire-and-forget.
    pub fn abort(&self) {
        {
            let mut status = self.status.lock().expect("status lock");
            if *status == Status::Closed {
                return;
            }
            *status = Status::Closing;
        }
        tracing::debug!(peer = %self.remote_peer, "aborting connection");
        self.driver.abort();
        if let Some(muxer) = &self.muxer {
            muxer.abort();
        }
    }

    /// Runs once, from the close-observed hook: settle status, give the
    /// muxer a graceful shutdown when the transport died underneath an open
    /// connection, then announce the close.
    async fn finalize_close(self: Arc<Self>) {
        let was_open = {
            let mut status = self.status.lock().expect("status lock");
            if *status == Status::Closed {
                return;
            }
            let was_open = *status == Status::Open;
            *status = Status::Closed;
            was_open
        };
        if was_open {
            if let Some(muxer) = &self.muxer {
                if let Err(err) = muxer.close().await {
                    tracing::debug!(peer = %self.remote_peer, %err, "muxer close failed");
                }
            }
        }
        self.components
            .events
            .dispatch(ConnectionEvent::Closed(self.clone()));
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("remote_peer", &self.remote_peer)
            .field("direction", &self.direction)
            .field("status", &self.status())
            .field("encryption", &self.encryption)
            .field("multiplexer", &self.multiplexer)
            .finish()
    }
}

fn incoming_stream_hook(cell: Arc<OnceLock<Weak<Connection>>>) -> IncomingStreamHook {
    Arc::new(move |stream: MuxedStream| {
        let Some(connection) = cell.get().and_then(Weak::upgrade) else {
            tracing::debug!(
                stream_id = stream.id(),
                "stream arrived before the connection was published, dropping"
            );
            return;
        };
        tokio::spawn(router::route_incoming_stream(connection, stream));
    })
}

enum DriverCmd {
    Close(oneshot::Sender<()>),
    Abort,
}

struct DriverHandle {
    tx: mpsc::UnboundedSender<DriverCmd>,
}

impl DriverHandle {
    async fn close(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(DriverCmd::Close(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }

    fn abort(&self) {
        let _ = self.tx.send(DriverCmd::Abort);
    }
}

/// Owns the transport stream and the muxer's socket pipe for the life of
/// the connection, running the two copy directions concurrently. Either
/// direction ending, a close command, or an abort ends the task; the close
/// transition is recorded when, and only when, the transport is gone.
async fn drive_transport(
    io: BoxedIo,
    mux_io: Option<BoxedIo>,
    info: ConnInfo,
    mut cmd_rx: mpsc::UnboundedReceiver<DriverCmd>,
) {
    let addr = info.remote_addr().clone();
    match mux_io {
        Some(mux_io) => {
            let (mut conn_read, mut conn_write) = io.split();
            let (mut mux_read, mut mux_write) = mux_io.split();
            let mut inbound = pin!(async {
                let result = futures::io::copy(&mut conn_read, &mut mux_write).await;
                let _ = mux_write.close().await;
                result
            });
            let mut outbound = pin!(async {
                let result = futures::io::copy(&mut mux_read, &mut conn_write).await;
                let _ = conn_write.close().await;
                result
            });
            let mut inbound_done = false;
            let mut outbound_done = false;

            loop {
                tokio::select! {
                    result = &mut inbound, if !inbound_done => {
                        inbound_done = true;
                        log_pipe(&addr, "read", result);
                    }
                    result = &mut outbound, if !outbound_done => {
                        outbound_done = true;
                        log_pipe(&addr, "write", result);
                    }
                    cmd = cmd_rx.recv() => match cmd {
                        Some(DriverCmd::Close(ack)) => {
                            // the muxer was shut by the caller; wait for its
                            // remaining bytes to reach the wire, not for the
                            // remote to hang up
                            if !outbound_done {
                                match tokio::time::timeout(GRACEFUL_CLOSE_TIMEOUT, &mut outbound).await {
                                    Ok(result) => log_pipe(&addr, "write", result),
                                    Err(_) => tracing::debug!(%addr, "graceful close timed out, dropping transport"),
                                }
                            }
                            info.record_close();
                            let _ = ack.send(());
                            return;
                        }
                        Some(DriverCmd::Abort) | None => {
                            tracing::trace!(%addr, "transport aborted");
                            break;
                        }
                    },
                }
                if inbound_done && outbound_done {
                    break;
                }
            }
            info.record_close();
        }
        None => {
            // nothing to pipe without a muxer; hold the stream until told
            match cmd_rx.recv().await {
                Some(DriverCmd::Close(ack)) => {
                    let mut io = io;
                    let _ = io.close().await;
                    info.record_close();
                    let _ = ack.send(());
                }
                Some(DriverCmd::Abort) | None => {
                    drop(io);
                    info.record_close();
                }
            }
        }
    }
}

fn log_pipe(addr: &Multiaddr, side: &str, result: io::Result<u64>) {
    match result {
        Ok(bytes) => tracing::trace!(%addr, side, bytes, "transport pipe finished"),
        Err(err) => tracing::debug!(%addr, side, %err, "transport pipe failed"),
    }
}
