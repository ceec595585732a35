use std::{
    fmt, io,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
    time::Instant,
};

use async_trait::async_trait;
use futures::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::{
    conn::BoxedIo,
    connection::Direction,
    protocol::ProtocolName,
};

/// Timestamps of a substream's lifecycle.
#[derive(Debug, Clone, Copy)]
pub struct StreamTimeline {
    pub open: Instant,
    pub close: Option<Instant>,
}

/// Metadata of a muxed substream, shared between the muxer's live set and
/// the [`MuxedStream`] handle. Rebinding the protocol after negotiation is
/// immediately visible to per-protocol stream accounting.
pub struct StreamMeta {
    id: u64,
    direction: Direction,
    protocol: Mutex<Option<ProtocolName>>,
    timeline: Mutex<StreamTimeline>,
}

impl StreamMeta {
    pub fn new(id: u64, direction: Direction) -> Arc<Self> {
        Arc::new(StreamMeta {
            id,
            direction,
            protocol: Mutex::new(None),
            timeline: Mutex::new(StreamTimeline {
                open: Instant::now(),
                close: None,
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn protocol(&self) -> Option<ProtocolName> {
        self.protocol.lock().expect("protocol lock").clone()
    }

    pub fn set_protocol(&self, protocol: ProtocolName) {
        *self.protocol.lock().expect("protocol lock") = Some(protocol);
    }

    pub fn timeline(&self) -> StreamTimeline {
        *self.timeline.lock().expect("timeline lock")
    }

    pub fn is_live(&self) -> bool {
        self.timeline().close.is_none()
    }

    pub fn record_close(&self) {
        let mut timeline = self.timeline.lock().expect("timeline lock");
        if timeline.close.is_none() {
            timeline.close = Some(Instant::now());
        }
    }
}

impl fmt::Debug for StreamMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamMeta")
            .field("id", &self.id)
            .field("direction", &self.direction)
            .field("protocol", &self.protocol())
            .finish()
    }
}

/// A bidirectional substream handed to protocol handlers.
///
/// The byte stream is replaced wholesale after protocol negotiation (the
/// negotiated wrapper becomes canonical), so no early data buffered during
/// negotiation is lost.
pub struct MuxedStream {
    meta: Arc<StreamMeta>,
    io: BoxedIo,
    read_closed: bool,
}

impl MuxedStream {
    pub fn new(meta: Arc<StreamMeta>, io: BoxedIo) -> Self {
        MuxedStream {
            meta,
            io,
            read_closed: false,
        }
    }

    pub fn meta(&self) -> &Arc<StreamMeta> {
        &self.meta
    }

    pub fn id(&self) -> u64 {
        self.meta.id
    }

    pub fn direction(&self) -> Direction {
        self.meta.direction
    }

    pub fn protocol(&self) -> Option<ProtocolName> {
        self.meta.protocol()
    }

    pub fn into_parts(self) -> (Arc<StreamMeta>, BoxedIo) {
        (self.meta, self.io)
    }

    /// Gracefully close both halves.
    pub async fn close(mut self) -> io::Result<()> {
        let result = self.io.close().await;
        self.meta.record_close();
        result
    }

    /// Close the write half; the remote observes EOF.
    pub async fn close_write(&mut self) -> io::Result<()> {
        self.io.close().await
    }

    /// Stop reading; subsequent reads return EOF.
    pub fn close_read(&mut self) {
        self.read_closed = true;
    }

    /// Tear the stream down without flushing.
    pub fn abort(self) {
        tracing::trace!(stream_id = self.meta.id, "aborting stream");
        drop(self.io);
        self.meta.record_close();
    }
}

impl fmt::Debug for MuxedStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MuxedStream")
            .field("id", &self.meta.id)
            .field("direction", &self.meta.direction)
            .field("protocol", &self.meta.protocol())
            .finish()
    }
}

impl AsyncRead for MuxedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        if self.read_closed {
            return Poll::Ready(Ok(0));
        }
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for MuxedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_close(cx)
    }
}

/// Callback invoked by a muxer for every substream the remote opens.
pub type IncomingStreamHook = Arc<dyn Fn(MuxedStream) + Send + Sync>;

/// Everything a muxer needs from its host at creation time.
pub struct MuxerInit {
    pub direction: Direction,
    pub on_incoming_stream: IncomingStreamHook,
}

/// An installed stream multiplexer.
///
/// The muxer is detached from the transport: `create_stream_muxer` returns a
/// socket-facing byte pipe that the upgrader couples to the connection with
/// two copy tasks.
#[async_trait]
pub trait StreamMuxer: Send + Sync {
    /// Open an outbound substream.
    async fn open_stream(&self) -> io::Result<MuxedStream>;

    /// Live substreams, closed ones pruned.
    fn streams(&self) -> Vec<Arc<StreamMeta>>;

    /// Gracefully shut down, closing all substreams.
    async fn close(&self) -> io::Result<()>;

    /// Tear everything down without flushing.
    fn abort(&self);
}

pub trait StreamMuxerFactory: Send + Sync {
    /// Name offered during muxer negotiation.
    fn protocol(&self) -> ProtocolName;

    /// Create a muxer and its socket-facing byte pipe.
    fn create_stream_muxer(&self, init: MuxerInit) -> (Box<dyn StreamMuxer>, BoxedIo);
}
