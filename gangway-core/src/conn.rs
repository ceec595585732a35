use std::{
    fmt, io,
    sync::{Arc, Mutex},
    time::Instant,
};

use futures::{AsyncRead, AsyncWrite, AsyncWriteExt};
use multiaddr::Multiaddr;

/// Byte stream suitable for flowing through the upgrade stages.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Io for T {}

pub type BoxedIo = Box<dyn Io>;

/// Timestamps of the connection's observable transitions.
#[derive(Debug, Clone, Copy)]
pub struct Timeline {
    pub open: Instant,
    pub upgraded: Option<Instant>,
    pub close: Option<Instant>,
}

type CloseHook = Box<dyn FnOnce(Instant) + Send>;

struct ConnInfoInner {
    remote_addr: Multiaddr,
    timeline: Mutex<Timeline>,
    close_hook: Mutex<Option<CloseHook>>,
}

/// Shared metadata of a transport connection: the remote multiaddress and
/// the timeline. Every upgrade stage rewraps the byte stream but carries the
/// same `ConnInfo` through.
#[derive(Clone)]
pub struct ConnInfo {
    inner: Arc<ConnInfoInner>,
}

impl ConnInfo {
    pub fn new(remote_addr: Multiaddr) -> Self {
        ConnInfo {
            inner: Arc::new(ConnInfoInner {
                remote_addr,
                timeline: Mutex::new(Timeline {
                    open: Instant::now(),
                    upgraded: None,
                    close: None,
                }),
                close_hook: Mutex::new(None),
            }),
        }
    }

    pub fn remote_addr(&self) -> &Multiaddr {
        &self.inner.remote_addr
    }

    pub fn timeline(&self) -> Timeline {
        *self.inner.timeline.lock().expect("timeline lock")
    }

    /// Register a one-shot observer for the first close transition.
    ///
    /// Fires immediately when the connection is already closed; otherwise it
    /// fires from whichever close path records the transition first. At most
    /// one hook is held; registering again replaces an unfired one.
    pub fn on_close(&self, hook: impl FnOnce(Instant) + Send + 'static) {
        // hold the slot while deciding, so a concurrent `record_close`
        // cannot slip between the check and the registration
        let mut slot = self.inner.close_hook.lock().expect("close hook lock");
        let closed_at = self.inner.timeline.lock().expect("timeline lock").close;
        match closed_at {
            Some(at) => {
                drop(slot);
                hook(at);
            }
            None => *slot = Some(Box::new(hook)),
        }
    }

    pub(crate) fn record_upgraded(&self) {
        let mut timeline = self.inner.timeline.lock().expect("timeline lock");
        if timeline.upgraded.is_none() {
            timeline.upgraded = Some(Instant::now());
        }
    }

    /// Record the close transition; only the first call has any effect.
    pub(crate) fn record_close(&self) {
        let closed_at = {
            let mut timeline = self.inner.timeline.lock().expect("timeline lock");
            if timeline.close.is_some() {
                return;
            }
            let now = Instant::now();
            timeline.close = Some(now);
            now
        };
        let hook = self.inner.close_hook.lock().expect("close hook lock").take();
        if let Some(hook) = hook {
            hook(closed_at);
        }
    }
}

/// A transport connection annotated with its remote multiaddress.
///
/// Produced by a transport, consumed by the upgrader. Each upgrade stage
/// replaces the byte stream while the metadata handle stays the same.
pub struct MultiaddrConn {
    io: BoxedIo,
    info: ConnInfo,
}

impl fmt::Debug for MultiaddrConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiaddrConn")
            .field("remote_addr", self.info.remote_addr())
            .finish()
    }
}

impl MultiaddrConn {
    pub fn new(io: BoxedIo, remote_addr: Multiaddr) -> Self {
        MultiaddrConn {
            io,
            info: ConnInfo::new(remote_addr),
        }
    }

    pub fn from_parts(io: BoxedIo, info: ConnInfo) -> Self {
        MultiaddrConn { io, info }
    }

    pub fn into_parts(self) -> (BoxedIo, ConnInfo) {
        (self.io, self.info)
    }

    pub fn info(&self) -> &ConnInfo {
        &self.info
    }

    pub fn remote_addr(&self) -> &Multiaddr {
        self.info.remote_addr()
    }

    /// Flush and close the stream, recording the close transition. An
    /// optional cause (the error that doomed the connection) is logged,
    /// never transmitted.
    pub async fn close(mut self, cause: Option<&(dyn std::error::Error + Send + Sync + 'static)>) -> io::Result<()> {
        if let Some(cause) = cause {
            tracing::debug!(addr = %self.info.remote_addr(), %cause, "closing connection");
        } else {
            tracing::trace!(addr = %self.info.remote_addr(), "closing connection");
        }
        let result = self.io.close().await;
        self.info.record_close();
        result
    }

    /// Drop the stream immediately, recording the close transition.
    pub fn abort(self, cause: &(dyn std::error::Error + Send + Sync + 'static)) {
        tracing::debug!(addr = %self.info.remote_addr(), %cause, "aborting connection");
        drop(self.io);
        self.info.record_close();
    }
}
