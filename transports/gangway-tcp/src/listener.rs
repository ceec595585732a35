use std::{
    io,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use futures::Stream;
use gangway_core::{ListenerEvent, Metrics, MultiaddrConn};
use multiaddr::Multiaddr;
use tokio::net::TcpListener;
use tokio_util::compat::TokioAsyncReadCompatExt;

use crate::socketaddr_to_multiaddr;

pub struct ListenStream {
    listen_addr: Multiaddr,
    listener: TcpListener,
    metrics: Option<Arc<dyn Metrics>>,
    pending_event: Option<ListenerEvent<io::Error>>,
}

impl ListenStream {
    pub(crate) fn new(
        listener: TcpListener,
        listen_addr: Multiaddr,
        metrics: Option<Arc<dyn Metrics>>,
    ) -> Self {
        let listened_event = ListenerEvent::Listened(listen_addr.clone());
        ListenStream {
            listen_addr,
            listener,
            metrics,
            pending_event: Some(listened_event),
        }
    }

    pub fn listen_addr(&self) -> &Multiaddr {
        &self.listen_addr
    }
}

impl Stream for ListenStream {
    type Item = ListenerEvent<io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let Some(event) = self.pending_event.take() {
            return Poll::Ready(Some(event));
        }
        tracing::trace!(addr = %self.listen_addr, "polling for new connections");
        match self.listener.poll_accept(cx) {
            Poll::Ready(Ok((stream, remote_addr))) => {
                let remote_addr = socketaddr_to_multiaddr(&remote_addr);
                tracing::debug!(addr = %remote_addr, "accepted tcp connection");
                let conn = MultiaddrConn::new(Box::new(stream.compat()), remote_addr);
                if let Some(metrics) = &self.metrics {
                    metrics.track_multiaddr_connection(conn.info());
                }
                Poll::Ready(Some(ListenerEvent::Incoming {
                    local_addr: self.listen_addr.clone(),
                    conn,
                }))
            }
            Poll::Ready(Err(err)) => Poll::Ready(Some(ListenerEvent::Error(err))),
            Poll::Pending => Poll::Pending,
        }
    }
}
