mod listener;

use std::{fmt, io, net::SocketAddr, sync::Arc, time::Duration};

use futures::{FutureExt, future::BoxFuture};
use gangway_core::{
    DialEvent, DialOpts, Metrics, MultiaddrConn, ProgressEvent, Transport,
};
use multiaddr::{Multiaddr, Protocol};
use socket2::{Domain, Socket, Type};
use tokio::net::TcpListener;
use tokio_util::compat::TokioAsyncReadCompatExt;

pub use listener::ListenStream;

#[derive(Clone)]
pub struct Config {
    ttl: Option<u32>,
    nodelay: bool,
    backlog: u32,
    metrics: Option<Arc<dyn Metrics>>,
}

impl Config {
    pub fn new() -> Self {
        Self {
            ttl: None,
            nodelay: true,
            backlog: 1024,
            metrics: None,
        }
    }

    pub fn ttl(mut self, value: u32) -> Self {
        self.ttl = Some(value);
        self
    }

    pub fn nodelay(mut self, value: bool) -> Self {
        self.nodelay = value;
        self
    }

    pub fn listen_backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }

    /// Track dialed and accepted connections.
    pub fn metrics(mut self, metrics: Arc<dyn Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn create_socket(&self, socket_addr: SocketAddr) -> io::Result<Socket> {
        let socket = Socket::new(
            Domain::for_address(socket_addr),
            Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;
        if socket_addr.is_ipv6() {
            socket.set_only_v6(true)?;
        }
        if let Some(ttl) = self.ttl {
            socket.set_ttl(ttl)?;
        }
        socket.set_nodelay(self.nodelay)?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        Ok(socket)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("ttl", &self.ttl)
            .field("nodelay", &self.nodelay)
            .field("backlog", &self.backlog)
            .finish_non_exhaustive()
    }
}

impl Transport for Config {
    type Error = io::Error;
    type Dialer = BoxFuture<'static, io::Result<MultiaddrConn>>;
    type Listener = ListenStream;

    fn dial(&self, addr: &Multiaddr, opts: DialOpts) -> io::Result<Self::Dialer> {
        let socket_addr = multiaddr_to_socketaddr(addr).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, format!("not a tcp multiaddr: {addr}"))
        })?;
        let remote_addr = addr.clone();
        let nodelay = self.nodelay;
        let ttl = self.ttl;
        let metrics = self.metrics.clone();

        Ok(async move {
            let connect = connect_bounded(socket_addr, opts.timeout);
            let result = match &opts.signal {
                // a signal firing before connect destroys the socket
                Some(signal) => {
                    tokio::select! {
                        _ = signal.cancelled() => {
                            dial_event(&metrics, DialEvent::Abort);
                            tracing::debug!(addr = %remote_addr, "dial aborted");
                            return Err(io::Error::new(
                                io::ErrorKind::ConnectionAborted,
                                "dial aborted",
                            ));
                        }
                        result = connect => result,
                    }
                }
                None => connect.await,
            };

            match result {
                Ok(stream) => {
                    dial_event(&metrics, DialEvent::Connect);
                    if let Some(hook) = &opts.on_progress {
                        hook(ProgressEvent::TcpOpenConnection);
                    }
                    stream.set_nodelay(nodelay)?;
                    if let Some(ttl) = ttl {
                        stream.set_ttl(ttl)?;
                    }
                    tracing::debug!(addr = %remote_addr, "tcp connection established");
                    let conn = MultiaddrConn::new(Box::new(stream.compat()), remote_addr);
                    if let Some(metrics) = &metrics {
                        metrics.track_multiaddr_connection(conn.info());
                    }
                    Ok(conn)
                }
                Err(err) => {
                    let event = if err.kind() == io::ErrorKind::TimedOut {
                        DialEvent::Timeout
                    } else {
                        DialEvent::Error
                    };
                    dial_event(&metrics, event);
                    tracing::debug!(addr = %remote_addr, %err, "tcp dial failed");
                    Err(err)
                }
            }
        }
        .boxed())
    }

    fn listen(&self, addr: &Multiaddr) -> io::Result<Self::Listener> {
        let socket_addr = multiaddr_to_socketaddr(addr).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, format!("not a tcp multiaddr: {addr}"))
        })?;
        let socket = self.create_socket(socket_addr)?;
        socket.bind(&socket_addr.into())?;
        socket.listen(self.backlog as _)?;
        let listener = TcpListener::from_std(socket.into())?;
        // resolves a requested port of 0 to the assigned one
        let listen_addr = socketaddr_to_multiaddr(&listener.local_addr()?);
        tracing::debug!(addr = %listen_addr, "listening for tcp connections");
        Ok(ListenStream::new(listener, listen_addr, self.metrics.clone()))
    }
}

async fn connect_bounded(
    addr: SocketAddr,
    bound: Option<Duration>,
) -> io::Result<tokio::net::TcpStream> {
    let connect = tokio::net::TcpStream::connect(addr);
    match bound {
        Some(bound) => tokio::time::timeout(bound, connect)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))?,
        None => connect.await,
    }
}

fn dial_event(metrics: &Option<Arc<dyn Metrics>>, event: DialEvent) {
    if let Some(metrics) = metrics {
        metrics.dial_event(event);
    }
}

/// The `/ip4/../tcp/..` (or `/ip6/..`) prefix as a socket address. Trailing
/// components such as `/p2p/..` are ignored.
pub fn multiaddr_to_socketaddr(addr: &Multiaddr) -> Option<SocketAddr> {
    let mut iter = addr.iter();
    let ip = match iter.next()? {
        Protocol::Ip4(ip) => ip.into(),
        Protocol::Ip6(ip) => ip.into(),
        _ => return None,
    };
    match iter.next()? {
        Protocol::Tcp(port) => Some(SocketAddr::new(ip, port)),
        _ => None,
    }
}

pub fn socketaddr_to_multiaddr(addr: &SocketAddr) -> Multiaddr {
    Multiaddr::empty()
        .with(Protocol::from(addr.ip()))
        .with(Protocol::Tcp(addr.port()))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use futures::{AsyncReadExt, AsyncWriteExt, StreamExt};
    use gangway_core::ListenerEvent;
    use tokio_util::sync::CancellationToken;

    use super::*;

    #[derive(Default)]
    struct DialRecorder {
        events: Mutex<Vec<DialEvent>>,
    }

    impl Metrics for DialRecorder {
        fn dial_event(&self, event: DialEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    #[test]
    fn multiaddr_round_trips_through_socketaddr() {
        let addr: Multiaddr = "/ip4/127.0.0.1/tcp/4001".parse().unwrap();
        let socket_addr = multiaddr_to_socketaddr(&addr).unwrap();
        assert_eq!(socketaddr_to_multiaddr(&socket_addr), addr);
    }

    #[test]
    fn trailing_components_are_ignored() {
        let addr: Multiaddr =
            "/ip6/::1/tcp/4001/p2p/QmcgpsyWgH8Y8ajJz1Cu72KnS5uo2Aa2LpzU7kinSupNKC"
                .parse()
                .unwrap();
        let socket_addr = multiaddr_to_socketaddr(&addr).unwrap();
        assert_eq!(socket_addr.port(), 4001);
    }

    #[test]
    fn non_tcp_multiaddrs_are_rejected() {
        let addr: Multiaddr = "/ip4/127.0.0.1/udp/4001".parse().unwrap();
        assert_eq!(multiaddr_to_socketaddr(&addr), None);
    }

    #[tokio::test]
    async fn dial_and_accept_loopback() {
        let recorder = Arc::new(DialRecorder::default());
        let config = Config::new().metrics(recorder.clone());
        let mut listener = config
            .listen(&"/ip4/127.0.0.1/tcp/0".parse().unwrap())
            .unwrap();

        let listen_addr = match listener.next().await {
            Some(ListenerEvent::Listened(addr)) => addr,
            other => panic!("expected Listened, got {other:?}"),
        };

        let dialer = config.dial(&listen_addr, DialOpts::default()).unwrap();
        let (dialed, accepted) = tokio::join!(dialer, listener.next());

        let (mut dialed_io, _) = dialed.unwrap().into_parts();
        let conn = match accepted {
            Some(ListenerEvent::Incoming { conn, .. }) => conn,
            other => panic!("expected Incoming, got {other:?}"),
        };
        let (mut accepted_io, _) = conn.into_parts();

        dialed_io.write_all(b"hello").await.unwrap();
        dialed_io.flush().await.unwrap();
        let mut buf = [0u8; 5];
        accepted_io.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        assert_eq!(*recorder.events.lock().unwrap(), vec![DialEvent::Connect]);
    }

    #[tokio::test]
    async fn cancelled_signal_aborts_the_dial() {
        let signal = CancellationToken::new();
        signal.cancel();

        let recorder = Arc::new(DialRecorder::default());
        let config = Config::new().metrics(recorder.clone());
        let dialer = config
            .dial(
                &"/ip4/127.0.0.1/tcp/1".parse().unwrap(),
                DialOpts {
                    signal: Some(signal),
                    ..DialOpts::default()
                },
            )
            .unwrap();

        let err = dialer.await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
        assert_eq!(*recorder.events.lock().unwrap(), vec![DialEvent::Abort]);
    }
}
