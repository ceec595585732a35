use std::{error, fmt, time::Duration};

use futures::Stream;
use multiaddr::Multiaddr;
use tokio_util::sync::CancellationToken;

use crate::{conn::MultiaddrConn, upgrade::ProgressHook};

/// Per-dial options.
///
/// A signal firing before the socket is connected destroys it; a timeout
/// bounds the connect itself.
#[derive(Clone, Default)]
pub struct DialOpts {
    pub signal: Option<CancellationToken>,
    pub timeout: Option<Duration>,
    pub on_progress: Option<ProgressHook>,
}

/// Produces raw [`MultiaddrConn`] values for the upgrader to consume.
pub trait Transport {
    type Error: error::Error;
    type Dialer: Future<Output = Result<MultiaddrConn, Self::Error>> + Send;
    type Listener: Stream<Item = ListenerEvent<Self::Error>> + Send;

    fn dial(&self, addr: &Multiaddr, opts: DialOpts) -> Result<Self::Dialer, Self::Error>;

    fn listen(&self, addr: &Multiaddr) -> Result<Self::Listener, Self::Error>;
}

pub enum ListenerEvent<E> {
    /// The listener is bound and accepting.
    Listened(Multiaddr),
    Incoming {
        local_addr: Multiaddr,
        conn: MultiaddrConn,
    },
    Closed(Result<(), E>),
    Error(E),
}

impl<E> fmt::Debug for ListenerEvent<E>
where
    E: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerEvent::Listened(addr) => write!(f, "Listened({addr})"),
            ListenerEvent::Incoming { local_addr, conn } => write!(
                f,
                "Incoming(local: {local_addr}, remote: {})",
                conn.remote_addr()
            ),
            ListenerEvent::Closed(result) => write!(f, "Closed({result:?})"),
            ListenerEvent::Error(err) => write!(f, "Error({err:?})"),
        }
    }
}
