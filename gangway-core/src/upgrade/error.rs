use std::io;

use gangway_select::NegotiationError;
use multiaddr::Multiaddr;

/// Reasons an upgrade failed. Every one of these is fatal to the upgrade:
/// the underlying connection is closed and the error returned to the caller.
#[derive(Debug, thiserror::Error)]
pub enum UpgradeError {
    #[error("connection denied by the connection manager")]
    ConnectionDenied,

    #[error("connection intercepted by {0}")]
    ConnectionIntercepted(&'static str),

    #[error("remote multiaddr {0} carries no peer id")]
    InvalidMultiaddr(Multiaddr),

    #[error("no remote peer id available for an unencrypted outbound connection")]
    InvalidPeerId,

    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("failed to negotiate a stream multiplexer")]
    MuxerUnavailable(#[source] NegotiationError),

    #[error("inbound upgrade timed out")]
    Timeout,

    #[error("upgrade aborted by caller")]
    Aborted,

    #[error(transparent)]
    Io(#[from] io::Error),
}
