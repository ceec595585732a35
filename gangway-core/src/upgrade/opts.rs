use std::{fmt, sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;

use crate::{connection::ConnectionLimits, identity::PeerId, muxing::StreamMuxerFactory};

/// Bound on a complete inbound upgrade, admission through muxer install.
pub const INBOUND_UPGRADE_TIMEOUT: Duration = Duration::from_secs(30);

/// Named milestones of an upgrade, reported through
/// [`UpgradeOpts::on_progress`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressEvent {
    TcpOpenConnection,
    EncryptInbound,
    EncryptOutbound,
    MultiplexInbound,
    MultiplexOutbound,
}

impl ProgressEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressEvent::TcpOpenConnection => "tcp:open-connection",
            ProgressEvent::EncryptInbound => "upgrader:encrypt-inbound-connection",
            ProgressEvent::EncryptOutbound => "upgrader:encrypt-outbound-connection",
            ProgressEvent::MultiplexInbound => "upgrader:multiplex-inbound-connection",
            ProgressEvent::MultiplexOutbound => "upgrader:multiplex-outbound-connection",
        }
    }
}

impl fmt::Display for ProgressEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type ProgressHook = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

/// Options for one upgrade. The struct is closed: there is no bag of
/// untyped extras, so unsupported options cannot be smuggled in.
#[derive(Clone, Default)]
pub struct UpgradeOpts {
    /// Treat the connection as already authenticated. The peer id must then
    /// come from the remote multiaddress (inbound) or from `remote_peer` or
    /// the multiaddress (outbound), and the recorded crypto protocol is
    /// `"native"`.
    pub skip_encryption: bool,

    /// Bypass the configured pre-shared-key protector.
    pub skip_protection: bool,

    /// Use this muxer without negotiating one.
    pub muxer_factory: Option<Arc<dyn StreamMuxerFactory>>,

    /// Caps imposed upstream; a limited connection only routes streams to
    /// handlers that opted in.
    pub limits: Option<ConnectionLimits>,

    /// Expected identity of the remote, when dialing a known peer.
    pub remote_peer: Option<PeerId>,

    /// Caller cancellation; any in-flight stage resolves with an abort
    /// error when it fires.
    pub signal: Option<CancellationToken>,

    pub on_progress: Option<ProgressHook>,
}

impl UpgradeOpts {
    pub(crate) fn progress(&self, event: ProgressEvent) {
        if let Some(hook) = &self.on_progress {
            hook(event);
        }
    }
}

impl fmt::Debug for UpgradeOpts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpgradeOpts")
            .field("skip_encryption", &self.skip_encryption)
            .field("skip_protection", &self.skip_protection)
            .field("muxer_factory", &self.muxer_factory.as_ref().map(|m| m.protocol()))
            .field("limits", &self.limits)
            .field("remote_peer", &self.remote_peer)
            .finish_non_exhaustive()
    }
}
