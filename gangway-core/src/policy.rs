use async_trait::async_trait;

use crate::{conn::ConnInfo, identity::PeerId};

/// Admission control for inbound connections.
#[async_trait]
pub trait ConnectionManager: Send + Sync {
    /// Whether a new inbound connection may start upgrading. A `false`
    /// fails the upgrade with a connection-denied error.
    async fn accept_incoming_connection(&self, conn: &ConnInfo) -> bool;

    /// Release the admission slot. Called exactly once per inbound upgrade,
    /// on every exit path.
    fn after_upgrade_inbound(&self);
}

/// Policy callbacks that can veto a connection at fixed checkpoints.
///
/// Every method defaults to *allow*; implementors override only the
/// checkpoints they care about.
#[async_trait]
pub trait ConnectionGater: Send + Sync {
    /// Inbound, before any bytes are exchanged.
    async fn deny_inbound_connection(&self, _conn: &ConnInfo) -> bool {
        false
    }

    /// Outbound, before any bytes are exchanged; only invoked when the
    /// remote peer is already known.
    async fn deny_outbound_connection(&self, _peer: &PeerId, _conn: &ConnInfo) -> bool {
        false
    }

    /// Inbound, after the handshake authenticated the remote.
    async fn deny_inbound_encrypted_connection(&self, _peer: &PeerId, _conn: &ConnInfo) -> bool {
        false
    }

    /// Outbound, after the handshake authenticated the remote.
    async fn deny_outbound_encrypted_connection(&self, _peer: &PeerId, _conn: &ConnInfo) -> bool {
        false
    }

    /// Inbound, after the muxer stage, right before the connection opens.
    async fn deny_inbound_upgraded_connection(&self, _peer: &PeerId, _conn: &ConnInfo) -> bool {
        false
    }

    /// Outbound, after the muxer stage, right before the connection opens.
    async fn deny_outbound_upgraded_connection(&self, _peer: &PeerId, _conn: &ConnInfo) -> bool {
        false
    }
}
