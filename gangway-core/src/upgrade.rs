mod error;
mod opts;

pub use error::UpgradeError;
pub use opts::{INBOUND_UPGRADE_TIMEOUT, ProgressEvent, ProgressHook, UpgradeOpts};

use std::{sync::Arc, time::Duration};

use gangway_select::{NegotiationError, dialer_select, listener_select};
use tokio_util::sync::CancellationToken;

use crate::{
    components::Components,
    conn::{ConnInfo, MultiaddrConn},
    connection::{Connection, ConnectionInit, Direction},
    crypto::ConnectionEncrypter,
    identity::PeerId,
    muxing::StreamMuxerFactory,
    policy::ConnectionManager,
    protocol::{self, ProtocolName},
};

/// Static upgrade configuration: which handshakes and muxers this node
/// speaks, and how long an inbound upgrade may take.
pub struct UpgraderConfig {
    /// Offered during encryption negotiation, in insertion order.
    pub connection_encrypters: Vec<Arc<dyn ConnectionEncrypter>>,
    /// Offered during muxer negotiation, in insertion order. Empty means
    /// upgraded connections cannot open streams.
    pub stream_muxers: Vec<Arc<dyn StreamMuxerFactory>>,
    pub inbound_upgrade_timeout: Duration,
}

impl Default for UpgraderConfig {
    fn default() -> Self {
        UpgraderConfig {
            connection_encrypters: Vec::new(),
            stream_muxers: Vec::new(),
            inbound_upgrade_timeout: INBOUND_UPGRADE_TIMEOUT,
        }
    }
}

/// Turns raw transport connections into authenticated, encrypted, muxed
/// peer connections.
///
/// The stages run strictly in sequence: admission, protection, encryption,
/// multiplexing, with a gating checkpoint between each. Any failure tears
/// the whole connection down.
pub struct Upgrader {
    components: Arc<Components>,
    encrypters: Vec<Arc<dyn ConnectionEncrypter>>,
    muxers: Vec<Arc<dyn StreamMuxerFactory>>,
    inbound_upgrade_timeout: Duration,
}

/// Error paths may or may not still own the connection: stages that consume
/// the byte stream (negotiation, handshake) return `None` and the stream is
/// already gone.
type StageResult<T> = Result<T, (UpgradeError, Option<MultiaddrConn>)>;

struct ReleaseGuard(Arc<dyn ConnectionManager>);

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        self.0.after_upgrade_inbound();
    }
}

impl Upgrader {
    pub fn new(components: Components, config: UpgraderConfig) -> Self {
        Upgrader {
            components: Arc::new(components),
            encrypters: config.connection_encrypters,
            muxers: config.stream_muxers,
            inbound_upgrade_timeout: config.inbound_upgrade_timeout,
        }
    }

    /// Upgrade a freshly accepted connection.
    ///
    /// The whole sequence is bounded by the configured inbound timeout, and
    /// the connection manager's admission slot is released on every exit
    /// path.
    pub async fn upgrade_inbound(
        &self,
        conn: MultiaddrConn,
        opts: UpgradeOpts,
    ) -> Result<Arc<Connection>, UpgradeError> {
        let _guard = ReleaseGuard(self.components.manager.clone());
        let info = conn.info().clone();
        let fut = with_signal(
            opts.signal.clone(),
            self.perform(Direction::Inbound, conn, &opts),
        );
        let result = match tokio::time::timeout(self.inbound_upgrade_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err((UpgradeError::Timeout, None)),
        };
        finish(info, Direction::Inbound, result).await
    }

    /// Upgrade a freshly dialed connection.
    ///
    /// No default time bound; callers cancel through `opts.signal`.
    pub async fn upgrade_outbound(
        &self,
        conn: MultiaddrConn,
        opts: UpgradeOpts,
    ) -> Result<Arc<Connection>, UpgradeError> {
        let info = conn.info().clone();
        let result = with_signal(
            opts.signal.clone(),
            self.perform(Direction::Outbound, conn, &opts),
        )
        .await;
        finish(info, Direction::Outbound, result).await
    }

    async fn perform(
        &self,
        direction: Direction,
        mut conn: MultiaddrConn,
        opts: &UpgradeOpts,
    ) -> StageResult<Arc<Connection>> {
        // admission and pre-byte gating
        match direction {
            Direction::Inbound => {
                if !self
                    .components
                    .manager
                    .accept_incoming_connection(conn.info())
                    .await
                {
                    return Err((UpgradeError::ConnectionDenied, Some(conn)));
                }
                if let Some(gater) = &self.components.gater {
                    if gater.deny_inbound_connection(conn.info()).await {
                        return Err((
                            UpgradeError::ConnectionIntercepted("deny_inbound_connection"),
                            Some(conn),
                        ));
                    }
                }
            }
            Direction::Outbound => {
                if let (Some(gater), Some(peer)) = (&self.components.gater, &opts.remote_peer) {
                    if gater.deny_outbound_connection(peer, conn.info()).await {
                        return Err((
                            UpgradeError::ConnectionIntercepted("deny_outbound_connection"),
                            Some(conn),
                        ));
                    }
                }
            }
        }

        // pre-shared-key protection
        if !opts.skip_protection {
            if let Some(protector) = &self.components.protector {
                tracing::trace!(addr = %conn.remote_addr(), "protecting connection");
                let (io, info) = conn.into_parts();
                match protector.protect(io).await {
                    Ok(io) => conn = MultiaddrConn::from_parts(io, info),
                    Err(err) => return Err((UpgradeError::Io(err), None)),
                }
            }
        }

        // encryption
        let (conn, remote_peer, encryption) = if opts.skip_encryption {
            let peer = match direction {
                Direction::Inbound => match PeerId::try_from_multiaddr(conn.remote_addr()) {
                    Some(peer) => peer,
                    None => {
                        let addr = conn.remote_addr().clone();
                        return Err((UpgradeError::InvalidMultiaddr(addr), Some(conn)));
                    }
                },
                Direction::Outbound => {
                    match opts
                        .remote_peer
                        .or_else(|| PeerId::try_from_multiaddr(conn.remote_addr()))
                    {
                        Some(peer) => peer,
                        None => return Err((UpgradeError::InvalidPeerId, Some(conn))),
                    }
                }
            };
            (conn, peer, ProtocolName::from(protocol::NATIVE))
        } else {
            opts.progress(match direction {
                Direction::Inbound => ProgressEvent::EncryptInbound,
                Direction::Outbound => ProgressEvent::EncryptOutbound,
            });
            match self.encrypt(direction, conn, opts).await {
                Ok(encrypted) => encrypted,
                Err(err) => return Err((err, None)),
            }
        };

        // post-encryption gating
        if let Some(gater) = &self.components.gater {
            let (denied, method) = match direction {
                Direction::Inbound => (
                    gater
                        .deny_inbound_encrypted_connection(&remote_peer, conn.info())
                        .await,
                    "deny_inbound_encrypted_connection",
                ),
                Direction::Outbound => (
                    gater
                        .deny_outbound_encrypted_connection(&remote_peer, conn.info())
                        .await,
                    "deny_outbound_encrypted_connection",
                ),
            };
            if denied {
                return Err((UpgradeError::ConnectionIntercepted(method), Some(conn)));
            }
        }

        // multiplexing
        if opts.muxer_factory.is_some() || !self.muxers.is_empty() {
            opts.progress(match direction {
                Direction::Inbound => ProgressEvent::MultiplexInbound,
                Direction::Outbound => ProgressEvent::MultiplexOutbound,
            });
        }
        let (conn, muxer_factory) = if let Some(factory) = &opts.muxer_factory {
            tracing::trace!(protocol = %factory.protocol(), "using caller-supplied muxer");
            (conn, Some(factory.clone()))
        } else if self.muxers.is_empty() {
            (conn, None)
        } else {
            match self.multiplex(direction, conn).await {
                Ok(muxed) => muxed,
                Err(err) => return Err((err, None)),
            }
        };

        // post-multiplex gating
        if let Some(gater) = &self.components.gater {
            let (denied, method) = match direction {
                Direction::Inbound => (
                    gater
                        .deny_inbound_upgraded_connection(&remote_peer, conn.info())
                        .await,
                    "deny_inbound_upgraded_connection",
                ),
                Direction::Outbound => (
                    gater
                        .deny_outbound_upgraded_connection(&remote_peer, conn.info())
                        .await,
                    "deny_outbound_upgraded_connection",
                ),
            };
            if denied {
                return Err((UpgradeError::ConnectionIntercepted(method), Some(conn)));
            }
        }

        tracing::debug!(
            addr = %conn.remote_addr(),
            peer = %remote_peer,
            ?direction,
            "connection upgraded"
        );
        Ok(Connection::assemble(ConnectionInit {
            components: self.components.clone(),
            conn,
            direction,
            remote_peer,
            encryption,
            muxer_factory,
            limits: opts.limits,
        }))
    }

    async fn encrypt(
        &self,
        direction: Direction,
        conn: MultiaddrConn,
        opts: &UpgradeOpts,
    ) -> Result<(MultiaddrConn, PeerId, ProtocolName), UpgradeError> {
        if self.encrypters.is_empty() {
            return Err(UpgradeError::EncryptionFailed(
                "no connection encrypters configured".to_owned(),
            ));
        }
        let protocols: Vec<ProtocolName> = self.encrypters.iter().map(|e| e.protocol()).collect();
        // optimistic selection only works when there is nothing to fall
        // back to
        let yield_bytes = protocols.len() == 1;
        let (io, info) = conn.into_parts();
        let (negotiated, chosen) = match direction {
            Direction::Inbound => listener_select(io, protocols).await,
            Direction::Outbound => dialer_select(io, protocols, yield_bytes).await,
        }
        .map_err(|err| UpgradeError::EncryptionFailed(err.to_string()))?;
        tracing::trace!(protocol = %chosen, "negotiated encryption protocol");

        let encrypter = self
            .encrypters
            .iter()
            .find(|e| e.protocol() == chosen.as_str())
            .ok_or_else(|| {
                UpgradeError::EncryptionFailed(format!("negotiated unknown protocol {chosen}"))
            })?;
        let secured = match direction {
            Direction::Inbound => encrypter.secure_inbound(Box::new(negotiated)).await,
            Direction::Outbound => {
                encrypter
                    .secure_outbound(Box::new(negotiated), opts.remote_peer)
                    .await
            }
        }
        .map_err(|err| UpgradeError::EncryptionFailed(err.to_string()))?;
        tracing::trace!(peer = %secured.remote_peer, "connection encrypted");

        Ok((
            MultiaddrConn::from_parts(secured.io, info),
            secured.remote_peer,
            ProtocolName::from(chosen),
        ))
    }

    async fn multiplex(
        &self,
        direction: Direction,
        conn: MultiaddrConn,
    ) -> Result<(MultiaddrConn, Option<Arc<dyn StreamMuxerFactory>>), UpgradeError> {
        let protocols: Vec<ProtocolName> = self.muxers.iter().map(|m| m.protocol()).collect();
        let yield_bytes = protocols.len() == 1;
        let (io, info) = conn.into_parts();
        let (negotiated, chosen) = match direction {
            Direction::Inbound => listener_select(io, protocols).await,
            Direction::Outbound => dialer_select(io, protocols, yield_bytes).await,
        }
        .map_err(UpgradeError::MuxerUnavailable)?;
        tracing::trace!(protocol = %chosen, "negotiated stream multiplexer");

        let factory = self
            .muxers
            .iter()
            .find(|m| m.protocol() == chosen.as_str())
            .cloned()
            .ok_or(UpgradeError::MuxerUnavailable(NegotiationError::Failed))?;
        Ok((
            MultiaddrConn::from_parts(Box::new(negotiated), info),
            Some(factory),
        ))
    }
}

async fn with_signal<T>(
    signal: Option<CancellationToken>,
    fut: impl Future<Output = StageResult<T>>,
) -> StageResult<T> {
    match signal {
        Some(signal) => {
            tokio::select! {
                _ = signal.cancelled() => Err((UpgradeError::Aborted, None)),
                result = fut => result,
            }
        }
        None => fut.await,
    }
}

/// Settle an upgrade. On failure the connection is closed, gracefully when
/// a stage still owned it, implicitly (the stream was dropped mid-stage)
/// otherwise. Outbound failures carry the error as close cause.
async fn finish<T>(
    info: ConnInfo,
    direction: Direction,
    result: StageResult<T>,
) -> Result<T, UpgradeError> {
    match result {
        Ok(value) => Ok(value),
        Err((err, conn)) => {
            match conn {
                Some(conn) => {
                    let cause = direction
                        .is_outbound()
                        .then_some(&err as &(dyn std::error::Error + Send + Sync + 'static));
                    let _ = conn.close(cause).await;
                }
                None => {
                    tracing::debug!(addr = %info.remote_addr(), %err, "upgrade failed");
                    info.record_close();
                }
            }
            Err(err)
        }
    }
}
