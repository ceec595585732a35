use std::io;

use async_trait::async_trait;

use crate::{conn::BoxedIo, identity::PeerId, protocol::ProtocolName};

/// Result of a successful handshake: the encrypted stream and the identity
/// it authenticated.
pub struct SecuredIo {
    pub io: BoxedIo,
    pub remote_peer: PeerId,
}

/// A cryptographic handshake implementation (e.g. Noise or TLS).
///
/// When an expected peer is supplied to `secure_outbound` and the handshake
/// authenticates someone else, the encrypter reports the mismatch as an
/// error.
#[async_trait]
pub trait ConnectionEncrypter: Send + Sync {
    /// Name offered during encryption negotiation.
    fn protocol(&self) -> ProtocolName;

    async fn secure_inbound(&self, io: BoxedIo) -> io::Result<SecuredIo>;

    async fn secure_outbound(&self, io: BoxedIo, remote_peer: Option<PeerId>)
    -> io::Result<SecuredIo>;
}

/// A pre-shared-key tunnel applied before any handshake.
#[async_trait]
pub trait ConnectionProtector: Send + Sync {
    async fn protect(&self, io: BoxedIo) -> io::Result<BoxedIo>;
}
