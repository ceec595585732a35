use std::{fmt, str::FromStr};

use multiaddr::{Multiaddr, Protocol};
use multihash::Multihash;

/// Multihash code for an identity hash; small public keys are embedded
/// verbatim rather than hashed.
const IDENTITY_CODE: u64 = 0x00;

/// Stable identity of a peer, derived from its public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId {
    hash: Multihash<64>,
}

impl PeerId {
    /// Identity of the peer holding the given ed25519 key.
    pub fn from_public_key(key: &ed25519_dalek::VerifyingKey) -> Self {
        let hash = Multihash::wrap(IDENTITY_CODE, key.as_bytes()).expect("key fits in a multihash");
        PeerId { hash }
    }

    pub fn from_multihash(hash: Multihash<64>) -> Self {
        PeerId { hash }
    }

    pub fn as_multihash(&self) -> &Multihash<64> {
        &self.hash
    }

    /// Extract the peer id embedded in the trailing `/p2p/..` component of
    /// a multiaddress, if there is one.
    pub fn try_from_multiaddr(addr: &Multiaddr) -> Option<PeerId> {
        match addr.iter().last() {
            Some(Protocol::P2p(hash)) => Some(PeerId { hash: hash.into() }),
            _ => None,
        }
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&bs58::encode(self.hash.to_bytes()).into_string())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({self})")
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid peer id encoding")]
pub struct ParsePeerIdError;

impl FromStr for PeerId {
    type Err = ParsePeerIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = bs58::decode(s).into_vec().map_err(|_| ParsePeerIdError)?;
        let hash = Multihash::from_bytes(&bytes).map_err(|_| ParsePeerIdError)?;
        Ok(PeerId { hash })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer_id(seed: u8) -> PeerId {
        PeerId::from_multihash(Multihash::wrap(IDENTITY_CODE, &[seed; 32]).unwrap())
    }

    #[test]
    fn display_round_trips() {
        let id = peer_id(7);
        let parsed: PeerId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn extracted_from_multiaddr() {
        let id = peer_id(3);
        let addr: Multiaddr = "/ip4/10.0.0.1/tcp/4001".parse().unwrap();
        assert_eq!(PeerId::try_from_multiaddr(&addr), None);

        let addr = addr.with(Protocol::P2p((*id.as_multihash()).try_into().unwrap()));
        assert_eq!(PeerId::try_from_multiaddr(&addr), Some(id));
    }

    #[test]
    fn derived_from_public_key() {
        let key = ed25519_dalek::SigningKey::from_bytes(&[9; 32]);
        let a = PeerId::from_public_key(&key.verifying_key());
        let b = PeerId::from_public_key(&key.verifying_key());
        assert_eq!(a, b);
    }
}
