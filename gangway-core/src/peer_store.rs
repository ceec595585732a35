use std::{
    collections::{BTreeSet, HashMap},
    sync::Mutex,
};

use async_trait::async_trait;

use crate::{identity::PeerId, protocol::ProtocolName};

/// Durable knowledge about peers. The upgrader only records which protocols
/// a peer has successfully negotiated.
#[async_trait]
pub trait PeerStore: Send + Sync {
    /// Additively merge protocol support into the peer's record. Repeated
    /// merges of the same protocol are a no-op.
    async fn merge(&self, peer: &PeerId, protocols: &[ProtocolName]);
}

#[derive(Default)]
pub struct MemoryPeerStore {
    records: Mutex<HashMap<PeerId, BTreeSet<ProtocolName>>>,
}

impl MemoryPeerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn protocols(&self, peer: &PeerId) -> Vec<ProtocolName> {
        self.records
            .lock()
            .expect("peer store lock")
            .get(peer)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl PeerStore for MemoryPeerStore {
    async fn merge(&self, peer: &PeerId, protocols: &[ProtocolName]) {
        let mut records = self.records.lock().expect("peer store lock");
        records
            .entry(*peer)
            .or_default()
            .extend(protocols.iter().cloned());
    }
}
