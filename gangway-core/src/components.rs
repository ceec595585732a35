use std::sync::Arc;

use crate::{
    crypto::ConnectionProtector,
    event::EventBus,
    metrics::Metrics,
    peer_store::PeerStore,
    policy::{ConnectionGater, ConnectionManager},
    registrar::Registrar,
};

/// Collaborators shared by the upgrader and every connection it produces.
///
/// The gater, protector and metrics are optional; an absent gater allows
/// everything, an absent protector leaves connections unprotected.
#[derive(Clone)]
pub struct Components {
    pub manager: Arc<dyn ConnectionManager>,
    pub gater: Option<Arc<dyn ConnectionGater>>,
    pub protector: Option<Arc<dyn ConnectionProtector>>,
    pub registrar: Arc<dyn Registrar>,
    pub peer_store: Arc<dyn PeerStore>,
    pub events: Arc<dyn EventBus>,
    pub metrics: Option<Arc<dyn Metrics>>,
}
