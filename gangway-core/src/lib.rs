pub mod components;
pub mod conn;
pub mod connection;
pub mod crypto;
pub mod event;
pub mod identity;
pub mod metrics;
pub mod muxing;
pub mod peer_store;
pub mod policy;
pub mod protocol;
pub mod registrar;
mod router;
pub mod transport;
pub mod upgrade;

pub use components::Components;
pub use conn::{BoxedIo, ConnInfo, MultiaddrConn, Timeline};
pub use connection::{
    Connection, ConnectionLimits, DEFAULT_PROTOCOL_SELECT_TIMEOUT, Direction, NewStreamOpts,
    Status, StreamError,
};
pub use crypto::{ConnectionEncrypter, ConnectionProtector, SecuredIo};
pub use event::{BroadcastBus, ConnectionEvent, EventBus};
pub use identity::PeerId;
pub use metrics::{DialEvent, Metrics};
pub use muxing::{MuxedStream, MuxerInit, StreamMeta, StreamMuxer, StreamMuxerFactory};
pub use peer_store::{MemoryPeerStore, PeerStore};
pub use policy::{ConnectionGater, ConnectionManager};
pub use protocol::ProtocolName;
pub use registrar::{
    DEFAULT_MAX_INBOUND_STREAMS, DEFAULT_MAX_OUTBOUND_STREAMS, HandlerOptions, MemoryRegistrar,
    Registrar, RegistrarEntry, RegistrarError, StreamHandler,
};
pub use transport::{DialOpts, ListenerEvent, Transport};
pub use upgrade::{
    INBOUND_UPGRADE_TIMEOUT, ProgressEvent, UpgradeError, UpgradeOpts, Upgrader, UpgraderConfig,
};

pub type NegotiationError = gangway_select::NegotiationError;

pub use multiaddr::{self, Multiaddr};
