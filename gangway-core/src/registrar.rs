use std::sync::{Arc, RwLock};

use crate::{connection::Connection, muxing::MuxedStream, protocol::ProtocolName};

/// Per-protocol inbound stream cap when the handler does not set one.
pub const DEFAULT_MAX_INBOUND_STREAMS: usize = 32;

/// Per-protocol outbound stream cap when neither the handler nor the
/// `new_stream` caller sets one.
pub const DEFAULT_MAX_OUTBOUND_STREAMS: usize = 32;

/// Application entry point for a negotiated inbound stream. Typically spawns
/// a task; the router does not await it.
pub trait StreamHandler: Send + Sync {
    fn handle(&self, connection: Arc<Connection>, stream: MuxedStream);
}

impl<F> StreamHandler for F
where
    F: Fn(Arc<Connection>, MuxedStream) + Send + Sync,
{
    fn handle(&self, connection: Arc<Connection>, stream: MuxedStream) {
        self(connection, stream)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct HandlerOptions {
    pub max_inbound_streams: Option<usize>,
    pub max_outbound_streams: Option<usize>,
    /// Opt-in to receiving streams over rate- or byte-capped connections.
    pub run_on_limited_connection: bool,
}

#[derive(Clone)]
pub struct RegistrarEntry {
    pub handler: Arc<dyn StreamHandler>,
    pub options: HandlerOptions,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistrarError {
    #[error("no handler registered for protocol {0}")]
    UnhandledProtocol(ProtocolName),
}

/// Protocol handler table consulted by the stream router at the moment a
/// stream arrives, never cached per connection.
pub trait Registrar: Send + Sync {
    /// Registered protocol names, in registration order.
    fn protocols(&self) -> Vec<ProtocolName>;

    fn entry(&self, protocol: &ProtocolName) -> Result<RegistrarEntry, RegistrarError>;
}

/// In-memory handler table.
#[derive(Default)]
pub struct MemoryRegistrar {
    entries: RwLock<Vec<(ProtocolName, RegistrarEntry)>>,
}

impl MemoryRegistrar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for the protocol.
    pub fn register(
        &self,
        protocol: impl Into<ProtocolName>,
        handler: Arc<dyn StreamHandler>,
        options: HandlerOptions,
    ) {
        let protocol = protocol.into();
        let entry = RegistrarEntry { handler, options };
        let mut entries = self.entries.write().expect("registrar lock");
        match entries.iter_mut().find(|(p, _)| *p == protocol) {
            Some((_, slot)) => *slot = entry,
            None => entries.push((protocol, entry)),
        }
    }

    pub fn unregister(&self, protocol: &ProtocolName) {
        self.entries
            .write()
            .expect("registrar lock")
            .retain(|(p, _)| p != protocol);
    }
}

impl Registrar for MemoryRegistrar {
    fn protocols(&self) -> Vec<ProtocolName> {
        self.entries
            .read()
            .expect("registrar lock")
            .iter()
            .map(|(p, _)| p.clone())
            .collect()
    }

    fn entry(&self, protocol: &ProtocolName) -> Result<RegistrarEntry, RegistrarError> {
        self.entries
            .read()
            .expect("registrar lock")
            .iter()
            .find(|(p, _)| p == protocol)
            .map(|(_, entry)| entry.clone())
            .ok_or_else(|| RegistrarError::UnhandledProtocol(protocol.clone()))
    }
}
