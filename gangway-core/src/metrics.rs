use crate::{conn::ConnInfo, connection::Connection, protocol::ProtocolName};

/// Outcome of a dial attempt, used as the label of the dialer counter group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialEvent {
    Connect,
    Error,
    Timeout,
    Abort,
}

impl DialEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            DialEvent::Connect => "connect",
            DialEvent::Error => "error",
            DialEvent::Timeout => "timeout",
            DialEvent::Abort => "abort",
        }
    }
}

/// Optional observability hooks. Every method defaults to a no-op.
pub trait Metrics: Send + Sync {
    /// A transport connection came into existence.
    fn track_multiaddr_connection(&self, _conn: &ConnInfo) {}

    /// A stream finished protocol negotiation.
    fn track_protocol_stream(&self, _protocol: &ProtocolName, _connection: &Connection) {}

    /// A dial attempt settled.
    fn dial_event(&self, _event: DialEvent) {}
}
