use std::{fmt, sync::Arc};

use tokio::sync::broadcast;

use crate::connection::Connection;

/// Connection lifecycle notifications.
///
/// `Opened` is dispatched exactly once per successful upgrade; `Closed` at
/// most once, never before `Opened`, and only after the underlying
/// transport close has completed.
#[derive(Clone)]
pub enum ConnectionEvent {
    Opened(Arc<Connection>),
    Closed(Arc<Connection>),
}

impl fmt::Debug for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionEvent::Opened(c) => write!(f, "Opened({})", c.remote_peer()),
            ConnectionEvent::Closed(c) => write!(f, "Closed({})", c.remote_peer()),
        }
    }
}

pub trait EventBus: Send + Sync {
    fn dispatch(&self, event: ConnectionEvent);
}

/// Event bus fanning out over a tokio broadcast channel. Events are dropped
/// when no subscriber exists or a subscriber lags.
pub struct BroadcastBus {
    tx: broadcast::Sender<ConnectionEvent>,
}

impl BroadcastBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        BroadcastBus { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.tx.subscribe()
    }
}

impl EventBus for BroadcastBus {
    fn dispatch(&self, event: ConnectionEvent) {
        let _ = self.tx.send(event);
    }
}
