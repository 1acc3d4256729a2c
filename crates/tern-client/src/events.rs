// Connection state and lifecycle events.
use parking_lot::Mutex;
use std::sync::Arc;
use tern_wire::Sid;
use tokio::sync::broadcast;

use crate::client::registry::SubscribeOptions;
use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    AwaitingInfo,
    TlsHandshaking,
    Connected,
    Reconnecting,
    Closing,
    Closed,
}

impl ConnectionState {
    pub fn is_closed(self) -> bool {
        matches!(self, Self::Closing | Self::Closed)
    }
}

/// Lifecycle notifications, separate from message delivery.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connect,
    Disconnect,
    Reconnecting {
        attempt: u32,
    },
    Reconnect,
    Subscribe {
        sid: Sid,
        subject: String,
        options: SubscribeOptions,
    },
    Unsubscribe {
        sid: Sid,
        subject: String,
    },
    Error(Arc<Error>),
    Closed,
}

pub(crate) struct EventEmitter {
    tx: broadcast::Sender<ClientEvent>,
    // Held from construction so the first caller of `events()` also sees
    // the Connect that fired before `connect` returned.
    first: Mutex<Option<broadcast::Receiver<ClientEvent>>>,
}

impl EventEmitter {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, rx) = broadcast::channel(capacity);
        Self {
            tx,
            first: Mutex::new(Some(rx)),
        }
    }

    pub(crate) fn emit(&self, event: ClientEvent) {
        tracing::trace!(?event, "client event");
        // No receivers is fine.
        let _ = self.tx.send(event);
    }

    pub(crate) fn error(&self, err: Error) {
        self.emit(ClientEvent::Error(Arc::new(err)));
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        match self.first.lock().take() {
            Some(rx) => rx,
            None => self.tx.subscribe(),
        }
    }
}
