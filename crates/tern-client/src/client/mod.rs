// Client internals: shared connection state, the command queue feeding the
// single writer, and the pong FIFO that backs flush.
#![allow(clippy::module_inception)]
pub mod client;
pub(crate) mod connection;
pub(crate) mod dispatch;
pub mod registry;
pub mod request;
pub mod subscription;

use parking_lot::Mutex;
use std::collections::VecDeque;
use tern_wire::{ClientOp, ServerInfo};
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::config::{ClientConfig, EVENT_QUEUE_DEPTH};
use crate::error::{Error, Result};
use crate::events::{ConnectionState, EventEmitter};
use registry::Registry;
use request::InboxGenerator;

/// Work for the connection task, in call order.
pub(crate) enum Command {
    Op(ClientOp),
    /// Write a PING and resolve once its PONG arrives.
    Flush(oneshot::Sender<Result<()>>),
}

/// One entry per PING on the wire, popped by the matching PONG.
pub(crate) enum PongWaiter {
    Flush(oneshot::Sender<Result<()>>),
    Keepalive,
}

pub(crate) struct Shared {
    pub(crate) config: ClientConfig,
    pub(crate) registry: Mutex<Registry>,
    pub(crate) pongs: Mutex<VecDeque<PongWaiter>>,
    pub(crate) server_info: Mutex<Option<ServerInfo>>,
    pub(crate) authorized: Mutex<Option<bool>>,
    pub(crate) inbox: InboxGenerator,
    pub(crate) state: watch::Sender<ConnectionState>,
    pub(crate) events: EventEmitter,
    pub(crate) shutdown: CancellationToken,
}

impl Shared {
    pub(crate) fn new(config: ClientConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            registry: Mutex::new(Registry::new()),
            pongs: Mutex::new(VecDeque::new()),
            server_info: Mutex::new(None),
            authorized: Mutex::new(None),
            inbox: InboxGenerator::new(),
            state,
            events: EventEmitter::new(EVENT_QUEUE_DEPTH),
            shutdown: CancellationToken::new(),
        }
    }

    pub(crate) fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::debug!(from = ?previous, to = ?next, "connection state");
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled() || self.state().is_closed()
    }

    pub(crate) fn keepalives_outstanding(&self) -> usize {
        self.pongs
            .lock()
            .iter()
            .filter(|waiter| matches!(waiter, PongWaiter::Keepalive))
            .count()
    }

    /// Resolve the oldest waiter; PONGs with nothing waiting are ignored.
    pub(crate) fn pop_pong(&self) {
        let waiter = self.pongs.lock().pop_front();
        if let Some(PongWaiter::Flush(tx)) = waiter {
            let _ = tx.send(Ok(()));
        }
    }

    /// Drop keepalive waiters and return how many flush waiters remain.
    pub(crate) fn retain_flush_waiters(&self) -> usize {
        let mut pongs = self.pongs.lock();
        pongs.retain(|waiter| matches!(waiter, PongWaiter::Flush(_)));
        pongs.len()
    }

    pub(crate) fn fail_pong_waiters(&self) {
        let waiters: Vec<PongWaiter> = self.pongs.lock().drain(..).collect();
        for waiter in waiters {
            if let PongWaiter::Flush(tx) = waiter {
                let _ = tx.send(Err(Error::ConnectionClosed));
            }
        }
    }

    pub(crate) fn max_payload(&self) -> usize {
        self.server_info
            .lock()
            .as_ref()
            .map(|info| info.max_payload)
            .unwrap_or(tern_wire::DEFAULT_MAX_PAYLOAD)
    }
}
