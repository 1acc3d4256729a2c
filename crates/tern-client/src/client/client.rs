// Client façade: validates calls, updates the registry, and enqueues
// protocol operations for the connection task.
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tern_subject::SubjectPattern;
use tern_wire::{ClientOp, ServerInfo, Sid};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

use super::registry::{Handler, MaxOutcome, Message, SubscribeOptions};
use super::{Command, Shared, connection, dispatch};
use crate::config::{ClientConfig, DISPATCH_QUEUE_DEPTH};
use crate::error::{Error, Result};
use crate::events::{ClientEvent, ConnectionState};

/// Handle to one logical connection. Cheap to clone; all clones share the
/// connection, and every non-async method may be called from a handler.
///
/// Dropping the last clone shuts the connection down. Handlers are owned by
/// the connection, so a handler that captures a `Client` keeps it alive
/// until `close` is called. Capture a [`WeakClient`] instead when the
/// handler should not extend the connection's lifetime.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    connection: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

impl Client {
    /// Connect and complete the handshake (INFO, optional TLS, CONNECT,
    /// PING/PONG) before returning.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let shared = Arc::new(Shared::new(config));
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (frames_tx, frames_rx) = mpsc::channel(DISPATCH_QUEUE_DEPTH);
        let (ready_tx, ready_rx) = oneshot::channel();

        tokio::spawn(dispatch::run_dispatch(
            Arc::clone(&shared),
            frames_rx,
            commands_tx.clone(),
        ));
        let connection = tokio::spawn(connection::run_connection(
            Arc::clone(&shared),
            commands_rx,
            frames_tx,
            ready_tx,
        ));

        let client = Self {
            inner: Arc::new(ClientInner {
                shared,
                commands: commands_tx,
                connection: Mutex::new(Some(connection)),
            }),
        };
        match ready_rx.await {
            Ok(Ok(())) => Ok(client),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(Error::ConnectionClosed),
        }
    }

    pub async fn connect_url(url: &str) -> Result<Self> {
        Self::connect(ClientConfig::from_url(url)?).await
    }

    /// A handle that does not keep the connection open.
    pub fn downgrade(&self) -> WeakClient {
        WeakClient {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub(crate) fn shared(&self) -> &Shared {
        &self.inner.shared
    }

    fn send(&self, command: Command) -> Result<()> {
        if self.inner.shared.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        self.inner
            .commands
            .send(command)
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Register `handler` for messages matching `subject` (wildcards allowed).
    ///
    /// The handler lives until the subscription ends or the client closes.
    pub fn subscribe<F>(&self, subject: &str, options: SubscribeOptions, handler: F) -> Result<Sid>
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        self.subscribe_handler(subject, options, Arc::new(handler))
    }

    fn subscribe_handler(
        &self,
        subject: &str,
        mut options: SubscribeOptions,
        handler: Handler,
    ) -> Result<Sid> {
        let shared = self.shared();
        if shared.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        let pattern = SubjectPattern::new(subject)?;
        if let Some(queue) = &options.queue {
            tern_subject::validate_subject(queue)?;
        }
        options.max = options.max.filter(|max| *max > 0);

        let sid = shared.registry.lock().add(pattern, &options, handler);
        let mut sent = self.send(Command::Op(ClientOp::Sub {
            subject: subject.to_string(),
            queue_group: options.queue.clone(),
            sid,
        }));
        if let (Ok(()), Some(max)) = (&sent, options.max) {
            sent = self.send(Command::Op(ClientOp::Unsub {
                sid,
                max: Some(max),
            }));
        }
        if let Err(err) = sent {
            shared.registry.lock().remove(sid);
            return Err(err);
        }

        debug!(%sid, subject, queue = ?options.queue, max = ?options.max, "subscribed");
        shared.events.emit(ClientEvent::Subscribe {
            sid,
            subject: subject.to_string(),
            options,
        });
        Ok(sid)
    }

    /// Stop delivery now (`max` = `None`) or after `max` total deliveries.
    /// Unknown or already-expired sids are ignored.
    pub fn unsubscribe(&self, sid: Sid, max: Option<u64>) -> Result<()> {
        let shared = self.shared();
        let removed = match max.filter(|max| *max > 0) {
            None => shared.registry.lock().remove(sid),
            Some(max) => {
                let outcome = shared.registry.lock().set_max(sid, max);
                match outcome {
                    MaxOutcome::Unknown => None,
                    MaxOutcome::Limited => {
                        debug!(%sid, max, "subscription limited");
                        return self.send(Command::Op(ClientOp::Unsub {
                            sid,
                            max: Some(max),
                        }));
                    }
                    MaxOutcome::Expired(entry) => Some(entry),
                }
            }
        };
        let Some(entry) = removed else {
            return Ok(());
        };
        let subject = entry.pattern.as_str().to_string();
        debug!(%sid, %subject, "unsubscribed");
        let sent = self.send(Command::Op(ClientOp::Unsub { sid, max: None }));
        shared
            .events
            .emit(ClientEvent::Unsubscribe { sid, subject });
        sent
    }

    pub fn publish(&self, subject: &str, payload: impl Into<Bytes>) -> Result<()> {
        self.publish_op(subject, None, payload.into())
    }

    pub fn publish_request(
        &self,
        subject: &str,
        reply_to: &str,
        payload: impl Into<Bytes>,
    ) -> Result<()> {
        self.publish_op(subject, Some(reply_to), payload.into())
    }

    /// Publish, then wait until the server has acknowledged everything
    /// written so far.
    pub async fn publish_flushed(&self, subject: &str, payload: impl Into<Bytes>) -> Result<()> {
        self.publish(subject, payload)?;
        self.flush().await
    }

    fn publish_op(&self, subject: &str, reply_to: Option<&str>, payload: Bytes) -> Result<()> {
        tern_subject::validate_subject(subject)?;
        if let Some(reply_to) = reply_to {
            tern_subject::validate_subject(reply_to)?;
        }
        self.check_payload(&payload)?;
        self.send(Command::Op(ClientOp::Pub {
            subject: subject.to_string(),
            reply_to: reply_to.map(str::to_string),
            payload,
        }))
    }

    pub(crate) fn check_payload(&self, payload: &Bytes) -> Result<()> {
        let max = self.shared().max_payload();
        if payload.len() > max {
            return Err(Error::MaxPayloadExceeded {
                size: payload.len(),
                max,
            });
        }
        Ok(())
    }

    /// Resolves once every operation issued before this call reached the
    /// server, confirmed by a PING/PONG round trip.
    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Flush(tx))?;
        rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    pub async fn flush_timeout(&self, timeout: Duration) -> Result<()> {
        tokio::time::timeout(timeout, self.flush())
            .await
            .map_err(|_| Error::Timeout)?
    }

    /// Shut the connection down. Pending flushes fail with
    /// `ConnectionClosed`; pending callback requests are dropped. Idempotent.
    pub async fn close(&self) {
        let shared = self.shared();
        shared.shutdown.cancel();
        let connection = self.inner.connection.lock().take();
        match connection {
            Some(handle) => {
                let _ = handle.await;
            }
            None => {
                let mut state = shared.state.subscribe();
                let _ = state
                    .wait_for(|state| *state == ConnectionState::Closed)
                    .await;
            }
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared().state()
    }

    pub fn is_closed(&self) -> bool {
        self.shared().is_closed()
    }

    pub fn server_info(&self) -> Option<ServerInfo> {
        self.shared().server_info.lock().clone()
    }

    /// Whether the server certificate verified; `None` on plaintext.
    pub fn authorized(&self) -> Option<bool> {
        *self.shared().authorized.lock()
    }

    /// Lifecycle events. The first receiver handed out also carries the
    /// events emitted while `connect` was running.
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.shared().events.subscribe()
    }

    pub fn subscription_count(&self) -> usize {
        self.shared().registry.lock().len()
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("address", &self.shared().config.address())
            .field("state", &self.state())
            .finish()
    }
}

/// Non-owning counterpart of [`Client`], for handlers that publish back on
/// the connection they were registered on.
#[derive(Clone)]
pub struct WeakClient {
    inner: Weak<ClientInner>,
}

impl WeakClient {
    /// `None` once every `Client` clone has been dropped.
    pub fn upgrade(&self) -> Option<Client> {
        self.inner.upgrade().map(|inner| Client { inner })
    }
}

impl std::fmt::Debug for WeakClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeakClient")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}
