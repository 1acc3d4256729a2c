// In-process server speaking the tern text protocol.
//
// Enough of a real server to exercise clients end to end: INFO first in
// plaintext, optional TLS upgrade (with or without client certificates),
// CONNECT with token auth, PING/PONG, SUB/UNSUB with auto-unsubscribe, PUB
// routing with wildcards and queue groups, plus hooks for tests to kick
// connections, stop answering PINGs, or inject frames.
use anyhow::{Context, Result, anyhow};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tern_wire::{ClientDecoder, ClientOp, Msg, ServerInfo, ServerOp, Sid};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::tls::ServerTls;

#[derive(Clone)]
pub struct MockServerConfig {
    pub tls: Option<ServerTls>,
    pub max_payload: usize,
    /// Required `auth_token` in CONNECT.
    pub token: Option<String>,
    pub server_id: String,
}

impl Default for MockServerConfig {
    fn default() -> Self {
        Self {
            tls: None,
            max_payload: tern_wire::DEFAULT_MAX_PAYLOAD,
            token: None,
            server_id: "tern-mock".to_string(),
        }
    }
}

impl MockServerConfig {
    pub fn with_tls(tls: ServerTls) -> Self {
        Self {
            tls: Some(tls),
            ..Self::default()
        }
    }
}

pub struct MockServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
    shutdown: CancellationToken,
    accept: Option<JoinHandle<()>>,
}

struct ServerState {
    info: ServerInfo,
    token: Option<String>,
    acceptor: Option<TlsAcceptor>,
    routing: Mutex<Routing>,
    answer_pings: AtomicBool,
    next_conn: AtomicU64,
    connects: AtomicU64,
}

#[derive(Default)]
struct Routing {
    conns: HashMap<u64, Conn>,
    subs: Vec<ServerSub>,
    queue_cursor: usize,
}

struct Conn {
    tx: mpsc::UnboundedSender<Bytes>,
    kick: CancellationToken,
    echo: bool,
    verbose: bool,
}

struct ServerSub {
    conn: u64,
    sid: Sid,
    subject: String,
    queue: Option<String>,
    max: Option<u64>,
    delivered: u64,
}

impl MockServer {
    pub async fn start() -> Result<Self> {
        Self::start_with(MockServerConfig::default()).await
    }

    pub async fn start_with(config: MockServerConfig) -> Result<Self> {
        Self::bind(SocketAddr::from(([127, 0, 0, 1], 0)), config).await
    }

    /// Bind a specific address, e.g. to bring a server back on the port a
    /// client is already reconnecting to.
    pub async fn bind(addr: SocketAddr, config: MockServerConfig) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("bind mock server on {addr}"))?;
        let addr = listener.local_addr().context("mock server local addr")?;
        let acceptor = match &config.tls {
            Some(tls) => Some(TlsAcceptor::from(tls.server_config()?)),
            None => None,
        };
        let info = ServerInfo {
            server_id: config.server_id.clone(),
            server_name: "tern-mock".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            host: addr.ip().to_string(),
            port: addr.port(),
            max_payload: config.max_payload,
            tls_required: config.tls.is_some(),
            tls_verify: config
                .tls
                .as_ref()
                .is_some_and(ServerTls::requires_client_cert),
            auth_required: config.token.is_some(),
            ..ServerInfo::default()
        };
        let state = Arc::new(ServerState {
            info,
            token: config.token,
            acceptor,
            routing: Mutex::new(Routing::default()),
            answer_pings: AtomicBool::new(true),
            next_conn: AtomicU64::new(1),
            connects: AtomicU64::new(0),
        });
        let shutdown = CancellationToken::new();
        let accept = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&state),
            shutdown.clone(),
        ));
        debug!(%addr, "mock server listening");
        Ok(Self {
            addr,
            state,
            shutdown,
            accept: Some(accept),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn url(&self) -> String {
        format!("nats://{}", self.addr)
    }

    /// Drop every open connection; the listener keeps accepting.
    pub fn kick_clients(&self) {
        let routing = self.state.routing.lock();
        for conn in routing.conns.values() {
            conn.kick.cancel();
        }
    }

    pub fn set_answer_pings(&self, answer: bool) {
        self.state.answer_pings.store(answer, Ordering::SeqCst);
    }

    /// Write a frame to every connected client.
    pub fn broadcast(&self, op: &ServerOp) -> Result<()> {
        let bytes = op.to_bytes()?;
        let routing = self.state.routing.lock();
        for conn in routing.conns.values() {
            let _ = conn.tx.send(bytes.clone());
        }
        Ok(())
    }

    pub fn connection_count(&self) -> usize {
        self.state.routing.lock().conns.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.state.routing.lock().subs.len()
    }

    /// Completed CONNECTs since start, across all connections.
    pub fn connect_count(&self) -> u64 {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub async fn wait_for_subscriptions(&self, count: usize) -> Result<()> {
        self.wait_until(|server| server.subscription_count() == count)
            .await
            .with_context(|| {
                format!(
                    "waiting for {count} subscriptions (have {})",
                    self.subscription_count()
                )
            })
    }

    pub async fn wait_for_connections(&self, count: usize) -> Result<()> {
        self.wait_until(|server| server.connection_count() == count)
            .await
            .with_context(|| {
                format!(
                    "waiting for {count} open connections (have {})",
                    self.connection_count()
                )
            })
    }

    pub async fn wait_for_connects(&self, count: u64) -> Result<()> {
        self.wait_until(|server| server.connect_count() >= count)
            .await
            .with_context(|| format!("waiting for {count} connects"))
    }

    async fn wait_until(&self, condition: impl Fn(&Self) -> bool) -> Result<()> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !condition(self) {
            if tokio::time::Instant::now() >= deadline {
                return Err(anyhow!("condition not reached within 5s"));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Ok(())
    }

    /// Stop accepting and close every connection.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Some(accept) = self.accept.take() {
            let _ = accept.await;
        }
        self.kick_clients();
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn accept_loop(listener: TcpListener, state: Arc<ServerState>, shutdown: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                let state = Arc::clone(&state);
                let kick = shutdown.child_token();
                tokio::spawn(async move {
                    if let Err(err) = serve(state, stream, kick).await {
                        debug!(%peer, error = %err, "mock connection ended with error");
                    }
                });
            }
            Err(err) => warn!(error = %err, "mock server accept failed"),
        }
    }
}

trait Io: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> Io for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

async fn serve(state: Arc<ServerState>, mut stream: TcpStream, kick: CancellationToken) -> Result<()> {
    stream.set_nodelay(true)?;
    let info = ServerOp::Info(Box::new(state.info.clone())).to_bytes()?;
    stream.write_all(&info).await?;
    stream.flush().await?;

    let transport: Box<dyn Io> = match &state.acceptor {
        Some(acceptor) => {
            let accepted = tokio::select! {
                _ = kick.cancelled() => return Ok(()),
                accepted = acceptor.accept(stream) => accepted,
            };
            Box::new(accepted.context("tls accept")?)
        }
        None => Box::new(stream),
    };
    let (mut reader, mut writer) = tokio::io::split(transport);

    let id = state.next_conn.fetch_add(1, Ordering::SeqCst);
    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
    state.routing.lock().conns.insert(
        id,
        Conn {
            tx: tx.clone(),
            kick: kick.clone(),
            echo: true,
            verbose: false,
        },
    );
    let writer_task = tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            if writer.write_all(&bytes).await.is_err() || writer.flush().await.is_err() {
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    let result = read_ops(&state, id, &mut reader, &tx, &kick).await;

    state.routing.lock().remove_conn(id);
    drop(tx);
    let _ = writer_task.await;
    result
}

async fn read_ops<R>(
    state: &ServerState,
    id: u64,
    reader: &mut R,
    tx: &mpsc::UnboundedSender<Bytes>,
    kick: &CancellationToken,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut decoder = ClientDecoder::with_max_payload(state.info.max_payload);
    loop {
        loop {
            let op = match decoder.decode() {
                Ok(Some(op)) => op,
                Ok(None) => break,
                Err(err) => {
                    let message = match err {
                        tern_wire::Error::PayloadTooLarge { .. } => "Maximum Payload Violation",
                        tern_wire::Error::ControlLineTooLong(_) => "Maximum Control Line Exceeded",
                        _ => "Unknown Protocol Operation",
                    };
                    send_err(tx, message);
                    return Err(anyhow!(err));
                }
            };
            if !state.handle_op(id, op, tx) {
                return Ok(());
            }
        }
        let read = tokio::select! {
            _ = kick.cancelled() => return Ok(()),
            read = reader.read_buf(decoder.buffer_mut()) => read?,
        };
        if read == 0 {
            return Ok(());
        }
    }
}

fn send_err(tx: &mpsc::UnboundedSender<Bytes>, message: &str) {
    if let Ok(bytes) = ServerOp::Err(message.to_string()).to_bytes() {
        let _ = tx.send(bytes);
    }
}

fn send_op(tx: &mpsc::UnboundedSender<Bytes>, op: ServerOp) {
    if let Ok(bytes) = op.to_bytes() {
        let _ = tx.send(bytes);
    }
}

impl ServerState {
    /// Apply one client operation; `false` closes the connection.
    fn handle_op(&self, id: u64, op: ClientOp, tx: &mpsc::UnboundedSender<Bytes>) -> bool {
        let mut routing = self.routing.lock();
        let verbose = routing.conns.get(&id).is_some_and(|conn| conn.verbose);
        match op {
            ClientOp::Connect(connect) => {
                if let Some(token) = &self.token
                    && connect.auth_token.as_deref() != Some(token.as_str())
                {
                    send_err(tx, "Authorization Violation");
                    return false;
                }
                if let Some(conn) = routing.conns.get_mut(&id) {
                    conn.echo = connect.echo;
                    conn.verbose = connect.verbose;
                }
                self.connects.fetch_add(1, Ordering::SeqCst);
                if connect.verbose {
                    send_op(tx, ServerOp::Ok);
                }
            }
            ClientOp::Ping => {
                if self.answer_pings.load(Ordering::SeqCst) {
                    send_op(tx, ServerOp::Pong);
                }
            }
            ClientOp::Pong => {}
            ClientOp::Sub {
                subject,
                queue_group,
                sid,
            } => {
                if tern_subject::validate_pattern(&subject).is_err() {
                    send_err(tx, "Invalid Subject");
                    return true;
                }
                routing
                    .subs
                    .retain(|sub| !(sub.conn == id && sub.sid == sid));
                routing.subs.push(ServerSub {
                    conn: id,
                    sid,
                    subject,
                    queue: queue_group,
                    max: None,
                    delivered: 0,
                });
                if verbose {
                    send_op(tx, ServerOp::Ok);
                }
            }
            ClientOp::Unsub { sid, max } => {
                routing.unsubscribe(id, sid, max);
                if verbose {
                    send_op(tx, ServerOp::Ok);
                }
            }
            ClientOp::Pub {
                subject,
                reply_to,
                payload,
            } => {
                if tern_subject::validate_subject(&subject).is_err() {
                    send_err(tx, "Invalid Subject");
                    return true;
                }
                routing.route(id, &subject, reply_to.as_deref(), &payload);
                if verbose {
                    send_op(tx, ServerOp::Ok);
                }
            }
        }
        true
    }
}

impl Routing {
    fn remove_conn(&mut self, id: u64) {
        self.conns.remove(&id);
        self.subs.retain(|sub| sub.conn != id);
    }

    fn unsubscribe(&mut self, conn: u64, sid: Sid, max: Option<u64>) {
        let Some(index) = self
            .subs
            .iter()
            .position(|sub| sub.conn == conn && sub.sid == sid)
        else {
            return;
        };
        match max {
            Some(max) if self.subs[index].delivered < max => self.subs[index].max = Some(max),
            _ => {
                self.subs.remove(index);
            }
        }
    }

    fn route(&mut self, from: u64, subject: &str, reply_to: Option<&str>, payload: &Bytes) {
        let mut targets = Vec::new();
        let mut groups: HashMap<&str, Vec<usize>> = HashMap::new();
        for (index, sub) in self.subs.iter().enumerate() {
            if !tern_subject::matches(&sub.subject, subject) {
                continue;
            }
            if sub.conn == from && !self.conns.get(&from).is_some_and(|conn| conn.echo) {
                continue;
            }
            match &sub.queue {
                Some(queue) => groups.entry(queue.as_str()).or_default().push(index),
                None => targets.push(index),
            }
        }
        // Sort so the round-robin pick is stable across HashMap orderings.
        let mut groups: Vec<(&str, Vec<usize>)> = groups.into_iter().collect();
        groups.sort_by(|a, b| a.0.cmp(b.0));
        for (_, members) in groups {
            targets.push(members[self.queue_cursor % members.len()]);
        }
        self.queue_cursor = self.queue_cursor.wrapping_add(1);
        targets.sort_unstable();

        for index in &targets {
            let sub = &mut self.subs[*index];
            sub.delivered += 1;
            let Some(conn) = self.conns.get(&sub.conn) else {
                continue;
            };
            send_op(
                &conn.tx,
                ServerOp::Msg(Msg {
                    subject: subject.to_string(),
                    sid: sub.sid,
                    reply_to: reply_to.map(str::to_string),
                    payload: payload.clone(),
                }),
            );
        }
        self.subs
            .retain(|sub| sub.max.is_none_or(|max| sub.delivered < max));
    }
}
