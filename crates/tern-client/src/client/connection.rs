// Connection task for one client.
//
// The task owns the socket's write half for the lifetime of each connection
// and is the only writer: façade calls enqueue `Command`s and this loop
// encodes every ready command into one buffer before a single write. Reads
// happen on a separate task that forwards decoded frames to the dispatch
// task; its exit (EOF, I/O error, protocol error, fatal -ERR) ends the
// session. Connect, TLS upgrade, handshake, and reconnect with backoff all
// run here so state transitions have a single owner.
use bytes::BytesMut;
use std::io;
use std::sync::Arc;
use tern_wire::{ClientOp, ConnectInfo, ServerDecoder, ServerInfo, ServerOp};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at, sleep, timeout};
use tracing::{debug, info, warn};

use super::{Command, PongWaiter, Shared};
use crate::config::TlsOptions;
use crate::error::{Error, Result, TlsError, is_fatal_server_error};
use crate::events::{ClientEvent, ConnectionState};
use crate::tls;

const WRITE_BUFFER_BYTES: usize = 64 * 1024;

pub(crate) trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

type BoxedTransport = Box<dyn Transport>;

struct Session {
    transport: BoxedTransport,
    decoder: ServerDecoder,
}

enum SessionEnd {
    Closed,
    Failed(Error),
}

pub(crate) async fn run_connection(
    shared: Arc<Shared>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    frames: mpsc::Sender<ServerOp>,
    ready: oneshot::Sender<Result<()>>,
) {
    let policy = shared.config.reconnect.clone();
    let mut ready = Some(ready);
    let mut attempt: u32 = 0;

    loop {
        if attempt > 0 {
            shared.set_state(ConnectionState::Reconnecting);
            shared.events.emit(ClientEvent::Reconnecting { attempt });
            let delay = policy.backoff(attempt);
            debug!(attempt, delay_ms = delay.as_millis() as u64, "waiting to reconnect");
            tokio::select! {
                _ = shared.shutdown.cancelled() => break,
                _ = sleep(delay) => {}
            }
        }

        let established = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            result = establish(&shared) => result,
        };
        let session = match established {
            Ok(session) => session,
            Err(err) => {
                let initial = ready.is_some();
                let retry = policy.enabled
                    && err.is_transient()
                    && (!initial || policy.retry_on_initial_connect)
                    && !policy.exhausted(attempt);
                warn!(error = %err, attempt, retry, "connect attempt failed");
                if !retry {
                    match ready.take() {
                        Some(tx) => {
                            let _ = tx.send(Err(err));
                        }
                        None => shared.events.error(err),
                    }
                    break;
                }
                attempt += 1;
                continue;
            }
        };

        shared.set_state(ConnectionState::Connected);
        match ready.take() {
            Some(tx) => {
                info!(address = %shared.config.address(), "connected");
                shared.events.emit(ClientEvent::Connect);
                let _ = tx.send(Ok(()));
            }
            None => {
                info!(address = %shared.config.address(), "reconnected");
                t_counter!("tern_client_reconnects_total").increment(1);
                shared.events.emit(ClientEvent::Reconnect);
            }
        }

        let Session { transport, decoder } = session;
        let (read_half, mut write_half) = tokio::io::split(transport);
        let reader = tokio::spawn(read_loop(read_half, decoder, frames.clone()));
        match write_loop(&shared, &mut write_half, &mut commands, reader).await {
            SessionEnd::Closed => break,
            SessionEnd::Failed(err) => {
                let transient = err.is_transient();
                warn!(error = %err, transient, "connection lost");
                shared.events.error(err);
                shared.events.emit(ClientEvent::Disconnect);
                if transient && policy.enabled && !shared.shutdown.is_cancelled() {
                    attempt = 1;
                    continue;
                }
                break;
            }
        }
    }

    finish(&shared, &mut commands, ready);
}

fn finish(
    shared: &Shared,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    ready: Option<oneshot::Sender<Result<()>>>,
) {
    shared.set_state(ConnectionState::Closing);
    shared.shutdown.cancel();
    shared.fail_pong_waiters();
    commands.close();
    while let Ok(command) = commands.try_recv() {
        if let Command::Flush(tx) = command {
            let _ = tx.send(Err(Error::ConnectionClosed));
        }
    }
    let dropped = shared.registry.lock().clear();
    shared.set_state(ConnectionState::Closed);
    info!(dropped_subscriptions = dropped, "connection closed");
    shared.events.emit(ClientEvent::Closed);
    if let Some(tx) = ready {
        let _ = tx.send(Err(Error::ConnectionClosed));
    }
}

async fn establish(shared: &Shared) -> Result<Session> {
    let config = &shared.config;
    let address = config.address();
    shared.set_state(ConnectionState::Connecting);
    debug!(%address, "connecting");
    let tcp = timeout(config.connect_timeout, TcpStream::connect(&address))
        .await
        .map_err(|_| Error::ConnectTimeout)??;
    tcp.set_nodelay(true)?;

    // The server speaks first, in plaintext.
    shared.set_state(ConnectionState::AwaitingInfo);
    let mut tcp = tcp;
    let mut decoder = ServerDecoder::with_max_payload(config.max_frame_bytes);
    let info = timeout(config.connect_timeout, read_info(&mut tcp, &mut decoder))
        .await
        .map_err(|_| Error::ConnectTimeout)??;
    check_tls_requirements(config.tls.as_ref(), &info)?;
    debug!(
        server_id = %info.server_id,
        max_payload = info.max_payload,
        tls_required = info.tls_required,
        "received server info"
    );
    *shared.server_info.lock() = Some(info);

    let (transport, authorized): (BoxedTransport, Option<bool>) = match &config.tls {
        Some(options) => {
            shared.set_state(ConnectionState::TlsHandshaking);
            let upgraded = timeout(
                config.connect_timeout,
                tls::upgrade(options, &config.host, tcp),
            )
            .await
            .map_err(|_| Error::ConnectTimeout)??;
            debug!(authorized = upgraded.authorized, "tls established");
            (Box::new(upgraded.stream), Some(upgraded.authorized))
        }
        None => (Box::new(tcp), None),
    };
    *shared.authorized.lock() = authorized;

    let mut session = Session {
        transport,
        decoder,
    };
    timeout(config.connect_timeout, handshake(shared, &mut session))
        .await
        .map_err(|_| Error::ConnectTimeout)??;
    replay(shared, &mut session.transport).await?;
    Ok(session)
}

fn check_tls_requirements(
    tls: Option<&TlsOptions>,
    info: &ServerInfo,
) -> std::result::Result<(), TlsError> {
    match tls {
        Some(options) => {
            if !(info.tls_required || info.tls_available) {
                return Err(TlsError::ServerNotSecure);
            }
            if info.tls_verify && !options.has_client_cert() {
                return Err(TlsError::ClientCertRequired);
            }
            Ok(())
        }
        None if info.tls_required => Err(TlsError::SecureRequired),
        None => Ok(()),
    }
}

async fn read_frame<R>(reader: &mut R, decoder: &mut ServerDecoder) -> Result<ServerOp>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(op) = decoder.decode()? {
            return Ok(op);
        }
        if reader.read_buf(decoder.buffer_mut()).await? == 0 {
            return Err(Error::Connection(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "server closed the connection during handshake",
            )));
        }
    }
}

async fn read_info<R>(reader: &mut R, decoder: &mut ServerDecoder) -> Result<ServerInfo>
where
    R: AsyncRead + Unpin,
{
    match read_frame(reader, decoder).await? {
        ServerOp::Info(info) => Ok(*info),
        ServerOp::Err(message) => Err(Error::Server(message)),
        other => Err(Error::Protocol(tern_wire::Error::UnexpectedOp {
            expected: "INFO",
            got: other.name(),
        })),
    }
}

// CONNECT then PING; the PONG confirms the server accepted CONNECT.
async fn handshake(shared: &Shared, session: &mut Session) -> Result<()> {
    let config = &shared.config;
    let connect = ConnectInfo {
        verbose: config.verbose,
        pedantic: config.pedantic,
        tls_required: config.tls.is_some(),
        name: config.name.clone(),
        echo: config.echo,
        user: config.user.clone(),
        pass: config.pass.clone(),
        auth_token: config.token.clone(),
        ..ConnectInfo::default()
    };
    let mut buf = BytesMut::new();
    ClientOp::Connect(Box::new(connect)).encode(&mut buf)?;
    ClientOp::Ping.encode(&mut buf)?;
    session.transport.write_all(&buf).await?;
    session.transport.flush().await?;

    let tls = config.tls.is_some();
    loop {
        let op = read_frame(&mut session.transport, &mut session.decoder)
            .await
            .map_err(|err| match err {
                Error::Connection(io_err) if tls => tls::handshake_io_error(io_err),
                other => other,
            })?;
        match op {
            ServerOp::Pong => return Ok(()),
            ServerOp::Ok => {}
            ServerOp::Ping => {
                session.transport.write_all(b"PONG\r\n").await?;
                session.transport.flush().await?;
            }
            ServerOp::Info(info) => *shared.server_info.lock() = Some(*info),
            ServerOp::Err(message) => return Err(Error::Server(message)),
            ServerOp::Msg(msg) => {
                warn!(sid = %msg.sid, subject = %msg.subject, "message before handshake completed");
            }
        }
    }
}

// Re-register live subscriptions and re-issue one PING per flush still
// waiting from the previous connection.
async fn replay<W>(shared: &Shared, writer: &mut W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let subscriptions = shared.registry.lock().snapshot();
    let waiters = shared.retain_flush_waiters();
    if subscriptions.is_empty() && waiters == 0 {
        return Ok(());
    }
    let mut buf = BytesMut::new();
    for sub in &subscriptions {
        ClientOp::Sub {
            subject: sub.subject.clone(),
            queue_group: sub.queue.clone(),
            sid: sub.sid,
        }
        .encode(&mut buf)?;
        if let Some(remaining) = sub.remaining {
            ClientOp::Unsub {
                sid: sub.sid,
                max: Some(remaining),
            }
            .encode(&mut buf)?;
        }
    }
    for _ in 0..waiters {
        ClientOp::Ping.encode(&mut buf)?;
    }
    writer.write_all(&buf).await?;
    writer.flush().await?;
    debug!(
        subscriptions = subscriptions.len(),
        flushes = waiters,
        "replayed state on new connection"
    );
    Ok(())
}

async fn write_loop<W>(
    shared: &Shared,
    writer: &mut W,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    mut reader: JoinHandle<Error>,
) -> SessionEnd
where
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(WRITE_BUFFER_BYTES);
    let mut keepalive = shared.config.ping_interval.map(|period| {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });
    let max_outstanding = shared.config.max_pings_outstanding as usize;

    let end = loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => {
                // Best effort for whatever is already queued.
                while let Ok(command) = commands.try_recv() {
                    encode_command(shared, command, &mut buf);
                }
                if !buf.is_empty() {
                    let _ = write_buffer(writer, &mut buf).await;
                }
                let _ = writer.shutdown().await;
                break SessionEnd::Closed;
            }
            result = &mut reader => {
                let err = match result {
                    Ok(err) => err,
                    Err(join_err) => Error::Connection(io::Error::other(join_err.to_string())),
                };
                break SessionEnd::Failed(err);
            }
            _ = next_tick(&mut keepalive) => {
                if shared.keepalives_outstanding() >= max_outstanding {
                    break SessionEnd::Failed(Error::StaleConnection);
                }
                shared.pongs.lock().push_back(PongWaiter::Keepalive);
                let _ = ClientOp::Ping.encode(&mut buf);
                if let Err(err) = write_buffer(writer, &mut buf).await {
                    break SessionEnd::Failed(err);
                }
            }
            command = commands.recv() => {
                let Some(command) = command else {
                    break SessionEnd::Closed;
                };
                encode_command(shared, command, &mut buf);
                while let Ok(command) = commands.try_recv() {
                    encode_command(shared, command, &mut buf);
                }
                if let Err(err) = write_buffer(writer, &mut buf).await {
                    break SessionEnd::Failed(err);
                }
            }
        }
    };
    reader.abort();
    end
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

fn encode_command(shared: &Shared, command: Command, buf: &mut BytesMut) {
    match command {
        Command::Op(op) => {
            if let ClientOp::Pub { payload, .. } = &op {
                t_counter!("tern_client_msgs_out_total").increment(1);
                t_counter!("tern_client_bytes_out_total").increment(payload.len() as u64);
            }
            if let Err(err) = op.encode(buf) {
                warn!(error = %err, op = op.name(), "dropping operation that failed to encode");
            }
        }
        Command::Flush(tx) => {
            // Queue the waiter before the PING can possibly be answered.
            shared.pongs.lock().push_back(PongWaiter::Flush(tx));
            let _ = ClientOp::Ping.encode(buf);
        }
    }
}

async fn write_buffer<W>(writer: &mut W, buf: &mut BytesMut) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let result = async {
        writer.write_all(buf).await?;
        writer.flush().await
    }
    .await;
    buf.clear();
    result.map_err(Error::Connection)
}

async fn read_loop<R>(
    mut reader: R,
    mut decoder: ServerDecoder,
    frames: mpsc::Sender<ServerOp>,
) -> Error
where
    R: AsyncRead + Unpin,
{
    loop {
        loop {
            match decoder.decode() {
                Ok(Some(ServerOp::Err(message))) if is_fatal_server_error(&message) => {
                    return Error::Server(message);
                }
                Ok(Some(op)) => {
                    if frames.send(op).await.is_err() {
                        return Error::ConnectionClosed;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(error = %err, buffered = decoder.buffered(), "failed to decode server frame");
                    return Error::Protocol(err);
                }
            }
        }
        match reader.read_buf(decoder.buffer_mut()).await {
            Ok(0) => {
                return Error::Connection(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed by server",
                ));
            }
            Ok(_) => {}
            Err(err) => return Error::Connection(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(tls_required: bool, tls_verify: bool) -> ServerInfo {
        ServerInfo {
            tls_required,
            tls_verify,
            ..ServerInfo::default()
        }
    }

    #[test]
    fn tls_requirement_matrix() {
        let tls = TlsOptions::default();
        assert!(matches!(
            check_tls_requirements(Some(&tls), &info(false, false)),
            Err(TlsError::ServerNotSecure)
        ));
        assert!(matches!(
            check_tls_requirements(None, &info(true, false)),
            Err(TlsError::SecureRequired)
        ));
        assert!(matches!(
            check_tls_requirements(Some(&tls), &info(true, true)),
            Err(TlsError::ClientCertRequired)
        ));
        let with_cert = TlsOptions::default().with_client_cert("cert", "key");
        assert!(check_tls_requirements(Some(&with_cert), &info(true, true)).is_ok());
        assert!(check_tls_requirements(None, &info(false, false)).is_ok());
    }

    #[tokio::test]
    async fn read_loop_ends_on_fatal_error() {
        let (mut server, client) = tokio::io::duplex(1024);
        let (frames_tx, mut frames_rx) = mpsc::channel(8);
        let reader = tokio::spawn(read_loop(client, ServerDecoder::new(), frames_tx));
        server
            .write_all(b"PING\r\n-ERR 'Invalid Subject'\r\n-ERR 'Authorization Violation'\r\n")
            .await
            .expect("write");
        let err = reader.await.expect("reader task");
        assert!(matches!(err, Error::Server(message) if message == "Authorization Violation"));
        assert_eq!(frames_rx.recv().await, Some(ServerOp::Ping));
        assert_eq!(
            frames_rx.recv().await,
            Some(ServerOp::Err("Invalid Subject".to_string()))
        );
    }

    #[tokio::test]
    async fn read_loop_reports_eof() {
        let (server, client) = tokio::io::duplex(64);
        let (frames_tx, _frames_rx) = mpsc::channel(8);
        drop(server);
        let err = read_loop(client, ServerDecoder::new(), frames_tx).await;
        assert!(err.is_transient());
    }
}
