// Text protocol framing for tern.
//
// Every operation is an ASCII control line terminated by CRLF. PUB and MSG
// are followed by a byte-counted payload and a second CRLF. Both directions
// encode and decode so the same crate serves clients and test servers.
use bytes::{Buf, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;

pub const CRLF: &[u8] = b"\r\n";
/// Longest control line accepted before a CRLF shows up.
pub const MAX_CONTROL_LINE: usize = 4096;
pub const DEFAULT_MAX_PAYLOAD: usize = 1024 * 1024;
pub const PROTOCOL_VERSION: u8 = 1;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("control line exceeds {MAX_CONTROL_LINE} bytes ({0} buffered)")]
    ControlLineTooLong(usize),
    #[error("unknown protocol operation: {0:?}")]
    UnknownOp(String),
    #[error("expected {expected}, got {got}")]
    UnexpectedOp {
        expected: &'static str,
        got: &'static str,
    },
    #[error("invalid arguments for {op}: {line:?}")]
    InvalidArgs { op: &'static str, line: String },
    #[error("invalid number: {0:?}")]
    InvalidNumber(String),
    #[error("payload of {size} bytes exceeds maximum of {max}")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("payload not terminated by CRLF")]
    MissingPayloadTerminator,
    #[error("control line is not valid UTF-8")]
    InvalidUtf8,
    #[error("failed to serialize {0}")]
    Serialize(&'static str, #[source] serde_json::Error),
    #[error("failed to parse INFO/CONNECT json")]
    Deserialize(#[source] serde_json::Error),
}

/// Subscription identifier, unique per connection.
///
/// ```
/// use tern_wire::Sid;
///
/// let sid: Sid = "42".parse().expect("sid");
/// assert_eq!(sid, Sid(42));
/// assert_eq!(sid.to_string(), "42");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Sid(pub u64);

impl fmt::Display for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Sid {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self> {
        parse_number(input).map(Sid)
    }
}

/// Server metadata sent in INFO, once on connect and again on config changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerInfo {
    pub server_id: String,
    pub server_name: String,
    pub version: String,
    pub proto: i32,
    pub host: String,
    pub port: u16,
    pub max_payload: usize,
    pub tls_required: bool,
    pub tls_verify: bool,
    pub tls_available: bool,
    pub auth_required: bool,
    pub headers: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub connect_urls: Vec<String>,
}

impl Default for ServerInfo {
    fn default() -> Self {
        Self {
            server_id: String::new(),
            server_name: String::new(),
            version: String::new(),
            proto: i32::from(PROTOCOL_VERSION),
            host: String::new(),
            port: 0,
            max_payload: DEFAULT_MAX_PAYLOAD,
            tls_required: false,
            tls_verify: false,
            tls_available: false,
            auth_required: false,
            headers: false,
            connect_urls: Vec::new(),
        }
    }
}

/// Client options sent in CONNECT after INFO (and TLS, if any).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectInfo {
    pub verbose: bool,
    pub pedantic: bool,
    pub tls_required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub lang: String,
    pub version: String,
    pub protocol: u8,
    pub echo: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pass: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

impl Default for ConnectInfo {
    fn default() -> Self {
        Self {
            verbose: false,
            pedantic: false,
            tls_required: false,
            name: None,
            lang: "rust".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            protocol: PROTOCOL_VERSION,
            echo: true,
            user: None,
            pass: None,
            auth_token: None,
        }
    }
}

/// A delivered message (the MSG frame).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Msg {
    pub subject: String,
    pub sid: Sid,
    pub reply_to: Option<String>,
    pub payload: Bytes,
}

/// Operations sent by a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientOp {
    Connect(Box<ConnectInfo>),
    Pub {
        subject: String,
        reply_to: Option<String>,
        payload: Bytes,
    },
    Sub {
        subject: String,
        queue_group: Option<String>,
        sid: Sid,
    },
    Unsub {
        sid: Sid,
        max: Option<u64>,
    },
    Ping,
    Pong,
}

/// Operations sent by a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerOp {
    Info(Box<ServerInfo>),
    Msg(Msg),
    Ok,
    Err(String),
    Ping,
    Pong,
}

impl ClientOp {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connect(_) => "CONNECT",
            Self::Pub { .. } => "PUB",
            Self::Sub { .. } => "SUB",
            Self::Unsub { .. } => "UNSUB",
            Self::Ping => "PING",
            Self::Pong => "PONG",
        }
    }

    /// Append the wire form of this operation to `buf`.
    ///
    /// ```
    /// use bytes::{Bytes, BytesMut};
    /// use tern_wire::ClientOp;
    ///
    /// let mut buf = BytesMut::new();
    /// ClientOp::Pub {
    ///     subject: "foo".to_string(),
    ///     reply_to: Some("_INBOX.1".to_string()),
    ///     payload: Bytes::from_static(b"hi"),
    /// }
    /// .encode(&mut buf)
    /// .expect("encode");
    /// assert_eq!(&buf[..], b"PUB foo _INBOX.1 2\r\nhi\r\n");
    /// ```
    pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        match self {
            Self::Connect(info) => {
                let json =
                    serde_json::to_vec(info).map_err(|err| Error::Serialize("CONNECT", err))?;
                buf.extend_from_slice(b"CONNECT ");
                buf.extend_from_slice(&json);
                buf.extend_from_slice(CRLF);
            }
            Self::Pub {
                subject,
                reply_to,
                payload,
            } => {
                buf.reserve(subject.len() + payload.len() + 32);
                buf.extend_from_slice(b"PUB ");
                buf.extend_from_slice(subject.as_bytes());
                if let Some(reply_to) = reply_to {
                    buf.extend_from_slice(b" ");
                    buf.extend_from_slice(reply_to.as_bytes());
                }
                put_len_line(buf, payload.len());
                buf.extend_from_slice(payload);
                buf.extend_from_slice(CRLF);
            }
            Self::Sub {
                subject,
                queue_group,
                sid,
            } => {
                buf.extend_from_slice(b"SUB ");
                buf.extend_from_slice(subject.as_bytes());
                if let Some(queue_group) = queue_group {
                    buf.extend_from_slice(b" ");
                    buf.extend_from_slice(queue_group.as_bytes());
                }
                put_number_line(buf, sid.0);
            }
            Self::Unsub { sid, max } => {
                buf.extend_from_slice(b"UNSUB ");
                buf.extend_from_slice(sid.0.to_string().as_bytes());
                match max {
                    Some(max) => put_number_line(buf, *max),
                    None => buf.extend_from_slice(CRLF),
                }
            }
            Self::Ping => buf.extend_from_slice(b"PING\r\n"),
            Self::Pong => buf.extend_from_slice(b"PONG\r\n"),
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }
}

impl ServerOp {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Info(_) => "INFO",
            Self::Msg(_) => "MSG",
            Self::Ok => "+OK",
            Self::Err(_) => "-ERR",
            Self::Ping => "PING",
            Self::Pong => "PONG",
        }
    }

    /// Append the wire form of this operation to `buf`.
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use tern_wire::ServerOp;
    ///
    /// let mut buf = BytesMut::new();
    /// ServerOp::Err("Unknown Protocol Operation".to_string())
    ///     .encode(&mut buf)
    ///     .expect("encode");
    /// assert_eq!(&buf[..], b"-ERR 'Unknown Protocol Operation'\r\n");
    /// ```
    pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        match self {
            Self::Info(info) => {
                let json =
                    serde_json::to_vec(info).map_err(|err| Error::Serialize("INFO", err))?;
                buf.extend_from_slice(b"INFO ");
                buf.extend_from_slice(&json);
                buf.extend_from_slice(CRLF);
            }
            Self::Msg(msg) => {
                buf.reserve(msg.subject.len() + msg.payload.len() + 48);
                buf.extend_from_slice(b"MSG ");
                buf.extend_from_slice(msg.subject.as_bytes());
                buf.extend_from_slice(b" ");
                buf.extend_from_slice(msg.sid.0.to_string().as_bytes());
                if let Some(reply_to) = &msg.reply_to {
                    buf.extend_from_slice(b" ");
                    buf.extend_from_slice(reply_to.as_bytes());
                }
                put_len_line(buf, msg.payload.len());
                buf.extend_from_slice(&msg.payload);
                buf.extend_from_slice(CRLF);
            }
            Self::Ok => buf.extend_from_slice(b"+OK\r\n"),
            Self::Err(message) => {
                buf.extend_from_slice(b"-ERR '");
                buf.extend_from_slice(message.as_bytes());
                buf.extend_from_slice(b"'\r\n");
            }
            Self::Ping => buf.extend_from_slice(b"PING\r\n"),
            Self::Pong => buf.extend_from_slice(b"PONG\r\n"),
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }
}

fn put_len_line(buf: &mut BytesMut, len: usize) {
    buf.extend_from_slice(b" ");
    buf.extend_from_slice(len.to_string().as_bytes());
    buf.extend_from_slice(CRLF);
}

fn put_number_line(buf: &mut BytesMut, value: u64) {
    buf.extend_from_slice(b" ");
    buf.extend_from_slice(value.to_string().as_bytes());
    buf.extend_from_slice(CRLF);
}

/// Takes one complete frame off the front of a buffer.
///
/// Implementations return `Ok(None)` without consuming anything until the
/// whole frame (control line plus any declared payload) is buffered.
pub trait Decode: Sized {
    fn decode(buf: &mut BytesMut, max_payload: usize) -> Result<Option<Self>>;
}

impl Decode for ServerOp {
    fn decode(buf: &mut BytesMut, max_payload: usize) -> Result<Option<Self>> {
        let Some(line_end) = find_line_end(buf)? else {
            return Ok(None);
        };
        let line = control_line(buf, line_end)?;
        let (verb, rest) = split_verb(line);

        if verb.eq_ignore_ascii_case("MSG") {
            let header = MsgHeader::parse(rest, max_payload)?;
            return Ok(take_payload(buf, line_end, header.len)?.map(|payload| {
                ServerOp::Msg(Msg {
                    subject: header.subject,
                    sid: header.sid,
                    reply_to: header.reply_to,
                    payload,
                })
            }));
        }

        let op = if verb.eq_ignore_ascii_case("PING") {
            ServerOp::Ping
        } else if verb.eq_ignore_ascii_case("PONG") {
            ServerOp::Pong
        } else if verb.eq_ignore_ascii_case("+OK") {
            ServerOp::Ok
        } else if verb.eq_ignore_ascii_case("-ERR") {
            ServerOp::Err(rest.trim().trim_matches('\'').to_string())
        } else if verb.eq_ignore_ascii_case("INFO") {
            let info: ServerInfo =
                serde_json::from_str(rest.trim()).map_err(Error::Deserialize)?;
            ServerOp::Info(Box::new(info))
        } else {
            return Err(Error::UnknownOp(line.to_string()));
        };
        buf.advance(line_end + CRLF.len());
        Ok(Some(op))
    }
}

impl Decode for ClientOp {
    fn decode(buf: &mut BytesMut, max_payload: usize) -> Result<Option<Self>> {
        let Some(line_end) = find_line_end(buf)? else {
            return Ok(None);
        };
        let line = control_line(buf, line_end)?;
        let (verb, rest) = split_verb(line);

        if verb.eq_ignore_ascii_case("PUB") {
            let header = PubHeader::parse(rest, max_payload)?;
            return Ok(
                take_payload(buf, line_end, header.len)?.map(|payload| ClientOp::Pub {
                    subject: header.subject,
                    reply_to: header.reply_to,
                    payload,
                }),
            );
        }

        let op = if verb.eq_ignore_ascii_case("PING") {
            ClientOp::Ping
        } else if verb.eq_ignore_ascii_case("PONG") {
            ClientOp::Pong
        } else if verb.eq_ignore_ascii_case("SUB") {
            let args: Vec<&str> = rest.split_ascii_whitespace().collect();
            let (subject, queue_group, sid) = match args.as_slice() {
                [subject, sid] => (*subject, None, *sid),
                [subject, queue, sid] => (*subject, Some(*queue), *sid),
                _ => return Err(invalid_args("SUB", line)),
            };
            ClientOp::Sub {
                subject: subject.to_string(),
                queue_group: queue_group.map(str::to_string),
                sid: sid.parse()?,
            }
        } else if verb.eq_ignore_ascii_case("UNSUB") {
            let args: Vec<&str> = rest.split_ascii_whitespace().collect();
            let (sid, max) = match args.as_slice() {
                [sid] => (*sid, None),
                [sid, max] => (*sid, Some(parse_number(max)?)),
                _ => return Err(invalid_args("UNSUB", line)),
            };
            ClientOp::Unsub {
                sid: sid.parse()?,
                max,
            }
        } else if verb.eq_ignore_ascii_case("CONNECT") {
            let info: ConnectInfo =
                serde_json::from_str(rest.trim()).map_err(Error::Deserialize)?;
            ClientOp::Connect(Box::new(info))
        } else {
            return Err(Error::UnknownOp(line.to_string()));
        };
        buf.advance(line_end + CRLF.len());
        Ok(Some(op))
    }
}

struct MsgHeader {
    subject: String,
    sid: Sid,
    reply_to: Option<String>,
    len: usize,
}

impl MsgHeader {
    // MSG <subject> <sid> [reply-to] <#bytes>
    fn parse(rest: &str, max_payload: usize) -> Result<Self> {
        let args: Vec<&str> = rest.split_ascii_whitespace().collect();
        let (subject, sid, reply_to, len) = match args.as_slice() {
            [subject, sid, len] => (*subject, *sid, None, *len),
            [subject, sid, reply_to, len] => (*subject, *sid, Some(*reply_to), *len),
            _ => return Err(invalid_args("MSG", rest)),
        };
        Ok(Self {
            subject: subject.to_string(),
            sid: sid.parse()?,
            reply_to: reply_to.map(str::to_string),
            len: checked_len(len, max_payload)?,
        })
    }
}

struct PubHeader {
    subject: String,
    reply_to: Option<String>,
    len: usize,
}

impl PubHeader {
    // PUB <subject> [reply-to] <#bytes>
    fn parse(rest: &str, max_payload: usize) -> Result<Self> {
        let args: Vec<&str> = rest.split_ascii_whitespace().collect();
        let (subject, reply_to, len) = match args.as_slice() {
            [subject, len] => (*subject, None, *len),
            [subject, reply_to, len] => (*subject, Some(*reply_to), *len),
            _ => return Err(invalid_args("PUB", rest)),
        };
        Ok(Self {
            subject: subject.to_string(),
            reply_to: reply_to.map(str::to_string),
            len: checked_len(len, max_payload)?,
        })
    }
}

fn find_line_end(buf: &BytesMut) -> Result<Option<usize>> {
    match buf.windows(CRLF.len()).position(|window| window == CRLF) {
        Some(end) if end > MAX_CONTROL_LINE => Err(Error::ControlLineTooLong(end)),
        Some(end) => Ok(Some(end)),
        None if buf.len() > MAX_CONTROL_LINE + 1 => Err(Error::ControlLineTooLong(buf.len())),
        None => Ok(None),
    }
}

fn control_line(buf: &BytesMut, line_end: usize) -> Result<&str> {
    std::str::from_utf8(&buf[..line_end]).map_err(|_| Error::InvalidUtf8)
}

fn split_verb(line: &str) -> (&str, &str) {
    let line = line.trim_start();
    match line.split_once([' ', '\t']) {
        Some((verb, rest)) => (verb, rest),
        None => (line, ""),
    }
}

// Consume the control line, payload and trailing CRLF once all are buffered.
fn take_payload(buf: &mut BytesMut, line_end: usize, len: usize) -> Result<Option<Bytes>> {
    let payload_start = line_end + CRLF.len();
    let payload_end = payload_start + len;
    let total = payload_end + CRLF.len();
    if buf.len() < total {
        return Ok(None);
    }
    if &buf[payload_end..total] != CRLF {
        return Err(Error::MissingPayloadTerminator);
    }
    buf.advance(payload_start);
    let payload = buf.split_to(len).freeze();
    buf.advance(CRLF.len());
    Ok(Some(payload))
}

fn checked_len(value: &str, max_payload: usize) -> Result<usize> {
    let size = usize::try_from(parse_number(value)?)
        .map_err(|_| Error::InvalidNumber(value.to_string()))?;
    if size > max_payload {
        return Err(Error::PayloadTooLarge {
            size,
            max: max_payload,
        });
    }
    Ok(size)
}

fn parse_number(value: &str) -> Result<u64> {
    value
        .parse::<u64>()
        .map_err(|_| Error::InvalidNumber(value.to_string()))
}

fn invalid_args(op: &'static str, line: &str) -> Error {
    Error::InvalidArgs {
        op,
        line: line.to_string(),
    }
}

/// Streaming decoder fed with arbitrary byte chunks.
///
/// ```
/// use tern_wire::{ServerDecoder, ServerOp};
///
/// let mut decoder = ServerDecoder::new();
/// decoder.extend(b"MSG foo 1 5\r\nhel");
/// assert!(decoder.decode().expect("decode").is_none());
/// decoder.extend(b"lo\r\nPING\r\n");
/// match decoder.decode().expect("decode") {
///     Some(ServerOp::Msg(msg)) => assert_eq!(&msg.payload[..], b"hello"),
///     other => panic!("unexpected {other:?}"),
/// }
/// assert_eq!(decoder.decode().expect("decode"), Some(ServerOp::Ping));
/// ```
#[derive(Debug)]
pub struct Decoder<O> {
    buf: BytesMut,
    max_payload: usize,
    _op: PhantomData<fn() -> O>,
}

pub type ServerDecoder = Decoder<ServerOp>;
pub type ClientDecoder = Decoder<ClientOp>;

impl<O: Decode> Decoder<O> {
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_PAYLOAD)
    }

    pub fn with_max_payload(max_payload: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(64 * 1024),
            max_payload,
            _op: PhantomData,
        }
    }

    pub fn set_max_payload(&mut self, max_payload: usize) {
        self.max_payload = max_payload;
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Direct access for `AsyncReadExt::read_buf`.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn decode(&mut self) -> Result<Option<O>> {
        O::decode(&mut self.buf, self.max_payload)
    }
}

impl<O: Decode> Default for Decoder<O> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_server(input: &[u8]) -> Result<Option<ServerOp>> {
        let mut decoder = ServerDecoder::new();
        decoder.extend(input);
        decoder.decode()
    }

    #[test]
    fn encodes_client_ops() {
        let sub = ClientOp::Sub {
            subject: "foo.*".to_string(),
            queue_group: Some("workers".to_string()),
            sid: Sid(7),
        };
        assert_eq!(&sub.to_bytes().expect("sub")[..], b"SUB foo.* workers 7\r\n");

        let sub = ClientOp::Sub {
            subject: "foo".to_string(),
            queue_group: None,
            sid: Sid(1),
        };
        assert_eq!(&sub.to_bytes().expect("sub")[..], b"SUB foo 1\r\n");

        let unsub = ClientOp::Unsub {
            sid: Sid(3),
            max: Some(5),
        };
        assert_eq!(&unsub.to_bytes().expect("unsub")[..], b"UNSUB 3 5\r\n");
        let unsub = ClientOp::Unsub {
            sid: Sid(3),
            max: None,
        };
        assert_eq!(&unsub.to_bytes().expect("unsub")[..], b"UNSUB 3\r\n");

        let publish = ClientOp::Pub {
            subject: "foo".to_string(),
            reply_to: None,
            payload: Bytes::new(),
        };
        assert_eq!(&publish.to_bytes().expect("pub")[..], b"PUB foo 0\r\n\r\n");
        assert_eq!(&ClientOp::Ping.to_bytes().expect("ping")[..], b"PING\r\n");
        assert_eq!(&ClientOp::Pong.to_bytes().expect("pong")[..], b"PONG\r\n");
    }

    #[test]
    fn connect_carries_json_options() {
        let op = ClientOp::Connect(Box::new(ConnectInfo {
            name: Some("svc".to_string()),
            ..ConnectInfo::default()
        }));
        let bytes = op.to_bytes().expect("connect");
        assert!(bytes.starts_with(b"CONNECT {"));
        assert!(bytes.ends_with(b"}\r\n"));

        let mut decoder = ClientDecoder::new();
        decoder.extend(&bytes);
        assert_eq!(decoder.decode().expect("decode"), Some(op));
    }

    #[test]
    fn decodes_msg_with_and_without_reply() {
        match decode_server(b"MSG foo.bar 9 11\r\nHello World\r\n").expect("decode") {
            Some(ServerOp::Msg(msg)) => {
                assert_eq!(msg.subject, "foo.bar");
                assert_eq!(msg.sid, Sid(9));
                assert_eq!(msg.reply_to, None);
                assert_eq!(&msg.payload[..], b"Hello World");
            }
            other => panic!("unexpected {other:?}"),
        }
        match decode_server(b"MSG foo 1 _INBOX.abc 2\r\nok\r\n").expect("decode") {
            Some(ServerOp::Msg(msg)) => {
                assert_eq!(msg.reply_to.as_deref(), Some("_INBOX.abc"));
                assert_eq!(&msg.payload[..], b"ok");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn payload_may_contain_crlf() {
        match decode_server(b"MSG foo 1 4\r\n\r\n\r\n\r\n").expect("decode") {
            Some(ServerOp::Msg(msg)) => assert_eq!(&msg.payload[..], b"\r\n\r\n"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn decodes_control_frames() {
        assert_eq!(decode_server(b"PING\r\n").expect("ping"), Some(ServerOp::Ping));
        assert_eq!(decode_server(b"pong\r\n").expect("pong"), Some(ServerOp::Pong));
        assert_eq!(decode_server(b"+OK\r\n").expect("ok"), Some(ServerOp::Ok));
        assert_eq!(
            decode_server(b"-ERR 'Authorization Violation'\r\n").expect("err"),
            Some(ServerOp::Err("Authorization Violation".to_string()))
        );
    }

    #[test]
    fn decodes_info_with_unknown_fields() {
        let input = br#"INFO {"server_id":"abc","proto":1,"max_payload":2048,"tls_required":true,"jetstream":false}"#;
        let mut frame = input.to_vec();
        frame.extend_from_slice(CRLF);
        match decode_server(&frame).expect("info") {
            Some(ServerOp::Info(info)) => {
                assert_eq!(info.server_id, "abc");
                assert_eq!(info.max_payload, 2048);
                assert!(info.tls_required);
                assert!(!info.tls_verify);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn info_defaults_max_payload() {
        match decode_server(b"INFO {}\r\n").expect("info") {
            Some(ServerOp::Info(info)) => assert_eq!(info.max_payload, DEFAULT_MAX_PAYLOAD),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_operation() {
        let err = decode_server(b"BOGUS 1 2\r\n").expect_err("unknown");
        assert!(matches!(err, Error::UnknownOp(line) if line == "BOGUS 1 2"));
    }

    #[test]
    fn rejects_oversized_payload() {
        let mut decoder = ServerDecoder::with_max_payload(4);
        decoder.extend(b"MSG foo 1 5\r\n");
        let err = decoder.decode().expect_err("too large");
        assert!(matches!(err, Error::PayloadTooLarge { size: 5, max: 4 }));
    }

    #[test]
    fn rejects_missing_payload_terminator() {
        let err = decode_server(b"MSG foo 1 2\r\nokXX").expect_err("terminator");
        assert!(matches!(err, Error::MissingPayloadTerminator));
    }

    #[test]
    fn rejects_runaway_control_line() {
        let mut decoder = ServerDecoder::new();
        decoder.extend(&vec![b'A'; MAX_CONTROL_LINE + 2]);
        assert!(matches!(
            decoder.decode(),
            Err(Error::ControlLineTooLong(_))
        ));
    }

    #[test]
    fn rejects_bad_msg_arguments() {
        assert!(matches!(
            decode_server(b"MSG foo\r\n"),
            Err(Error::InvalidArgs { op: "MSG", .. })
        ));
        assert!(matches!(
            decode_server(b"MSG foo x 1\r\na\r\n"),
            Err(Error::InvalidNumber(_))
        ));
    }

    #[test]
    fn decodes_client_side_ops() {
        let mut decoder = ClientDecoder::new();
        decoder.extend(b"SUB foo q 1\r\nUNSUB 1 3\r\nPUB bar r 3\r\nabc\r\n");
        assert_eq!(
            decoder.decode().expect("sub"),
            Some(ClientOp::Sub {
                subject: "foo".to_string(),
                queue_group: Some("q".to_string()),
                sid: Sid(1),
            })
        );
        assert_eq!(
            decoder.decode().expect("unsub"),
            Some(ClientOp::Unsub {
                sid: Sid(1),
                max: Some(3),
            })
        );
        assert_eq!(
            decoder.decode().expect("pub"),
            Some(ClientOp::Pub {
                subject: "bar".to_string(),
                reply_to: Some("r".to_string()),
                payload: Bytes::from_static(b"abc"),
            })
        );
        assert_eq!(decoder.decode().expect("empty"), None);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn server_ops_survive_encode_decode() {
        let ops = vec![
            ServerOp::Info(Box::new(ServerInfo {
                server_id: "srv".to_string(),
                tls_verify: true,
                ..ServerInfo::default()
            })),
            ServerOp::Msg(Msg {
                subject: "a.b".to_string(),
                sid: Sid(12),
                reply_to: Some("_INBOX.x.1".to_string()),
                payload: Bytes::from_static(b"\x00\x01binary"),
            }),
            ServerOp::Err("Stale Connection".to_string()),
            ServerOp::Ok,
        ];
        let mut buf = BytesMut::new();
        for op in &ops {
            op.encode(&mut buf).expect("encode");
        }
        let mut decoder = ServerDecoder::new();
        decoder.extend(&buf);
        for op in ops {
            assert_eq!(decoder.decode().expect("decode"), Some(op));
        }
    }
}
