// Async client for the tern publish/subscribe text protocol.
//
// Threading model: one connection task owns the socket writer and runs
// connect/reconnect, one reader task per socket decodes frames, and one
// dispatch task per client runs subscription handlers in wire order. The
// public `Client` only enqueues commands, so its non-async methods are safe
// to call from inside handlers.
#[macro_use]
mod macros;

pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod tls;

pub use client::client::{Client, WeakClient};
pub use client::registry::{Handler, Message, SubscribeOptions};
pub use client::request::{INBOX_PREFIX, RequestOptions};
pub use client::subscription::Subscription;
pub use config::{ClientConfig, ReconnectPolicy, TlsOptions};
pub use error::{Error, Result, TlsError};
pub use events::{ClientEvent, ConnectionState};
pub use tern_wire::{ServerInfo, Sid};
