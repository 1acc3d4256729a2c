// Request/reply over per-client inbox subjects.
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tern_wire::Sid;
use tokio::sync::oneshot;

use super::client::Client;
use super::registry::{Message, SubscribeOptions};
use crate::error::{Error, Result};

pub const INBOX_PREFIX: &str = "_INBOX.";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestOptions {
    /// Replies to accept before the inbox subscription expires; defaults to 1.
    pub max: Option<u64>,
}

pub(crate) struct InboxGenerator {
    prefix: String,
    counter: AtomicU64,
}

impl InboxGenerator {
    pub(crate) fn new() -> Self {
        Self {
            prefix: format!("{INBOX_PREFIX}{}", uuid::Uuid::new_v4().simple()),
            counter: AtomicU64::new(0),
        }
    }

    pub(crate) fn next(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}.{n}", self.prefix)
    }
}

impl Client {
    /// A fresh reply subject unique to this client.
    pub fn new_inbox(&self) -> String {
        self.shared().inbox.next()
    }

    /// Publish with a fresh inbox as reply-to; `handler` sees up to
    /// `options.max` replies, after which the inbox subscription expires.
    ///
    /// Returns the inbox subscription's sid so the caller can cancel early.
    pub fn request<F>(
        &self,
        subject: &str,
        payload: impl Into<Bytes>,
        options: RequestOptions,
        handler: F,
    ) -> Result<Sid>
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        let payload = payload.into();
        tern_subject::validate_subject(subject)?;
        self.check_payload(&payload)?;
        let inbox = self.new_inbox();
        let max = options.max.unwrap_or(1).max(1);
        let sid = self.subscribe(&inbox, SubscribeOptions::max(max), handler)?;
        if let Err(err) = self.publish_request(subject, &inbox, payload) {
            let _ = self.unsubscribe(sid, None);
            return Err(err);
        }
        Ok(sid)
    }

    /// Single-reply request that gives up after `timeout`.
    pub async fn request_timeout(
        &self,
        subject: &str,
        payload: impl Into<Bytes>,
        timeout: Duration,
    ) -> Result<Message> {
        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let sid = self.request(
            subject,
            payload,
            RequestOptions { max: Some(1) },
            move |message| {
                if let Some(tx) = tx.lock().take() {
                    let _ = tx.send(message);
                }
            },
        )?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(message)) => Ok(message),
            // Handler dropped without a reply: the client closed.
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Err(_) => {
                let _ = self.unsubscribe(sid, None);
                Err(Error::Timeout)
            }
        }
    }
}
