// Channel-backed subscriptions for callers that prefer awaiting messages.
use tern_wire::Sid;
use tokio::sync::mpsc;

use super::client::Client;
use super::registry::{Message, SubscribeOptions};
use crate::error::Result;

pub struct Subscription {
    sid: Sid,
    subject: String,
    rx: mpsc::UnboundedReceiver<Message>,
}

impl Subscription {
    pub fn sid(&self) -> Sid {
        self.sid
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Next delivered message, or `None` once the subscription is gone
    /// (unsubscribed, expired, or the client closed) and drained.
    pub async fn next_message(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    pub fn try_next_message(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }
}

impl Client {
    pub fn subscribe_channel(
        &self,
        subject: &str,
        options: SubscribeOptions,
    ) -> Result<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let sid = self.subscribe(subject, options, move |message| {
            if tx.send(message).is_err() {
                t_counter!("tern_client_dropped_msgs_total").increment(1);
            }
        })?;
        Ok(Subscription {
            sid,
            subject: subject.to_string(),
            rx,
        })
    }
}
