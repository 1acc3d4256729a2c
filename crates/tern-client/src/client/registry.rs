// Subscription registry: sid allocation, auto-unsubscribe accounting, and
// the lookup a MSG frame needs to reach its handler.
use std::collections::HashMap;
use std::sync::Arc;
use tern_subject::SubjectPattern;
use tern_wire::{Msg, Sid};
use tracing::warn;

/// A delivered message.
pub type Message = Msg;

/// Callback invoked on the dispatch task for every delivered message.
pub type Handler = Arc<dyn Fn(Message) + Send + Sync>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Queue group; the server delivers each message to one member.
    pub queue: Option<String>,
    /// Remove the subscription after this many deliveries.
    pub max: Option<u64>,
}

impl SubscribeOptions {
    pub fn queue(group: impl Into<String>) -> Self {
        Self {
            queue: Some(group.into()),
            max: None,
        }
    }

    pub fn max(max: u64) -> Self {
        Self {
            queue: None,
            max: Some(max),
        }
    }
}

pub(crate) struct Entry {
    pub(crate) sid: Sid,
    pub(crate) pattern: SubjectPattern,
    pub(crate) queue: Option<String>,
    pub(crate) max: Option<u64>,
    pub(crate) delivered: u64,
    pub(crate) handler: Handler,
}

impl Entry {
    pub(crate) fn remaining(&self) -> Option<u64> {
        self.max.map(|max| max.saturating_sub(self.delivered))
    }
}

/// Handler plus message, to be invoked outside the registry lock.
pub(crate) struct Delivery {
    pub(crate) handler: Handler,
    pub(crate) message: Message,
    /// Set when this delivery used up the subscription's `max`.
    pub(crate) expired: Option<String>,
}

pub(crate) enum MaxOutcome {
    Unknown,
    Limited,
    /// Already at or past the new limit; the entry has been removed.
    Expired(Entry),
}

/// What to replay on a fresh connection for one live subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Resubscribe {
    pub(crate) sid: Sid,
    pub(crate) subject: String,
    pub(crate) queue: Option<String>,
    pub(crate) remaining: Option<u64>,
}

pub(crate) struct Registry {
    next_sid: u64,
    entries: HashMap<Sid, Entry>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            next_sid: 1,
            entries: HashMap::new(),
        }
    }

    pub(crate) fn add(
        &mut self,
        pattern: SubjectPattern,
        options: &SubscribeOptions,
        handler: Handler,
    ) -> Sid {
        let sid = Sid(self.next_sid);
        self.next_sid += 1;
        self.entries.insert(
            sid,
            Entry {
                sid,
                pattern,
                queue: options.queue.clone(),
                max: options.max,
                delivered: 0,
                handler,
            },
        );
        sid
    }

    pub(crate) fn remove(&mut self, sid: Sid) -> Option<Entry> {
        self.entries.remove(&sid)
    }

    pub(crate) fn set_max(&mut self, sid: Sid, max: u64) -> MaxOutcome {
        let Some(entry) = self.entries.get_mut(&sid) else {
            return MaxOutcome::Unknown;
        };
        if entry.delivered >= max {
            return match self.entries.remove(&sid) {
                Some(entry) => MaxOutcome::Expired(entry),
                None => MaxOutcome::Unknown,
            };
        }
        entry.max = Some(max);
        MaxOutcome::Limited
    }

    /// Route one MSG by its sid.
    ///
    /// The server sends a separate MSG per matching subscription, so overlap
    /// between patterns is already resolved on the wire. Frames for unknown
    /// sids (late arrivals after unsubscribe) return `None`.
    pub(crate) fn dispatch(&mut self, message: Message) -> Option<Delivery> {
        let entry = self.entries.get_mut(&message.sid)?;
        if !entry.pattern.matches(&message.subject) {
            warn!(
                sid = %message.sid,
                subject = %message.subject,
                pattern = %entry.pattern,
                "dropping message that does not match its subscription"
            );
            return None;
        }
        entry.delivered += 1;
        let handler = Arc::clone(&entry.handler);
        let expired = entry.max.is_some_and(|max| entry.delivered >= max);
        let expired = if expired {
            self.entries
                .remove(&message.sid)
                .map(|entry| entry.pattern.as_str().to_string())
        } else {
            None
        };
        Some(Delivery {
            handler,
            message,
            expired,
        })
    }

    pub(crate) fn snapshot(&self) -> Vec<Resubscribe> {
        let mut live: Vec<Resubscribe> = self
            .entries
            .values()
            .map(|entry| Resubscribe {
                sid: entry.sid,
                subject: entry.pattern.as_str().to_string(),
                queue: entry.queue.clone(),
                remaining: entry.remaining(),
            })
            .collect();
        live.sort_by_key(|entry| entry.sid);
        live
    }

    pub(crate) fn clear(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
