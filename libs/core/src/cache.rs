//! Bounded per-session caches.
//!
//! Both caches are owned by their session's event loop and never shared
//! across tasks, so plain collections suffice.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Default capacity for [`SentMessageIndex`].
pub const SENT_INDEX_CAPACITY: usize = 1000;

/// Default per-remote capacity for [`MessageCache`].
pub const MESSAGE_CACHE_CAPACITY: usize = 50;

/// Ids of messages this gateway itself sent on a session, used to suppress
/// the transport echoing them back as inbound events. FIFO-evicted.
#[derive(Debug)]
pub struct SentMessageIndex {
    capacity: usize,
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl SentMessageIndex {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            ids: HashSet::new(),
        }
    }

    pub fn record(&mut self, message_id: impl Into<String>) {
        let id = message_id.into();
        if !self.ids.insert(id.clone()) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.ids.remove(&evicted);
            }
        }
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.ids.contains(message_id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl Default for SentMessageIndex {
    fn default() -> Self {
        Self::new(SENT_INDEX_CAPACITY)
    }
}

/// One cached transport message, kept for ad-hoc context lookup by tools.
/// Not authoritative history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CachedMessage {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub from_me: bool,
    pub text: String,
    pub message_id: String,
}

/// Bounded per-remote rolling window of recent messages.
#[derive(Debug)]
pub struct MessageCache {
    capacity: usize,
    by_remote: HashMap<String, VecDeque<CachedMessage>>,
}

impl Default for MessageCache {
    fn default() -> Self {
        Self::new(MESSAGE_CACHE_CAPACITY)
    }
}

impl MessageCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            by_remote: HashMap::new(),
        }
    }

    pub fn push(&mut self, remote_chat: &str, message: CachedMessage) {
        let window = self.by_remote.entry(remote_chat.to_string()).or_default();
        window.push_back(message);
        while window.len() > self.capacity {
            window.pop_front();
        }
    }

    /// Recent messages for a remote, oldest first.
    pub fn recent(&self, remote_chat: &str) -> Vec<CachedMessage> {
        self.by_remote
            .get(remote_chat)
            .map(|w| w.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn forget(&mut self, remote_chat: &str) {
        self.by_remote.remove(remote_chat);
    }
}
