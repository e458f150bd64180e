//! Per-chat conversation windows.
//!
//! A conversation pins a chat to one agent for as long as the exchange stays
//! warm. All methods take `now` explicitly so expiry is deterministic under
//! test; callers pass `OffsetDateTime::now_utc()`.

use std::collections::HashMap;

use time::{Duration, OffsetDateTime};

use crate::{AgentId, ChatTurn};

/// Idle window after which a conversation is discarded.
pub const CONVERSATION_TTL: Duration = Duration::minutes(3);

/// Maximum retained turns per conversation, oldest evicted first.
pub const HISTORY_LIMIT: usize = 10;

/// Bounded history plus routing metadata for one (chat, remote) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct Conversation {
    pub agent: AgentId,
    pub last_interaction: OffsetDateTime,
    pub history: Vec<ChatTurn>,
    pub last_agent_message_id: Option<String>,
}

impl Conversation {
    fn new(agent: AgentId, now: OffsetDateTime) -> Self {
        Self {
            agent,
            last_interaction: now,
            history: Vec::new(),
            last_agent_message_id: None,
        }
    }

    pub fn is_active(&self, now: OffsetDateTime) -> bool {
        now - self.last_interaction <= CONVERSATION_TTL
    }

    fn push_turn(&mut self, turn: ChatTurn) {
        self.history.push(turn);
        let overflow = self.history.len().saturating_sub(HISTORY_LIMIT);
        if overflow > 0 {
            self.history.drain(..overflow);
        }
    }
}

/// All live conversations for one session (WhatsApp) or one bot (Telegram),
/// keyed by the remote chat identifier. Owned by the session's event loop.
#[derive(Debug, Default)]
pub struct ConversationTable {
    by_remote: HashMap<String, Conversation>,
}

impl ConversationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The live conversation for `remote`, if any. Expired entries are
    /// treated as absent (and dropped lazily).
    pub fn active(&mut self, remote: &str, now: OffsetDateTime) -> Option<&Conversation> {
        if let Some(convo) = self.by_remote.get(remote) {
            if !convo.is_active(now) {
                self.by_remote.remove(remote);
                return None;
            }
        }
        self.by_remote.get(remote)
    }

    /// Upserts the conversation for `remote`, pinning it to `agent` and
    /// appending the user's turn.
    pub fn record_user_turn(
        &mut self,
        remote: &str,
        agent: AgentId,
        text: &str,
        now: OffsetDateTime,
    ) {
        let convo = self
            .by_remote
            .entry(remote.to_string())
            .or_insert_with(|| Conversation::new(agent, now));
        convo.agent = agent;
        convo.last_interaction = now;
        convo.push_turn(ChatTurn::user(text));
    }

    /// Appends the assistant's turn and remembers the delivered message id
    /// for reply-threading detection.
    pub fn record_assistant_turn(
        &mut self,
        remote: &str,
        text: &str,
        message_id: Option<String>,
        now: OffsetDateTime,
    ) {
        if let Some(convo) = self.by_remote.get_mut(remote) {
            convo.last_interaction = now;
            convo.push_turn(ChatTurn::assistant(text));
            if message_id.is_some() {
                convo.last_agent_message_id = message_id;
            }
        }
    }

    /// Snapshot of the bounded history for dispatch.
    pub fn history(&self, remote: &str) -> Vec<ChatTurn> {
        self.by_remote
            .get(remote)
            .map(|c| c.history.clone())
            .unwrap_or_default()
    }

    /// Explicit teardown ("bye" or transport disconnect).
    pub fn drop_conversation(&mut self, remote: &str) {
        self.by_remote.remove(remote);
    }

    /// Purges every expired conversation; returns how many were removed.
    pub fn sweep(&mut self, now: OffsetDateTime) -> usize {
        let before = self.by_remote.len();
        self.by_remote.retain(|_, convo| convo.is_active(now));
        before - self.by_remote.len()
    }

    pub fn len(&self) -> usize {
        self.by_remote.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_remote.is_empty()
    }
}
