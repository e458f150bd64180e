//! Transient pairing codes linking a Telegram chat to a backend user.

use std::collections::HashMap;

use rand::Rng;
use tbg_core::AgentId;
use time::{Duration, OffsetDateTime};

/// Codes expire ten minutes after issue.
pub const PAIRING_TTL: Duration = Duration::seconds(600);

const CODE_LEN: usize = 6;
const HEX_UPPER: &[u8; 16] = b"0123456789ABCDEF";

/// One pending pairing, held in memory only.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingPairing {
    pub code: String,
    pub user_id: String,
    pub auth_token: String,
    pub agent_id: AgentId,
    pub workspace_id: Option<String>,
    pub created_at: OffsetDateTime,
}

impl PendingPairing {
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        now - self.created_at > PAIRING_TTL
    }

    pub fn expires_in_seconds(&self, now: OffsetDateTime) -> i64 {
        (PAIRING_TTL - (now - self.created_at)).whole_seconds().max(0)
    }
}

fn generate_code() -> String {
    let mut rng = rand::rng();
    (0..CODE_LEN)
        .map(|_| HEX_UPPER[rng.random_range(0..HEX_UPPER.len())] as char)
        .collect()
}

/// In-memory table of pending codes. At most one per user: issuing a new
/// code evicts the previous one. All methods take `now` for deterministic
/// expiry under test.
#[derive(Debug, Default)]
pub struct PairingTable {
    by_code: HashMap<String, PendingPairing>,
    code_by_user: HashMap<String, String>,
}

impl PairingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issues a fresh code for `user_id`, evicting any pending one.
    pub fn issue(
        &mut self,
        user_id: impl Into<String>,
        auth_token: impl Into<String>,
        agent_id: AgentId,
        workspace_id: Option<String>,
        now: OffsetDateTime,
    ) -> PendingPairing {
        let user_id = user_id.into();
        if let Some(old) = self.code_by_user.remove(&user_id) {
            self.by_code.remove(&old);
        }

        let mut code = generate_code();
        while self.by_code.contains_key(&code) {
            code = generate_code();
        }

        let pending = PendingPairing {
            code: code.clone(),
            user_id: user_id.clone(),
            auth_token: auth_token.into(),
            agent_id,
            workspace_id,
            created_at: now,
        };
        self.code_by_user.insert(user_id, code.clone());
        self.by_code.insert(code, pending.clone());
        pending
    }

    /// Consumes a code. Expired or unknown codes yield `None`; a consumed
    /// code cannot be replayed.
    pub fn claim(&mut self, code: &str, now: OffsetDateTime) -> Option<PendingPairing> {
        let normalized = code.trim().to_ascii_uppercase();
        let pending = self.by_code.remove(&normalized)?;
        self.code_by_user.remove(&pending.user_id);
        if pending.is_expired(now) {
            return None;
        }
        Some(pending)
    }

    /// Drops expired codes; returns how many were removed.
    pub fn sweep(&mut self, now: OffsetDateTime) -> usize {
        let expired: Vec<String> = self
            .by_code
            .values()
            .filter(|p| p.is_expired(now))
            .map(|p| p.code.clone())
            .collect();
        for code in &expired {
            if let Some(pending) = self.by_code.remove(code) {
                self.code_by_user.remove(&pending.user_id);
            }
        }
        expired.len()
    }

    pub fn pending_for_user(&self, user_id: &str) -> Option<&PendingPairing> {
        let code = self.code_by_user.get(user_id)?;
        self.by_code.get(code)
    }

    pub fn len(&self) -> usize {
        self.by_code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_code.is_empty()
    }
}
