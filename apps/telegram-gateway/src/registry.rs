//! In-memory view of the Telegram mappings, kept bijective between chat id
//! and user id, with write-through persistence to the manifest store.

use anyhow::Result;
use dashmap::DashMap;
use tbg_core::AgentId;
use tbg_session::{MappingRecord, TelegramMappingStore};
use time::OffsetDateTime;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct MappingEntry {
    pub record: MappingRecord,
    /// Decrypted live token; `None` until refreshed when decryption failed.
    pub auth_token: Option<String>,
    pub needs_repair: bool,
}

pub struct MappingRegistry {
    store: TelegramMappingStore,
    by_chat: DashMap<i64, MappingEntry>,
    chat_by_user: DashMap<String, i64>,
}

impl MappingRegistry {
    /// Loads the manifest and builds both indexes. A duplicate user id in
    /// the manifest would break bijectivity; later entries win and the loss
    /// is logged.
    pub fn load(store: TelegramMappingStore) -> Result<Self> {
        let registry = Self {
            store,
            by_chat: DashMap::new(),
            chat_by_user: DashMap::new(),
        };
        for loaded in registry.store.load_all()? {
            let chat_id = loaded.record.telegram_chat_id;
            let user_id = loaded.record.user_id.clone();
            if let Some(previous) = registry.chat_by_user.insert(user_id.clone(), chat_id) {
                warn!(
                    user_id = %user_id,
                    previous_chat = previous,
                    chat_id,
                    "duplicate mapping for user; keeping the newest"
                );
                registry.by_chat.remove(&previous);
            }
            registry.by_chat.insert(
                chat_id,
                MappingEntry {
                    record: loaded.record,
                    auth_token: loaded.auth_token,
                    needs_repair: loaded.needs_repair,
                },
            );
        }
        info!(mappings = registry.by_chat.len(), "telegram mappings loaded");
        Ok(registry)
    }

    pub fn get_by_chat(&self, chat_id: i64) -> Option<MappingEntry> {
        self.by_chat.get(&chat_id).map(|e| e.clone())
    }

    pub fn get_by_user(&self, user_id: &str) -> Option<MappingEntry> {
        let chat_id = *self.chat_by_user.get(user_id)?;
        self.get_by_chat(chat_id)
    }

    /// Completes a pairing: installs the mapping under both indexes, evicting
    /// any previous chat the user was paired to, then persists.
    pub fn pair(&self, record: MappingRecord, auth_token: String) -> Result<()> {
        let chat_id = record.telegram_chat_id;
        let user_id = record.user_id.clone();
        if let Some(previous) = self.chat_by_user.insert(user_id.clone(), chat_id) {
            if previous != chat_id {
                self.by_chat.remove(&previous);
                info!(
                    user_id = %user_id,
                    previous_chat = previous,
                    chat_id,
                    "user re-paired to a new chat"
                );
            }
        }
        self.by_chat.insert(
            chat_id,
            MappingEntry {
                record,
                auth_token: Some(auth_token),
                needs_repair: false,
            },
        );
        self.persist_all()
    }

    /// Removes a user's mapping. Returns false when none existed.
    pub fn unpair_by_user(&self, user_id: &str) -> Result<bool> {
        let Some((_, chat_id)) = self.chat_by_user.remove(user_id) else {
            return Ok(false);
        };
        self.by_chat.remove(&chat_id);
        self.store.remove(chat_id)?;
        Ok(true)
    }

    /// Updates the stored default agent. Returns false when the user has no
    /// mapping.
    pub fn set_agent(&self, user_id: &str, agent: AgentId) -> Result<bool> {
        let Some(chat_id) = self.chat_by_user.get(user_id).map(|e| *e) else {
            return Ok(false);
        };
        if let Some(mut entry) = self.by_chat.get_mut(&chat_id) {
            entry.record.agent_id = agent;
        }
        self.persist_all()?;
        Ok(true)
    }

    /// Installs a freshly rotated token and persists so the rotation
    /// survives a restart.
    pub fn install_token(&self, chat_id: i64, token: &str) -> Result<()> {
        if let Some(mut entry) = self.by_chat.get_mut(&chat_id) {
            entry.auth_token = Some(token.to_string());
            entry.needs_repair = false;
        }
        self.persist_all()
    }

    pub fn touch_last_active(&self, chat_id: i64, now: OffsetDateTime) {
        if let Some(mut entry) = self.by_chat.get_mut(&chat_id) {
            entry.record.last_active = now;
        }
    }

    /// Stable snapshot for the proactive sweep.
    pub fn snapshot(&self) -> Vec<MappingEntry> {
        self.by_chat.iter().map(|e| e.value().clone()).collect()
    }

    pub fn persist_all(&self) -> Result<()> {
        let entries: Vec<MappingEntry> = self.snapshot();
        self.store.persist(
            entries
                .iter()
                .map(|e| (&e.record, e.auth_token.as_deref())),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tbg_security::TokenCipher;
    use time::macros::datetime;

    fn registry(dir: &std::path::Path) -> MappingRegistry {
        let store = TelegramMappingStore::new(dir, TokenCipher::new("secret")).unwrap();
        MappingRegistry::load(store).unwrap()
    }

    fn record(chat_id: i64, user_id: &str) -> MappingRecord {
        MappingRecord {
            telegram_chat_id: chat_id,
            telegram_username: Some("tester".into()),
            user_id: user_id.into(),
            encrypted_auth_token: None,
            agent_id: AgentId::Assistant,
            workspace_id: None,
            paired_at: datetime!(2026-03-01 10:00 UTC),
            last_active: datetime!(2026-03-01 10:00 UTC),
        }
    }

    #[test]
    fn pair_indexes_both_directions() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        registry.pair(record(555, "u1"), "tok".into()).unwrap();

        assert_eq!(registry.get_by_chat(555).unwrap().record.user_id, "u1");
        assert_eq!(
            registry.get_by_user("u1").unwrap().record.telegram_chat_id,
            555
        );
    }

    #[test]
    fn repairing_moves_the_user_keeping_bijectivity() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        registry.pair(record(555, "u1"), "tok".into()).unwrap();
        registry.pair(record(777, "u1"), "tok".into()).unwrap();

        assert!(registry.get_by_chat(555).is_none());
        assert_eq!(
            registry.get_by_user("u1").unwrap().record.telegram_chat_id,
            777
        );
    }

    #[test]
    fn unpair_removes_both_indexes_and_the_manifest_entry() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        reg.pair(record(555, "u1"), "tok".into()).unwrap();

        assert!(reg.unpair_by_user("u1").unwrap());
        assert!(reg.get_by_chat(555).is_none());
        assert!(!reg.unpair_by_user("u1").unwrap());

        let reloaded = registry(dir.path());
        assert!(reloaded.get_by_user("u1").is_none());
    }

    #[test]
    fn pairing_survives_a_reload_with_token() {
        let dir = tempfile::tempdir().unwrap();
        {
            let registry = registry(dir.path());
            registry.pair(record(555, "u1"), "tok-live".into()).unwrap();
        }
        let reloaded = registry(dir.path());
        let entry = reloaded.get_by_chat(555).unwrap();
        assert_eq!(entry.auth_token.as_deref(), Some("tok-live"));
        assert!(!entry.needs_repair);
    }

    #[test]
    fn set_agent_updates_default() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        registry.pair(record(555, "u1"), "tok".into()).unwrap();
        assert!(registry.set_agent("u1", AgentId::Pierre).unwrap());
        assert_eq!(
            registry.get_by_chat(555).unwrap().record.agent_id,
            AgentId::Pierre
        );
        assert!(!registry.set_agent("ghost", AgentId::Zoe).unwrap());
    }
}
