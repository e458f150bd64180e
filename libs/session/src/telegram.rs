use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tbg_core::AgentId;
use tbg_security::TokenCipher;
use time::OffsetDateTime;
use tracing::warn;

use crate::write_manifest;

const MANIFEST_FILE: &str = "telegram-mappings.json";

/// Persisted pairing between a Telegram chat and a backend user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MappingRecord {
    pub telegram_chat_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telegram_username: Option<String>,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_auth_token: Option<String>,
    pub agent_id: AgentId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub paired_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_active: OffsetDateTime,
}

/// A mapping as loaded into the gateway: token decrypted best-effort.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedMapping {
    pub record: MappingRecord,
    pub auth_token: Option<String>,
    pub needs_repair: bool,
}

/// Single-writer store for the Telegram mapping manifest.
pub struct TelegramMappingStore {
    root: PathBuf,
    cipher: TokenCipher,
}

impl TelegramMappingStore {
    pub fn new(root: impl Into<PathBuf>, cipher: TokenCipher) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("create mappings dir {}", root.display()))?;
        Ok(Self { root, cipher })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    pub fn load_all(&self) -> Result<Vec<LoadedMapping>> {
        let path = self.manifest_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("read manifest {}", path.display()))?;
        let manifest: BTreeMap<String, MappingRecord> =
            serde_json::from_str(&raw).context("parse telegram mappings manifest")?;

        let mut mappings = Vec::new();
        for record in manifest.into_values() {
            let (auth_token, needs_repair) = match &record.encrypted_auth_token {
                Some(blob) => match self.cipher.decrypt(blob) {
                    Some(token) => (Some(token), false),
                    None => {
                        warn!(
                            user_id = %record.user_id,
                            chat_id = record.telegram_chat_id,
                            "stored token failed to decrypt; mapping needs re-pairing"
                        );
                        (None, true)
                    }
                },
                None => (None, false),
            };
            mappings.push(LoadedMapping {
                record,
                auth_token,
                needs_repair,
            });
        }
        Ok(mappings)
    }

    /// Atomic full rewrite keyed by chat id, re-encrypting live tokens.
    pub fn persist<'a, I>(&self, mappings: I) -> Result<()>
    where
        I: IntoIterator<Item = (&'a MappingRecord, Option<&'a str>)>,
    {
        let mut manifest = BTreeMap::new();
        for (record, live_token) in mappings {
            let mut entry = record.clone();
            entry.encrypted_auth_token = match live_token {
                Some(token) => Some(self.cipher.encrypt(token)?),
                None => entry.encrypted_auth_token,
            };
            manifest.insert(entry.telegram_chat_id.to_string(), entry);
        }
        write_manifest(&self.manifest_path(), &manifest)
    }

    pub fn remove(&self, telegram_chat_id: i64) -> Result<()> {
        let path = self.manifest_path();
        if !path.exists() {
            return Ok(());
        }
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("read manifest {}", path.display()))?;
        let mut manifest: BTreeMap<String, MappingRecord> =
            serde_json::from_str(&raw).context("parse telegram mappings manifest")?;
        if manifest.remove(&telegram_chat_id.to_string()).is_some() {
            write_manifest(&path, &manifest)?;
        }
        Ok(())
    }
}
