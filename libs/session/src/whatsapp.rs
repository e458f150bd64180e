use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tbg_security::TokenCipher;
use time::OffsetDateTime;
use tracing::warn;

use crate::write_manifest;

const MANIFEST_FILE: &str = "sessions.json";

/// Generates a fresh 8-hex session identifier.
pub fn generate_session_id() -> String {
    let value: u32 = rand::rng().random();
    format!("{value:08x}")
}

/// Persisted form of one WhatsApp session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub session_id: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    pub credentials_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_auth_token: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_connected: Option<OffsetDateTime>,
}

/// A session as loaded into the gateway: token decrypted best-effort.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedSession {
    pub record: SessionRecord,
    /// Decrypted bearer token, absent when never stored or undecryptable.
    pub auth_token: Option<String>,
    /// True when an encrypted token existed but failed to decrypt; the
    /// session works but needs re-pairing before agent calls succeed.
    pub needs_repair: bool,
}

/// Single-writer store for WhatsApp session metadata and credential dirs.
pub struct WhatsAppSessionStore {
    root: PathBuf,
    cipher: TokenCipher,
}

impl WhatsAppSessionStore {
    pub fn new(root: impl Into<PathBuf>, cipher: TokenCipher) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("create sessions dir {}", root.display()))?;
        Ok(Self { root, cipher })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    /// Directory holding the transport library's opaque credential state for
    /// one session. Exclusive to that session.
    pub fn credentials_dir(&self, session_id: &str) -> PathBuf {
        self.root.join(session_id)
    }

    /// Ensures the credential directory exists for a new session.
    pub fn prepare_credentials_dir(&self, session_id: &str) -> Result<PathBuf> {
        let dir = self.credentials_dir(session_id);
        fs::create_dir_all(&dir)
            .with_context(|| format!("create credentials dir {}", dir.display()))?;
        Ok(dir)
    }

    /// Reads the manifest and reconstructs sessions. Entries whose credential
    /// directory vanished are logged and skipped, never deleted: the manifest
    /// stays authoritative in case the directory comes back from a restore.
    pub fn load_all(&self) -> Result<Vec<LoadedSession>> {
        let path = self.manifest_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("read manifest {}", path.display()))?;
        let manifest: BTreeMap<String, SessionRecord> =
            serde_json::from_str(&raw).context("parse sessions manifest")?;

        let mut sessions = Vec::new();
        for (session_id, record) in manifest {
            if !record.credentials_path.is_dir() {
                warn!(
                    session_id = %session_id,
                    user_id = %record.user_id,
                    path = %record.credentials_path.display(),
                    "session credentials directory missing; skipping entry"
                );
                continue;
            }
            let (auth_token, needs_repair) = match &record.encrypted_auth_token {
                Some(blob) => match self.cipher.decrypt(blob) {
                    Some(token) => (Some(token), false),
                    None => {
                        warn!(
                            session_id = %session_id,
                            user_id = %record.user_id,
                            "stored token failed to decrypt; session needs re-pairing"
                        );
                        (None, true)
                    }
                },
                None => (None, false),
            };
            sessions.push(LoadedSession {
                record,
                auth_token,
                needs_repair,
            });
        }
        Ok(sessions)
    }

    /// Atomic full rewrite of the manifest. Live tokens are re-encrypted so
    /// rotations that happened since the last persist survive a restart.
    pub fn persist<'a, I>(&self, sessions: I) -> Result<()>
    where
        I: IntoIterator<Item = (&'a SessionRecord, Option<&'a str>)>,
    {
        let mut manifest = BTreeMap::new();
        for (record, live_token) in sessions {
            let mut entry = record.clone();
            entry.encrypted_auth_token = match live_token {
                Some(token) => Some(self.cipher.encrypt(token)?),
                None => entry.encrypted_auth_token,
            };
            manifest.insert(entry.session_id.clone(), entry);
        }
        write_manifest(&self.manifest_path(), &manifest)
    }

    /// Deletes the credential directory (missing is fine) and drops the
    /// manifest entry.
    pub fn remove(&self, session_id: &str) -> Result<()> {
        let dir = self.credentials_dir(session_id);
        if dir.exists() {
            fs::remove_dir_all(&dir)
                .with_context(|| format!("remove credentials dir {}", dir.display()))?;
        }

        let path = self.manifest_path();
        if !path.exists() {
            return Ok(());
        }
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("read manifest {}", path.display()))?;
        let mut manifest: BTreeMap<String, SessionRecord> =
            serde_json::from_str(&raw).context("parse sessions manifest")?;
        if manifest.remove(session_id).is_some() {
            write_manifest(&path, &manifest)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn store(root: &Path) -> WhatsAppSessionStore {
        WhatsAppSessionStore::new(root, TokenCipher::new("test-secret")).expect("store")
    }

    fn record(store: &WhatsAppSessionStore, session_id: &str, user_id: &str) -> SessionRecord {
        let creds = store.prepare_credentials_dir(session_id).expect("creds dir");
        SessionRecord {
            session_id: session_id.into(),
            user_id: user_id.into(),
            phone_number: Some("+15550001".into()),
            credentials_path: creds,
            encrypted_auth_token: None,
            created_at: datetime!(2026-01-15 08:00 UTC),
            last_connected: None,
        }
    }

    #[test]
    fn session_ids_are_eight_hex_chars() {
        let id = generate_session_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn persist_then_load_roundtrips_with_token() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let rec = record(&store, "ab12cd34", "u1");

        store
            .persist([(&rec, Some("live-token"))])
            .expect("persist");
        let loaded = store.load_all().expect("load");
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].record.session_id, "ab12cd34");
        assert_eq!(loaded[0].record.user_id, "u1");
        assert_eq!(loaded[0].auth_token.as_deref(), Some("live-token"));
        assert!(!loaded[0].needs_repair);
    }

    #[test]
    fn restart_roundtrip_preserves_logical_state() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = store(dir.path());
            let rec = record(&store, "11111111", "u1");
            store.persist([(&rec, Some("tok-1"))]).expect("persist");
        }
        // A new store over the same directory models a process restart.
        let reloaded = store(dir.path()).load_all().expect("load");
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded[0].auth_token.as_deref(), Some("tok-1"));
    }

    #[test]
    fn entries_missing_credentials_are_skipped_not_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let keep = record(&store, "aaaaaaaa", "u1");
        let orphan = record(&store, "bbbbbbbb", "u2");
        store
            .persist([(&keep, None), (&orphan, None)])
            .expect("persist");

        fs::remove_dir_all(store.credentials_dir("bbbbbbbb")).unwrap();
        let loaded = store.load_all().expect("load");
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].record.session_id, "aaaaaaaa");

        // The manifest still carries the skipped entry.
        let raw = fs::read_to_string(dir.path().join("sessions.json")).unwrap();
        assert!(raw.contains("bbbbbbbb"));
    }

    #[test]
    fn undecryptable_token_marks_needs_repair() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let mut rec = record(&store, "cafecafe", "u1");
        rec.encrypted_auth_token =
            Some(TokenCipher::new("other-secret").encrypt("tok").unwrap());
        store.persist([(&rec, None)]).expect("persist");

        let loaded = store.load_all().expect("load");
        assert_eq!(loaded.len(), 1);
        assert!(loaded[0].needs_repair);
        assert!(loaded[0].auth_token.is_none());
    }

    #[test]
    fn remove_deletes_credentials_and_manifest_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let rec = record(&store, "deadbeef", "u1");
        store.persist([(&rec, None)]).expect("persist");

        store.remove("deadbeef").expect("remove");
        assert!(!store.credentials_dir("deadbeef").exists());
        assert!(store.load_all().expect("load").is_empty());

        // Removing again is harmless.
        store.remove("deadbeef").expect("second remove");
    }

    #[test]
    fn load_from_empty_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(store(dir.path()).load_all().expect("load").is_empty());
    }
}
