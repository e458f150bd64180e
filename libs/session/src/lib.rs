//! File-backed persistence for gateway sessions and mappings.
//!
//! Both stores follow the same discipline: one gateway process owns a
//! directory, every mutation rewrites the full JSON manifest atomically
//! (serialize to a temp file, then rename), and opaque per-session credential
//! directories sit next to the manifest. Tokens are re-encrypted on every
//! persist so rotations survive restarts, and decrypted best-effort on load.

pub mod pairing;
pub mod telegram;
pub mod whatsapp;

pub use pairing::*;
pub use telegram::*;
pub use whatsapp::*;

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

/// Atomic full rewrite: serialize into a temp file in the target directory,
/// then rename over the manifest.
pub(crate) fn write_manifest<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let dir = path
        .parent()
        .with_context(|| format!("manifest path {} has no parent", path.display()))?;
    fs::create_dir_all(dir)
        .with_context(|| format!("create store directory {}", dir.display()))?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir).context("create temp manifest")?;
    serde_json::to_writer_pretty(&mut tmp, value).context("serialize manifest")?;
    tmp.persist(path)
        .with_context(|| format!("replace manifest {}", path.display()))?;
    Ok(())
}
