// src/fingerprint/store.rs

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Context;

use crate::errors::{Result, TaskError};

/// Persistent store of task fingerprints: one small text file per fingerprint
/// key under `<root>/checksum/<key>`.
///
/// Writes are atomic (write-temp-rename) and skipped entirely when the stored
/// value already matches, so the file's mtime stays stable for downstream
/// tooling.
#[derive(Debug, Clone)]
pub struct FingerprintStore {
    root: PathBuf,
}

impl FingerprintStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join("checksum").join(key)
    }

    /// Read the stored fingerprint for a key, if any.
    pub fn read(&self, key: &str) -> Result<Option<String>> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }
        let value = std::fs::read_to_string(&path)
            .with_context(|| format!("reading fingerprint {path:?}"))
            .map_err(TaskError::Internal)?;
        Ok(Some(value.trim().to_string()))
    }

    /// Store a fingerprint. Returns `true` when the file was written, `false`
    /// when the stored value already matched.
    pub fn write_if_changed(&self, key: &str, value: &str) -> Result<bool> {
        if self.read(key)?.as_deref() == Some(value) {
            return Ok(false);
        }

        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating fingerprint directory {parent:?}"))
                .map_err(TaskError::Internal)?;
        }

        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, format!("{value}\n"))
            .and_then(|_| std::fs::rename(&tmp, &path))
            .with_context(|| format!("writing fingerprint {path:?}"))
            .map_err(TaskError::Internal)?;
        Ok(true)
    }

}

/// Derive the stable fingerprint key for a task invocation: the qualified
/// name (path-safe), extended with a short digest of the bound variables when
/// any are present.
pub fn fingerprint_key(name: &str, bound_vars: &BTreeMap<String, String>) -> String {
    let safe: String = name
        .chars()
        .map(|c| match c {
            '/' | ':' | '\\' | ' ' => '-',
            other => other,
        })
        .collect();

    if bound_vars.is_empty() {
        return safe;
    }

    let mut hasher = blake3::Hasher::new();
    for (k, v) in bound_vars {
        hasher.update(k.as_bytes());
        hasher.update(b"=");
        hasher.update(v.as_bytes());
        hasher.update(b"\n");
    }
    let digest = hasher.finalize().to_hex();
    format!("{safe}-{}", &digest.as_str()[..16])
}
