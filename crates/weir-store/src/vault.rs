//! Content-addressed payload storage.
//!
//! Non-volatile resource payloads are serialized to canonical JSON and
//! written under `<root>/<first-two-hex>/<full-hash>`. The directory is
//! append-only: writes go to a temporary name and are renamed into place,
//! so concurrent puts of the same content are idempotent and a reader
//! never observes a partial payload.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;

use weir_model::Value;

use crate::error::{Result, StoreError};

/// Content-addressed directory of serialized payloads.
pub struct Vault {
    root: PathBuf,
}

impl Vault {
    /// Open (or create) a vault rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Store `value`, returning its content hash. Re-putting existing
    /// content is a no-op.
    pub fn put(&self, value: &Value) -> Result<String> {
        let payload = serde_json::to_vec(value)?;
        let hash = hex::encode(Sha256::digest(&payload));
        let target = self.entry_path(&hash);
        if target.exists() {
            return Ok(hash);
        }

        let shard = target.parent().expect("entry path always has a parent");
        fs::create_dir_all(shard)?;
        let tmp = shard.join(format!(".{}.tmp", Uuid::new_v4()));
        fs::write(&tmp, &payload)?;
        fs::rename(&tmp, &target)?;
        debug!(hash = %hash, bytes = payload.len(), "payload vaulted");
        Ok(hash)
    }

    /// Load the payload stored under `hash`.
    pub fn get(&self, hash: &str) -> Result<Value> {
        let target = self.entry_path(hash);
        let payload = match fs::read(&target) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::PayloadMissing(hash.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&payload)?)
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.entry_path(hash).exists()
    }

    /// Remove every entry whose hash is not in `live`. Returns the number
    /// of entries removed.
    pub fn sweep(&self, live: &HashSet<String>) -> Result<usize> {
        let mut removed = 0;
        for shard in fs::read_dir(&self.root)? {
            let shard = shard?;
            if !shard.file_type()?.is_dir() {
                continue;
            }
            for entry in fs::read_dir(shard.path())? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with('.') {
                    // Leftover temporary from an interrupted write.
                    fs::remove_file(entry.path())?;
                    continue;
                }
                if !live.contains(&name) {
                    fs::remove_file(entry.path())?;
                    removed += 1;
                }
            }
        }
        debug!(removed, "vault swept");
        Ok(removed)
    }

    fn entry_path(&self, hash: &str) -> PathBuf {
        let prefix = if hash.len() >= 2 { &hash[..2] } else { hash };
        self.root.join(prefix).join(hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_put_get_roundtrip() {
        let dir = TempDir::new().unwrap();
        let vault = Vault::open(dir.path()).unwrap();
        let value = Value::List(vec![Value::Int(1), Value::Str("x".into())]);
        let hash = vault.put(&value).unwrap();
        assert_eq!(vault.get(&hash).unwrap(), value);
    }

    #[test]
    fn test_put_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let vault = Vault::open(dir.path()).unwrap();
        let a = vault.put(&Value::Int(42)).unwrap();
        let b = vault.put(&Value::Int(42)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_get_missing_entry() {
        let dir = TempDir::new().unwrap();
        let vault = Vault::open(dir.path()).unwrap();
        let err = vault.get("deadbeef").unwrap_err();
        assert!(matches!(err, StoreError::PayloadMissing(h) if h == "deadbeef"));
    }

    #[test]
    fn test_sweep_keeps_live_entries() {
        let dir = TempDir::new().unwrap();
        let vault = Vault::open(dir.path()).unwrap();
        let keep = vault.put(&Value::Int(1)).unwrap();
        let drop = vault.put(&Value::Int(2)).unwrap();

        let live = HashSet::from([keep.clone()]);
        let removed = vault.sweep(&live).unwrap();
        assert_eq!(removed, 1);
        assert!(vault.contains(&keep));
        assert!(!vault.contains(&drop));
    }
}
