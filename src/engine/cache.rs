// On-disk store for downloaded engine binaries, one retained version per key.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Version sidecar written next to each payload file.
#[derive(Debug, Serialize, Deserialize)]
struct EntryMeta {
    version: String,
}

/// Durable cache keyed by `(key, version)`. A key holds at most one version:
/// storing a new version evicts the prior payload. A get for a mismatched
/// version is a miss, never stale data.
///
/// All methods return `Result` but callers must treat any error as a miss or
/// no-op; a broken cache never fails a boot.
pub struct AssetCache {
    root: PathBuf,
    // Per-key guards so a concurrent get/set pair never observes a
    // half-written entry.
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl AssetCache {
    pub fn new(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
            locks: Mutex::new(HashMap::new()),
        })
    }

    fn key_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock();
        Arc::clone(locks.entry(key.to_string()).or_default())
    }

    /// Keys are URL paths; flatten them into a single filename stem. The
    /// escaping is injective (`_` itself is escaped), so distinct keys never
    /// share an entry.
    fn file_stem(key: &str) -> String {
        let mut stem = String::with_capacity(key.len());
        for b in key.bytes() {
            match b {
                b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'.' | b'-' => stem.push(b as char),
                _ => stem.push_str(&format!("_{:02x}", b)),
            }
        }
        stem
    }

    fn payload_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.bin", Self::file_stem(key)))
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.meta.json", Self::file_stem(key)))
    }

    /// Look up the payload for `key` at exactly `version`.
    /// Returns `Ok(None)` on a miss or version mismatch.
    pub fn get(&self, key: &str, version: &str) -> Result<Option<Bytes>> {
        let guard = self.key_lock(key);
        let _g = guard.lock();

        let meta_path = self.meta_path(key);
        if !meta_path.exists() {
            return Ok(None);
        }

        let meta: EntryMeta = serde_json::from_slice(&fs::read(&meta_path)?)
            .map_err(|e| anyhow!("corrupt cache metadata for {}: {}", key, e))?;
        if meta.version != version {
            return Ok(None);
        }

        let bytes = fs::read(self.payload_path(key))?;
        Ok(Some(Bytes::from(bytes)))
    }

    /// Store `bytes` for `(key, version)`, evicting any prior version of the
    /// same key.
    ///
    /// The sidecar is removed before the payload is rewritten and restored
    /// last, so an interrupted store is observed as a miss rather than as a
    /// mismatched payload.
    pub fn set(&self, key: &str, version: &str, bytes: &[u8]) -> Result<()> {
        let guard = self.key_lock(key);
        let _g = guard.lock();

        let meta_path = self.meta_path(key);
        let payload_path = self.payload_path(key);

        match fs::remove_file(&meta_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let payload_tmp = payload_path.with_extension("bin.tmp");
        fs::write(&payload_tmp, bytes)?;
        fs::rename(&payload_tmp, &payload_path)?;

        let meta = EntryMeta {
            version: version.to_string(),
        };
        let meta_tmp = meta_path.with_extension("json.tmp");
        fs::write(&meta_tmp, serde_json::to_vec(&meta)?)?;
        fs::rename(&meta_tmp, &meta_path)?;

        Ok(())
    }
}
