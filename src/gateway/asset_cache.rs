//! Content-hash → remote-asset-token cache.
//!
//! Uploads are deduplicated by SHA-256: a hit returns the cached token
//! without touching the network. Entries are append-only; staleness is
//! tolerated because the remote service deduplicates by content anyway.
//! Concurrent uploads of identical content may race — the cache keeps
//! whichever token arrives last.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use sha2::{Digest, Sha256};

pub struct AssetCache {
    path: PathBuf,
    map: Mutex<HashMap<String, String>>,
}

impl AssetCache {
    /// `~/.doc_sync/assets_cache.json`, shared by all vaults.
    pub fn default_path() -> PathBuf {
        directories::BaseDirs::new()
            .map(|dirs| dirs.home_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".doc_sync")
            .join("assets_cache.json")
    }

    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let map = std::fs::read_to_string(&path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default();
        AssetCache {
            path,
            map: Mutex::new(map),
        }
    }

    pub fn get(&self, content_hash: &str) -> Option<String> {
        self.map.lock().get(content_hash).cloned()
    }

    pub fn insert(&self, content_hash: &str, token: &str) {
        let mut map = self.map.lock();
        map.insert(content_hash.to_string(), token.to_string());
        self.save(&map);
    }

    fn save(&self, map: &HashMap<String, String>) {
        let result = (|| -> anyhow::Result<()> {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let tmp = self.path.with_extension("json.tmp");
            std::fs::write(&tmp, serde_json::to_string(map)?)?;
            std::fs::rename(&tmp, &self.path)?;
            Ok(())
        })();
        if let Err(err) = result {
            tracing::warn!("failed to save asset cache {}: {err}", self.path.display());
        }
    }
}

/// SHA-256 of a file's contents, hex encoded.
pub fn file_sha256(path: &Path) -> std::io::Result<String> {
    let mut hasher = Sha256::new();
    let mut file = std::fs::File::open(path)?;
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn insert_then_get_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("assets_cache.json");
        {
            let cache = AssetCache::open(&path);
            assert!(cache.get("abc").is_none());
            cache.insert("abc", "tok_1");
            assert_eq!(cache.get("abc").as_deref(), Some("tok_1"));
        }
        let reloaded = AssetCache::open(&path);
        assert_eq!(reloaded.get("abc").as_deref(), Some("tok_1"));
    }

    #[test]
    fn last_writer_wins_on_race() {
        let dir = TempDir::new().unwrap();
        let cache = AssetCache::open(dir.path().join("c.json"));
        cache.insert("h", "tok_first");
        cache.insert("h", "tok_second");
        assert_eq!(cache.get("h").as_deref(), Some("tok_second"));
    }

    #[test]
    fn identical_bytes_hash_identically() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.bin");
        let b = dir.path().join("b.bin");
        std::fs::write(&a, b"same contents").unwrap();
        std::fs::write(&b, b"same contents").unwrap();
        assert_eq!(file_sha256(&a).unwrap(), file_sha256(&b).unwrap());
    }
}
