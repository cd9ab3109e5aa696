//! Persistent sync state.
//!
//! Maps vault-relative paths to remote tokens (plus a reverse index) so the
//! orchestrator can tell "deleted locally" apart from "created remotely".
//! Stored as JSON at `<vault>/.doc_sync_state.json`; paths are kept
//! vault-relative so the state survives vault moves. Every mutation saves
//! with write-temp + rename; a failed save is warned, not fatal — the
//! remote operation it records already happened.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

pub const STATE_FILE_NAME: &str = ".doc_sync_state.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    #[serde(rename = "docx")]
    Document,
    #[serde(rename = "folder")]
    Folder,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEntry {
    pub token: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    #[serde(rename = "last_sync", default)]
    pub last_sync_mtime: f64,
}

#[derive(Default)]
struct StateData {
    entries: BTreeMap<String, StateEntry>,
    token_index: HashMap<String, String>,
}

pub struct SyncState {
    root: PathBuf,
    path: PathBuf,
    data: Mutex<StateData>,
}

impl SyncState {
    /// Open (or lazily create) the state for a vault root.
    pub fn open(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let path = root.join(STATE_FILE_NAME);
        let mut data = StateData::default();
        if path.exists() {
            match std::fs::read_to_string(&path)
                .map_err(anyhow::Error::from)
                .and_then(|s| {
                    serde_json::from_str::<BTreeMap<String, StateEntry>>(&s)
                        .map_err(anyhow::Error::from)
                }) {
                Ok(entries) => {
                    for (rel, entry) in &entries {
                        data.token_index.insert(entry.token.clone(), rel.clone());
                    }
                    data.entries = entries;
                }
                Err(err) => {
                    tracing::warn!("failed to load sync state {}: {err}", path.display());
                }
            }
        }
        SyncState {
            root,
            path,
            data: Mutex::new(data),
        }
    }

    fn rel_path(&self, abs_path: &Path) -> String {
        let rel = abs_path.strip_prefix(&self.root).unwrap_or(abs_path);
        rel.to_string_lossy().replace('\\', "/")
    }

    /// Record (or refresh) the mapping for a path. The stored mtime is the
    /// file's current modification time, or 0 when it does not exist yet.
    pub fn update(&self, abs_path: &Path, token: &str, kind: EntryKind) {
        let rel = self.rel_path(abs_path);
        let mtime = file_mtime(abs_path).unwrap_or(0.0);
        let mut data = self.data.lock();
        if let Some(old) = data.entries.get(&rel) {
            let old_token = old.token.clone();
            data.token_index.remove(&old_token);
        }
        data.entries.insert(
            rel.clone(),
            StateEntry {
                token: token.to_string(),
                kind,
                last_sync_mtime: mtime,
            },
        );
        data.token_index.insert(token.to_string(), rel);
        self.save(&data);
    }

    pub fn remove(&self, abs_path: &Path) {
        let rel = self.rel_path(abs_path);
        let mut data = self.data.lock();
        if let Some(entry) = data.entries.remove(&rel) {
            data.token_index.remove(&entry.token);
            self.save(&data);
        }
    }

    pub fn remove_by_token(&self, token: &str) {
        let mut data = self.data.lock();
        if let Some(rel) = data.token_index.remove(token) {
            data.entries.remove(&rel);
            self.save(&data);
        }
    }

    /// Remove a directory entry and every entry beneath it. Required to
    /// cascade when a local folder disappears.
    pub fn remove_directory(&self, abs_path: &Path) {
        let rel = self.rel_path(abs_path);
        let prefix = format!("{rel}/");
        let mut data = self.data.lock();
        let doomed: Vec<String> = data
            .entries
            .keys()
            .filter(|k| **k == rel || k.starts_with(&prefix))
            .cloned()
            .collect();
        if doomed.is_empty() {
            return;
        }
        for key in doomed {
            if let Some(entry) = data.entries.remove(&key) {
                data.token_index.remove(&entry.token);
            }
        }
        self.save(&data);
    }

    pub fn get_by_path(&self, abs_path: &Path) -> Option<StateEntry> {
        let rel = self.rel_path(abs_path);
        self.data.lock().entries.get(&rel).cloned()
    }

    /// Entry plus its vault-relative path, looked up by remote token.
    pub fn get_by_token(&self, token: &str) -> Option<(String, StateEntry)> {
        let data = self.data.lock();
        let rel = data.token_index.get(token)?;
        data.entries.get(rel).map(|e| (rel.clone(), e.clone()))
    }

    pub fn len(&self) -> usize {
        self.data.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn save(&self, data: &StateData) {
        let result = serde_json::to_string_pretty(&data.entries)
            .map_err(anyhow::Error::from)
            .and_then(|json| {
                let tmp = self.path.with_extension("json.tmp");
                std::fs::write(&tmp, json)?;
                std::fs::rename(&tmp, &self.path)?;
                Ok(())
            });
        if let Err(err) = result {
            tracing::warn!("failed to save sync state {}: {err}", self.path.display());
        }
    }
}

fn file_mtime(path: &Path) -> Option<f64> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    let since_epoch = modified.duration_since(std::time::UNIX_EPOCH).ok()?;
    Some(since_epoch.as_secs_f64())
}
