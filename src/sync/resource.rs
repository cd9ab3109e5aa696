//! Vault resource index.
//!
//! Document references follow the "shortest unambiguous path" convention:
//! a bare filename anywhere in the vault. Re-scanning the vault for every
//! reference would be O(N·R); one walk at startup gives O(1) lookups.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

/// Directories never scanned for assets.
const DENY_DIRS: &[&str] = &["node_modules", "target", "__pycache__", "venv"];

/// Extensions indexed by default: everything a vault document can embed.
pub const DEFAULT_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "webp", "svg", "bmp", "mp4", "mov", "avi", "mkv", "webm", "pdf",
    "doc", "docx", "xls", "xlsx", "ppt", "pptx", "zip", "rar", "7z", "tar", "excalidraw", "drawio",
    "canvas", "md",
];

pub struct ResourceIndex {
    vault_root: PathBuf,
    index: HashMap<String, PathBuf>,
}

impl ResourceIndex {
    pub fn build(vault_root: impl Into<PathBuf>) -> Self {
        Self::build_with_extensions(vault_root, DEFAULT_EXTENSIONS)
    }

    pub fn build_with_extensions(vault_root: impl Into<PathBuf>, extensions: &[&str]) -> Self {
        let vault_root = vault_root.into();
        let allowed: HashSet<String> = extensions.iter().map(|e| e.to_ascii_lowercase()).collect();
        let mut index: HashMap<String, PathBuf> = HashMap::new();

        let walker = WalkDir::new(&vault_root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                if !entry.file_type().is_dir() {
                    return true;
                }
                let name = entry.file_name().to_string_lossy();
                // The walk root itself may be hidden; never prune it.
                if entry.depth() == 0 {
                    return true;
                }
                !name.starts_with('.') && !DENY_DIRS.contains(&name.as_ref())
            });

        for entry in walker.filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let ext = name
                .rsplit_once('.')
                .map(|(_, e)| e.to_ascii_lowercase())
                .unwrap_or_default();
            if !allowed.contains(&ext) {
                continue;
            }
            // First occurrence wins, mirroring the shortest-path convention.
            index
                .entry(name)
                .or_insert_with(|| entry.path().to_path_buf());
        }

        tracing::debug!(
            files = index.len(),
            root = %vault_root.display(),
            "resource index built"
        );
        ResourceIndex { vault_root, index }
    }

    /// Resolve a reference to an absolute path.
    pub fn find(&self, reference: &str) -> Option<PathBuf> {
        let as_path = Path::new(reference);
        if as_path.is_absolute() && as_path.exists() {
            return Some(as_path.to_path_buf());
        }

        let joined = self.vault_root.join(reference);
        if joined.exists() {
            return Some(joined);
        }

        let filename = as_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())?;
        if let Some(found) = self.index.get(&filename) {
            return Some(found.clone());
        }

        // The Excalidraw plugin stores drawings as `.excalidraw.md` but
        // links them as `.excalidraw`.
        if filename.ends_with(".excalidraw") {
            if let Some(found) = self.index.get(&format!("{filename}.md")) {
                return Some(found.clone());
            }
        }

        None
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"x").unwrap();
    }

    #[test]
    fn finds_by_bare_filename_anywhere_in_vault() {
        let dir = TempDir::new().unwrap();
        touch(&dir.path().join("deep/nested/shot.png"));
        let index = ResourceIndex::build(dir.path());
        assert_eq!(
            index.find("shot.png").unwrap(),
            dir.path().join("deep/nested/shot.png")
        );
    }

    #[test]
    fn vault_relative_path_wins_over_index() {
        let dir = TempDir::new().unwrap();
        touch(&dir.path().join("a/pic.png"));
        touch(&dir.path().join("b/pic.png"));
        let index = ResourceIndex::build(dir.path());
        assert_eq!(index.find("b/pic.png").unwrap(), dir.path().join("b/pic.png"));
    }

    #[test]
    fn hidden_and_build_directories_are_skipped() {
        let dir = TempDir::new().unwrap();
        touch(&dir.path().join(".obsidian/cached.png"));
        touch(&dir.path().join("node_modules/dep.png"));
        touch(&dir.path().join("real.png"));
        let index = ResourceIndex::build(dir.path());
        assert_eq!(index.len(), 1);
        assert!(index.find("cached.png").is_none());
        assert!(index.find("dep.png").is_none());
        assert!(index.find("real.png").is_some());
    }

    #[test]
    fn disallowed_extensions_are_not_indexed() {
        let dir = TempDir::new().unwrap();
        touch(&dir.path().join("binary.exe"));
        let index = ResourceIndex::build(dir.path());
        assert!(index.find("binary.exe").is_none());
    }

    #[test]
    fn excalidraw_reference_falls_back_to_md_suffix() {
        let dir = TempDir::new().unwrap();
        touch(&dir.path().join("drawings/plan.excalidraw.md"));
        let index = ResourceIndex::build(dir.path());
        assert_eq!(
            index.find("plan.excalidraw").unwrap(),
            dir.path().join("drawings/plan.excalidraw.md")
        );
    }

    #[test]
    fn missing_reference_returns_none() {
        let dir = TempDir::new().unwrap();
        let index = ResourceIndex::build(dir.path());
        assert!(index.find("ghost.png").is_none());
    }
}
