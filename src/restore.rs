//! Backup restore and cleanup.
//!
//! Every download overwrites the local file only after copying it to
//! `<file>.bak.<batch_id>`. This module lists those backups, restores a
//! chosen version interactively, and deletes them in bulk.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use dialoguer::{theme::ColorfulTheme, Confirm, Select};
use walkdir::WalkDir;

/// `<original>.bak.<batch_id>` split into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupFile {
    pub path: PathBuf,
    pub original: PathBuf,
    pub batch_id: String,
}

/// Parse a backup file name. Returns `None` for non-backup paths.
pub fn parse_backup_name(path: &Path) -> Option<BackupFile> {
    let name = path.file_name()?.to_str()?;
    let (original_name, batch_id) = name.rsplit_once(".bak.")?;
    if original_name.is_empty() || batch_id.is_empty() {
        return None;
    }
    Some(BackupFile {
        path: path.to_path_buf(),
        original: path.with_file_name(original_name),
        batch_id: batch_id.to_string(),
    })
}

/// All backup files under `root`, grouped by their original file, newest
/// batch first within each group.
pub fn scan_backups(root: &Path) -> Vec<(PathBuf, Vec<BackupFile>)> {
    let mut groups: BTreeMap<PathBuf, Vec<BackupFile>> = BTreeMap::new();
    for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        if let Some(backup) = parse_backup_name(entry.path()) {
            groups.entry(backup.original.clone()).or_default().push(backup);
        }
    }
    let mut out: Vec<(PathBuf, Vec<BackupFile>)> = groups.into_iter().collect();
    for (_, backups) in &mut out {
        backups.sort_by(|a, b| b.batch_id.cmp(&a.batch_id));
    }
    out
}

/// Interactive browser: pick a file, pick a version, restore it.
pub fn restore_interactive(root: &Path) -> anyhow::Result<()> {
    let groups = scan_backups(root);
    if groups.is_empty() {
        println!("No backup files under {}", root.display());
        return Ok(());
    }

    let file_labels: Vec<String> = groups
        .iter()
        .map(|(original, backups)| format!("{} ({} version(s))", original.display(), backups.len()))
        .collect();
    let file_idx = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("File to restore")
        .items(&file_labels)
        .default(0)
        .interact()?;
    let (original, backups) = &groups[file_idx];

    let version_labels: Vec<String> = backups
        .iter()
        .map(|b| format!("{} ({})", b.batch_id, b.path.display()))
        .collect();
    let version_idx = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Version")
        .items(&version_labels)
        .default(0)
        .interact()?;
    let backup = &backups[version_idx];

    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!(
            "Overwrite {} with backup {}?",
            original.display(),
            backup.batch_id
        ))
        .default(false)
        .interact()?;
    if !confirmed {
        println!("Aborted.");
        return Ok(());
    }

    std::fs::copy(&backup.path, original)
        .with_context(|| format!("failed to restore {}", original.display()))?;
    println!("Restored {} from {}", original.display(), backup.batch_id);
    Ok(())
}

/// Delete every `*.bak.*` file under `root`. Returns how many were
/// removed.
pub fn clean_backups(root: &Path) -> anyhow::Result<usize> {
    let mut removed = 0;
    for (_, backups) in scan_backups(root) {
        for backup in backups {
            std::fs::remove_file(&backup.path)
                .with_context(|| format!("failed to delete {}", backup.path.display()))?;
            tracing::debug!("deleted {}", backup.path.display());
            removed += 1;
        }
    }
    Ok(removed)
}
