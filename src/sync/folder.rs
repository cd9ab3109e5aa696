//! Folder-level orchestration.
//!
//! Walks the local directory tree and the remote folder listing together,
//! plans per-directory actions, and runs the resulting document tasks on a
//! bounded worker pool. The sync state disambiguates the two cases a naive
//! walk cannot tell apart: an entry missing locally was either deleted here
//! (delete it remotely) or created remotely (pull it down).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::Config;
use crate::gateway::{DriveEntry, FeishuGateway};
use crate::sync::document::{DocumentSync, DocumentSyncOptions, SyncOutcome};
use crate::sync::resource::ResourceIndex;
use crate::sync::state::{EntryKind, SyncState};

/// Local attachment directories that never sync.
const SKIP_LOCAL_DIRS: &[&str] = &["assets", "attachments", "_attachments"];
/// Local suffixes with no usable remote representation.
const SKIP_LOCAL_SUFFIXES: &[&str] = &[".excalidraw", ".excalidraw.md", ".canvas"];
/// Remote names that are never deleted, even when absent locally.
const PROTECTED_REMOTE_NAMES: &[&str] = &["DocSync_Assets", "assets", ".Trash"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEntry {
    pub name: String,
    pub is_dir: bool,
}

/// Decisions for one directory level of the merge walk.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct DirectoryPlan {
    /// Local `.md` with a same-named remote document: sync.
    pub sync_existing: Vec<(PathBuf, String)>,
    /// Local `.md` without a remote counterpart: create, then sync as new.
    pub create_docs: Vec<PathBuf>,
    /// Folder present on both sides: recurse.
    pub recurse: Vec<(PathBuf, String)>,
    /// Local folder without a remote counterpart: create remotely, recurse.
    pub create_folders: Vec<PathBuf>,
    /// Remote entry known to the state but gone locally: delete remotely.
    pub delete_cloud: Vec<DriveEntry>,
    /// Remote document unknown to the state: new on the remote, pull down.
    pub download_new: Vec<(PathBuf, String)>,
    /// Remote folder unknown to the state: create locally, recurse.
    pub remote_new_folders: Vec<(PathBuf, String)>,
}

fn skip_local(name: &str) -> bool {
    name.starts_with('.')
        || SKIP_LOCAL_DIRS.contains(&name)
        || SKIP_LOCAL_SUFFIXES.iter().any(|s| name.ends_with(s))
}

/// Merge one directory level. Pure: all side effects are carried out by
/// the caller from the returned plan.
pub fn plan_directory(
    local_dir: &Path,
    local: &[LocalEntry],
    remote: &[DriveEntry],
    token_known: &dyn Fn(&str) -> bool,
) -> DirectoryPlan {
    let mut plan = DirectoryPlan::default();
    let mut used_tokens: Vec<&str> = Vec::new();

    for entry in local {
        if skip_local(&entry.name) {
            continue;
        }
        let local_path = local_dir.join(&entry.name);

        if entry.is_dir {
            match remote
                .iter()
                .find(|r| r.name == entry.name && r.kind == "folder")
            {
                Some(folder) => {
                    used_tokens.push(&folder.token);
                    plan.recurse.push((local_path, folder.token.clone()));
                }
                None => plan.create_folders.push(local_path),
            }
        } else if entry.name.ends_with(".md") {
            let doc_name = &entry.name[..entry.name.len() - 3];
            match remote
                .iter()
                .find(|r| r.name == doc_name && r.kind == "docx")
            {
                Some(doc) => {
                    used_tokens.push(&doc.token);
                    plan.sync_existing.push((local_path, doc.token.clone()));
                }
                None => plan.create_docs.push(local_path),
            }
        }
    }

    for entry in remote {
        if used_tokens.contains(&entry.token.as_str()) {
            continue;
        }
        if PROTECTED_REMOTE_NAMES.contains(&entry.name.as_str()) {
            continue;
        }

        if token_known(&entry.token) {
            // Known mapping with no local counterpart: deleted locally.
            plan.delete_cloud.push(entry.clone());
            continue;
        }

        match entry.kind.as_str() {
            "docx" => {
                let local_path = local_dir.join(format!("{}.md", entry.name));
                plan.download_new.push((local_path, entry.token.clone()));
            }
            "folder" => {
                let local_path = local_dir.join(&entry.name);
                plan.remote_new_folders
                    .push((local_path, entry.token.clone()));
            }
            other => {
                tracing::debug!("skipping remote entry '{}' of kind {other}", entry.name);
            }
        }
    }

    plan
}

#[derive(Debug, Clone)]
pub enum SyncTask {
    Sync {
        local_path: PathBuf,
        token: String,
        is_new: bool,
    },
    DeleteCloud {
        token: String,
        remote_kind: String,
        /// Local path recorded in the state, for logging and pruning.
        local_path: PathBuf,
    },
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncStats {
    pub created: u32,
    pub updated: u32,
    pub skipped: u32,
    pub deleted_cloud: u32,
    pub deleted_local: u32,
    pub failed: u32,
}

pub struct FolderSync {
    gateway: Arc<FeishuGateway>,
    state: Arc<SyncState>,
    index: Arc<ResourceIndex>,
    vault_root: PathBuf,
    batch_id: String,
    workers: usize,
    diff_threshold: usize,
    force: bool,
    overwrite: bool,
    debug_dump: bool,
}

impl FolderSync {
    pub fn new(
        gateway: Arc<FeishuGateway>,
        config: &Config,
        vault_root: PathBuf,
        batch_id: String,
        force: bool,
        overwrite: bool,
        debug_dump: bool,
    ) -> Self {
        let state = Arc::new(SyncState::open(&vault_root));
        let index = Arc::new(ResourceIndex::build(&vault_root));
        FolderSync {
            gateway,
            state,
            index,
            vault_root,
            batch_id,
            workers: config.max_parallel_workers.max(1),
            diff_threshold: config.diff_threshold,
            force,
            overwrite,
            debug_dump,
        }
    }

    /// Walk both trees, then run the collected tasks on the worker pool.
    pub async fn run(&self, local_root: &Path, cloud_root_token: &str) -> anyhow::Result<SyncStats> {
        tracing::info!(
            "folder sync: {} -> {cloud_root_token}",
            local_root.display()
        );
        let stats = Arc::new(Mutex::new(SyncStats::default()));
        let tasks = self
            .collect_tasks(local_root.to_path_buf(), cloud_root_token.to_string(), &stats)
            .await?;

        if tasks.is_empty() {
            tracing::info!("nothing to sync");
            return Ok(*stats.lock());
        }
        tracing::info!("{} task(s), {} parallel worker(s)", tasks.len(), self.workers);

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let total = tasks.len();
        let completed = Arc::new(Mutex::new(0usize));
        let mut join_set = JoinSet::new();

        for task in tasks {
            let permit_source = semaphore.clone();
            let gateway = self.gateway.clone();
            let state = self.state.clone();
            let index = self.index.clone();
            let stats = stats.clone();
            let completed = completed.clone();
            let vault_root = self.vault_root.clone();
            let batch_id = self.batch_id.clone();
            let diff_threshold = self.diff_threshold;
            let force = self.force;
            let overwrite = self.overwrite;
            let debug_dump = self.debug_dump;

            join_set.spawn(async move {
                let _permit = permit_source.acquire_owned().await;
                let result = execute_task(
                    &task,
                    &gateway,
                    &state,
                    &index,
                    &vault_root,
                    &batch_id,
                    diff_threshold,
                    force,
                    overwrite,
                    debug_dump,
                )
                .await;

                let mut stats = stats.lock();
                match result {
                    Ok(TaskResult::Created) => stats.created += 1,
                    Ok(TaskResult::Updated) => stats.updated += 1,
                    Ok(TaskResult::Skipped) => stats.skipped += 1,
                    Ok(TaskResult::DeletedCloud) => stats.deleted_cloud += 1,
                    Err(err) => {
                        stats.failed += 1;
                        let path = match &task {
                            SyncTask::Sync { local_path, .. }
                            | SyncTask::DeleteCloud { local_path, .. } => local_path,
                        };
                        tracing::error!("task failed for {}: {err}", path.display());
                    }
                }
                let mut done = completed.lock();
                *done += 1;
                tracing::info!("progress: {}/{total}", *done);
            });
        }

        while join_set.join_next().await.is_some() {}

        let stats = *stats.lock();
        tracing::info!(
            created = stats.created,
            updated = stats.updated,
            skipped = stats.skipped,
            deleted_cloud = stats.deleted_cloud,
            failed = stats.failed,
            "folder sync summary"
        );
        Ok(stats)
    }

    /// Recursive merge of the two trees into a task list. Folder and
    /// document creation happen during collection so recursion has tokens
    /// to descend into; document content sync is deferred to the pool.
    fn collect_tasks<'a>(
        &'a self,
        local_dir: PathBuf,
        cloud_token: String,
        stats: &'a Arc<Mutex<SyncStats>>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<Vec<SyncTask>>> + Send + 'a>>
    {
        Box::pin(async move {
            let mut tasks = Vec::new();

            let local_entries = match read_local_entries(&local_dir) {
                Ok(entries) => entries,
                Err(err) => {
                    tracing::error!("cannot read directory {}: {err}", local_dir.display());
                    stats.lock().failed += 1;
                    return Ok(tasks);
                }
            };
            let remote_entries = self.gateway.list_folder(&cloud_token).await?;
            let state = self.state.clone();
            let plan = plan_directory(&local_dir, &local_entries, &remote_entries, &|token| {
                state.get_by_token(token).is_some()
            });

            for (path, token) in plan.sync_existing {
                self.state.update(&path, &token, EntryKind::Document);
                tasks.push(SyncTask::Sync {
                    local_path: path,
                    token,
                    is_new: false,
                });
            }

            for path in plan.create_docs {
                let doc_name = path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default();
                match self.gateway.create_document(&cloud_token, &doc_name).await {
                    Ok(token) => {
                        self.state.update(&path, &token, EntryKind::Document);
                        tasks.push(SyncTask::Sync {
                            local_path: path,
                            token,
                            is_new: true,
                        });
                    }
                    Err(err) => {
                        tracing::error!("failed to create document '{doc_name}': {err}");
                        stats.lock().failed += 1;
                    }
                }
            }

            for (path, token) in plan.recurse {
                self.state.update(&path, &token, EntryKind::Folder);
                tasks.extend(self.collect_tasks(path, token, stats).await?);
            }

            for path in plan.create_folders {
                let name = path
                    .file_name()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default();
                match self.gateway.create_folder(&cloud_token, &name).await {
                    Ok(token) => {
                        self.state.update(&path, &token, EntryKind::Folder);
                        tasks.extend(self.collect_tasks(path, token, stats).await?);
                    }
                    Err(err) => {
                        tracing::error!("failed to create folder '{name}': {err}");
                        stats.lock().failed += 1;
                    }
                }
            }

            for entry in plan.delete_cloud {
                let local_path = self
                    .state
                    .get_by_token(&entry.token)
                    .map(|(rel, _)| self.vault_root.join(rel))
                    .unwrap_or_else(|| local_dir.join(&entry.name));
                tracing::info!(
                    "local deletion detected for '{}', scheduling remote delete",
                    entry.name
                );
                tasks.push(SyncTask::DeleteCloud {
                    token: entry.token,
                    remote_kind: entry.kind,
                    local_path,
                });
            }

            for (path, token) in plan.download_new {
                tracing::info!("new remote document, will pull to {}", path.display());
                tasks.push(SyncTask::Sync {
                    local_path: path,
                    token,
                    is_new: false,
                });
            }

            for (path, token) in plan.remote_new_folders {
                if !path.exists() {
                    std::fs::create_dir_all(&path)?;
                    tracing::info!("created local folder {}", path.display());
                }
                self.state.update(&path, &token, EntryKind::Folder);
                tasks.extend(self.collect_tasks(path, token, stats).await?);
            }

            Ok(tasks)
        })
    }
}

enum TaskResult {
    Created,
    Updated,
    Skipped,
    DeletedCloud,
}

#[allow(clippy::too_many_arguments)]
async fn execute_task(
    task: &SyncTask,
    gateway: &FeishuGateway,
    state: &SyncState,
    index: &ResourceIndex,
    vault_root: &Path,
    batch_id: &str,
    diff_threshold: usize,
    force: bool,
    overwrite: bool,
    debug_dump: bool,
) -> anyhow::Result<TaskResult> {
    match task {
        SyncTask::DeleteCloud {
            token,
            remote_kind,
            local_path,
        } => {
            gateway.delete_file(token, remote_kind).await?;
            if remote_kind == "folder" {
                state.remove_directory(local_path);
            } else {
                state.remove_by_token(token);
            }
            Ok(TaskResult::DeletedCloud)
        }
        SyncTask::Sync {
            local_path,
            token,
            is_new,
        } => {
            let doc_sync = DocumentSync {
                gateway,
                index,
                state: Some(state),
                vault_root: vault_root.to_path_buf(),
                batch_id: batch_id.to_string(),
                diff_threshold,
            };
            let outcome = doc_sync
                .run(
                    local_path,
                    token,
                    DocumentSyncOptions {
                        force: force || *is_new,
                        overwrite,
                        debug_dump,
                    },
                )
                .await?;
            Ok(match (is_new, outcome) {
                (true, _) => TaskResult::Created,
                (false, SyncOutcome::Unchanged) => TaskResult::Skipped,
                (false, _) => TaskResult::Updated,
            })
        }
    }
}

fn read_local_entries(dir: &Path) -> anyhow::Result<Vec<LocalEntry>> {
    let mut entries = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        entries.push(LocalEntry {
            name: entry.file_name().to_string_lossy().into_owned(),
            is_dir: entry.file_type()?.is_dir(),
        });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}
