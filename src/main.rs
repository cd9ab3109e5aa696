//! Command-line entry point.
//!
//! Three modes: a single task from positional arguments, a batch run from
//! `sync_config.json`, and the backup utilities (`--restore`, `--clean`).
//! The process exits non-zero when any task in a batch fails.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use larksync::config::{Config, DEFAULT_CONFIG_FILE};
use larksync::gateway::FeishuGateway;
use larksync::sync::document::{DocumentSync, DocumentSyncOptions};
use larksync::sync::folder::FolderSync;
use larksync::sync::resource::ResourceIndex;
use larksync::sync::state::SyncState;
use larksync::{auth, restore};

#[derive(Parser, Debug)]
#[command(
    name = "larksync",
    version,
    about = "Sync an Obsidian vault with Feishu/Lark documents"
)]
struct Cli {
    /// Local Markdown file or folder.
    local_path: Option<PathBuf>,

    /// Remote document or folder token.
    cloud_token: Option<String>,

    /// Upload even when the remote copy is newer.
    #[arg(long)]
    force: bool,

    /// Skip diffing and overwrite the remote wholesale.
    #[arg(long)]
    overwrite: bool,

    /// Vault root for resolving resource links (auto-detected via
    /// .obsidian when omitted).
    #[arg(long, value_name = "PATH")]
    vault_root: Option<PathBuf>,

    /// Log the remote block structure after each sync.
    #[arg(long)]
    debug_dump: bool,

    /// Config file for credentials and batch tasks.
    #[arg(long, value_name = "PATH", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Browse and restore backup files under the given path.
    #[arg(long, value_name = "PATH")]
    restore: Option<PathBuf>,

    /// Delete *.bak.* files under the given path (default: current
    /// directory).
    #[arg(long, value_name = "PATH", num_args = 0..=1, default_missing_value = ".")]
    clean: Option<PathBuf>,

    /// Run the browser login flow and store the obtained tokens.
    #[arg(long)]
    login: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "larksync=info".into()),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(failed) if failed == 0 => ExitCode::SUCCESS,
        Ok(failed) => {
            tracing::error!("{failed} task(s) failed");
            ExitCode::FAILURE
        }
        Err(err) => {
            tracing::error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

/// Returns the number of failed tasks.
async fn run(cli: Cli) -> anyhow::Result<u32> {
    if let Some(path) = &cli.restore {
        restore::restore_interactive(path)?;
        return Ok(0);
    }
    if let Some(path) = &cli.clean {
        let removed = restore::clean_backups(path)?;
        println!("Removed {removed} backup file(s)");
        return Ok(0);
    }

    let config = Config::load(&cli.config)?;

    if cli.login {
        auth::login(&config, larksync::gateway::FEISHU_BASE_URL).await?;
        return Ok(0);
    }

    let gateway = Arc::new(FeishuGateway::new(&config));
    let batch_id = chrono::Local::now().format("%Y%m%d_%H%M%S").to_string();

    // Single task from positional arguments.
    if let (Some(local), Some(token)) = (&cli.local_path, &cli.cloud_token) {
        let failed = run_task(
            &gateway,
            &config,
            &batch_id,
            local,
            token,
            cli.force,
            cli.overwrite,
            cli.vault_root.as_deref(),
            cli.debug_dump,
        )
        .await?;
        return Ok(failed);
    }
    if cli.local_path.is_some() != cli.cloud_token.is_some() {
        anyhow::bail!("a single task needs both <LOCAL_PATH> and <CLOUD_TOKEN>");
    }

    // Batch run from config.
    if config.tasks.is_empty() {
        anyhow::bail!(
            "no tasks found in {} — pass <LOCAL_PATH> <CLOUD_TOKEN> or add tasks to the config",
            cli.config.display()
        );
    }

    let mut failed = 0u32;
    let mut total = 0u32;
    for task in config.enabled_tasks() {
        total += 1;
        if !task.note.is_empty() {
            tracing::info!("task: {}", task.note);
        }
        let result = run_task(
            &gateway,
            &config,
            &batch_id,
            Path::new(&task.local),
            &task.cloud,
            cli.force || task.force,
            cli.overwrite || task.overwrite,
            task.vault_root
                .as_deref()
                .map(Path::new)
                .or(cli.vault_root.as_deref()),
            cli.debug_dump,
        )
        .await;
        match result {
            Ok(task_failures) => failed += task_failures,
            Err(err) => {
                tracing::error!("task '{}' failed: {err:#}", task.note);
                failed += 1;
            }
        }
    }
    tracing::info!("batch done: {}/{total} task(s) clean", total - failed.min(total));
    Ok(failed)
}

#[allow(clippy::too_many_arguments)]
async fn run_task(
    gateway: &Arc<FeishuGateway>,
    config: &Config,
    batch_id: &str,
    local: &Path,
    cloud_token: &str,
    force: bool,
    overwrite: bool,
    vault_root: Option<&Path>,
    debug_dump: bool,
) -> anyhow::Result<u32> {
    let vault_root = vault_root
        .map(Path::to_path_buf)
        .or_else(|| find_vault_root(local))
        .unwrap_or_else(|| {
            if local.is_dir() {
                local.to_path_buf()
            } else {
                local.parent().map(Path::to_path_buf).unwrap_or_default()
            }
        });

    if local.is_dir() {
        let folder_sync = FolderSync::new(
            gateway.clone(),
            config,
            vault_root,
            batch_id.to_string(),
            force,
            overwrite,
            debug_dump,
        );
        let stats = folder_sync.run(local, cloud_token).await?;
        Ok(stats.failed)
    } else {
        let state = SyncState::open(&vault_root);
        let index = ResourceIndex::build(&vault_root);
        let doc_sync = DocumentSync {
            gateway: gateway.as_ref(),
            index: &index,
            state: Some(&state),
            vault_root,
            batch_id: batch_id.to_string(),
            diff_threshold: config.diff_threshold,
        };
        doc_sync
            .run(
                local,
                cloud_token,
                DocumentSyncOptions {
                    force,
                    overwrite,
                    debug_dump,
                },
            )
            .await?;
        Ok(0)
    }
}

/// Find the vault root by walking up to the nearest `.obsidian` directory.
fn find_vault_root(path: &Path) -> Option<PathBuf> {
    let start = if path.is_file() { path.parent()? } else { path };
    let mut current = start.canonicalize().ok()?;
    loop {
        if current.join(".obsidian").exists() {
            return Some(current);
        }
        if !current.pop() {
            return None;
        }
    }
}
