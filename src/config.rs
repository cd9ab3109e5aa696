//! Sync configuration (`sync_config.json`).
//!
//! App credentials, user tokens and the batch task list live here. The
//! gateway persists refreshed tokens back through [`save_tokens`], so the
//! file is both input and token store.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_FILE: &str = "sync_config.json";

/// Non-`equal` opcode count above which a full overwrite beats an
/// incremental sync. Heuristic; tune per vault.
pub const DEFAULT_DIFF_THRESHOLD: usize = 15;
pub const DEFAULT_MAX_PARALLEL_WORKERS: usize = 4;
/// Minimum milliseconds between outbound request starts (5 req/s).
pub const DEFAULT_RATE_LIMIT_MS: u64 = 200;
pub const DEFAULT_API_MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    #[serde(default)]
    pub note: String,
    pub local: String,
    pub cloud: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vault_root: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub overwrite: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub feishu_app_id: String,
    #[serde(default)]
    pub feishu_app_secret: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feishu_user_access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feishu_user_refresh_token: Option<String>,
    /// Drive folder receiving standalone file uploads.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feishu_assets_token: Option<String>,
    #[serde(default)]
    pub tasks: Vec<TaskConfig>,

    #[serde(default = "default_diff_threshold")]
    pub diff_threshold: usize,
    #[serde(default = "default_workers")]
    pub max_parallel_workers: usize,
    #[serde(default = "default_rate_limit_ms")]
    pub rate_limit_ms: u64,
    #[serde(default = "default_max_retries")]
    pub api_max_retries: u32,

    /// Where this config was loaded from; refreshed tokens are written
    /// back here.
    #[serde(skip)]
    pub path: Option<PathBuf>,
    /// Test seam for the asset cache location.
    #[serde(skip)]
    pub asset_cache_path: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}
fn default_diff_threshold() -> usize {
    DEFAULT_DIFF_THRESHOLD
}
fn default_workers() -> usize {
    DEFAULT_MAX_PARALLEL_WORKERS
}
fn default_rate_limit_ms() -> u64 {
    DEFAULT_RATE_LIMIT_MS
}
fn default_max_retries() -> u32 {
    DEFAULT_API_MAX_RETRIES
}

impl Default for Config {
    fn default() -> Self {
        Config {
            feishu_app_id: String::new(),
            feishu_app_secret: String::new(),
            feishu_user_access_token: None,
            feishu_user_refresh_token: None,
            feishu_assets_token: None,
            tasks: Vec::new(),
            diff_threshold: DEFAULT_DIFF_THRESHOLD,
            max_parallel_workers: DEFAULT_MAX_PARALLEL_WORKERS,
            rate_limit_ms: DEFAULT_RATE_LIMIT_MS,
            api_max_retries: DEFAULT_API_MAX_RETRIES,
            path: None,
            asset_cache_path: None,
        }
    }
}

impl Config {
    /// Load from a JSON file. A missing file yields defaults with the path
    /// remembered, so a later save creates it.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config: Config = match std::fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content)
                .with_context(|| format!("failed to parse {}", path.display()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Config::default(),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", path.display()))
            }
        };
        config.path = Some(path.to_path_buf());
        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let path = self
            .path
            .as_ref()
            .context("config has no backing file to save to")?;
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))
    }

    /// Tasks enabled for a batch run.
    pub fn enabled_tasks(&self) -> impl Iterator<Item = &TaskConfig> {
        self.tasks.iter().filter(|t| t.enabled)
    }
}

/// Persist a refreshed user token pair into an existing config file.
pub fn save_tokens(path: &Path, access: &str, refresh: Option<&str>) -> anyhow::Result<()> {
    let mut config = Config::load(path)?;
    config.feishu_user_access_token = Some(access.to_string());
    if let Some(refresh) = refresh {
        config.feishu_user_refresh_token = Some(refresh.to_string());
    }
    config.save()
}
