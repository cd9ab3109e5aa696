//! Bidirectional Markdown ↔ block-tree conversion.
//!
//! Both converters are pure: all network effects live behind the capability
//! traits below, so the sync layer can inject the gateway and tests can
//! inject fakes.

pub mod blocks_to_markdown;
pub mod markdown_to_blocks;

pub use blocks_to_markdown::{emit_markdown, EmitOptions};
pub use markdown_to_blocks::{parse_markdown, ParseOptions};

use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Resolves a document's resource reference (image, attachment) to a local
/// path. Backed by the vault resource index in production.
pub trait ResourceResolver: Send + Sync {
    fn resolve(&self, reference: &str) -> Option<PathBuf>;
}

/// Uploads local assets, returning their remote tokens. Implemented by the
/// gateway with content-hash deduplication.
#[async_trait::async_trait]
pub trait AssetSink: Send + Sync {
    async fn upload_image(&self, path: &Path) -> anyhow::Result<String>;
    async fn upload_file(&self, path: &Path) -> anyhow::Result<String>;
}

/// Downloads a remote asset, returning the vault-relative path it was
/// written to.
#[async_trait::async_trait]
pub trait AssetSource: Send + Sync {
    async fn download(&self, token: &str) -> anyhow::Result<String>;
}

/// Token → vault-relative path, produced by the pre-download pass and
/// consumed by the emitter.
pub type DownloadedAssets = HashMap<String, String>;
