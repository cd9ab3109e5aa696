//! Asset upload and download.
//!
//! Uploads are deduplicated by content hash: identical bytes upload at most
//! once per cache lifetime, regardless of path or worker.

use std::path::Path;

use serde_json::Value;

use crate::error::{Result, SyncError};

use super::asset_cache::file_sha256;
use super::{FeishuGateway, TRANSFER_TIMEOUT};

/// Where an uploaded asset is attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetParent {
    /// Image embedded in a document.
    DocImage,
    /// File attachment embedded in a document.
    DocFile,
    /// Standalone file under a drive folder.
    Explorer,
}

impl AssetParent {
    fn endpoint(self) -> &'static str {
        match self {
            AssetParent::DocImage | AssetParent::DocFile => "/drive/v1/medias/upload_all",
            AssetParent::Explorer => "/drive/v1/files/upload_all",
        }
    }

    fn parent_type(self) -> &'static str {
        match self {
            AssetParent::DocImage => "docx_image",
            AssetParent::DocFile => "docx_file",
            AssetParent::Explorer => "explorer",
        }
    }
}

impl FeishuGateway {
    /// Upload an asset, returning its remote token. A cache hit short
    /// circuits without any network traffic.
    pub async fn upload_asset(
        &self,
        local_path: &Path,
        parent_node: &str,
        parent: AssetParent,
    ) -> Result<String> {
        if !local_path.exists() {
            return Err(SyncError::InvalidTarget(format!(
                "asset not found: {}",
                local_path.display()
            )));
        }

        let content_hash = file_sha256(local_path)?;
        if let Some(token) = self.asset_cache.get(&content_hash) {
            tracing::debug!(
                "asset cache hit for {}: {token}",
                local_path.display()
            );
            return Ok(token);
        }

        let file_name = local_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "asset".to_string());
        let bytes = std::fs::read(local_path)?;
        let size = bytes.len();
        let url = self.url(parent.endpoint());
        let parent_node = parent_node.to_string();

        let data = self
            .request_json(move |http, token| {
                let part = reqwest::multipart::Part::bytes(bytes.clone())
                    .file_name(file_name.clone());
                let form = reqwest::multipart::Form::new()
                    .part("file", part)
                    .text("file_name", file_name.clone())
                    .text("parent_type", parent.parent_type())
                    .text("parent_node", parent_node.clone())
                    .text("size", size.to_string());
                http.post(&url)
                    .bearer_auth(token)
                    .timeout(TRANSFER_TIMEOUT)
                    .multipart(form)
            })
            .await?;

        let token = data
            .pointer("/data/file_token")
            .and_then(Value::as_str)
            .ok_or_else(|| SyncError::api(-1, "missing file_token in upload response"))?
            .to_string();
        self.asset_cache.insert(&content_hash, &token);
        Ok(token)
    }

    /// Download an asset to a local path, creating parent directories.
    pub async fn download_asset(&self, asset_token: &str, local_path: &Path) -> Result<()> {
        let url = self.url(&format!("/drive/v1/medias/{asset_token}/download"));
        let bytes = self
            .request_bytes(|http, token| {
                http.get(&url).bearer_auth(token).timeout(TRANSFER_TIMEOUT)
            })
            .await?;

        if let Some(parent) = local_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(local_path, &bytes)?;
        Ok(())
    }
}
