//! Drive (folder and file) operations.

use serde_json::{json, Value};

use crate::error::{Result, SyncError};

use super::FeishuGateway;

const FOLDER_PAGE_SIZE: usize = 200;

/// One entry of a folder listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriveEntry {
    pub name: String,
    pub token: String,
    /// Remote kind string: "docx", "folder", "file", "sheet", ...
    pub kind: String,
}

#[derive(Debug, Clone)]
pub struct DocumentMeta {
    /// Remote modification time. Seconds or milliseconds; see
    /// [`crate::sync::document::parse_remote_time`].
    pub latest_modify_time: i64,
}

impl FeishuGateway {
    /// List a folder's entries, following pagination.
    pub async fn list_folder(&self, folder_token: &str) -> Result<Vec<DriveEntry>> {
        let url = self.url("/drive/v1/files");
        let mut entries = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let page = page_token.clone();
            let folder = folder_token.to_string();
            let data = self
                .request_json(|http, token| {
                    let mut req = http.get(&url).bearer_auth(token).query(&[
                        ("folder_token", folder.clone()),
                        ("page_size", FOLDER_PAGE_SIZE.to_string()),
                    ]);
                    if let Some(page) = &page {
                        req = req.query(&[("page_token", page.clone())]);
                    }
                    req
                })
                .await?;

            if let Some(files) = data.pointer("/data/files").and_then(Value::as_array) {
                for file in files {
                    entries.push(DriveEntry {
                        name: file
                            .get("name")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        token: file
                            .get("token")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        kind: file
                            .get("type")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                    });
                }
            }
            page_token = data
                .pointer("/data/next_page_token")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string);
            if page_token.is_none() {
                break;
            }
        }
        Ok(entries)
    }

    pub async fn create_folder(&self, parent_token: &str, name: &str) -> Result<String> {
        let url = self.url("/drive/v1/files/create_folder");
        let body = json!({ "name": name, "folder_token": parent_token });
        let data = self
            .request_json(|http, token| http.post(&url).bearer_auth(token).json(&body))
            .await?;
        data.pointer("/data/token")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| SyncError::api(-1, "missing token in create_folder response"))
    }

    /// Delete a file or folder by token. `kind` must match the entry's
    /// remote kind ("docx", "folder", "file", ...).
    pub async fn delete_file(&self, file_token: &str, kind: &str) -> Result<()> {
        let url = self.url(&format!("/drive/v1/files/{file_token}"));
        let kind = kind.to_string();
        self.request_json(|http, token| {
            http.delete(&url)
                .bearer_auth(token)
                .query(&[("type", kind.clone())])
        })
        .await?;
        Ok(())
    }

    /// Document metadata, in particular its remote modification time.
    /// Returns `None` when the token cannot be resolved.
    pub async fn get_document_meta(&self, doc_token: &str) -> Result<Option<DocumentMeta>> {
        let url = self.url("/drive/v1/metas/batch_query");
        let body = json!({
            "request_docs": [{ "doc_token": doc_token, "doc_type": "docx" }],
            "with_url": false,
        });
        let data = match self
            .request_json(|http, token| http.post(&url).bearer_auth(token).json(&body))
            .await
        {
            Ok(data) => data,
            Err(SyncError::Api { code, msg }) => {
                tracing::warn!("meta query failed for {doc_token}: {code} {msg}");
                return Ok(None);
            }
            Err(err) => return Err(err),
        };

        let meta = data
            .pointer("/data/metas/0")
            .and_then(|meta| meta.get("latest_modify_time"))
            .and_then(|t| match t {
                Value::String(s) => s.parse::<i64>().ok(),
                Value::Number(n) => n.as_i64(),
                _ => None,
            })
            .map(|latest_modify_time| DocumentMeta { latest_modify_time });
        Ok(meta)
    }

    /// Root folder ("My Space") token.
    pub async fn get_root_folder_token(&self) -> Result<String> {
        let url = self.url("/drive/explorer/v2/root_folder/meta");
        let data = self
            .request_json(|http, token| http.get(&url).bearer_auth(token))
            .await?;
        data.pointer("/data/token")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| SyncError::api(-1, "missing root folder token"))
    }

    /// Well-known assets folder at the drive root, created on demand.
    pub async fn get_or_create_assets_folder(&self) -> Result<String> {
        let root = self.get_root_folder_token().await?;
        let entries = self.list_folder(&root).await?;
        if let Some(existing) = entries
            .iter()
            .find(|e| e.name == "_assets" && e.kind == "folder")
        {
            return Ok(existing.token.clone());
        }
        self.create_folder(&root, "_assets").await
    }

    /// Token of the folder standalone file uploads land in: the configured
    /// `feishu_assets_token` when set, else the `_assets` folder, resolved
    /// once and cached.
    pub async fn assets_folder_token(&self) -> Result<String> {
        {
            let cached = self.assets_folder.read().await;
            if let Some(token) = cached.as_ref() {
                return Ok(token.clone());
            }
        }
        let mut cached = self.assets_folder.write().await;
        if let Some(token) = cached.as_ref() {
            return Ok(token.clone());
        }
        let token = self.get_or_create_assets_folder().await?;
        *cached = Some(token.clone());
        Ok(token)
    }
}
