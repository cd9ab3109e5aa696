//! Single-document sync lifecycle.
//!
//! Direction is decided by modification time: a newer remote pulls down
//! (after backing up the local file), anything else pushes up through the
//! tree-diff reconciler. Timestamps from the remote may be seconds or
//! milliseconds; magnitude disambiguates.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::block::wire::WireBlock;
use crate::block::{AssetRef, Block, BlockContent};
use crate::convert::{
    emit_markdown, parse_markdown, AssetSink, AssetSource, DownloadedAssets, EmitOptions,
    ParseOptions, ResourceResolver,
};
use crate::error::SyncError;
use crate::gateway::{AssetParent, FeishuGateway};
use crate::sync::diff::{apply_plan, plan_sync, SyncPlan};
use crate::sync::resource::ResourceIndex;
use crate::sync::state::{EntryKind, SyncState};

/// Remote timestamps larger than this are milliseconds. The magnitude test
/// misreads second-resolution times starting in the year 2286.
const MILLISECOND_FLOOR: i64 = 10_000_000_000;

pub fn parse_remote_time(raw: i64) -> f64 {
    if raw > MILLISECOND_FLOOR {
        raw as f64 / 1000.0
    } else {
        raw as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Uploaded,
    Downloaded,
    Unchanged,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DocumentSyncOptions {
    /// Upload even when the remote copy is newer.
    pub force: bool,
    /// Skip the diff and overwrite the remote wholesale.
    pub overwrite: bool,
    /// Log the remote block structure after syncing.
    pub debug_dump: bool,
}

/// Resolves references against the vault index, falling back to the
/// document's own directory.
pub struct VaultResolver<'a> {
    pub index: &'a ResourceIndex,
    pub doc_dir: PathBuf,
}

impl ResourceResolver for VaultResolver<'_> {
    fn resolve(&self, reference: &str) -> Option<PathBuf> {
        if let Some(found) = self.index.find(reference) {
            return Some(found);
        }
        let candidate = self.doc_dir.join(reference);
        if candidate.exists() {
            return Some(candidate);
        }
        tracing::warn!("local resource not found: {reference}");
        None
    }
}

/// Gateway-backed implementation of the asset capabilities.
pub struct GatewayAssets<'a> {
    pub gateway: &'a FeishuGateway,
    /// Parent node for uploads (the document id).
    pub parent_node: String,
    /// Directory downloaded assets are written into.
    pub attachments_dir: PathBuf,
    /// Vault-relative prefix for emitted references.
    pub attachments_prefix: String,
}

#[async_trait::async_trait]
impl AssetSink for GatewayAssets<'_> {
    async fn upload_image(&self, path: &Path) -> anyhow::Result<String> {
        Ok(self
            .gateway
            .upload_asset(path, &self.parent_node, AssetParent::DocImage)
            .await?)
    }

    async fn upload_file(&self, path: &Path) -> anyhow::Result<String> {
        // Non-image attachments live under the shared drive assets folder
        // and are referenced from the document by token.
        let folder = self.gateway.assets_folder_token().await?;
        Ok(self
            .gateway
            .upload_asset(path, &folder, AssetParent::Explorer)
            .await?)
    }
}

#[async_trait::async_trait]
impl AssetSource for GatewayAssets<'_> {
    async fn download(&self, token: &str) -> anyhow::Result<String> {
        let file_name = format!("{token}.png");
        let dest = self.attachments_dir.join(&file_name);
        self.gateway.download_asset(token, &dest).await?;
        Ok(format!("{}/{file_name}", self.attachments_prefix))
    }
}

/// Replace resolved local asset placeholders with remote tokens. Upload
/// failures mark the placeholder unresolved and keep going; the block will
/// hash differently from a fresh parse, so a later run retries.
pub async fn resolve_local_assets(blocks: &mut [Block], sink: &dyn AssetSink) {
    let mut uploaded: HashMap<PathBuf, String> = HashMap::new();
    for block in blocks.iter_mut() {
        resolve_block_assets(block, sink, &mut uploaded).await;
    }
}

async fn resolve_block_assets(
    block: &mut Block,
    sink: &dyn AssetSink,
    uploaded: &mut HashMap<PathBuf, String>,
) {
    let is_image = matches!(block.content, BlockContent::Image(_));
    let asset = match &mut block.content {
        BlockContent::Image(asset) => Some(asset),
        BlockContent::File { asset, .. } => Some(asset),
        _ => None,
    };
    if let Some(asset) = asset {
        if let AssetRef::Local { path, resolved } = asset {
            if *resolved {
                let path = path.clone();
                let token = match uploaded.get(&path) {
                    Some(token) => Ok(token.clone()),
                    None => {
                        let fresh = if is_image {
                            sink.upload_image(&path).await
                        } else {
                            sink.upload_file(&path).await
                        };
                        if let Ok(token) = &fresh {
                            uploaded.insert(path.clone(), token.clone());
                        }
                        fresh
                    }
                };
                match token {
                    Ok(token) => *asset = AssetRef::Remote(token),
                    Err(err) => {
                        tracing::warn!("asset upload failed for {}: {err}", path.display());
                        if let AssetRef::Local { resolved, .. } = asset {
                            *resolved = false;
                        }
                    }
                }
            }
        }
    }

    for child in &mut block.children {
        Box::pin(resolve_block_assets(child, sink, uploaded)).await;
    }
}

/// Download every image referenced by the tree, producing the token → path
/// map the emitter consumes. Failures are logged and left out of the map,
/// which makes the emitter write the failure marker.
pub async fn download_remote_assets(blocks: &[Block], source: &dyn AssetSource) -> DownloadedAssets {
    let mut tokens = Vec::new();
    for block in blocks {
        block.walk(&mut |b| {
            if let BlockContent::Image(AssetRef::Remote(token)) = &b.content {
                if !token.is_empty() {
                    tokens.push(token.clone());
                }
            }
        });
    }

    let mut map = DownloadedAssets::new();
    for token in tokens {
        if map.contains_key(&token) {
            continue;
        }
        match source.download(&token).await {
            Ok(rel_path) => {
                map.insert(token, rel_path);
            }
            Err(err) => tracing::warn!("asset download failed for {token}: {err}"),
        }
    }
    map
}

/// Rebuild the block tree from a flat remote listing. Children are ordered
/// by their parent's child-id list; the page root itself is dropped.
pub fn build_tree(flat: Vec<WireBlock>) -> Vec<Block> {
    let mut by_id: HashMap<String, WireBlock> = HashMap::new();
    let mut order: Vec<String> = Vec::new();
    let mut page_children: Option<Vec<String>> = None;

    for wire in flat {
        if matches!(wire.block.content, BlockContent::Page) {
            page_children = Some(wire.child_ids.clone());
            continue;
        }
        order.push(wire.block.id.clone());
        by_id.insert(wire.block.id.clone(), wire);
    }

    let root_ids: Vec<String> = match page_children {
        Some(ids) => ids,
        // No page block in the listing: treat parentless blocks as roots,
        // in listing order.
        None => order
            .iter()
            .filter(|id| {
                by_id
                    .get(*id)
                    .map(|w| {
                        w.block
                            .parent_id
                            .as_ref()
                            .map(|p| !by_id.contains_key(p))
                            .unwrap_or(true)
                    })
                    .unwrap_or(false)
            })
            .cloned()
            .collect(),
    };

    fn assemble(id: &str, by_id: &mut HashMap<String, WireBlock>) -> Option<Block> {
        let wire = by_id.remove(id)?;
        let mut block = wire.block;
        for child_id in &wire.child_ids {
            if let Some(child) = assemble(child_id, by_id) {
                block.children.push(child);
            }
        }
        Some(block)
    }

    let mut roots = Vec::new();
    for id in &root_ids {
        if let Some(block) = assemble(id, &mut by_id) {
            roots.push(block);
        }
    }
    roots
}

/// Attachment folder from `.obsidian/app.json`, defaulting to
/// `attachments`.
pub fn attachment_folder(vault_root: &Path) -> String {
    let config_path = vault_root.join(".obsidian").join("app.json");
    std::fs::read_to_string(&config_path)
        .ok()
        .and_then(|s| serde_json::from_str::<serde_json::Value>(&s).ok())
        .and_then(|v| {
            v.get("attachmentFolderPath")
                .and_then(|p| p.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| "attachments".to_string())
}

pub struct DocumentSync<'a> {
    pub gateway: &'a FeishuGateway,
    pub index: &'a ResourceIndex,
    pub state: Option<&'a SyncState>,
    pub vault_root: PathBuf,
    pub batch_id: String,
    pub diff_threshold: usize,
}

impl DocumentSync<'_> {
    /// Sync one local file against its remote document.
    pub async fn run(
        &self,
        md_path: &Path,
        doc_token: &str,
        opts: DocumentSyncOptions,
    ) -> anyhow::Result<SyncOutcome> {
        let local_mtime = file_mtime(md_path);

        let meta = self.gateway.get_document_meta(doc_token).await?;
        let remote_mtime = meta.map(|m| parse_remote_time(m.latest_modify_time));

        let download = match (local_mtime, remote_mtime) {
            // Nothing local: the document is new on the remote side.
            (None, Some(_)) => true,
            (None, None) => {
                return Err(SyncError::InvalidTarget(format!(
                    "{} does not exist locally or remotely",
                    md_path.display()
                ))
                .into());
            }
            (Some(_), None) => false,
            (Some(local), Some(remote)) => remote > local && !opts.force,
        };

        if download {
            match self.sync_remote_to_local(md_path, doc_token).await? {
                // An empty remote document means nothing to pull; push
                // instead when there is a local file to push.
                None if local_mtime.is_some() => {}
                None => return Ok(SyncOutcome::Unchanged),
                Some(()) => {
                    self.record(md_path, doc_token);
                    return Ok(SyncOutcome::Downloaded);
                }
            }
        }

        let outcome = self.sync_local_to_remote(md_path, doc_token, opts).await?;
        self.record(md_path, doc_token);
        if opts.debug_dump {
            self.dump_remote_structure(doc_token).await;
        }
        Ok(outcome)
    }

    fn record(&self, md_path: &Path, doc_token: &str) {
        if let Some(state) = self.state {
            state.update(md_path, doc_token, EntryKind::Document);
        }
    }

    /// Pull: fetch blocks, download assets, emit Markdown, back up, write.
    /// Returns `None` when the remote document has no content.
    async fn sync_remote_to_local(
        &self,
        md_path: &Path,
        doc_token: &str,
    ) -> anyhow::Result<Option<()>> {
        let flat = self.gateway.list_document_blocks(doc_token).await?;
        let roots = build_tree(flat);
        if roots.is_empty() {
            return Ok(None);
        }

        let folder = attachment_folder(&self.vault_root);
        let assets = GatewayAssets {
            gateway: self.gateway,
            parent_node: doc_token.to_string(),
            attachments_dir: self.vault_root.join(&folder),
            attachments_prefix: folder,
        };
        let downloaded = download_remote_assets(&roots, &assets).await;

        let markdown = emit_markdown(
            &roots,
            &EmitOptions {
                assets: Some(&downloaded),
            },
        );

        if md_path.exists() {
            let backup = backup_path(md_path, &self.batch_id);
            std::fs::copy(md_path, &backup)
                .with_context(|| format!("failed to back up {}", md_path.display()))?;
            tracing::info!("backed up {} -> {}", md_path.display(), backup.display());
        }
        if let Some(parent) = md_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(md_path, markdown)
            .with_context(|| format!("failed to write {}", md_path.display()))?;
        tracing::info!("downloaded {doc_token} -> {}", md_path.display());
        Ok(Some(()))
    }

    /// Push: parse, upload assets, diff against the remote tree, apply.
    async fn sync_local_to_remote(
        &self,
        md_path: &Path,
        doc_token: &str,
        opts: DocumentSyncOptions,
    ) -> anyhow::Result<SyncOutcome> {
        let content = std::fs::read_to_string(md_path).map_err(|err| {
            SyncError::InvalidTarget(format!("unreadable local file {}: {err}", md_path.display()))
        })?;

        let resolver = VaultResolver {
            index: self.index,
            doc_dir: md_path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(".")),
        };
        let mut local = parse_markdown(
            &content,
            &ParseOptions {
                resolver: Some(&resolver),
            },
        );

        let folder = attachment_folder(&self.vault_root);
        let assets = GatewayAssets {
            gateway: self.gateway,
            parent_node: doc_token.to_string(),
            attachments_dir: self.vault_root.join(&folder),
            attachments_prefix: folder,
        };
        resolve_local_assets(&mut local, &assets).await;

        let flat = self.gateway.list_document_blocks(doc_token).await?;
        let remote = build_tree(flat);

        let plan = if opts.overwrite {
            SyncPlan::FullOverwrite
        } else {
            plan_sync(&remote, &local, self.diff_threshold)
        };

        match &plan {
            SyncPlan::Unchanged => {
                tracing::info!("{} already in sync", md_path.display());
            }
            SyncPlan::FullOverwrite => {
                tracing::info!("{} -> {doc_token}: full overwrite", md_path.display());
            }
            SyncPlan::Incremental { ops, updates } => {
                tracing::info!(
                    "{} -> {doc_token}: {} structural ops, {} in-place updates",
                    md_path.display(),
                    ops.len(),
                    updates.len()
                );
            }
        }

        let changed = apply_plan(self.gateway, doc_token, &plan, &local).await?;
        Ok(if changed {
            SyncOutcome::Uploaded
        } else {
            SyncOutcome::Unchanged
        })
    }

    async fn dump_remote_structure(&self, doc_token: &str) {
        match self.gateway.list_document_blocks(doc_token).await {
            Ok(flat) => {
                let roots = build_tree(flat);
                fn dump(block: &Block, depth: usize) {
                    let text = block.body().map(|b| b.plain_text()).unwrap_or_default();
                    tracing::debug!(
                        "{}- [{}] {}",
                        "  ".repeat(depth),
                        block.type_code(),
                        text.trim()
                    );
                    for child in &block.children {
                        dump(child, depth + 1);
                    }
                }
                for root in &roots {
                    dump(root, 1);
                }
            }
            Err(err) => tracing::warn!("structure dump failed: {err}"),
        }
    }
}

pub fn backup_path(md_path: &Path, batch_id: &str) -> PathBuf {
    PathBuf::from(format!("{}.bak.{batch_id}", md_path.display()))
}

fn file_mtime(path: &Path) -> Option<f64> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    modified
        .duration_since(std::time::UNIX_EPOCH)
        .ok()
        .map(|d| d.as_secs_f64())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::wire::{from_wire, to_wire};
    use crate::block::{TextBody, TextElement, TextRun};
    use parking_lot::Mutex;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn magnitude_disambiguates_seconds_from_milliseconds() {
        assert_eq!(parse_remote_time(1_700_000_000), 1_700_000_000.0);
        assert_eq!(parse_remote_time(1_700_000_000_000), 1_700_000_000.0);
    }

    #[test]
    fn build_tree_orders_children_by_parent_ids() {
        let mut flat = Vec::new();
        let page = json!({
            "block_id": "doc", "block_type": 1, "page": { "elements": [] },
            "children": ["b2", "b1"],
        });
        flat.push(from_wire(&page).unwrap());
        for (id, text) in [("b1", "second"), ("b2", "first")] {
            let mut wire = to_wire(&Block::new(BlockContent::Text(TextBody::from_plain(text))));
            let obj = wire.as_object_mut().unwrap();
            obj.insert("block_id".into(), json!(id));
            obj.insert("parent_id".into(), json!("doc"));
            flat.push(from_wire(&wire).unwrap());
        }

        let roots = build_tree(flat);
        assert_eq!(roots.len(), 2);
        // Page child order wins over listing order.
        assert_eq!(roots[0].body().unwrap().plain_text(), "first");
        assert_eq!(roots[1].body().unwrap().plain_text(), "second");
    }

    #[test]
    fn build_tree_nests_children() {
        let page = json!({
            "block_id": "doc", "block_type": 1, "page": { "elements": [] },
            "children": ["bullet"],
        });
        let bullet = json!({
            "block_id": "bullet", "block_type": 12, "parent_id": "doc",
            "bullet": { "elements": [{ "text_run": { "content": "a" } }] },
            "children": ["sub"],
        });
        let sub = json!({
            "block_id": "sub", "block_type": 12, "parent_id": "bullet",
            "bullet": { "elements": [{ "text_run": { "content": "b" } }] },
        });
        let flat = vec![
            from_wire(&page).unwrap(),
            from_wire(&bullet).unwrap(),
            from_wire(&sub).unwrap(),
        ];
        let roots = build_tree(flat);
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].children.len(), 1);
        assert_eq!(roots[0].children[0].body().unwrap().plain_text(), "b");
    }

    struct FakeSink {
        uploads: Mutex<Vec<PathBuf>>,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl AssetSink for FakeSink {
        async fn upload_image(&self, path: &Path) -> anyhow::Result<String> {
            if self.fail {
                anyhow::bail!("upload rejected");
            }
            self.uploads.lock().push(path.to_path_buf());
            Ok(format!("tok_{}", path.file_stem().unwrap().to_string_lossy()))
        }

        async fn upload_file(&self, path: &Path) -> anyhow::Result<String> {
            self.upload_image(path).await
        }
    }

    #[tokio::test]
    async fn local_assets_are_uploaded_and_replaced() {
        let mut blocks = vec![Block::new(BlockContent::Image(AssetRef::Local {
            path: "a/pic.png".into(),
            resolved: true,
        }))];
        let sink = FakeSink {
            uploads: Mutex::new(Vec::new()),
            fail: false,
        };
        resolve_local_assets(&mut blocks, &sink).await;
        assert_eq!(
            blocks[0].content,
            BlockContent::Image(AssetRef::Remote("tok_pic".into()))
        );
    }

    #[tokio::test]
    async fn repeated_path_uploads_once() {
        let mut blocks = vec![
            Block::new(BlockContent::Image(AssetRef::Local {
                path: "pic.png".into(),
                resolved: true,
            })),
            Block::new(BlockContent::Image(AssetRef::Local {
                path: "pic.png".into(),
                resolved: true,
            })),
        ];
        let sink = FakeSink {
            uploads: Mutex::new(Vec::new()),
            fail: false,
        };
        resolve_local_assets(&mut blocks, &sink).await;
        assert_eq!(sink.uploads.lock().len(), 1);
    }

    #[tokio::test]
    async fn failed_upload_marks_placeholder_unresolved() {
        let mut blocks = vec![Block::new(BlockContent::Image(AssetRef::Local {
            path: "pic.png".into(),
            resolved: true,
        }))];
        let sink = FakeSink {
            uploads: Mutex::new(Vec::new()),
            fail: true,
        };
        resolve_local_assets(&mut blocks, &sink).await;
        assert_eq!(
            blocks[0].content,
            BlockContent::Image(AssetRef::Local {
                path: "pic.png".into(),
                resolved: false,
            })
        );
    }

    struct FakeSource;

    #[async_trait::async_trait]
    impl AssetSource for FakeSource {
        async fn download(&self, token: &str) -> anyhow::Result<String> {
            if token == "tok_bad" {
                anyhow::bail!("gone");
            }
            Ok(format!("attachments/{token}.png"))
        }
    }

    #[tokio::test]
    async fn downloads_cover_all_image_tokens_and_skip_failures() {
        let blocks = vec![
            Block::new(BlockContent::Image(AssetRef::Remote("tok_a".into()))),
            Block::new(BlockContent::Image(AssetRef::Remote("tok_bad".into()))),
            Block::with_children(
                BlockContent::Bullet(TextBody::from_plain("x")),
                vec![Block::new(BlockContent::Image(AssetRef::Remote(
                    "tok_b".into(),
                )))],
            ),
        ];
        let map = download_remote_assets(&blocks, &FakeSource).await;
        assert_eq!(map.len(), 2);
        assert_eq!(map["tok_a"], "attachments/tok_a.png");
        assert_eq!(map["tok_b"], "attachments/tok_b.png");
        assert!(!map.contains_key("tok_bad"));
    }

    #[test]
    fn attachment_folder_reads_obsidian_config() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(".obsidian")).unwrap();
        std::fs::write(
            dir.path().join(".obsidian/app.json"),
            r#"{ "attachmentFolderPath": "files/media" }"#,
        )
        .unwrap();
        assert_eq!(attachment_folder(dir.path()), "files/media");
    }

    #[test]
    fn attachment_folder_defaults_without_config() {
        let dir = TempDir::new().unwrap();
        assert_eq!(attachment_folder(dir.path()), "attachments");
    }

    #[test]
    fn backup_name_carries_batch_id() {
        let path = backup_path(Path::new("/v/notes/x.md"), "20260801_120000");
        assert_eq!(
            path,
            PathBuf::from("/v/notes/x.md.bak.20260801_120000")
        );
    }

    #[test]
    fn styles_do_not_affect_text_extraction() {
        let body = TextBody {
            elements: vec![TextElement::TextRun(TextRun {
                content: "t".into(),
                style: Default::default(),
            })],
        };
        let block = Block::new(BlockContent::Text(body));
        assert_eq!(block.body().unwrap().plain_text(), "t");
    }
}
