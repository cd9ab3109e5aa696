//! Document and block operations.

use serde_json::{json, Value};

use crate::block::wire::{self, WireBlock};
use crate::block::{Block, TextElement};
use crate::error::{Result, SyncError};

use super::FeishuGateway;

const BLOCK_PAGE_SIZE: usize = 500;

/// One operation within a `batch_update_blocks` call.
#[derive(Debug, Clone)]
pub enum BlockUpdate {
    ReplaceTextElements {
        block_id: String,
        elements: Vec<TextElement>,
    },
    UpdateTextStyle {
        block_id: String,
        style: Value,
        fields: Vec<u32>,
    },
    ReplaceImage {
        block_id: String,
        token: String,
    },
    ReplaceFile {
        block_id: String,
        token: String,
    },
    MergeTableCells {
        block_id: String,
        row_start_index: usize,
        row_end_index: usize,
        column_start_index: usize,
        column_end_index: usize,
    },
}

impl BlockUpdate {
    fn to_request(&self) -> Value {
        match self {
            BlockUpdate::ReplaceTextElements { block_id, elements } => json!({
                "block_id": block_id,
                "update_text_elements": { "elements": wire::elements_to_wire(elements) },
            }),
            BlockUpdate::UpdateTextStyle {
                block_id,
                style,
                fields,
            } => json!({
                "block_id": block_id,
                "update_text_style": { "style": style, "fields": fields },
            }),
            BlockUpdate::ReplaceImage { block_id, token } => json!({
                "block_id": block_id,
                "replace_image": { "token": token },
            }),
            BlockUpdate::ReplaceFile { block_id, token } => json!({
                "block_id": block_id,
                "replace_file": { "token": token },
            }),
            BlockUpdate::MergeTableCells {
                block_id,
                row_start_index,
                row_end_index,
                column_start_index,
                column_end_index,
            } => json!({
                "block_id": block_id,
                "merge_table_cells": {
                    "row_start_index": row_start_index,
                    "row_end_index": row_end_index,
                    "column_start_index": column_start_index,
                    "column_end_index": column_end_index,
                },
            }),
        }
    }
}

impl FeishuGateway {
    /// Create a document under a folder, returning its id.
    pub async fn create_document(&self, parent_folder: &str, title: &str) -> Result<String> {
        let url = self.url("/docx/v1/documents");
        let body = json!({ "title": title, "folder_token": parent_folder });
        let data = self
            .request_json(|http, token| http.post(&url).bearer_auth(token).json(&body))
            .await?;
        data.pointer("/data/document/document_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| SyncError::api(-1, "missing document_id in create response"))
    }

    /// All blocks of a document as a flat listing with parent pointers,
    /// following pagination. Unknown block types are skipped.
    pub async fn list_document_blocks(&self, document_id: &str) -> Result<Vec<WireBlock>> {
        let url = self.url(&format!("/docx/v1/documents/{document_id}/blocks"));
        let mut blocks = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let page = page_token.clone();
            let data = self
                .request_json(|http, token| {
                    let mut req = http
                        .get(&url)
                        .bearer_auth(token)
                        .query(&[("page_size", BLOCK_PAGE_SIZE.to_string())]);
                    if let Some(page) = &page {
                        req = req.query(&[("page_token", page.clone())]);
                    }
                    req
                })
                .await?;

            if let Some(items) = data.pointer("/data/items").and_then(Value::as_array) {
                blocks.extend(items.iter().filter_map(wire::from_wire));
            }
            page_token = data
                .pointer("/data/page_token")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string);
            if page_token.is_none() {
                break;
            }
        }
        Ok(blocks)
    }

    /// Children of a block (defaults to the document root), following
    /// pagination. With `with_descendants`, nested children are fetched
    /// recursively and appended to the flat result.
    pub async fn get_block_children(
        &self,
        document_id: &str,
        block_id: Option<&str>,
        with_descendants: bool,
    ) -> Result<Vec<WireBlock>> {
        let mut blocks = self
            .get_block_children_page(document_id, block_id)
            .await?;
        if with_descendants {
            let mut queue: Vec<String> = blocks
                .iter()
                .filter(|w| !w.child_ids.is_empty())
                .map(|w| w.block.id.clone())
                .collect();
            while let Some(parent) = queue.pop() {
                let children = self
                    .get_block_children_page(document_id, Some(&parent))
                    .await?;
                queue.extend(
                    children
                        .iter()
                        .filter(|w| !w.child_ids.is_empty())
                        .map(|w| w.block.id.clone()),
                );
                blocks.extend(children);
            }
        }
        Ok(blocks)
    }

    async fn get_block_children_page(
        &self,
        document_id: &str,
        block_id: Option<&str>,
    ) -> Result<Vec<WireBlock>> {
        let parent = block_id.unwrap_or(document_id);
        let url = self.url(&format!(
            "/docx/v1/documents/{document_id}/blocks/{parent}/children"
        ));
        let mut blocks = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let page = page_token.clone();
            let data = self
                .request_json(|http, token| {
                    let mut req = http
                        .get(&url)
                        .bearer_auth(token)
                        .query(&[("page_size", BLOCK_PAGE_SIZE.to_string())]);
                    if let Some(page) = &page {
                        req = req.query(&[("page_token", page.clone())]);
                    }
                    req
                })
                .await?;

            if let Some(items) = data.pointer("/data/items").and_then(Value::as_array) {
                blocks.extend(items.iter().filter_map(wire::from_wire));
            }
            page_token = data
                .pointer("/data/page_token")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string);
            if page_token.is_none() {
                break;
            }
        }
        Ok(blocks)
    }

    /// Add blocks under a parent (defaults to the document root) at the
    /// given index, one request per block. A block that carries children
    /// goes through the descendants endpoint so its whole subtree is
    /// created in a single request.
    pub async fn add_blocks(
        &self,
        document_id: &str,
        parent_block: Option<&str>,
        blocks: &[Block],
        index: Option<usize>,
    ) -> Result<()> {
        let parent = parent_block.unwrap_or(document_id);
        for (offset, block) in blocks.iter().enumerate() {
            let at = index.map(|i| i + offset);
            if block.children.is_empty() {
                self.create_children(document_id, parent, std::slice::from_ref(block), at)
                    .await?;
            } else {
                self.create_descendants(document_id, parent, block, at)
                    .await?;
            }
        }
        Ok(())
    }

    async fn create_children(
        &self,
        document_id: &str,
        parent: &str,
        blocks: &[Block],
        index: Option<usize>,
    ) -> Result<()> {
        let url = self.url(&format!(
            "/docx/v1/documents/{document_id}/blocks/{parent}/children"
        ));
        let mut body = json!({
            "children": blocks.iter().map(wire::to_wire).collect::<Vec<_>>(),
        });
        if let Some(index) = index {
            body["index"] = json!(index);
        }
        self.request_json(|http, token| http.post(&url).bearer_auth(token).json(&body))
            .await?;
        Ok(())
    }

    /// Create a whole subtree in one request via the descendants endpoint.
    /// Blocks are flattened depth-first with temporary ids wiring up the
    /// parent/child graph.
    async fn create_descendants(
        &self,
        document_id: &str,
        parent: &str,
        block: &Block,
        index: Option<usize>,
    ) -> Result<()> {
        let url = self.url(&format!(
            "/docx/v1/documents/{document_id}/blocks/{parent}/descendant"
        ));
        let mut descendants = Vec::new();
        let mut counter = 0usize;
        let root_id = flatten_descendants(block, &mut descendants, &mut counter);

        let mut body = json!({
            "children_id": [root_id],
            "descendants": descendants,
        });
        if let Some(index) = index {
            body["index"] = json!(index);
        }
        self.request_json(|http, token| http.post(&url).bearer_auth(token).json(&body))
            .await?;
        Ok(())
    }

    /// Delete the children of a parent block in `[start_index, end_index)`.
    pub async fn delete_block_children(
        &self,
        document_id: &str,
        parent_block: Option<&str>,
        start_index: usize,
        end_index: usize,
    ) -> Result<()> {
        if start_index >= end_index {
            return Ok(());
        }
        let parent = parent_block.unwrap_or(document_id);
        let url = self.url(&format!(
            "/docx/v1/documents/{document_id}/blocks/{parent}/children/batch_delete"
        ));
        let body = json!({ "start_index": start_index, "end_index": end_index });
        self.request_json(|http, token| http.delete(&url).bearer_auth(token).json(&body))
            .await?;
        Ok(())
    }

    /// Apply a set of in-place block updates in one batch call.
    pub async fn batch_update_blocks(
        &self,
        document_id: &str,
        updates: &[BlockUpdate],
    ) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }
        let url = self.url(&format!(
            "/docx/v1/documents/{document_id}/blocks/batch_update"
        ));
        let requests: Vec<Value> = updates.iter().map(BlockUpdate::to_request).collect();
        let body = json!({ "requests": requests });
        self.request_json(|http, token| http.patch(&url).bearer_auth(token).json(&body))
            .await?;
        Ok(())
    }

    /// Delete every top-level block of the document.
    pub async fn clear_document(&self, document_id: &str) -> Result<()> {
        let children = self.get_block_children(document_id, None, false).await?;
        if children.is_empty() {
            return Ok(());
        }
        self.delete_block_children(document_id, None, 0, children.len())
            .await
    }
}

/// Depth-first flattening for the descendants endpoint. Returns the
/// temporary id assigned to `block`.
fn flatten_descendants(block: &Block, out: &mut Vec<Value>, counter: &mut usize) -> String {
    let id = format!("tmp_{}", *counter);
    *counter += 1;

    let mut wire = wire::to_wire(block);
    if let Some(obj) = wire.as_object_mut() {
        obj.remove("children");
        obj.insert("block_id".into(), json!(id));
        let child_ids: Vec<String> = block
            .children
            .iter()
            .map(|child| flatten_descendants(child, out, counter))
            .collect();
        obj.insert("children".into(), json!(child_ids));
    }
    out.push(wire);
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockContent, TextBody};

    #[test]
    fn descendants_flatten_with_temporary_ids() {
        let table = Block::with_children(
            BlockContent::Table {
                row_size: 1,
                column_size: 1,
            },
            vec![Block::with_children(
                BlockContent::TableCell,
                vec![Block::new(BlockContent::Text(TextBody::from_plain("c")))],
            )],
        );
        let mut out = Vec::new();
        let mut counter = 0;
        let root_id = flatten_descendants(&table, &mut out, &mut counter);

        assert_eq!(root_id, "tmp_0");
        assert_eq!(out.len(), 3);
        let root = out.iter().find(|v| v["block_id"] == "tmp_0").unwrap();
        assert_eq!(root["children"], json!(["tmp_1"]));
        let cell = out.iter().find(|v| v["block_id"] == "tmp_1").unwrap();
        assert_eq!(cell["children"], json!(["tmp_2"]));
        let text = out.iter().find(|v| v["block_id"] == "tmp_2").unwrap();
        assert_eq!(text["children"], json!([]));
    }
}
