//! Tree-diff reconciliation.
//!
//! Both sides of a document are reduced to per-root-child content hashes;
//! a longest-common-subsequence pass over the two hash sequences yields an
//! edit script that is applied to the remote in reverse index order, so
//! earlier indices are never invalidated by edits.
//!
//! Remote calls are expensive and rate-limited: 1:1 replacements of the
//! same text-bearing type become in-place text updates (preserving block
//! identity for remote comments and references), and restructurings larger
//! than a configurable threshold fall back to a bulk overwrite.

use similar::{capture_diff_slices, Algorithm, DiffTag};

use crate::block::{Block, BlockContent};
use crate::error::Result;
use crate::gateway::{BlockUpdate, FeishuGateway};

/// Content hash of a block subtree: `md5(type ":" signature ":" child,child)`.
///
/// Styles are ignored intentionally; style-only edits ride the in-place
/// update path. The hash is stable across processes.
pub fn tree_hash(block: &Block) -> String {
    let child_hashes: Vec<String> = block.children.iter().map(tree_hash).collect();
    let data = format!(
        "{}:{}:{}",
        block.type_code(),
        content_signature(block),
        child_hashes.join(",")
    );
    format!("{:x}", md5::compute(data.as_bytes()))
}

fn content_signature(block: &Block) -> String {
    match &block.content {
        BlockContent::Image(asset) => asset.signature(),
        BlockContent::File { asset, .. } => asset.signature(),
        _ => match block.body() {
            Some(body) => body.plain_text(),
            None => String::new(),
        },
    }
}

/// One opcode of the classic `(tag, i1, i2, j1, j2)` edit script form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Opcode {
    pub tag: DiffTag,
    pub i1: usize,
    pub i2: usize,
    pub j1: usize,
    pub j2: usize,
}

/// Edit script between the remote (`old`) and local (`new`) root children.
pub fn edit_script(remote: &[Block], local: &[Block]) -> Vec<Opcode> {
    let remote_hashes: Vec<String> = remote.iter().map(tree_hash).collect();
    let local_hashes: Vec<String> = local.iter().map(tree_hash).collect();
    capture_diff_slices(Algorithm::Myers, &remote_hashes, &local_hashes)
        .iter()
        .map(|op| {
            let (tag, old, new) = op.as_tag_tuple();
            Opcode {
                tag,
                i1: old.start,
                i2: old.end,
                j1: new.start,
                j2: new.end,
            }
        })
        .collect()
}

/// A planned remote mutation. Structural operations are ordered by
/// descending `i1`; in-place updates are collected into one batch call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditOp {
    Insert { index: usize, j1: usize, j2: usize },
    Delete { start: usize, end: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InPlaceUpdate {
    pub block_id: String,
    pub local_index: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncPlan {
    /// Hashes agree everywhere; nothing to send.
    Unchanged,
    /// Too many changes, or the remote is empty: clear and re-add.
    FullOverwrite,
    Incremental {
        ops: Vec<EditOp>,
        updates: Vec<InPlaceUpdate>,
    },
}

/// Decide how to reconcile `remote` into `local`.
pub fn plan_sync(remote: &[Block], local: &[Block], threshold: usize) -> SyncPlan {
    let script = edit_script(remote, local);
    let changed = script.iter().filter(|op| op.tag != DiffTag::Equal).count();
    if changed == 0 {
        return SyncPlan::Unchanged;
    }
    if changed > threshold || remote.is_empty() {
        return SyncPlan::FullOverwrite;
    }

    let mut ops = Vec::new();
    let mut updates = Vec::new();
    for op in script.iter().rev() {
        match op.tag {
            DiffTag::Equal => {}
            DiffTag::Insert => ops.push(EditOp::Insert {
                index: op.i1,
                j1: op.j1,
                j2: op.j2,
            }),
            DiffTag::Delete => ops.push(EditOp::Delete {
                start: op.i1,
                end: op.i2,
            }),
            DiffTag::Replace => {
                if op.i2 - op.i1 == 1 && op.j2 - op.j1 == 1 {
                    if let Some(update) = in_place_update(&remote[op.i1], &local[op.j1], op.j1) {
                        updates.push(update);
                        continue;
                    }
                }
                ops.push(EditOp::Delete {
                    start: op.i1,
                    end: op.i2,
                });
                ops.push(EditOp::Insert {
                    index: op.i1,
                    j1: op.j1,
                    j2: op.j2,
                });
            }
        }
    }
    SyncPlan::Incremental { ops, updates }
}

/// In-place replacement is possible only between blocks of the same
/// text-bearing type when the local side has elements to write.
fn in_place_update(remote: &Block, local: &Block, local_index: usize) -> Option<InPlaceUpdate> {
    if remote.type_code() != local.type_code() {
        return None;
    }
    if remote.id.is_empty() {
        return None;
    }
    let body = local.body()?;
    if body.is_empty() {
        return None;
    }
    Some(InPlaceUpdate {
        block_id: remote.id.clone(),
        local_index,
    })
}

/// Apply a plan to the remote document. Returns `false` when nothing was
/// sent.
pub async fn apply_plan(
    gateway: &FeishuGateway,
    document_id: &str,
    plan: &SyncPlan,
    local: &[Block],
) -> Result<bool> {
    match plan {
        SyncPlan::Unchanged => Ok(false),
        SyncPlan::FullOverwrite => {
            overwrite(gateway, document_id, local).await?;
            Ok(true)
        }
        SyncPlan::Incremental { ops, updates } => {
            for op in ops {
                match op {
                    EditOp::Delete { start, end } => {
                        gateway
                            .delete_block_children(document_id, None, *start, *end)
                            .await?;
                    }
                    EditOp::Insert { index, j1, j2 } => {
                        gateway
                            .add_blocks(document_id, None, &local[*j1..*j2], Some(*index))
                            .await?;
                    }
                }
            }
            if !updates.is_empty() {
                let batch: Vec<BlockUpdate> = updates
                    .iter()
                    .filter_map(|u| {
                        local[u.local_index]
                            .body()
                            .map(|body| BlockUpdate::ReplaceTextElements {
                                block_id: u.block_id.clone(),
                                elements: body.elements.clone(),
                            })
                    })
                    .collect();
                if let Err(err) = gateway.batch_update_blocks(document_id, &batch).await {
                    tracing::warn!("batch update failed, falling back to full overwrite: {err}");
                    overwrite(gateway, document_id, local).await?;
                }
            }
            Ok(true)
        }
    }
}

/// Clear the document and re-add the whole local tree, one request per
/// top-level block so each subtree is created with its descendants intact.
async fn overwrite(gateway: &FeishuGateway, document_id: &str, local: &[Block]) -> Result<()> {
    gateway.clear_document(document_id).await?;
    for (i, block) in local.iter().enumerate() {
        gateway
            .add_blocks(document_id, None, std::slice::from_ref(block), Some(i))
            .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::wire::{from_wire, to_wire};
    use crate::block::{AssetRef, BlockContent, TextBody};
    use serde_json::json;

    fn text(content: &str) -> Block {
        Block::new(BlockContent::Text(TextBody::from_plain(content)))
    }

    fn remote_text(id: &str, content: &str) -> Block {
        let mut block = text(content);
        block.id = id.to_string();
        block
    }

    #[test]
    fn hash_ignores_styles() {
        use crate::block::{TextElement, TextRun, TextStyle};
        let plain = text("same words");
        let styled = Block::new(BlockContent::Text(TextBody {
            elements: vec![TextElement::TextRun(TextRun {
                content: "same words".into(),
                style: TextStyle {
                    bold: true,
                    ..Default::default()
                },
            })],
        }));
        assert_eq!(tree_hash(&plain), tree_hash(&styled));
    }

    #[test]
    fn hash_covers_children_recursively() {
        let flat = text("a");
        let nested = Block::with_children(
            BlockContent::Text(TextBody::from_plain("a")),
            vec![text("b")],
        );
        assert_ne!(tree_hash(&flat), tree_hash(&nested));
    }

    #[test]
    fn hash_stable_across_wire_round_trip() {
        let block = Block::with_children(
            BlockContent::Todo {
                done: true,
                body: TextBody::from_plain("task"),
            },
            vec![text("detail")],
        );
        let mut wire = to_wire(&block);
        wire.as_object_mut()
            .unwrap()
            .insert("block_id".into(), json!("blk"));
        let mut rebuilt = from_wire(&wire).unwrap().block;
        let child_wire = to_wire(&block.children[0]);
        rebuilt.children.push(from_wire(&child_wire).unwrap().block);
        assert_eq!(tree_hash(&block), tree_hash(&rebuilt));
    }

    #[test]
    fn unresolved_placeholder_never_matches_resolved() {
        let fresh = Block::new(BlockContent::Image(AssetRef::Local {
            path: "img.png".into(),
            resolved: true,
        }));
        let failed = Block::new(BlockContent::Image(AssetRef::Local {
            path: "img.png".into(),
            resolved: false,
        }));
        assert_ne!(tree_hash(&fresh), tree_hash(&failed));
    }

    #[test]
    fn identical_trees_produce_no_changes() {
        let remote = vec![remote_text("b1", "one"), remote_text("b2", "two")];
        let local = vec![text("one"), text("two")];
        assert_eq!(plan_sync(&remote, &local, 15), SyncPlan::Unchanged);
    }

    #[test]
    fn single_position_change_yields_single_opcode() {
        // Trees differing only at one position generate exactly one
        // non-equal opcode, targeting that position.
        let remote = vec![
            remote_text("b0", "a"),
            remote_text("b1", "b"),
            remote_text("b2", "c"),
        ];
        let local = vec![text("a"), text("CHANGED"), text("c")];
        let script = edit_script(&remote, &local);
        let changed: Vec<&Opcode> = script
            .iter()
            .filter(|op| op.tag != DiffTag::Equal)
            .collect();
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].tag, DiffTag::Replace);
        assert_eq!((changed[0].i1, changed[0].i2), (1, 2));
        assert_eq!((changed[0].j1, changed[0].j2), (1, 2));
    }

    #[test]
    fn one_to_one_same_type_replace_becomes_in_place_update() {
        // "Hello" to "World" is a single batched text update, not
        // delete+insert.
        let remote = vec![remote_text("blk_hello", "Hello")];
        let local = vec![text("World")];
        match plan_sync(&remote, &local, 15) {
            SyncPlan::Incremental { ops, updates } => {
                assert!(ops.is_empty());
                assert_eq!(updates.len(), 1);
                assert_eq!(updates[0].block_id, "blk_hello");
                assert_eq!(updates[0].local_index, 0);
            }
            other => panic!("unexpected plan: {other:?}"),
        }
    }

    #[test]
    fn type_change_falls_back_to_delete_insert() {
        let remote = vec![remote_text("b0", "words")];
        let local = vec![Block::new(BlockContent::Heading {
            level: 1,
            body: TextBody::from_plain("words"),
        })];
        match plan_sync(&remote, &local, 15) {
            SyncPlan::Incremental { ops, updates } => {
                assert!(updates.is_empty());
                assert_eq!(
                    ops,
                    vec![
                        EditOp::Delete { start: 0, end: 1 },
                        EditOp::Insert {
                            index: 0,
                            j1: 0,
                            j2: 1
                        },
                    ]
                );
            }
            other => panic!("unexpected plan: {other:?}"),
        }
    }

    #[test]
    fn empty_remote_forces_full_overwrite() {
        let local = vec![text("only")];
        assert_eq!(plan_sync(&[], &local, 15), SyncPlan::FullOverwrite);
    }

    #[test]
    fn threshold_exceeded_forces_full_overwrite() {
        // Interleave kept and changed rows so the script carries five
        // distinct replace opcodes.
        let mut remote = Vec::new();
        let mut local = Vec::new();
        for i in 0..5 {
            remote.push(remote_text(&format!("k{i}"), &format!("keep {i}")));
            remote.push(remote_text(&format!("c{i}"), &format!("old {i}")));
            local.push(text(&format!("keep {i}")));
            local.push(text(&format!("new {i}")));
        }
        assert_eq!(plan_sync(&remote, &local, 4), SyncPlan::FullOverwrite);
        assert!(matches!(
            plan_sync(&remote, &local, 5),
            SyncPlan::Incremental { .. }
        ));
    }

    #[test]
    fn structural_ops_are_ordered_by_descending_index() {
        let remote = vec![
            remote_text("b0", "a"),
            remote_text("b1", "drop me"),
            remote_text("b2", "c"),
            remote_text("b3", "e"),
        ];
        let local = vec![text("a"), text("c"), text("d"), text("e")];
        match plan_sync(&remote, &local, 15) {
            SyncPlan::Incremental { ops, .. } => {
                let indices: Vec<usize> = ops
                    .iter()
                    .map(|op| match op {
                        EditOp::Insert { index, .. } => *index,
                        EditOp::Delete { start, .. } => *start,
                    })
                    .collect();
                let mut sorted = indices.clone();
                sorted.sort_unstable_by(|a, b| b.cmp(a));
                assert_eq!(indices, sorted, "ops must run in reverse index order");
            }
            other => panic!("unexpected plan: {other:?}"),
        }
    }

    /// Replay a plan against an in-memory copy of the remote and check the
    /// result hashes identically to the local tree.
    fn replay(remote: &[Block], local: &[Block], plan: &SyncPlan) -> Vec<Block> {
        let mut result: Vec<Block> = remote.to_vec();
        match plan {
            SyncPlan::Unchanged => {}
            SyncPlan::FullOverwrite => result = local.to_vec(),
            SyncPlan::Incremental { ops, updates } => {
                for op in ops {
                    match op {
                        EditOp::Delete { start, end } => {
                            result.drain(*start..*end);
                        }
                        EditOp::Insert { index, j1, j2 } => {
                            for (offset, block) in local[*j1..*j2].iter().enumerate() {
                                result.insert(index + offset, block.clone());
                            }
                        }
                    }
                }
                for update in updates {
                    if let Some(target) = result.iter_mut().find(|b| b.id == update.block_id) {
                        if let (Some(dst), Some(src)) =
                            (target.body_mut(), local[update.local_index].body())
                        {
                            *dst = src.clone();
                        }
                    }
                }
            }
        }
        result
    }

    #[test]
    fn applying_script_in_reverse_order_converges() {
        let remote = vec![
            remote_text("b0", "keep"),
            remote_text("b1", "old text"),
            remote_text("b2", "drop"),
            remote_text("b3", "tail"),
        ];
        let local = vec![
            text("keep"),
            text("new text"),
            text("inserted"),
            text("tail"),
        ];
        let plan = plan_sync(&remote, &local, 15);
        let converged = replay(&remote, &local, &plan);

        let converged_hashes: Vec<String> = converged.iter().map(tree_hash).collect();
        let local_hashes: Vec<String> = local.iter().map(tree_hash).collect();
        assert_eq!(converged_hashes, local_hashes);
    }

    #[test]
    fn empty_local_body_is_not_updated_in_place() {
        let remote = vec![remote_text("b0", "text")];
        let local = vec![Block::new(BlockContent::Text(TextBody::default()))];
        match plan_sync(&remote, &local, 15) {
            SyncPlan::Incremental { ops, updates } => {
                assert!(updates.is_empty());
                assert_eq!(ops.len(), 2);
            }
            other => panic!("unexpected plan: {other:?}"),
        }
    }
}
