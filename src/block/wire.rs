//! Block ↔ remote wire JSON.
//!
//! The remote service keys each block's payload by a type-specific field
//! name ("text", "heading3", "todo", ...). Conversion lives here so the
//! rest of the crate only ever sees [`Block`] values; nothing outside the
//! gateway touches wire JSON.

use serde_json::{json, Map, Value};

use super::{
    AssetRef, Block, BlockContent, TextBody, TextElement, TextRun, TextStyle, TYPE_BULLET,
    TYPE_CODE, TYPE_DIVIDER, TYPE_FILE, TYPE_HEADING_BASE, TYPE_IMAGE, TYPE_ORDERED, TYPE_PAGE,
    TYPE_QUOTE, TYPE_TABLE, TYPE_TABLE_CELL, TYPE_TEXT, TYPE_TODO,
};

/// Payload field name for a block type code.
pub fn field_name(type_code: u8) -> Option<&'static str> {
    Some(match type_code {
        TYPE_PAGE => "page",
        TYPE_TEXT => "text",
        3 => "heading1",
        4 => "heading2",
        5 => "heading3",
        6 => "heading4",
        7 => "heading5",
        8 => "heading6",
        9 => "heading7",
        10 => "heading8",
        11 => "heading9",
        TYPE_BULLET => "bullet",
        TYPE_ORDERED => "ordered",
        TYPE_CODE => "code",
        TYPE_QUOTE => "quote",
        TYPE_TODO => "todo",
        TYPE_DIVIDER => "divider",
        TYPE_FILE => "file",
        TYPE_IMAGE => "image",
        TYPE_TABLE => "table",
        TYPE_TABLE_CELL => "table_cell",
        _ => return None,
    })
}

/// Serialize a block (and its subtree, as nested `children` arrays) into
/// the shape the creation endpoints accept.
///
/// Local asset placeholders must have been replaced with remote tokens
/// before this is called; a leftover placeholder serializes its path, which
/// the service will reject.
pub fn to_wire(block: &Block) -> Value {
    let mut obj = Map::new();
    obj.insert("block_type".into(), json!(block.type_code()));

    match &block.content {
        BlockContent::Page => {
            obj.insert("page".into(), json!({ "elements": [] }));
        }
        BlockContent::Text(body)
        | BlockContent::Bullet(body)
        | BlockContent::Ordered(body)
        | BlockContent::Quote(body) => {
            let field = field_name(block.type_code()).unwrap_or("text");
            obj.insert(field.into(), body_to_wire(body));
        }
        BlockContent::Heading { body, .. } => {
            let field = field_name(block.type_code()).unwrap_or("heading1");
            obj.insert(field.into(), body_to_wire(body));
        }
        BlockContent::Code { language, body } => {
            let mut payload = body_to_wire(body);
            if let Some(map) = payload.as_object_mut() {
                map.insert("style".into(), json!({ "language": language, "wrap": false }));
            }
            obj.insert("code".into(), payload);
        }
        BlockContent::Todo { done, body } => {
            let mut payload = body_to_wire(body);
            if let Some(map) = payload.as_object_mut() {
                map.insert("style".into(), json!({ "done": done }));
            }
            obj.insert("todo".into(), payload);
        }
        BlockContent::Divider => {
            obj.insert("divider".into(), json!({}));
        }
        BlockContent::Image(asset) => {
            obj.insert("image".into(), json!({ "token": asset_token(asset) }));
        }
        BlockContent::File { name, asset } => {
            obj.insert(
                "file".into(),
                json!({ "token": asset_token(asset), "name": name }),
            );
        }
        BlockContent::Table {
            row_size,
            column_size,
        } => {
            obj.insert(
                "table".into(),
                json!({ "property": { "row_size": row_size, "column_size": column_size } }),
            );
        }
        BlockContent::TableCell => {
            obj.insert("table_cell".into(), json!({}));
        }
    }

    if !block.children.is_empty() {
        obj.insert(
            "children".into(),
            Value::Array(block.children.iter().map(to_wire).collect()),
        );
    }

    Value::Object(obj)
}

fn asset_token(asset: &AssetRef) -> String {
    match asset {
        AssetRef::Remote(token) => token.clone(),
        AssetRef::Local { path, .. } => path.display().to_string(),
    }
}

pub fn body_to_wire(body: &TextBody) -> Value {
    json!({ "elements": elements_to_wire(&body.elements) })
}

pub fn elements_to_wire(elements: &[TextElement]) -> Vec<Value> {
    elements.iter().map(element_to_wire).collect()
}

fn element_to_wire(element: &TextElement) -> Value {
    match element {
        TextElement::TextRun(run) => {
            let mut tr = Map::new();
            tr.insert("content".into(), json!(run.content));
            if !run.style.is_plain() {
                tr.insert("text_element_style".into(), style_to_wire(&run.style));
            }
            json!({ "text_run": tr })
        }
        TextElement::MentionUser { user_id } => {
            json!({ "mention_user": { "user_id": user_id } })
        }
        TextElement::MentionDoc {
            token,
            obj_type,
            url,
        } => {
            json!({ "mention_doc": { "token": token, "obj_type": obj_type, "url": url } })
        }
        TextElement::Reminder {
            create_user_id,
            expire_time,
            notify_time,
        } => {
            json!({ "reminder": {
                "create_user_id": create_user_id,
                "expire_time": expire_time,
                "notify_time": notify_time,
            } })
        }
    }
}

fn style_to_wire(style: &TextStyle) -> Value {
    let mut obj = Map::new();
    if style.bold {
        obj.insert("bold".into(), json!(true));
    }
    if style.italic {
        obj.insert("italic".into(), json!(true));
    }
    if style.strikethrough {
        obj.insert("strikethrough".into(), json!(true));
    }
    if style.underline {
        obj.insert("underline".into(), json!(true));
    }
    if style.inline_code {
        obj.insert("inline_code".into(), json!(true));
    }
    if let Some(color) = style.text_color {
        obj.insert("text_color".into(), json!(color));
    }
    if let Some(color) = style.background_color {
        obj.insert("background_color".into(), json!(color));
    }
    if let Some(url) = &style.link {
        obj.insert("link".into(), json!({ "url": url }));
    }
    Value::Object(obj)
}

/// A block parsed from a remote listing: the node itself plus the ids of
/// its children, in order. The listing is flat; the caller rebuilds the
/// tree from the id graph.
#[derive(Debug, Clone)]
pub struct WireBlock {
    pub block: Block,
    pub child_ids: Vec<String>,
}

/// Parse one item of a remote block listing. Unknown block types yield
/// `None` and are skipped by the caller.
pub fn from_wire(value: &Value) -> Option<WireBlock> {
    let type_code = value.get("block_type")?.as_u64()? as u8;
    let field = field_name(type_code)?;
    let payload = value.get(field);

    let content = match type_code {
        TYPE_PAGE => BlockContent::Page,
        TYPE_TEXT => BlockContent::Text(body_from_wire(payload)),
        level @ 3..=11 => BlockContent::Heading {
            level: level - TYPE_HEADING_BASE,
            body: body_from_wire(payload),
        },
        TYPE_BULLET => BlockContent::Bullet(body_from_wire(payload)),
        TYPE_ORDERED => BlockContent::Ordered(body_from_wire(payload)),
        TYPE_CODE => BlockContent::Code {
            language: payload
                .and_then(|p| p.pointer("/style/language"))
                .and_then(Value::as_u64)
                .unwrap_or(0) as u32,
            body: body_from_wire(payload),
        },
        TYPE_QUOTE => BlockContent::Quote(body_from_wire(payload)),
        TYPE_TODO => BlockContent::Todo {
            done: payload
                .and_then(|p| p.pointer("/style/done"))
                .and_then(Value::as_bool)
                .unwrap_or(false),
            body: body_from_wire(payload),
        },
        TYPE_DIVIDER => BlockContent::Divider,
        TYPE_IMAGE => BlockContent::Image(AssetRef::Remote(
            payload
                .and_then(|p| p.get("token"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        )),
        TYPE_FILE => BlockContent::File {
            name: payload
                .and_then(|p| p.get("name"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            asset: AssetRef::Remote(
                payload
                    .and_then(|p| p.get("token"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            ),
        },
        TYPE_TABLE => BlockContent::Table {
            row_size: payload
                .and_then(|p| p.pointer("/property/row_size"))
                .and_then(Value::as_u64)
                .unwrap_or(0) as usize,
            column_size: payload
                .and_then(|p| p.pointer("/property/column_size"))
                .and_then(Value::as_u64)
                .unwrap_or(0) as usize,
        },
        TYPE_TABLE_CELL => BlockContent::TableCell,
        _ => return None,
    };

    let child_ids = value
        .get("children")
        .and_then(Value::as_array)
        .map(|ids| {
            ids.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    Some(WireBlock {
        block: Block {
            id: value
                .get("block_id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            parent_id: value
                .get("parent_id")
                .and_then(Value::as_str)
                .map(str::to_string),
            content,
            children: Vec::new(),
        },
        child_ids,
    })
}

fn body_from_wire(payload: Option<&Value>) -> TextBody {
    let elements = payload
        .and_then(|p| p.get("elements"))
        .and_then(Value::as_array)
        .map(|els| els.iter().filter_map(element_from_wire).collect())
        .unwrap_or_default();
    TextBody { elements }
}

fn element_from_wire(value: &Value) -> Option<TextElement> {
    if let Some(tr) = value.get("text_run") {
        return Some(TextElement::TextRun(TextRun {
            content: tr
                .get("content")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            style: tr
                .get("text_element_style")
                .map(style_from_wire)
                .unwrap_or_default(),
        }));
    }
    if let Some(mu) = value.get("mention_user") {
        return Some(TextElement::MentionUser {
            user_id: mu
                .get("user_id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        });
    }
    if let Some(md) = value.get("mention_doc") {
        return Some(TextElement::MentionDoc {
            token: md
                .get("token")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            obj_type: md.get("obj_type").and_then(Value::as_i64).unwrap_or(1),
            url: md
                .get("url")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        });
    }
    if let Some(rem) = value.get("reminder") {
        return Some(TextElement::Reminder {
            create_user_id: rem
                .get("create_user_id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            expire_time: rem
                .get("expire_time")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            notify_time: rem
                .get("notify_time")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        });
    }
    None
}

fn style_from_wire(value: &Value) -> TextStyle {
    TextStyle {
        bold: value.get("bold").and_then(Value::as_bool).unwrap_or(false),
        italic: value.get("italic").and_then(Value::as_bool).unwrap_or(false),
        strikethrough: value
            .get("strikethrough")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        underline: value
            .get("underline")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        inline_code: value
            .get("inline_code")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        text_color: value.get("text_color").and_then(Value::as_i64),
        background_color: value.get("background_color").and_then(Value::as_i64),
        link: value
            .pointer("/link/url")
            .and_then(Value::as_str)
            .map(str::to_string),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_block_round_trips() {
        let block = Block::new(BlockContent::Text(TextBody {
            elements: vec![TextElement::TextRun(TextRun {
                content: "hi".into(),
                style: TextStyle {
                    bold: true,
                    ..Default::default()
                },
            })],
        }));
        let mut wire = to_wire(&block);
        wire.as_object_mut()
            .unwrap()
            .insert("block_id".into(), json!("blk_1"));
        let parsed = from_wire(&wire).unwrap();
        assert_eq!(parsed.block.content, block.content);
        assert_eq!(parsed.block.id, "blk_1");
    }

    #[test]
    fn heading_uses_level_field() {
        let block = Block::new(BlockContent::Heading {
            level: 3,
            body: TextBody::from_plain("t"),
        });
        let wire = to_wire(&block);
        assert!(wire.get("heading3").is_some());
        assert_eq!(wire["block_type"], json!(5));
    }

    #[test]
    fn todo_done_flag_survives() {
        let block = Block::new(BlockContent::Todo {
            done: true,
            body: TextBody::from_plain("x"),
        });
        let wire = to_wire(&block);
        assert_eq!(wire.pointer("/todo/style/done"), Some(&json!(true)));
        let parsed = from_wire(&wire).unwrap();
        match parsed.block.content {
            BlockContent::Todo { done, .. } => assert!(done),
            other => panic!("unexpected content: {other:?}"),
        }
    }

    #[test]
    fn plain_style_is_omitted_on_the_wire() {
        let block = Block::new(BlockContent::Text(TextBody::from_plain("plain")));
        let wire = to_wire(&block);
        assert!(wire
            .pointer("/text/elements/0/text_run/text_element_style")
            .is_none());
    }

    #[test]
    fn unknown_block_type_is_skipped() {
        assert!(from_wire(&json!({ "block_type": 999, "block_id": "b" })).is_none());
    }

    #[test]
    fn nested_children_serialize_recursively() {
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
        let wire = to_wire(&table);
        assert_eq!(
            wire.pointer("/children/0/children/0/text/elements/0/text_run/content"),
            Some(&json!("c"))
        );
    }
}
