//! Block tree data model.
//!
//! A document is an ordered tree of [`Block`]s. The remote service models
//! blocks as free-form maps keyed by type name; here the closed type set is
//! a tagged enum with a shared header. The wire JSON shape is a
//! serialization concern handled in [`wire`].

pub mod lang;
pub mod wire;

use std::path::PathBuf;

/// Remote block type codes.
pub const TYPE_PAGE: u8 = 1;
pub const TYPE_TEXT: u8 = 2;
// Headings occupy 3..=11 (heading1..heading9).
pub const TYPE_HEADING_BASE: u8 = 2;
pub const TYPE_BULLET: u8 = 12;
pub const TYPE_ORDERED: u8 = 13;
pub const TYPE_CODE: u8 = 14;
pub const TYPE_QUOTE: u8 = 15;
pub const TYPE_TODO: u8 = 17;
pub const TYPE_DIVIDER: u8 = 22;
pub const TYPE_FILE: u8 = 23;
pub const TYPE_IMAGE: u8 = 27;
pub const TYPE_TABLE: u8 = 31;
pub const TYPE_TABLE_CELL: u8 = 32;

/// One node of a document tree.
///
/// `id` and `parent_id` are populated only for blocks fetched from the
/// remote side; locally parsed blocks leave them empty.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub id: String,
    pub parent_id: Option<String>,
    pub content: BlockContent,
    pub children: Vec<Block>,
}

/// Type-specific block payload.
#[derive(Debug, Clone, PartialEq)]
pub enum BlockContent {
    /// Document root. Never appears in edit scripts.
    Page,
    Text(TextBody),
    /// `level` is clamped to 1..=9.
    Heading { level: u8, body: TextBody },
    Bullet(TextBody),
    Ordered(TextBody),
    Code { language: u32, body: TextBody },
    Quote(TextBody),
    Todo { done: bool, body: TextBody },
    Divider,
    Image(AssetRef),
    File { name: String, asset: AssetRef },
    Table { row_size: usize, column_size: usize },
    TableCell,
}

/// Reference to a binary asset.
///
/// Locally parsed documents carry the resolved vault path as a placeholder;
/// the sync layer uploads it and swaps in the remote token before any block
/// reaches the wire. `resolved` distinguishes a placeholder whose upload
/// failed from one that was never attempted, so the two never hash equal.
#[derive(Debug, Clone, PartialEq)]
pub enum AssetRef {
    Remote(String),
    Local { path: PathBuf, resolved: bool },
}

/// Ordered rich-text content of a text-bearing block.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TextBody {
    pub elements: Vec<TextElement>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TextElement {
    TextRun(TextRun),
    MentionUser {
        user_id: String,
    },
    MentionDoc {
        token: String,
        obj_type: i64,
        url: String,
    },
    Reminder {
        create_user_id: String,
        expire_time: String,
        notify_time: String,
    },
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct TextRun {
    pub content: String,
    pub style: TextStyle,
}

/// Inline style flags plus optional colors and link.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TextStyle {
    pub bold: bool,
    pub italic: bool,
    pub strikethrough: bool,
    pub underline: bool,
    pub inline_code: bool,
    pub text_color: Option<i64>,
    pub background_color: Option<i64>,
    pub link: Option<String>,
}

impl TextStyle {
    pub fn is_plain(&self) -> bool {
        *self == TextStyle::default()
    }
}

impl TextBody {
    pub fn from_plain(content: impl Into<String>) -> Self {
        TextBody {
            elements: vec![TextElement::TextRun(TextRun {
                content: content.into(),
                style: TextStyle::default(),
            })],
        }
    }

    /// Concatenated content of all text runs, ignoring styles and mentions.
    pub fn plain_text(&self) -> String {
        let mut out = String::new();
        for el in &self.elements {
            if let TextElement::TextRun(run) = el {
                out.push_str(&run.content);
            }
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}

impl AssetRef {
    /// Signature string for content hashing. Remote tokens hash by value;
    /// local placeholders carry the resolution state so a failed upload
    /// never converges with a freshly parsed placeholder.
    pub fn signature(&self) -> String {
        match self {
            AssetRef::Remote(token) => token.clone(),
            AssetRef::Local { path, resolved } => {
                format!("local:{}:{}", path.display(), resolved)
            }
        }
    }
}

impl Block {
    pub fn new(content: BlockContent) -> Self {
        Block {
            id: String::new(),
            parent_id: None,
            content,
            children: Vec::new(),
        }
    }

    pub fn with_children(content: BlockContent, children: Vec<Block>) -> Self {
        Block {
            id: String::new(),
            parent_id: None,
            content,
            children,
        }
    }

    /// Remote type code for this block.
    pub fn type_code(&self) -> u8 {
        match &self.content {
            BlockContent::Page => TYPE_PAGE,
            BlockContent::Text(_) => TYPE_TEXT,
            BlockContent::Heading { level, .. } => TYPE_HEADING_BASE + (*level).clamp(1, 9),
            BlockContent::Bullet(_) => TYPE_BULLET,
            BlockContent::Ordered(_) => TYPE_ORDERED,
            BlockContent::Code { .. } => TYPE_CODE,
            BlockContent::Quote(_) => TYPE_QUOTE,
            BlockContent::Todo { .. } => TYPE_TODO,
            BlockContent::Divider => TYPE_DIVIDER,
            BlockContent::File { .. } => TYPE_FILE,
            BlockContent::Image(_) => TYPE_IMAGE,
            BlockContent::Table { .. } => TYPE_TABLE,
            BlockContent::TableCell => TYPE_TABLE_CELL,
        }
    }

    /// Text body for text-bearing block types.
    pub fn body(&self) -> Option<&TextBody> {
        match &self.content {
            BlockContent::Text(body)
            | BlockContent::Heading { body, .. }
            | BlockContent::Bullet(body)
            | BlockContent::Ordered(body)
            | BlockContent::Code { body, .. }
            | BlockContent::Quote(body)
            | BlockContent::Todo { body, .. } => Some(body),
            _ => None,
        }
    }

    pub fn body_mut(&mut self) -> Option<&mut TextBody> {
        match &mut self.content {
            BlockContent::Text(body)
            | BlockContent::Heading { body, .. }
            | BlockContent::Bullet(body)
            | BlockContent::Ordered(body)
            | BlockContent::Code { body, .. }
            | BlockContent::Quote(body)
            | BlockContent::Todo { body, .. } => Some(body),
            _ => None,
        }
    }

    pub fn is_text_bearing(&self) -> bool {
        self.body().is_some()
    }

    /// Visit this block and every descendant, depth first.
    pub fn walk<'a>(&'a self, visit: &mut dyn FnMut(&'a Block)) {
        visit(self);
        for child in &self.children {
            child.walk(visit);
        }
    }

    pub fn walk_mut(&mut self, visit: &mut dyn FnMut(&mut Block)) {
        visit(self);
        for child in &mut self.children {
            child.walk_mut(visit);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_codes_match_remote_enumeration() {
        assert_eq!(Block::new(BlockContent::Text(TextBody::default())).type_code(), 2);
        let h1 = Block::new(BlockContent::Heading {
            level: 1,
            body: TextBody::default(),
        });
        assert_eq!(h1.type_code(), 3);
        let h9 = Block::new(BlockContent::Heading {
            level: 9,
            body: TextBody::default(),
        });
        assert_eq!(h9.type_code(), 11);
        assert_eq!(Block::new(BlockContent::Divider).type_code(), 22);
        assert_eq!(
            Block::new(BlockContent::Table {
                row_size: 1,
                column_size: 1
            })
            .type_code(),
            31
        );
    }

    #[test]
    fn heading_level_clamped_to_nine() {
        let h = Block::new(BlockContent::Heading {
            level: 12,
            body: TextBody::default(),
        });
        assert_eq!(h.type_code(), 11);
    }

    #[test]
    fn plain_text_skips_mentions() {
        let body = TextBody {
            elements: vec![
                TextElement::TextRun(TextRun {
                    content: "hello ".into(),
                    style: TextStyle::default(),
                }),
                TextElement::MentionUser {
                    user_id: "ou_1".into(),
                },
                TextElement::TextRun(TextRun {
                    content: "world".into(),
                    style: TextStyle::default(),
                }),
            ],
        };
        assert_eq!(body.plain_text(), "hello world");
    }

    #[test]
    fn unresolved_placeholder_signature_differs_from_resolved() {
        let fresh = AssetRef::Local {
            path: "a/b.png".into(),
            resolved: false,
        };
        let resolved = AssetRef::Local {
            path: "a/b.png".into(),
            resolved: true,
        };
        assert_ne!(fresh.signature(), resolved.signature());
    }
}
