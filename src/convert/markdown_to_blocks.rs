//! Markdown → block tree.
//!
//! The input dialect is CommonMark plus tables, strikethrough, task lists,
//! YAML front-matter and Obsidian wiki-links. Pre-processing rewrites the
//! extensions and repairs two frequent authoring footguns (weak list
//! indentation, missing paragraph terminators) before the event walk.
//!
//! The walk is deterministic: identical input produces an identical tree.

use std::path::PathBuf;
use std::sync::OnceLock;

use pulldown_cmark::{CodeBlockKind, Event, HeadingLevel, Options, Parser, Tag, TagEnd};
use regex::Regex;

use super::ResourceResolver;
use crate::block::lang::language_code;
use crate::block::{AssetRef, Block, BlockContent, TextBody, TextElement, TextRun, TextStyle};

/// Extensions that become File blocks rather than Image blocks.
const MEDIA_FILE_EXTS: &[&str] = &[
    "mp4", "mov", "avi", "mkv", "webm", "flv", "pdf", "doc", "docx", "xls", "xlsx", "ppt", "pptx",
    "zip", "rar", "7z", "tar", "txt", "md",
];

fn wiki_link_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"!\[\[(.*?)(?:\|(.*?))?\]\]").unwrap())
}

fn list_item_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\s*)([-*+]|\d+\.)\s+").unwrap())
}

fn weak_indent_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^( {2,3})(\d+\.|[-*+])\s+").unwrap())
}

fn checkbox_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\[([ xX])\]\s*").unwrap())
}

#[derive(Default)]
pub struct ParseOptions<'a> {
    pub resolver: Option<&'a dyn ResourceResolver>,
}

/// Parse a Markdown document into top-level blocks.
pub fn parse_markdown(text: &str, opts: &ParseOptions) -> Vec<Block> {
    let (rest, front_matter) = extract_front_matter(text);
    let body = match &front_matter {
        Some(_) => rest,
        None => text,
    };
    let prepared = preprocess(body);

    let mut builder = Builder::new(opts.resolver);
    let parser_opts =
        Options::ENABLE_TABLES | Options::ENABLE_STRIKETHROUGH | Options::ENABLE_TASKLISTS;
    for event in Parser::new_ext(&prepared, parser_opts) {
        builder.handle(event);
    }

    let mut roots = Vec::new();
    if let Some(meta) = front_matter {
        roots.push(front_matter_block(&meta));
    }
    roots.extend(builder.finish());
    roots
}

// ── Pre-processing ──

/// Extract leading `---` front-matter. Returns the remaining text and the
/// parsed key/value pairs in document order. A fence with no parseable
/// entries is left in place for the Markdown parser.
fn extract_front_matter(text: &str) -> (&str, Option<Vec<(String, String)>>) {
    let mut offset = 0;
    let mut lines = text.split_inclusive('\n');
    match lines.next() {
        Some(first) if first.trim() == "---" => offset += first.len(),
        _ => return (text, None),
    }

    let body_start;
    let mut fence_start = offset;
    loop {
        match lines.next() {
            Some(line) if line.trim() == "---" => {
                body_start = fence_start + line.len();
                break;
            }
            Some(line) => fence_start += line.len(),
            None => return (text, None),
        }
    }

    let mut meta = Vec::new();
    for line in text[offset..fence_start].lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once(':') {
            meta.push((key.trim().to_string(), value.trim().to_string()));
        }
    }
    if meta.is_empty() {
        return (text, None);
    }
    (&text[body_start..], Some(meta))
}

/// Front-matter renders as a single Quote block: each key bold, followed by
/// its value, one pair per line.
fn front_matter_block(meta: &[(String, String)]) -> Block {
    let mut elements = Vec::new();
    for (i, (key, value)) in meta.iter().enumerate() {
        elements.push(TextElement::TextRun(TextRun {
            content: format!("{key}: "),
            style: TextStyle {
                bold: true,
                ..Default::default()
            },
        }));
        let mut content = value.clone();
        if i < meta.len() - 1 {
            content.push('\n');
        }
        elements.push(TextElement::TextRun(TextRun {
            content,
            style: TextStyle::default(),
        }));
    }
    Block::new(BlockContent::Quote(TextBody { elements }))
}

/// Rewrite `![[file|alt]]` wiki-links into standard image syntax with
/// spaces percent-encoded.
fn rewrite_wiki_links(text: &str) -> String {
    wiki_link_re()
        .replace_all(text, |caps: &regex::Captures<'_>| {
            let file = caps.get(1).map_or("", |m| m.as_str()).trim().replace(' ', "%20");
            let alt = caps.get(2).map_or("", |m| m.as_str()).trim().to_string();
            format!("![{alt}]({file})")
        })
        .into_owned()
}

/// Line-level repairs, skipped inside fenced code:
/// - pad 2–3 space list indentation to 4 so nesting parses;
/// - insert a blank line between a list item and a following plain
///   paragraph line so the list terminates where the author expects.
fn preprocess(text: &str) -> String {
    let text = rewrite_wiki_links(text);
    let raw_lines: Vec<&str> = text.split('\n').collect();
    let mut out: Vec<String> = Vec::with_capacity(raw_lines.len());
    let mut in_code_block = false;

    for (i, raw) in raw_lines.iter().enumerate() {
        if raw.trim().starts_with("```") {
            in_code_block = !in_code_block;
        }

        let mut line = raw.to_string();
        if !in_code_block {
            if let Some(caps) = weak_indent_re().captures(&line) {
                let needed = 4 - caps.get(1).map_or(0, |m| m.len());
                line = format!("{}{}", " ".repeat(needed), line);
            }
        }

        if i > 0 && !in_code_block && list_item_re().is_match(raw_lines[i - 1]) {
            let is_list = list_item_re().is_match(&line);
            let is_empty = line.trim().is_empty();
            let is_indented = line.starts_with(' ') || line.starts_with('\t');
            if !is_list && !is_empty && !is_indented {
                out.push(String::new());
            }
        }

        out.push(line);
    }

    out.join("\n")
}

// ── Event walk ──

#[derive(Debug, Clone, Copy, PartialEq)]
enum ListKind {
    Bullet,
    Ordered,
}

struct ItemFrame {
    kind: ListKind,
    todo: Option<bool>,
    block: Option<Block>,
    children: Vec<Block>,
}

#[derive(Default)]
struct TableFrame {
    rows: Vec<Vec<TextBody>>,
    row: Vec<TextBody>,
}

enum Frame {
    Quote,
    List(ListKind),
    Item(ItemFrame),
    Table(TableFrame),
    Code { language: u32, text: String },
}

struct ImageCapture {
    dest: String,
    alt: String,
}

struct Builder<'a> {
    resolver: Option<&'a dyn ResourceResolver>,
    roots: Vec<Block>,
    frames: Vec<Frame>,
    inline: Vec<TextElement>,
    bold: u32,
    italic: u32,
    strike: u32,
    link: Option<String>,
    image: Option<ImageCapture>,
}

impl<'a> Builder<'a> {
    fn new(resolver: Option<&'a dyn ResourceResolver>) -> Self {
        Builder {
            resolver,
            roots: Vec::new(),
            frames: Vec::new(),
            inline: Vec::new(),
            bold: 0,
            italic: 0,
            strike: 0,
            link: None,
            image: None,
        }
    }

    fn finish(self) -> Vec<Block> {
        self.roots
    }

    fn handle(&mut self, event: Event<'_>) {
        match event {
            Event::Start(tag) => self.start(tag),
            Event::End(tag) => self.end(tag),
            Event::Text(text) => self.text(&text),
            Event::Code(code) => {
                let mut style = self.style();
                style.inline_code = true;
                self.inline.push(TextElement::TextRun(TextRun {
                    content: code.into_string(),
                    style,
                }));
            }
            Event::SoftBreak | Event::HardBreak => {
                // The remote tolerates in-run newlines.
                self.push_run("\n");
            }
            Event::Rule => self.attach(Block::new(BlockContent::Divider)),
            Event::TaskListMarker(checked) => {
                for frame in self.frames.iter_mut().rev() {
                    if let Frame::Item(item) = frame {
                        item.todo = Some(checked);
                        break;
                    }
                }
            }
            Event::InlineHtml(html) => self.push_run(&html),
            // Block-level HTML has no remote representation.
            _ => {}
        }
    }

    fn start(&mut self, tag: Tag<'_>) {
        match tag {
            Tag::Paragraph | Tag::Heading { .. } => {}
            Tag::BlockQuote(_) => self.frames.push(Frame::Quote),
            Tag::CodeBlock(kind) => {
                self.flush_tight_item();
                let language = match kind {
                    CodeBlockKind::Fenced(info) => {
                        language_code(info.split_whitespace().next().unwrap_or(""))
                    }
                    CodeBlockKind::Indented => language_code(""),
                };
                self.frames.push(Frame::Code {
                    language,
                    text: String::new(),
                });
            }
            Tag::List(start) => {
                self.flush_tight_item();
                let kind = if start.is_some() {
                    ListKind::Ordered
                } else {
                    ListKind::Bullet
                };
                self.frames.push(Frame::List(kind));
            }
            Tag::Item => {
                let kind = self
                    .frames
                    .iter()
                    .rev()
                    .find_map(|f| match f {
                        Frame::List(kind) => Some(*kind),
                        _ => None,
                    })
                    .unwrap_or(ListKind::Bullet);
                self.frames.push(Frame::Item(ItemFrame {
                    kind,
                    todo: None,
                    block: None,
                    children: Vec::new(),
                }));
            }
            Tag::Table(_) => self.frames.push(Frame::Table(TableFrame::default())),
            Tag::TableHead | Tag::TableRow => {
                if let Some(Frame::Table(table)) = self.frames.last_mut() {
                    table.row = Vec::new();
                }
            }
            Tag::TableCell => {
                self.inline.clear();
            }
            Tag::Emphasis => self.italic += 1,
            Tag::Strong => self.bold += 1,
            Tag::Strikethrough => self.strike += 1,
            Tag::Link { dest_url, .. } => self.link = Some(dest_url.into_string()),
            Tag::Image { dest_url, .. } => {
                self.image = Some(ImageCapture {
                    dest: dest_url.into_string(),
                    alt: String::new(),
                });
            }
            _ => {}
        }
    }

    fn end(&mut self, tag: TagEnd) {
        match tag {
            TagEnd::Paragraph => self.end_paragraph(),
            TagEnd::Heading(level) => {
                let body = self.take_body();
                self.attach(Block::new(BlockContent::Heading {
                    level: heading_level(level),
                    body,
                }));
            }
            TagEnd::BlockQuote(_) => {
                if matches!(self.frames.last(), Some(Frame::Quote)) {
                    self.frames.pop();
                }
            }
            TagEnd::CodeBlock => {
                if let Some(Frame::Code { language, mut text }) = self.frames.pop() {
                    if text.ends_with('\n') {
                        text.pop();
                    }
                    self.attach(Block::new(BlockContent::Code {
                        language,
                        body: TextBody::from_plain(text),
                    }));
                }
            }
            TagEnd::List(_) => {
                if matches!(self.frames.last(), Some(Frame::List(_))) {
                    self.frames.pop();
                }
            }
            TagEnd::Item => self.end_item(),
            TagEnd::Table => {
                if let Some(Frame::Table(table)) = self.frames.pop() {
                    if let Some(block) = table_block(table) {
                        self.attach(block);
                    }
                }
            }
            TagEnd::TableHead | TagEnd::TableRow => {
                if let Some(Frame::Table(table)) = self.frames.last_mut() {
                    if !table.row.is_empty() {
                        let row = std::mem::take(&mut table.row);
                        table.rows.push(row);
                    }
                }
            }
            TagEnd::TableCell => {
                let body = self.take_body();
                if let Some(Frame::Table(table)) = self.frames.last_mut() {
                    table.row.push(body);
                }
            }
            TagEnd::Emphasis => self.italic = self.italic.saturating_sub(1),
            TagEnd::Strong => self.bold = self.bold.saturating_sub(1),
            TagEnd::Strikethrough => self.strike = self.strike.saturating_sub(1),
            TagEnd::Link => self.link = None,
            TagEnd::Image => self.end_image(),
            _ => {}
        }
    }

    fn text(&mut self, text: &str) {
        if let Some(image) = &mut self.image {
            image.alt.push_str(text);
            return;
        }
        if let Some(Frame::Code { text: buf, .. }) = self.frames.last_mut() {
            buf.push_str(text);
            return;
        }
        self.push_run(text);
    }

    fn style(&self) -> TextStyle {
        TextStyle {
            bold: self.bold > 0,
            italic: self.italic > 0,
            strikethrough: self.strike > 0,
            link: self.link.clone(),
            ..Default::default()
        }
    }

    fn push_run(&mut self, content: &str) {
        if content.is_empty() {
            return;
        }
        self.inline.push(TextElement::TextRun(TextRun {
            content: content.to_string(),
            style: self.style(),
        }));
    }

    fn take_body(&mut self) -> TextBody {
        let elements = std::mem::take(&mut self.inline);
        if elements.is_empty() {
            TextBody::from_plain("")
        } else {
            TextBody { elements }
        }
    }

    /// A tight list item carries inline content without a paragraph
    /// wrapper; materialize it before a nested block begins.
    fn flush_tight_item(&mut self) {
        if self.inline.is_empty() {
            return;
        }
        if matches!(self.frames.last(), Some(Frame::Item(item)) if item.block.is_none()) {
            let body = self.take_body();
            if let Some(Frame::Item(item)) = self.frames.last_mut() {
                let block = make_item_block(item.kind, item.todo, body);
                item.block = Some(block);
            }
        }
    }

    fn end_paragraph(&mut self) {
        let body = self.take_body();

        enum Target {
            Item(usize),
            Quote,
            Top,
        }
        let mut target = Target::Top;
        for idx in (0..self.frames.len()).rev() {
            match &self.frames[idx] {
                Frame::Item(_) => {
                    target = Target::Item(idx);
                    break;
                }
                Frame::Quote => {
                    target = Target::Quote;
                    break;
                }
                Frame::List(_) => continue,
                _ => break,
            }
        }

        match target {
            Target::Item(idx) => {
                if let Frame::Item(item) = &mut self.frames[idx] {
                    if item.block.is_none() {
                        item.block = Some(make_item_block(item.kind, item.todo, body));
                    } else {
                        item.children.push(Block::new(BlockContent::Text(body)));
                    }
                }
            }
            Target::Quote => self.attach(Block::new(BlockContent::Quote(body))),
            Target::Top => self.attach(Block::new(BlockContent::Text(body))),
        }
    }

    fn end_item(&mut self) {
        self.flush_tight_item();
        if let Some(Frame::Item(item)) = self.frames.pop() {
            let mut block = item
                .block
                .unwrap_or_else(|| make_item_block(item.kind, item.todo, TextBody::from_plain("")));
            block.children = item.children;
            self.attach(block);
        }
    }

    fn end_image(&mut self) {
        let Some(capture) = self.image.take() else {
            return;
        };
        let inline_fallback = format!("![{}]({})", capture.alt, capture.dest);

        if capture.dest.starts_with("http") {
            self.push_run(&inline_fallback);
            return;
        }

        let decoded = urlencoding::decode(&capture.dest)
            .map(|s| s.into_owned())
            .unwrap_or_else(|_| capture.dest.clone());
        let resolved = self.resolver.and_then(|r| r.resolve(&decoded));

        let Some(path) = resolved else {
            tracing::warn!("resource not found in vault: {}", capture.dest);
            self.push_run(&inline_fallback);
            return;
        };

        // Asset blocks only exist at the document top level; inside lists,
        // quotes or tables the reference stays as inline text.
        let splittable = !self
            .frames
            .iter()
            .any(|f| matches!(f, Frame::Item(_) | Frame::Quote | Frame::Table(_)));
        if !splittable {
            self.push_run(&inline_fallback);
            return;
        }

        if !self.inline.is_empty() {
            let body = self.take_body();
            self.attach(Block::new(BlockContent::Text(body)));
        }
        self.attach(asset_block(path, &capture.alt));
    }

    /// Append a finished block to the innermost container: the enclosing
    /// list item if any, otherwise the document root. Quote and list frames
    /// are transparent.
    fn attach(&mut self, block: Block) {
        for frame in self.frames.iter_mut().rev() {
            match frame {
                Frame::Item(item) => {
                    item.children.push(block);
                    return;
                }
                Frame::Quote | Frame::List(_) => continue,
                _ => break,
            }
        }
        self.roots.push(block);
    }
}

fn heading_level(level: HeadingLevel) -> u8 {
    (level as u8).clamp(1, 9)
}

fn make_item_block(kind: ListKind, todo: Option<bool>, mut body: TextBody) -> Block {
    let done = match todo {
        Some(done) => Some(done),
        None => strip_checkbox_marker(&mut body),
    };
    let content = match done {
        Some(done) => BlockContent::Todo { done, body },
        None => match kind {
            ListKind::Bullet => BlockContent::Bullet(body),
            ListKind::Ordered => BlockContent::Ordered(body),
        },
    };
    Block::new(content)
}

/// Detect and strip a leading `[ ]` / `[x]` marker from the first text run.
/// Returns the checked state when a marker was present.
fn strip_checkbox_marker(body: &mut TextBody) -> Option<bool> {
    let first = body.elements.first_mut()?;
    let TextElement::TextRun(run) = first else {
        return None;
    };
    let caps = checkbox_re().captures(&run.content)?;
    let done = caps
        .get(1)
        .map(|m| m.as_str().eq_ignore_ascii_case("x"))
        .unwrap_or(false);
    let rest = run.content[caps.get(0).map_or(0, |m| m.end())..].to_string();
    if rest.is_empty() {
        body.elements.remove(0);
        if body.elements.is_empty() {
            body.elements = TextBody::from_plain("").elements;
        }
    } else {
        run.content = rest;
    }
    Some(done)
}

fn asset_block(path: PathBuf, alt: &str) -> Block {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    let asset = AssetRef::Local {
        path: path.clone(),
        resolved: true,
    };
    if MEDIA_FILE_EXTS.contains(&ext.as_str()) {
        let name = if alt.is_empty() {
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        } else {
            alt.to_string()
        };
        Block::new(BlockContent::File { name, asset })
    } else {
        Block::new(BlockContent::Image(asset))
    }
}

/// Build a Table block with `row_size × column_size` TableCell children in
/// row-major order, each holding exactly one Text block.
fn table_block(table: TableFrame) -> Option<Block> {
    let mut rows = table.rows;
    if rows.is_empty() {
        return None;
    }
    let column_size = rows.iter().map(Vec::len).max().unwrap_or(0);
    if column_size == 0 {
        return None;
    }
    let row_size = rows.len();

    let mut cells = Vec::with_capacity(row_size * column_size);
    for row in &mut rows {
        while row.len() < column_size {
            row.push(TextBody::from_plain(""));
        }
        for body in row.drain(..) {
            let body = if body.is_empty() {
                TextBody::from_plain("")
            } else {
                body
            };
            cells.push(Block::with_children(
                BlockContent::TableCell,
                vec![Block::new(BlockContent::Text(body))],
            ));
        }
    }

    Some(Block::with_children(
        BlockContent::Table {
            row_size,
            column_size,
        },
        cells,
    ))
}
