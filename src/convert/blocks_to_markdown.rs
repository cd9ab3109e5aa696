//! Block tree → Markdown.
//!
//! Inverse of the parser for the supported block types. Remote-only block
//! types with no Markdown form are skipped. Image tokens are looked up in
//! the pre-downloaded asset map; a missing entry emits the download-failure
//! marker so the reference is not silently lost.

use crate::block::lang::language_name;
use crate::block::{AssetRef, Block, BlockContent, TextBody, TextElement};

use super::DownloadedAssets;

#[derive(Default)]
pub struct EmitOptions<'a> {
    /// Token → vault-relative path for downloaded assets. `None` means no
    /// downloader was wired in and tokens are emitted as-is.
    pub assets: Option<&'a DownloadedAssets>,
}

/// Emit Markdown for a sequence of top-level blocks.
pub fn emit_markdown(blocks: &[Block], opts: &EmitOptions) -> String {
    let mut lines: Vec<String> = Vec::new();
    let mut prev_was_heading = false;
    let mut first = true;

    for block in blocks {
        let Some(rendered) = render_block(block, 0, opts) else {
            continue;
        };
        let is_heading = matches!(block.content, BlockContent::Heading { .. });
        if is_heading && !first && !prev_was_heading {
            lines.push(String::new());
        }
        lines.extend(rendered);
        prev_was_heading = is_heading;
        first = false;
    }

    let mut lines = normalize_blank_lines(lines);
    while lines.first().is_some_and(String::is_empty) {
        lines.remove(0);
    }
    while lines.last().is_some_and(String::is_empty) {
        lines.pop();
    }
    lines.join("\n")
}

/// At most one consecutive blank line.
fn normalize_blank_lines(lines: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(lines.len());
    for line in lines {
        if line.is_empty() && out.last().is_some_and(String::is_empty) {
            continue;
        }
        out.push(line);
    }
    out
}

fn render_block(block: &Block, depth: usize, opts: &EmitOptions) -> Option<Vec<String>> {
    let indent = "  ".repeat(depth);
    let mut lines = match &block.content {
        BlockContent::Page => return None,
        BlockContent::Text(body) => vec![format!("{indent}{}", render_body(body))],
        BlockContent::Heading { level, body } => {
            let level = (*level).clamp(1, 9) as usize;
            vec![format!("{} {}", "#".repeat(level), render_body(body))]
        }
        BlockContent::Bullet(body) => vec![format!("{indent}- {}", render_body(body))],
        BlockContent::Ordered(body) => vec![format!("{indent}1. {}", render_body(body))],
        BlockContent::Todo { done, body } => {
            let marker = if *done { "[x]" } else { "[ ]" };
            vec![format!("{indent}- {marker} {}", render_body(body))]
        }
        BlockContent::Quote(body) => vec![format!("> {}", render_body(body))],
        BlockContent::Code { language, body } => {
            let fence_lang = language_name(*language).unwrap_or("");
            let mut out = vec![format!("```{fence_lang}")];
            out.extend(body.plain_text().split('\n').map(str::to_string));
            out.push("```".to_string());
            out
        }
        // Blank-padded so a preceding paragraph is not re-read as a
        // setext heading.
        BlockContent::Divider => vec![String::new(), "---".to_string(), String::new()],
        BlockContent::Image(asset) => vec![render_image(asset, opts)],
        // File attachments have no portable Markdown form.
        BlockContent::File { .. } => return None,
        BlockContent::Table { .. } => render_table(block)?,
        BlockContent::TableCell => return None,
    };

    // Table cells are rendered by their table; other children recurse as
    // nested list lines.
    if !matches!(block.content, BlockContent::Table { .. }) {
        for child in &block.children {
            if let Some(child_lines) = render_block(child, depth + 1, opts) {
                lines.extend(child_lines);
            }
        }
    }
    Some(lines)
}

fn render_image(asset: &AssetRef, opts: &EmitOptions) -> String {
    let token = match asset {
        AssetRef::Remote(token) => token.as_str(),
        AssetRef::Local { path, .. } => return format!("![Image]({})", path.display()),
    };
    match opts.assets {
        Some(map) => match map.get(token) {
            Some(path) => format!("![Image]({path})"),
            None => format!("![下载失败]({token})"),
        },
        None => format!("![Image]({token})"),
    }
}

fn render_table(table: &Block) -> Option<Vec<String>> {
    let BlockContent::Table {
        row_size,
        column_size,
    } = table.content
    else {
        return None;
    };
    if row_size == 0 || column_size == 0 {
        return None;
    }

    let mut cells: Vec<String> = Vec::with_capacity(row_size * column_size);
    for cell in &table.children {
        let text = cell
            .children
            .first()
            .and_then(Block::body)
            .map(|body| body.plain_text().replace('|', "\\|"))
            .unwrap_or_default();
        cells.push(text);
    }
    cells.resize(row_size * column_size, String::new());

    let mut lines = Vec::with_capacity(row_size + 1);
    for row in 0..row_size {
        let row_cells = &cells[row * column_size..(row + 1) * column_size];
        lines.push(format!("| {} |", row_cells.join(" | ")));
        if row == 0 {
            lines.push(format!("| {} |", vec!["---"; column_size].join(" | ")));
        }
    }
    Some(lines)
}

fn render_body(body: &TextBody) -> String {
    let mut out = String::new();
    for element in &body.elements {
        let TextElement::TextRun(run) = element else {
            continue;
        };
        let mut text = run.content.clone();
        let style = &run.style;
        if style.inline_code {
            text = format!("`{text}`");
        }
        if style.bold {
            text = format!("**{text}**");
        }
        if style.italic {
            text = format!("*{text}*");
        }
        if style.strikethrough {
            text = format!("~~{text}~~");
        }
        if let Some(url) = &style.link {
            text = format!("[{text}]({url})");
        }
        out.push_str(&text);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{TextRun, TextStyle};
    use crate::convert::{parse_markdown, ParseOptions};
    use std::collections::HashMap;

    fn emit(blocks: &[Block]) -> String {
        emit_markdown(blocks, &EmitOptions::default())
    }

    fn round_trip(text: &str) -> String {
        let blocks = parse_markdown(text, &ParseOptions::default());
        emit(&blocks)
    }

    #[test]
    fn heading_round_trips() {
        assert_eq!(round_trip("# Hello\n"), "# Hello");
    }

    #[test]
    fn todo_round_trips() {
        assert_eq!(
            round_trip("- [ ] todo one\n- [x] todo two\n"),
            "- [ ] todo one\n- [x] todo two"
        );
    }

    #[test]
    fn nested_list_round_trips_with_indentation() {
        assert_eq!(round_trip("- a\n    - b\n- c\n"), "- a\n  - b\n- c");
    }

    #[test]
    fn code_block_round_trips_with_language() {
        assert_eq!(
            round_trip("```rust\nfn main() {}\n```\n"),
            "```rust\nfn main() {}\n```"
        );
    }

    #[test]
    fn unknown_language_code_emits_bare_fence() {
        let block = Block::new(BlockContent::Code {
            language: 999,
            body: TextBody::from_plain("x"),
        });
        assert_eq!(emit(&[block]), "```\nx\n```");
    }

    #[test]
    fn quote_round_trips() {
        assert_eq!(round_trip("> wise words\n"), "> wise words");
    }

    #[test]
    fn divider_emits_own_line() {
        let blocks = vec![
            Block::new(BlockContent::Text(TextBody::from_plain("a"))),
            Block::new(BlockContent::Divider),
        ];
        assert_eq!(emit(&blocks), "a\n\n---");
    }

    #[test]
    fn blank_line_inserted_before_heading() {
        let blocks = vec![
            Block::new(BlockContent::Text(TextBody::from_plain("para"))),
            Block::new(BlockContent::Heading {
                level: 2,
                body: TextBody::from_plain("Next"),
            }),
        ];
        assert_eq!(emit(&blocks), "para\n\n## Next");
    }

    #[test]
    fn styles_emit_markdown_wrappers() {
        let body = TextBody {
            elements: vec![TextElement::TextRun(TextRun {
                content: "x".into(),
                style: TextStyle {
                    bold: true,
                    italic: true,
                    ..Default::default()
                },
            })],
        };
        let block = Block::new(BlockContent::Text(body));
        assert_eq!(emit(&[block]), "***x***");
    }

    #[test]
    fn link_style_emits_markdown_link() {
        let body = TextBody {
            elements: vec![TextElement::TextRun(TextRun {
                content: "site".into(),
                style: TextStyle {
                    link: Some("https://example.com".into()),
                    ..Default::default()
                },
            })],
        };
        assert_eq!(
            emit(&[Block::new(BlockContent::Text(body))]),
            "[site](https://example.com)"
        );
    }

    #[test]
    fn downloaded_image_emits_relative_path() {
        let mut assets = HashMap::new();
        assets.insert("tok_img".to_string(), "attachments/tok_img.png".to_string());
        let block = Block::new(BlockContent::Image(AssetRef::Remote("tok_img".into())));
        let out = emit_markdown(
            &[block],
            &EmitOptions {
                assets: Some(&assets),
            },
        );
        assert_eq!(out, "![Image](attachments/tok_img.png)");
    }

    #[test]
    fn failed_download_emits_marker() {
        let assets = HashMap::new();
        let block = Block::new(BlockContent::Image(AssetRef::Remote("tok_gone".into())));
        let out = emit_markdown(
            &[block],
            &EmitOptions {
                assets: Some(&assets),
            },
        );
        assert_eq!(out, "![下载失败](tok_gone)");
    }

    #[test]
    fn table_round_trips() {
        let md = "| a | b |\n| --- | --- |\n| c | d |\n";
        assert_eq!(round_trip(md), "| a | b |\n| --- | --- |\n| c | d |");
    }

    #[test]
    fn pipe_in_table_cell_is_escaped() {
        let cell_text = |s: &str| {
            Block::with_children(
                BlockContent::TableCell,
                vec![Block::new(BlockContent::Text(TextBody::from_plain(s)))],
            )
        };
        let table = Block::with_children(
            BlockContent::Table {
                row_size: 1,
                column_size: 2,
            },
            vec![cell_text("a|b"), cell_text("c")],
        );
        assert_eq!(emit(&[table]), "| a\\|b | c |");
    }

    #[test]
    fn unknown_remote_block_is_skipped() {
        let blocks = vec![
            Block::new(BlockContent::Text(TextBody::from_plain("kept"))),
            Block::new(BlockContent::File {
                name: "f.zip".into(),
                asset: AssetRef::Remote("tok".into()),
            }),
        ];
        assert_eq!(emit(&blocks), "kept");
    }

    #[test]
    fn front_matter_survives_as_quote() {
        let out = round_trip("---\ntitle: T\n---\nbody\n");
        assert_eq!(out, "> **title: **T\nbody");
    }

    #[test]
    fn blank_lines_are_collapsed() {
        let lines = vec![
            "a".to_string(),
            String::new(),
            String::new(),
            "b".to_string(),
        ];
        assert_eq!(normalize_blank_lines(lines), vec!["a", "", "b"]);
    }
}
