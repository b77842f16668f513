//! HTML reader: walks the body in document order, emitting block-level
//! text as paragraphs and `<table>` elements as tables.

use std::sync::LazyLock;

use scraper::{ElementRef, Html, Node, Selector};

use super::Block;
use crate::models::TableData;

static ROW_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("tr").expect("valid selector"));
static CELL_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("th, td").expect("valid selector"));
static BODY_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("body").expect("valid selector"));

/// Subtrees whose text is never content.
const SKIPPED: [&str; 8] = [
    "script", "style", "noscript", "template", "head", "svg", "iframe", "object",
];

/// Elements that continue the surrounding line instead of starting a block.
const INLINE: [&str; 24] = [
    "a", "abbr", "b", "bdi", "bdo", "cite", "code", "data", "dfn", "em", "font", "i", "kbd",
    "label", "mark", "q", "s", "samp", "small", "span", "strong", "sub", "sup", "u",
];

/// Paragraph-like elements taken whole.
const PARAGRAPHS: [&str; 5] = ["p", "li", "blockquote", "dt", "dd"];

fn skipped(name: &str) -> bool {
    SKIPPED.contains(&name)
}

/// Whitespace-normalized text of `el`, leaving out [`SKIPPED`] subtrees.
fn visible_text(el: &ElementRef<'_>) -> String {
    let mut words: Vec<&str> = Vec::new();
    collect_words(el, &mut words);
    words.join(" ")
}

fn collect_words<'a>(el: &ElementRef<'a>, words: &mut Vec<&'a str>) {
    for child in el.children() {
        match child.value() {
            Node::Text(text) => words.extend(text.split_whitespace()),
            Node::Element(e) if !skipped(e.name()) => {
                if let Some(child_el) = ElementRef::wrap(child) {
                    collect_words(&child_el, words);
                }
            }
            _ => {}
        }
    }
}

fn table_from(el: &ElementRef<'_>) -> Option<TableData> {
    let mut rows: Vec<Vec<String>> = el
        .select(&ROW_SELECTOR)
        .map(|tr| tr.select(&CELL_SELECTOR).map(|c| visible_text(&c)).collect::<Vec<_>>())
        .filter(|r: &Vec<String>| r.iter().any(|c| !c.is_empty()))
        .collect();
    if rows.is_empty() {
        return None;
    }
    let columns = rows.remove(0);
    Some(TableData { columns, rows })
}

#[derive(Default)]
struct Walker {
    blocks: Vec<Block>,
    /// Paragraphs of the prose block being built.
    prose: Vec<String>,
    /// Loose text not inside any paragraph element, e.g. directly in a `<div>`.
    run: String,
}

impl Walker {
    fn end_run(&mut self) {
        let text = self.run.split_whitespace().collect::<Vec<_>>().join(" ");
        self.run.clear();
        if !text.is_empty() {
            self.prose.push(text);
        }
    }

    fn flush_prose(&mut self) {
        self.end_run();
        if !self.prose.is_empty() {
            self.blocks.push(Block::Prose {
                text: self.prose.join("\n\n"),
                page: None,
            });
            self.prose.clear();
        }
    }

    fn walk(&mut self, el: &ElementRef<'_>) {
        for child in el.children() {
            match child.value() {
                Node::Text(text) => self.run.push_str(text),
                Node::Element(e) => {
                    let Some(child_el) = ElementRef::wrap(child) else {
                        continue;
                    };
                    self.element(e.name(), &child_el);
                }
                _ => {}
            }
        }
    }

    fn element(&mut self, name: &str, el: &ElementRef<'_>) {
        if skipped(name) {
            return;
        }
        if name == "br" {
            self.run.push(' ');
            return;
        }
        if INLINE.contains(&name) {
            self.walk(el);
            return;
        }
        self.end_run();
        match name {
            "table" => {
                if let Some(table) = table_from(el) {
                    self.flush_prose();
                    self.blocks.push(Block::Table {
                        table,
                        page: None,
                        sheet_name: None,
                        emit_rows: false,
                    });
                }
            }
            "pre" => {
                let mut text = String::new();
                for node in el.descendants() {
                    if let Node::Text(t) = node.value() {
                        let hidden = node
                            .ancestors()
                            .filter_map(ElementRef::wrap)
                            .any(|a| skipped(a.value().name()));
                        if !hidden {
                            text.push_str(t);
                        }
                    }
                }
                if !text.trim().is_empty() {
                    self.prose.push(text.trim().to_string());
                }
            }
            _ if PARAGRAPHS.contains(&name) => {
                let text = visible_text(el);
                if !text.is_empty() {
                    self.prose.push(text);
                }
            }
            _ => match heading_level(name) {
                Some(level) => {
                    let text = visible_text(el);
                    if !text.is_empty() {
                        self.prose.push(format!("{} {}", "#".repeat(level), text));
                    }
                }
                None => {
                    self.walk(el);
                    self.end_run();
                }
            },
        }
    }
}

fn heading_level(name: &str) -> Option<usize> {
    match name.strip_prefix('h')?.parse::<usize>() {
        Ok(level @ 1..=6) => Some(level),
        _ => None,
    }
}

pub(super) fn extract_html(bytes: &[u8]) -> Vec<Block> {
    let source = String::from_utf8_lossy(bytes);
    let document = Html::parse_document(&source);
    let body = document
        .select(&BODY_SELECTOR)
        .next()
        .unwrap_or_else(|| document.root_element());

    let mut walker = Walker::default();
    walker.walk(&body);
    walker.flush_prose();
    walker.blocks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headings_paragraphs_and_tables_in_order() {
        let html = br#"<html><head><title>x</title></head><body>
            <h1>Guide</h1><p>Intro  text
            here.</p>
            <ul><li><p>nested item</p></li></ul>
            <table><tr><th>k</th><th>v</th></tr><tr><td>a</td><td>1</td></tr></table>
            <p>Outro.</p></body></html>"#;
        let blocks = extract_html(html);
        assert_eq!(blocks.len(), 3);
        assert_eq!(
            blocks[0],
            Block::Prose {
                text: "# Guide\n\nIntro text here.\n\nnested item".into(),
                page: None
            }
        );
        match &blocks[1] {
            Block::Table { table, .. } => {
                assert_eq!(table.columns, vec!["k", "v"]);
                assert_eq!(table.rows, vec![vec!["a".to_string(), "1".to_string()]]);
            }
            other => panic!("expected table, got {other:?}"),
        }
        assert!(matches!(&blocks[2], Block::Prose { text, .. } if text == "Outro."));
    }

    #[test]
    fn bare_body_text_is_kept() {
        let blocks = extract_html(b"<html><body>just <b>loose</b> text</body></html>");
        assert_eq!(
            blocks,
            vec![Block::Prose {
                text: "just loose text".into(),
                page: None
            }]
        );
    }

    fn prose_text(blocks: &[Block]) -> String {
        blocks
            .iter()
            .filter_map(|b| match b {
                Block::Prose { text, .. } => Some(text.as_str()),
                Block::Table { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    #[test]
    fn div_text_is_kept_next_to_paragraphs() {
        let blocks = extract_html(b"<body><div>Important div text</div><p>para</p></body>");
        assert_eq!(
            blocks,
            vec![Block::Prose {
                text: "Important div text\n\npara".into(),
                page: None
            }]
        );
    }

    #[test]
    fn script_style_and_noscript_are_dropped() {
        let blocks = extract_html(b"<body><script>var secret=1;</script><div>only div</div></body>");
        assert_eq!(prose_text(&blocks), "only div");

        let html = br#"<html><head><style>p { color: red }</style></head><body>
            <section><style>.x{}</style>Section text <span>with span</span>
            <noscript>enable javascript</noscript><template><p>hidden</p></template>
            <p>Visible <script>track()</script>paragraph.</p></section></body></html>"#;
        let text = prose_text(&extract_html(html));
        assert_eq!(text, "Section text with span\n\nVisible paragraph.");
    }

    #[test]
    fn loose_text_around_blocks_keeps_document_order() {
        let html = b"<body><article>Lead in<h2>Setup</h2>Between<br>lines<table><tr><th>k</th></tr><tr><td>v</td></tr></table>after table</article></body>";
        let blocks = extract_html(html);
        assert_eq!(blocks.len(), 3);
        assert!(matches!(&blocks[0], Block::Prose { text, .. } if text == "Lead in\n\n## Setup\n\nBetween lines"));
        assert!(matches!(&blocks[1], Block::Table { .. }));
        assert!(matches!(&blocks[2], Block::Prose { text, .. } if text == "after table"));
    }
}
