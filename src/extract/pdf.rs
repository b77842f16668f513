//! PDF extraction: per-page text with table-like line runs lifted into tables.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, warn};

use super::{Block, ExtractError};
use crate::models::TableData;

static CELL_GAP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\t+|\s{2,}").expect("valid regex"));

/// Minimum consecutive aligned lines (header included) to call a run a table.
const MIN_TABLE_LINES: usize = 3;

pub(super) fn extract_pdf(bytes: &[u8]) -> Result<Vec<Block>, ExtractError> {
    // pdf-extract handles font encodings better; lopdf tolerates more damage.
    let pages = match catch_unwind(AssertUnwindSafe(|| {
        pdf_extract::extract_text_from_mem_by_pages(bytes)
    })) {
        Ok(Ok(pages)) if pages.iter().any(|p| !p.trim().is_empty()) => pages,
        Ok(Ok(_)) => {
            debug!("pdf-extract returned no text, trying lopdf");
            lopdf_pages(bytes)?
        }
        Ok(Err(e)) => {
            warn!(error = %e, "pdf-extract failed, trying lopdf");
            lopdf_pages(bytes)?
        }
        Err(_) => {
            warn!("pdf-extract panicked, trying lopdf");
            lopdf_pages(bytes)?
        }
    };

    let mut blocks = Vec::new();
    for (i, page) in pages.iter().enumerate() {
        blocks.extend(split_page(page, Some(i as u32 + 1)));
    }
    Ok(blocks)
}

/// Walk page content streams and collect `Tj`/`TJ` strings.
fn lopdf_pages(bytes: &[u8]) -> Result<Vec<String>, ExtractError> {
    use lopdf::{Document, Object};

    let doc = Document::load_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))?;
    let mut pages = Vec::new();
    for (_, page_id) in doc.get_pages() {
        let mut text = String::new();
        if let Ok(content) = doc.get_page_content(page_id) {
            let operations = lopdf::content::Content::decode(&content)
                .map(|c| c.operations)
                .unwrap_or_default();
            for op in operations {
                match op.operator.as_str() {
                    "Tj" | "'" | "\"" => {
                        if let Some(Object::String(bytes, _)) = op.operands.last() {
                            text.push_str(&decode_pdf_string(bytes));
                        }
                    }
                    "TJ" => {
                        if let Some(Object::Array(items)) = op.operands.first() {
                            for item in items {
                                if let Object::String(bytes, _) = item {
                                    text.push_str(&decode_pdf_string(bytes));
                                }
                            }
                        }
                    }
                    "Td" | "TD" | "T*" => {
                        if !text.ends_with('\n') && !text.ends_with(' ') && !text.is_empty() {
                            text.push(' ');
                        }
                    }
                    "ET" => {
                        if !text.ends_with('\n') {
                            text.push('\n');
                        }
                    }
                    _ => {}
                }
            }
        }
        pages.push(text);
    }
    if pages.iter().all(|p| p.trim().is_empty()) {
        return Err(ExtractError::Pdf("no text layer found".to_string()));
    }
    Ok(pages)
}

fn decode_pdf_string(bytes: &[u8]) -> String {
    String::from_utf8(bytes.to_vec()).unwrap_or_else(|_| bytes.iter().map(|&b| b as char).collect())
}

fn cells(line: &str) -> Vec<String> {
    CELL_GAP
        .split(line.trim())
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect()
}

/// Split one page into prose and tables. Runs of lines that split into the
/// same number (>= 2) of gap-separated cells become a table whose first line
/// is the header.
fn split_page(page: &str, page_no: Option<u32>) -> Vec<Block> {
    let lines: Vec<&str> = page.lines().collect();
    let mut blocks = Vec::new();
    let mut prose: Vec<&str> = Vec::new();
    let mut i = 0usize;
    while i < lines.len() {
        let width = cells(lines[i]).len();
        let mut end = i + 1;
        if width >= 2 {
            while end < lines.len() && cells(lines[end]).len() == width {
                end += 1;
            }
        }
        if width >= 2 && end - i >= MIN_TABLE_LINES {
            flush_prose(&mut prose, &mut blocks, page_no);
            let mut rows: Vec<Vec<String>> = lines[i..end].iter().map(|l| cells(l)).collect();
            let columns = rows.remove(0);
            blocks.push(Block::Table {
                table: TableData { columns, rows },
                page: page_no,
                sheet_name: None,
                emit_rows: false,
            });
            i = end;
        } else {
            prose.push(lines[i]);
            i += 1;
        }
    }
    flush_prose(&mut prose, &mut blocks, page_no);
    blocks
}

fn flush_prose(prose: &mut Vec<&str>, blocks: &mut Vec<Block>, page: Option<u32>) {
    let text = prose.join("\n");
    prose.clear();
    if !text.trim().is_empty() {
        blocks.push(Block::Prose { text, page });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_pdf_returns_error() {
        let err = extract_pdf(b"not a pdf").unwrap_err();
        assert!(matches!(err, ExtractError::Pdf(_)));
    }

    #[test]
    fn aligned_lines_become_a_table() {
        let page = "Quarterly report\nRegion    Sales    Units\nNorth    100    7\nSouth    80    5\nClosing remarks.";
        let blocks = split_page(page, Some(2));
        assert_eq!(blocks.len(), 3);
        match &blocks[1] {
            Block::Table { table, page, .. } => {
                assert_eq!(table.columns, vec!["Region", "Sales", "Units"]);
                assert_eq!(table.rows.len(), 2);
                assert_eq!(*page, Some(2));
            }
            other => panic!("expected table, got {other:?}"),
        }
    }

    #[test]
    fn short_aligned_runs_stay_prose() {
        let blocks = split_page("Name    Value\njust text", None);
        assert_eq!(blocks.len(), 1);
        assert!(matches!(blocks[0], Block::Prose { .. }));
    }
}
