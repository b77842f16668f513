//! Multi-format document extraction.
//!
//! Each format reader turns file bytes into an ordered list of [`Block`]s:
//! prose passages and structured tables. [`into_chunks`] then cleans and
//! chunks the prose, and serializes tables into the canonical
//! `TABLE DATA: columns: ...` / `ROW n: col: val | col: val` text form, so
//! tables and prose are retrievable through the same vector space.
//! Spreadsheet-like tables additionally yield one chunk per row.

mod html;
mod ooxml;
mod pdf;
mod tabular;

use std::path::Path;

use crate::chunk::{word_count, Chunker};
use crate::models::{SourceType, TableData};
use crate::preprocess::clean_text;

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("unsupported file type: {0}")]
    Unsupported(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("file is {size} bytes, limit is {limit}")]
    TooLarge { size: u64, limit: u64 },
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("OOXML extraction failed: {0}")]
    Ooxml(String),
    #[error("CSV parsing failed: {0}")]
    Csv(String),
    #[error("document contains no extractable text")]
    Empty,
}

/// A unit of extracted content, in document order.
#[derive(Debug, Clone, PartialEq)]
pub enum Block {
    Prose {
        text: String,
        page: Option<u32>,
    },
    Table {
        table: TableData,
        page: Option<u32>,
        sheet_name: Option<String>,
        /// Also emit one chunk per row.
        emit_rows: bool,
    },
}

#[derive(Debug, Clone)]
pub struct RawDocument {
    pub source_type: SourceType,
    pub blocks: Vec<Block>,
}

/// A chunk of a document, ready for embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedChunk {
    pub text: String,
    pub page: Option<u32>,
    pub is_table: bool,
    pub sheet_name: Option<String>,
    pub section_title: Option<String>,
    pub table_data: Option<TableData>,
    pub row_index: Option<usize>,
}

/// Read and parse a file, rejecting files larger than `max_bytes`.
pub fn extract_file(path: &Path, max_bytes: u64) -> Result<RawDocument, ExtractError> {
    let source_type = SourceType::from_path(path)
        .ok_or_else(|| ExtractError::Unsupported(path.display().to_string()))?;
    let size = std::fs::metadata(path)?.len();
    if size > max_bytes {
        return Err(ExtractError::TooLarge {
            size,
            limit: max_bytes,
        });
    }
    let bytes = std::fs::read(path)?;
    extract_bytes(&bytes, source_type)
}

pub fn extract_bytes(bytes: &[u8], source_type: SourceType) -> Result<RawDocument, ExtractError> {
    let blocks = match source_type {
        SourceType::Pdf => pdf::extract_pdf(bytes)?,
        SourceType::Docx => ooxml::extract_docx(bytes)?,
        SourceType::Excel => ooxml::extract_xlsx(bytes)?,
        SourceType::Csv => tabular::extract_csv(bytes)?,
        SourceType::Html => html::extract_html(bytes),
        SourceType::Text => extract_plain(bytes),
    };
    Ok(RawDocument {
        source_type,
        blocks,
    })
}

fn extract_plain(bytes: &[u8]) -> Vec<Block> {
    let text = String::from_utf8_lossy(bytes);
    let text = text.strip_prefix('\u{FEFF}').unwrap_or(&text);
    vec![Block::Prose {
        text: text.to_string(),
        page: None,
    }]
}

/// Extract and chunk in one step. A document that yields no chunks is an
/// [`ExtractError::Empty`] failure.
pub fn extract_and_chunk(
    path: &Path,
    max_bytes: u64,
    chunker: &Chunker,
) -> Result<(SourceType, Vec<ExtractedChunk>), ExtractError> {
    let doc = extract_file(path, max_bytes)?;
    let chunks = into_chunks(&doc, chunker);
    if chunks.is_empty() {
        return Err(ExtractError::Empty);
    }
    Ok((doc.source_type, chunks))
}

/// Chunk prose blocks and serialize table blocks, preserving block order.
pub fn into_chunks(doc: &RawDocument, chunker: &Chunker) -> Vec<ExtractedChunk> {
    let mut out = Vec::new();
    let mut section: Option<String> = None;
    for block in &doc.blocks {
        match block {
            Block::Prose { text, page } => {
                let cleaned = clean_text(text);
                for fragment in chunker.chunk(&cleaned) {
                    if fragment.section_title.is_some() {
                        section.clone_from(&fragment.section_title);
                    }
                    out.push(ExtractedChunk {
                        text: fragment.text,
                        page: *page,
                        is_table: false,
                        sheet_name: None,
                        section_title: fragment.section_title,
                        table_data: None,
                        row_index: None,
                    });
                }
            }
            Block::Table {
                table,
                page,
                sheet_name,
                emit_rows,
            } => {
                let table = normalize_table(table);
                if table.rows.is_empty() && table.columns.is_empty() {
                    continue;
                }
                for (text, group) in table_chunks(&table, chunker.size) {
                    out.push(ExtractedChunk {
                        text,
                        page: *page,
                        is_table: true,
                        sheet_name: sheet_name.clone(),
                        section_title: section.clone(),
                        table_data: Some(group),
                        row_index: None,
                    });
                }
                if *emit_rows {
                    for (i, row) in table.rows.iter().enumerate() {
                        out.push(ExtractedChunk {
                            text: row_line(&table.columns, row, i + 1),
                            page: *page,
                            is_table: true,
                            sheet_name: sheet_name.clone(),
                            section_title: section.clone(),
                            table_data: Some(TableData {
                                columns: table.columns.clone(),
                                rows: vec![row.clone()],
                            }),
                            row_index: Some(i + 1),
                        });
                    }
                }
            }
        }
    }
    out
}

fn clean_cell(cell: &str) -> String {
    clean_text(cell).replace('\n', " ")
}

/// Clean cells, name blank headers and drop rows with no content.
fn normalize_table(table: &TableData) -> TableData {
    let mut columns: Vec<String> = table.columns.iter().map(|c| clean_cell(c)).collect();
    let width = table
        .rows
        .iter()
        .map(Vec::len)
        .max()
        .unwrap_or(0)
        .max(columns.len());
    columns.resize(width, String::new());
    for (i, c) in columns.iter_mut().enumerate() {
        if c.is_empty() {
            *c = format!("column_{}", i + 1);
        }
    }
    let rows = table
        .rows
        .iter()
        .map(|r| r.iter().map(|c| clean_cell(c)).collect::<Vec<_>>())
        .filter(|r| r.iter().any(|c| !c.is_empty()))
        .collect();
    TableData { columns, rows }
}

pub fn table_header(columns: &[String]) -> String {
    format!("TABLE DATA: columns: {}", columns.join(", "))
}

/// `ROW n: col: val | col: val`, skipping empty cells.
pub fn row_line(columns: &[String], row: &[String], n: usize) -> String {
    let cells: Vec<String> = row
        .iter()
        .enumerate()
        .filter(|(_, v)| !v.is_empty())
        .map(|(i, v)| {
            let name = columns
                .get(i)
                .cloned()
                .unwrap_or_else(|| format!("column_{}", i + 1));
            format!("{name}: {v}")
        })
        .collect();
    format!("ROW {n}: {}", cells.join(" | "))
}

/// Serialize a whole table, numbering rows from `first_row`.
pub fn serialize_table(table: &TableData, first_row: usize) -> String {
    let mut out = table_header(&table.columns);
    for (i, row) in table.rows.iter().enumerate() {
        out.push('\n');
        out.push_str(&row_line(&table.columns, row, first_row + i));
    }
    out
}

/// Split a table into row groups within `size` words, repeating the header
/// in each group. A single row is never split.
fn table_chunks(table: &TableData, size: usize) -> Vec<(String, TableData)> {
    let header_words = word_count(&table_header(&table.columns));
    let mut groups = Vec::new();
    let mut start = 0usize;
    let mut words = header_words;
    for (i, row) in table.rows.iter().enumerate() {
        let row_words = word_count(&row_line(&table.columns, row, i + 1));
        if i > start && words + row_words > size {
            groups.push(start..i);
            start = i;
            words = header_words;
        }
        words += row_words;
    }
    groups.push(start..table.rows.len());

    groups
        .into_iter()
        .map(|range| {
            let group = TableData {
                columns: table.columns.clone(),
                rows: table.rows[range.clone()].to_vec(),
            };
            (serialize_table(&group, range.start + 1), group)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkingStrategy;

    fn table(columns: &[&str], rows: &[&[&str]]) -> TableData {
        TableData {
            columns: columns.iter().map(|s| s.to_string()).collect(),
            rows: rows
                .iter()
                .map(|r| r.iter().map(|s| s.to_string()).collect())
                .collect(),
        }
    }

    #[test]
    fn serializes_canonical_table_form() {
        let t = table(&["name", "age"], &[&["Alice", "30"], &["Bob", "25"]]);
        assert_eq!(
            serialize_table(&t, 1),
            "TABLE DATA: columns: name, age\nROW 1: name: Alice | age: 30\nROW 2: name: Bob | age: 25"
        );
    }

    #[test]
    fn row_line_skips_empty_and_names_extra_cells() {
        let cols = vec!["a".to_string()];
        let row = vec!["".to_string(), "x".to_string()];
        assert_eq!(row_line(&cols, &row, 3), "ROW 3: column_2: x");
    }

    #[test]
    fn large_tables_split_with_repeated_header() {
        let rows: Vec<Vec<String>> = (0..20)
            .map(|i| vec![format!("item{i}"), format!("{i}")])
            .collect();
        let t = TableData {
            columns: vec!["name".into(), "qty".into()],
            rows,
        };
        let groups = table_chunks(&t, 30);
        assert!(groups.len() > 1);
        for (text, _) in &groups {
            assert!(text.starts_with("TABLE DATA: columns: name, qty"));
        }
        assert!(groups[1].0.contains(&format!("ROW {}:", groups[0].1.rows.len() + 1)));
        let total: usize = groups.iter().map(|(_, g)| g.rows.len()).sum();
        assert_eq!(total, 20);
    }

    #[test]
    fn csv_document_yields_table_and_row_chunks() {
        let doc = extract_bytes(b"name,age\nAlice,30\nBob,25\n", SourceType::Csv).unwrap();
        let chunker = Chunker::new(ChunkingStrategy::Fixed, 100, 10);
        let chunks = into_chunks(&doc, &chunker);
        assert_eq!(chunks.len(), 3);
        assert!(chunks[0].text.contains("Alice") && chunks[0].text.contains("Bob"));
        assert!(chunks.iter().all(|c| c.is_table));
        assert_eq!(chunks[1].row_index, Some(1));
        assert_eq!(chunks[2].text, "ROW 2: name: Bob | age: 25");
    }

    #[test]
    fn tables_inherit_preceding_section_title() {
        let doc = RawDocument {
            source_type: SourceType::Docx,
            blocks: vec![
                Block::Prose {
                    text: "# Pricing\nSee below.".into(),
                    page: None,
                },
                Block::Table {
                    table: table(&["plan", "cost"], &[&["pro", "10"]]),
                    page: None,
                    sheet_name: None,
                    emit_rows: false,
                },
            ],
        };
        let mut chunker = Chunker::new(ChunkingStrategy::Semantic, 100, 0);
        chunker.section_aware = true;
        let chunks = into_chunks(&doc, &chunker);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].section_title.as_deref(), Some("Pricing"));
    }

    #[test]
    fn plain_text_strips_bom() {
        let doc = extract_bytes("\u{FEFF}hello".as_bytes(), SourceType::Text).unwrap();
        assert_eq!(
            doc.blocks,
            vec![Block::Prose {
                text: "hello".into(),
                page: None
            }]
        );
    }

    #[test]
    fn unsupported_extension_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob.bin");
        std::fs::write(&path, b"\x00\x01").unwrap();
        assert!(matches!(
            extract_file(&path, 1024),
            Err(ExtractError::Unsupported(_))
        ));
    }

    #[test]
    fn oversized_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.txt");
        std::fs::write(&path, "x".repeat(64)).unwrap();
        assert!(matches!(
            extract_file(&path, 10),
            Err(ExtractError::TooLarge { size: 64, limit: 10 })
        ));
    }

    #[test]
    fn blank_document_is_empty_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blank.md");
        std::fs::write(&path, "  \n\n ").unwrap();
        let chunker = Chunker::new(ChunkingStrategy::Fixed, 100, 10);
        assert!(matches!(
            extract_and_chunk(&path, 1024, &chunker),
            Err(ExtractError::Empty)
        ));
    }
}
