//! DOCX and XLSX readers over the raw OOXML parts (zip + quick-xml).

use std::io::{Cursor, Read};

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use super::{Block, ExtractError};
use crate::models::TableData;

/// Maximum sheets to process in an xlsx.
const XLSX_MAX_SHEETS: usize = 100;
/// Maximum cells to process per sheet.
const XLSX_MAX_CELLS_PER_SHEET: usize = 100_000;
/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

type Archive<'a> = zip::ZipArchive<Cursor<&'a [u8]>>;

fn ooxml_err(e: impl std::fmt::Display) -> ExtractError {
    ExtractError::Ooxml(e.to_string())
}

fn open_archive(bytes: &[u8]) -> Result<Archive<'_>, ExtractError> {
    zip::ZipArchive::new(Cursor::new(bytes)).map_err(ooxml_err)
}

fn read_entry(archive: &mut Archive<'_>, name: &str) -> Result<Vec<u8>, ExtractError> {
    let entry = archive.by_name(name).map_err(ooxml_err)?;
    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(ooxml_err)?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ExtractError::Ooxml(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, MAX_XML_ENTRY_BYTES
        )));
    }
    Ok(out)
}

fn attr(e: &BytesStart<'_>, local: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.local_name().as_ref() == local)
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}

// ---------------------------------------------------------------- DOCX

#[derive(Default)]
struct DocxState {
    blocks: Vec<Block>,
    prose: Vec<String>,
    paragraph: String,
    heading_level: Option<usize>,
    in_text: bool,
    table_depth: usize,
    cell: Vec<String>,
    row: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl DocxState {
    fn end_paragraph(&mut self) {
        let text = std::mem::take(&mut self.paragraph);
        let level = self.heading_level.take();
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        if self.table_depth > 0 {
            self.cell.push(text.to_string());
        } else if let Some(level) = level {
            self.prose.push(format!("{} {}", "#".repeat(level.clamp(1, 6)), text));
        } else {
            self.prose.push(text.to_string());
        }
    }

    fn flush_prose(&mut self) {
        if !self.prose.is_empty() {
            let text = self.prose.join("\n\n");
            self.prose.clear();
            self.blocks.push(Block::Prose { text, page: None });
        }
    }

    fn end_table(&mut self) {
        let mut rows = std::mem::take(&mut self.rows);
        if rows.is_empty() {
            return;
        }
        self.flush_prose();
        if rows.len() == 1 {
            self.prose.push(rows.remove(0).join(" | "));
            return;
        }
        let columns = rows.remove(0);
        self.blocks.push(Block::Table {
            table: TableData { columns, rows },
            page: None,
            sheet_name: None,
            emit_rows: false,
        });
    }
}

/// `Heading1`..`Heading9` and `Title` paragraph styles map to heading levels.
fn heading_level(style: &str) -> Option<usize> {
    let lower = style.to_ascii_lowercase();
    if lower == "title" {
        return Some(1);
    }
    lower
        .strip_prefix("heading")
        .and_then(|n| n.trim().parse::<usize>().ok())
}

pub(super) fn extract_docx(bytes: &[u8]) -> Result<Vec<Block>, ExtractError> {
    let mut archive = open_archive(bytes)?;
    let xml = read_entry(&mut archive, "word/document.xml")?;
    parse_document_xml(&xml)
}

fn parse_document_xml(xml: &[u8]) -> Result<Vec<Block>, ExtractError> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(false);
    let mut buf = Vec::new();
    let mut st = DocxState::default();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"t" => st.in_text = true,
                b"tbl" => st.table_depth += 1,
                b"p" => st.paragraph.clear(),
                b"pStyle" => st.heading_level = attr(&e, b"val").as_deref().and_then(heading_level),
                _ => {}
            },
            Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"tab" => st.paragraph.push('\t'),
                b"br" | b"cr" => st.paragraph.push('\n'),
                b"pStyle" => st.heading_level = attr(&e, b"val").as_deref().and_then(heading_level),
                _ => {}
            },
            Ok(Event::Text(te)) if st.in_text => {
                st.paragraph.push_str(&te.unescape().map_err(ooxml_err)?);
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => st.in_text = false,
                b"p" => st.end_paragraph(),
                b"tc" => {
                    let cell = std::mem::take(&mut st.cell).join(" ");
                    st.row.push(cell);
                }
                b"tr" => {
                    let row = std::mem::take(&mut st.row);
                    if !row.is_empty() {
                        st.rows.push(row);
                    }
                }
                b"tbl" => {
                    st.table_depth = st.table_depth.saturating_sub(1);
                    if st.table_depth == 0 {
                        st.end_table();
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ooxml_err(e)),
            _ => {}
        }
        buf.clear();
    }
    st.flush_prose();
    Ok(st.blocks)
}

// ---------------------------------------------------------------- XLSX

pub(super) fn extract_xlsx(bytes: &[u8]) -> Result<Vec<Block>, ExtractError> {
    let mut archive = open_archive(bytes)?;
    let shared_strings = if archive.index_for_name("xl/sharedStrings.xml").is_some() {
        parse_shared_strings(&read_entry(&mut archive, "xl/sharedStrings.xml")?)?
    } else {
        Vec::new()
    };
    let sheet_names = if archive.index_for_name("xl/workbook.xml").is_some() {
        parse_sheet_names(&read_entry(&mut archive, "xl/workbook.xml")?)?
    } else {
        Vec::new()
    };
    let parts = list_worksheet_parts(&archive);

    let mut blocks = Vec::new();
    for (idx, part) in parts.into_iter().take(XLSX_MAX_SHEETS).enumerate() {
        let xml = read_entry(&mut archive, &part)?;
        let mut rows = parse_sheet_rows(&xml, &shared_strings)?;
        rows.retain(|r| r.iter().any(|c| !c.trim().is_empty()));
        if rows.is_empty() {
            continue;
        }
        let columns = rows.remove(0);
        let sheet_name = sheet_names
            .get(idx)
            .cloned()
            .unwrap_or_else(|| format!("Sheet{}", idx + 1));
        blocks.push(Block::Table {
            table: TableData { columns, rows },
            page: None,
            sheet_name: Some(sheet_name),
            emit_rows: true,
        });
    }
    Ok(blocks)
}

fn list_worksheet_parts(archive: &Archive<'_>) -> Vec<String> {
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with("xl/worksheets/sheet") && n.ends_with(".xml"))
        .map(|s| s.to_string())
        .collect();
    names.sort_by_key(|name| {
        name.trim_start_matches("xl/worksheets/sheet")
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    names
}

/// One string per `<si>`, concatenating rich-text runs.
fn parse_shared_strings(xml: &[u8]) -> Result<Vec<String>, ExtractError> {
    let mut strings = Vec::new();
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(false);
    let mut buf = Vec::new();
    let mut current: Option<String> = None;
    let mut in_t = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => current = Some(String::new()),
                b"t" => in_t = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_t => {
                if let Some(s) = current.as_mut() {
                    s.push_str(&te.unescape().map_err(ooxml_err)?);
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"si" => strings.extend(current.take()),
                b"t" => in_t = false,
                _ => {}
            },
            Ok(Event::Empty(e)) if e.local_name().as_ref() == b"si" => strings.push(String::new()),
            Ok(Event::Eof) => break,
            Err(e) => return Err(ooxml_err(e)),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

fn parse_sheet_names(xml: &[u8]) -> Result<Vec<String>, ExtractError> {
    let mut names = Vec::new();
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) if e.local_name().as_ref() == b"sheet" => {
                names.extend(attr(&e, b"name"));
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ooxml_err(e)),
            _ => {}
        }
        buf.clear();
    }
    Ok(names)
}

/// Zero-based column index from a cell reference like `C7` or `AB12`.
fn column_index(cell_ref: &str) -> Option<usize> {
    let letters: String = cell_ref.chars().take_while(|c| c.is_ascii_alphabetic()).collect();
    if letters.is_empty() {
        return None;
    }
    let mut n = 0usize;
    for c in letters.chars() {
        n = n * 26 + (c.to_ascii_uppercase() as usize - 'A' as usize + 1);
    }
    Some(n - 1)
}

#[derive(Clone, Copy, PartialEq)]
enum CellKind {
    Shared,
    Inline,
    Bool,
    Other,
}

fn parse_sheet_rows(xml: &[u8], shared: &[String]) -> Result<Vec<Vec<String>>, ExtractError> {
    let mut rows: Vec<Vec<String>> = Vec::new();
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(false);
    let mut buf = Vec::new();

    let mut row: Vec<String> = Vec::new();
    let mut col = 0usize;
    let mut kind = CellKind::Other;
    let mut value = String::new();
    let mut in_value = false;
    let mut cells = 0usize;

    loop {
        if cells >= XLSX_MAX_CELLS_PER_SHEET {
            break;
        }
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"row" => {
                    row = Vec::new();
                    col = 0;
                }
                b"c" => {
                    col = attr(&e, b"r").as_deref().and_then(column_index).unwrap_or(row.len());
                    kind = match attr(&e, b"t").as_deref() {
                        Some("s") => CellKind::Shared,
                        Some("inlineStr") => CellKind::Inline,
                        Some("b") => CellKind::Bool,
                        _ => CellKind::Other,
                    };
                    value.clear();
                }
                b"v" => in_value = true,
                b"t" if kind == CellKind::Inline => in_value = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_value => value.push_str(&te.unescape().map_err(ooxml_err)?),
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"v" | b"t" => in_value = false,
                b"c" => {
                    let text = match kind {
                        CellKind::Shared => value
                            .trim()
                            .parse::<usize>()
                            .ok()
                            .and_then(|i| shared.get(i).cloned())
                            .unwrap_or_default(),
                        CellKind::Bool => match value.trim() {
                            "1" => "TRUE".to_string(),
                            "0" => "FALSE".to_string(),
                            other => other.to_string(),
                        },
                        CellKind::Inline | CellKind::Other => value.trim().to_string(),
                    };
                    if row.len() <= col {
                        row.resize(col + 1, String::new());
                    }
                    row[col] = text;
                    cells += 1;
                }
                b"row" => rows.push(std::mem::take(&mut row)),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ooxml_err(e)),
            _ => {}
        }
        buf.clear();
    }
    Ok(rows)
}
