//! Delimited text (CSV/TSV) reader.

use super::{Block, ExtractError};
use crate::models::TableData;

const CANDIDATE_DELIMITERS: [u8; 4] = [b',', b'\t', b';', b'|'];

/// Pick the delimiter that occurs most often on the first line; ties go to the
/// earlier candidate.
fn sniff_delimiter(text: &str) -> u8 {
    let first = text.lines().next().unwrap_or("");
    let mut best = (b',', 0usize);
    for d in CANDIDATE_DELIMITERS {
        let count = first.bytes().filter(|b| *b == d).count();
        if count > best.1 {
            best = (d, count);
        }
    }
    best.0
}

pub(super) fn extract_csv(bytes: &[u8]) -> Result<Vec<Block>, ExtractError> {
    let text = String::from_utf8_lossy(bytes);
    let text = text.strip_prefix('\u{FEFF}').unwrap_or(&text);
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(sniff_delimiter(text))
        .has_headers(false)
        .flexible(true)
        .from_reader(text.as_bytes());

    let mut rows: Vec<Vec<String>> = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| ExtractError::Csv(e.to_string()))?;
        let row: Vec<String> = record.iter().map(|c| c.trim().to_string()).collect();
        if row.iter().any(|c| !c.is_empty()) {
            rows.push(row);
        }
    }
    if rows.is_empty() {
        return Ok(Vec::new());
    }
    let columns = rows.remove(0);
    Ok(vec![Block::Table {
        table: TableData { columns, rows },
        page: None,
        sheet_name: None,
        emit_rows: true,
    }])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sniffs_common_delimiters() {
        assert_eq!(sniff_delimiter("a,b,c\n1,2,3"), b',');
        assert_eq!(sniff_delimiter("a\tb\tc"), b'\t');
        assert_eq!(sniff_delimiter("a;b;c"), b';');
        assert_eq!(sniff_delimiter("single"), b',');
    }

    #[test]
    fn quoted_fields_and_ragged_rows() {
        let blocks = extract_csv(b"name,note\n\"Smith, J\",\"said \"\"hi\"\"\"\nLee\n\n").unwrap();
        match &blocks[0] {
            Block::Table { table, .. } => {
                assert_eq!(table.columns, vec!["name", "note"]);
                assert_eq!(table.rows[0], vec!["Smith, J", "said \"hi\""]);
                assert_eq!(table.rows[1], vec!["Lee"]);
            }
            other => panic!("expected table, got {other:?}"),
        }
    }

    #[test]
    fn empty_csv_has_no_blocks() {
        assert!(extract_csv(b"").unwrap().is_empty());
    }
}
