//! Core data models shared by ingestion and retrieval.
//!
//! Chunk texts and their [`ChunkMetadata`] live in two parallel ordered
//! collections; position `i` in one always describes position `i` in the other
//! and row `i` of the vector index.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Source format of an ingested file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Pdf,
    Docx,
    Excel,
    Csv,
    Html,
    Text,
}

impl SourceType {
    /// Resolve the source type from a file extension (case-insensitive).
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "pdf" => Some(SourceType::Pdf),
            "docx" => Some(SourceType::Docx),
            "xlsx" | "xlsm" => Some(SourceType::Excel),
            "csv" | "tsv" => Some(SourceType::Csv),
            "html" | "htm" | "xhtml" => Some(SourceType::Html),
            "txt" | "md" | "markdown" | "rst" | "log" | "text" => Some(SourceType::Text),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Pdf => "pdf",
            SourceType::Docx => "docx",
            SourceType::Excel => "excel",
            SourceType::Csv => "csv",
            SourceType::Html => "html",
            SourceType::Text => "text",
        }
    }
}

/// Rows and columns of a table, kept alongside its serialized text.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TableData {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

/// Sidecar record for one chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub chunk_id: String,
    pub file_name: String,
    /// Absolute path the file was ingested from.
    pub source_path: String,
    /// Content hash of the source file at ingestion time.
    pub source_hash: String,
    /// One-based page number, when the format has pages.
    pub page: Option<u32>,
    pub chunk_index: usize,
    pub is_table: bool,
    pub created_at: DateTime<Utc>,
    pub source_type: SourceType,
    pub sheet_name: Option<String>,
    pub section_title: Option<String>,
    pub table_data: Option<TableData>,
    /// One-based row number for row-level spreadsheet chunks.
    pub row_index: Option<usize>,
    pub keywords: Vec<String>,
    pub language: String,
    pub importance_score: f32,
    pub embedding_model: String,
    /// Prior content hashes of the source file, newest first.
    pub version_lineage: Vec<String>,
}

/// A retrieval hit: chunk text, its metadata and the final ranking score.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievedChunk {
    pub content: String,
    pub metadata: ChunkMetadata,
    pub score: f32,
}

#[cfg(test)]
impl ChunkMetadata {
    /// Minimal prose-chunk metadata for unit tests.
    pub(crate) fn sample(file_name: &str) -> Self {
        Self {
            chunk_id: uuid::Uuid::new_v4().to_string(),
            file_name: file_name.to_string(),
            source_path: format!("/nonexistent/{file_name}"),
            source_hash: String::new(),
            page: None,
            chunk_index: 0,
            is_table: false,
            created_at: Utc::now(),
            source_type: SourceType::Text,
            sheet_name: None,
            section_title: None,
            table_data: None,
            row_index: None,
            keywords: Vec::new(),
            language: "en".to_string(),
            importance_score: 1.0,
            embedding_model: "test".to_string(),
            version_lineage: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_type_from_extension() {
        assert_eq!(SourceType::from_path(Path::new("a/b.PDF")), Some(SourceType::Pdf));
        assert_eq!(SourceType::from_path(Path::new("sheet.xlsx")), Some(SourceType::Excel));
        assert_eq!(SourceType::from_path(Path::new("notes.md")), Some(SourceType::Text));
        assert_eq!(SourceType::from_path(Path::new("page.htm")), Some(SourceType::Html));
        assert_eq!(SourceType::from_path(Path::new("binary.exe")), None);
        assert_eq!(SourceType::from_path(Path::new("README")), None);
    }

    #[test]
    fn source_type_serializes_lowercase() {
        let json = serde_json::to_string(&SourceType::Excel).unwrap();
        assert_eq!(json, "\"excel\"");
    }
}
