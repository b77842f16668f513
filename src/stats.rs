//! Knowledge-base statistics and health overview.
//!
//! Provides a quick summary of what's indexed: file and chunk counts, language
//! and format breakdowns, and the embedding setup the index was built with.
//! Used by `kb stats` to give confidence that ingestion is working as expected.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write;
use std::path::PathBuf;

use crate::handler::KbState;
use crate::index::Metric;
use crate::models::ChunkMetadata;
use crate::progress::format_number;

#[derive(Debug, Clone, Serialize)]
pub struct KbStats {
    pub path: PathBuf,
    pub state: KbState,
    pub total_files: usize,
    pub total_chunks: usize,
    pub table_chunks: usize,
    pub by_language: BTreeMap<String, usize>,
    pub by_source_type: BTreeMap<String, usize>,
    pub cache_entries: usize,
    pub dims: usize,
    pub embedding_model: String,
    pub embedding_provider: String,
    pub metric: Metric,
    pub zero_vector_mode: bool,
    pub safe_mode: bool,
    pub ultra_safe_mode: bool,
    pub disk_bytes: u64,
}

/// Per-chunk breakdown counts.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ChunkTally {
    pub table_chunks: usize,
    pub by_language: BTreeMap<String, usize>,
    pub by_source_type: BTreeMap<String, usize>,
}

pub fn tally(metadatas: &[ChunkMetadata]) -> ChunkTally {
    let mut t = ChunkTally::default();
    for m in metadatas {
        if m.is_table {
            t.table_chunks += 1;
        }
        *t.by_language.entry(m.language.clone()).or_default() += 1;
        *t.by_source_type
            .entry(m.source_type.as_str().to_string())
            .or_default() += 1;
    }
    t
}

/// Render the human-readable stats report.
pub fn render(stats: &KbStats) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Knowledge Base Stats");
    let _ = writeln!(out, "====================");
    let _ = writeln!(out);
    let _ = writeln!(out, "  Path:        {}", stats.path.display());
    let _ = writeln!(out, "  State:       {}", stats.state.as_str());
    let _ = writeln!(out, "  Size:        {}", format_bytes(stats.disk_bytes));
    let _ = writeln!(out);
    let _ = writeln!(out, "  Files:       {}", format_number(stats.total_files as u64));
    let _ = writeln!(out, "  Chunks:      {}", format_number(stats.total_chunks as u64));
    let _ = writeln!(out, "  Tables:      {}", format_number(stats.table_chunks as u64));
    let _ = writeln!(out, "  Cache:       {} embeddings", format_number(stats.cache_entries as u64));
    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "  Embedding:   {} / {} ({} dims, {})",
        stats.embedding_provider,
        stats.embedding_model,
        stats.dims,
        stats.metric.as_str()
    );
    if stats.zero_vector_mode {
        let _ = writeln!(out, "  WARNING:     no embedding provider available, semantic search disabled");
    }
    if stats.safe_mode || stats.ultra_safe_mode {
        let _ = writeln!(
            out,
            "  Modes:       safe={} ultra_safe={}",
            stats.safe_mode, stats.ultra_safe_mode
        );
    }

    for (title, map) in [
        ("By format:", &stats.by_source_type),
        ("By language:", &stats.by_language),
    ] {
        if map.is_empty() {
            continue;
        }
        let _ = writeln!(out);
        let _ = writeln!(out, "  {}", title);
        for (key, count) in map {
            let _ = writeln!(out, "    {:<12} {:>8}", key, format_number(*count as u64));
        }
    }
    out
}

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SourceType;

    #[test]
    fn tally_counts_tables_languages_and_formats() {
        let mut a = ChunkMetadata::sample("a.csv");
        a.is_table = true;
        a.source_type = SourceType::Csv;
        let mut b = ChunkMetadata::sample("b.txt");
        b.language = "de".into();
        let t = tally(&[a, b.clone(), b]);
        assert_eq!(t.table_chunks, 1);
        assert_eq!(t.by_language["de"], 2);
        assert_eq!(t.by_language["en"], 1);
        assert_eq!(t.by_source_type["csv"], 1);
        assert_eq!(t.by_source_type["text"], 2);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }
}
