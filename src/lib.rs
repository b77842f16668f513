//! # kb-rag
//!
//! A local knowledge-base engine for retrieval-augmented generation.
//!
//! Documents (PDF, DOCX, XLSX, CSV, HTML, Markdown and plain text) are
//! extracted, cleaned, chunked, annotated and embedded into a flat vector
//! index persisted in a single directory. Queries run a hybrid pipeline:
//! query expansion, vector search, metadata filtering, lexical re-scoring
//! and an optional cross-encoder pass.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────┐   ┌──────────┐   ┌─────────────┐
//! │ Extract  │──▶│ Preprocess │──▶│  Chunk   │──▶│   Embed     │
//! │ pdf/docx │   │ keywords  │   │ strategy │   │ cache+fallbk│
//! └──────────┘   └───────────┘   └──────────┘   └──────┬──────┘
//!                                                      ▼
//!                 ┌─────────────┐  search   ┌──────────────────┐
//!                 │   Search    │◀─────────│ FlatIndex + meta │
//!                 │ hybrid+xenc │           │ + file registry  │
//!                 └─────────────┘           └──────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! kb add report.pdf notes.md
//! kb add-dir ./docs
//! kb search "quarterly revenue" -n 5
//! kb stats
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Chunk metadata and retrieval results |
//! | [`preprocess`] | Text cleaning, keywords, language detection |
//! | [`chunk`] | Chunking strategies |
//! | [`extract`] | Format-specific text extraction |
//! | [`embedding`] | Embedding providers, cache and fallback policy |
//! | [`index`] | Flat vector index |
//! | [`registry`] | Per-file hash registry |
//! | [`query`] | Query expansion |
//! | [`search`] | Retrieval pipeline |
//! | [`rerank`] | Cross-encoder reranking |
//! | [`storage`] | On-disk layout, atomic writes, backups |
//! | [`scan`] | Directory scanning |
//! | [`handler`] | Knowledge-base orchestrator |
//! | [`progress`] | Progress reporting |
//! | [`stats`] | Knowledge-base statistics |

pub mod chunk;
pub mod config;
pub mod embedding;
pub mod extract;
pub mod handler;
pub mod index;
pub mod models;
pub mod preprocess;
pub mod progress;
pub mod query;
pub mod registry;
pub mod rerank;
pub mod scan;
pub mod search;
pub mod stats;
pub mod storage;

pub use config::{load_config, Config};
pub use handler::{CancelFlag, IngestOutcome, IngestStatus, KbState, RagHandler};
pub use models::{ChunkMetadata, RetrievedChunk};
pub use search::SearchOptions;
