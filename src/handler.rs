//! Knowledge-base orchestrator.
//!
//! [`RagHandler`] owns one knowledge-base directory: the vector index, the
//! parallel chunk and metadata lists, the file registry and the embeddings
//! cache. It exposes the ingestion, removal and retrieval operations.
//!
//! # State machine
//!
//! ```text
//! Uninitialized ─load─► Loaded | Empty | NeedsReindex
//! Loaded | Empty | NeedsReindex | Persisted ─add/remove─► Mutated ─save─► Persisted
//! ```
//!
//! A load that finds an index built with another embedding model or
//! dimension backs the files up, clears them and enters `NeedsReindex`; the
//! caller re-adds files from there.
//!
//! # Concurrency
//!
//! Extraction, chunking and embedding run without holding the knowledge-base
//! lock. Only the final commit (splice into the index, registry update and
//! persist) takes the write lock, so `batch_add_files` workers overlap on the
//! expensive parts. Concurrent ingestion of the *same* file name is not
//! coordinated beyond the commit being atomic; callers serialize it.
//!
//! # Failure semantics
//!
//! No public operation returns an error for per-file or per-query problems.
//! Ingestion reports [`IngestStatus::Failed`], retrieval returns an empty list
//! and embedding failures degrade to zero vectors.

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{
    Arc, Mutex, MutexGuard, OnceLock, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
};
use tracing::{debug, error, info, warn};

use crate::chunk::{word_count, Chunker};
use crate::config::Config;
use crate::embedding::{EmbeddingProvider, EmbeddingsCache, Embedder};
use crate::extract::{extract_and_chunk, ExtractedChunk};
use crate::index::{FlatIndex, IndexError};
use crate::models::{ChunkMetadata, RetrievedChunk, SourceType};
use crate::preprocess::TextPreprocessor;
use crate::progress::{percent, ProgressReporter};
use crate::registry::{
    FileFingerprint, FileRegistry, FileRegistryEntry, Registration, RepairReport,
    MAX_VERSION_HISTORY,
};
use crate::rerank::{create_cross_encoder, CrossEncoder};
use crate::search::{self, Corpus, SearchOptions};
use crate::stats::{self, KbStats};
use crate::storage::{
    self, FallbackDirs, KbLayout, MetadataBundle, CACHE_FILE, INDEX_FILE,
    METADATA_FILE, METADATA_FORMAT_VERSION, REGISTRY_FILE,
};

/// Lifecycle of the knowledge base held by a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KbState {
    Uninitialized,
    /// No persisted index; fresh state.
    Empty,
    /// Index, metadata and registry read from disk.
    Loaded,
    /// Changed in memory, not yet written.
    Mutated,
    /// Written back to disk.
    Persisted,
    /// Persisted index was incompatible and has been cleared.
    NeedsReindex,
}

impl KbState {
    pub fn as_str(&self) -> &'static str {
        match self {
            KbState::Uninitialized => "uninitialized",
            KbState::Empty => "empty",
            KbState::Loaded => "loaded",
            KbState::Mutated => "mutated",
            KbState::Persisted => "persisted",
            KbState::NeedsReindex => "needs_reindex",
        }
    }
}

/// Cooperative cancellation for batch ingestion, checked between files.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IngestStatus {
    /// New chunks were indexed; `replaced` old chunks of the same file were dropped.
    Indexed { chunks: usize, replaced: usize },
    /// Content hash matched the registry; nothing to do.
    Unchanged,
    Failed { reason: String },
    /// Skipped because the batch was cancelled before this file started.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestOutcome {
    pub file_name: String,
    pub path: PathBuf,
    #[serde(flatten)]
    pub status: IngestStatus,
}

impl IngestOutcome {
    fn failed(path: &Path, file_name: &str, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        warn!(file = %path.display(), %reason, "ingestion failed");
        Self {
            file_name: file_name.to_string(),
            path: path.to_path_buf(),
            status: IngestStatus::Failed { reason },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(
            self.status,
            IngestStatus::Indexed { .. } | IngestStatus::Unchanged
        )
    }
}

/// A registry entry with its file name, as listed by `get_indexed_files_detailed`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexedFile {
    pub file_name: String,
    #[serde(flatten)]
    pub entry: FileRegistryEntry,
}

struct KbInner {
    layout: KbLayout,
    fallback: FallbackDirs,
    index: FlatIndex,
    chunks: Vec<String>,
    metadatas: Vec<ChunkMetadata>,
    registry: FileRegistry,
    state: KbState,
    /// Bumped when the caller points the handler at another directory.
    /// Fallback moves during persist keep it.
    generation: u64,
}

impl KbInner {
    fn mask_without(&self, file_name: &str) -> (Vec<bool>, usize) {
        let keep: Vec<bool> = self
            .metadatas
            .iter()
            .map(|m| m.file_name != file_name)
            .collect();
        let dropped = keep.iter().filter(|k| !**k).count();
        (keep, dropped)
    }

    /// Rebuild the index and parallel lists without `file_name`'s chunks.
    /// O(remaining chunks).
    fn drop_file_chunks(&mut self, file_name: &str) -> usize {
        let (keep, dropped) = self.mask_without(file_name);
        if dropped == 0 {
            return 0;
        }
        self.index = self.index.retain_rows(&keep);
        let mut keep_iter = keep.iter();
        self.chunks.retain(|_| *keep_iter.next().unwrap_or(&false));
        let mut keep_iter = keep.iter();
        self.metadatas.retain(|_| *keep_iter.next().unwrap_or(&false));
        dropped
    }

    fn clear_memory(&mut self) {
        self.index = FlatIndex::new(self.index.dims(), self.index.metric());
        self.chunks.clear();
        self.metadatas.clear();
        self.registry.clear();
    }
}

/// Extracted, embedded chunks of one file waiting to be committed.
struct PreparedFile {
    file_name: String,
    path: PathBuf,
    fingerprint: FileFingerprint,
    chunks: Vec<String>,
    metadatas: Vec<ChunkMetadata>,
    vectors: Vec<Vec<f32>>,
}

pub struct RagHandler {
    config: Config,
    preprocessor: TextPreprocessor,
    embedder: Arc<Embedder>,
    inner: RwLock<KbInner>,
    cross_encoder: OnceLock<Option<Arc<dyn CrossEncoder>>>,
    safe_mode: AtomicBool,
    ultra_safe_mode: AtomicBool,
}

impl RagHandler {
    /// Open the configured knowledge base, resolving the embedding provider
    /// through its fallback policy.
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;
        let root = pick_root(&config);
        let layout = KbLayout::new(&root);
        let cache = load_cache(&layout, &config);
        let embedder = Embedder::from_config(&config.embedding, &layout.model_cache_dir(), cache);
        Self::with_embedder(config, root, embedder)
    }

    /// Open with an already constructed provider.
    pub fn with_provider(config: Config, provider: Box<dyn EmbeddingProvider>) -> Result<Self> {
        config.validate()?;
        let root = pick_root(&config);
        let cache = load_cache(&KbLayout::new(&root), &config);
        let embedder = Embedder::new(
            provider,
            cache,
            config.embedding.batch_size,
            config.embedding.normalize,
        );
        Self::with_embedder(config, root, embedder)
    }

    fn with_embedder(config: Config, root: PathBuf, embedder: Embedder) -> Result<Self> {
        let fallback = FallbackDirs::new(
            &config.knowledge_base.path,
            config.knowledge_base.fallback_dir.as_deref(),
        );
        let inner = KbInner {
            layout: KbLayout::new(root),
            fallback,
            index: FlatIndex::new(embedder.dims(), embedder.metric()),
            chunks: Vec::new(),
            metadatas: Vec::new(),
            registry: FileRegistry::new(),
            state: KbState::Uninitialized,
            generation: 0,
        };
        let handler = Self {
            preprocessor: TextPreprocessor::new(config.preprocess.cache_capacity),
            safe_mode: AtomicBool::new(config.retrieval.safe_mode),
            ultra_safe_mode: AtomicBool::new(config.retrieval.ultra_safe_mode),
            config,
            embedder: Arc::new(embedder),
            inner: RwLock::new(inner),
            cross_encoder: OnceLock::new(),
        };
        {
            let mut inner = handler.write();
            handler.load(&mut inner);
        }
        Ok(handler)
    }

    /// Supply the cross-encoder instead of building one on first use.
    pub fn set_cross_encoder(&self, encoder: Arc<dyn CrossEncoder>) -> bool {
        self.cross_encoder.set(Some(encoder)).is_ok()
    }

    fn read(&self) -> RwLockReadGuard<'_, KbInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, KbInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_cache(&self) -> MutexGuard<'_, EmbeddingsCache> {
        self.embedder.cache().lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn embedder(&self) -> &Embedder {
        &self.embedder
    }

    pub fn state(&self) -> KbState {
        self.read().state
    }

    pub fn knowledge_base_path(&self) -> PathBuf {
        self.read().layout.root().to_path_buf()
    }

    pub fn chunk_count(&self) -> usize {
        self.read().chunks.len()
    }

    /// Snapshot of chunk texts and metadata, in index order.
    pub fn chunks(&self) -> Vec<(String, ChunkMetadata)> {
        let inner = self.read();
        inner
            .chunks
            .iter()
            .cloned()
            .zip(inner.metadatas.iter().cloned())
            .collect()
    }

    pub fn set_safe_mode(&self, on: bool) {
        info!(on, "safe retrieval mode");
        self.safe_mode.store(on, Ordering::SeqCst);
    }

    pub fn set_ultra_safe_mode(&self, on: bool) {
        info!(on, "ultra-safe ingestion mode");
        self.ultra_safe_mode.store(on, Ordering::SeqCst);
    }

    pub fn is_safe_mode(&self) -> bool {
        self.safe_mode.load(Ordering::SeqCst)
    }

    pub fn is_ultra_safe_mode(&self) -> bool {
        self.ultra_safe_mode.load(Ordering::SeqCst)
    }

    // ============ Load ============

    fn load(&self, inner: &mut KbInner) {
        let dims = self.embedder.dims();
        let metric = self.embedder.metric();
        inner.index = FlatIndex::new(dims, metric);
        inner.chunks.clear();
        inner.metadatas.clear();
        inner.state = KbState::Uninitialized;
        inner.registry = FileRegistry::load(&inner.layout.registry_path());

        if !inner.layout.metadata_path().exists() {
            if inner.layout.index_path().exists() {
                warn!(path = %inner.layout.root().display(), "index without metadata, discarding");
                self.reset_for_reindex(inner, "index without metadata");
                return;
            }
            if !inner.registry.is_empty() {
                let report = inner.registry.repair_from_metadata(&[], self.embedder.provider_name());
                self.save_registry(inner, &report);
            }
            inner.state = KbState::Empty;
            info!(path = %inner.layout.root().display(), "opened empty knowledge base");
            return;
        }

        let bundle = match MetadataBundle::load(&inner.layout.metadata_path()) {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "metadata unreadable");
                self.reset_for_reindex(inner, "unreadable metadata");
                return;
            }
        };

        if let Some(reason) = self.incompatibility(&bundle) {
            warn!(
                persisted_model = %bundle.embedding_model,
                persisted_dims = bundle.dims,
                active_model = self.embedder.model_name(),
                active_dims = dims,
                "{}", reason
            );
            self.reset_for_reindex(inner, &reason);
            return;
        }

        inner.chunks = bundle.chunks;
        inner.metadatas = bundle.metadatas;

        let loaded = if bundle.metric != metric {
            info!("index metric changed, rebuilding vectors");
            None
        } else {
            match FlatIndex::load(&inner.layout.index_path(), dims) {
                Ok(idx) if idx.len() == inner.chunks.len() && idx.metric() == metric => Some(idx),
                Ok(idx) => {
                    warn!(
                        index_rows = idx.len(),
                        chunks = inner.chunks.len(),
                        "index out of step with metadata, rebuilding"
                    );
                    None
                }
                Err(IndexError::Incompatible(reason)) => {
                    warn!(%reason, "persisted index incompatible");
                    self.reset_for_reindex(inner, &reason);
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "persisted index unusable, rebuilding");
                    None
                }
            }
        };

        let mut rebuilt = false;
        inner.index = match loaded {
            Some(idx) => idx,
            None => {
                rebuilt = true;
                self.rebuild_index(&inner.chunks)
            }
        };

        let report = inner
            .registry
            .repair_from_metadata(&inner.metadatas, self.embedder.provider_name());
        if rebuilt {
            inner.state = KbState::Mutated;
            if let Err(e) = self.persist(inner) {
                error!(error = %e, "failed to persist rebuilt index");
            }
        } else {
            self.save_registry(inner, &report);
        }
        if inner.state != KbState::Persisted && inner.state != KbState::Mutated {
            inner.state = KbState::Loaded;
        }
        info!(
            path = %inner.layout.root().display(),
            files = inner.registry.len(),
            chunks = inner.chunks.len(),
            "loaded knowledge base"
        );
    }

    /// Why a persisted bundle cannot be used with the active embedder, if it
    /// cannot. In zero-vector mode only the dimension is compared, so a
    /// temporarily missing provider does not wipe the index.
    fn incompatibility(&self, bundle: &MetadataBundle) -> Option<String> {
        if bundle.dims != self.embedder.dims() {
            return Some(format!(
                "embedding dimension changed ({} -> {})",
                bundle.dims,
                self.embedder.dims()
            ));
        }
        if !self.embedder.is_zero_mode() && bundle.embedding_model != self.embedder.model_name() {
            return Some(format!(
                "embedding model changed ({} -> {})",
                bundle.embedding_model,
                self.embedder.model_name()
            ));
        }
        None
    }

    /// Embed `chunks` afresh (cache first) into a new index.
    fn rebuild_index(&self, chunks: &[String]) -> FlatIndex {
        let mut index = FlatIndex::new(self.embedder.dims(), self.embedder.metric());
        let vectors = if self.is_ultra_safe_mode() {
            self.embedder.cached_or_zero(chunks)
        } else {
            self.embedder.embed(chunks)
        };
        if let Err(e) = index.add(&vectors) {
            error!(error = %e, "rebuilding index failed");
            return FlatIndex::new(self.embedder.dims(), self.embedder.metric());
        }
        index
    }

    fn reset_for_reindex(&self, inner: &mut KbInner, reason: &str) {
        match inner.layout.create_backup(self.config.knowledge_base.max_backups) {
            Ok(Some(dir)) => info!(backup = %dir.display(), "backed up incompatible index"),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "backup before re-index failed"),
        }
        if let Err(e) = inner.layout.remove_index_files() {
            warn!(error = %e, "could not remove incompatible index files");
        }
        inner.clear_memory();
        inner.index = FlatIndex::new(self.embedder.dims(), self.embedder.metric());
        inner.state = KbState::NeedsReindex;
        warn!(%reason, "knowledge base cleared; re-add files to rebuild it");
    }

    // ============ Persist ============

    /// Write the index, metadata and registry, plus the embeddings cache when
    /// it changed or the knowledge base moved. Walks the directory fallback
    /// list on failure.
    fn persist(&self, inner: &mut KbInner) -> Result<()> {
        let index_bytes = inner.index.to_bytes();
        let bundle = MetadataBundle {
            format_version: METADATA_FORMAT_VERSION,
            chunks: inner.chunks.clone(),
            metadatas: inner.metadatas.clone(),
            dims: self.embedder.dims(),
            embedding_model: self.embedder.model_name().to_string(),
            embedding_provider: self.embedder.provider_name().to_string(),
            metric: self.embedder.metric(),
        };
        let metadata_bytes = bundle.to_json_bytes()?;
        let registry_bytes = inner.registry.to_json_bytes()?;
        let mut cache_bytes = self.cache_snapshot(false)?;

        loop {
            let written = {
                let mut files: Vec<(&str, &[u8])> = vec![
                    (INDEX_FILE, index_bytes.as_slice()),
                    (METADATA_FILE, metadata_bytes.as_slice()),
                    (REGISTRY_FILE, registry_bytes.as_slice()),
                ];
                if let Some(bytes) = &cache_bytes {
                    files.push((CACHE_FILE, bytes.as_slice()));
                }
                inner.layout.write_files(&files)
            };
            match written {
                Ok(()) => break,
                Err(e) => {
                    let current = inner.layout.root().to_path_buf();
                    warn!(dir = %current.display(), error = %e, "persist failed, trying fallback directory");
                    let Some(next) = inner.fallback.next_writable(&current) else {
                        if cache_bytes.is_some() {
                            self.lock_cache().mark_dirty();
                        }
                        return Err(anyhow!("no writable knowledge base directory (last error: {})", e));
                    };
                    info!(dir = %next.display(), "knowledge base moved to fallback directory");
                    inner.layout = KbLayout::new(next);
                    if cache_bytes.is_none() {
                        cache_bytes = self.cache_snapshot(true)?;
                    }
                }
            }
        }
        inner.state = KbState::Persisted;
        debug!(
            path = %inner.layout.root().display(),
            chunks = inner.chunks.len(),
            cache_written = cache_bytes.is_some(),
            "persisted knowledge base"
        );
        Ok(())
    }

    /// Serialized embeddings cache, or `None` when it is clean and `force`
    /// is off. Taking a snapshot marks the cache clean.
    fn cache_snapshot(&self, force: bool) -> Result<Option<Vec<u8>>> {
        let mut cache = self.lock_cache();
        if !force && !cache.is_dirty() {
            return Ok(None);
        }
        let bytes = cache.to_json_bytes()?;
        cache.mark_clean();
        Ok(Some(bytes))
    }

    fn save_registry(&self, inner: &mut KbInner, report: &RepairReport) {
        if report.is_clean() {
            return;
        }
        let result = inner
            .registry
            .to_json_bytes()
            .and_then(|bytes| Ok(inner.layout.write_files(&[(REGISTRY_FILE, &bytes)])?));
        if let Err(e) = result {
            warn!(error = %e, "could not write repaired registry");
        }
    }

    // ============ Ingestion ============

    /// Ingest one file. Never fails past its boundary: problems come back as
    /// [`IngestStatus::Failed`].
    pub fn add_file(&self, path: &Path, progress: Option<&dyn ProgressReporter>) -> IngestOutcome {
        let report = |msg: &str, pct: u8| {
            if let Some(p) = progress {
                p.report(msg, pct);
            }
        };
        let file_name = match path.file_name() {
            Some(n) => n.to_string_lossy().to_string(),
            None => return IngestOutcome::failed(path, "", "path has no file name"),
        };
        let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());

        report(&format!("Checking {}", file_name), 0);
        let max_bytes = self.config.ingestion.max_file_bytes;
        match std::fs::metadata(&path) {
            Ok(m) if m.len() > max_bytes => {
                return IngestOutcome::failed(
                    &path,
                    &file_name,
                    format!("file is {} bytes, limit is {}", m.len(), max_bytes),
                )
            }
            Ok(_) => {}
            Err(e) => return IngestOutcome::failed(&path, &file_name, e.to_string()),
        }
        let fingerprint = match FileFingerprint::compute(&path) {
            Ok(f) => f,
            Err(e) => return IngestOutcome::failed(&path, &file_name, e.to_string()),
        };

        let (generation, lineage) = {
            let inner = self.read();
            if inner.registry.matches_hash(&file_name, &fingerprint.hash)
                && inner.metadatas.iter().any(|m| m.file_name == file_name)
            {
                debug!(file = %file_name, "unchanged, skipping");
                report(&format!("{} is unchanged", file_name), 100);
                return IngestOutcome {
                    file_name,
                    path,
                    status: IngestStatus::Unchanged,
                };
            }
            let lineage = version_lineage(inner.registry.get(&file_name), &fingerprint.hash);
            (inner.generation, lineage)
        };

        report(&format!("Extracting {}", file_name), 10);
        let prepared = match self.prepare(&path, &file_name, fingerprint, lineage, &report) {
            Ok(p) => p,
            Err(e) => return IngestOutcome::failed(&path, &file_name, format!("{:#}", e)),
        };

        report(&format!("Indexing {}", file_name), 90);
        let outcome = self.commit(prepared, generation);
        if outcome.is_success() {
            report(&format!("Added {}", outcome.file_name), 100);
        }
        outcome
    }

    /// Extract, chunk, annotate and embed, without touching shared state.
    fn prepare(
        &self,
        path: &Path,
        file_name: &str,
        fingerprint: FileFingerprint,
        lineage: Vec<String>,
        report: &dyn Fn(&str, u8),
    ) -> Result<PreparedFile> {
        let chunker = Chunker::from_config(&self.config.chunking);
        let (source_type, extracted) =
            extract_and_chunk(path, self.config.ingestion.max_file_bytes, &chunker)
                .with_context(|| format!("extracting {}", path.display()))?;
        debug!(file = %file_name, chunks = extracted.len(), source = source_type.as_str(), "extracted");

        report(&format!("Analyzing {} chunks of {}", extracted.len(), file_name), 30);
        let source_path = path.display().to_string();
        let mut chunks = Vec::with_capacity(extracted.len());
        let mut metadatas = Vec::with_capacity(extracted.len());
        for (i, chunk) in extracted.into_iter().enumerate() {
            let meta = self.annotate(&chunk, i, file_name, &source_path, &fingerprint.hash, source_type, &lineage);
            chunks.push(chunk.text);
            metadatas.push(meta);
        }

        report(&format!("Embedding {} chunks of {}", chunks.len(), file_name), 50);
        let vectors = if self.is_ultra_safe_mode() {
            vec![self.embedder.zero_vector(); chunks.len()]
        } else {
            self.embedder.embed(&chunks)
        };

        Ok(PreparedFile {
            file_name: file_name.to_string(),
            path: path.to_path_buf(),
            fingerprint,
            chunks,
            metadatas,
            vectors,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn annotate(
        &self,
        chunk: &ExtractedChunk,
        chunk_index: usize,
        file_name: &str,
        source_path: &str,
        source_hash: &str,
        source_type: SourceType,
        lineage: &[String],
    ) -> ChunkMetadata {
        ChunkMetadata {
            chunk_id: uuid::Uuid::new_v4().to_string(),
            file_name: file_name.to_string(),
            source_path: source_path.to_string(),
            source_hash: source_hash.to_string(),
            page: chunk.page,
            chunk_index,
            is_table: chunk.is_table,
            created_at: chrono::Utc::now(),
            source_type,
            sheet_name: chunk.sheet_name.clone(),
            section_title: chunk.section_title.clone(),
            table_data: chunk.table_data.clone(),
            row_index: chunk.row_index,
            keywords: self
                .preprocessor
                .extract_keywords(&chunk.text, self.config.preprocess.max_keywords),
            language: self.preprocessor.detect_language(&chunk.text),
            importance_score: importance_score(chunk),
            embedding_model: self.embedder.model_name().to_string(),
            version_lineage: lineage.to_vec(),
        }
    }

    /// Splice a prepared file into the knowledge base under the write lock.
    ///
    /// Prepared chunks do not depend on the directory, so a move to a
    /// fallback directory since `prepare` is fine. A switch to another
    /// knowledge base is not: the version lineage came from the old registry.
    fn commit(&self, prepared: PreparedFile, generation: u64) -> IngestOutcome {
        let mut inner = self.write();
        if inner.generation != generation {
            return IngestOutcome::failed(
                &prepared.path,
                &prepared.file_name,
                "knowledge base was switched to another directory during ingestion",
            );
        }
        if let Some(bad) = prepared.vectors.iter().find(|v| v.len() != inner.index.dims()) {
            return IngestOutcome::failed(
                &prepared.path,
                &prepared.file_name,
                format!("vector has {} dims, index expects {}", bad.len(), inner.index.dims()),
            );
        }

        let replaced = inner.drop_file_chunks(&prepared.file_name);
        if let Err(e) = inner.index.add(&prepared.vectors) {
            // dimensions were checked above
            error!(error = %e, "index append failed");
            return IngestOutcome::failed(&prepared.path, &prepared.file_name, e.to_string());
        }
        let chunk_count = prepared.chunks.len();
        inner.chunks.extend(prepared.chunks);
        inner.metadatas.extend(prepared.metadatas);
        inner.registry.register(Registration {
            file_name: &prepared.file_name,
            path: &prepared.path,
            fingerprint: &prepared.fingerprint,
            chunk_count,
            embedding_model: self.embedder.model_name(),
            embedding_provider: self.embedder.provider_name(),
        });
        inner.state = KbState::Mutated;
        debug_assert_eq!(inner.chunks.len(), inner.metadatas.len());
        debug_assert_eq!(inner.index.len(), inner.chunks.len());

        if let Err(e) = self.persist(&mut inner) {
            error!(error = %e, "knowledge base kept in memory only");
        }
        info!(file = %prepared.file_name, chunks = chunk_count, replaced, "indexed file");
        IngestOutcome {
            file_name: prepared.file_name,
            path: prepared.path,
            status: IngestStatus::Indexed {
                chunks: chunk_count,
                replaced,
            },
        }
    }

    /// Ingest many files on a bounded pool of blocking workers
    /// (`ingestion.max_workers`). Outcomes come back in input order. Files not
    /// yet started when `cancel` fires are reported as cancelled.
    pub async fn batch_add_files(
        self: &Arc<Self>,
        paths: Vec<PathBuf>,
        progress: Option<Arc<dyn ProgressReporter>>,
        cancel: &CancelFlag,
    ) -> Vec<IngestOutcome> {
        let total = paths.len();
        let semaphore = Arc::new(tokio::sync::Semaphore::new(
            self.config.ingestion.max_workers.max(1),
        ));
        let mut set = tokio::task::JoinSet::new();
        for (i, path) in paths.iter().cloned().enumerate() {
            let handler = Arc::clone(self);
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                if cancel.is_cancelled() {
                    return (i, cancelled(&path));
                }
                let outcome = tokio::task::spawn_blocking(move || handler.add_file(&path, None))
                    .await
                    .unwrap_or_else(|e| IngestOutcome {
                        file_name: String::new(),
                        path: PathBuf::new(),
                        status: IngestStatus::Failed {
                            reason: format!("worker panicked: {}", e),
                        },
                    });
                (i, outcome)
            });
        }

        let mut results: Vec<Option<IngestOutcome>> = vec![None; total];
        let mut done = 0;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((i, outcome)) => {
                    done += 1;
                    if let Some(p) = &progress {
                        p.report(
                            &format!("{}/{} files ({})", done, total, outcome.file_name),
                            percent(done, total),
                        );
                    }
                    results[i] = Some(outcome);
                }
                Err(e) => error!(error = %e, "batch worker failed"),
            }
        }

        let outcomes: Vec<IngestOutcome> = results
            .into_iter()
            .zip(paths)
            .map(|(r, path)| {
                r.unwrap_or_else(|| {
                    let name = file_name_of(&path);
                    IngestOutcome::failed(&path, &name, "worker did not finish")
                })
            })
            .collect();
        let ok = outcomes.iter().filter(|o| o.is_success()).count();
        info!(total, ok, failed = total - ok, "batch ingestion finished");
        outcomes
    }

    /// Scan `dir` with the ingestion globs and batch-ingest every match.
    pub async fn add_directory(
        self: &Arc<Self>,
        dir: &Path,
        progress: Option<Arc<dyn ProgressReporter>>,
        cancel: &CancelFlag,
    ) -> Result<Vec<IngestOutcome>> {
        let files = crate::scan::scan_directory(dir, &self.config.ingestion)?;
        info!(dir = %dir.display(), files = files.len(), "scanned directory");
        Ok(self.batch_add_files(files, progress, cancel).await)
    }

    // ============ Removal ============

    /// Drop a file's chunks and registry entry. False when the file is not
    /// indexed or the change could not be persisted.
    pub fn remove_file(&self, file_name: &str) -> bool {
        let mut inner = self.write();
        let registered = inner.registry.contains(file_name);
        let dropped = inner.drop_file_chunks(file_name);
        if !registered && dropped == 0 {
            debug!(file = file_name, "remove: not indexed");
            return false;
        }
        inner.registry.unregister(file_name);
        inner.state = KbState::Mutated;
        match self.persist(&mut inner) {
            Ok(()) => {
                info!(file = file_name, chunks = dropped, "removed file");
                true
            }
            Err(e) => {
                error!(error = %e, file = file_name, "removed in memory but not persisted");
                false
            }
        }
    }

    /// Remove every chunk and registry entry. The embeddings cache is kept.
    pub fn clear_knowledge_base(&self) -> bool {
        let mut inner = self.write();
        inner.clear_memory();
        match inner.layout.remove_index_files() {
            Ok(()) => {
                inner.state = KbState::Empty;
                info!(path = %inner.layout.root().display(), "cleared knowledge base");
                true
            }
            Err(e) => {
                error!(error = %e, "could not remove knowledge base files");
                inner.state = KbState::Mutated;
                false
            }
        }
    }

    // ============ Queries ============

    pub fn get_indexed_files(&self) -> Vec<String> {
        self.read().registry.names()
    }

    pub fn get_indexed_files_detailed(&self) -> Vec<IndexedFile> {
        self.read()
            .registry
            .iter()
            .map(|(name, entry)| IndexedFile {
                file_name: name.clone(),
                entry: entry.clone(),
            })
            .collect()
    }

    /// Retrieval with the configured defaults.
    pub fn search(&self, query: &str) -> Vec<RetrievedChunk> {
        self.get_relevant_chunks(query, &SearchOptions::from_config(&self.config.retrieval))
    }

    /// Ranked chunks for `query`, best first, at most `opts.n_results` of
    /// them. Safe mode tightens `opts`. Errors yield an empty list.
    pub fn get_relevant_chunks(&self, query: &str, opts: &SearchOptions) -> Vec<RetrievedChunk> {
        let opts = if self.is_safe_mode() {
            opts.clone().safe()
        } else {
            opts.clone()
        };
        let encoder = if opts.cross_encoder_reranking {
            self.cross_encoder()
        } else {
            None
        };

        let inner = self.read();
        let corpus = Corpus {
            index: &inner.index,
            chunks: &inner.chunks,
            metadatas: &inner.metadatas,
        };
        match search::retrieve(
            &corpus,
            query,
            &opts,
            |texts| self.embedder.embed(texts),
            encoder.as_deref(),
        ) {
            Ok(candidates) => search::into_results(&corpus, &candidates),
            Err(e) => {
                warn!(error = %e, "retrieval failed");
                Vec::new()
            }
        }
    }

    fn cross_encoder(&self) -> Option<Arc<dyn CrossEncoder>> {
        self.cross_encoder
            .get_or_init(|| {
                let model_dir = self.read().layout.model_cache_dir();
                match create_cross_encoder(
                    self.config.retrieval.cross_encoder_model.as_deref(),
                    &model_dir,
                ) {
                    Ok(enc) => {
                        info!(model = enc.model_name(), "cross-encoder ready");
                        Some(Arc::from(enc))
                    }
                    Err(e) => {
                        warn!(error = %e, "cross-encoder unavailable, reranking stage disabled");
                        None
                    }
                }
            })
            .clone()
    }

    // ============ Maintenance ============

    /// Point the handler at another knowledge-base directory and load it.
    /// Pending in-memory changes to the current one are written first.
    pub fn set_knowledge_base_path(&self, path: &Path) -> Result<()> {
        let mut inner = self.write();
        if inner.state == KbState::Mutated {
            self.persist(&mut inner)
                .context("saving current knowledge base before switching")?;
        }
        storage::ensure_writable(path)
            .with_context(|| format!("knowledge base directory not writable: {}", path.display()))?;
        inner.layout = KbLayout::new(path);
        inner.fallback = FallbackDirs::new(path, self.config.knowledge_base.fallback_dir.as_deref());
        inner.state = KbState::Uninitialized;
        inner.generation += 1;
        *self.lock_cache() = EmbeddingsCache::load(
            &inner.layout.cache_path(),
            self.config.knowledge_base.cache_max_entries,
        );
        self.load(&mut inner);
        info!(path = %path.display(), state = inner.state.as_str(), "switched knowledge base");
        Ok(())
    }

    /// Rebuild the registry from chunk metadata and persist it if it changed.
    pub fn repair_registry(&self) -> RepairReport {
        let mut inner = self.write();
        let provider = self.embedder.provider_name().to_string();
        let metadatas = std::mem::take(&mut inner.metadatas);
        let report = inner.registry.repair_from_metadata(&metadatas, &provider);
        inner.metadatas = metadatas;
        self.save_registry(&mut inner, &report);
        report
    }

    pub fn get_stats(&self) -> KbStats {
        let inner = self.read();
        let t = stats::tally(&inner.metadatas);
        let cache_entries = self.lock_cache().len();
        KbStats {
            path: inner.layout.root().to_path_buf(),
            state: inner.state,
            total_files: inner.registry.len(),
            total_chunks: inner.chunks.len(),
            table_chunks: t.table_chunks,
            by_language: t.by_language,
            by_source_type: t.by_source_type,
            cache_entries,
            dims: self.embedder.dims(),
            embedding_model: self.embedder.model_name().to_string(),
            embedding_provider: self.embedder.provider_name().to_string(),
            metric: self.embedder.metric(),
            zero_vector_mode: self.embedder.is_zero_mode(),
            safe_mode: self.is_safe_mode(),
            ultra_safe_mode: self.is_ultra_safe_mode(),
            disk_bytes: storage::dir_size(inner.layout.root()),
        }
    }
}

/// Configured directory if writable, else the first writable fallback.
fn pick_root(config: &Config) -> PathBuf {
    let primary = &config.knowledge_base.path;
    FallbackDirs::new(primary, config.knowledge_base.fallback_dir.as_deref())
        .first_writable()
        .unwrap_or_else(|| {
            warn!(dir = %primary.display(), "no writable knowledge base directory, continuing read-only");
            primary.clone()
        })
}

fn load_cache(layout: &KbLayout, config: &Config) -> Arc<Mutex<EmbeddingsCache>> {
    Arc::new(Mutex::new(EmbeddingsCache::load(
        &layout.cache_path(),
        config.knowledge_base.cache_max_entries,
    )))
}

/// Prior hashes for a re-ingested file, newest first.
fn version_lineage(previous: Option<&FileRegistryEntry>, new_hash: &str) -> Vec<String> {
    let Some(prev) = previous else {
        return Vec::new();
    };
    let mut lineage = Vec::with_capacity(MAX_VERSION_HISTORY);
    if prev.hash != new_hash {
        lineage.push(prev.hash.clone());
    }
    lineage.extend(
        prev.previous_hashes
            .iter()
            .filter(|h| h.as_str() != new_hash && **h != prev.hash)
            .cloned(),
    );
    lineage.truncate(MAX_VERSION_HISTORY);
    lineage
}

/// Base 1.0; tables +0.2, titled sections +0.1, fragments under ten words -0.3.
pub fn importance_score(chunk: &ExtractedChunk) -> f32 {
    let mut score = 1.0f32;
    if chunk.is_table {
        score += 0.2;
    }
    if chunk.section_title.is_some() {
        score += 0.1;
    }
    if word_count(&chunk.text) < 10 {
        score -= 0.3;
    }
    score.max(0.0)
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn cancelled(path: &Path) -> IngestOutcome {
    IngestOutcome {
        file_name: file_name_of(path),
        path: path.to_path_buf(),
        status: IngestStatus::Cancelled,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashingProvider;

    fn chunk(text: &str) -> ExtractedChunk {
        ExtractedChunk {
            text: text.to_string(),
            page: None,
            is_table: false,
            sheet_name: None,
            section_title: None,
            table_data: None,
            row_index: None,
        }
    }

    fn handler(dir: &Path) -> RagHandler {
        let mut config = Config::default();
        config.knowledge_base.path = dir.to_path_buf();
        config.embedding.provider = crate::config::ProviderKind::Hashing;
        RagHandler::with_provider(config, Box::new(HashingProvider::new(64))).unwrap()
    }

    #[test]
    fn importance_heuristic() {
        assert!((importance_score(&chunk("too short")) - 0.7).abs() < 1e-6);
        let mut table = chunk("one two three four five six seven eight nine ten eleven");
        table.is_table = true;
        table.section_title = Some("Results".into());
        assert!((importance_score(&table) - 1.3).abs() < 1e-6);
    }

    #[test]
    fn lineage_is_newest_first_and_bounded() {
        let prev = FileRegistryEntry {
            hash: "h5".into(),
            path: String::new(),
            chunk_count: 1,
            indexed_at: chrono::Utc::now(),
            modified_at: None,
            size: 0,
            embedding_model: String::new(),
            embedding_provider: String::new(),
            previous_hashes: vec!["h4".into(), "h3".into(), "h2".into(), "h1".into(), "h0".into()],
            version_count: 6,
        };
        assert_eq!(version_lineage(Some(&prev), "h6"), vec!["h5", "h4", "h3", "h2", "h1"]);
        assert!(version_lineage(None, "h").is_empty());
    }

    #[test]
    fn cancel_flag_is_shared_between_clones() {
        let flag = CancelFlag::new();
        let other = flag.clone();
        assert!(!other.is_cancelled());
        flag.cancel();
        assert!(other.is_cancelled());
    }

    #[test]
    fn fresh_directory_opens_empty() {
        let dir = tempfile::tempdir().unwrap();
        let h = handler(dir.path());
        assert_eq!(h.state(), KbState::Empty);
        assert!(h.get_indexed_files().is_empty());
        assert!(h.search("anything").is_empty());
    }

    #[test]
    fn unsupported_file_fails_without_touching_state() {
        let dir = tempfile::tempdir().unwrap();
        let h = handler(&dir.path().join("kb"));
        let file = dir.path().join("image.png");
        std::fs::write(&file, b"\x89PNG").unwrap();
        let outcome = h.add_file(&file, None);
        assert!(matches!(outcome.status, IngestStatus::Failed { .. }));
        assert_eq!(h.chunk_count(), 0);
        assert_eq!(h.state(), KbState::Empty);
    }

    #[test]
    fn oversized_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.knowledge_base.path = dir.path().join("kb");
        config.ingestion.max_file_bytes = 8;
        let h = RagHandler::with_provider(config, Box::new(HashingProvider::new(16))).unwrap();
        let file = dir.path().join("big.txt");
        std::fs::write(&file, "this is longer than eight bytes").unwrap();
        assert!(!h.add_file(&file, None).is_success());
    }

    #[test]
    fn safe_mode_toggles() {
        let dir = tempfile::tempdir().unwrap();
        let h = handler(dir.path());
        assert!(!h.is_safe_mode());
        h.set_safe_mode(true);
        h.set_ultra_safe_mode(true);
        assert!(h.is_safe_mode() && h.is_ultra_safe_mode());
        let stats = h.get_stats();
        assert!(stats.safe_mode && stats.ultra_safe_mode);
    }

    #[test]
    fn ultra_safe_mode_stores_zero_vectors() {
        let dir = tempfile::tempdir().unwrap();
        let h = handler(&dir.path().join("kb"));
        h.set_ultra_safe_mode(true);
        let file = dir.path().join("a.txt");
        std::fs::write(&file, "Zero vectors still index the text of this file.").unwrap();
        assert!(h.add_file(&file, None).is_success());
        let inner = h.read();
        assert_eq!(inner.index.len(), 1);
        assert!(inner.index.vector(0).unwrap().iter().all(|x| *x == 0.0));
    }

    fn prepare_file(h: &RagHandler, file: &Path) -> PreparedFile {
        let name = file_name_of(file);
        let fingerprint = FileFingerprint::compute(file).unwrap();
        h.prepare(file, &name, fingerprint, Vec::new(), &|_, _| {}).unwrap()
    }

    #[test]
    fn commit_follows_fallback_move() {
        let dir = tempfile::tempdir().unwrap();
        let h = handler(&dir.path().join("kb"));
        let file = dir.path().join("a.txt");
        std::fs::write(&file, "Rolling restarts keep the service available.").unwrap();

        let generation = h.read().generation;
        let prepared = prepare_file(&h, &file);
        let moved = dir.path().join("fallback");
        h.write().layout = KbLayout::new(&moved);

        let outcome = h.commit(prepared, generation);
        assert!(outcome.is_success(), "{:?}", outcome);
        assert_eq!(h.knowledge_base_path(), moved);
        assert!(moved.join(INDEX_FILE).exists());
        assert!(moved.join(CACHE_FILE).exists());
    }

    #[test]
    fn commit_refuses_after_switching_knowledge_base() {
        let dir = tempfile::tempdir().unwrap();
        let h = handler(&dir.path().join("kb"));
        let file = dir.path().join("a.txt");
        std::fs::write(&file, "Rolling restarts keep the service available.").unwrap();

        let generation = h.read().generation;
        let prepared = prepare_file(&h, &file);
        h.set_knowledge_base_path(&dir.path().join("other")).unwrap();

        let outcome = h.commit(prepared, generation);
        assert!(matches!(outcome.status, IngestStatus::Failed { .. }));
        assert_eq!(h.chunk_count(), 0);
    }

    #[test]
    fn clean_cache_is_not_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let kb = dir.path().join("kb");
        let h = handler(&kb);
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        std::fs::write(&a, "Alpha file about deployment pipelines.").unwrap();
        std::fs::write(&b, "Beta file about incident response.").unwrap();

        assert!(h.add_file(&a, None).is_success());
        let cache_file = kb.join(CACHE_FILE);
        assert!(cache_file.exists());
        std::fs::remove_file(&cache_file).unwrap();

        assert!(h.remove_file("a.txt"));
        assert!(!cache_file.exists(), "no new embeddings, cache left alone");
        assert!(kb.join(METADATA_FILE).exists());

        assert!(h.add_file(&b, None).is_success());
        assert!(cache_file.exists());
    }
}
