//! On-disk layout of a knowledge-base directory.
//!
//! ```text
//! <kb>/
//!   vectors.index          FlatIndex blob
//!   metadata.json          MetadataBundle (chunk texts + metadata)
//!   file_registry.json     FileRegistry
//!   embeddings_cache.json  EmbeddingsCache
//!   model_cache/           local model weights
//!   backup/<timestamp>/    snapshots taken before a destructive re-index
//! ```
//!
//! Every file is replaced whole via a temp file and `rename`. Writes that fail
//! move the knowledge base along the [`FallbackDirs`] list.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::index::Metric;
use crate::models::ChunkMetadata;

pub const INDEX_FILE: &str = "vectors.index";
pub const METADATA_FILE: &str = "metadata.json";
pub const REGISTRY_FILE: &str = "file_registry.json";
pub const CACHE_FILE: &str = "embeddings_cache.json";
pub const MODEL_CACHE_DIR: &str = "model_cache";
pub const BACKUP_DIR: &str = "backup";

pub const METADATA_FORMAT_VERSION: u32 = 1;

/// Chunk texts and metadata plus the embedding identity they were built with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataBundle {
    pub format_version: u32,
    pub chunks: Vec<String>,
    pub metadatas: Vec<ChunkMetadata>,
    pub dims: usize,
    pub embedding_model: String,
    pub embedding_provider: String,
    pub metric: Metric,
}

impl MetadataBundle {
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("Failed to read metadata: {}", path.display()))?;
        let bundle: Self = serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse metadata: {}", path.display()))?;
        if bundle.format_version != METADATA_FORMAT_VERSION {
            anyhow::bail!(
                "unsupported metadata format version {}",
                bundle.format_version
            );
        }
        if bundle.chunks.len() != bundle.metadatas.len() {
            anyhow::bail!(
                "metadata holds {} chunks but {} records",
                bundle.chunks.len(),
                bundle.metadatas.len()
            );
        }
        Ok(bundle)
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Paths inside one knowledge-base directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KbLayout {
    root: PathBuf,
}

impl KbLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn index_path(&self) -> PathBuf {
        self.root.join(INDEX_FILE)
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.root.join(METADATA_FILE)
    }

    pub fn registry_path(&self) -> PathBuf {
        self.root.join(REGISTRY_FILE)
    }

    pub fn cache_path(&self) -> PathBuf {
        self.root.join(CACHE_FILE)
    }

    pub fn model_cache_dir(&self) -> PathBuf {
        self.root.join(MODEL_CACHE_DIR)
    }

    pub fn backup_root(&self) -> PathBuf {
        self.root.join(BACKUP_DIR)
    }

    /// Write each `(file name, bytes)` pair atomically under the root.
    pub fn write_files(&self, files: &[(&str, &[u8])]) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        for (name, bytes) in files {
            write_atomic(&self.root.join(name), bytes)?;
        }
        Ok(())
    }

    /// Remove the persisted index, metadata and registry. The embeddings
    /// cache and model weights stay.
    pub fn remove_index_files(&self) -> std::io::Result<()> {
        for path in [self.index_path(), self.metadata_path(), self.registry_path()] {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Copy the index, metadata and registry into `backup/<UTC timestamp>/`,
    /// then prune to the newest `max_backups`. Returns `None` when there was
    /// nothing to back up.
    pub fn create_backup(&self, max_backups: usize) -> Result<Option<PathBuf>> {
        let sources: Vec<PathBuf> = [self.index_path(), self.metadata_path(), self.registry_path()]
            .into_iter()
            .filter(|p| p.exists())
            .collect();
        if sources.is_empty() {
            return Ok(None);
        }
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ").to_string();
        let dest = self.backup_root().join(stamp);
        std::fs::create_dir_all(&dest)
            .with_context(|| format!("Failed to create backup dir: {}", dest.display()))?;
        for src in &sources {
            if let Some(name) = src.file_name() {
                std::fs::copy(src, dest.join(name))
                    .with_context(|| format!("Failed to back up {}", src.display()))?;
            }
        }
        info!(path = %dest.display(), files = sources.len(), "created knowledge base backup");
        let pruned = prune_backups(&self.backup_root(), max_backups)?;
        if pruned > 0 {
            debug!(pruned, "pruned old backups");
        }
        Ok(Some(dest))
    }
}

/// Write to `<path>.tmp`, sync, then rename over `path`.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path).inspect_err(|_| {
        let _ = std::fs::remove_file(&tmp);
    })
}

/// Delete all but the newest `keep` backup directories. Timestamped names sort
/// chronologically.
pub fn prune_backups(backup_root: &Path, keep: usize) -> std::io::Result<usize> {
    let mut dirs: Vec<PathBuf> = match std::fs::read_dir(backup_root) {
        Ok(rd) => rd
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };
    dirs.sort();
    let excess = dirs.len().saturating_sub(keep);
    for dir in dirs.iter().take(excess) {
        std::fs::remove_dir_all(dir)?;
    }
    Ok(excess)
}

/// Create `dir` if needed and prove it accepts writes.
pub fn ensure_writable(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let marker = dir.join(".kb-write-test");
    std::fs::write(&marker, b"ok")?;
    std::fs::remove_file(&marker)
}

/// Total size in bytes of all files under `dir`.
pub fn dir_size(dir: &Path) -> u64 {
    walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

/// Ordered knowledge-base directory candidates: configured directory, the
/// configured fallback, then `~/.kb-rag/<directory name>`.
#[derive(Debug, Clone, PartialEq)]
pub struct FallbackDirs {
    pub candidates: Vec<PathBuf>,
}

impl FallbackDirs {
    pub fn new(primary: &Path, fallback: Option<&Path>) -> Self {
        let mut candidates = vec![primary.to_path_buf()];
        if let Some(f) = fallback {
            if f != primary {
                candidates.push(f.to_path_buf());
            }
        }
        if let Some(home) = dirs::home_dir() {
            let name = primary
                .file_name()
                .map(|n| n.to_os_string())
                .unwrap_or_else(|| "knowledge_base".into());
            let home_dir = home.join(".kb-rag").join(name);
            if !candidates.contains(&home_dir) {
                candidates.push(home_dir);
            }
        }
        Self { candidates }
    }

    /// First writable candidate strictly after `current` in the list (or the
    /// first writable one overall when `current` is not listed).
    pub fn next_writable(&self, current: &Path) -> Option<PathBuf> {
        let start = self
            .candidates
            .iter()
            .position(|c| c == current)
            .map_or(0, |i| i + 1);
        self.candidates[start..].iter().find_map(|dir| match ensure_writable(dir) {
            Ok(()) => Some(dir.clone()),
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "knowledge base directory not writable");
                None
            }
        })
    }

    pub fn first_writable(&self) -> Option<PathBuf> {
        self.candidates.iter().find_map(|dir| match ensure_writable(dir) {
            Ok(()) => Some(dir.clone()),
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "knowledge base directory not writable");
                None
            }
        })
    }
}
