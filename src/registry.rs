//! File registry: which files are indexed, at which content hash.
//!
//! The registry is a derived index over the chunk metadata, persisted as
//! `file_registry.json` (a JSON object keyed by file name). It answers the
//! "has this file changed since it was indexed?" question without touching
//! the vector index, and keeps a bounded history of prior content hashes.
//!
//! Because the three persisted files are replaced independently, a crash can
//! leave the registry out of step with the metadata. [`FileRegistry::repair_from_metadata`]
//! rebuilds it from the metadata, which is the source of truth.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use tracing::{info, warn};

use crate::models::ChunkMetadata;

/// Prior hashes kept per file, newest first.
pub const MAX_VERSION_HISTORY: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRegistryEntry {
    pub hash: String,
    pub path: String,
    pub chunk_count: usize,
    pub indexed_at: DateTime<Utc>,
    #[serde(default)]
    pub modified_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub size: u64,
    pub embedding_model: String,
    #[serde(default)]
    pub embedding_provider: String,
    #[serde(default)]
    pub previous_hashes: Vec<String>,
    #[serde(default)]
    pub version_count: u32,
}

/// Content hash plus filesystem facts about a source file.
#[derive(Debug, Clone, PartialEq)]
pub struct FileFingerprint {
    pub hash: String,
    pub size: u64,
    pub modified_at: Option<DateTime<Utc>>,
}

impl FileFingerprint {
    pub fn compute(path: &Path) -> std::io::Result<Self> {
        let meta = std::fs::metadata(path)?;
        Ok(Self {
            hash: compute_file_hash(path)?,
            size: meta.len(),
            modified_at: meta.modified().ok().map(DateTime::<Utc>::from),
        })
    }
}

/// Streaming SHA-256 of a file's bytes, as lowercase hex.
pub fn compute_file_hash(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Everything needed to upsert a registry entry.
#[derive(Debug, Clone)]
pub struct Registration<'a> {
    pub file_name: &'a str,
    pub path: &'a Path,
    pub fingerprint: &'a FileFingerprint,
    pub chunk_count: usize,
    pub embedding_model: &'a str,
    pub embedding_provider: &'a str,
}

/// Outcome of [`FileRegistry::repair_from_metadata`].
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RepairReport {
    /// Files present in metadata but missing from the registry.
    pub added: Vec<String>,
    /// Registry entries with no chunks in metadata.
    pub removed: Vec<String>,
    /// Entries whose chunk count or hash disagreed with metadata.
    pub corrected: Vec<String>,
}

impl RepairReport {
    pub fn is_clean(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.corrected.is_empty()
    }
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileRegistry {
    entries: BTreeMap<String, FileRegistryEntry>,
}

impl FileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from `path`. A missing file is an empty registry; an unparsable one
    /// is logged and treated as empty so the load-time repair can rebuild it.
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            return Self::new();
        }
        match read_registry(path) {
            Ok(r) => r,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "file registry unreadable, rebuilding from metadata");
                Self::new()
            }
        }
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, file_name: &str) -> Option<&FileRegistryEntry> {
        self.entries.get(file_name)
    }

    pub fn contains(&self, file_name: &str) -> bool {
        self.entries.contains_key(file_name)
    }

    /// Registered file names in sorted order.
    pub fn names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FileRegistryEntry)> {
        self.entries.iter()
    }

    /// True when `file_name` is unregistered or its stored hash differs from
    /// the current content of `path`.
    pub fn is_changed(&self, file_name: &str, path: &Path) -> std::io::Result<bool> {
        let hash = compute_file_hash(path)?;
        Ok(!self.matches_hash(file_name, &hash))
    }

    pub fn matches_hash(&self, file_name: &str, hash: &str) -> bool {
        self.entries.get(file_name).is_some_and(|e| e.hash == hash)
    }

    /// Insert or update an entry. A changed hash pushes the old one onto the
    /// bounded history and bumps the version count.
    pub fn register(&mut self, reg: Registration<'_>) -> &FileRegistryEntry {
        let (previous_hashes, version_count) = match self.entries.get(reg.file_name) {
            Some(old) if old.hash != reg.fingerprint.hash => {
                let mut history = Vec::with_capacity(MAX_VERSION_HISTORY);
                history.push(old.hash.clone());
                history.extend(
                    old.previous_hashes
                        .iter()
                        .filter(|h| **h != old.hash && **h != reg.fingerprint.hash)
                        .cloned(),
                );
                history.truncate(MAX_VERSION_HISTORY);
                (history, old.version_count.saturating_add(1))
            }
            Some(old) => (old.previous_hashes.clone(), old.version_count.max(1)),
            None => (Vec::new(), 1),
        };
        let entry = FileRegistryEntry {
            hash: reg.fingerprint.hash.clone(),
            path: reg.path.display().to_string(),
            chunk_count: reg.chunk_count,
            indexed_at: Utc::now(),
            modified_at: reg.fingerprint.modified_at,
            size: reg.fingerprint.size,
            embedding_model: reg.embedding_model.to_string(),
            embedding_provider: reg.embedding_provider.to_string(),
            previous_hashes,
            version_count,
        };
        self.entries.insert(reg.file_name.to_string(), entry);
        &self.entries[reg.file_name]
    }

    pub fn unregister(&mut self, file_name: &str) -> Option<FileRegistryEntry> {
        self.entries.remove(file_name)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Make the registry agree with `metadatas`: drop entries without chunks,
    /// add entries for unregistered files and correct chunk counts and hashes.
    pub fn repair_from_metadata(
        &mut self,
        metadatas: &[ChunkMetadata],
        embedding_provider: &str,
    ) -> RepairReport {
        struct Seen<'a> {
            count: usize,
            first: &'a ChunkMetadata,
            newest: DateTime<Utc>,
        }
        let mut seen: BTreeMap<&str, Seen<'_>> = BTreeMap::new();
        for m in metadatas {
            seen.entry(m.file_name.as_str())
                .and_modify(|s| {
                    s.count += 1;
                    s.newest = s.newest.max(m.created_at);
                })
                .or_insert(Seen {
                    count: 1,
                    first: m,
                    newest: m.created_at,
                });
        }

        let mut report = RepairReport::default();
        let stale: Vec<String> = self
            .entries
            .keys()
            .filter(|k| !seen.contains_key(k.as_str()))
            .cloned()
            .collect();
        for name in stale {
            self.entries.remove(&name);
            report.removed.push(name);
        }

        for (name, s) in seen {
            match self.entries.get_mut(name) {
                Some(entry) => {
                    if entry.chunk_count != s.count || entry.hash != s.first.source_hash {
                        entry.chunk_count = s.count;
                        entry.hash = s.first.source_hash.clone();
                        report.corrected.push(name.to_string());
                    }
                }
                None => {
                    let size = std::fs::metadata(&s.first.source_path)
                        .map(|m| m.len())
                        .unwrap_or(0);
                    self.entries.insert(
                        name.to_string(),
                        FileRegistryEntry {
                            hash: s.first.source_hash.clone(),
                            path: s.first.source_path.clone(),
                            chunk_count: s.count,
                            indexed_at: s.newest,
                            modified_at: None,
                            size,
                            embedding_model: s.first.embedding_model.clone(),
                            embedding_provider: embedding_provider.to_string(),
                            previous_hashes: s
                                .first
                                .version_lineage
                                .iter()
                                .take(MAX_VERSION_HISTORY)
                                .cloned()
                                .collect(),
                            version_count: s.first.version_lineage.len() as u32 + 1,
                        },
                    );
                    report.added.push(name.to_string());
                }
            }
        }

        if !report.is_clean() {
            info!(
                added = report.added.len(),
                removed = report.removed.len(),
                corrected = report.corrected.len(),
                "repaired file registry from metadata"
            );
        }
        report
    }
}

fn read_registry(path: &Path) -> Result<FileRegistry> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read file registry: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse file registry: {}", path.display()))
}
