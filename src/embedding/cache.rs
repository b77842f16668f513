//! Persistent embeddings cache keyed by model and content hash.

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::path::Path;
use tracing::{debug, warn};

use super::{blob_to_vec, vec_to_blob};

const CACHE_FORMAT_VERSION: u32 = 2;

/// Cache key: SHA-256 of the model name and text, so switching models never
/// serves vectors from another embedding space.
pub fn cache_key(model: &str, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(model.as_bytes());
    hasher.update([0u8]);
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Serialize, Deserialize)]
struct StoredEntry {
    key: String,
    /// base64 of little-endian f32 bytes.
    v: String,
}

/// On disk, entries run from least to most recently used.
#[derive(Serialize, Deserialize)]
struct StoredCache {
    format_version: u32,
    entries: Vec<StoredEntry>,
}

/// Bounded LRU map from [`cache_key`] to vector.
pub struct EmbeddingsCache {
    entries: LruCache<String, Vec<f32>>,
    dirty: bool,
}

impl std::fmt::Debug for EmbeddingsCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingsCache")
            .field("len", &self.entries.len())
            .field("cap", &self.entries.cap())
            .field("dirty", &self.dirty)
            .finish()
    }
}

impl EmbeddingsCache {
    pub fn new(max_entries: usize) -> Self {
        let cap = NonZeroUsize::new(max_entries.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(cap),
            dirty: false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True when entries changed since the last [`mark_clean`](Self::mark_clean).
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Lookup; a hit becomes the most recently used entry.
    pub fn get(&mut self, model: &str, text: &str) -> Option<Vec<f32>> {
        self.entries.get(&cache_key(model, text)).cloned()
    }

    pub fn insert(&mut self, model: &str, text: &str, vector: Vec<f32>) {
        let key = cache_key(model, text);
        if let Some((evicted, _)) = self.entries.push(key.clone(), vector) {
            if evicted != key {
                debug!(key = %evicted, "evicted embeddings cache entry");
            }
        }
        self.dirty = true;
    }

    /// Load from `path`. A missing file yields an empty cache; an unreadable
    /// one is logged and discarded.
    pub fn load(path: &Path, max_entries: usize) -> Self {
        let mut cache = Self::new(max_entries);
        if !path.exists() {
            return cache;
        }
        match read_stored(path) {
            Ok(stored) => {
                for e in stored.entries {
                    match BASE64.decode(e.v.as_bytes()) {
                        Ok(bytes) => {
                            cache.entries.put(e.key, blob_to_vec(&bytes));
                        }
                        Err(err) => debug!(error = %err, "skipping undecodable cache entry"),
                    }
                }
            }
            Err(e) => warn!(path = %path.display(), error = %e, "embeddings cache unreadable, starting empty"),
        }
        cache
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>> {
        let stored = StoredCache {
            format_version: CACHE_FORMAT_VERSION,
            entries: self
                .entries
                .iter()
                .rev()
                .map(|(k, v)| StoredEntry {
                    key: k.clone(),
                    v: BASE64.encode(vec_to_blob(v)),
                })
                .collect(),
        };
        Ok(serde_json::to_vec(&stored)?)
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }
}

fn read_stored(path: &Path) -> Result<StoredCache> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read embeddings cache: {}", path.display()))?;
    let stored: StoredCache = serde_json::from_slice(&bytes)
        .with_context(|| format!("Failed to parse embeddings cache: {}", path.display()))?;
    if stored.format_version != CACHE_FORMAT_VERSION {
        anyhow::bail!("unsupported cache format version {}", stored.format_version);
    }
    Ok(stored)
}
