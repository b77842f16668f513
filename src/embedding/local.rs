//! In-process providers: fastembed sentence encoder, feature hashing, zeros.

use anyhow::Result;
#[cfg(feature = "local-embeddings-fastembed")]
use anyhow::bail;
#[cfg(feature = "local-embeddings-fastembed")]
use std::path::Path;
#[cfg(feature = "local-embeddings-fastembed")]
use std::sync::{Mutex, PoisonError};

use super::EmbeddingProvider;
use crate::preprocess::tokenize;

pub(super) const DEFAULT_LOCAL_MODEL: &str = "all-minilm-l6-v2";
pub(super) const ZERO_PROVIDER_NAME: &str = "zero";

// ============ Local Provider (fastembed) ============

/// Embedding provider for local inference via fastembed.
///
/// Models are downloaded on first use from Hugging Face into the knowledge
/// base's `model_cache/` directory. After that no network calls are needed.
#[cfg(feature = "local-embeddings-fastembed")]
pub struct LocalProvider {
    model_name: String,
    dims: usize,
    model: Mutex<fastembed::TextEmbedding>,
}

#[cfg(feature = "local-embeddings-fastembed")]
impl LocalProvider {
    pub fn new(model_name: &str, dims: Option<usize>, cache_dir: &Path) -> Result<Self> {
        let fastembed_model = config_to_fastembed_model(model_name)?;
        let dims = dims.unwrap_or_else(|| default_dims(model_name));
        let model = fastembed::TextEmbedding::try_new(
            fastembed::InitOptions::new(fastembed_model)
                .with_cache_dir(cache_dir.to_path_buf())
                .with_show_download_progress(false),
        )
        .map_err(|e| anyhow::anyhow!("Failed to initialize local embedding model: {}", e))?;
        Ok(Self {
            model_name: model_name.to_string(),
            dims,
            model: Mutex::new(model),
        })
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
impl EmbeddingProvider for LocalProvider {
    fn model_name(&self) -> &str {
        &self.model_name
    }
    fn provider_name(&self) -> &str {
        "local"
    }
    fn dims(&self) -> usize {
        self.dims
    }
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut model = self.model.lock().unwrap_or_else(PoisonError::into_inner);
        model
            .embed(texts, Some(texts.len().max(1)))
            .map_err(|e| anyhow::anyhow!("Local embedding failed: {}", e))
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
fn default_dims(model_name: &str) -> usize {
    match model_name {
        "all-minilm-l6-v2" => 384,
        "bge-small-en-v1.5" => 384,
        "bge-base-en-v1.5" => 768,
        "bge-large-en-v1.5" => 1024,
        "nomic-embed-text-v1" | "nomic-embed-text-v1.5" => 768,
        "multilingual-e5-small" => 384,
        "multilingual-e5-base" => 768,
        "multilingual-e5-large" => 1024,
        _ => 384,
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
fn config_to_fastembed_model(name: &str) -> Result<fastembed::EmbeddingModel> {
    match name {
        "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
        "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
        "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
        "bge-large-en-v1.5" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
        "nomic-embed-text-v1" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV1),
        "nomic-embed-text-v1.5" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV15),
        "multilingual-e5-small" => Ok(fastembed::EmbeddingModel::MultilingualE5Small),
        "multilingual-e5-base" => Ok(fastembed::EmbeddingModel::MultilingualE5Base),
        "multilingual-e5-large" => Ok(fastembed::EmbeddingModel::MultilingualE5Large),
        other => bail!(
            "Unknown local embedding model: '{}'. Supported models: \
             all-minilm-l6-v2, bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5, \
             nomic-embed-text-v1, nomic-embed-text-v1.5, \
             multilingual-e5-small, multilingual-e5-base, multilingual-e5-large",
            other
        ),
    }
}

// ============ Hashing Provider ============

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
const TRIGRAM_WEIGHT: f32 = 0.5;

fn fnv1a(parts: &[&[u8]]) -> u64 {
    let mut hash = FNV_OFFSET;
    for part in parts {
        for &b in *part {
            hash ^= u64::from(b);
            hash = hash.wrapping_mul(FNV_PRIME);
        }
    }
    hash
}

/// Deterministic bag-of-features encoder: lowercased word unigrams plus
/// character trigrams of each word, hashed into `dims` buckets.
///
/// Needs no model files or network, so it is always available as a fallback
/// and makes tests reproducible.
pub struct HashingProvider {
    dims: usize,
}

impl HashingProvider {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        let buckets = self.dims as u64;
        for word in tokenize(text) {
            v[(fnv1a(&[b"w:", word.as_bytes()]) % buckets) as usize] += 1.0;
            let padded: Vec<char> = std::iter::once('^')
                .chain(word.chars())
                .chain(std::iter::once('$'))
                .collect();
            for tri in padded.windows(3) {
                let tri: String = tri.iter().collect();
                v[(fnv1a(&[b"t:", tri.as_bytes()]) % buckets) as usize] += TRIGRAM_WEIGHT;
            }
        }
        v
    }
}

impl EmbeddingProvider for HashingProvider {
    fn model_name(&self) -> &str {
        "hashing-bow"
    }
    fn provider_name(&self) -> &str {
        "hashing"
    }
    fn dims(&self) -> usize {
        self.dims
    }
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

// ============ Zero Provider ============

/// All-zero vectors of a fixed dimension.
pub struct ZeroProvider {
    dims: usize,
}

impl ZeroProvider {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }
}

impl EmbeddingProvider for ZeroProvider {
    fn model_name(&self) -> &str {
        "zero"
    }
    fn provider_name(&self) -> &str {
        ZERO_PROVIDER_NAME
    }
    fn dims(&self) -> usize {
        self.dims
    }
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(vec![vec![0.0; self.dims]; texts.len()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
        let norm = |v: &[f32]| v.iter().map(|x| x * x).sum::<f32>().sqrt();
        dot / (norm(a) * norm(b))
    }

    #[test]
    fn hashing_is_deterministic_and_sized() {
        let p = HashingProvider::new(64);
        let a = p.embed_batch(&["The quick brown fox".into()]).unwrap();
        let b = p.embed_batch(&["The quick brown fox".into()]).unwrap();
        assert_eq!(a, b);
        assert_eq!(a[0].len(), 64);
    }

    #[test]
    fn hashing_similarity_tracks_overlap() {
        let p = HashingProvider::new(256);
        let v = p
            .embed_batch(&[
                "foxes jump over dogs".into(),
                "a fox jumps".into(),
                "quarterly revenue report".into(),
            ])
            .unwrap();
        assert!(cosine(&v[0], &v[1]) > cosine(&v[0], &v[2]));
    }

    #[test]
    fn hashing_is_case_insensitive() {
        let p = HashingProvider::new(32);
        let v = p.embed_batch(&["Fox".into(), "fox".into()]).unwrap();
        assert_eq!(v[0], v[1]);
    }

    #[test]
    fn zero_provider_shape() {
        let p = ZeroProvider::new(5);
        let v = p.embed_batch(&["a".into(), "b".into()]).unwrap();
        assert_eq!(v, vec![vec![0.0; 5]; 2]);
    }
}
