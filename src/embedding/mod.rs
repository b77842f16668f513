//! Embedding provider abstraction and implementations.
//!
//! Defines the [`EmbeddingProvider`] trait and concrete implementations:
//! - **[`OpenAIProvider`]**: calls the OpenAI embeddings API with batching, retry, and backoff.
//! - **[`OllamaProvider`]**: calls a local Ollama instance's `/api/embed` endpoint.
//! - **`LocalProvider`**: runs a sentence encoder locally via fastembed; no network
//!   calls after model download.
//! - **[`HashingProvider`]**: deterministic feature-hashing encoder, always available.
//! - **[`ZeroProvider`]**: all-zero vectors; the last resort that keeps the engine running.
//!
//! [`ProviderPolicy`] turns the configuration into an ordered fallback list and
//! resolves it to the first provider that starts and embeds a test sentence.
//! [`Embedder`] wraps the chosen provider with the embeddings cache, batching,
//! per-item retry and zero-vector substitution, so embedding never fails.
//!
//! # Retry Strategy
//!
//! The OpenAI and Ollama providers use exponential backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

mod cache;
mod local;
mod remote;

pub use cache::{cache_key, EmbeddingsCache};
#[cfg(feature = "local-embeddings-fastembed")]
pub use local::LocalProvider;
pub use local::{HashingProvider, ZeroProvider};
pub use remote::{OllamaProvider, OpenAIProvider};

use anyhow::{bail, Result};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

use crate::config::{EmbeddingConfig, ProviderKind};
use crate::index::Metric;

/// Dimension used by the hashing and zero providers when none is configured.
pub const DEFAULT_FALLBACK_DIMS: usize = 384;

/// Trait for embedding providers.
///
/// Implementations are synchronous; callers that run inside an async runtime
/// move embedding work onto a blocking thread.
pub trait EmbeddingProvider: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Returns the provider identifier (e.g. `"openai"`).
    fn provider_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;
    /// Embed a batch of texts, one vector per input in input order.
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// One entry of the provider fallback list.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderCandidate {
    /// The provider named in configuration.
    Configured,
    /// Local sentence encoder with the given model name.
    Local(String),
    Hashing(usize),
    Zero(usize),
}

/// Ordered provider candidates; the first that constructs and embeds a test sentence
/// wins and fixes the embedding dimension.
#[derive(Debug, Clone)]
pub struct ProviderPolicy {
    pub candidates: Vec<ProviderCandidate>,
}

impl ProviderPolicy {
    pub fn from_config(config: &EmbeddingConfig) -> Self {
        let fallback_dims = config.dims.unwrap_or(DEFAULT_FALLBACK_DIMS);
        if !config.is_enabled() {
            return Self {
                candidates: vec![ProviderCandidate::Zero(fallback_dims)],
            };
        }
        let mut candidates = vec![ProviderCandidate::Configured];
        if let Some(model) = &config.fallback_model {
            let same_as_configured =
                config.provider == ProviderKind::Local && config.model.as_deref() == Some(model);
            let configured_default_local = config.provider == ProviderKind::Local
                && config.model.is_none()
                && model == local::DEFAULT_LOCAL_MODEL;
            if !same_as_configured && !configured_default_local {
                candidates.push(ProviderCandidate::Local(model.clone()));
            }
        }
        if config.provider != ProviderKind::Hashing {
            candidates.push(ProviderCandidate::Hashing(fallback_dims));
        }
        candidates.push(ProviderCandidate::Zero(fallback_dims));
        Self { candidates }
    }

    /// Try every candidate in order. Never fails: the zero provider is always
    /// the last candidate.
    pub fn resolve(&self, config: &EmbeddingConfig, model_cache: &Path) -> Box<dyn EmbeddingProvider> {
        for candidate in &self.candidates {
            match build_candidate(candidate, config, model_cache).and_then(smoke_test) {
                Ok(provider) => {
                    info!(
                        provider = provider.provider_name(),
                        model = provider.model_name(),
                        dims = provider.dims(),
                        "embedding provider ready"
                    );
                    return provider;
                }
                Err(e) => warn!(?candidate, error = %e, "embedding provider unavailable, trying next"),
            }
        }
        let dims = config.dims.unwrap_or(DEFAULT_FALLBACK_DIMS);
        warn!(dims, "all embedding providers failed; running in zero-vector mode");
        Box::new(ZeroProvider::new(dims))
    }
}

fn build_candidate(
    candidate: &ProviderCandidate,
    config: &EmbeddingConfig,
    model_cache: &Path,
) -> Result<Box<dyn EmbeddingProvider>> {
    match candidate {
        ProviderCandidate::Configured => create_provider(config, model_cache),
        ProviderCandidate::Local(model) => create_local(model, config.dims, model_cache),
        ProviderCandidate::Hashing(dims) => Ok(Box::new(HashingProvider::new(*dims))),
        ProviderCandidate::Zero(dims) => Ok(Box::new(ZeroProvider::new(*dims))),
    }
}

/// Check that a freshly built provider actually embeds.
fn smoke_test(provider: Box<dyn EmbeddingProvider>) -> Result<Box<dyn EmbeddingProvider>> {
    let out = provider.embed_batch(&["smoke test".to_string()])?;
    match out.first() {
        Some(v) if out.len() == 1 && v.len() == provider.dims() => Ok(provider),
        Some(v) => bail!(
            "smoke test returned {} vectors of length {}, expected 1 of {}",
            out.len(),
            v.len(),
            provider.dims()
        ),
        None => bail!("smoke test returned no vectors"),
    }
}

/// Create the configured provider without testing it.
///
/// | Config value | Provider |
/// |--------------|----------|
/// | `"openai"`   | [`OpenAIProvider`] |
/// | `"ollama"`   | [`OllamaProvider`] |
/// | `"local"`    | `LocalProvider` (requires `local-embeddings-fastembed`) |
/// | `"hashing"`  | [`HashingProvider`] |
/// | `"disabled"` | [`ZeroProvider`] |
pub fn create_provider(
    config: &EmbeddingConfig,
    model_cache: &Path,
) -> Result<Box<dyn EmbeddingProvider>> {
    match config.provider {
        ProviderKind::OpenAi => Ok(Box::new(OpenAIProvider::new(config)?)),
        ProviderKind::Ollama => Ok(Box::new(OllamaProvider::new(config)?)),
        ProviderKind::Local => {
            let model = config.model.as_deref().unwrap_or(local::DEFAULT_LOCAL_MODEL);
            create_local(model, config.dims, model_cache)
        }
        ProviderKind::Hashing => Ok(Box::new(HashingProvider::new(
            config.dims.unwrap_or(DEFAULT_FALLBACK_DIMS),
        ))),
        ProviderKind::Disabled => Ok(Box::new(ZeroProvider::new(
            config.dims.unwrap_or(DEFAULT_FALLBACK_DIMS),
        ))),
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
fn create_local(
    model: &str,
    dims: Option<usize>,
    model_cache: &Path,
) -> Result<Box<dyn EmbeddingProvider>> {
    Ok(Box::new(LocalProvider::new(model, dims, model_cache)?))
}

#[cfg(not(feature = "local-embeddings-fastembed"))]
fn create_local(
    model: &str,
    _dims: Option<usize>,
    _model_cache: &Path,
) -> Result<Box<dyn EmbeddingProvider>> {
    bail!(
        "Local embedding model '{}' requires --features local-embeddings-fastembed",
        model
    )
}

/// Provider plus cache, batching and failure containment.
pub struct Embedder {
    provider: Box<dyn EmbeddingProvider>,
    cache: Arc<Mutex<EmbeddingsCache>>,
    batch_size: usize,
    normalize: bool,
}

impl Embedder {
    pub fn new(
        provider: Box<dyn EmbeddingProvider>,
        cache: Arc<Mutex<EmbeddingsCache>>,
        batch_size: usize,
        normalize: bool,
    ) -> Self {
        Self {
            provider,
            cache,
            batch_size: batch_size.max(1),
            normalize,
        }
    }

    /// Resolve the provider policy for `config` and wire in `cache`.
    pub fn from_config(
        config: &EmbeddingConfig,
        model_cache: &Path,
        cache: Arc<Mutex<EmbeddingsCache>>,
    ) -> Self {
        let provider = ProviderPolicy::from_config(config).resolve(config, model_cache);
        Self::new(provider, cache, config.batch_size, config.normalize)
    }

    pub fn model_name(&self) -> &str {
        self.provider.model_name()
    }

    pub fn provider_name(&self) -> &str {
        self.provider.provider_name()
    }

    pub fn dims(&self) -> usize {
        self.provider.dims()
    }

    /// Inner product over normalized vectors, otherwise Euclidean distance.
    pub fn metric(&self) -> Metric {
        if self.normalize {
            Metric::InnerProduct
        } else {
            Metric::L2
        }
    }

    pub fn is_zero_mode(&self) -> bool {
        self.provider.provider_name() == local::ZERO_PROVIDER_NAME
    }

    pub fn cache(&self) -> &Arc<Mutex<EmbeddingsCache>> {
        &self.cache
    }

    pub fn zero_vector(&self) -> Vec<f32> {
        vec![0.0; self.dims()]
    }

    fn lock_cache(&self) -> MutexGuard<'_, EmbeddingsCache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Embed and validate one batch, normalizing when configured.
    fn embed_checked(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut vectors = self.provider.embed_batch(texts)?;
        if vectors.len() != texts.len() {
            bail!(
                "provider returned {} vectors for {} texts",
                vectors.len(),
                texts.len()
            );
        }
        let dims = self.dims();
        for v in vectors.iter_mut() {
            if v.len() != dims {
                bail!("provider returned a {}-dim vector, expected {}", v.len(), dims);
            }
            if v.iter().any(|x| !x.is_finite()) {
                bail!("provider returned a non-finite vector");
            }
            if self.normalize {
                l2_normalize(v);
            }
        }
        Ok(vectors)
    }

    /// One vector per text, in order. Cache hits skip the provider; failed
    /// batches are retried item by item and items that still fail get a zero
    /// vector. Zero vectors are never cached.
    pub fn embed(&self, texts: &[String]) -> Vec<Vec<f32>> {
        let model = self.model_name().to_string();
        let mut out: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        let mut misses = Vec::new();
        {
            let mut cache = self.lock_cache();
            for (i, text) in texts.iter().enumerate() {
                match cache.get(&model, text) {
                    Some(v) if v.len() == self.dims() => out[i] = Some(v),
                    _ => misses.push(i),
                }
            }
        }
        if !misses.is_empty() {
            debug!(
                hits = texts.len() - misses.len(),
                misses = misses.len(),
                "embedding cache lookup"
            );
        }

        for batch in misses.chunks(self.batch_size) {
            let batch_texts: Vec<String> = batch.iter().map(|&i| texts[i].clone()).collect();
            let fresh: Vec<(usize, Vec<f32>)> = match self.embed_checked(&batch_texts) {
                Ok(vectors) => batch.iter().copied().zip(vectors).collect(),
                Err(e) => {
                    warn!(error = %e, size = batch.len(), "batch embedding failed, retrying per item");
                    batch
                        .iter()
                        .filter_map(|&i| match self.embed_checked(std::slice::from_ref(&texts[i])) {
                            Ok(mut v) => v.pop().map(|v| (i, v)),
                            Err(e) => {
                                warn!(error = %e, index = i, "embedding failed, using zero vector");
                                None
                            }
                        })
                        .collect()
                }
            };
            let mut cache = self.lock_cache();
            for (i, v) in fresh {
                if v.iter().any(|x| *x != 0.0) {
                    cache.insert(&model, &texts[i], v.clone());
                }
                out[i] = Some(v);
            }
        }

        out.into_iter()
            .map(|v| v.unwrap_or_else(|| self.zero_vector()))
            .collect()
    }

    /// Cached vectors where available, zero vectors otherwise. Never calls the
    /// provider.
    pub fn cached_or_zero(&self, texts: &[String]) -> Vec<Vec<f32>> {
        let model = self.model_name().to_string();
        let mut cache = self.lock_cache();
        texts
            .iter()
            .map(|t| match cache.get(&model, t) {
                Some(v) if v.len() == self.dims() => v,
                _ => self.zero_vector(),
            })
            .collect()
    }
}

/// Scale `v` to unit length in place; zero vectors are left unchanged.
pub fn l2_normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Encode a float vector as little-endian f32 bytes.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode little-endian f32 bytes back into a float vector.
///
/// Reverses [`vec_to_blob`]; trailing bytes that do not form a full `f32`
/// are ignored.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}
