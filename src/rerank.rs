//! Cross-encoder reranking.
//!
//! A cross-encoder scores `(query, document)` pairs jointly. It is only run
//! over the already narrowed candidate set, never the full index.

use anyhow::Result;
#[cfg(feature = "local-embeddings-fastembed")]
use anyhow::{anyhow, bail};
#[cfg(feature = "local-embeddings-fastembed")]
use std::path::Path;
#[cfg(feature = "local-embeddings-fastembed")]
use std::sync::{Mutex, PoisonError};

/// Pairwise relevance model.
pub trait CrossEncoder: Send + Sync {
    fn model_name(&self) -> &str;
    /// One raw relevance score per document, in input order.
    fn score(&self, query: &str, documents: &[String]) -> Result<Vec<f32>>;
}

#[cfg(feature = "local-embeddings-fastembed")]
pub const DEFAULT_RERANK_MODEL: &str = "bge-reranker-base";

/// fastembed ONNX reranker. Weights are downloaded into the knowledge base's
/// `model_cache/` on first use.
#[cfg(feature = "local-embeddings-fastembed")]
pub struct FastembedReranker {
    model_name: String,
    model: Mutex<fastembed::TextRerank>,
}

#[cfg(feature = "local-embeddings-fastembed")]
impl FastembedReranker {
    pub fn new(model_name: Option<&str>, cache_dir: &Path) -> Result<Self> {
        let name = model_name.unwrap_or(DEFAULT_RERANK_MODEL);
        let model = fastembed::TextRerank::try_new(
            fastembed::RerankInitOptions::new(config_to_reranker_model(name)?)
                .with_cache_dir(cache_dir.to_path_buf())
                .with_show_download_progress(false),
        )
        .map_err(|e| anyhow!("Failed to initialize reranker: {}", e))?;
        Ok(Self {
            model_name: name.to_string(),
            model: Mutex::new(model),
        })
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
fn config_to_reranker_model(name: &str) -> Result<fastembed::RerankerModel> {
    match name {
        "bge-reranker-base" => Ok(fastembed::RerankerModel::BGERerankerBase),
        "bge-reranker-v2-m3" => Ok(fastembed::RerankerModel::BGERerankerV2M3),
        "jina-reranker-v1-turbo-en" => Ok(fastembed::RerankerModel::JINARerankerV1TurboEn),
        other => bail!(
            "Unknown reranker model: '{}'. Supported models: \
             bge-reranker-base, bge-reranker-v2-m3, jina-reranker-v1-turbo-en",
            other
        ),
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
impl CrossEncoder for FastembedReranker {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn score(&self, query: &str, documents: &[String]) -> Result<Vec<f32>> {
        let docs: Vec<&str> = documents.iter().map(String::as_str).collect();
        let mut model = self.model.lock().unwrap_or_else(PoisonError::into_inner);
        let results = model
            .rerank(query, docs, false, None)
            .map_err(|e| anyhow!("Reranking failed: {}", e))?;
        let mut scores = vec![0.0f32; documents.len()];
        for r in results {
            if let Some(slot) = scores.get_mut(r.index) {
                *slot = r.score;
            }
        }
        Ok(scores)
    }
}

/// Build the reranker configured for this crate's feature set, if any.
#[cfg(feature = "local-embeddings-fastembed")]
pub fn create_cross_encoder(
    model_name: Option<&str>,
    cache_dir: &std::path::Path,
) -> Result<Box<dyn CrossEncoder>> {
    Ok(Box::new(FastembedReranker::new(model_name, cache_dir)?))
}

#[cfg(not(feature = "local-embeddings-fastembed"))]
pub fn create_cross_encoder(
    _model_name: Option<&str>,
    _cache_dir: &std::path::Path,
) -> Result<Box<dyn CrossEncoder>> {
    anyhow::bail!("cross-encoder reranking requires --features local-embeddings-fastembed")
}
