//! TOML configuration for the knowledge-base engine.
//!
//! Every section is optional and falls back to the defaults below, so an
//! empty file (or no file at all) yields a working configuration backed by
//! the local embedding model.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::chunk::ChunkingStrategy;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub knowledge_base: KnowledgeBaseConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub ingestion: IngestionConfig,
    #[serde(default)]
    pub preprocess: PreprocessConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct KnowledgeBaseConfig {
    #[serde(default = "default_kb_path")]
    pub path: PathBuf,
    /// Tried before the home-directory fallback when `path` is not writable.
    #[serde(default)]
    pub fallback_dir: Option<PathBuf>,
    #[serde(default = "default_max_backups")]
    pub max_backups: usize,
    #[serde(default = "default_cache_max_entries")]
    pub cache_max_entries: usize,
}

impl Default for KnowledgeBaseConfig {
    fn default() -> Self {
        Self {
            path: default_kb_path(),
            fallback_dir: None,
            max_backups: default_max_backups(),
            cache_max_entries: default_cache_max_entries(),
        }
    }
}

fn default_kb_path() -> PathBuf {
    PathBuf::from("./knowledge_base")
}
fn default_max_backups() -> usize {
    5
}
fn default_cache_max_entries() -> usize {
    50_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default)]
    pub strategy: ChunkingStrategy,
    /// Maximum words per chunk.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    #[serde(default = "default_true")]
    pub section_aware: bool,
    #[serde(default = "default_section_context_words")]
    pub section_context_words: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            strategy: ChunkingStrategy::default(),
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            section_aware: true,
            section_context_words: default_section_context_words(),
        }
    }
}

fn default_chunk_size() -> usize {
    500
}
fn default_chunk_overlap() -> usize {
    50
}
fn default_section_context_words() -> usize {
    30
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_n_results")]
    pub n_results: usize,
    /// Weight for semantic vs lexical: `score = α*semantic + (1-α)*lexical`.
    #[serde(default = "default_hybrid_alpha")]
    pub hybrid_alpha: f32,
    #[serde(default = "default_true")]
    pub reranking: bool,
    #[serde(default)]
    pub cross_encoder_reranking: bool,
    #[serde(default = "default_true")]
    pub query_expansion: bool,
    #[serde(default)]
    pub min_importance: Option<f32>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub safe_mode: bool,
    #[serde(default)]
    pub ultra_safe_mode: bool,
    #[serde(default)]
    pub cross_encoder_model: Option<String>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            n_results: default_n_results(),
            hybrid_alpha: default_hybrid_alpha(),
            reranking: true,
            cross_encoder_reranking: false,
            query_expansion: true,
            min_importance: None,
            language: None,
            safe_mode: false,
            ultra_safe_mode: false,
            cross_encoder_model: None,
        }
    }
}

fn default_n_results() -> usize {
    5
}
fn default_hybrid_alpha() -> f32 {
    0.5
}

/// Embedding backend selector.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[serde(rename = "openai")]
    OpenAi,
    Ollama,
    #[default]
    Local,
    Hashing,
    Disabled,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Ollama => "ollama",
            ProviderKind::Local => "local",
            ProviderKind::Hashing => "hashing",
            ProviderKind::Disabled => "disabled",
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default)]
    pub provider: ProviderKind,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Local model tried when the configured provider cannot start.
    #[serde(default = "default_fallback_model")]
    pub fallback_model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// L2-normalize vectors and search by inner product; otherwise L2 distance.
    #[serde(default = "default_true")]
    pub normalize: bool,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::Local,
            model: None,
            dims: None,
            fallback_model: default_fallback_model(),
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            normalize: true,
        }
    }
}

fn default_fallback_model() -> Option<String> {
    Some("all-minilm-l6-v2".to_string())
}
fn default_batch_size() -> usize {
    32
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestionConfig {
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            max_file_bytes: default_max_file_bytes(),
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            follow_symlinks: false,
        }
    }
}

fn default_max_workers() -> usize {
    4
}
fn default_max_file_bytes() -> u64 {
    100 * 1024 * 1024
}
fn default_include_globs() -> Vec<String> {
    [
        "**/*.pdf", "**/*.docx", "**/*.xlsx", "**/*.csv", "**/*.html", "**/*.htm", "**/*.md",
        "**/*.txt",
    ]
    .iter()
    .map(|g| g.to_string())
    .collect()
}

#[derive(Debug, Deserialize, Clone)]
pub struct PreprocessConfig {
    #[serde(default = "default_max_keywords")]
    pub max_keywords: usize,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            max_keywords: default_max_keywords(),
            cache_capacity: default_cache_capacity(),
        }
    }
}

fn default_max_keywords() -> usize {
    10
}
fn default_cache_capacity() -> usize {
    1000
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != ProviderKind::Disabled
    }
}

impl Config {
    /// Check cross-field constraints that serde defaults cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.chunking.chunk_size == 0 {
            anyhow::bail!("chunking.chunk_size must be > 0");
        }
        if self.chunking.chunk_overlap >= self.chunking.chunk_size {
            anyhow::bail!(
                "chunking.chunk_overlap ({}) must be smaller than chunking.chunk_size ({})",
                self.chunking.chunk_overlap,
                self.chunking.chunk_size
            );
        }
        if self.retrieval.n_results == 0 {
            anyhow::bail!("retrieval.n_results must be >= 1");
        }
        if !(0.0..=1.0).contains(&self.retrieval.hybrid_alpha) {
            anyhow::bail!("retrieval.hybrid_alpha must be in [0.0, 1.0]");
        }
        if self.embedding.batch_size == 0 {
            anyhow::bail!("embedding.batch_size must be > 0");
        }
        if self.embedding.dims == Some(0) {
            anyhow::bail!("embedding.dims must be > 0 when set");
        }
        if self.ingestion.max_workers == 0 {
            anyhow::bail!("ingestion.max_workers must be >= 1");
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        config.validate().unwrap();
        assert_eq!(config.chunking.chunk_size, 500);
        assert_eq!(config.embedding.provider, ProviderKind::Local);
        assert_eq!(config.retrieval.n_results, 5);
        assert_eq!(config.chunking.strategy, ChunkingStrategy::Semantic);
    }

    #[test]
    fn parses_enums_by_name() {
        let config: Config = toml::from_str(
            r#"
            [chunking]
            strategy = "sliding_window"

            [embedding]
            provider = "openai"
            model = "text-embedding-3-small"
            "#,
        )
        .unwrap();
        assert_eq!(config.chunking.strategy, ChunkingStrategy::SlidingWindow);
        assert_eq!(config.embedding.provider, ProviderKind::OpenAi);
    }

    #[test]
    fn unknown_provider_is_a_parse_error() {
        let parsed: std::result::Result<Config, _> = toml::from_str(
            r#"
            [embedding]
            provider = "word2vec"
            "#,
        );
        assert!(parsed.is_err());
    }

    #[test]
    fn overlap_must_be_smaller_than_size() {
        let config: Config = toml::from_str(
            r#"
            [chunking]
            chunk_size = 10
            chunk_overlap = 10
            "#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn alpha_out_of_range_rejected() {
        let mut config = Config::default();
        config.retrieval.hybrid_alpha = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_config_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kb.toml");
        std::fs::write(
            &path,
            "[knowledge_base]\npath = \"/tmp/kb\"\n[retrieval]\nhybrid_alpha = 0.8\n",
        )
        .unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.knowledge_base.path, PathBuf::from("/tmp/kb"));
        assert!((config.retrieval.hybrid_alpha - 0.8).abs() < 1e-6);
    }
}
