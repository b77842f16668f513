//! Retrieval pipeline.
//!
//! `get_relevant_chunks` runs these stages in order:
//!
//! 1. clean the query text
//! 2. optionally expand it into several phrasings ([`crate::query`])
//! 3. embed each phrasing, search the top `3 * n` rows for each and keep the
//!    best semantic score seen per row
//! 4. drop candidates failing the [`SearchFilter`]
//! 5. hybrid rerank: `alpha * semantic + (1 - alpha) * lexical`
//! 6. optional cross-encoder rerank, min-max normalized, replacing the score
//! 7. truncate to `n`
//!
//! Every stage is a plain function over [`Candidate`]s so each can be tested
//! without a knowledge base on disk.

use anyhow::Result;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

use crate::config::RetrievalConfig;
use crate::index::FlatIndex;
use crate::models::{ChunkMetadata, RetrievedChunk};
use crate::preprocess::{clean_text, is_stopword, tokenize};
use crate::query::expand_query;
use crate::rerank::CrossEncoder;

/// Semantic weight forced by safe mode.
pub const SAFE_MODE_ALPHA: f32 = 0.7;
/// Importance floor raised to by safe mode.
pub const SAFE_MODE_MIN_IMPORTANCE: f32 = 0.5;
/// Candidates fetched per query variant, as a multiple of `n_results`.
const CANDIDATE_MULTIPLIER: usize = 3;

/// A row of the index with its current ranking score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub index: usize,
    pub score: f32,
}

/// Metadata predicate applied after the vector search.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchFilter {
    pub min_importance: Option<f32>,
    pub language: Option<String>,
}

impl SearchFilter {
    pub fn is_empty(&self) -> bool {
        self.min_importance.is_none() && self.language.is_none()
    }

    pub fn matches(&self, meta: &ChunkMetadata) -> bool {
        if let Some(min) = self.min_importance {
            if meta.importance_score < min {
                return false;
            }
        }
        if let Some(lang) = &self.language {
            if !meta.language.eq_ignore_ascii_case(lang) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchOptions {
    pub n_results: usize,
    pub alpha: f32,
    pub reranking: bool,
    pub cross_encoder_reranking: bool,
    pub query_expansion: bool,
    pub filter: SearchFilter,
}

impl SearchOptions {
    pub fn from_config(config: &RetrievalConfig) -> Self {
        Self {
            n_results: config.n_results,
            alpha: config.hybrid_alpha,
            reranking: config.reranking,
            cross_encoder_reranking: config.cross_encoder_reranking,
            query_expansion: config.query_expansion,
            filter: SearchFilter {
                min_importance: config.min_importance,
                language: config.language.clone(),
            },
        }
    }

    /// Tighten for resource-constrained runs: half the results, mostly
    /// semantic scoring, no expansion and a raised importance floor.
    pub fn safe(mut self) -> Self {
        self.n_results = (self.n_results / 2).max(1);
        self.alpha = SAFE_MODE_ALPHA;
        self.query_expansion = false;
        self.filter.min_importance = Some(
            self.filter
                .min_importance
                .map_or(SAFE_MODE_MIN_IMPORTANCE, |m| m.max(SAFE_MODE_MIN_IMPORTANCE)),
        );
        self
    }
}

/// Read-only view of the knowledge base taken under the handler's lock.
pub struct Corpus<'a> {
    pub index: &'a FlatIndex,
    pub chunks: &'a [String],
    pub metadatas: &'a [ChunkMetadata],
}

/// Run the full pipeline. `embed` maps query texts to vectors of the index's
/// dimension. An empty or blank query yields no results.
pub fn retrieve<F>(
    corpus: &Corpus<'_>,
    query: &str,
    opts: &SearchOptions,
    embed: F,
    cross_encoder: Option<&dyn CrossEncoder>,
) -> Result<Vec<Candidate>>
where
    F: Fn(&[String]) -> Vec<Vec<f32>>,
{
    let cleaned = clean_text(query);
    if cleaned.trim().is_empty() || corpus.index.is_empty() || opts.n_results == 0 {
        return Ok(Vec::new());
    }

    let variants = if opts.query_expansion {
        expand_query(&cleaned)
    } else {
        vec![cleaned.clone()]
    };
    debug!(variants = variants.len(), "query variants");

    let vectors = embed(&variants);
    let k = opts.n_results.saturating_mul(CANDIDATE_MULTIPLIER);
    let mut candidates = collect_candidates(corpus.index, &vectors, k)?;
    candidates.retain(|c| c.index < corpus.chunks.len() && c.index < corpus.metadatas.len());

    if !opts.filter.is_empty() {
        candidates = apply_filter(candidates, corpus.metadatas, &opts.filter);
    }

    if opts.reranking && candidates.len() > 1 {
        candidates = hybrid_rerank(candidates, &cleaned, corpus.chunks, opts.alpha);
    }

    if opts.cross_encoder_reranking && candidates.len() > 1 {
        match cross_encoder {
            Some(encoder) => {
                candidates = cross_encode(candidates, &cleaned, corpus.chunks, encoder);
            }
            None => debug!("cross-encoder unavailable, skipping"),
        }
    }

    candidates.truncate(opts.n_results);
    Ok(candidates)
}

/// Search each query vector and union the hits, keeping each row's best
/// similarity. Best first.
pub fn collect_candidates(
    index: &FlatIndex,
    query_vectors: &[Vec<f32>],
    k: usize,
) -> Result<Vec<Candidate>> {
    let mut best: HashMap<usize, f32> = HashMap::new();
    for vector in query_vectors {
        for (raw, row) in index.search(vector, k)? {
            let sim = index.similarity(raw);
            best.entry(row)
                .and_modify(|s| *s = s.max(sim))
                .or_insert(sim);
        }
    }
    let mut out: Vec<Candidate> = best
        .into_iter()
        .map(|(index, score)| Candidate { index, score })
        .collect();
    sort_candidates(&mut out);
    Ok(out)
}

pub fn apply_filter(
    candidates: Vec<Candidate>,
    metadatas: &[ChunkMetadata],
    filter: &SearchFilter,
) -> Vec<Candidate> {
    candidates
        .into_iter()
        .filter(|c| metadatas.get(c.index).is_some_and(|m| filter.matches(m)))
        .collect()
}

/// Unique query terms, stopwords dropped unless nothing else is left.
pub fn query_terms(query: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let all: Vec<String> = tokenize(query)
        .into_iter()
        .filter(|t| seen.insert(t.clone()))
        .collect();
    let content: Vec<String> = all.iter().filter(|t| !is_stopword(t)).cloned().collect();
    if content.is_empty() {
        all
    } else {
        content
    }
}

/// Fraction of `terms` found in `text`, case-insensitive substring match.
pub fn lexical_score(terms: &[String], text: &str) -> f32 {
    if terms.is_empty() {
        return 0.0;
    }
    let haystack = text.to_lowercase();
    let hits = terms.iter().filter(|t| haystack.contains(t.as_str())).count();
    hits as f32 / terms.len() as f32
}

pub fn hybrid_rerank(
    candidates: Vec<Candidate>,
    query: &str,
    chunks: &[String],
    alpha: f32,
) -> Vec<Candidate> {
    let terms = query_terms(query);
    let mut out: Vec<Candidate> = candidates
        .into_iter()
        .map(|c| {
            let lexical = chunks
                .get(c.index)
                .map_or(0.0, |text| lexical_score(&terms, text));
            Candidate {
                index: c.index,
                score: alpha * c.score + (1.0 - alpha) * lexical,
            }
        })
        .collect();
    sort_candidates(&mut out);
    out
}

/// Replace scores with min-max normalized cross-encoder scores. Any failure
/// leaves the input ranking untouched.
pub fn cross_encode(
    candidates: Vec<Candidate>,
    query: &str,
    chunks: &[String],
    encoder: &dyn CrossEncoder,
) -> Vec<Candidate> {
    let docs: Vec<String> = candidates
        .iter()
        .map(|c| chunks.get(c.index).cloned().unwrap_or_default())
        .collect();
    let raw = match encoder.score(query, &docs) {
        Ok(scores) if scores.len() == candidates.len() => scores,
        Ok(scores) => {
            warn!(
                expected = candidates.len(),
                got = scores.len(),
                "cross-encoder returned wrong number of scores, skipping"
            );
            return candidates;
        }
        Err(e) => {
            warn!(model = encoder.model_name(), error = %e, "cross-encoder failed, skipping");
            return candidates;
        }
    };
    let mut out: Vec<Candidate> = candidates
        .iter()
        .zip(normalize_scores(&raw))
        .map(|(c, score)| Candidate {
            index: c.index,
            score,
        })
        .collect();
    sort_candidates(&mut out);
    out
}

/// Min-max normalize to `[0, 1]`; equal scores all map to 1.0.
pub fn normalize_scores(scores: &[f32]) -> Vec<f32> {
    if scores.is_empty() {
        return Vec::new();
    }
    let s_min = scores.iter().copied().fold(f32::INFINITY, f32::min);
    let s_max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    scores
        .iter()
        .map(|s| {
            if (s_max - s_min).abs() < f32::EPSILON {
                1.0
            } else {
                (s - s_min) / (s_max - s_min)
            }
        })
        .collect()
}

/// Score descending, row ascending for ties.
pub fn sort_candidates(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.index.cmp(&b.index)));
}

pub fn into_results(corpus: &Corpus<'_>, candidates: &[Candidate]) -> Vec<RetrievedChunk> {
    candidates
        .iter()
        .filter_map(|c| {
            Some(RetrievedChunk {
                content: corpus.chunks.get(c.index)?.clone(),
                metadata: corpus.metadatas.get(c.index)?.clone(),
                score: c.score,
            })
        })
        .collect()
}
