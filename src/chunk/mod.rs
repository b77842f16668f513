//! Text chunkers.
//!
//! Every strategy splits cleaned text into ordered fragments of at most
//! `size` whitespace-separated words, with consecutive fragments sharing up to
//! `overlap` words of context where the strategy carries context at all.
//!
//! [`Chunker`] is the entry point used by ingestion. It resolves the configured
//! [`ChunkingStrategy`] once, optionally wraps it in section-aware chunking and
//! applies the fallback policy: if the configured strategy errors or yields
//! nothing, fixed-size chunking is used instead.

mod boundary;
mod section;

pub use section::chunk_by_sections;

use serde::Deserialize;
use tracing::warn;

use crate::config::ChunkingConfig;

/// Closed set of chunking strategies, selected by name in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkingStrategy {
    Fixed,
    #[default]
    Semantic,
    Recursive,
    SlidingWindow,
    Contextual,
}

impl ChunkingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkingStrategy::Fixed => "fixed",
            ChunkingStrategy::Semantic => "semantic",
            ChunkingStrategy::Recursive => "recursive",
            ChunkingStrategy::SlidingWindow => "sliding_window",
            ChunkingStrategy::Contextual => "contextual",
        }
    }

    /// Split `text` into fragments of at most `size` words.
    pub fn split(&self, text: &str, size: usize, overlap: usize) -> Result<Vec<String>, ChunkError> {
        let size = size.max(1);
        let overlap = overlap.min(size - 1);
        match self {
            ChunkingStrategy::Fixed => Ok(fixed_chunks(text, size, overlap)),
            ChunkingStrategy::Semantic => Ok(boundary::semantic_chunks(text, size, overlap)),
            ChunkingStrategy::Recursive => boundary::recursive_chunks(text, size, overlap),
            ChunkingStrategy::SlidingWindow => Ok(sliding_window_chunks(text, size, overlap)),
            ChunkingStrategy::Contextual => boundary::contextual_chunks(text, size, overlap),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChunkError {
    #[error("recursive split exceeded maximum depth {0}")]
    DepthExceeded(usize),
    #[error("chunker produced no fragments")]
    Empty,
}

/// One chunk of text, tagged with the section it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct TextFragment {
    pub text: String,
    pub section_title: Option<String>,
}

/// Configured chunker with its fallback policy.
#[derive(Debug, Clone)]
pub struct Chunker {
    pub strategy: ChunkingStrategy,
    pub size: usize,
    pub overlap: usize,
    pub section_aware: bool,
    pub section_context_words: usize,
}

impl Chunker {
    pub fn new(strategy: ChunkingStrategy, size: usize, overlap: usize) -> Self {
        Self {
            strategy,
            size,
            overlap,
            section_aware: false,
            section_context_words: 0,
        }
    }

    pub fn from_config(config: &ChunkingConfig) -> Self {
        Self {
            strategy: config.strategy,
            size: config.chunk_size,
            overlap: config.chunk_overlap,
            section_aware: config.section_aware,
            section_context_words: config.section_context_words,
        }
    }

    /// Strategies tried in order; the first non-empty success wins.
    pub fn fallback_order(&self) -> Vec<ChunkingStrategy> {
        let mut order = vec![self.strategy];
        if self.strategy != ChunkingStrategy::Fixed {
            order.push(ChunkingStrategy::Fixed);
        }
        order
    }

    /// Chunk `text`. Never fails: strategy errors fall through to the next
    /// strategy in [`Chunker::fallback_order`].
    pub fn chunk(&self, text: &str) -> Vec<TextFragment> {
        if text.trim().is_empty() {
            return Vec::new();
        }
        for strategy in self.fallback_order() {
            match self.run(strategy, text) {
                Ok(fragments) if !fragments.is_empty() => return fragments,
                Ok(_) => warn!(strategy = strategy.as_str(), "chunker produced no fragments"),
                Err(e) => warn!(strategy = strategy.as_str(), error = %e, "chunker failed, falling back"),
            }
        }
        Vec::new()
    }

    fn run(&self, strategy: ChunkingStrategy, text: &str) -> Result<Vec<TextFragment>, ChunkError> {
        if self.section_aware {
            return chunk_by_sections(
                text,
                strategy,
                self.size,
                self.overlap,
                self.section_context_words,
            );
        }
        let pieces = strategy.split(text, self.size, self.overlap)?;
        Ok(pieces
            .into_iter()
            .map(|text| TextFragment {
                text,
                section_title: None,
            })
            .collect())
    }
}

pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Split text into sentences at `.`, `!` or `?` followed by whitespace, and at
/// line breaks. Returned slices are trimmed and non-empty.
pub fn split_sentences(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0usize;
    let mut chars = text.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        let cut = match c {
            '\n' => Some(i),
            '.' | '!' | '?' => match chars.peek() {
                None => None,
                Some((_, next)) if next.is_whitespace() => Some(i + c.len_utf8()),
                _ => None,
            },
            _ => None,
        };
        if let Some(end) = cut {
            let piece = text[start..end].trim();
            if !piece.is_empty() {
                out.push(piece);
            }
            start = end;
        }
    }
    let tail = text[start..].trim();
    if !tail.is_empty() {
        out.push(tail);
    }
    out
}

/// Split a piece that is larger than `size` words into `size`-word runs.
pub(crate) fn hard_split(text: &str, size: usize) -> Vec<String> {
    let words: Vec<&str> = text.split_whitespace().collect();
    words.chunks(size.max(1)).map(|w| w.join(" ")).collect()
}

/// Greedy sentence packing with trailing-sentence overlap.
pub fn fixed_chunks(text: &str, size: usize, overlap: usize) -> Vec<String> {
    let size = size.max(1);
    let mut sentences: Vec<(String, usize)> = Vec::new();
    for sentence in split_sentences(text) {
        let words = word_count(sentence);
        if words > size {
            sentences.extend(hard_split(sentence, size).into_iter().map(|s| {
                let n = word_count(&s);
                (s, n)
            }));
        } else {
            sentences.push((sentence.to_string(), words));
        }
    }

    let mut chunks = Vec::new();
    let mut current: Vec<(String, usize)> = Vec::new();
    let mut current_words = 0usize;

    for (sentence, words) in sentences {
        if current_words + words > size && !current.is_empty() {
            chunks.push(join_sentences(&current));
            let mut carry: Vec<(String, usize)> = Vec::new();
            let mut carry_words = 0usize;
            for (s, w) in current.iter().rev() {
                if carry_words + w > overlap {
                    break;
                }
                carry_words += w;
                carry.push((s.clone(), *w));
            }
            carry.reverse();
            if carry_words + words > size {
                carry.clear();
                carry_words = 0;
            }
            current = carry;
            current_words = carry_words;
        }
        current_words += words;
        current.push((sentence, words));
    }
    if !current.is_empty() {
        chunks.push(join_sentences(&current));
    }
    chunks
}

fn join_sentences(sentences: &[(String, usize)]) -> String {
    sentences
        .iter()
        .map(|(s, _)| s.as_str())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Fixed-stride windows over the word sequence.
///
/// A trailing window shorter than half of `size` is not emitted on its own;
/// the last window is instead re-anchored to end at the final word, so it
/// stays within `size` while covering the tail.
pub fn sliding_window_chunks(text: &str, size: usize, overlap: usize) -> Vec<String> {
    let size = size.max(1);
    let overlap = overlap.min(size - 1);
    let words: Vec<&str> = text.split_whitespace().collect();
    let n = words.len();
    if n == 0 {
        return Vec::new();
    }
    if n <= size {
        return vec![words.join(" ")];
    }
    let stride = size - overlap;
    let mut chunks = Vec::new();
    let mut start = 0usize;
    loop {
        let mut end = (start + size).min(n);
        if end == n && start > 0 && end - start < size.div_ceil(2) {
            start = n - size;
            end = n;
        }
        chunks.push(words[start..end].join(" "));
        if end == n {
            break;
        }
        start += stride;
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(n: usize, prefix: &str) -> String {
        (0..n)
            .map(|i| format!("{prefix}{i}"))
            .collect::<Vec<_>>()
            .join(" ")
    }

    const STRATEGIES: [ChunkingStrategy; 5] = [
        ChunkingStrategy::Fixed,
        ChunkingStrategy::Semantic,
        ChunkingStrategy::Recursive,
        ChunkingStrategy::SlidingWindow,
        ChunkingStrategy::Contextual,
    ];

    fn sample_document() -> String {
        let mut doc = String::from("# Overview\n\n");
        for p in 0..6 {
            for s in 0..5 {
                doc.push_str(&format!("Paragraph {p} sentence {s} talks about storage engines. "));
            }
            doc.push_str("\n\n");
        }
        doc.push_str("## Details\n\nSHORT CAPS HEADING\n\n");
        doc.push_str(&words(120, "w"));
        doc
    }

    #[test]
    fn sentences_split_on_terminators_and_newlines() {
        let s = split_sentences("One. Two! Three?\nFour v1.2 stays\n\nFive.");
        assert_eq!(s, vec!["One.", "Two!", "Three?", "Four v1.2 stays", "Five."]);
    }

    #[test]
    fn every_strategy_respects_size() {
        let doc = sample_document();
        for strategy in STRATEGIES {
            let chunks = strategy.split(&doc, 40, 8).unwrap();
            assert!(!chunks.is_empty(), "{strategy:?} produced nothing");
            for c in &chunks {
                assert!(word_count(c) <= 40, "{strategy:?} chunk too large: {}", word_count(c));
                assert!(!c.trim().is_empty());
            }
        }
    }

    #[test]
    fn every_strategy_keeps_all_words() {
        let doc = sample_document();
        for strategy in STRATEGIES {
            let joined = strategy.split(&doc, 40, 8).unwrap().join(" ");
            for w in ["Overview", "Details", "w0", "w119", "HEADING"] {
                assert!(joined.contains(w), "{strategy:?} dropped {w}");
            }
        }
    }

    #[test]
    fn fixed_small_text_single_chunk() {
        let chunks = fixed_chunks("Hello, world!", 100, 10);
        assert_eq!(chunks, vec!["Hello, world!".to_string()]);
    }

    #[test]
    fn fixed_carries_trailing_sentence_overlap() {
        let text = "a b c. d e f. g h i. j k l.";
        let chunks = fixed_chunks(text, 6, 3);
        assert_eq!(chunks[0], "a b c. d e f.");
        assert!(chunks[1].starts_with("d e f."));
    }

    #[test]
    fn fixed_hard_splits_long_sentences() {
        let chunks = fixed_chunks(&words(25, "x"), 10, 0);
        assert_eq!(chunks.len(), 3);
        assert_eq!(word_count(&chunks[2]), 5);
    }

    #[test]
    fn sliding_window_stride_and_tail() {
        let text = words(22, "t");
        let chunks = sliding_window_chunks(&text, 10, 2);
        // windows at 0, 8, then the 6-word tail at 16 is kept (>= size/2)
        assert_eq!(chunks.len(), 3);
        assert!(chunks[1].starts_with("t8 "));
        assert!(chunks[2].ends_with("t21"));

        let text = words(19, "t");
        let chunks = sliding_window_chunks(&text, 10, 2);
        // tail at 16 would hold 3 words: re-anchored to [9, 19)
        assert_eq!(chunks.len(), 3);
        assert!(chunks[2].starts_with("t9 "));
        assert_eq!(word_count(&chunks[2]), 10);
    }

    #[test]
    fn sliding_window_short_text_one_window() {
        assert_eq!(sliding_window_chunks("a b c", 10, 2), vec!["a b c".to_string()]);
        assert!(sliding_window_chunks("   ", 10, 2).is_empty());
    }

    #[test]
    fn chunker_falls_back_to_fixed() {
        let chunker = Chunker::new(ChunkingStrategy::Recursive, 5, 1);
        assert_eq!(
            chunker.fallback_order(),
            vec![ChunkingStrategy::Recursive, ChunkingStrategy::Fixed]
        );
        let fixed = Chunker::new(ChunkingStrategy::Fixed, 5, 1);
        assert_eq!(fixed.fallback_order(), vec![ChunkingStrategy::Fixed]);
    }

    #[test]
    fn chunker_empty_text_no_fragments() {
        let chunker = Chunker::new(ChunkingStrategy::Semantic, 50, 5);
        assert!(chunker.chunk("  \n ").is_empty());
    }

    #[test]
    fn chunker_section_aware_tags_titles() {
        let mut chunker = Chunker::new(ChunkingStrategy::Semantic, 50, 5);
        chunker.section_aware = true;
        chunker.section_context_words = 3;
        let text = "# Alpha\nalpha text here.\n\n# Beta\nbeta text here.";
        let frags = chunker.chunk(text);
        assert_eq!(frags.len(), 2);
        assert_eq!(frags[0].section_title.as_deref(), Some("Alpha"));
        assert_eq!(frags[1].section_title.as_deref(), Some("Beta"));
    }

    #[test]
    fn deterministic() {
        let doc = sample_document();
        for strategy in STRATEGIES {
            assert_eq!(
                strategy.split(&doc, 30, 5).unwrap(),
                strategy.split(&doc, 30, 5).unwrap()
            );
        }
    }
}
