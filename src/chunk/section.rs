//! Section-aware chunking.
//!
//! Splits text at detected section titles, chunks each section with the inner
//! strategy and tags every fragment with its section title. The first fragment
//! of a section is prefixed with the closing words of the previous section,
//! bounded by the remaining word budget.

use super::{word_count, ChunkError, ChunkingStrategy, TextFragment};
use crate::preprocess::detect_section_titles;

pub fn chunk_by_sections(
    text: &str,
    strategy: ChunkingStrategy,
    size: usize,
    overlap: usize,
    context_words: usize,
) -> Result<Vec<TextFragment>, ChunkError> {
    let titles = detect_section_titles(text);

    let mut bounds: Vec<(usize, Option<String>)> = Vec::with_capacity(titles.len() + 1);
    if titles.first().map_or(true, |(offset, _)| *offset > 0) {
        bounds.push((0, None));
    }
    bounds.extend(titles.into_iter().map(|(offset, title)| (offset, Some(title))));

    let mut fragments = Vec::new();
    let mut previous_body: Option<&str> = None;
    for (i, (start, title)) in bounds.iter().enumerate() {
        let end = bounds.get(i + 1).map_or(text.len(), |(next, _)| *next);
        let body = text[*start..end].trim();
        if body.is_empty() {
            continue;
        }
        let mut pieces = strategy.split(body, size, overlap)?;
        if let (Some(prev), Some(first)) = (previous_body, pieces.first_mut()) {
            let budget = size.saturating_sub(word_count(first)).min(context_words);
            if budget > 0 {
                let words: Vec<&str> = prev.split_whitespace().collect();
                let tail = words[words.len().saturating_sub(budget)..].join(" ");
                *first = format!("{tail}\n\n{first}");
            }
        }
        fragments.extend(pieces.into_iter().map(|text| TextFragment {
            text,
            section_title: title.clone(),
        }));
        previous_body = Some(body);
    }

    if fragments.is_empty() {
        return Err(ChunkError::Empty);
    }
    Ok(fragments)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preamble_has_no_title() {
        let text = "Preamble words.\n\n# First\nbody one.";
        let frags = chunk_by_sections(text, ChunkingStrategy::Fixed, 50, 0, 0).unwrap();
        assert_eq!(frags.len(), 2);
        assert_eq!(frags[0].section_title, None);
        assert_eq!(frags[1].section_title.as_deref(), Some("First"));
    }

    #[test]
    fn context_from_previous_section_within_budget() {
        let text = "# A\none two three four.\n# B\nfive six.";
        let frags = chunk_by_sections(text, ChunkingStrategy::Fixed, 6, 0, 2).unwrap();
        let last = frags.last().unwrap();
        assert_eq!(last.section_title.as_deref(), Some("B"));
        assert!(last.text.starts_with("three four.\n\n# B"));
        assert!(word_count(&last.text) <= 6);
    }

    #[test]
    fn no_context_when_budget_exhausted() {
        let text = "# A\nalpha beta.\n# B\none two three four five.";
        let frags = chunk_by_sections(text, ChunkingStrategy::Fixed, 7, 0, 5).unwrap();
        let last = frags.last().unwrap();
        assert!(last.text.starts_with("# B"));
    }

    #[test]
    fn text_without_titles_is_one_section() {
        let frags =
            chunk_by_sections("just some words.", ChunkingStrategy::Semantic, 10, 0, 5).unwrap();
        assert_eq!(frags.len(), 1);
        assert_eq!(frags[0].section_title, None);
    }

    #[test]
    fn blank_text_is_an_error() {
        assert!(chunk_by_sections("   ", ChunkingStrategy::Fixed, 10, 0, 5).is_err());
    }
}
