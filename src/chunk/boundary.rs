//! Boundary-seeking strategies: semantic, recursive and contextual.

use super::{fixed_chunks, hard_split, split_sentences, word_count, ChunkError};
use crate::preprocess::{is_heading_line, markdown_heading_level};

const MAX_RECURSION_DEPTH: usize = 8;

struct Piece {
    sep: &'static str,
    text: String,
    words: usize,
}

#[derive(Default)]
struct Packer {
    pieces: Vec<Piece>,
    words: usize,
    out: Vec<String>,
}

impl Packer {
    fn push(&mut self, sep: &'static str, text: String, words: usize) {
        self.words += words;
        self.pieces.push(Piece { sep, text, words });
    }

    fn render(&self) -> String {
        let mut s = String::new();
        for (i, p) in self.pieces.iter().enumerate() {
            if i > 0 {
                s.push_str(p.sep);
            }
            s.push_str(&p.text);
        }
        s
    }

    fn flush(&mut self) {
        if !self.pieces.is_empty() {
            let rendered = self.render();
            self.out.push(rendered);
        }
        self.pieces.clear();
        self.words = 0;
    }

    /// Flush, then keep trailing pieces totalling at most `overlap` words,
    /// unless they would not leave room for `incoming` words.
    fn flush_with_carry(&mut self, overlap: usize, incoming: usize, size: usize) {
        let mut keep = 0usize;
        let mut kept_words = 0usize;
        for p in self.pieces.iter().rev() {
            if kept_words + p.words > overlap {
                break;
            }
            kept_words += p.words;
            keep += 1;
        }
        let carry: Vec<Piece> = if kept_words + incoming > size {
            Vec::new()
        } else {
            let start = self.pieces.len() - keep;
            self.pieces.drain(start..).collect()
        };
        self.flush();
        for p in carry {
            self.push(p.sep, p.text, p.words);
        }
    }
}

fn is_heading(line: &str) -> bool {
    markdown_heading_level(line).is_some() || is_heading_line(line)
}

fn ends_sentence(text: &str) -> bool {
    text.ends_with(['.', '!', '?'])
}

/// Greedy sentence packing that also breaks at headings, at paragraph ends
/// once a quarter full, and after a sentence once 80% full.
pub(super) fn semantic_chunks(text: &str, size: usize, overlap: usize) -> Vec<String> {
    let early_break = (size * 4).div_ceil(5);
    let mut packer = Packer::default();

    for para in text.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
        for (line_no, line) in para.lines().map(str::trim).filter(|l| !l.is_empty()).enumerate() {
            if is_heading(line) {
                packer.flush();
            }
            let line_sep = if line_no == 0 { "\n\n" } else { "\n" };
            let mut first_in_line = true;
            for sentence in split_sentences(line) {
                let parts = if word_count(sentence) > size {
                    hard_split(sentence, size)
                } else {
                    vec![sentence.to_string()]
                };
                for part in parts {
                    let words = word_count(&part);
                    if packer.words + words > size && !packer.pieces.is_empty() {
                        packer.flush_with_carry(overlap, words, size);
                    }
                    let sep = if first_in_line { line_sep } else { " " };
                    first_in_line = false;
                    let terminal = ends_sentence(&part);
                    packer.push(sep, part, words);
                    if packer.words >= early_break && terminal {
                        packer.flush();
                    }
                }
            }
        }
        if packer.words * 4 >= size {
            packer.flush();
        }
    }
    packer.flush();
    packer.out
}

#[derive(Clone, Copy)]
enum Level {
    LargeHeading,
    SmallHeading,
    CapsHeading,
    Paragraph,
    Sentence,
}

const LEVELS: [Level; 5] = [
    Level::LargeHeading,
    Level::SmallHeading,
    Level::CapsHeading,
    Level::Paragraph,
    Level::Sentence,
];

impl Level {
    fn split(self, text: &str) -> Vec<String> {
        match self {
            Level::LargeHeading => {
                split_before_lines(text, |l| matches!(markdown_heading_level(l), Some(1..=2)))
            }
            Level::SmallHeading => {
                split_before_lines(text, |l| markdown_heading_level(l).is_some_and(|n| n >= 3))
            }
            Level::CapsHeading => split_before_lines(text, |l| is_heading_line(l.trim())),
            Level::Paragraph => text
                .split("\n\n")
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect(),
            Level::Sentence => split_sentences(text).into_iter().map(str::to_string).collect(),
        }
    }

    fn joiner(self) -> &'static str {
        match self {
            Level::Sentence => " ",
            _ => "\n\n",
        }
    }
}

fn split_before_lines(text: &str, is_boundary: impl Fn(&str) -> bool) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    for line in text.split('\n') {
        if is_boundary(line) && current.iter().any(|l| !l.trim().is_empty()) {
            pieces.push(current.join("\n"));
            current.clear();
        }
        current.push(line);
    }
    pieces.push(current.join("\n"));
    pieces
        .into_iter()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

/// Join adjacent pieces while the result stays within `size` words.
fn merge_small(pieces: Vec<String>, size: usize, joiner: &str) -> Vec<String> {
    let mut merged: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut current_words = 0usize;
    for piece in pieces {
        let words = word_count(&piece);
        if !current.is_empty() && current_words + words > size {
            merged.push(std::mem::take(&mut current));
            current_words = 0;
        }
        if !current.is_empty() {
            current.push_str(joiner);
        }
        current.push_str(&piece);
        current_words += words;
    }
    if !current.is_empty() {
        merged.push(current);
    }
    merged
}

/// Split on the strongest boundary available, recursing into pieces that are
/// still over budget. Falls back to fixed-size chunks when no boundary splits
/// the text.
pub(super) fn recursive_chunks(
    text: &str,
    size: usize,
    overlap: usize,
) -> Result<Vec<String>, ChunkError> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(Vec::new());
    }
    recurse(text, size, overlap, 0, 0)
}

fn recurse(
    text: &str,
    size: usize,
    overlap: usize,
    first_level: usize,
    depth: usize,
) -> Result<Vec<String>, ChunkError> {
    if depth > MAX_RECURSION_DEPTH {
        return Err(ChunkError::DepthExceeded(MAX_RECURSION_DEPTH));
    }
    if word_count(text) <= size {
        return Ok(vec![text.to_string()]);
    }
    for (offset, level) in LEVELS.iter().enumerate().skip(first_level) {
        let pieces = level.split(text);
        if pieces.len() < 2 {
            continue;
        }
        let mut out = Vec::new();
        for piece in merge_small(pieces, size, level.joiner()) {
            if word_count(&piece) > size {
                out.extend(recurse(&piece, size, overlap, offset + 1, depth + 1)?);
            } else {
                out.push(piece);
            }
        }
        return Ok(out);
    }
    Ok(fixed_chunks(text, size, overlap))
}

/// Pack whole paragraphs; paragraphs over budget are split recursively.
pub(super) fn contextual_chunks(
    text: &str,
    size: usize,
    overlap: usize,
) -> Result<Vec<String>, ChunkError> {
    let mut out = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut current_words = 0usize;
    for para in text.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
        let words = word_count(para);
        if words > size {
            if !current.is_empty() {
                out.push(current.join("\n\n"));
                current.clear();
                current_words = 0;
            }
            out.extend(recursive_chunks(para, size, overlap)?);
            continue;
        }
        if current_words + words > size && !current.is_empty() {
            out.push(current.join("\n\n"));
            current.clear();
            current_words = 0;
        }
        current.push(para);
        current_words += words;
    }
    if !current.is_empty() {
        out.push(current.join("\n\n"));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn semantic_breaks_at_headings() {
        let text = "intro line one.\n# Heading\nbody text follows here.";
        let chunks = semantic_chunks(text, 100, 0);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], "intro line one.");
        assert!(chunks[1].starts_with("# Heading"));
    }

    #[test]
    fn semantic_breaks_at_paragraph_when_quarter_full() {
        let text = "one two three four five six.\n\nseven eight.";
        let chunks = semantic_chunks(text, 20, 0);
        assert_eq!(chunks.len(), 2);
        let tiny = semantic_chunks("one.\n\ntwo.", 20, 0);
        assert_eq!(tiny, vec!["one.\n\ntwo.".to_string()]);
    }

    #[test]
    fn semantic_breaks_early_when_nearly_full() {
        let text = "a b c d e f g h. i j.";
        let chunks = semantic_chunks(text, 10, 0);
        assert_eq!(chunks[0], "a b c d e f g h.");
    }

    #[test]
    fn recursive_prefers_headings() {
        let body = "word ".repeat(30);
        let text = format!("# One\n{body}\n# Two\n{body}");
        let chunks = recursive_chunks(&text, 40, 0).unwrap();
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].starts_with("# One"));
        assert!(chunks[1].starts_with("# Two"));
    }

    #[test]
    fn recursive_merges_small_pieces() {
        let text = "a.\n\nb.\n\nc.\n\nd.";
        let chunks = recursive_chunks(text, 3, 0).unwrap();
        assert_eq!(chunks, vec!["a.\n\nb.\n\nc.".to_string(), "d.".to_string()]);
    }

    #[test]
    fn recursive_falls_back_to_fixed_without_boundaries() {
        let text = "x ".repeat(25);
        let chunks = recursive_chunks(&text, 10, 0).unwrap();
        assert_eq!(chunks.len(), 3);
    }

    #[test]
    fn contextual_keeps_paragraphs_whole() {
        let text = "alpha beta gamma.\n\ndelta epsilon.\n\nzeta eta theta iota.";
        let chunks = contextual_chunks(text, 6, 0).unwrap();
        assert_eq!(
            chunks,
            vec![
                "alpha beta gamma.\n\ndelta epsilon.".to_string(),
                "zeta eta theta iota.".to_string()
            ]
        );
    }

    #[test]
    fn split_before_lines_keeps_heading_with_body() {
        let pieces = split_before_lines("pre\n# A\nbody a\n# B\nbody b", |l| l.starts_with('#'));
        assert_eq!(pieces, vec!["pre", "# A\nbody a", "# B\nbody b"]);
    }
}
