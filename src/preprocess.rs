//! Text cleaning, keyword extraction, language detection and section-title
//! detection.
//!
//! [`clean_text`] is a pure function and idempotent. The other operations live
//! on [`TextPreprocessor`], which memoizes keyword and language results in
//! bounded LRU caches keyed by content hash.

use lru::LruCache;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::{LazyLock, Mutex};
use unicode_normalization::UnicodeNormalization;

/// Texts shorter than this (in chars, after trimming) are tagged `"en"`.
const MIN_LANGUAGE_CHARS: usize = 20;
/// Language detection only looks at this many leading chars.
const LANGUAGE_SAMPLE_CHARS: usize = 2000;
/// Share of letters a non-Latin script needs before it decides the language.
const SCRIPT_SHARE_THRESHOLD: f32 = 0.3;
const DEFAULT_LANGUAGE: &str = "en";

pub const STOPWORDS: &[&str] = &[
    "a", "about", "above", "after", "again", "against", "all", "am", "an", "and", "any", "are",
    "as", "at", "be", "because", "been", "before", "being", "below", "between", "both", "but",
    "by", "can", "could", "did", "do", "does", "doing", "down", "during", "each", "few", "for",
    "from", "further", "had", "has", "have", "having", "he", "her", "here", "hers", "herself",
    "him", "himself", "his", "how", "i", "if", "in", "into", "is", "it", "its", "itself", "just",
    "me", "more", "most", "my", "myself", "no", "nor", "not", "now", "of", "off", "on", "once",
    "only", "or", "other", "our", "ours", "ourselves", "out", "over", "own", "same", "she",
    "should", "so", "some", "such", "than", "that", "the", "their", "theirs", "them",
    "themselves", "then", "there", "these", "they", "this", "those", "through", "to", "too",
    "under", "until", "up", "very", "was", "we", "were", "what", "when", "where", "which",
    "while", "who", "whom", "why", "will", "with", "would", "you", "your", "yours", "yourself",
    "yourselves", "also", "may", "might", "must", "shall", "upon", "via",
];

static STOPWORD_SET: LazyLock<HashSet<&'static str>> =
    LazyLock::new(|| STOPWORDS.iter().copied().collect());

static MARKDOWN_HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s{0,3}#{1,6}\s+(.+?)\s*#*\s*$").expect("valid regex"));
static NUMBERED_HEADING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d+(?:\.\d+)*\.?\s+[A-Z][^\n]{0,80}$").expect("valid regex")
});
static ROMAN_HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[IVXLC]+\.\s+\S[^\n]{0,80}$").expect("valid regex"));
static NAMED_HEADING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?i:chapter|section|part|appendix)\s+[\dIVXLCA-Z]+\b[^\n]{0,80}$")
        .expect("valid regex")
});

pub fn is_stopword(word: &str) -> bool {
    STOPWORD_SET.contains(word)
}

/// SHA-256 hex digest of a string, used as the cache key for derived data.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Normalize unicode (NFKC), drop control and zero-width characters, collapse
/// runs of horizontal whitespace, trim every line and squeeze blank-line runs
/// down to a single paragraph break.
///
/// `clean_text(clean_text(x)) == clean_text(x)` for every input.
pub fn clean_text(text: &str) -> String {
    let stripped: String = text
        .replace("\r\n", "\n")
        .replace('\r', "\n")
        .chars()
        .filter(|c| !is_invisible(*c))
        .collect();
    let normalized: String = stripped.nfkc().collect();

    let mut out = String::with_capacity(normalized.len());
    let mut blank_run = 0usize;
    for line in normalized.split('\n') {
        let collapsed = collapse_spaces(line);
        if collapsed.is_empty() {
            blank_run += 1;
            continue;
        }
        if !out.is_empty() {
            out.push_str(if blank_run > 0 { "\n\n" } else { "\n" });
        }
        out.push_str(&collapsed);
        blank_run = 0;
    }
    out
}

fn is_invisible(c: char) -> bool {
    if c == '\n' || c == '\t' {
        return false;
    }
    c.is_control() || matches!(c, '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{2060}' | '\u{FEFF}')
}

fn collapse_spaces(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    for word in line.split(|c: char| c.is_whitespace()) {
        if word.is_empty() {
            continue;
        }
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(word);
    }
    out
}

/// Lowercased alphanumeric word tokens.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

/// Memoizing text analysis helpers.
pub struct TextPreprocessor {
    keyword_cache: Mutex<LruCache<String, Vec<String>>>,
    language_cache: Mutex<LruCache<String, String>>,
}

impl TextPreprocessor {
    pub fn new(cache_capacity: usize) -> Self {
        let cap = NonZeroUsize::new(cache_capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            keyword_cache: Mutex::new(LruCache::new(cap)),
            language_cache: Mutex::new(LruCache::new(cap)),
        }
    }

    /// Up to `max_k` keywords ordered by descending weight.
    ///
    /// Weight is term frequency, halved for terms making up more than a tenth
    /// of a longer text, boosted for longer terms and for terms that appear
    /// title-cased.
    pub fn extract_keywords(&self, text: &str, max_k: usize) -> Vec<String> {
        if max_k == 0 || text.trim().is_empty() {
            return Vec::new();
        }
        let key = format!("{}:{}", content_hash(text), max_k);
        if let Some(hit) = lock(&self.keyword_cache).get(&key) {
            return hit.clone();
        }

        let mut counts: HashMap<String, usize> = HashMap::new();
        let mut title_cased: HashSet<String> = HashSet::new();
        let mut total = 0usize;
        for raw in text.split(|c: char| !c.is_alphanumeric()) {
            if raw.is_empty() {
                continue;
            }
            total += 1;
            let term = raw.to_lowercase();
            if term.chars().count() < 3 || is_stopword(&term) || term.chars().all(|c| c.is_numeric())
            {
                continue;
            }
            let mut chars = raw.chars();
            if chars.next().is_some_and(char::is_uppercase) && chars.all(char::is_lowercase) {
                title_cased.insert(term.clone());
            }
            *counts.entry(term).or_insert(0) += 1;
        }

        let mut scored: Vec<(String, f32)> = counts
            .into_iter()
            .map(|(term, count)| {
                let tf = count as f32 / total.max(1) as f32;
                let mut score = tf;
                if total >= 20 && tf > 0.1 {
                    score *= 0.5;
                }
                let len = term.chars().count().min(12) as f32;
                score *= 1.0 + 0.5 * len / 12.0;
                if title_cased.contains(&term) {
                    score *= 1.3;
                }
                (term, score)
            })
            .collect();
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        let keywords: Vec<String> = scored.into_iter().take(max_k).map(|(t, _)| t).collect();

        lock(&self.keyword_cache).put(key, keywords.clone());
        keywords
    }

    /// ISO 639-1 style tag for the dominant language of `text`.
    pub fn detect_language(&self, text: &str) -> String {
        let sample: String = text.chars().take(LANGUAGE_SAMPLE_CHARS).collect();
        if sample.trim().chars().count() < MIN_LANGUAGE_CHARS {
            return DEFAULT_LANGUAGE.to_string();
        }
        let key = content_hash(&sample);
        if let Some(hit) = lock(&self.language_cache).get(&key) {
            return hit.clone();
        }

        let lang = detect_statistical(&sample)
            .or_else(|| detect_by_script(&sample))
            .unwrap_or_else(|| DEFAULT_LANGUAGE.to_string());

        lock(&self.language_cache).put(key, lang.clone());
        lang
    }
}

impl Default for TextPreprocessor {
    fn default() -> Self {
        Self::new(1000)
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(feature = "lang-detect")]
fn detect_statistical(text: &str) -> Option<String> {
    let info = whatlang::detect(text)?;
    if !info.is_reliable() {
        return None;
    }
    Some(iso639_1(info.lang().code()).to_string())
}

#[cfg(not(feature = "lang-detect"))]
fn detect_statistical(_text: &str) -> Option<String> {
    None
}

#[cfg(feature = "lang-detect")]
fn iso639_1(code: &'static str) -> &'static str {
    match code {
        "eng" => "en",
        "rus" => "ru",
        "ukr" => "uk",
        "cmn" => "zh",
        "jpn" => "ja",
        "kor" => "ko",
        "ara" => "ar",
        "spa" => "es",
        "fra" => "fr",
        "deu" => "de",
        "ita" => "it",
        "por" => "pt",
        "nld" => "nl",
        "pol" => "pl",
        "tur" => "tr",
        "hin" => "hi",
        "heb" => "he",
        "ell" => "el",
        "swe" => "sv",
        "dan" => "da",
        "fin" => "fi",
        other => other,
    }
}

/// Character-range heuristic for non-Latin scripts.
fn detect_by_script(text: &str) -> Option<String> {
    let mut letters = 0usize;
    let mut counts: HashMap<&'static str, usize> = HashMap::new();
    for c in text.chars().filter(|c| c.is_alphabetic()) {
        letters += 1;
        let tag = match c as u32 {
            0x0400..=0x04FF => "ru",
            0x3040..=0x30FF => "ja",
            0xAC00..=0xD7AF | 0x1100..=0x11FF => "ko",
            0x4E00..=0x9FFF | 0x3400..=0x4DBF => "zh",
            0x0600..=0x06FF | 0x0750..=0x077F => "ar",
            0x0370..=0x03FF => "el",
            0x0590..=0x05FF => "he",
            0x0900..=0x097F => "hi",
            _ => continue,
        };
        *counts.entry(tag).or_insert(0) += 1;
    }
    if letters == 0 {
        return None;
    }
    // Kana marks Japanese even when kanji outnumber it.
    if counts.get("ja").copied().unwrap_or(0) > 0 && counts.contains_key("zh") {
        let cjk = counts["ja"] + counts["zh"];
        if cjk as f32 / letters as f32 >= SCRIPT_SHARE_THRESHOLD {
            return Some("ja".to_string());
        }
    }
    counts
        .into_iter()
        .filter(|(_, n)| *n as f32 / letters as f32 >= SCRIPT_SHARE_THRESHOLD)
        .max_by_key(|(_, n)| *n)
        .map(|(tag, _)| tag.to_string())
}

/// Byte offsets and titles of heading-like lines, in document order.
///
/// Recognizes markdown headings, numbered (`2.1 Scope`) and roman-numeral
/// (`IV. Results`) headings, `Chapter/Section N` lines and short ALL-CAPS lines.
pub fn detect_section_titles(text: &str) -> Vec<(usize, String)> {
    let mut titles = Vec::new();
    let mut offset = 0usize;
    for line in text.split('\n') {
        let line_start = offset;
        offset += line.len() + 1;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(caps) = MARKDOWN_HEADING.captures(line) {
            titles.push((line_start, caps[1].trim().to_string()));
            continue;
        }
        if is_heading_line(trimmed) {
            titles.push((line_start, trimmed.to_string()));
        }
    }
    titles
}

/// Number of `#` marks when `line` is a markdown heading.
pub fn markdown_heading_level(line: &str) -> Option<usize> {
    if !MARKDOWN_HEADING.is_match(line) {
        return None;
    }
    Some(line.trim_start().chars().take_while(|c| *c == '#').count())
}

/// True for a non-markdown heading line (numbered, roman, named or ALL-CAPS).
pub fn is_heading_line(trimmed: &str) -> bool {
    let words = trimmed.split_whitespace().count();
    if words > 12 || trimmed.ends_with('.') && words > 3 {
        return false;
    }
    NUMBERED_HEADING.is_match(trimmed)
        || ROMAN_HEADING.is_match(trimmed)
        || NAMED_HEADING.is_match(trimmed)
        || is_all_caps_heading(trimmed)
}

fn is_all_caps_heading(line: &str) -> bool {
    let len = line.chars().count();
    if !(3..=80).contains(&len) || line.split_whitespace().count() > 10 {
        return false;
    }
    if line.ends_with('.') || line.ends_with(',') || line.ends_with(';') {
        return false;
    }
    let letters: Vec<char> = line.chars().filter(|c| c.is_alphabetic()).collect();
    letters.len() >= 2 && letters.iter().all(|c| !c.is_lowercase()) && letters.iter().any(|c| c.is_uppercase())
}
