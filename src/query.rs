//! Query expansion.
//!
//! A query is rewritten into a handful of alternative phrasings, each searched
//! independently. The original query is always the first variant.

use std::collections::HashMap;
use std::sync::LazyLock;

use crate::preprocess::is_stopword;

/// Upper bound on variants, the original included.
pub const MAX_VARIANTS: usize = 5;

static THESAURUS: LazyLock<HashMap<&'static str, &'static [&'static str]>> = LazyLock::new(|| {
    HashMap::from([
        ("error", &["failure", "fault"][..]),
        ("bug", &["defect", "error"][..]),
        ("fix", &["repair", "resolve"][..]),
        ("fast", &["quick", "rapid"][..]),
        ("quick", &["fast", "rapid"][..]),
        ("slow", &["sluggish", "delayed"][..]),
        ("big", &["large", "huge"][..]),
        ("large", &["big", "huge"][..]),
        ("small", &["little", "minor"][..]),
        ("start", &["begin", "launch"][..]),
        ("stop", &["halt", "end"][..]),
        ("buy", &["purchase", "acquire"][..]),
        ("sell", &["vend", "trade"][..]),
        ("cost", &["price", "expense"][..]),
        ("price", &["cost", "rate"][..]),
        ("revenue", &["income", "sales"][..]),
        ("profit", &["earnings", "gain"][..]),
        ("employee", &["staff", "worker"][..]),
        ("customer", &["client", "buyer"][..]),
        ("car", &["automobile", "vehicle"][..]),
        ("house", &["home", "dwelling"][..]),
        ("doctor", &["physician", "clinician"][..]),
        ("help", &["assist", "support"][..]),
        ("show", &["display", "present"][..]),
        ("find", &["locate", "discover"][..]),
        ("make", &["create", "build"][..]),
        ("create", &["make", "build"][..]),
        ("delete", &["remove", "erase"][..]),
        ("remove", &["delete", "eliminate"][..]),
        ("change", &["modify", "alter"][..]),
        ("problem", &["issue", "trouble"][..]),
        ("issue", &["problem", "concern"][..]),
        ("result", &["outcome", "finding"][..]),
        ("goal", &["objective", "aim"][..]),
        ("plan", &["strategy", "scheme"][..]),
        ("report", &["summary", "account"][..]),
        ("document", &["file", "paper"][..]),
        ("method", &["approach", "technique"][..]),
        ("increase", &["rise", "growth"][..]),
        ("decrease", &["decline", "drop"][..]),
        ("important", &["significant", "key"][..]),
        ("fox", &["vixen", "reynard"][..]),
        ("dog", &["hound", "canine"][..]),
    ])
});

static ABBREVIATIONS: LazyLock<HashMap<&'static str, &'static str>> = LazyLock::new(|| {
    HashMap::from([
        ("ai", "artificial intelligence"),
        ("ml", "machine learning"),
        ("nlp", "natural language processing"),
        ("llm", "large language model"),
        ("rag", "retrieval augmented generation"),
        ("api", "application programming interface"),
        ("db", "database"),
        ("kb", "knowledge base"),
        ("ui", "user interface"),
        ("ux", "user experience"),
        ("os", "operating system"),
        ("cpu", "central processing unit"),
        ("gpu", "graphics processing unit"),
        ("faq", "frequently asked questions"),
        ("hr", "human resources"),
        ("roi", "return on investment"),
        ("kpi", "key performance indicator"),
        ("ceo", "chief executive officer"),
        ("cfo", "chief financial officer"),
        ("yoy", "year over year"),
        ("qoq", "quarter over quarter"),
        ("eta", "estimated time of arrival"),
        ("sla", "service level agreement"),
        ("pdf", "portable document format"),
        ("csv", "comma separated values"),
    ])
});

fn bare(word: &str) -> String {
    word.trim_matches(|c: char| !c.is_alphanumeric())
        .to_lowercase()
}

/// Up to [`MAX_VARIANTS`] distinct phrasings of `query`, the original first:
/// reversed word order, one thesaurus substitution, abbreviation expansion
/// and the query without its last word.
pub fn expand_query(query: &str) -> Vec<String> {
    let original = query.trim().to_string();
    let mut variants = vec![original.clone()];
    let words: Vec<&str> = original.split_whitespace().collect();
    if words.is_empty() {
        return variants;
    }

    let mut push = |candidate: String| {
        let key = candidate.to_lowercase();
        if !candidate.is_empty()
            && variants.len() < MAX_VARIANTS
            && !variants.iter().any(|v| v.to_lowercase() == key)
        {
            variants.push(candidate);
        }
    };

    if words.len() >= 2 {
        push(words.iter().rev().copied().collect::<Vec<_>>().join(" "));
    }

    if let Some(pos) = words.iter().position(|w| {
        let b = bare(w);
        !is_stopword(&b) && THESAURUS.contains_key(b.as_str())
    }) {
        let b = bare(words[pos]);
        if let Some(syn) = THESAURUS.get(b.as_str()).and_then(|s| s.first()) {
            let mut replaced: Vec<&str> = words.clone();
            replaced[pos] = *syn;
            push(replaced.join(" "));
        }
    }

    let mut expanded_any = false;
    let expanded: Vec<String> = words
        .iter()
        .map(|w| match ABBREVIATIONS.get(bare(w).as_str()) {
            Some(full) => {
                expanded_any = true;
                (*full).to_string()
            }
            None => (*w).to_string(),
        })
        .collect();
    if expanded_any {
        push(expanded.join(" "));
    }

    if words.len() >= 2 {
        push(words[..words.len() - 1].join(" "));
    }

    variants
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn original_always_first() {
        for q in ["fox", "quick brown fox jumps", "", "ML api errors in prod"] {
            let v = expand_query(q);
            assert_eq!(v[0], q.trim());
            assert!(v.len() <= MAX_VARIANTS);
        }
    }

    #[test]
    fn produces_each_kind_of_variant() {
        let v = expand_query("fix ml pipeline");
        assert!(v.contains(&"pipeline ml fix".to_string()));
        assert!(v.contains(&"repair ml pipeline".to_string()));
        assert!(v.contains(&"fix machine learning pipeline".to_string()));
        assert!(v.contains(&"fix ml".to_string()));
    }

    #[test]
    fn two_word_query_gets_shortened_variant() {
        let v = expand_query("zebra crossing");
        assert_eq!(
            v,
            vec![
                "zebra crossing".to_string(),
                "crossing zebra".to_string(),
                "zebra".to_string()
            ]
        );
    }

    #[test]
    fn single_word_without_tables_is_just_original() {
        assert_eq!(expand_query("zebra"), vec!["zebra".to_string()]);
    }

    #[test]
    fn variants_are_distinct() {
        let v = expand_query("dog dog");
        let mut lowered: Vec<String> = v.iter().map(|s| s.to_lowercase()).collect();
        lowered.sort();
        lowered.dedup();
        assert_eq!(lowered.len(), v.len());
    }
}
