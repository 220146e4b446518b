//! Closed-vocabulary language and confidence heuristics for recognized text.
//!
//! Field documents come in a small known set of languages, so detection
//! counts function words per candidate language instead of running a full
//! language-identification model.

use std::sync::LazyLock;

use regex::Regex;

static WORD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\p{L}+").expect("static regex"));

const FUNCTION_WORDS: &[(&str, &[&str])] = &[
    (
        "en",
        &["the", "and", "of", "is", "with", "in", "to", "a", "on", "are", "for", "this", "by"],
    ),
    (
        "de",
        &["der", "die", "das", "und", "ist", "mit", "im", "ein", "eine", "von", "zu", "nicht", "auf", "den", "des"],
    ),
    (
        "fr",
        &["le", "la", "les", "et", "est", "des", "du", "un", "une", "avec", "dans", "sur", "pour", "en"],
    ),
    (
        "es",
        &["el", "la", "los", "las", "y", "es", "con", "del", "un", "una", "en", "por", "para", "que"],
    ),
    (
        "it",
        &["il", "lo", "gli", "e", "è", "con", "del", "della", "un", "una", "di", "per", "che", "sono"],
    ),
    (
        "nl",
        &["de", "het", "een", "en", "is", "met", "van", "op", "niet", "voor", "zijn", "bij"],
    ),
];

/// Minimum function-word hits before a guess is trusted.
const MIN_HITS: usize = 2;

/// Most likely language code for `text`, or `fallback` when no candidate
/// collects enough function-word hits.
pub fn detect_language(text: &str, fallback: &str) -> String {
    let words: Vec<String> = WORD
        .find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .collect();

    let mut best: Option<(&str, usize)> = None;
    for (code, vocabulary) in FUNCTION_WORDS {
        let hits = words
            .iter()
            .filter(|w| vocabulary.contains(&w.as_str()))
            .count();
        if hits >= MIN_HITS && best.is_none_or(|(_, h)| hits > h) {
            best = Some((code, hits));
        }
    }
    best.map(|(code, _)| code.to_string())
        .unwrap_or_else(|| fallback.to_string())
}

/// Normalizes a backend-reported language to a lowercase primary subtag.
pub fn normalize_language(code: &str) -> Option<String> {
    let primary = code.trim().split(['-', '_']).next()?.to_ascii_lowercase();
    (primary.len() == 2 || primary.len() == 3)
        .then_some(primary)
        .filter(|p| p.chars().all(|c| c.is_ascii_alphabetic()))
}

/// Confidence estimate from the share of word-like tokens in the text.
/// Garbled recognition output produces many short symbol runs and scores low.
pub fn estimate_confidence(text: &str) -> f64 {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    if tokens.is_empty() {
        return 0.0;
    }
    let wordlike = tokens
        .iter()
        .filter(|t| {
            let letters = t.chars().filter(|c| c.is_alphanumeric()).count();
            letters * 2 >= t.chars().count()
        })
        .count();
    let ratio = wordlike as f64 / tokens.len() as f64;
    (0.3 + 0.65 * ratio).clamp(0.0, 1.0)
}
