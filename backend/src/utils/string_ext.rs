//! String helpers shared across the ingest and analysis pipeline.

use std::collections::HashSet;

/// Clean and validate an optional string field: trim and drop empties.
#[inline]
pub fn clean_optional_string(s: Option<&String>) -> Option<String> {
    s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// String cleaning extension trait
pub trait StringExt {
    /// Trim; empty strings become None
    fn clean(&self) -> Option<String>;

    /// Trimmed copy
    fn trimmed(&self) -> String;
}

impl StringExt for str {
    #[inline]
    fn clean(&self) -> Option<String> {
        let trimmed = self.trim();
        if trimmed.is_empty() { None } else { Some(trimmed.to_string()) }
    }

    #[inline]
    fn trimmed(&self) -> String {
        self.trim().to_string()
    }
}

impl StringExt for String {
    #[inline]
    fn clean(&self) -> Option<String> {
        self.as_str().clean()
    }

    #[inline]
    fn trimmed(&self) -> String {
        self.as_str().trimmed()
    }
}

/// Common English stop words. The finding dedup layer extends this set with
/// domain filler words before fingerprinting.
pub const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "been", "but", "by", "for", "from", "has", "have",
    "in", "is", "it", "its", "of", "on", "or", "that", "the", "this", "to", "was", "were", "which",
    "will", "with",
];

fn is_stop_word(word: &str) -> bool {
    STOP_WORDS.contains(&word)
}

/// Extract the significant words of a text: lowercase alphanumeric tokens of
/// at least `min_len` characters that are neither stop words nor pure numbers.
pub fn significant_words(text: &str, min_len: usize) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|w| w.len() >= min_len)
        .filter(|w| !w.chars().all(|c| c.is_ascii_digit()))
        .filter(|w| !is_stop_word(w))
        .map(|w| w.to_string())
        .collect()
}

/// Fraction of `needle` words found in `haystack`. 0.0 when `needle` is empty.
pub fn overlap_ratio(needle: &HashSet<String>, haystack: &HashSet<String>) -> f64 {
    if needle.is_empty() {
        return 0.0;
    }
    let hits = needle.iter().filter(|w| haystack.contains(*w)).count();
    hits as f64 / needle.len() as f64
}
