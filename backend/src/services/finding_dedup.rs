//! Finding text similarity: normalization, fingerprinting, TF-IDF cosine
//! and Jaccard. These are the safety net under the LLM's new_findings list;
//! the lifecycle rules themselves live in the meta-analyzer.

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};

use crate::utils::string_ext::STOP_WORDS;

/// Domain filler words that carry no identity for dedup purposes.
const DOMAIN_STOP_WORDS: &[&str] = &[
    "indicating",
    "requires",
    "immediate",
    "attention",
    "overall",
    "poses",
    "issue",
    "issues",
    "detected",
    "observed",
    "multiple",
    "several",
    "possible",
    "potential",
];

fn is_stop_word(word: &str) -> bool {
    STOP_WORDS.contains(&word) || DOMAIN_STOP_WORDS.contains(&word)
}

static UUID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}")
        .expect("static regex")
});
static LONG_HEX_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[0-9a-f]{12,}\b").expect("static regex"));
static IPV4_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d{1,3}(\.\d{1,3}){3}\b").expect("static regex"));
static EVENT_REF_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\(events?[^)]*\)|\[\d+\]").expect("static regex"));
static NUMBER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").expect("static regex"));
static PUNCT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\w<>\s]").expect("static regex"));

/// Normalize a finding text into its dedup tokens: lowercase, identifiers
/// and addresses collapsed to placeholders, event references removed,
/// punctuation flattened, stop words dropped.
pub fn normalize_tokens(text: &str) -> Vec<String> {
    let lowered = text.to_lowercase();
    let replaced = UUID_RE.replace_all(&lowered, "<id>");
    let replaced = LONG_HEX_RE.replace_all(&replaced, "<id>");
    let replaced = IPV4_RE.replace_all(&replaced, "<ip>");
    let replaced = EVENT_REF_RE.replace_all(&replaced, " ");
    let replaced = NUMBER_RE.replace_all(&replaced, "<num>");
    let replaced = PUNCT_RE.replace_all(&replaced, " ");

    replaced
        .split_whitespace()
        .filter(|w| !w.is_empty())
        .filter(|w| !is_stop_word(w))
        .map(|w| w.to_string())
        .collect()
}

/// Order-independent fingerprint: SHA-256 of the sorted tokens, truncated
/// to 32 hex chars.
pub fn fingerprint(text: &str) -> String {
    let mut tokens = normalize_tokens(text);
    tokens.sort();
    let joined = tokens.join(" ");
    let mut hasher = Sha256::new();
    hasher.update(joined.as_bytes());
    format!("{:x}", hasher.finalize())[..32].to_string()
}

/// Jaccard similarity over the token sets of two texts.
pub fn jaccard(a: &str, b: &str) -> f64 {
    let set_a: HashSet<String> = normalize_tokens(a).into_iter().collect();
    let set_b: HashSet<String> = normalize_tokens(b).into_iter().collect();
    if set_a.is_empty() && set_b.is_empty() {
        return 0.0;
    }
    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.union(&set_b).count();
    intersection as f64 / union as f64
}

/// Criterion compatibility: a null criterion matches anything.
pub fn criterion_compatible(a: Option<&str>, b: Option<&str>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a == b,
        _ => true,
    }
}

/// TF-IDF model over one meta-analysis call's finding corpus. Only used
/// when the corpus has at least MIN_CORPUS documents; below that the IDF
/// statistics are meaningless and Jaccard takes over.
pub struct TfIdfModel {
    doc_freq: HashMap<String, usize>,
    n_docs: usize,
}

impl TfIdfModel {
    pub const MIN_CORPUS: usize = 3;

    pub fn build(corpus: &[Vec<String>]) -> Self {
        let mut doc_freq: HashMap<String, usize> = HashMap::new();
        for doc in corpus {
            let unique: HashSet<&String> = doc.iter().collect();
            for token in unique {
                *doc_freq.entry(token.clone()).or_insert(0) += 1;
            }
        }
        Self { doc_freq, n_docs: corpus.len() }
    }

    pub fn usable(&self) -> bool {
        self.n_docs >= Self::MIN_CORPUS
    }

    /// Smoothed IDF: log((N+1)/(1+df)) + 1.
    fn idf(&self, token: &str) -> f64 {
        let df = self.doc_freq.get(token).copied().unwrap_or(0);
        ((self.n_docs as f64 + 1.0) / (1.0 + df as f64)).ln() + 1.0
    }

    /// Sparse TF-IDF vector of one token list.
    pub fn vector(&self, tokens: &[String]) -> HashMap<String, f64> {
        let mut tf: HashMap<&String, usize> = HashMap::new();
        for token in tokens {
            *tf.entry(token).or_insert(0) += 1;
        }
        tf.into_iter()
            .map(|(token, count)| (token.clone(), count as f64 * self.idf(token)))
            .collect()
    }

    /// Cosine similarity between two texts under this model.
    pub fn cosine(&self, a_tokens: &[String], b_tokens: &[String]) -> f64 {
        let a = self.vector(a_tokens);
        let b = self.vector(b_tokens);

        let dot: f64 = a
            .iter()
            .filter_map(|(token, weight)| b.get(token).map(|other| weight * other))
            .sum();
        let norm_a: f64 = a.values().map(|w| w * w).sum::<f64>().sqrt();
        let norm_b: f64 = b.values().map(|w| w * w).sum::<f64>().sqrt();

        if norm_a == 0.0 || norm_b == 0.0 {
            return 0.0;
        }
        dot / (norm_a * norm_b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_tokens_placeholders() {
        let tokens = normalize_tokens("Disk /dev/sda1 at 95% on 10.0.0.5 (events [1],[2])");
        assert!(tokens.contains(&"disk".to_string()));
        assert!(tokens.contains(&"<num>".to_string()));
        assert!(tokens.contains(&"<ip>".to_string()));
        // Event refs removed entirely
        assert!(!tokens.iter().any(|t| t.contains("events")));
    }

    #[test]
    fn test_fingerprint_ignores_variable_numbers() {
        let a = fingerprint("Disk /dev/sda1 at 95% (host web-01)");
        let b = fingerprint("Disk /dev/sda1 at 96% (host web-01)");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn test_fingerprint_is_order_independent() {
        let a = fingerprint("database connection pool exhausted");
        let b = fingerprint("exhausted pool connection database");
        assert_eq!(a, b);
    }

    #[test]
    fn test_fingerprint_differs_for_different_issues() {
        let a = fingerprint("disk space low on /var");
        let b = fingerprint("certificate expiring on web frontend");
        assert_ne!(a, b);
    }

    #[test]
    fn test_jaccard_bounds() {
        assert_eq!(jaccard("disk full on server", "disk full on server"), 1.0);
        assert_eq!(jaccard("disk full", "network latency"), 0.0);
        let partial = jaccard("disk nearly full on web server", "disk full on web server");
        assert!(partial > 0.5 && partial < 1.0);
    }

    #[test]
    fn test_criterion_compatibility() {
        assert!(criterion_compatible(None, Some("anomaly")));
        assert!(criterion_compatible(Some("anomaly"), None));
        assert!(criterion_compatible(Some("anomaly"), Some("anomaly")));
        assert!(!criterion_compatible(Some("anomaly"), Some("it_security")));
    }

    #[test]
    fn test_tfidf_similarity() {
        let corpus: Vec<Vec<String>> = [
            "database connection pool exhausted on primary",
            "disk space critically low on /var partition",
            "certificate for web frontend expiring soon",
        ]
        .iter()
        .map(|t| normalize_tokens(t))
        .collect();

        let model = TfIdfModel::build(&corpus);
        assert!(model.usable());

        let query = normalize_tokens("connection pool exhausted on primary database");
        let same = model.cosine(&query, &corpus[0]);
        let other = model.cosine(&query, &corpus[1]);
        assert!(same > 0.9);
        assert!(other < 0.3);
    }

    #[test]
    fn test_tfidf_unusable_below_min_corpus() {
        let corpus: Vec<Vec<String>> = vec![normalize_tokens("single doc")];
        assert!(!TfIdfModel::build(&corpus).usable());
    }
}
