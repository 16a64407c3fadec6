//! Shared text normalization for search indexing.
//!
//! Converts raw chunk or query text into the list of terms the scorer
//! operates on. The pipeline is deterministic and touches no state beyond
//! the fixed stopword table:
//!
//! 1. Strip HTML tags and decode common entities
//! 2. Lowercase
//! 3. Tokenize into alphanumeric words
//! 4. Drop tokens shorter than [`MIN_TOKEN_LENGTH`]
//! 5. Drop stopwords

use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

/// Minimum character count for a token to be indexed. Single-character
/// tokens like "a", "I", "1" add noise without search value.
pub const MIN_TOKEN_LENGTH: usize = 2;

static TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[a-zA-Z0-9_]+").unwrap());

static HTML_TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").unwrap());

static HTML_ENTITY_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"&[a-zA-Z0-9#]+;").unwrap());

/// Common words filtered during term extraction. These appear frequently
/// but don't help distinguish between chunks.
static STOPWORDS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        // Articles and prepositions
        "the", "a", "an", "and", "or", "to", "of", "in", "for", "with", "on", "at", "by", "from",
        "as", "into", "through",
        // Common verbs
        "is", "are", "was", "were", "be", "been", "have", "has", "had", "do", "does", "did",
        "will", "would", "could", "should", "may", "can", "must",
        // Pronouns
        "it", "its", "this", "that", "these", "those", "which", "what", "who", "whom",
        // Common doc words with no discriminative power
        "example", "following", "using", "also", "when", "where", "how", "why", "see", "note",
        "use", "used",
        // Misc
        "over", "about", "above", "below",
        // Table headers common in API docs
        "field", "type", "label", "description",
        // Proto/gRPC doc terms
        "string", "int", "bool", "float", "uint", "optional", "required", "repeated", "api",
        "svc", "proto",
        // Common in generated docs
        "top", "table", "contents", "value", "types",
    ]
    .into_iter()
    .collect()
});

/// Returns true if the term is a common word that should be filtered from
/// search indexes.
pub fn is_stopword(term: &str) -> bool {
    STOPWORDS.contains(term)
}

/// Removes HTML tags and entities from text.
///
/// Example: `<a href='x'>link</a> &amp; more` → `link & more`
pub fn strip_html(text: &str) -> String {
    let text = HTML_TAG_RE.replace_all(text, "");

    // Decode the common entities, then drop any remaining/unknown ones
    // (e.g. &mdash;).
    let text = text
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ");

    HTML_ENTITY_RE.replace_all(&text, "").into_owned()
}

/// Converts text into a list of searchable terms.
///
/// Example: `"The Consumer is configured"` → `["consumer", "configured"]`
pub fn normalize_terms(text: &str) -> Vec<String> {
    let text = strip_html(text).to_lowercase();

    TOKEN_RE
        .find_iter(&text)
        .map(|m| m.as_str())
        .filter(|t| t.len() >= MIN_TOKEN_LENGTH && !is_stopword(t))
        .map(|t| t.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_basic() {
        let terms = normalize_terms("The Consumer is configured");
        assert_eq!(terms, vec!["consumer", "configured"]);
    }

    #[test]
    fn test_normalize_drops_short_tokens() {
        let terms = normalize_terms("x go y run z");
        assert_eq!(terms, vec!["go", "run"]);
    }

    #[test]
    fn test_normalize_strips_html() {
        let terms = normalize_terms("<a href='x'>consumer</a> &amp; producer");
        assert_eq!(terms, vec!["consumer", "producer"]);
    }

    #[test]
    fn test_normalize_unknown_entities_removed() {
        let terms = normalize_terms("dashes&mdash;here");
        assert_eq!(terms, vec!["dashes", "here"]);
    }

    #[test]
    fn test_normalize_keeps_underscores_and_digits() {
        let terms = normalize_terms("max_tokens defaults 500");
        assert_eq!(terms, vec!["max_tokens", "defaults", "500"]);
    }

    #[test]
    fn test_normalize_empty_after_filtering() {
        assert!(normalize_terms("the a an of").is_empty());
        assert!(normalize_terms("").is_empty());
    }

    #[test]
    fn test_stopword_table() {
        assert!(is_stopword("the"));
        assert!(is_stopword("proto"));
        assert!(is_stopword("contents"));
        assert!(!is_stopword("consumer"));
    }

    #[test]
    fn test_strip_html() {
        assert_eq!(strip_html("<a href='x'>link</a> &amp; more"), "link & more");
        assert_eq!(strip_html("a &nbsp; b"), "a   b");
    }
}
