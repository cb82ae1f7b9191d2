use std::collections::HashSet;

use unicode_normalization::UnicodeNormalization;

/// Equality key for generated queries: trimmed, NFKC-normalized, then lowercased.
///
/// NFKC folds full-width forms and composed/decomposed accents together; accented and
/// unaccented letters remain distinct.
pub fn normalize_query(query: &str) -> String {
    query.trim().nfkc().collect::<String>().to_lowercase()
}

/// Ordered set of queries keyed by [`normalize_query`]. Keeps the first spelling seen.
#[derive(Clone, Debug, Default)]
pub struct UniqueQueries {
    seen: HashSet<String>,
    ordered: Vec<String>,
}

impl UniqueQueries {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` when an equivalent query was already present.
    pub fn insert(&mut self, query: &str) -> bool {
        let key = normalize_query(query);
        if key.is_empty() || !self.seen.insert(key) {
            return false;
        }
        self.ordered.push(query.trim().to_string());
        true
    }

    pub fn contains(&self, query: &str) -> bool {
        self.seen.contains(&normalize_query(query))
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    pub fn into_vec(self) -> Vec<String> {
        self.ordered
    }
}

#[cfg(test)]
mod tests {
    use super::{UniqueQueries, normalize_query};

    #[test]
    fn case_and_surrounding_whitespace_are_ignored() {
        let mut unique = UniqueQueries::new();
        assert!(unique.insert("Cancer & Therapy"));
        assert!(!unique.insert("  cancer & therapy\n"));
        assert_eq!(unique.into_vec(), vec!["Cancer & Therapy".to_string()]);
    }

    #[test]
    fn full_width_forms_collapse() {
        assert_eq!(normalize_query("ＣＡＮＣＥＲ"), normalize_query("cancer"));
    }

    #[test]
    fn decomposed_accents_match_composed() {
        assert_eq!(normalize_query("Me\u{301}decine"), normalize_query("médecine"));
        assert_ne!(normalize_query("médecine"), normalize_query("medecine"));
    }

    #[test]
    fn inner_whitespace_is_significant() {
        let mut unique = UniqueQueries::new();
        unique.insert("a & b");
        assert!(unique.insert("a&b"));
        assert_eq!(unique.len(), 2);
    }

    #[test]
    fn blank_queries_are_never_kept() {
        let mut unique = UniqueQueries::new();
        assert!(!unique.insert("   "));
        assert!(unique.is_empty());
    }
}
