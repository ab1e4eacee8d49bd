use std::collections::HashSet;

/// Lowercased, trimmed form used as the cache key.
pub fn normalize(query: &str) -> String {
    query.trim().to_lowercase()
}

/// Whitespace-separated word set of an already normalized string.
pub fn word_set(normalized: &str) -> HashSet<&str> {
    normalized.split_whitespace().collect()
}

/// `|A ∩ B| / |A ∪ B|`, zero when both sets are empty.
pub fn jaccard(a: &HashSet<&str>, b: &HashSet<&str>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    intersection as f64 / union as f64
}
