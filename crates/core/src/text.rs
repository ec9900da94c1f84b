//! Text helpers shared by the pipeline and the stores

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;

static NON_WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\p{L}\p{N}\s]+").unwrap());

/// Normalize text for cache keys: lowercase, punctuation stripped,
/// whitespace collapsed.
pub fn normalize_text(text: &str) -> String {
    let lowered = text.to_lowercase();
    let stripped = NON_WORD.replace_all(&lowered, " ");
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Lowercased word set, used for token Jaccard similarity
pub fn token_set(text: &str) -> HashSet<String> {
    normalize_text(text)
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

/// Jaccard similarity between two token sets (0.0 when both are empty)
pub fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f32 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f32 / union as f32
}

/// Current unix time in (fractional) seconds
pub fn now_unix() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_text() {
        assert_eq!(normalize_text("  Hello,   World!! "), "hello world");
        assert_eq!(normalize_text("Turn ON the lights?"), "turn on the lights");
        assert_eq!(normalize_text(""), "");
    }

    #[test]
    fn test_jaccard() {
        let a = token_set("the kitchen lights");
        let b = token_set("Kitchen lights off");
        let sim = jaccard(&a, &b);
        assert!((sim - 0.5).abs() < 1e-6);
        assert_eq!(jaccard(&token_set(""), &token_set("")), 0.0);
    }
}
