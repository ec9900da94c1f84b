//! Token-budget trimming

use std::sync::Arc;
use unicode_segmentation::UnicodeSegmentation;

use recall_core::RetrievedItem;

/// Injectable token counter
pub type TokenCounter = Arc<dyn Fn(&str) -> usize + Send + Sync>;

/// Estimate token count for text
///
/// Uses grapheme clusters for proper Unicode handling. Roughly 4 graphemes
/// per token for Latin scripts, 2 for Devanagari.
pub fn estimate_tokens(text: &str) -> usize {
    let grapheme_count = text.graphemes(true).count();

    let devanagari_count = text
        .chars()
        .filter(|c| ('\u{0900}'..='\u{097F}').contains(c))
        .count();

    if devanagari_count > grapheme_count / 3 {
        grapheme_count.max(1) / 2
    } else {
        grapheme_count.max(1).div_ceil(4)
    }
}

/// Default counter backed by [`estimate_tokens`]
pub fn default_token_counter() -> TokenCounter {
    Arc::new(estimate_tokens)
}

/// Greedy prefix keep
///
/// Keeps items from the top until the next one would exceed `budget`. The
/// first item is always kept, so non-empty input yields non-empty output.
/// Never reorders.
pub fn trim_to_budget(
    items: Vec<RetrievedItem>,
    budget: usize,
    count: &dyn Fn(&str) -> usize,
) -> Vec<RetrievedItem> {
    let mut used = 0usize;
    let mut keep = 0usize;

    for (i, item) in items.iter().enumerate() {
        let cost = count(&item.text);
        if i > 0 && used.saturating_add(cost) > budget {
            break;
        }
        used = used.saturating_add(cost);
        keep = i + 1;
    }

    let mut items = items;
    items.truncate(keep);
    items
}

#[cfg(test)]
mod tests {
    use super::*;

    fn items(lens: &[usize]) -> Vec<RetrievedItem> {
        lens.iter()
            .enumerate()
            .map(|(i, len)| RetrievedItem::new(i.to_string(), "x".repeat(*len), 1.0))
            .collect()
    }

    fn chars(text: &str) -> usize {
        text.chars().count()
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
        assert_eq!(estimate_tokens(""), 1);
    }

    #[test]
    fn test_trim_stops_before_overflow() {
        let kept = trim_to_budget(items(&[4, 4, 4]), 9, &chars);
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn test_trim_stops_at_first_overflow() {
        // A later small item is not pulled forward past an overflowing one
        let kept = trim_to_budget(items(&[4, 10, 1]), 9, &chars);
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn test_trim_always_keeps_first() {
        let kept = trim_to_budget(items(&[100, 1]), 5, &chars);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].id, "0");
        assert!(trim_to_budget(Vec::new(), 5, &chars).is_empty());
    }
}
