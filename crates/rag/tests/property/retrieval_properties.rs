use proptest::prelude::*;
use std::cmp::Ordering;

use recall_core::{cosine_similarity, HashEmbedder, RetrievedItem};
use recall_rag::{
    apply_similarity_threshold, average_pairwise_diversity, estimate_tokens, mmr_select, rrf_fuse,
    trim_to_budget,
};

const VOCAB: &[&str] = &[
    "kitchen", "light", "door", "garage", "alarm", "coffee", "porch", "music", "timer", "heater",
];

fn arb_text() -> impl Strategy<Value = String> {
    prop::collection::vec(prop::sample::select(VOCAB), 1..6).prop_map(|words| words.join(" "))
}

/// Ranked list with unique ids
fn arb_ranked_list() -> impl Strategy<Value = Vec<RetrievedItem>> {
    prop::collection::vec((arb_text(), 0.0f32..1.0), 0..20).prop_map(|entries| {
        entries
            .into_iter()
            .enumerate()
            .map(|(i, (text, score))| RetrievedItem::new(format!("id{}", i), text, score))
            .collect()
    })
}

fn ids(items: &[RetrievedItem]) -> Vec<String> {
    items.iter().map(|i| i.id.clone()).collect()
}

// ── RRF: fusing a list with itself keeps its order ─────────────────────────

proptest! {
    #[test]
    fn rrf_self_fusion_preserves_order(list in arb_ranked_list(), k in 1.0f32..100.0) {
        let once = rrf_fuse(&[list.clone()], k);
        let twice = rrf_fuse(&[list.clone(), list.clone()], k);

        prop_assert_eq!(ids(&once), ids(&list));
        prop_assert_eq!(ids(&twice), ids(&once));
    }
}

proptest! {
    #[test]
    fn rrf_duplicates_within_a_list_count_once(list in arb_ranked_list(), k in 1.0f32..100.0) {
        let mut doubled = list.clone();
        doubled.extend(list.iter().cloned());

        let plain = rrf_fuse(&[list], k);
        let with_dupes = rrf_fuse(&[doubled], k);

        prop_assert_eq!(ids(&plain), ids(&with_dupes));
        for (a, b) in plain.iter().zip(with_dupes.iter()) {
            prop_assert!((a.score - b.score).abs() < 1e-6);
        }
    }
}

// ── Threshold: raising it never keeps more ─────────────────────────────────

proptest! {
    #[test]
    fn threshold_is_monotonic(
        list in arb_ranked_list(),
        low in 0.0f32..1.0,
        delta in 0.0f32..1.0
    ) {
        let high = low + delta;
        let kept_low = apply_similarity_threshold(list.clone(), low).len();
        let kept_high = apply_similarity_threshold(list, high).len();

        prop_assert!(kept_high <= kept_low);
    }
}

// ── Trim: always a prefix, never empty for non-empty input ─────────────────

proptest! {
    #[test]
    fn trim_returns_a_prefix(list in arb_ranked_list(), budget in 0usize..40) {
        let trimmed = trim_to_budget(list.clone(), budget, &estimate_tokens);

        prop_assert!(trimmed.len() <= list.len());
        prop_assert_eq!(ids(&trimmed), ids(&list[..trimmed.len()]));
        if !list.is_empty() {
            prop_assert!(!trimmed.is_empty());
        }
    }
}

// ── MMR: two-item selection is at least as diverse as naive top-2 ──────────

proptest! {
    #[test]
    fn mmr_pair_is_at_least_as_diverse_as_top_two(
        list in arb_ranked_list().prop_filter("need two candidates", |l| l.len() >= 2),
        lambda in 0.0f32..0.99
    ) {
        let mut naive = list.clone();
        naive.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        naive.truncate(2);

        let selected = mmr_select(None, list, 2, lambda);

        prop_assert_eq!(selected.len(), 2);
        prop_assert_eq!(&selected[0].id, &naive[0].id);
        prop_assert!(
            average_pairwise_diversity(&selected) + 1e-5 >= average_pairwise_diversity(&naive)
        );
    }
}

// ── MMR with a query vector: cosine relevance drives the second pick ───────

fn embedded(list: Vec<RetrievedItem>) -> Vec<RetrievedItem> {
    let embedder = HashEmbedder::default();
    list.into_iter()
        .map(|mut item| {
            item.embedding = Some(embedder.embed_sync(&item.text));
            item
        })
        .collect()
}

proptest! {
    #[test]
    fn mmr_with_query_vector_beats_top_two_on_its_objective(
        list in arb_ranked_list().prop_filter("need two candidates", |l| l.len() >= 2),
        query in arb_text(),
        lambda in 0.0f32..1.0
    ) {
        let query_vec = HashEmbedder::default().embed_sync(&query);
        let list = embedded(list);
        let mut naive = list.clone();
        naive.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        naive.truncate(2);

        let selected = mmr_select(Some(&query_vec), list, 2, lambda);
        prop_assert_eq!(selected.len(), 2);
        prop_assert_eq!(&selected[0].id, &naive[0].id);

        let objective = |pair: &[RetrievedItem]| {
            let relevance = cosine_similarity(&query_vec, pair[1].embedding.as_deref().unwrap());
            lambda * relevance + (1.0 - lambda) * average_pairwise_diversity(pair)
        };
        prop_assert!(objective(&selected) + 1e-4 >= objective(&naive));
    }

    #[test]
    fn mmr_with_query_vector_and_zero_lambda_keeps_diversity_floor(
        list in arb_ranked_list().prop_filter("need two candidates", |l| l.len() >= 2),
        query in arb_text()
    ) {
        let query_vec = HashEmbedder::default().embed_sync(&query);
        let list = embedded(list);
        let mut naive = list.clone();
        naive.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        naive.truncate(2);

        let selected = mmr_select(Some(&query_vec), list, 2, 0.0);
        prop_assert!(
            average_pairwise_diversity(&selected) + 1e-5 >= average_pairwise_diversity(&naive)
        );
    }
}

proptest! {
    #[test]
    fn mmr_never_exceeds_k_or_repeats(list in arb_ranked_list(), k in 0usize..25, lambda in 0.0f32..1.0) {
        let selected = mmr_select(None, list.clone(), k, lambda);

        prop_assert_eq!(selected.len(), k.min(list.len()));
        let mut seen = std::collections::HashSet::new();
        for item in &selected {
            prop_assert!(seen.insert(item.id.clone()));
        }
    }
}
