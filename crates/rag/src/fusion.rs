//! Rank fusion and diversification
//!
//! Pure functions over already-fetched candidates. No I/O.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use recall_core::{cosine_similarity, jaccard, keys, token_set, RetrievedItem};

/// Dense keep rule: drop items whose similarity is below `threshold`
pub fn apply_similarity_threshold(items: Vec<RetrievedItem>, threshold: f32) -> Vec<RetrievedItem> {
    items
        .into_iter()
        .filter(|item| item.score >= threshold)
        .collect()
}

/// Reciprocal Rank Fusion
///
/// Each id scores `Σ 1/(k + rank + 1)` over the lists it appears in. Only
/// the first occurrence of an id within a list contributes. The output is
/// sorted by fused score; equal scores keep first-appearance order (earlier
/// lists first). The fused value is also written to `rrf_score`.
pub fn rrf_fuse(lists: &[Vec<RetrievedItem>], k: f32) -> Vec<RetrievedItem> {
    let mut order: Vec<String> = Vec::new();
    let mut fused: HashMap<String, (f32, RetrievedItem)> = HashMap::new();

    for list in lists {
        let mut seen: HashSet<&str> = HashSet::with_capacity(list.len());

        for (rank, item) in list.iter().enumerate() {
            if !seen.insert(item.id.as_str()) {
                continue;
            }

            let contribution = 1.0 / (k + rank as f32 + 1.0);

            match fused.get_mut(&item.id) {
                Some((score, existing)) => {
                    *score += contribution;
                    merge_into(existing, item);
                },
                None => {
                    order.push(item.id.clone());
                    fused.insert(item.id.clone(), (contribution, item.clone()));
                },
            }
        }
    }

    let mut results: Vec<RetrievedItem> = order
        .into_iter()
        .filter_map(|id| fused.remove(&id))
        .map(|(score, mut item)| {
            item.score = score;
            item.set_meta(keys::RRF_SCORE, score);
            item
        })
        .collect();

    // sort_by is stable, so ties keep first-appearance order
    results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
    results
}

/// Copy metadata keys and the embedding the first occurrence lacks
fn merge_into(existing: &mut RetrievedItem, other: &RetrievedItem) {
    for (key, value) in &other.metadata {
        existing
            .metadata
            .entry(key.clone())
            .or_insert_with(|| value.clone());
    }
    if existing.embedding.is_none() {
        existing.embedding = other.embedding.clone();
    }
}

/// Similarity used by MMR's diversity term
///
/// Half embedding cosine, half token Jaccard. A missing embedding on either
/// side contributes 0 to the cosine half.
pub fn item_similarity(a: &RetrievedItem, b: &RetrievedItem) -> f32 {
    similarity_with_tokens(a, b, &token_set(&a.text), &token_set(&b.text))
}

fn similarity_with_tokens(
    a: &RetrievedItem,
    b: &RetrievedItem,
    tokens_a: &HashSet<String>,
    tokens_b: &HashSet<String>,
) -> f32 {
    let cos = match (&a.embedding, &b.embedding) {
        (Some(ea), Some(eb)) => cosine_similarity(ea, eb),
        _ => 0.0,
    };
    0.5 * cos + 0.5 * jaccard(tokens_a, tokens_b)
}

/// Maximal Marginal Relevance selection
///
/// Seeds with the highest-scoring candidate, then greedily adds the
/// candidate maximizing `λ·relevance + (1-λ)·diversity`, where relevance is
/// cosine(query, item) and diversity is `1 - max similarity` to anything
/// already selected. Without a query embedding (or an item embedding)
/// relevance falls back to the item's current score.
pub fn mmr_select(
    query_embedding: Option<&[f32]>,
    candidates: Vec<RetrievedItem>,
    k: usize,
    lambda: f32,
) -> Vec<RetrievedItem> {
    if candidates.is_empty() || k == 0 {
        return Vec::new();
    }

    let tokens: Vec<HashSet<String>> = candidates.iter().map(|c| token_set(&c.text)).collect();
    let relevance: Vec<f32> = candidates
        .iter()
        .map(|c| match (query_embedding, c.embedding.as_deref()) {
            (Some(q), Some(e)) => cosine_similarity(q, e),
            _ => c.score,
        })
        .collect();

    let n = candidates.len();
    let mut selected: Vec<usize> = Vec::with_capacity(k.min(n));
    let mut remaining: Vec<bool> = vec![true; n];
    // Max similarity of each candidate to the selected set
    let mut max_sim: Vec<f32> = vec![f32::NEG_INFINITY; n];

    let seed = candidates
        .iter()
        .enumerate()
        .fold(0usize, |best, (i, c)| {
            if c.score > candidates[best].score {
                i
            } else {
                best
            }
        });

    let mut last = seed;
    selected.push(seed);
    remaining[seed] = false;

    while selected.len() < k {
        let mut best: Option<(usize, f32)> = None;

        for i in 0..n {
            if !remaining[i] {
                continue;
            }

            let sim = similarity_with_tokens(&candidates[i], &candidates[last], &tokens[i], &tokens[last]);
            if sim > max_sim[i] {
                max_sim[i] = sim;
            }

            let diversity = 1.0 - max_sim[i];
            let mmr = lambda * relevance[i] + (1.0 - lambda) * diversity;

            match best {
                Some((_, best_score)) if mmr <= best_score => {},
                _ => best = Some((i, mmr)),
            }
        }

        match best {
            Some((i, _)) => {
                selected.push(i);
                remaining[i] = false;
                last = i;
            },
            None => break,
        }
    }

    let mut slots: Vec<Option<RetrievedItem>> = candidates.into_iter().map(Some).collect();
    selected
        .into_iter()
        .filter_map(|i| slots[i].take())
        .collect()
}

/// Mean of `1 - similarity` over all pairs (0.0 for fewer than two items)
pub fn average_pairwise_diversity(items: &[RetrievedItem]) -> f32 {
    if items.len() < 2 {
        return 0.0;
    }

    let tokens: Vec<HashSet<String>> = items.iter().map(|c| token_set(&c.text)).collect();
    let mut total = 0.0f32;
    let mut pairs = 0usize;
    for i in 0..items.len() {
        for j in (i + 1)..items.len() {
            total += 1.0 - similarity_with_tokens(&items[i], &items[j], &tokens[i], &tokens[j]);
            pairs += 1;
        }
    }
    total / pairs as f32
}
