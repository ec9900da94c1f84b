//! Rerank cascade
//!
//! Stage 1 is a cheap local cross-encoder proxy: cosine between the query
//! and passage embeddings minus a mild length penalty. Stage 2 is any
//! `Reranker`; the passthrough default re-invokes the local scorer so
//! hosted integrations can be swapped in without touching the pipeline.

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use recall_core::{cosine_similarity, keys, Embedder, RerankQuery, Reranker, RetrievedItem};

use crate::RagError;

/// Penalty per 200 characters beyond 600
pub const LENGTH_PENALTY_PER_STEP: f32 = 0.02;
const LENGTH_PENALTY_FREE_CHARS: f32 = 600.0;
const LENGTH_PENALTY_STEP_CHARS: f32 = 200.0;

/// `0.02 * max(0, (len - 600) / 200)`
pub fn length_penalty(text: &str) -> f32 {
    let len = text.chars().count() as f32;
    LENGTH_PENALTY_PER_STEP * ((len - LENGTH_PENALTY_FREE_CHARS) / LENGTH_PENALTY_STEP_CHARS).max(0.0)
}

fn sort_and_keep(mut items: Vec<RetrievedItem>, keep: usize) -> Vec<RetrievedItem> {
    items.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
    items.truncate(keep);
    items
}

/// Reranker statistics
#[derive(Debug, Clone, Default)]
pub struct RerankerStats {
    pub calls: u64,
    pub items_scored: u64,
    /// Passages that had to be embedded during rerank
    pub embeddings_computed: u64,
}

/// Local cosine reranker
pub struct LocalReranker {
    embedder: Arc<dyn Embedder>,
    stats: Mutex<RerankerStats>,
}

impl LocalReranker {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            embedder,
            stats: Mutex::new(RerankerStats::default()),
        }
    }

    pub fn stats(&self) -> RerankerStats {
        self.stats.lock().clone()
    }
}

#[async_trait]
impl Reranker for LocalReranker {
    async fn rerank(
        &self,
        query: &RerankQuery,
        mut items: Vec<RetrievedItem>,
        keep: usize,
    ) -> recall_core::Result<Vec<RetrievedItem>> {
        let query_embedding = match &query.embedding {
            Some(e) => e.clone(),
            None => self.embedder.embed(&query.text).await?,
        };

        let mut computed = 0u64;
        for item in items.iter_mut() {
            if item.embedding.is_none() {
                match self.embedder.embed(&item.text).await {
                    Ok(e) => {
                        item.embedding = Some(e);
                        computed += 1;
                    },
                    Err(e) => {
                        tracing::debug!(id = %item.id, error = %e, "Passage embedding failed, scoring as 0");
                    },
                }
            }

            let cosine = item
                .embedding
                .as_deref()
                .map(|e| cosine_similarity(&query_embedding, e))
                .unwrap_or(0.0);
            let score = cosine - length_penalty(&item.text);

            item.set_meta(keys::LOCAL_CE, score);
            item.score = score;
        }

        {
            let mut stats = self.stats.lock();
            stats.calls += 1;
            stats.items_scored += items.len() as u64;
            stats.embeddings_computed += computed;
        }

        Ok(sort_and_keep(items, keep))
    }

    fn name(&self) -> &str {
        "local"
    }
}

/// Hosted-stage default that delegates to another reranker
pub struct PassthroughReranker {
    inner: Arc<dyn Reranker>,
}

impl PassthroughReranker {
    pub fn new(inner: Arc<dyn Reranker>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Reranker for PassthroughReranker {
    async fn rerank(
        &self,
        query: &RerankQuery,
        items: Vec<RetrievedItem>,
        keep: usize,
    ) -> recall_core::Result<Vec<RetrievedItem>> {
        self.inner.rerank(query, items, keep).await
    }

    fn name(&self) -> &str {
        "passthrough"
    }
}

/// Hosted reranker configuration
#[derive(Debug, Clone)]
pub struct HttpRerankerConfig {
    /// Full URL of the rerank endpoint
    pub endpoint: String,
    pub model: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

impl HttpRerankerConfig {
    pub fn from_settings(settings: &recall_config::RerankerSettings) -> Option<Self> {
        Some(Self {
            endpoint: settings.endpoint.clone()?,
            model: settings.model.clone().unwrap_or_default(),
            api_key: settings.api_key.clone(),
            timeout: Duration::from_millis(settings.timeout_ms),
        })
    }
}

#[derive(Debug, Serialize)]
struct RerankRequest<'a> {
    model: &'a str,
    query: &'a str,
    documents: Vec<&'a str>,
    top_n: usize,
}

#[derive(Debug, Deserialize)]
struct RerankResponse {
    results: Vec<RerankHit>,
}

#[derive(Debug, Deserialize)]
struct RerankHit {
    index: usize,
    relevance_score: f32,
}

/// Reranker for `/rerank`-style HTTP APIs
pub struct HttpReranker {
    client: Client,
    config: HttpRerankerConfig,
}

impl HttpReranker {
    pub fn new(config: HttpRerankerConfig) -> Result<Self, RagError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| RagError::Connection(e.to_string()))?;
        Ok(Self { client, config })
    }

    async fn call(&self, query: &str, items: &[RetrievedItem], keep: usize) -> Result<Vec<RerankHit>, RagError> {
        let request = RerankRequest {
            model: &self.config.model,
            query,
            documents: items.iter().map(|i| i.text.as_str()).collect(),
            top_n: keep,
        };

        let mut builder = self.client.post(&self.config.endpoint).json(&request);
        if let Some(ref key) = self.config.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| RagError::Reranker(format!("Rerank request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(RagError::Reranker(format!(
                "Rerank failed: {} - {}",
                status, text
            )));
        }

        let parsed: RerankResponse = response
            .json()
            .await
            .map_err(|e| RagError::Reranker(format!("Failed to parse rerank response: {}", e)))?;

        Ok(parsed.results)
    }
}

#[async_trait]
impl Reranker for HttpReranker {
    async fn rerank(
        &self,
        query: &RerankQuery,
        items: Vec<RetrievedItem>,
        keep: usize,
    ) -> recall_core::Result<Vec<RetrievedItem>> {
        if items.is_empty() {
            return Ok(items);
        }

        let hits = self.call(&query.text, &items, keep).await?;
        Ok(apply_hits(items, hits, keep))
    }

    fn name(&self) -> &str {
        "http"
    }
}

/// Map hosted scores back onto items; unknown indexes are ignored and
/// items the service did not return are dropped
fn apply_hits(items: Vec<RetrievedItem>, hits: Vec<RerankHit>, keep: usize) -> Vec<RetrievedItem> {
    let mut slots: Vec<Option<RetrievedItem>> = items.into_iter().map(Some).collect();
    let rescored: Vec<RetrievedItem> = hits
        .into_iter()
        .filter_map(|hit| {
            let mut item = slots.get_mut(hit.index)?.take()?;
            item.set_meta(keys::HOSTED_SCORE, hit.relevance_score);
            item.score = hit.relevance_score;
            Some(item)
        })
        .collect();
    sort_and_keep(rescored, keep)
}

#[cfg(test)]
mod tests {
    use super::*;
    use recall_core::HashEmbedder;

    #[test]
    fn test_length_penalty() {
        assert_eq!(length_penalty("short"), 0.0);
        assert_eq!(length_penalty(&"x".repeat(600)), 0.0);
        assert!((length_penalty(&"x".repeat(800)) - 0.02).abs() < 1e-6);
        assert!((length_penalty(&"x".repeat(1000)) - 0.04).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_local_reranker_prefers_matching_text() {
        let reranker = LocalReranker::new(Arc::new(HashEmbedder::default()));
        let items = vec![
            RetrievedItem::new("other", "zzzz qqqq", 0.9),
            RetrievedItem::new("match", "turn on the kitchen lights", 0.1),
        ];

        let query = RerankQuery::new("turn on the kitchen lights");
        let out = reranker.rerank(&query, items, 1).await.unwrap();

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].id, "match");
        assert!(out[0].metadata.contains_key(keys::LOCAL_CE));
        assert_eq!(reranker.stats().embeddings_computed, 2);
    }

    #[tokio::test]
    async fn test_local_reranker_penalizes_long_passages() {
        let reranker = LocalReranker::new(Arc::new(HashEmbedder::default()));
        let query = RerankQuery::new("x");
        let short = RetrievedItem::new("short", "x".repeat(10), 0.0);
        let long = RetrievedItem::new("long", "x".repeat(2000), 0.0);

        let out = reranker.rerank(&query, vec![long, short], 2).await.unwrap();
        assert_eq!(out[0].id, "short");
    }

    #[tokio::test]
    async fn test_passthrough_delegates() {
        let local: Arc<dyn Reranker> = Arc::new(LocalReranker::new(Arc::new(HashEmbedder::default())));
        let passthrough = PassthroughReranker::new(local);
        let items = vec![RetrievedItem::new("a", "alpha", 0.0), RetrievedItem::new("b", "beta", 0.0)];

        let out = passthrough
            .rerank(&RerankQuery::new("alpha"), items, 1)
            .await
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(passthrough.name(), "passthrough");
    }

    #[test]
    fn test_apply_hits() {
        let items = vec![
            RetrievedItem::new("a", "a", 0.0),
            RetrievedItem::new("b", "b", 0.0),
            RetrievedItem::new("c", "c", 0.0),
        ];
        let hits = vec![
            RerankHit { index: 2, relevance_score: 0.9 },
            RerankHit { index: 0, relevance_score: 0.4 },
            RerankHit { index: 7, relevance_score: 1.0 },
        ];

        let out = apply_hits(items, hits, 5);
        let ids: Vec<&str> = out.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a"]);
        assert!(out[0].metadata.contains_key(keys::HOSTED_SCORE));
    }
}
