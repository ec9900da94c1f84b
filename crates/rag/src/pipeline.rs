//! Retrieval pipeline
//!
//! budget → cache probe → hybrid (dense ‖ sparse) → RRF → MMR →
//! local rerank → hosted rerank → boost → type filter → trim → cache store.
//!
//! Every stage pushes one trace event. Backend failures and timeouts
//! degrade the affected source to an empty list; `run` itself never fails.

use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use recall_config::RetrievalConfig;
use recall_core::{
    keys, now_unix, Embedder, Error, RerankQuery, Reranker, RetrievedItem, SearchBackend,
    SearchFilter, Trace, TraceEvent,
};

use crate::budget::{default_token_counter, trim_to_budget, TokenCounter};
use crate::cache::{CacheKey, ResultCache};
use crate::fusion::{apply_similarity_threshold, mmr_select, rrf_fuse};
use crate::metrics;
use crate::reranker::LocalReranker;
use crate::scoring::{apply_boosts, apply_type_filter, BoostConfig};

/// Collection searched when the caller does not name one
pub const DEFAULT_COLLECTION: &str = "kb:default";

/// Sample scores per trace event in explain mode
const TRACE_SAMPLES: usize = 3;

/// Degrade a failed backend call to an empty result
pub trait OrEmpty<T> {
    fn or_empty(self, source: &'static str) -> Vec<T>;
}

impl<T> OrEmpty<T> for recall_core::Result<Vec<T>> {
    fn or_empty(self, source: &'static str) -> Vec<T> {
        match self {
            Ok(items) => items,
            Err(e) => {
                tracing::warn!(error = %e, source, "Backend call failed, degrading to empty result");
                metrics::record_backend_error(source);
                Vec::new()
            },
        }
    }
}

/// One retrieval request
#[derive(Debug, Clone)]
pub struct PipelineRequest {
    pub user_id: String,
    pub query: String,
    pub intent: String,
    pub collection: String,
    /// Include ids and sample scores in the trace
    pub explain: bool,
    pub filter: Option<SearchFilter>,
}

impl PipelineRequest {
    pub fn new(user_id: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            query: query.into(),
            intent: recall_config::constants::retrieval::DEFAULT_INTENT.to_string(),
            collection: DEFAULT_COLLECTION.to_string(),
            explain: false,
            filter: None,
        }
    }

    pub fn intent(mut self, intent: impl Into<String>) -> Self {
        self.intent = intent.into();
        self
    }

    pub fn collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = collection.into();
        self
    }

    pub fn explain(mut self, explain: bool) -> Self {
        self.explain = explain;
        self
    }

    pub fn filter(mut self, filter: SearchFilter) -> Self {
        self.filter = Some(filter).filter(|f| !f.is_empty());
        self
    }
}

/// Pipeline result
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub texts: Vec<String>,
    pub trace: Trace,
    pub cache_hit: bool,
}

/// Hybrid retrieval orchestrator
pub struct Pipeline {
    config: RetrievalConfig,
    embedder: Arc<dyn Embedder>,
    backend: Arc<dyn SearchBackend>,
    local_reranker: Arc<dyn Reranker>,
    hosted_reranker: Option<Arc<dyn Reranker>>,
    cache: ResultCache,
    token_counter: TokenCounter,
    backend_timeout: Duration,
}

impl Pipeline {
    pub fn new(
        config: RetrievalConfig,
        embedder: Arc<dyn Embedder>,
        backend: Arc<dyn SearchBackend>,
    ) -> Self {
        let local_reranker: Arc<dyn Reranker> = Arc::new(LocalReranker::new(embedder.clone()));
        Self {
            cache: ResultCache::from_config(&config),
            backend_timeout: Duration::from_millis(config.backend_timeout_ms),
            config,
            embedder,
            backend,
            local_reranker,
            hosted_reranker: None,
            token_counter: default_token_counter(),
        }
    }

    /// Enable the second rerank stage
    pub fn with_hosted_reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.hosted_reranker = Some(reranker);
        self
    }

    pub fn with_local_reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.local_reranker = reranker;
        self
    }

    pub fn with_token_counter(mut self, counter: TokenCounter) -> Self {
        self.token_counter = counter;
        self
    }

    pub fn local_reranker(&self) -> Arc<dyn Reranker> {
        Arc::clone(&self.local_reranker)
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    async fn with_timeout<T, F>(&self, source: &'static str, fut: F) -> recall_core::Result<T>
    where
        F: Future<Output = recall_core::Result<T>>,
    {
        match tokio::time::timeout(self.backend_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!(
                "{} exceeded {}ms",
                source,
                self.backend_timeout.as_millis()
            ))),
        }
    }

    /// Run the full pipeline
    pub async fn run(&self, request: &PipelineRequest) -> PipelineOutput {
        let started = Instant::now();
        let intent_label = metrics::intent_label(&self.config, &request.intent);
        metrics::record_pipeline_run(intent_label.clone());

        let mut trace = Trace::new();

        // Budget
        let budget = self.config.budget_for(&request.intent);
        trace.push(
            TraceEvent::new("budget")
                .with("intent", request.intent.as_str())
                .with("k_dense", budget.k_dense)
                .with("k_sparse", budget.k_sparse)
                .with("token_budget", budget.token_budget),
        );

        // Cache probe; filtered requests bypass the cache
        let key = request
            .filter
            .as_ref()
            .map_or(true, |f| f.is_empty())
            .then(|| {
                CacheKey::new(
                    &request.user_id,
                    &request.query,
                    &request.intent,
                    &request.collection,
                )
                .with_explain(request.explain)
            });
        if let Some(cached) = key.as_ref().and_then(|key| self.cache.get(key)) {
            metrics::record_cache_hit(intent_label);
            let mut trace = cached.trace;
            trace.push(TraceEvent::new("cache_hit").with("texts", cached.texts.len()));
            tracing::debug!(user_id = %request.user_id, intent = %request.intent, "Pipeline cache hit");
            return PipelineOutput {
                texts: cached.texts,
                trace,
                cache_hit: true,
            };
        }

        // Hybrid retrieval
        let hybrid_started = Instant::now();
        let query_embedding = match self
            .with_timeout("embed", self.embedder.embed(&request.query))
            .await
        {
            Ok(embedding) => Some(embedding),
            Err(e) => {
                tracing::warn!(error = %e, "Query embedding failed, skipping dense search");
                metrics::record_backend_error("embed");
                None
            },
        };

        let filter = request.filter.as_ref();
        let dense_future = async {
            match query_embedding.as_deref() {
                Some(vector) => {
                    self.with_timeout(
                        "dense",
                        self.backend.dense_search(
                            &request.collection,
                            &request.user_id,
                            vector,
                            budget.k_dense,
                            filter,
                        ),
                    )
                    .await
                },
                None => Ok(Vec::new()),
            }
        };
        let sparse_future = self.with_timeout(
            "sparse",
            self.backend.sparse_search(
                &request.collection,
                &request.user_id,
                &request.query,
                budget.k_sparse,
                filter,
            ),
        );

        let (dense_result, sparse_result) = tokio::join!(dense_future, sparse_future);
        let dense_error = dense_result.is_err();
        let sparse_error = sparse_result.is_err();

        let dense_raw = tag_scores(dense_result.or_empty("dense"), keys::DENSE_SCORE);
        let dense_raw_count = dense_raw.len();
        let dense = apply_similarity_threshold(dense_raw, self.config.similarity_threshold);
        let sparse = tag_scores(sparse_result.or_empty("sparse"), keys::SPARSE_SCORE);

        let mut hybrid = TraceEvent::new("hybrid")
            .with("dense", dense.len())
            .with("dense_raw", dense_raw_count)
            .with("sparse", sparse.len())
            .with("threshold_sim", self.config.similarity_threshold)
            .with("dense_error", dense_error || query_embedding.is_none())
            .with("sparse_error", sparse_error)
            .with("elapsed_ms", elapsed_ms(hybrid_started));
        if request.explain {
            hybrid = hybrid
                .with("dense_samples", samples(&dense))
                .with("sparse_samples", samples(&sparse));
        }
        trace.push(hybrid);

        // Rank fusion
        let fused = rrf_fuse(&[dense, sparse], self.config.rrf_k);
        let mut rrf = TraceEvent::new("rrf")
            .with("fused", fused.len())
            .with("k", self.config.rrf_k);
        if request.explain {
            rrf = rrf
                .with("order", ids(&fused))
                .with("samples", samples(&fused));
        }
        trace.push(rrf);

        // Diversification
        let mut pool = fused;
        pool.truncate(self.config.mmr_pool_max);
        let pool_size = pool.len();
        let embedded = self.embed_missing(&mut pool).await;
        let diversified = mmr_select(
            query_embedding.as_deref(),
            pool,
            self.config.mmr_k,
            self.config.mmr_lambda,
        );
        let mut mmr = TraceEvent::new("mmr")
            .with("pool", pool_size)
            .with("selected", diversified.len())
            .with("lambda", self.config.mmr_lambda)
            .with("embedded", embedded);
        if request.explain {
            mmr = mmr.with("order", ids(&diversified));
        }
        trace.push(mmr);

        // Rerank stage 1
        let rerank_query =
            RerankQuery::new(request.query.as_str()).with_embedding(query_embedding.clone());
        let stage1_input = diversified.len();
        let (stage1, local_error) = match self
            .local_reranker
            .rerank(&rerank_query, diversified.clone(), self.config.keep1)
            .await
        {
            Ok(items) => (items, false),
            Err(e) => {
                tracing::warn!(error = %e, "Local rerank failed, keeping diversified order");
                metrics::record_backend_error("rerank_local");
                (truncated(diversified, self.config.keep1), true)
            },
        };
        let mut rerank_local = TraceEvent::new("rerank_local")
            .with("input", stage1_input)
            .with("kept", stage1.len())
            .with("keep", self.config.keep1)
            .with("error", local_error);
        if request.explain {
            rerank_local = rerank_local.with("samples", samples(&stage1));
        }
        trace.push(rerank_local);

        // Rerank stage 2
        let stage2_input = stage1.len();
        let (stage2, hosted_name, hosted_error) = match &self.hosted_reranker {
            Some(hosted) => {
                let result = self
                    .with_timeout(
                        "rerank_hosted",
                        hosted.rerank(&rerank_query, stage1.clone(), self.config.keep2),
                    )
                    .await;
                match result {
                    Ok(items) => (items, hosted.name().to_string(), false),
                    Err(e) => {
                        tracing::warn!(error = %e, reranker = hosted.name(), "Hosted rerank failed, keeping local order");
                        metrics::record_backend_error("rerank_hosted");
                        (
                            truncated(stage1, self.config.keep2),
                            hosted.name().to_string(),
                            true,
                        )
                    },
                }
            },
            None => (
                truncated(stage1, self.config.keep2),
                "none".to_string(),
                false,
            ),
        };
        let mut rerank_hosted = TraceEvent::new("rerank_hosted")
            .with("enabled", self.hosted_reranker.is_some())
            .with("reranker", hosted_name)
            .with("input", stage2_input)
            .with("kept", stage2.len())
            .with("keep", self.config.keep2)
            .with("error", hosted_error);
        if request.explain {
            rerank_hosted = rerank_hosted.with("samples", samples(&stage2));
        }
        trace.push(rerank_hosted);

        // Boost and compose
        let boosted = apply_boosts(stage2, now_unix(), BoostConfig::from(&self.config));
        let pinned = boosted.iter().filter(|i| i.pinned()).count();
        let mut boost = TraceEvent::new("boost")
            .with("count", boosted.len())
            .with("pinned", pinned)
            .with("half_life_days", self.config.half_life_days);
        if request.explain {
            boost = boost.with("samples", samples(&boosted));
        }
        trace.push(boost);

        // Intent type filter
        let before_filter = boosted.len();
        let outcome = apply_type_filter(boosted, self.config.allow_list_for(&request.intent));
        trace.push(
            TraceEvent::new("type_filter")
                .with("applied", outcome.applied)
                .with("before", before_filter)
                .with("after", outcome.items.len())
                .with("fallback", outcome.fallback),
        );

        // Token-budget trim
        let before_trim = outcome.items.len();
        let trimmed = trim_to_budget(outcome.items, budget.token_budget, &*self.token_counter);
        let tokens_used: usize = trimmed.iter().map(|i| (self.token_counter)(&i.text)).sum();
        let mut trim = TraceEvent::new("trim")
            .with("before", before_trim)
            .with("kept", trimmed.len())
            .with("token_budget", budget.token_budget)
            .with("tokens_used", tokens_used)
            .with("elapsed_ms", elapsed_ms(started));
        if request.explain {
            trim = trim.with("order", ids(&trimmed));
        }
        trace.push(trim);

        // Cache store
        let texts: Vec<String> = trimmed.into_iter().map(|i| i.text).collect();
        if let Some(key) = key {
            self.cache.insert(key, texts.clone(), trace.clone());
        }

        metrics::record_pipeline_duration(started.elapsed());
        tracing::debug!(
            user_id = %request.user_id,
            intent = %request.intent,
            results = texts.len(),
            elapsed_ms = elapsed_ms(started),
            "Pipeline complete"
        );

        PipelineOutput {
            texts,
            trace,
            cache_hit: false,
        }
    }

    /// Embed passages that arrived without a vector; failures leave the
    /// embedding empty. Returns how many were filled.
    async fn embed_missing(&self, items: &mut [RetrievedItem]) -> usize {
        let missing: Vec<usize> = items
            .iter()
            .enumerate()
            .filter(|(_, i)| i.embedding.is_none())
            .map(|(idx, _)| idx)
            .collect();
        if missing.is_empty() {
            return 0;
        }

        let texts: Vec<&str> = missing.iter().map(|&idx| items[idx].text.as_str()).collect();
        let result = self
            .with_timeout("embed", self.embedder.embed_batch(&texts))
            .await;

        match result {
            Ok(embeddings) if embeddings.len() == missing.len() => {
                for (idx, embedding) in missing.iter().zip(embeddings) {
                    items[*idx].embedding = Some(embedding);
                }
                missing.len()
            },
            Ok(_) => {
                tracing::warn!("Passage embedding count mismatch, MMR uses token overlap only");
                0
            },
            Err(e) => {
                tracing::warn!(error = %e, "Passage embedding failed, MMR uses token overlap only");
                metrics::record_backend_error("embed");
                0
            },
        }
    }
}

fn tag_scores(mut items: Vec<RetrievedItem>, key: &str) -> Vec<RetrievedItem> {
    for item in items.iter_mut() {
        let score = item.score;
        item.set_meta(key, score);
    }
    items
}

fn truncated(mut items: Vec<RetrievedItem>, keep: usize) -> Vec<RetrievedItem> {
    items.truncate(keep);
    items
}

fn ids(items: &[RetrievedItem]) -> Vec<String> {
    items.iter().map(|i| i.id.clone()).collect()
}

fn samples(items: &[RetrievedItem]) -> Value {
    Value::Array(
        items
            .iter()
            .take(TRACE_SAMPLES)
            .map(|i| json!({ "id": i.id, "score": i.score }))
            .collect(),
    )
}

fn elapsed_ms(since: Instant) -> f64 {
    since.elapsed().as_secs_f64() * 1000.0
}
