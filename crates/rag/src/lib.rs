//! Hybrid retrieval pipeline
//!
//! Features:
//! - Dense vector search via Qdrant or an in-process vector map
//! - Sparse BM25 search via Tantivy
//! - Hybrid fusion with RRF
//! - MMR diversification (embedding cosine + token Jaccard)
//! - Two-stage rerank cascade (local cosine proxy, optional hosted)
//! - Time-decay, quality and pin boosts
//! - Per-intent type filtering and token-budget trimming
//! - Short-TTL result cache and per-stage explain trace

pub mod budget;
pub mod cache;
pub mod embeddings;
pub mod fusion;
pub mod local_backend;
pub mod metrics;
pub mod pipeline;
pub mod reranker;
pub mod scoring;
pub mod sparse_search;
pub mod vector_store;

pub use budget::{default_token_counter, estimate_tokens, trim_to_budget, TokenCounter};
pub use cache::{CacheKey, CachedResult, ResultCache};
pub use embeddings::{OllamaEmbedder, OllamaEmbeddingConfig};
pub use fusion::{
    apply_similarity_threshold, average_pairwise_diversity, item_similarity, mmr_select, rrf_fuse,
};
pub use local_backend::LocalSearchBackend;
pub use pipeline::{OrEmpty, Pipeline, PipelineOutput, PipelineRequest};
pub use reranker::{
    length_penalty, HttpReranker, HttpRerankerConfig, LocalReranker, PassthroughReranker,
    RerankerStats, LENGTH_PENALTY_PER_STEP,
};
pub use scoring::{
    apply_boosts, apply_type_filter, composite_score, quality_boost, time_boost, BoostConfig,
    TypeFilterOutcome,
};
pub use sparse_search::{SparseConfig, SparseDocument, SparseIndex, SparseResult};
pub use vector_store::{QdrantSearchBackend, QdrantSearchConfig};

use thiserror::Error;

/// RAG errors
#[derive(Error, Debug)]
pub enum RagError {
    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Vector store error: {0}")]
    VectorStore(String),

    #[error("Search error: {0}")]
    Search(String),

    #[error("Reranker error: {0}")]
    Reranker(String),

    #[error("Index error: {0}")]
    Index(String),

    #[error("Connection error: {0}")]
    Connection(String),
}

impl From<RagError> for recall_core::Error {
    fn from(err: RagError) -> Self {
        match err {
            RagError::Embedding(msg) => recall_core::Error::Embedding(msg),
            RagError::Reranker(msg) => recall_core::Error::Rerank(msg),
            other => recall_core::Error::Backend(other.to_string()),
        }
    }
}
