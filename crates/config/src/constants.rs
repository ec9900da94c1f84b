//! Centralized constants
//!
//! Single source of truth for default values used across the retrieval
//! pipeline and the store layer.

/// Service endpoints (defaults for local development)
pub mod endpoints {
    /// Qdrant gRPC endpoint
    pub const QDRANT_DEFAULT: &str = "http://127.0.0.1:6334";

    /// Chroma HTTP endpoint
    pub const CHROMA_DEFAULT: &str = "http://127.0.0.1:8000";

    /// Ollama embedding endpoint
    pub const OLLAMA_DEFAULT: &str = "http://localhost:11434";
}

/// Retrieval pipeline defaults
pub mod retrieval {
    /// RRF smoothing constant
    pub const RRF_K: f32 = 60.0;

    /// MMR relevance/diversity trade-off
    pub const MMR_LAMBDA: f32 = 0.6;

    /// Cap on the fused pool handed to MMR
    pub const MMR_POOL_MAX: usize = 200;

    /// Items selected by MMR
    pub const MMR_K: usize = 60;

    /// Items kept by the local reranker
    pub const KEEP_LOCAL: usize = 24;

    /// Items kept after the hosted reranker (or passthrough)
    pub const KEEP_HOSTED: usize = 12;

    /// Global dense keep rule: similarity >= 0.75 (distance <= 0.25)
    pub const SIMILARITY_THRESHOLD: f32 = 0.75;

    /// Half-life for the time-decay boost
    pub const HALF_LIFE_DAYS: f64 = 30.0;

    /// Quality boost per source tier
    pub const QUALITY_STEP: f32 = 0.05;

    /// Result cache time-to-live
    pub const CACHE_TTL_SECS: u64 = 60;

    /// Result cache capacity
    pub const CACHE_MAX_ENTRIES: usize = 256;

    /// Per-call backend timeout
    pub const BACKEND_TIMEOUT_MS: u64 = 2_000;

    /// Intent used when the requested one has no budget
    pub const DEFAULT_INTENT: &str = "chat";
}

/// Composite score weights
pub mod scoring {
    pub const BASE_WEIGHT: f32 = 0.7;
    pub const TIME_WEIGHT: f32 = 0.2;
    pub const QUALITY_WEIGHT: f32 = 0.1;
    pub const PIN_BONUS: f32 = 0.1;
}

/// Vector store defaults
pub mod store {
    /// Similarity threshold for Chroma with a real embedder
    pub const CHROMA_SIMILARITY_THRESHOLD: f32 = 0.76;

    /// Squared-L2 cutoff used with the length stub embedder
    pub const LENGTH_DISTANCE_CUTOFF: f32 = 1.0;

    /// Default Chroma memory collection
    pub const CHROMA_COLLECTION: &str = "user_memories";

    /// Shared QA cache collection
    pub const QA_COLLECTION: &str = "qa_cache";

    /// Per-user memory collection prefix (Qdrant)
    pub const USER_COLLECTION_PREFIX: &str = "mem:user:";

    /// Default embedding dimension
    pub const VECTOR_DIM: usize = 1536;
}
