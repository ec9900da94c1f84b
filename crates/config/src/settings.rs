//! Main settings module

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::constants::{endpoints, retrieval, store};
use crate::ConfigError;

/// Runtime environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeEnvironment {
    /// Test mode - always uses the in-memory store
    Test,
    /// Development mode - relaxed validation, in-memory fallback
    #[default]
    Development,
    /// Staging mode - stricter validation
    Staging,
    /// Production mode - all validations enforced
    Production,
}

impl RuntimeEnvironment {
    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }

    /// Misconfiguration is fatal instead of falling back to memory
    pub fn is_strict(&self) -> bool {
        matches!(self, Self::Production | Self::Staging)
    }
}

/// Main application settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub environment: RuntimeEnvironment,

    /// Retrieval pipeline tuning
    #[serde(default)]
    pub retrieval: RetrievalConfig,

    /// Vector store selection and connection
    #[serde(default)]
    pub store: StoreConfig,

    /// Embedding collaborator
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Hosted reranker
    #[serde(default)]
    pub reranker: RerankerSettings,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Per-intent candidate counts and token budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentBudget {
    #[serde(default = "default_k_dense")]
    pub k_dense: usize,
    #[serde(default = "default_k_sparse")]
    pub k_sparse: usize,
    #[serde(default = "default_token_budget")]
    pub token_budget: usize,
}

fn default_k_dense() -> usize {
    40
}
fn default_k_sparse() -> usize {
    40
}
fn default_token_budget() -> usize {
    1200
}

impl IntentBudget {
    pub const fn new(k_dense: usize, k_sparse: usize, token_budget: usize) -> Self {
        Self {
            k_dense,
            k_sparse,
            token_budget,
        }
    }
}

impl Default for IntentBudget {
    fn default() -> Self {
        Self::new(default_k_dense(), default_k_sparse(), default_token_budget())
    }
}

/// Retrieval pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Reciprocal Rank Fusion smoothing constant
    #[serde(default = "default_rrf_k")]
    pub rrf_k: f32,

    /// MMR trade-off (1.0 = pure relevance)
    #[serde(default = "default_mmr_lambda")]
    pub mmr_lambda: f32,

    /// Cap on the fused pool before MMR
    #[serde(default = "default_mmr_pool_max")]
    pub mmr_pool_max: usize,

    /// Items selected by MMR
    #[serde(default = "default_mmr_k")]
    pub mmr_k: usize,

    /// Items kept by the local reranker
    #[serde(default = "default_keep1")]
    pub keep1: usize,

    /// Items kept after the hosted stage
    #[serde(default = "default_keep2")]
    pub keep2: usize,

    /// Dense keep rule (cosine similarity)
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,

    /// Time-decay half-life
    #[serde(default = "default_half_life_days")]
    pub half_life_days: f64,

    /// Quality boost per source tier
    #[serde(default = "default_quality_step")]
    pub quality_step: f32,

    /// Result cache TTL
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    /// Result cache capacity (oldest entry evicted first)
    #[serde(default = "default_cache_max_entries")]
    pub cache_max_entries: usize,

    /// Per-call backend timeout
    #[serde(default = "default_backend_timeout_ms")]
    pub backend_timeout_ms: u64,

    /// Per-intent budgets; unknown intents use `chat`
    #[serde(default = "default_budgets")]
    pub budgets: HashMap<String, IntentBudget>,

    /// Per-intent allow-lists of metadata `type`
    #[serde(default = "default_type_allow_lists")]
    pub type_allow_lists: HashMap<String, Vec<String>>,
}

fn default_rrf_k() -> f32 {
    retrieval::RRF_K
}
fn default_mmr_lambda() -> f32 {
    retrieval::MMR_LAMBDA
}
fn default_mmr_pool_max() -> usize {
    retrieval::MMR_POOL_MAX
}
fn default_mmr_k() -> usize {
    retrieval::MMR_K
}
fn default_keep1() -> usize {
    retrieval::KEEP_LOCAL
}
fn default_keep2() -> usize {
    retrieval::KEEP_HOSTED
}
fn default_similarity_threshold() -> f32 {
    retrieval::SIMILARITY_THRESHOLD
}
fn default_half_life_days() -> f64 {
    retrieval::HALF_LIFE_DAYS
}
fn default_quality_step() -> f32 {
    retrieval::QUALITY_STEP
}
fn default_cache_ttl_secs() -> u64 {
    retrieval::CACHE_TTL_SECS
}
fn default_cache_max_entries() -> usize {
    retrieval::CACHE_MAX_ENTRIES
}
fn default_backend_timeout_ms() -> u64 {
    retrieval::BACKEND_TIMEOUT_MS
}
fn default_budgets() -> HashMap<String, IntentBudget> {
    HashMap::from([
        ("chat".to_string(), IntentBudget::new(40, 40, 1200)),
        ("ha".to_string(), IntentBudget::new(20, 20, 600)),
        ("search".to_string(), IntentBudget::new(80, 80, 2000)),
    ])
}
fn default_type_allow_lists() -> HashMap<String, Vec<String>> {
    HashMap::from([(
        "ha".to_string(),
        vec![
            "device".to_string(),
            "automation".to_string(),
            "ha".to_string(),
        ],
    )])
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            rrf_k: default_rrf_k(),
            mmr_lambda: default_mmr_lambda(),
            mmr_pool_max: default_mmr_pool_max(),
            mmr_k: default_mmr_k(),
            keep1: default_keep1(),
            keep2: default_keep2(),
            similarity_threshold: default_similarity_threshold(),
            half_life_days: default_half_life_days(),
            quality_step: default_quality_step(),
            cache_ttl_secs: default_cache_ttl_secs(),
            cache_max_entries: default_cache_max_entries(),
            backend_timeout_ms: default_backend_timeout_ms(),
            budgets: default_budgets(),
            type_allow_lists: default_type_allow_lists(),
        }
    }
}

impl RetrievalConfig {
    /// Budget for an intent; unknown intents get the chat budget
    pub fn budget_for(&self, intent: &str) -> IntentBudget {
        self.budgets
            .get(intent)
            .or_else(|| self.budgets.get(retrieval::DEFAULT_INTENT))
            .copied()
            .unwrap_or_default()
    }

    /// Allowed metadata types for an intent, if it is restricted
    pub fn allow_list_for(&self, intent: &str) -> Option<&[String]> {
        self.type_allow_lists
            .get(intent)
            .map(Vec::as_slice)
            .filter(|list| !list.is_empty())
    }
}

/// Vector store configuration
///
/// `dsn` selects the backend: `memory`, `chroma`, `qdrant` or `dual`
/// (Qdrant primary, Chroma fallback). A URL may follow the scheme, e.g.
/// `qdrant://10.0.0.5:6334`, overriding the matching `*_url` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_dsn")]
    pub dsn: String,

    #[serde(default = "default_chroma_url")]
    pub chroma_url: String,

    /// Chroma cloud token (`x-chroma-token` header)
    #[serde(default)]
    pub chroma_token: Option<String>,

    #[serde(default = "default_chroma_collection")]
    pub chroma_collection: String,

    #[serde(default = "default_qdrant_url")]
    pub qdrant_url: String,

    #[serde(default)]
    pub qdrant_api_key: Option<String>,

    /// Shared QA cache collection
    #[serde(default = "default_qa_collection")]
    pub qa_collection: String,

    /// Keep rule for Qdrant and memory stores
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,

    /// Keep rule for Chroma with a semantic embedder
    #[serde(default = "default_chroma_similarity_threshold")]
    pub chroma_similarity_threshold: f32,

    /// Distance cutoff for Chroma with the length stub embedder
    #[serde(default = "default_length_distance_cutoff")]
    pub length_distance_cutoff: f32,

    /// Mirror writes to the fallback store (dual only)
    #[serde(default)]
    pub write_both: bool,

    /// Fail construction on misconfiguration even outside staging/production
    #[serde(default)]
    pub strict: bool,

    /// Request timeout for store HTTP/gRPC calls
    #[serde(default = "default_store_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_dsn() -> String {
    "memory".to_string()
}
fn default_chroma_url() -> String {
    endpoints::CHROMA_DEFAULT.to_string()
}
fn default_chroma_collection() -> String {
    store::CHROMA_COLLECTION.to_string()
}
fn default_qdrant_url() -> String {
    endpoints::QDRANT_DEFAULT.to_string()
}
fn default_qa_collection() -> String {
    store::QA_COLLECTION.to_string()
}
fn default_chroma_similarity_threshold() -> f32 {
    store::CHROMA_SIMILARITY_THRESHOLD
}
fn default_length_distance_cutoff() -> f32 {
    store::LENGTH_DISTANCE_CUTOFF
}
fn default_store_timeout_ms() -> u64 {
    5_000
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dsn: default_dsn(),
            chroma_url: default_chroma_url(),
            chroma_token: None,
            chroma_collection: default_chroma_collection(),
            qdrant_url: default_qdrant_url(),
            qdrant_api_key: None,
            qa_collection: default_qa_collection(),
            similarity_threshold: default_similarity_threshold(),
            chroma_similarity_threshold: default_chroma_similarity_threshold(),
            length_distance_cutoff: default_length_distance_cutoff(),
            write_both: false,
            strict: false,
            timeout_ms: default_store_timeout_ms(),
        }
    }
}

/// Embedding collaborator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// `hash`, `length` or `ollama`
    #[serde(default = "default_embedding_provider")]
    pub provider: String,

    #[serde(default = "default_ollama_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_embedding_model")]
    pub model: String,

    #[serde(default = "default_vector_dim")]
    pub dim: usize,
}

fn default_embedding_provider() -> String {
    "hash".to_string()
}
fn default_ollama_endpoint() -> String {
    endpoints::OLLAMA_DEFAULT.to_string()
}
fn default_embedding_model() -> String {
    "nomic-embed-text".to_string()
}
fn default_vector_dim() -> usize {
    store::VECTOR_DIM
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            endpoint: default_ollama_endpoint(),
            model: default_embedding_model(),
            dim: default_vector_dim(),
        }
    }
}

/// Hosted reranker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankerSettings {
    /// Run the second (hosted) rerank stage
    #[serde(default)]
    pub hosted_enabled: bool,

    /// `passthrough` or `http`
    #[serde(default = "default_reranker_provider")]
    pub provider: String,

    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default)]
    pub model: Option<String>,

    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_reranker_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_reranker_provider() -> String {
    "passthrough".to_string()
}
fn default_reranker_timeout_ms() -> u64 {
    3_000
}

impl Default for RerankerSettings {
    fn default() -> Self {
        Self {
            hosted_enabled: false,
            provider: default_reranker_provider(),
            endpoint: None,
            model: None,
            api_key: None,
            timeout_ms: default_reranker_timeout_ms(),
        }
    }
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub log_json: bool,

    /// Install the Prometheus recorder
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_json: false,
            metrics_enabled: true,
        }
    }
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    /// `environment = test` or the process-level `ENV=test` switch
    pub fn is_test(&self) -> bool {
        self.environment == RuntimeEnvironment::Test
            || std::env::var("ENV").map(|v| v == "test").unwrap_or(false)
    }

    /// Misconfiguration is fatal
    pub fn is_strict(&self) -> bool {
        self.store.strict || self.environment.is_strict()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_retrieval()?;
        self.validate_store()?;
        self.validate_embedding()?;
        Ok(())
    }

    fn validate_retrieval(&self) -> Result<(), ConfigError> {
        let r = &self.retrieval;

        if r.rrf_k <= 0.0 {
            return Err(invalid("retrieval.rrf_k", format!("Must be positive, got {}", r.rrf_k)));
        }

        check_unit("retrieval.mmr_lambda", r.mmr_lambda)?;
        check_unit("retrieval.similarity_threshold", r.similarity_threshold)?;

        if r.quality_step < 0.0 {
            return Err(invalid(
                "retrieval.quality_step",
                format!("Must not be negative, got {}", r.quality_step),
            ));
        }

        if r.half_life_days <= 0.0 {
            return Err(invalid(
                "retrieval.half_life_days",
                format!("Must be positive, got {}", r.half_life_days),
            ));
        }

        if r.mmr_k == 0 || r.keep1 == 0 || r.keep2 == 0 {
            return Err(invalid(
                "retrieval.mmr_k/keep1/keep2",
                "Selection sizes must be at least 1".to_string(),
            ));
        }

        if r.keep2 > r.keep1 {
            return Err(invalid(
                "retrieval.keep2",
                format!("Cannot exceed keep1 ({} > {})", r.keep2, r.keep1),
            ));
        }

        if r.cache_max_entries == 0 {
            return Err(invalid(
                "retrieval.cache_max_entries",
                "Must be at least 1".to_string(),
            ));
        }

        for (intent, budget) in &r.budgets {
            if budget.token_budget == 0 {
                return Err(invalid(
                    &format!("retrieval.budgets.{}.token_budget", intent),
                    "Must be at least 1".to_string(),
                ));
            }
        }

        Ok(())
    }

    fn validate_store(&self) -> Result<(), ConfigError> {
        let s = &self.store;
        check_unit("store.similarity_threshold", s.similarity_threshold)?;
        check_unit("store.chroma_similarity_threshold", s.chroma_similarity_threshold)?;

        if s.length_distance_cutoff < 0.0 {
            return Err(invalid(
                "store.length_distance_cutoff",
                format!("Must not be negative, got {}", s.length_distance_cutoff),
            ));
        }

        Ok(())
    }

    fn validate_embedding(&self) -> Result<(), ConfigError> {
        if self.embedding.dim == 0 {
            return Err(invalid("embedding.dim", "Must be at least 1".to_string()));
        }
        Ok(())
    }
}

fn invalid(field: &str, message: String) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        message,
    }
}

fn check_unit(field: &str, value: f32) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&value) {
        return Err(invalid(
            field,
            format!("Must be between 0.0 and 1.0, got {}", value),
        ));
    }
    Ok(())
}

/// Load settings from files and environment
///
/// Priority (highest to lowest):
/// 1. Environment variables (`RECALL__` prefix, e.g. `RECALL__STORE__DSN=qdrant`)
/// 2. config/{env}.* (if env specified)
/// 3. config/default.*
pub fn load_settings(env: Option<&str>) -> Result<Settings, ConfigError> {
    let mut builder = Config::builder();

    builder = builder.add_source(File::with_name("config/default").required(false));

    if let Some(env_name) = env {
        builder =
            builder.add_source(File::with_name(&format!("config/{}", env_name)).required(false));
    }

    builder = builder.add_source(
        Environment::with_prefix("RECALL")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    );

    let config = builder.build()?;
    let settings: Settings = config.try_deserialize()?;

    settings.validate()?;

    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings_validate() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.store.dsn, "memory");
        assert_eq!(settings.retrieval.mmr_k, 60);
        assert_eq!(settings.retrieval.keep1, 24);
        assert_eq!(settings.retrieval.keep2, 12);
        assert_eq!(settings.retrieval.similarity_threshold, 0.75);
        assert_eq!(settings.store.chroma_similarity_threshold, 0.76);
    }

    #[test]
    fn test_unknown_intent_uses_chat_budget() {
        let retrieval = RetrievalConfig::default();
        let chat = retrieval.budget_for("chat");
        assert_eq!(retrieval.budget_for("weather"), chat);
        assert_ne!(retrieval.budget_for("ha"), chat);
    }

    #[test]
    fn test_budget_without_chat_entry_falls_back_to_default() {
        let mut retrieval = RetrievalConfig::default();
        retrieval.budgets.clear();
        assert_eq!(retrieval.budget_for("anything"), IntentBudget::default());
    }

    #[test]
    fn test_allow_list_lookup() {
        let retrieval = RetrievalConfig::default();
        assert!(retrieval.allow_list_for("ha").is_some());
        assert!(retrieval.allow_list_for("chat").is_none());
    }

    #[test]
    fn test_retrieval_validation() {
        let mut settings = Settings::default();

        settings.retrieval.mmr_lambda = 1.5;
        assert!(settings.validate().is_err());
        settings.retrieval.mmr_lambda = 0.6;

        settings.retrieval.rrf_k = 0.0;
        assert!(settings.validate().is_err());
        settings.retrieval.rrf_k = 60.0;

        settings.retrieval.keep2 = 30;
        assert!(settings.validate().is_err());
        settings.retrieval.keep2 = 12;

        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_store_validation() {
        let mut settings = Settings::default();
        settings.store.similarity_threshold = -0.1;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_strictness() {
        let mut settings = Settings::default();
        assert!(!settings.is_strict());

        settings.environment = RuntimeEnvironment::Production;
        assert!(settings.is_strict());

        settings.environment = RuntimeEnvironment::Development;
        settings.store.strict = true;
        assert!(settings.is_strict());
    }

    #[test]
    fn test_deserialize_partial_budget() {
        let json = serde_json::json!({
            "retrieval": { "budgets": { "chat": { "token_budget": 50 } } }
        });
        let settings: Settings = serde_json::from_value(json).unwrap();
        let chat = settings.retrieval.budget_for("chat");
        assert_eq!(chat.token_budget, 50);
        assert_eq!(chat.k_dense, 40);
    }
}
