//! User memory and QA-cache stores
//!
//! One `VectorStore` interface with four implementations:
//! - `MemoryStore`: in-process maps, used for tests and `ENV=test`
//! - `ChromaStore`: single Chroma collection over its REST API
//! - `QdrantStore`: one collection per user plus a shared QA collection
//! - `DualReadStore`: primary with fallback reads and optional mirrored writes
//!
//! The concrete store is chosen once by [`build_store`] from the DSN in
//! `StoreConfig`.

pub mod chroma;
pub mod dual;
pub mod factory;
pub mod memory;
pub mod metrics;
pub mod qdrant;
pub mod record;

pub use chroma::{ChromaConfig, ChromaStore};
pub use dual::DualReadStore;
pub use factory::{build_store, parse_dsn, StoreScheme};
pub use memory::MemoryStore;
pub use qdrant::{QdrantStore, QdrantStoreConfig};
pub use record::{
    checksum, memory_point_id, qa_cache_id, rank_matches, Feedback, MatchRule, MemoryInput,
    MemoryRecord, QaCacheEntry, ScoredMemory,
};

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Malformed record: {0}")]
    Malformed(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<StoreError> for recall_core::Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Config(msg) => recall_core::Error::Config(msg),
            StoreError::Embedding(msg) => recall_core::Error::Embedding(msg),
            other => recall_core::Error::Store(other.to_string()),
        }
    }
}

impl From<recall_core::Error> for StoreError {
    fn from(err: recall_core::Error) -> Self {
        match err {
            recall_core::Error::Embedding(msg) => StoreError::Embedding(msg),
            recall_core::Error::Config(msg) => StoreError::Config(msg),
            recall_core::Error::Serialization(e) => StoreError::Serialization(e),
            recall_core::Error::Backend(msg) | recall_core::Error::Store(msg) => {
                StoreError::Backend(msg)
            },
            other => StoreError::Backend(other.to_string()),
        }
    }
}

/// Backend-agnostic user memory and QA-answer cache
///
/// Memory ids are derived from `(user_id, doc_id)`, so every backend
/// assigns the same id to the same memory and re-ingestion is idempotent.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Store a plain text memory; the text checksum is its dedupe key
    async fn add_user_memory(&self, user_id: &str, text: &str) -> Result<String, StoreError> {
        self.upsert_memory(user_id, MemoryInput::new(text)).await
    }

    /// Insert or replace a memory keyed by its `doc_id`
    async fn upsert_memory(&self, user_id: &str, input: MemoryInput) -> Result<String, StoreError>;

    /// Texts similar to `query`, best-first, ties broken by most recent
    async fn query_user_memories(
        &self,
        user_id: &str,
        query: &str,
        k: usize,
    ) -> Result<Vec<String>, StoreError>;

    /// Live (not decayed) memories, newest first
    async fn list_user_memories(&self, user_id: &str) -> Result<Vec<MemoryRecord>, StoreError>;

    /// Returns whether the memory existed
    async fn delete_user_memory(&self, user_id: &str, id: &str) -> Result<bool, StoreError>;

    /// Remove memories past their decay horizon
    async fn purge_expired(&self, user_id: &str) -> Result<usize, StoreError>;

    async fn cache_answer(&self, cache_id: &str, prompt: &str, answer: &str)
        -> Result<(), StoreError>;

    /// Most recent answer cached for the normalized prompt, if fresh
    async fn lookup_cached_answer(
        &self,
        prompt: &str,
        ttl: Duration,
    ) -> Result<Option<String>, StoreError>;

    async fn lookup_cached_answer_by_id(
        &self,
        cache_id: &str,
        ttl: Duration,
    ) -> Result<Option<String>, StoreError>;

    /// `Down` deletes every entry cached for the prompt
    async fn record_feedback(&self, prompt: &str, feedback: Feedback) -> Result<(), StoreError>;

    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str;
}
