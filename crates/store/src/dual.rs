//! Dual-read store
//!
//! Reads go to the primary and fall back to the secondary when the primary
//! errors or comes back empty. Writes always go to the primary and are
//! mirrored to the fallback only with `write_both`; mirror failures are
//! logged, never returned. Fallback data may be stale relative to primary.

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::metrics;
use crate::record::{Feedback, MemoryInput, MemoryRecord};
use crate::{StoreError, VectorStore};

/// Primary/fallback pair
pub struct DualReadStore {
    primary: Arc<dyn VectorStore>,
    fallback: Arc<dyn VectorStore>,
    write_both: bool,
}

trait ReadOutcome {
    fn is_empty_read(&self) -> bool;
}

impl<T> ReadOutcome for Vec<T> {
    fn is_empty_read(&self) -> bool {
        self.is_empty()
    }
}

impl<T> ReadOutcome for Option<T> {
    fn is_empty_read(&self) -> bool {
        self.is_none()
    }
}

impl DualReadStore {
    pub fn new(primary: Arc<dyn VectorStore>, fallback: Arc<dyn VectorStore>, write_both: bool) -> Self {
        tracing::info!(
            primary = primary.backend_name(),
            fallback = fallback.backend_name(),
            write_both,
            "Dual-read store configured"
        );
        Self {
            primary,
            fallback,
            write_both,
        }
    }

    pub fn write_both(&self) -> bool {
        self.write_both
    }

    /// Primary result unless it failed or was empty
    async fn read<T, P, F>(&self, op: &'static str, primary: P, fallback: F) -> Result<T, StoreError>
    where
        T: ReadOutcome,
        P: Future<Output = Result<T, StoreError>>,
        F: Future<Output = Result<T, StoreError>>,
    {
        let primary_result = match primary.await {
            Ok(value) if !value.is_empty_read() => return Ok(value),
            Ok(value) => Ok(value),
            Err(e) => {
                tracing::warn!(error = %e, op, "Primary read failed, trying fallback");
                Err(e)
            },
        };

        metrics::record_dual_read_fallback(op);
        match (fallback.await, primary_result) {
            (Ok(value), _) => Ok(value),
            // Primary answered empty; a failing fallback doesn't turn that into an error
            (Err(e), Ok(empty)) => {
                tracing::warn!(error = %e, op, "Fallback read failed");
                Ok(empty)
            },
            (Err(e), Err(_)) => Err(e),
        }
    }

    /// Primary write, mirrored to the fallback when enabled
    async fn write<T, P, F>(&self, op: &'static str, primary: P, mirror: F) -> Result<T, StoreError>
    where
        P: Future<Output = Result<T, StoreError>>,
        F: Future<Output = Result<T, StoreError>>,
    {
        if !self.write_both {
            return primary.await;
        }

        let (primary_result, mirror_result) = futures::join!(primary, mirror);
        if let Err(e) = mirror_result {
            tracing::warn!(error = %e, op, "Mirrored write to fallback failed");
        }
        primary_result
    }
}

#[async_trait]
impl VectorStore for DualReadStore {
    async fn upsert_memory(&self, user_id: &str, input: MemoryInput) -> Result<String, StoreError> {
        self.write(
            "upsert_memory",
            self.primary.upsert_memory(user_id, input.clone()),
            self.fallback.upsert_memory(user_id, input),
        )
        .await
    }

    async fn query_user_memories(
        &self,
        user_id: &str,
        query: &str,
        k: usize,
    ) -> Result<Vec<String>, StoreError> {
        self.read(
            "query_user_memories",
            self.primary.query_user_memories(user_id, query, k),
            self.fallback.query_user_memories(user_id, query, k),
        )
        .await
    }

    async fn list_user_memories(&self, user_id: &str) -> Result<Vec<MemoryRecord>, StoreError> {
        self.read(
            "list_user_memories",
            self.primary.list_user_memories(user_id),
            self.fallback.list_user_memories(user_id),
        )
        .await
    }

    async fn delete_user_memory(&self, user_id: &str, id: &str) -> Result<bool, StoreError> {
        self.write(
            "delete_user_memory",
            self.primary.delete_user_memory(user_id, id),
            self.fallback.delete_user_memory(user_id, id),
        )
        .await
    }

    async fn purge_expired(&self, user_id: &str) -> Result<usize, StoreError> {
        self.write(
            "purge_expired",
            self.primary.purge_expired(user_id),
            self.fallback.purge_expired(user_id),
        )
        .await
    }

    async fn cache_answer(
        &self,
        cache_id: &str,
        prompt: &str,
        answer: &str,
    ) -> Result<(), StoreError> {
        self.write(
            "cache_answer",
            self.primary.cache_answer(cache_id, prompt, answer),
            self.fallback.cache_answer(cache_id, prompt, answer),
        )
        .await
    }

    async fn lookup_cached_answer(
        &self,
        prompt: &str,
        ttl: Duration,
    ) -> Result<Option<String>, StoreError> {
        self.read(
            "lookup_cached_answer",
            self.primary.lookup_cached_answer(prompt, ttl),
            self.fallback.lookup_cached_answer(prompt, ttl),
        )
        .await
    }

    async fn lookup_cached_answer_by_id(
        &self,
        cache_id: &str,
        ttl: Duration,
    ) -> Result<Option<String>, StoreError> {
        self.read(
            "lookup_cached_answer_by_id",
            self.primary.lookup_cached_answer_by_id(cache_id, ttl),
            self.fallback.lookup_cached_answer_by_id(cache_id, ttl),
        )
        .await
    }

    /// Feedback always reaches both sides, so a down-voted answer cannot
    /// resurface through a fallback read
    async fn record_feedback(&self, prompt: &str, feedback: Feedback) -> Result<(), StoreError> {
        let (primary, fallback) = futures::join!(
            self.primary.record_feedback(prompt, feedback),
            self.fallback.record_feedback(prompt, feedback)
        );
        if let Err(e) = fallback {
            tracing::warn!(error = %e, "Feedback on fallback store failed");
        }
        primary
    }

    async fn close(&self) -> Result<(), StoreError> {
        let (primary, fallback) = futures::join!(self.primary.close(), self.fallback.close());
        primary.and(fallback)
    }

    fn backend_name(&self) -> &'static str {
        "dual"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;

    fn pair(write_both: bool) -> (Arc<MemoryStore>, Arc<MemoryStore>, DualReadStore) {
        let primary = Arc::new(MemoryStore::default());
        let fallback = Arc::new(MemoryStore::default());
        let dual = DualReadStore::new(primary.clone(), fallback.clone(), write_both);
        (primary, fallback, dual)
    }

    #[tokio::test]
    async fn test_writes_mirror_only_with_flag() {
        let (primary, fallback, dual) = pair(false);
        dual.add_user_memory("u1", "likes jazz").await.unwrap();
        assert_eq!(primary.memory_count(), 1);
        assert_eq!(fallback.memory_count(), 0);

        let (primary, fallback, dual) = pair(true);
        let id = dual.add_user_memory("u1", "likes jazz").await.unwrap();
        assert_eq!(primary.memory_count(), 1);
        assert_eq!(fallback.memory_count(), 1);

        // Same deterministic id on both sides
        assert!(dual.delete_user_memory("u1", &id).await.unwrap());
        assert_eq!(fallback.memory_count(), 0);
    }

    #[tokio::test]
    async fn test_list_falls_back_when_primary_empty() {
        let (_primary, fallback, dual) = pair(false);
        fallback.add_user_memory("u1", "old memory").await.unwrap();

        let listed = dual.list_user_memories("u1").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].text, "old memory");
    }

    #[tokio::test]
    async fn test_down_feedback_reaches_fallback() {
        let (_primary, fallback, dual) = pair(false);
        fallback.cache_answer("c1", "hello", "hi").await.unwrap();

        dual.record_feedback("hello", Feedback::Down).await.unwrap();
        assert_eq!(fallback.qa_count(), 0);
    }
}
