//! In-process store
//!
//! Plain maps behind `RwLock`s. Vectors come from the injected embedder
//! (the deterministic hash stub by default) and are compared with the same
//! `MatchRule` the remote backends use.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use recall_config::constants::{retrieval, store};
use recall_core::{normalize_text, now_unix, Embedder, HashEmbedder};

use crate::metrics;
use crate::record::{
    latest_entry, rank_matches, Feedback, MatchRule, MemoryInput, MemoryRecord, QaCacheEntry,
    ScoredMemory,
};
use crate::{StoreError, VectorStore};

/// In-memory vector store
pub struct MemoryStore {
    embedder: Arc<dyn Embedder>,
    rule: MatchRule,
    /// user_id → id → record
    memories: RwLock<HashMap<String, HashMap<String, MemoryRecord>>>,
    /// cache_id → entry
    qa: RwLock<HashMap<String, QaCacheEntry>>,
}

impl MemoryStore {
    pub fn new(embedder: Arc<dyn Embedder>, similarity_threshold: f32) -> Self {
        let rule = MatchRule::for_embedder(
            embedder.kind(),
            similarity_threshold,
            store::LENGTH_DISTANCE_CUTOFF,
        );
        Self {
            embedder,
            rule,
            memories: RwLock::new(HashMap::new()),
            qa: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_rule(mut self, rule: MatchRule) -> Self {
        self.rule = rule;
        self
    }

    /// Total memories across users, including decayed ones
    pub fn memory_count(&self) -> usize {
        self.memories.read().values().map(HashMap::len).sum()
    }

    pub fn qa_count(&self) -> usize {
        self.qa.read().len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(
            Arc::new(HashEmbedder::default()),
            retrieval::SIMILARITY_THRESHOLD,
        )
    }
}

#[async_trait]
impl VectorStore for MemoryStore {
    async fn upsert_memory(&self, user_id: &str, input: MemoryInput) -> Result<String, StoreError> {
        let embedding = self.embedder.embed(&input.text).await?;
        let id = input.record_id(user_id);
        let now = now_unix();

        let mut memories = self.memories.write();
        let user = memories.entry(user_id.to_string()).or_default();
        let record = input.into_record(user_id, user.get(&id), now, embedding);
        user.insert(id.clone(), record);

        tracing::debug!(user_id, id = %id, "Stored memory");
        Ok(id)
    }

    async fn query_user_memories(
        &self,
        user_id: &str,
        query: &str,
        k: usize,
    ) -> Result<Vec<String>, StoreError> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let query_embedding = self.embedder.embed(query).await?;
        let now = now_unix();

        let memories = self.memories.read();
        let Some(user) = memories.get(user_id) else {
            return Ok(Vec::new());
        };

        let matches: Vec<ScoredMemory> = user
            .values()
            .filter(|r| !r.is_expired(now))
            .filter_map(|r| {
                let distance = self.rule.distance(&query_embedding, &r.embedding);
                self.rule
                    .score(query, &r.text, distance)
                    .map(|score| ScoredMemory {
                        text: r.text.clone(),
                        score,
                        created_at: r.created_at,
                    })
            })
            .collect();

        Ok(rank_matches(matches, k))
    }

    async fn list_user_memories(&self, user_id: &str) -> Result<Vec<MemoryRecord>, StoreError> {
        let now = now_unix();
        let mut records: Vec<MemoryRecord> = self
            .memories
            .read()
            .get(user_id)
            .map(|user| user.values().filter(|r| !r.is_expired(now)).cloned().collect())
            .unwrap_or_default();

        records.sort_by(|a, b| {
            b.created_at
                .partial_cmp(&a.created_at)
                .unwrap_or(Ordering::Equal)
        });
        Ok(records)
    }

    async fn delete_user_memory(&self, user_id: &str, id: &str) -> Result<bool, StoreError> {
        Ok(self
            .memories
            .write()
            .get_mut(user_id)
            .and_then(|user| user.remove(id))
            .is_some())
    }

    async fn purge_expired(&self, user_id: &str) -> Result<usize, StoreError> {
        let now = now_unix();
        let mut memories = self.memories.write();
        let Some(user) = memories.get_mut(user_id) else {
            return Ok(0);
        };

        let before = user.len();
        user.retain(|_, r| !r.is_expired(now));
        Ok(before - user.len())
    }

    async fn cache_answer(
        &self,
        cache_id: &str,
        prompt: &str,
        answer: &str,
    ) -> Result<(), StoreError> {
        let entry = QaCacheEntry::new(cache_id, prompt, answer, now_unix());
        self.qa.write().insert(cache_id.to_string(), entry);
        Ok(())
    }

    async fn lookup_cached_answer(
        &self,
        prompt: &str,
        ttl: Duration,
    ) -> Result<Option<String>, StoreError> {
        let prompt_norm = normalize_text(prompt);
        let now = now_unix();

        let mut qa = self.qa.write();
        let latest = latest_entry(
            qa.values()
                .filter(|e| e.prompt_norm == prompt_norm)
                .cloned(),
        );

        match latest {
            Some(entry) if entry.is_fresh(ttl, now) => {
                metrics::record_qa_cache_hit(self.backend_name());
                Ok(Some(entry.answer))
            },
            Some(entry) => {
                qa.remove(&entry.cache_id);
                metrics::record_qa_cache_miss(self.backend_name());
                Ok(None)
            },
            None => {
                metrics::record_qa_cache_miss(self.backend_name());
                Ok(None)
            },
        }
    }

    async fn lookup_cached_answer_by_id(
        &self,
        cache_id: &str,
        ttl: Duration,
    ) -> Result<Option<String>, StoreError> {
        let now = now_unix();
        let mut qa = self.qa.write();

        let fresh = match qa.get(cache_id) {
            Some(entry) if entry.is_fresh(ttl, now) => Some(entry.answer.clone()),
            Some(_) => {
                qa.remove(cache_id);
                None
            },
            None => None,
        };

        if fresh.is_some() {
            metrics::record_qa_cache_hit(self.backend_name());
        } else {
            metrics::record_qa_cache_miss(self.backend_name());
        }
        Ok(fresh)
    }

    async fn record_feedback(&self, prompt: &str, feedback: Feedback) -> Result<(), StoreError> {
        let prompt_norm = normalize_text(prompt);
        let mut qa = self.qa.write();

        match feedback {
            Feedback::Down => {
                let before = qa.len();
                qa.retain(|_, e| e.prompt_norm != prompt_norm);
                tracing::debug!(removed = before - qa.len(), "Invalidated cached answers");
            },
            other => {
                for entry in qa.values_mut().filter(|e| e.prompt_norm == prompt_norm) {
                    entry.feedback = other;
                }
            },
        }
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_add_is_idempotent_per_text() {
        let store = MemoryStore::default();
        let a = store.add_user_memory("u1", "likes jazz").await.unwrap();
        let b = store.add_user_memory("u1", "likes jazz").await.unwrap();

        assert_eq!(a, b);
        assert_eq!(store.memory_count(), 1);
    }

    #[tokio::test]
    async fn test_query_exact_match_and_user_scope() {
        let store = MemoryStore::default();
        store
            .add_user_memory("u1", "my favourite colour is blue")
            .await
            .unwrap();
        store
            .add_user_memory("u2", "my favourite colour is green")
            .await
            .unwrap();

        let hits = store
            .query_user_memories("u1", "my favourite colour is blue", 5)
            .await
            .unwrap();
        assert_eq!(hits, vec!["my favourite colour is blue".to_string()]);

        let none = store
            .query_user_memories("u3", "my favourite colour is blue", 5)
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_delete_and_list() {
        let store = MemoryStore::default();
        let id = store.add_user_memory("u1", "dentist on friday").await.unwrap();
        store.add_user_memory("u1", "gym on monday").await.unwrap();

        assert_eq!(store.list_user_memories("u1").await.unwrap().len(), 2);
        assert!(store.delete_user_memory("u1", &id).await.unwrap());
        assert!(!store.delete_user_memory("u1", &id).await.unwrap());
        assert!(!store.delete_user_memory("u2", &id).await.unwrap());
        assert_eq!(store.list_user_memories("u1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_decayed_memories_hidden_and_purged() {
        let store = MemoryStore::default();
        store
            .upsert_memory("u1", MemoryInput::new("old parking spot").decay_at(1.0))
            .await
            .unwrap();
        store.add_user_memory("u1", "new parking spot").await.unwrap();

        let listed = store.list_user_memories("u1").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].text, "new parking spot");

        let hits = store
            .query_user_memories("u1", "old parking spot", 5)
            .await
            .unwrap();
        assert!(!hits.contains(&"old parking spot".to_string()));

        assert_eq!(store.purge_expired("u1").await.unwrap(), 1);
        assert_eq!(store.memory_count(), 1);
    }

    #[tokio::test]
    async fn test_qa_ttl_evicts() {
        let store = MemoryStore::default();
        store.cache_answer("c1", "capital of france", "Paris").await.unwrap();

        assert_eq!(
            store
                .lookup_cached_answer("Capital of France?", Duration::from_secs(60))
                .await
                .unwrap(),
            Some("Paris".to_string())
        );
        assert_eq!(
            store
                .lookup_cached_answer_by_id("c1", Duration::from_secs(60))
                .await
                .unwrap(),
            Some("Paris".to_string())
        );

        // Zero TTL: only entries from this exact instant would count
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(
            store
                .lookup_cached_answer("capital of france", Duration::ZERO)
                .await
                .unwrap(),
            None
        );
        assert_eq!(store.qa_count(), 0);
    }

    #[tokio::test]
    async fn test_up_feedback_keeps_entry() {
        let store = MemoryStore::default();
        store.cache_answer("c1", "hello", "hi").await.unwrap();
        store.record_feedback("hello", Feedback::Up).await.unwrap();

        assert_eq!(
            store
                .lookup_cached_answer("hello", Duration::from_secs(60))
                .await
                .unwrap(),
            Some("hi".to_string())
        );
        assert_eq!(store.qa.read()["c1"].feedback, Feedback::Up);
    }
}
