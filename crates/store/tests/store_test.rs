//! Store behavior through the `VectorStore` trait

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use recall_config::{RuntimeEnvironment, Settings};
use recall_core::{HashEmbedder, LengthEmbedder};
use recall_store::{
    build_store, qa_cache_id, DualReadStore, Feedback, MatchRule, MemoryInput, MemoryRecord,
    MemoryStore, StoreError, VectorStore,
};

/// Every call fails as if the server were down
struct DownStore;

#[async_trait]
impl VectorStore for DownStore {
    async fn upsert_memory(&self, _: &str, _: MemoryInput) -> Result<String, StoreError> {
        Err(StoreError::Connection("down".into()))
    }

    async fn query_user_memories(&self, _: &str, _: &str, _: usize) -> Result<Vec<String>, StoreError> {
        Err(StoreError::Connection("down".into()))
    }

    async fn list_user_memories(&self, _: &str) -> Result<Vec<MemoryRecord>, StoreError> {
        Err(StoreError::Connection("down".into()))
    }

    async fn delete_user_memory(&self, _: &str, _: &str) -> Result<bool, StoreError> {
        Err(StoreError::Connection("down".into()))
    }

    async fn purge_expired(&self, _: &str) -> Result<usize, StoreError> {
        Err(StoreError::Connection("down".into()))
    }

    async fn cache_answer(&self, _: &str, _: &str, _: &str) -> Result<(), StoreError> {
        Err(StoreError::Connection("down".into()))
    }

    async fn lookup_cached_answer(&self, _: &str, _: Duration) -> Result<Option<String>, StoreError> {
        Err(StoreError::Connection("down".into()))
    }

    async fn lookup_cached_answer_by_id(
        &self,
        _: &str,
        _: Duration,
    ) -> Result<Option<String>, StoreError> {
        Err(StoreError::Connection("down".into()))
    }

    async fn record_feedback(&self, _: &str, _: Feedback) -> Result<(), StoreError> {
        Err(StoreError::Connection("down".into()))
    }

    fn backend_name(&self) -> &'static str {
        "down"
    }
}

const TTL: Duration = Duration::from_secs(3600);

#[tokio::test]
async fn test_qa_round_trip_and_down_vote() {
    let store = MemoryStore::default();
    let id = qa_cache_id("kb", "What is the wifi password?", Some("llama3"), None);

    store
        .cache_answer(&id, "What is the wifi password?", "A")
        .await
        .unwrap();

    assert_eq!(
        store
            .lookup_cached_answer("what is the wifi password", TTL)
            .await
            .unwrap()
            .as_deref(),
        Some("A")
    );
    assert_eq!(
        store.lookup_cached_answer_by_id(&id, TTL).await.unwrap().as_deref(),
        Some("A")
    );

    store
        .record_feedback("What is the wifi password?", Feedback::Down)
        .await
        .unwrap();

    assert_eq!(
        store
            .lookup_cached_answer("What is the wifi password?", TTL)
            .await
            .unwrap(),
        None
    );
    assert_eq!(store.lookup_cached_answer_by_id(&id, TTL).await.unwrap(), None);
}

#[tokio::test]
async fn test_latest_answer_wins_for_same_prompt() {
    let store = MemoryStore::default();
    store.cache_answer("c1", "weather today", "sunny").await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    store.cache_answer("c2", "Weather today?", "rainy").await.unwrap();

    assert_eq!(
        store
            .lookup_cached_answer("weather today", TTL)
            .await
            .unwrap()
            .as_deref(),
        Some("rainy")
    );
}

#[tokio::test]
async fn test_upsert_preserves_created_at_and_updates_text_fields() {
    let store = MemoryStore::default();
    let first = MemoryInput::new("car is in level 3").doc_id("parking").topic("car");
    let id = store.upsert_memory("u1", first).await.unwrap();
    let created = store.list_user_memories("u1").await.unwrap()[0].created_at;

    tokio::time::sleep(Duration::from_millis(10)).await;
    let second = MemoryInput::new("car is in level 5").doc_id("parking").topic("car");
    assert_eq!(store.upsert_memory("u1", second).await.unwrap(), id);

    let listed = store.list_user_memories("u1").await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].text, "car is in level 5");
    assert_eq!(listed[0].created_at, created);
    assert!(listed[0].updated_at >= created);
}

#[tokio::test]
async fn test_length_rule_store_matches_exact_text_only() {
    let store = MemoryStore::new(Arc::new(LengthEmbedder), 0.75).with_rule(MatchRule::LengthDistance {
        cutoff: 1.0,
    });
    store.add_user_memory("u1", "abcd").await.unwrap();
    store.add_user_memory("u1", "wxyz").await.unwrap();

    let hits = store.query_user_memories("u1", "abcd", 5).await.unwrap();
    assert_eq!(hits, vec!["abcd".to_string()]);
}

#[tokio::test]
async fn test_dual_store_reads_fallback_when_primary_empty() {
    let primary = Arc::new(MemoryStore::default());
    let fallback = Arc::new(MemoryStore::default());
    fallback
        .add_user_memory("u1", "the spare key is under the mat")
        .await
        .unwrap();

    let dual = DualReadStore::new(primary, fallback, false);
    let hits = dual
        .query_user_memories("u1", "the spare key is under the mat", 3)
        .await
        .unwrap();
    assert_eq!(hits, vec!["the spare key is under the mat".to_string()]);
}

#[tokio::test]
async fn test_dual_store_survives_primary_outage() {
    let fallback = Arc::new(MemoryStore::default());
    fallback.cache_answer("c1", "opening hours", "9 to 5").await.unwrap();

    let dual = DualReadStore::new(Arc::new(DownStore), fallback.clone(), true);
    assert_eq!(
        dual.lookup_cached_answer("opening hours", TTL)
            .await
            .unwrap()
            .as_deref(),
        Some("9 to 5")
    );

    // Writes report the primary's failure even though the mirror succeeded
    assert!(dual.add_user_memory("u1", "note").await.is_err());
    assert_eq!(fallback.memory_count(), 1);
}

#[tokio::test]
async fn test_dual_store_errors_when_both_fail() {
    let dual = DualReadStore::new(Arc::new(DownStore), Arc::new(DownStore), false);
    assert!(dual.list_user_memories("u1").await.is_err());
}

#[tokio::test]
async fn test_dual_store_keeps_empty_primary_when_fallback_fails() {
    let dual = DualReadStore::new(Arc::new(MemoryStore::default()), Arc::new(DownStore), false);
    assert!(dual.query_user_memories("u1", "anything", 3).await.unwrap().is_empty());
    assert_eq!(dual.lookup_cached_answer("anything", TTL).await.unwrap(), None);
}

#[tokio::test]
async fn test_factory_returns_working_memory_store_in_test_mode() {
    let mut settings = Settings::default();
    settings.environment = RuntimeEnvironment::Test;
    settings.store.dsn = "dual".to_string();

    let store = build_store(&settings, Arc::new(HashEmbedder::default())).unwrap();
    assert_eq!(store.backend_name(), "memory");

    store.add_user_memory("u1", "hello there").await.unwrap();
    assert_eq!(
        store.query_user_memories("u1", "hello there", 1).await.unwrap(),
        vec!["hello there".to_string()]
    );
}

#[test]
fn test_core_errors_keep_their_kind() {
    let embedding: StoreError = recall_core::Error::Embedding("model offline".into()).into();
    assert!(matches!(embedding, StoreError::Embedding(_)));

    let backend: StoreError = recall_core::Error::Backend("refused".into()).into();
    assert!(matches!(backend, StoreError::Backend(_)));

    let timeout: StoreError = recall_core::Error::Timeout("embed exceeded 50ms".into()).into();
    assert!(matches!(timeout, StoreError::Backend(ref msg) if msg.contains("Timed out")));

    let config: StoreError = recall_core::Error::Config("bad dim".into()).into();
    assert!(matches!(config, StoreError::Config(_)));
}
