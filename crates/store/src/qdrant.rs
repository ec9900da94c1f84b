//! Qdrant store
//!
//! One collection per user for memories plus a shared QA-cache collection.
//! Collections are created on first write with cosine distance and payload
//! indexes for filtered search; reads against a missing collection are
//! empty rather than errors.

use async_trait::async_trait;
use parking_lot::RwLock;
use qdrant_client::{
    qdrant::{
        CreateCollectionBuilder, CreateFieldIndexCollectionBuilder, DeletePointsBuilder,
        Distance, FieldType, Filter, GetPointsBuilder, PointId, PointStruct, PointsIdsList,
        RetrievedPoint, ScrollPointsBuilder, SearchPointsBuilder, UpsertPointsBuilder,
        VectorParamsBuilder,
    },
    Qdrant,
};
use serde_json::json;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use recall_config::constants::{endpoints, retrieval, store};
use recall_config::StoreConfig;
use recall_core::{keys, normalize_text, now_unix, Embedder, Metadata};
use recall_rag::vector_store::{
    equality_condition, json_to_qdrant, point_id_to_string, split_payload, user_filter,
};

use crate::metrics;
use crate::record::{
    fields, latest_entry, rank_matches, Feedback, MemoryInput, MemoryRecord, QaCacheEntry,
    ScoredMemory,
};
use crate::{StoreError, VectorStore};

/// Page size for scrolls
const SCROLL_PAGE: u32 = 256;

/// Over-fetch factor so decayed or rejected hits don't starve `k`
const QUERY_FETCH_FACTOR: usize = 2;

fn fetch_limit(k: usize) -> u64 {
    k.saturating_mul(QUERY_FETCH_FACTOR) as u64
}

/// Characters Qdrant rejects in collection names
const FORBIDDEN_NAME_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*', '\0'];

/// Memory payload fields indexed for filtered search
const MEMORY_INDEXES: &[(&str, FieldType)] = &[
    (keys::USER_ID, FieldType::Keyword),
    (keys::TYPE, FieldType::Keyword),
    (keys::TOPIC, FieldType::Keyword),
    (keys::CREATED_AT, FieldType::Float),
    (keys::SOURCE_TIER, FieldType::Float),
    (keys::PINNED, FieldType::Bool),
];

const QA_INDEXES: &[(&str, FieldType)] = &[
    (fields::PROMPT_NORM, FieldType::Keyword),
    (fields::CACHE_ID, FieldType::Keyword),
];

/// Qdrant store configuration
#[derive(Debug, Clone)]
pub struct QdrantStoreConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub qa_collection: String,
    /// Global keep rule for memory queries
    pub similarity_threshold: f32,
    pub timeout: Duration,
}

impl Default for QdrantStoreConfig {
    fn default() -> Self {
        Self {
            url: endpoints::QDRANT_DEFAULT.to_string(),
            api_key: None,
            qa_collection: store::QA_COLLECTION.to_string(),
            similarity_threshold: retrieval::SIMILARITY_THRESHOLD,
            timeout: Duration::from_secs(5),
        }
    }
}

impl From<&StoreConfig> for QdrantStoreConfig {
    fn from(config: &StoreConfig) -> Self {
        Self {
            url: config.qdrant_url.clone(),
            api_key: config.qdrant_api_key.clone(),
            qa_collection: config.qa_collection.clone(),
            similarity_threshold: config.similarity_threshold,
            timeout: Duration::from_millis(config.timeout_ms),
        }
    }
}

/// Physical collection holding a user's memories
///
/// Logically `mem:user:<id>`; characters Qdrant rejects become `_`.
pub fn user_collection_name(user_id: &str) -> String {
    format!("{}{}", store::USER_COLLECTION_PREFIX, user_id)
        .chars()
        .map(|c| if FORBIDDEN_NAME_CHARS.contains(&c) { '_' } else { c })
        .collect()
}

fn qa_point_id(cache_id: &str) -> String {
    uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, cache_id.as_bytes()).to_string()
}

fn backend_err(e: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(e.to_string())
}

/// Qdrant-backed store
pub struct QdrantStore {
    client: Qdrant,
    config: QdrantStoreConfig,
    embedder: Arc<dyn Embedder>,
    /// Collections known to exist
    ready: RwLock<HashSet<String>>,
}

impl QdrantStore {
    pub fn new(config: QdrantStoreConfig, embedder: Arc<dyn Embedder>) -> Result<Self, StoreError> {
        let mut builder = Qdrant::from_url(&config.url).timeout(config.timeout);

        if let Some(ref api_key) = config.api_key {
            builder = builder.api_key(api_key.clone());
            tracing::info!("Qdrant store using API key authentication");
        }

        let client = builder
            .build()
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        Ok(Self {
            client,
            config,
            embedder,
            ready: RwLock::new(HashSet::new()),
        })
    }

    async fn collection_exists(&self, collection: &str) -> Result<bool, StoreError> {
        if self.ready.read().contains(collection) {
            return Ok(true);
        }
        let exists = self
            .client
            .collection_exists(collection)
            .await
            .map_err(backend_err)?;
        if exists {
            self.ready.write().insert(collection.to_string());
        }
        Ok(exists)
    }

    /// Create the collection and its payload indexes if missing
    async fn ensure_collection(
        &self,
        collection: &str,
        indexes: &[(&str, FieldType)],
    ) -> Result<(), StoreError> {
        if self.collection_exists(collection).await? {
            return Ok(());
        }

        self.client
            .create_collection(CreateCollectionBuilder::new(collection).vectors_config(
                VectorParamsBuilder::new(self.embedder.dim() as u64, Distance::Cosine),
            ))
            .await
            .map_err(backend_err)?;

        for (field, field_type) in indexes {
            self.client
                .create_field_index(
                    CreateFieldIndexCollectionBuilder::new(collection, *field, *field_type)
                        .wait(true),
                )
                .await
                .map_err(backend_err)?;
        }

        self.ready.write().insert(collection.to_string());
        tracing::info!(collection, "Created Qdrant collection");
        Ok(())
    }

    async fn get_point(
        &self,
        collection: &str,
        point_id: &str,
    ) -> Result<Option<RetrievedPoint>, StoreError> {
        let response = self
            .client
            .get_points(
                GetPointsBuilder::new(collection, vec![PointId::from(point_id.to_string())])
                    .with_payload(true),
            )
            .await
            .map_err(backend_err)?;
        Ok(response.result.into_iter().next())
    }

    /// Every point matching `filter`, following scroll pages
    async fn scroll_all(
        &self,
        collection: &str,
        filter: Filter,
    ) -> Result<Vec<RetrievedPoint>, StoreError> {
        let mut points = Vec::new();
        let mut offset: Option<PointId> = None;

        loop {
            let mut request = ScrollPointsBuilder::new(collection)
                .filter(filter.clone())
                .limit(SCROLL_PAGE)
                .with_payload(true);
            if let Some(next) = offset.take() {
                request = request.offset(next);
            }

            let response = self.client.scroll(request).await.map_err(backend_err)?;
            points.extend(response.result);

            match response.next_page_offset {
                Some(next) => offset = Some(next),
                None => break,
            }
        }

        Ok(points)
    }

    async fn delete_points(&self, collection: &str, ids: Vec<String>) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        self.client
            .delete_points(
                DeletePointsBuilder::new(collection)
                    .points(PointsIdsList {
                        ids: ids.into_iter().map(PointId::from).collect(),
                    })
                    .wait(true),
            )
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn upsert_point(
        &self,
        collection: &str,
        point_id: &str,
        vector: Vec<f32>,
        text: &str,
        metadata: &Metadata,
    ) -> Result<(), StoreError> {
        let mut payload: HashMap<String, qdrant_client::qdrant::Value> = metadata
            .iter()
            .map(|(k, v)| (k.clone(), json_to_qdrant(v)))
            .collect();
        payload.insert(keys::TEXT.to_string(), text.to_string().into());

        self.client
            .upsert_points(
                UpsertPointsBuilder::new(
                    collection,
                    vec![PointStruct::new(point_id.to_string(), vector, payload)],
                )
                .wait(true),
            )
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn user_records(&self, user_id: &str) -> Result<Vec<MemoryRecord>, StoreError> {
        let collection = user_collection_name(user_id);
        if !self.collection_exists(&collection).await? {
            return Ok(Vec::new());
        }
        let points = self
            .scroll_all(&collection, user_filter(user_id, None))
            .await?;
        Ok(points.into_iter().filter_map(point_to_record).collect())
    }

    fn prompt_filter(prompt: &str) -> Filter {
        Filter {
            must: equality_condition(fields::PROMPT_NORM, &json!(normalize_text(prompt)))
                .into_iter()
                .collect(),
            ..Default::default()
        }
    }

    /// QA entries cached for a prompt; unparseable points are dropped
    async fn qa_entries_for(&self, prompt: &str) -> Result<Vec<QaCacheEntry>, StoreError> {
        let collection = &self.config.qa_collection;
        if !self.collection_exists(collection).await? {
            return Ok(Vec::new());
        }

        let points = self
            .scroll_all(collection, Self::prompt_filter(prompt))
            .await?;
        let mut corrupt = Vec::new();
        let mut entries = Vec::new();
        for point in points {
            let id = point_id_to_string(point.id);
            let (_, meta) = split_payload(point.payload);
            match QaCacheEntry::from_metadata(&meta) {
                Some(entry) => entries.push(entry),
                None => corrupt.push(id),
            }
        }

        if !corrupt.is_empty() {
            tracing::warn!(count = corrupt.len(), "Dropping malformed QA cache entries");
            if let Err(e) = self.delete_points(collection, corrupt).await {
                tracing::warn!(error = %e, "Failed to drop malformed QA cache entries");
            }
        }
        Ok(entries)
    }

    async fn resolve_fresh(
        &self,
        entry: Option<QaCacheEntry>,
        ttl: Duration,
    ) -> Result<Option<String>, StoreError> {
        let answer = match entry {
            Some(entry) if entry.is_fresh(ttl, now_unix()) => Some(entry.answer),
            Some(entry) => {
                self.delete_points(&self.config.qa_collection, vec![qa_point_id(&entry.cache_id)])
                    .await?;
                None
            },
            None => None,
        };

        if answer.is_some() {
            metrics::record_qa_cache_hit(self.backend_name());
        } else {
            metrics::record_qa_cache_miss(self.backend_name());
        }
        Ok(answer)
    }
}

fn point_to_record(point: RetrievedPoint) -> Option<MemoryRecord> {
    let id = point_id_to_string(point.id);
    let (text, meta) = split_payload(point.payload);
    match MemoryRecord::from_metadata(id, text, &meta) {
        Ok(record) => Some(record),
        Err(e) => {
            tracing::debug!(error = %e, "Skipping malformed Qdrant memory");
            None
        },
    }
}

#[async_trait]
impl VectorStore for QdrantStore {
    async fn upsert_memory(&self, user_id: &str, input: MemoryInput) -> Result<String, StoreError> {
        let collection = user_collection_name(user_id);
        self.ensure_collection(&collection, MEMORY_INDEXES).await?;

        let id = input.record_id(user_id);
        let previous = self
            .get_point(&collection, &id)
            .await?
            .and_then(point_to_record);

        let embedding = self.embedder.embed(&input.text).await?;
        let record = input.into_record(user_id, previous.as_ref(), now_unix(), Vec::new());
        self.upsert_point(&collection, &record.id, embedding, &record.text, &record.to_metadata())
            .await?;

        tracing::debug!(user_id, id = %record.id, "Stored memory in Qdrant");
        Ok(record.id)
    }

    async fn query_user_memories(
        &self,
        user_id: &str,
        query: &str,
        k: usize,
    ) -> Result<Vec<String>, StoreError> {
        let collection = user_collection_name(user_id);
        if k == 0 || !self.collection_exists(&collection).await? {
            return Ok(Vec::new());
        }

        let query_embedding = self.embedder.embed(query).await?;
        let response = self
            .client
            .search_points(
                SearchPointsBuilder::new(&collection, query_embedding, fetch_limit(k))
                    .filter(user_filter(user_id, None))
                    .score_threshold(self.config.similarity_threshold)
                    .with_payload(true),
            )
            .await
            .map_err(backend_err)?;

        let now = now_unix();
        let matches: Vec<ScoredMemory> = response
            .result
            .into_iter()
            .filter_map(|point| {
                let score = point.score;
                let (text, meta) = split_payload(point.payload);
                let record =
                    MemoryRecord::from_metadata(point_id_to_string(point.id), text, &meta).ok()?;
                (!record.is_expired(now)).then(|| ScoredMemory {
                    text: record.text,
                    score,
                    created_at: record.created_at,
                })
            })
            .collect();

        Ok(rank_matches(matches, k))
    }

    async fn list_user_memories(&self, user_id: &str) -> Result<Vec<MemoryRecord>, StoreError> {
        let now = now_unix();
        let mut records: Vec<MemoryRecord> = self
            .user_records(user_id)
            .await?
            .into_iter()
            .filter(|r| !r.is_expired(now))
            .collect();
        records.sort_by(|a, b| {
            b.created_at
                .partial_cmp(&a.created_at)
                .unwrap_or(Ordering::Equal)
        });
        Ok(records)
    }

    async fn delete_user_memory(&self, user_id: &str, id: &str) -> Result<bool, StoreError> {
        let collection = user_collection_name(user_id);
        if !self.collection_exists(&collection).await? {
            return Ok(false);
        }
        if self.get_point(&collection, id).await?.is_none() {
            return Ok(false);
        }
        self.delete_points(&collection, vec![id.to_string()]).await?;
        Ok(true)
    }

    async fn purge_expired(&self, user_id: &str) -> Result<usize, StoreError> {
        let now = now_unix();
        let expired: Vec<String> = self
            .user_records(user_id)
            .await?
            .into_iter()
            .filter(|r| r.is_expired(now))
            .map(|r| r.id)
            .collect();
        let count = expired.len();
        self.delete_points(&user_collection_name(user_id), expired)
            .await?;
        Ok(count)
    }

    async fn cache_answer(
        &self,
        cache_id: &str,
        prompt: &str,
        answer: &str,
    ) -> Result<(), StoreError> {
        let collection = self.config.qa_collection.clone();
        self.ensure_collection(&collection, QA_INDEXES).await?;

        let entry = QaCacheEntry::new(cache_id, prompt, answer, now_unix());
        let embedding = self.embedder.embed(prompt).await?;
        self.upsert_point(
            &collection,
            &qa_point_id(cache_id),
            embedding,
            prompt,
            &entry.to_metadata(),
        )
        .await
    }

    async fn lookup_cached_answer(
        &self,
        prompt: &str,
        ttl: Duration,
    ) -> Result<Option<String>, StoreError> {
        let entries = self.qa_entries_for(prompt).await?;
        self.resolve_fresh(latest_entry(entries), ttl).await
    }

    async fn lookup_cached_answer_by_id(
        &self,
        cache_id: &str,
        ttl: Duration,
    ) -> Result<Option<String>, StoreError> {
        let collection = &self.config.qa_collection;
        if !self.collection_exists(collection).await? {
            metrics::record_qa_cache_miss(self.backend_name());
            return Ok(None);
        }

        let entry = self
            .get_point(collection, &qa_point_id(cache_id))
            .await?
            .and_then(|point| QaCacheEntry::from_metadata(&split_payload(point.payload).1));
        self.resolve_fresh(entry, ttl).await
    }

    async fn record_feedback(&self, prompt: &str, feedback: Feedback) -> Result<(), StoreError> {
        let entries = self.qa_entries_for(prompt).await?;
        let collection = self.config.qa_collection.clone();

        match feedback {
            Feedback::Down => {
                let ids = entries.iter().map(|e| qa_point_id(&e.cache_id)).collect();
                self.delete_points(&collection, ids).await
            },
            other => {
                for mut entry in entries {
                    entry.feedback = other;
                    let embedding = self.embedder.embed(&entry.prompt).await?;
                    self.upsert_point(
                        &collection,
                        &qa_point_id(&entry.cache_id),
                        embedding,
                        &entry.prompt,
                        &entry.to_metadata(),
                    )
                    .await?;
                }
                Ok(())
            },
        }
    }

    fn backend_name(&self) -> &'static str {
        "qdrant"
    }
}
