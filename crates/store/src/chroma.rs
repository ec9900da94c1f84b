//! Chroma store
//!
//! Talks to Chroma's REST API (`/api/v1/collections/...`). All users share
//! one memory collection scoped by a `user_id` where-clause; the QA cache
//! lives in its own collection. With the length stub embedder the memory
//! collection uses `l2` space and a distance cutoff, otherwise `cosine`
//! space and a similarity threshold.

use async_trait::async_trait;
use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;

use recall_config::constants::{endpoints, store};
use recall_config::StoreConfig;
use recall_core::{keys, normalize_text, now_unix, Embedder, Metadata};

use crate::metrics;
use crate::record::{
    fields, latest_entry, rank_matches, Feedback, MatchRule, MemoryInput, MemoryRecord,
    QaCacheEntry, ScoredMemory,
};
use crate::{StoreError, VectorStore};

/// Over-fetch factor so decayed or rejected hits don't starve `k`
const QUERY_FETCH_FACTOR: usize = 2;

fn fetch_limit(k: usize) -> usize {
    k.saturating_mul(QUERY_FETCH_FACTOR)
}

/// Chroma configuration
#[derive(Debug, Clone)]
pub struct ChromaConfig {
    pub url: String,
    /// Sent as `x-chroma-token`
    pub token: Option<String>,
    pub collection: String,
    pub qa_collection: String,
    pub similarity_threshold: f32,
    pub length_distance_cutoff: f32,
    pub timeout: Duration,
}

impl Default for ChromaConfig {
    fn default() -> Self {
        Self {
            url: endpoints::CHROMA_DEFAULT.to_string(),
            token: None,
            collection: store::CHROMA_COLLECTION.to_string(),
            qa_collection: store::QA_COLLECTION.to_string(),
            similarity_threshold: store::CHROMA_SIMILARITY_THRESHOLD,
            length_distance_cutoff: store::LENGTH_DISTANCE_CUTOFF,
            timeout: Duration::from_secs(5),
        }
    }
}

impl From<&StoreConfig> for ChromaConfig {
    fn from(config: &StoreConfig) -> Self {
        Self {
            url: config.chroma_url.clone(),
            token: config.chroma_token.clone(),
            collection: config.chroma_collection.clone(),
            qa_collection: config.qa_collection.clone(),
            similarity_threshold: config.chroma_similarity_threshold,
            length_distance_cutoff: config.length_distance_cutoff,
            timeout: Duration::from_millis(config.timeout_ms),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CollectionResponse {
    id: String,
}

/// `/get` response: flat columns
#[derive(Debug, Default, Deserialize)]
struct GetResponse {
    #[serde(default)]
    ids: Vec<String>,
    #[serde(default)]
    documents: Option<Vec<Option<String>>>,
    #[serde(default)]
    metadatas: Option<Vec<Option<Map<String, Value>>>>,
}

/// `/query` response: one column list per query embedding
#[derive(Debug, Default, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    ids: Vec<Vec<String>>,
    #[serde(default)]
    documents: Option<Vec<Vec<Option<String>>>>,
    #[serde(default)]
    metadatas: Option<Vec<Vec<Option<Map<String, Value>>>>>,
    #[serde(default)]
    distances: Option<Vec<Vec<Option<f32>>>>,
}

#[derive(Debug, Clone, PartialEq)]
struct Row {
    id: String,
    document: String,
    metadata: Metadata,
    distance: f32,
}

impl GetResponse {
    fn into_rows(self) -> Vec<Row> {
        let mut documents = self.documents.unwrap_or_default().into_iter();
        let mut metadatas = self.metadatas.unwrap_or_default().into_iter();

        self.ids
            .into_iter()
            .map(|id| Row {
                id,
                document: documents.next().flatten().unwrap_or_default(),
                metadata: into_metadata(metadatas.next().flatten()),
                distance: 0.0,
            })
            .collect()
    }
}

impl QueryResponse {
    /// Rows for the first (only) query embedding
    fn into_rows(self) -> Vec<Row> {
        let ids = self.ids.into_iter().next().unwrap_or_default();
        let mut documents = first_column(self.documents).into_iter();
        let mut metadatas = first_column(self.metadatas).into_iter();
        let mut distances = first_column(self.distances).into_iter();

        ids.into_iter()
            .map(|id| Row {
                id,
                document: documents.next().flatten().unwrap_or_default(),
                metadata: into_metadata(metadatas.next().flatten()),
                distance: distances.next().flatten().unwrap_or(f32::INFINITY),
            })
            .collect()
    }
}

fn first_column<T>(columns: Option<Vec<Vec<T>>>) -> Vec<T> {
    columns
        .and_then(|cols| cols.into_iter().next())
        .unwrap_or_default()
}

fn into_metadata(map: Option<Map<String, Value>>) -> Metadata {
    map.map(|m| m.into_iter().collect()).unwrap_or_default()
}

/// Chroma where-clause; several conditions are combined with `$and`
pub fn where_clause(conditions: &[(&str, Value)]) -> Value {
    let mut clauses: Vec<Value> = conditions
        .iter()
        .map(|(k, v)| {
            let mut m = Map::new();
            m.insert(k.to_string(), v.clone());
            Value::Object(m)
        })
        .collect();

    match clauses.len() {
        0 => Value::Object(Map::new()),
        1 => clauses.swap_remove(0),
        _ => json!({ "$and": clauses }),
    }
}

/// Chroma-backed store
pub struct ChromaStore {
    client: Client,
    config: ChromaConfig,
    embedder: Arc<dyn Embedder>,
    rule: MatchRule,
    memory_collection: OnceCell<String>,
    qa_collection: OnceCell<String>,
}

impl ChromaStore {
    pub fn new(config: ChromaConfig, embedder: Arc<dyn Embedder>) -> Result<Self, StoreError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let rule = MatchRule::for_embedder(
            embedder.kind(),
            config.similarity_threshold,
            config.length_distance_cutoff,
        );
        tracing::info!(url = %config.url, collection = %config.collection, rule = ?rule, "Chroma store configured");

        Ok(Self {
            client,
            config,
            embedder,
            rule,
            memory_collection: OnceCell::new(),
            qa_collection: OnceCell::new(),
        })
    }

    async fn post<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<reqwest::Response, StoreError> {
        let url = format!("{}{}", self.config.url.trim_end_matches('/'), path);
        let mut request = self.client.post(&url).json(body);
        if let Some(ref token) = self.config.token {
            request = request.header("x-chroma-token", token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| StoreError::Connection(format!("Chroma request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(StoreError::Backend(format!(
                "Chroma {} failed: {} - {}",
                path, status, text
            )));
        }
        Ok(response)
    }

    async fn post_json<B: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R, StoreError> {
        self.post(path, body)
            .await?
            .json()
            .await
            .map_err(|e| StoreError::Backend(format!("Malformed Chroma response: {}", e)))
    }

    async fn collection_id<'a>(
        &self,
        cell: &'a OnceCell<String>,
        name: &str,
        space: &str,
    ) -> Result<&'a str, StoreError> {
        cell.get_or_try_init(|| async {
            let body = json!({
                "name": name,
                "metadata": { "hnsw:space": space },
                "get_or_create": true,
            });
            let response: CollectionResponse = self.post_json("/api/v1/collections", &body).await?;
            tracing::debug!(collection = name, id = %response.id, "Resolved Chroma collection");
            Ok::<_, StoreError>(response.id)
        })
        .await
        .map(String::as_str)
    }

    async fn memory_collection(&self) -> Result<&str, StoreError> {
        let space = match self.rule {
            MatchRule::Similarity { .. } => "cosine",
            MatchRule::LengthDistance { .. } => "l2",
        };
        self.collection_id(&self.memory_collection, &self.config.collection, space)
            .await
    }

    async fn qa_collection(&self) -> Result<&str, StoreError> {
        self.collection_id(&self.qa_collection, &self.config.qa_collection, "cosine")
            .await
    }

    async fn get_rows(
        &self,
        collection_id: &str,
        ids: Option<&[&str]>,
        where_: Option<Value>,
    ) -> Result<Vec<Row>, StoreError> {
        let mut body = json!({ "include": ["documents", "metadatas"] });
        if let Some(ids) = ids {
            body["ids"] = json!(ids);
        }
        if let Some(where_) = where_ {
            body["where"] = where_;
        }
        let response: GetResponse = self
            .post_json(&format!("/api/v1/collections/{}/get", collection_id), &body)
            .await?;
        Ok(response.into_rows())
    }

    async fn delete_ids(&self, collection_id: &str, ids: &[String]) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        self.post(
            &format!("/api/v1/collections/{}/delete", collection_id),
            &json!({ "ids": ids }),
        )
        .await?;
        Ok(())
    }

    async fn upsert_row(
        &self,
        collection_id: &str,
        id: &str,
        embedding: Vec<f32>,
        document: &str,
        metadata: Metadata,
    ) -> Result<(), StoreError> {
        let body = json!({
            "ids": [id],
            "embeddings": [embedding],
            "documents": [document],
            "metadatas": [metadata],
        });
        self.post(&format!("/api/v1/collections/{}/upsert", collection_id), &body)
            .await?;
        Ok(())
    }

    async fn user_records(&self, user_id: &str) -> Result<Vec<MemoryRecord>, StoreError> {
        let collection = self.memory_collection().await?;
        let rows = self
            .get_rows(collection, None, Some(where_clause(&[(keys::USER_ID, json!(user_id))])))
            .await?;
        Ok(rows.into_iter().filter_map(row_to_record).collect())
    }

    /// Parse QA rows, deleting the ones that no longer parse
    async fn qa_entries(&self, collection_id: &str, rows: Vec<Row>) -> Vec<QaCacheEntry> {
        let mut corrupt = Vec::new();
        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            match QaCacheEntry::from_metadata(&row.metadata) {
                Some(entry) => entries.push(entry),
                None => corrupt.push(row.id),
            }
        }

        if !corrupt.is_empty() {
            tracing::warn!(count = corrupt.len(), "Dropping malformed QA cache entries");
            if let Err(e) = self.delete_ids(collection_id, &corrupt).await {
                tracing::warn!(error = %e, "Failed to drop malformed QA cache entries");
            }
        }
        entries
    }

    async fn resolve_fresh(
        &self,
        collection_id: &str,
        entry: Option<QaCacheEntry>,
        ttl: Duration,
    ) -> Result<Option<String>, StoreError> {
        let answer = match entry {
            Some(entry) if entry.is_fresh(ttl, now_unix()) => Some(entry.answer),
            Some(entry) => {
                self.delete_ids(collection_id, &[entry.cache_id]).await?;
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

fn row_to_record(row: Row) -> Option<MemoryRecord> {
    match MemoryRecord::from_metadata(row.id, row.document, &row.metadata) {
        Ok(record) => Some(record),
        Err(e) => {
            tracing::debug!(error = %e, "Skipping malformed Chroma memory");
            None
        },
    }
}

#[async_trait]
impl VectorStore for ChromaStore {
    async fn upsert_memory(&self, user_id: &str, input: MemoryInput) -> Result<String, StoreError> {
        let collection = self.memory_collection().await?;
        let id = input.record_id(user_id);

        let previous = self
            .get_rows(
                collection,
                Some(&[id.as_str()]),
                Some(where_clause(&[(keys::USER_ID, json!(user_id))])),
            )
            .await?
            .into_iter()
            .find_map(row_to_record);

        let embedding = self.embedder.embed(&input.text).await?;
        let record = input.into_record(user_id, previous.as_ref(), now_unix(), Vec::new());

        self.upsert_row(collection, &record.id, embedding, &record.text, record.to_metadata())
            .await?;
        tracing::debug!(user_id, id = %record.id, "Stored memory in Chroma");
        Ok(record.id)
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
        let collection = self.memory_collection().await?;
        let query_embedding = self.embedder.embed(query).await?;

        let body = json!({
            "query_embeddings": [query_embedding],
            "n_results": fetch_limit(k),
            "where": where_clause(&[(keys::USER_ID, json!(user_id))]),
            "include": ["documents", "metadatas", "distances"],
        });
        let response: QueryResponse = self
            .post_json(&format!("/api/v1/collections/{}/query", collection), &body)
            .await?;

        let now = now_unix();
        let matches: Vec<ScoredMemory> = response
            .into_rows()
            .into_iter()
            .filter_map(|row| {
                let distance = row.distance;
                let record = row_to_record(row)?;
                if record.is_expired(now) {
                    return None;
                }
                self.rule
                    .score(query, &record.text, distance)
                    .map(|score| ScoredMemory {
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
        let collection = self.memory_collection().await?;
        let existing = self
            .get_rows(
                collection,
                Some(&[id]),
                Some(where_clause(&[(keys::USER_ID, json!(user_id))])),
            )
            .await?;
        if existing.is_empty() {
            return Ok(false);
        }
        self.delete_ids(collection, &[id.to_string()]).await?;
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

        let collection = self.memory_collection().await?;
        self.delete_ids(collection, &expired).await?;
        Ok(expired.len())
    }

    async fn cache_answer(
        &self,
        cache_id: &str,
        prompt: &str,
        answer: &str,
    ) -> Result<(), StoreError> {
        let collection = self.qa_collection().await?;
        let entry = QaCacheEntry::new(cache_id, prompt, answer, now_unix());
        let embedding = self.embedder.embed(prompt).await?;
        self.upsert_row(collection, cache_id, embedding, prompt, entry.to_metadata())
            .await
    }

    async fn lookup_cached_answer(
        &self,
        prompt: &str,
        ttl: Duration,
    ) -> Result<Option<String>, StoreError> {
        let collection = self.qa_collection().await?;
        let rows = self
            .get_rows(
                collection,
                None,
                Some(where_clause(&[(fields::PROMPT_NORM, json!(normalize_text(prompt)))])),
            )
            .await?;
        let entries = self.qa_entries(collection, rows).await;
        self.resolve_fresh(collection, latest_entry(entries), ttl).await
    }

    async fn lookup_cached_answer_by_id(
        &self,
        cache_id: &str,
        ttl: Duration,
    ) -> Result<Option<String>, StoreError> {
        let collection = self.qa_collection().await?;
        let rows = self.get_rows(collection, Some(&[cache_id]), None).await?;
        let entries = self.qa_entries(collection, rows).await;
        self.resolve_fresh(collection, latest_entry(entries), ttl).await
    }

    async fn record_feedback(&self, prompt: &str, feedback: Feedback) -> Result<(), StoreError> {
        let collection = self.qa_collection().await?;
        let rows = self
            .get_rows(
                collection,
                None,
                Some(where_clause(&[(fields::PROMPT_NORM, json!(normalize_text(prompt)))])),
            )
            .await?;
        let ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();

        match feedback {
            Feedback::Down => self.delete_ids(collection, &ids).await,
            other if !ids.is_empty() => {
                let metadatas: Vec<Metadata> = rows
                    .into_iter()
                    .map(|mut r| {
                        r.metadata
                            .insert(fields::FEEDBACK.to_string(), other.as_str().into());
                        r.metadata
                    })
                    .collect();
                self.post(
                    &format!("/api/v1/collections/{}/update", collection),
                    &json!({ "ids": ids, "metadatas": metadatas }),
                )
                .await?;
                Ok(())
            },
            _ => Ok(()),
        }
    }

    fn backend_name(&self) -> &'static str {
        "chroma"
    }
}
