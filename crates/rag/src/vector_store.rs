//! Search backend using Qdrant
//!
//! Dense search is `search_points` with a `user_id` filter. Sparse search
//! scrolls points whose `text` full-text index matches any query term and
//! scores them locally by query-term coverage.

use async_trait::async_trait;
use qdrant_client::{
    qdrant::{
        condition::ConditionOneOf, point_id::PointIdOptions, r#match::MatchValue, value::Kind,
        Condition, CreateCollectionBuilder, Distance, FieldCondition, Filter, ListValue, Match,
        PointId, PointStruct, Range, ScrollPointsBuilder, SearchPointsBuilder, Struct,
        UpsertPointsBuilder, VectorParamsBuilder,
    },
    Qdrant,
};
use std::cmp::Ordering;
use std::collections::HashMap;

use recall_config::constants::endpoints;
use recall_core::{keys, token_set, Metadata, RetrievedItem, SearchBackend, SearchFilter};

use crate::RagError;

/// Over-fetch factor for sparse scrolls, which are unranked server-side
const SPARSE_SCROLL_FACTOR: usize = 4;

/// Qdrant search configuration
#[derive(Debug, Clone)]
pub struct QdrantSearchConfig {
    /// Qdrant endpoint
    pub endpoint: String,
    /// API key (optional)
    pub api_key: Option<String>,
    /// Vector dimension for collections created by `ensure_collection`
    pub vector_dim: usize,
}

impl Default for QdrantSearchConfig {
    fn default() -> Self {
        Self {
            endpoint: endpoints::QDRANT_DEFAULT.to_string(),
            api_key: None,
            vector_dim: recall_config::constants::store::VECTOR_DIM,
        }
    }
}

/// Qdrant-backed search adapter
pub struct QdrantSearchBackend {
    client: Qdrant,
    config: QdrantSearchConfig,
}

impl QdrantSearchBackend {
    /// Connect to Qdrant, authenticating with the API key when configured
    pub fn new(config: QdrantSearchConfig) -> Result<Self, RagError> {
        let mut builder = Qdrant::from_url(&config.endpoint);

        if let Some(ref api_key) = config.api_key {
            builder = builder.api_key(api_key.clone());
            tracing::info!("Qdrant connection using API key authentication");
        }

        let client = builder
            .build()
            .map_err(|e| RagError::Connection(e.to_string()))?;

        Ok(Self { client, config })
    }

    /// Create collection if not exists
    pub async fn ensure_collection(&self, collection: &str) -> Result<(), RagError> {
        let exists = self
            .client
            .collection_exists(collection)
            .await
            .map_err(|e| RagError::VectorStore(e.to_string()))?;

        if !exists {
            self.client
                .create_collection(CreateCollectionBuilder::new(collection).vectors_config(
                    VectorParamsBuilder::new(self.config.vector_dim as u64, Distance::Cosine),
                ))
                .await
                .map_err(|e| RagError::VectorStore(e.to_string()))?;
            tracing::info!(collection, "Created Qdrant collection");
        }

        Ok(())
    }

    /// Insert passages for a user with their embeddings
    pub async fn upsert(
        &self,
        collection: &str,
        user_id: &str,
        items: &[RetrievedItem],
        embeddings: &[Vec<f32>],
    ) -> Result<(), RagError> {
        if items.len() != embeddings.len() {
            return Err(RagError::VectorStore(
                "Item and embedding count mismatch".to_string(),
            ));
        }

        let points: Vec<PointStruct> = items
            .iter()
            .zip(embeddings.iter())
            .map(|(item, emb)| {
                let mut payload: HashMap<String, qdrant_client::qdrant::Value> = item
                    .metadata
                    .iter()
                    .map(|(k, v)| (k.clone(), json_to_qdrant(v)))
                    .collect();
                payload.insert(keys::TEXT.to_string(), item.text.clone().into());
                payload.insert(keys::USER_ID.to_string(), user_id.to_string().into());
                payload.insert("item_id".to_string(), item.id.clone().into());

                let point_id = uuid::Uuid::new_v5(
                    &uuid::Uuid::NAMESPACE_OID,
                    format!("{}/{}/{}", collection, user_id, item.id).as_bytes(),
                );
                PointStruct::new(point_id.to_string(), emb.clone(), payload)
            })
            .collect();

        self.client
            .upsert_points(UpsertPointsBuilder::new(collection, points).wait(true))
            .await
            .map_err(|e| RagError::VectorStore(e.to_string()))?;

        Ok(())
    }

    async fn scroll_text_matches(
        &self,
        collection: &str,
        user_id: &str,
        query: &str,
        limit: usize,
        filter: Option<&SearchFilter>,
    ) -> Result<Vec<RetrievedItem>, RagError> {
        let terms = token_set(query);
        if terms.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let mut qdrant_filter = user_filter(user_id, filter);
        qdrant_filter.should = terms
            .iter()
            .map(|t| match_condition(keys::TEXT, MatchValue::Text(t.clone())))
            .collect();

        let response = self
            .client
            .scroll(
                ScrollPointsBuilder::new(collection)
                    .filter(qdrant_filter)
                    .limit((limit * SPARSE_SCROLL_FACTOR) as u32)
                    .with_payload(true),
            )
            .await
            .map_err(|e| RagError::Search(e.to_string()))?;

        let mut items: Vec<RetrievedItem> = response
            .result
            .into_iter()
            .map(|point| {
                let (text, metadata) = split_payload(point.payload);
                let id = item_id(&metadata, point.id);
                let score = term_coverage(&terms, &text);
                RetrievedItem {
                    id,
                    text,
                    score,
                    metadata,
                    embedding: None,
                }
            })
            .collect();

        items.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        items.truncate(limit);
        Ok(items)
    }
}

#[async_trait]
impl SearchBackend for QdrantSearchBackend {
    async fn dense_search(
        &self,
        collection: &str,
        user_id: &str,
        vector: &[f32],
        limit: usize,
        filter: Option<&SearchFilter>,
    ) -> recall_core::Result<Vec<RetrievedItem>> {
        let search = SearchPointsBuilder::new(collection, vector.to_vec(), limit as u64)
            .filter(user_filter(user_id, filter))
            .with_payload(true);

        let results = self
            .client
            .search_points(search)
            .await
            .map_err(|e| RagError::Search(e.to_string()))?;

        Ok(results
            .result
            .into_iter()
            .map(|point| {
                let (text, metadata) = split_payload(point.payload);
                let id = item_id(&metadata, point.id);
                RetrievedItem {
                    id,
                    text,
                    score: point.score,
                    metadata,
                    embedding: None,
                }
            })
            .collect())
    }

    async fn sparse_search(
        &self,
        collection: &str,
        user_id: &str,
        query: &str,
        limit: usize,
        filter: Option<&SearchFilter>,
    ) -> recall_core::Result<Vec<RetrievedItem>> {
        Ok(self
            .scroll_text_matches(collection, user_id, query, limit, filter)
            .await?)
    }

    fn name(&self) -> &str {
        "qdrant"
    }
}

/// Fraction of query terms present in the text
pub fn term_coverage(terms: &std::collections::HashSet<String>, text: &str) -> f32 {
    if terms.is_empty() {
        return 0.0;
    }
    let doc_terms = token_set(text);
    terms.iter().filter(|t| doc_terms.contains(*t)).count() as f32 / terms.len() as f32
}

fn match_condition(key: &str, value: MatchValue) -> Condition {
    Condition {
        condition_one_of: Some(ConditionOneOf::Field(FieldCondition {
            key: key.to_string(),
            r#match: Some(Match {
                match_value: Some(value),
            }),
            ..Default::default()
        })),
    }
}

fn range_eq_condition(key: &str, value: f64) -> Condition {
    Condition {
        condition_one_of: Some(ConditionOneOf::Field(FieldCondition {
            key: key.to_string(),
            range: Some(Range {
                gte: Some(value),
                lte: Some(value),
                ..Default::default()
            }),
            ..Default::default()
        })),
    }
}

/// Translate one equality into a Qdrant condition
///
/// Strings match as keywords, booleans and integers match exactly, floats
/// become a closed range. Other JSON shapes are not filterable and are
/// skipped with a warning.
pub fn equality_condition(key: &str, value: &serde_json::Value) -> Option<Condition> {
    match value {
        serde_json::Value::String(s) => Some(match_condition(key, MatchValue::Keyword(s.clone()))),
        serde_json::Value::Bool(b) => Some(match_condition(key, MatchValue::Boolean(*b))),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Some(match_condition(key, MatchValue::Integer(i))),
            None => n.as_f64().map(|f| range_eq_condition(key, f)),
        },
        other => {
            tracing::warn!(key, value = %other, "Unsupported filter value, ignoring condition");
            None
        },
    }
}

/// `user_id == user` plus every extra equality
pub fn user_filter(user_id: &str, extra: Option<&SearchFilter>) -> Filter {
    let mut must = vec![match_condition(
        keys::USER_ID,
        MatchValue::Keyword(user_id.to_string()),
    )];

    if let Some(extra) = extra {
        must.extend(
            extra
                .equals
                .iter()
                .filter_map(|(k, v)| equality_condition(k, v)),
        );
    }

    Filter {
        must,
        ..Default::default()
    }
}

/// Split a point payload into its `text` and the remaining metadata
pub fn split_payload(payload: HashMap<String, qdrant_client::qdrant::Value>) -> (String, Metadata) {
    let mut text = String::new();
    let mut metadata = Metadata::new();

    for (k, v) in payload {
        if k == keys::TEXT {
            if let Some(Kind::StringValue(s)) = v.kind {
                text = s;
            }
        } else {
            metadata.insert(k, qdrant_to_json(v));
        }
    }

    (text, metadata)
}

fn item_id(metadata: &Metadata, point_id: Option<PointId>) -> String {
    metadata
        .get("item_id")
        .and_then(serde_json::Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| point_id_to_string(point_id))
}

pub fn point_id_to_string(point_id: Option<PointId>) -> String {
    point_id
        .and_then(|pid| pid.point_id_options)
        .map(|opts| match opts {
            PointIdOptions::Uuid(u) => u,
            PointIdOptions::Num(n) => n.to_string(),
        })
        .unwrap_or_default()
}

/// Qdrant payload value to JSON
pub fn qdrant_to_json(value: qdrant_client::qdrant::Value) -> serde_json::Value {
    match value.kind {
        None | Some(Kind::NullValue(_)) => serde_json::Value::Null,
        Some(Kind::BoolValue(b)) => serde_json::Value::Bool(b),
        Some(Kind::IntegerValue(i)) => serde_json::Value::from(i),
        Some(Kind::DoubleValue(d)) => serde_json::Number::from_f64(d)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Some(Kind::StringValue(s)) => serde_json::Value::String(s),
        Some(Kind::ListValue(list)) => {
            serde_json::Value::Array(list.values.into_iter().map(qdrant_to_json).collect())
        },
        Some(Kind::StructValue(s)) => serde_json::Value::Object(
            s.fields
                .into_iter()
                .map(|(k, v)| (k, qdrant_to_json(v)))
                .collect(),
        ),
    }
}

/// JSON to Qdrant payload value
pub fn json_to_qdrant(value: &serde_json::Value) -> qdrant_client::qdrant::Value {
    let kind = match value {
        serde_json::Value::Null => Kind::NullValue(0),
        serde_json::Value::Bool(b) => Kind::BoolValue(*b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Kind::IntegerValue(i),
            None => Kind::DoubleValue(n.as_f64().unwrap_or(0.0)),
        },
        serde_json::Value::String(s) => Kind::StringValue(s.clone()),
        serde_json::Value::Array(values) => Kind::ListValue(ListValue {
            values: values.iter().map(json_to_qdrant).collect(),
        }),
        serde_json::Value::Object(map) => Kind::StructValue(Struct {
            fields: map
                .iter()
                .map(|(k, v)| (k.clone(), json_to_qdrant(v)))
                .collect(),
        }),
    };
    qdrant_client::qdrant::Value { kind: Some(kind) }
}
