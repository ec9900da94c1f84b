//! Retrieved item
//!
//! The unit that flows through every retrieval stage. `score` is always
//! "higher is better" but its meaning changes per stage (raw similarity,
//! fused RRF score, rerank score, final composite). Metadata accumulates:
//! stages add keys and never remove earlier ones.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Free-form item metadata
pub type Metadata = HashMap<String, Value>;

/// Well-known metadata keys
pub mod keys {
    pub const CREATED_AT: &str = "created_at";
    pub const SOURCE_TIER: &str = "source_tier";
    pub const PINNED: &str = "pinned";
    pub const TYPE: &str = "type";
    pub const TOPIC: &str = "topic";
    pub const USER_ID: &str = "user_id";
    pub const TEXT: &str = "text";

    // Added by pipeline stages
    pub const DENSE_SCORE: &str = "dense_score";
    pub const SPARSE_SCORE: &str = "sparse_score";
    pub const RRF_SCORE: &str = "rrf_score";
    pub const LOCAL_CE: &str = "local_ce";
    pub const HOSTED_SCORE: &str = "hosted_score";
    pub const TIME_BOOST: &str = "time_boost";
    pub const QUALITY_BOOST: &str = "quality_boost";
    pub const FINAL_SCORE: &str = "final_score";
}

/// A passage returned by a search backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedItem {
    /// Identifier used for fusion and dedup within a single run
    pub id: String,
    /// Passage content (already redacted by the producer)
    pub text: String,
    /// Stage-local relevance score
    pub score: f32,
    /// Metadata carried through every transformation
    #[serde(default)]
    pub metadata: Metadata,
    /// Cached passage embedding, filled lazily by the pipeline
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
}

impl RetrievedItem {
    pub fn new(id: impl Into<String>, text: impl Into<String>, score: f32) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            score,
            metadata: Metadata::new(),
            embedding: None,
        }
    }

    /// Builder-style metadata insert
    pub fn with_meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn set_meta(&mut self, key: &str, value: impl Into<Value>) {
        self.metadata.insert(key.to_string(), value.into());
    }

    /// Creation time as unix seconds.
    ///
    /// Accepts numbers and numeric strings; anything else is treated as absent.
    pub fn created_at(&self) -> Option<f64> {
        match self.metadata.get(keys::CREATED_AT)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn source_tier(&self) -> f32 {
        match self.metadata.get(keys::SOURCE_TIER) {
            Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0) as f32,
            Some(Value::String(s)) => s.parse().unwrap_or(0.0),
            _ => 0.0,
        }
    }

    pub fn pinned(&self) -> bool {
        match self.metadata.get(keys::PINNED) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
            Some(Value::Number(n)) => n.as_i64().unwrap_or(0) != 0,
            _ => false,
        }
    }

    pub fn item_type(&self) -> Option<&str> {
        self.metadata.get(keys::TYPE).and_then(Value::as_str)
    }

    pub fn topic(&self) -> Option<&str> {
        self.metadata.get(keys::TOPIC).and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_accessors_tolerate_loose_types() {
        let item = RetrievedItem::new("a", "text", 0.5)
            .with_meta(keys::CREATED_AT, "1700000000")
            .with_meta(keys::SOURCE_TIER, 2)
            .with_meta(keys::PINNED, "true")
            .with_meta(keys::TYPE, "device");

        assert_eq!(item.created_at(), Some(1_700_000_000.0));
        assert_eq!(item.source_tier(), 2.0);
        assert!(item.pinned());
        assert_eq!(item.item_type(), Some("device"));
        assert_eq!(item.topic(), None);
    }

    #[test]
    fn test_missing_metadata_defaults() {
        let item = RetrievedItem::new("a", "text", 0.5).with_meta(keys::CREATED_AT, json!(null));
        assert_eq!(item.created_at(), None);
        assert_eq!(item.source_tier(), 0.0);
        assert!(!item.pinned());
    }

    #[test]
    fn test_embedding_not_serialized() {
        let item = RetrievedItem::new("a", "text", 0.5).with_embedding(vec![1.0, 0.0]);
        let json = serde_json::to_value(&item).unwrap();
        assert!(json.get("embedding").is_none());
    }
}
