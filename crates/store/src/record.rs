//! Stored entities and the id/matching rules shared by every backend

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use recall_core::{cosine_similarity, keys, normalize_text, EmbedderKind, Metadata};

use crate::StoreError;

/// Separator between hashed discriminators
const ID_SEPARATOR: &[u8] = b"\x1f";

/// Content hash used for audit and as the default dedupe key
pub fn checksum(text: &str) -> String {
    blake3::hash(text.as_bytes()).to_hex().to_string()
}

/// Deterministic memory id for `(user_id, doc_id)`
pub fn memory_point_id(user_id: &str, doc_id: &str) -> String {
    uuid::Uuid::new_v5(
        &uuid::Uuid::NAMESPACE_OID,
        format!("{}/{}", user_id, doc_id).as_bytes(),
    )
    .to_string()
}

/// QA cache id
///
/// Hash over the namespace, the normalized prompt and the optional model
/// and system-prompt discriminators, so answers never leak across users
/// or model configurations.
pub fn qa_cache_id(
    namespace: &str,
    prompt: &str,
    model: Option<&str>,
    system_prompt: Option<&str>,
) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(namespace.as_bytes());
    hasher.update(ID_SEPARATOR);
    hasher.update(normalize_text(prompt).as_bytes());
    hasher.update(ID_SEPARATOR);
    hasher.update(model.unwrap_or_default().as_bytes());
    hasher.update(ID_SEPARATOR);
    hasher.update(system_prompt.unwrap_or_default().as_bytes());
    hasher.finalize().to_hex().to_string()
}

/// Payload/metadata field names
pub mod fields {
    pub const ID: &str = "id";
    pub const DOC_ID: &str = "doc_id";
    pub const CONFIDENCE: &str = "confidence";
    pub const QUALITY: &str = "quality";
    pub const UPDATED_AT: &str = "updated_at";
    pub const DECAY_AT: &str = "decay_at";
    pub const CHECKSUM: &str = "checksum";

    pub const CACHE_ID: &str = "cache_id";
    pub const PROMPT: &str = "prompt";
    pub const PROMPT_NORM: &str = "prompt_norm";
    pub const ANSWER: &str = "answer";
    pub const TIMESTAMP: &str = "timestamp";
    pub const FEEDBACK: &str = "feedback";
}

/// One user memory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: String,
    pub user_id: String,
    /// Caller-supplied dedupe key
    pub doc_id: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub embedding: Vec<f32>,
    pub confidence: f32,
    pub quality: f32,
    pub source_tier: f32,
    pub pinned: bool,
    #[serde(rename = "type", default)]
    pub item_type: Option<String>,
    #[serde(default)]
    pub topic: Option<String>,
    pub created_at: f64,
    pub updated_at: f64,
    /// Soft-delete horizon
    #[serde(default)]
    pub decay_at: Option<f64>,
    pub checksum: String,
}

impl MemoryRecord {
    pub fn is_expired(&self, now: f64) -> bool {
        self.decay_at.map(|d| d <= now).unwrap_or(false)
    }

    /// Scalar metadata for backends (no text, id or embedding; absent
    /// optionals are omitted)
    pub fn to_metadata(&self) -> Metadata {
        let mut meta = Metadata::new();
        meta.insert(keys::USER_ID.to_string(), self.user_id.clone().into());
        meta.insert(fields::DOC_ID.to_string(), self.doc_id.clone().into());
        meta.insert(fields::CONFIDENCE.to_string(), self.confidence.into());
        meta.insert(fields::QUALITY.to_string(), self.quality.into());
        meta.insert(keys::SOURCE_TIER.to_string(), self.source_tier.into());
        meta.insert(keys::PINNED.to_string(), self.pinned.into());
        meta.insert(keys::CREATED_AT.to_string(), self.created_at.into());
        meta.insert(fields::UPDATED_AT.to_string(), self.updated_at.into());
        meta.insert(fields::CHECKSUM.to_string(), self.checksum.clone().into());
        if let Some(ref t) = self.item_type {
            meta.insert(keys::TYPE.to_string(), t.clone().into());
        }
        if let Some(ref t) = self.topic {
            meta.insert(keys::TOPIC.to_string(), t.clone().into());
        }
        if let Some(d) = self.decay_at {
            meta.insert(fields::DECAY_AT.to_string(), d.into());
        }
        meta
    }

    /// Rebuild from a backend's stored text and metadata
    pub fn from_metadata(id: String, text: String, meta: &Metadata) -> Result<Self, StoreError> {
        let user_id = str_field(meta, keys::USER_ID)
            .ok_or_else(|| StoreError::Malformed(format!("memory {} has no user_id", id)))?;

        Ok(Self {
            doc_id: str_field(meta, fields::DOC_ID).unwrap_or_else(|| checksum(&text)),
            checksum: str_field(meta, fields::CHECKSUM).unwrap_or_else(|| checksum(&text)),
            confidence: f64_field(meta, fields::CONFIDENCE).unwrap_or(1.0) as f32,
            quality: f64_field(meta, fields::QUALITY).unwrap_or(1.0) as f32,
            source_tier: f64_field(meta, keys::SOURCE_TIER).unwrap_or(0.0) as f32,
            pinned: meta.get(keys::PINNED).and_then(Value::as_bool).unwrap_or(false),
            item_type: str_field(meta, keys::TYPE),
            topic: str_field(meta, keys::TOPIC),
            created_at: f64_field(meta, keys::CREATED_AT).unwrap_or(0.0),
            updated_at: f64_field(meta, fields::UPDATED_AT).unwrap_or(0.0),
            decay_at: f64_field(meta, fields::DECAY_AT),
            embedding: Vec::new(),
            id,
            user_id,
            text,
        })
    }
}

/// Memory write request
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryInput {
    pub doc_id: Option<String>,
    pub text: String,
    pub confidence: f32,
    pub quality: f32,
    pub source_tier: f32,
    pub pinned: bool,
    pub decay_at: Option<f64>,
    pub item_type: Option<String>,
    pub topic: Option<String>,
}

impl MemoryInput {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            doc_id: None,
            text: text.into(),
            confidence: 1.0,
            quality: 1.0,
            source_tier: 0.0,
            pinned: false,
            decay_at: None,
            item_type: None,
            topic: None,
        }
    }

    pub fn doc_id(mut self, doc_id: impl Into<String>) -> Self {
        self.doc_id = Some(doc_id.into());
        self
    }

    pub fn confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn quality(mut self, quality: f32) -> Self {
        self.quality = quality;
        self
    }

    pub fn source_tier(mut self, tier: f32) -> Self {
        self.source_tier = tier;
        self
    }

    pub fn pinned(mut self, pinned: bool) -> Self {
        self.pinned = pinned;
        self
    }

    pub fn decay_at(mut self, decay_at: f64) -> Self {
        self.decay_at = Some(decay_at);
        self
    }

    pub fn item_type(mut self, item_type: impl Into<String>) -> Self {
        self.item_type = Some(item_type.into());
        self
    }

    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    /// Dedupe key: the explicit doc id, else the text checksum
    pub fn resolved_doc_id(&self) -> String {
        self.doc_id.clone().unwrap_or_else(|| checksum(&self.text))
    }

    /// Store id this input will be written under
    pub fn record_id(&self, user_id: &str) -> String {
        memory_point_id(user_id, &self.resolved_doc_id())
    }

    /// Build the record, keeping `created_at` from a previous version
    pub fn into_record(
        self,
        user_id: &str,
        previous: Option<&MemoryRecord>,
        now: f64,
        embedding: Vec<f32>,
    ) -> MemoryRecord {
        let doc_id = self.resolved_doc_id();
        MemoryRecord {
            id: memory_point_id(user_id, &doc_id),
            user_id: user_id.to_string(),
            checksum: checksum(&self.text),
            doc_id,
            text: self.text,
            embedding,
            confidence: self.confidence,
            quality: self.quality,
            source_tier: self.source_tier,
            pinned: self.pinned,
            item_type: self.item_type,
            topic: self.topic,
            created_at: previous.map(|p| p.created_at).unwrap_or(now),
            updated_at: now,
            decay_at: self.decay_at,
        }
    }
}

/// Answer feedback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Feedback {
    #[default]
    None,
    Up,
    Down,
}

impl Feedback {
    pub fn as_str(&self) -> &'static str {
        match self {
            Feedback::None => "none",
            Feedback::Up => "up",
            Feedback::Down => "down",
        }
    }
}

impl fmt::Display for Feedback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Feedback {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "none" => Ok(Feedback::None),
            "up" | "+1" => Ok(Feedback::Up),
            "down" | "-1" => Ok(Feedback::Down),
            other => Err(StoreError::Malformed(format!("unknown feedback '{}'", other))),
        }
    }
}

/// A cached answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QaCacheEntry {
    pub cache_id: String,
    pub prompt: String,
    pub prompt_norm: String,
    pub answer: String,
    /// Unix seconds at insert
    pub timestamp: f64,
    #[serde(default)]
    pub feedback: Feedback,
}

impl QaCacheEntry {
    pub fn new(cache_id: &str, prompt: &str, answer: &str, now: f64) -> Self {
        Self {
            cache_id: cache_id.to_string(),
            prompt: prompt.to_string(),
            prompt_norm: normalize_text(prompt),
            answer: answer.to_string(),
            timestamp: now,
            feedback: Feedback::None,
        }
    }

    /// Entries older than `ttl` are misses
    pub fn is_fresh(&self, ttl: std::time::Duration, now: f64) -> bool {
        now - self.timestamp <= ttl.as_secs_f64()
    }

    pub fn to_metadata(&self) -> Metadata {
        let mut meta = Metadata::new();
        meta.insert(fields::CACHE_ID.to_string(), self.cache_id.clone().into());
        meta.insert(fields::PROMPT.to_string(), self.prompt.clone().into());
        meta.insert(fields::PROMPT_NORM.to_string(), self.prompt_norm.clone().into());
        meta.insert(fields::ANSWER.to_string(), self.answer.clone().into());
        meta.insert(fields::TIMESTAMP.to_string(), self.timestamp.into());
        meta.insert(fields::FEEDBACK.to_string(), self.feedback.as_str().into());
        meta
    }

    /// `None` for entries missing the answer or timestamp
    pub fn from_metadata(meta: &Metadata) -> Option<Self> {
        let prompt = str_field(meta, fields::PROMPT).unwrap_or_default();
        Some(Self {
            cache_id: str_field(meta, fields::CACHE_ID)?,
            prompt_norm: str_field(meta, fields::PROMPT_NORM)
                .unwrap_or_else(|| normalize_text(&prompt)),
            prompt,
            answer: str_field(meta, fields::ANSWER)?,
            timestamp: f64_field(meta, fields::TIMESTAMP)?,
            feedback: str_field(meta, fields::FEEDBACK)
                .and_then(|f| f.parse().ok())
                .unwrap_or_default(),
        })
    }
}

/// Most recent entry among candidates
pub fn latest_entry(entries: impl IntoIterator<Item = QaCacheEntry>) -> Option<QaCacheEntry> {
    entries.into_iter().max_by(|a, b| {
        a.timestamp
            .partial_cmp(&b.timestamp)
            .unwrap_or(Ordering::Equal)
    })
}

/// When a stored memory counts as a match for a query
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MatchRule {
    /// Cosine distance; keep `1 - distance >= threshold`
    Similarity { threshold: f32 },
    /// Squared L2 over length vectors; keep `distance <= cutoff`, and
    /// equal-length texts only when they are the same text
    LengthDistance { cutoff: f32 },
}

impl MatchRule {
    pub fn for_embedder(kind: EmbedderKind, threshold: f32, length_cutoff: f32) -> Self {
        match kind {
            EmbedderKind::Semantic => MatchRule::Similarity { threshold },
            EmbedderKind::Length => MatchRule::LengthDistance {
                cutoff: length_cutoff,
            },
        }
    }

    /// Distance between two vectors in this rule's space
    pub fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            MatchRule::Similarity { .. } => 1.0 - cosine_similarity(a, b),
            MatchRule::LengthDistance { .. } => {
                if a.len() != b.len() {
                    return f32::INFINITY;
                }
                a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
            },
        }
    }

    /// Match score (higher is better), or `None` when rejected
    pub fn score(&self, query: &str, text: &str, distance: f32) -> Option<f32> {
        match *self {
            MatchRule::Similarity { threshold } => {
                let similarity = 1.0 - distance;
                (similarity >= threshold).then_some(similarity)
            },
            MatchRule::LengthDistance { cutoff } => {
                if distance.is_nan() || distance > cutoff {
                    return None;
                }
                if query.chars().count() == text.chars().count()
                    && normalize_text(query) != normalize_text(text)
                {
                    return None;
                }
                Some(1.0 / (1.0 + distance))
            },
        }
    }
}

/// A matched memory before ranking
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredMemory {
    pub text: String,
    pub score: f32,
    pub created_at: f64,
}

/// Best-first, ties broken by most recent, at most `k`
pub fn rank_matches(mut matches: Vec<ScoredMemory>, k: usize) -> Vec<String> {
    matches.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| {
                b.created_at
                    .partial_cmp(&a.created_at)
                    .unwrap_or(Ordering::Equal)
            })
    });
    matches.truncate(k);
    matches.into_iter().map(|m| m.text).collect()
}

fn str_field(meta: &Metadata, key: &str) -> Option<String> {
    meta.get(key).and_then(Value::as_str).map(str::to_string)
}

fn f64_field(meta: &Metadata, key: &str) -> Option<f64> {
    meta.get(key).and_then(Value::as_f64)
}
