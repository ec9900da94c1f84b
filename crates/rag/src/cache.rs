//! Pipeline result cache
//!
//! Short-TTL, bounded cache of `(texts, trace)` keyed by user, normalized
//! query, intent and collection. Explain traces carry extra samples, so the
//! explain flag is part of the key too. Writes are last-write-wins upserts.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use recall_core::{normalize_text, Trace};

/// Cache key for one pipeline request
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub user_id: String,
    pub query: String,
    pub intent: String,
    pub collection: String,
    pub explain: bool,
}

impl CacheKey {
    /// Build a key; the query is normalized so trivially different
    /// spellings share an entry
    pub fn new(user_id: &str, query: &str, intent: &str, collection: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            query: normalize_text(query),
            intent: intent.to_string(),
            collection: collection.to_string(),
            explain: false,
        }
    }

    pub fn with_explain(mut self, explain: bool) -> Self {
        self.explain = explain;
        self
    }
}

/// A stored pipeline result
#[derive(Debug, Clone)]
pub struct CachedResult {
    pub texts: Vec<String>,
    pub trace: Trace,
    inserted_at: Instant,
}

impl CachedResult {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.inserted_at.elapsed() >= ttl
    }
}

/// Process-wide result cache
pub struct ResultCache {
    entries: RwLock<HashMap<CacheKey, CachedResult>>,
    ttl: Duration,
    max_entries: usize,
}

impl ResultCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    pub fn from_config(config: &recall_config::RetrievalConfig) -> Self {
        Self::new(
            Duration::from_secs(config.cache_ttl_secs),
            config.cache_max_entries,
        )
    }

    /// Fresh entry for `key`; a stale one is dropped and reported as a miss
    pub fn get(&self, key: &CacheKey) -> Option<CachedResult> {
        {
            let entries = self.entries.read();
            match entries.get(key) {
                Some(entry) if !entry.is_expired(self.ttl) => return Some(entry.clone()),
                Some(_) => {},
                None => return None,
            }
        }

        let mut entries = self.entries.write();
        if entries
            .get(key)
            .map(|e| e.is_expired(self.ttl))
            .unwrap_or(false)
        {
            entries.remove(key);
        }
        None
    }

    /// Store a result, evicting expired entries and then the oldest one
    /// when at capacity
    pub fn insert(&self, key: CacheKey, texts: Vec<String>, trace: Trace) {
        let mut entries = self.entries.write();

        if !entries.contains_key(&key) && entries.len() >= self.max_entries {
            let ttl = self.ttl;
            entries.retain(|_, e| !e.is_expired(ttl));

            if entries.len() >= self.max_entries {
                let oldest = entries
                    .iter()
                    .min_by_key(|(_, e)| e.inserted_at)
                    .map(|(k, _)| k.clone());
                if let Some(oldest) = oldest {
                    entries.remove(&oldest);
                    tracing::debug!(user_id = %oldest.user_id, "Evicted oldest cached result");
                }
            }
        }

        entries.insert(
            key,
            CachedResult {
                texts,
                trace,
                inserted_at: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }
}
