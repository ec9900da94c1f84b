//! In-process search backend
//!
//! Dense search is brute-force cosine over stored vectors; sparse search is
//! the Tantivy BM25 index. Used for development, tests and single-node
//! deployments without a vector database.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use recall_core::{cosine_similarity, Embedder, RetrievedItem, SearchBackend, SearchFilter};

use crate::sparse_search::{document_key, SparseConfig, SparseDocument, SparseIndex};
use crate::RagError;

#[derive(Debug, Clone)]
struct StoredDoc {
    collection: String,
    user_id: String,
    item: RetrievedItem,
}

/// Local dense + sparse search
pub struct LocalSearchBackend {
    docs: RwLock<HashMap<String, StoredDoc>>,
    sparse: Arc<SparseIndex>,
    embedder: Arc<dyn Embedder>,
}

impl LocalSearchBackend {
    pub fn new(embedder: Arc<dyn Embedder>, sparse_config: SparseConfig) -> Result<Self, RagError> {
        Ok(Self {
            docs: RwLock::new(HashMap::new()),
            sparse: Arc::new(SparseIndex::new(sparse_config)?),
            embedder,
        })
    }

    /// In-memory index with default settings
    pub fn in_memory(embedder: Arc<dyn Embedder>) -> Result<Self, RagError> {
        Self::new(embedder, SparseConfig::default())
    }

    /// Add or replace passages for a user; missing embeddings are computed
    pub async fn add_items(
        &self,
        collection: &str,
        user_id: &str,
        items: Vec<RetrievedItem>,
    ) -> Result<usize, RagError> {
        let mut prepared = Vec::with_capacity(items.len());
        for mut item in items {
            if item.embedding.is_none() {
                let embedding = self
                    .embedder
                    .embed(&item.text)
                    .await
                    .map_err(|e| RagError::Embedding(e.to_string()))?;
                item.embedding = Some(embedding);
            }
            prepared.push(item);
        }

        let sparse_docs: Vec<SparseDocument> = prepared
            .iter()
            .map(|item| SparseDocument {
                collection: collection.to_string(),
                user_id: user_id.to_string(),
                id: item.id.clone(),
                text: item.text.clone(),
                metadata: item.metadata.clone(),
            })
            .collect();

        let sparse = Arc::clone(&self.sparse);
        tokio::task::spawn_blocking(move || sparse.index_documents(&sparse_docs))
            .await
            .map_err(|e| RagError::Index(format!("Index task failed: {}", e)))??;

        let count = prepared.len();
        let mut docs = self.docs.write();
        for item in prepared {
            docs.insert(
                document_key(collection, user_id, &item.id),
                StoredDoc {
                    collection: collection.to_string(),
                    user_id: user_id.to_string(),
                    item,
                },
            );
        }

        tracing::debug!(collection, user_id, count, "Indexed passages");
        Ok(count)
    }

    pub async fn remove_items(
        &self,
        collection: &str,
        user_id: &str,
        ids: &[String],
    ) -> Result<(), RagError> {
        {
            let mut docs = self.docs.write();
            for id in ids {
                docs.remove(&document_key(collection, user_id, id));
            }
        }

        let sparse = Arc::clone(&self.sparse);
        let collection = collection.to_string();
        let user_id = user_id.to_string();
        let ids = ids.to_vec();
        tokio::task::spawn_blocking(move || sparse.delete(&collection, &user_id, &ids))
            .await
            .map_err(|e| RagError::Index(format!("Index task failed: {}", e)))?
    }

    pub fn len(&self) -> usize {
        self.docs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.read().is_empty()
    }
}

#[async_trait]
impl SearchBackend for LocalSearchBackend {
    async fn dense_search(
        &self,
        collection: &str,
        user_id: &str,
        vector: &[f32],
        limit: usize,
        filter: Option<&SearchFilter>,
    ) -> recall_core::Result<Vec<RetrievedItem>> {
        let docs = self.docs.read();
        let mut scored: Vec<RetrievedItem> = docs
            .values()
            .filter(|d| d.collection == collection && d.user_id == user_id)
            .filter(|d| filter.map(|f| f.matches(&d.item.metadata)).unwrap_or(true))
            .map(|d| {
                let mut item = d.item.clone();
                item.score = item
                    .embedding
                    .as_deref()
                    .map(|e| cosine_similarity(vector, e))
                    .unwrap_or(0.0);
                item
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        scored.truncate(limit);
        Ok(scored)
    }

    async fn sparse_search(
        &self,
        collection: &str,
        user_id: &str,
        query: &str,
        limit: usize,
        filter: Option<&SearchFilter>,
    ) -> recall_core::Result<Vec<RetrievedItem>> {
        let sparse = Arc::clone(&self.sparse);
        let owned = (
            collection.to_string(),
            user_id.to_string(),
            query.to_string(),
            filter.cloned(),
        );

        let results = tokio::task::spawn_blocking(move || {
            let (collection, user_id, query, filter) = owned;
            sparse.search(&collection, &user_id, &query, limit, filter.as_ref())
        })
        .await
        .map_err(|e| RagError::Search(format!("Sparse search task failed: {}", e)))??;

        let docs = self.docs.read();
        Ok(results
            .into_iter()
            .map(|r| {
                let embedding = docs
                    .get(&document_key(collection, user_id, &r.id))
                    .and_then(|d| d.item.embedding.clone());
                RetrievedItem {
                    id: r.id,
                    text: r.text,
                    score: r.score,
                    metadata: r.metadata,
                    embedding,
                }
            })
            .collect())
    }

    fn name(&self) -> &str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use recall_core::{keys, HashEmbedder};

    async fn backend() -> LocalSearchBackend {
        let backend = LocalSearchBackend::in_memory(Arc::new(HashEmbedder::default())).unwrap();
        backend
            .add_items(
                "kb:default",
                "u1",
                vec![
                    RetrievedItem::new("a", "turn on the kitchen lights", 0.0)
                        .with_meta(keys::TYPE, "device"),
                    RetrievedItem::new("b", "weekly grocery list", 0.0),
                ],
            )
            .await
            .unwrap();
        backend
            .add_items(
                "kb:default",
                "u2",
                vec![RetrievedItem::new("c", "turn on the kitchen lights", 0.0)],
            )
            .await
            .unwrap();
        backend
    }

    #[tokio::test]
    async fn test_dense_search_scoped_and_ranked() {
        let backend = backend().await;
        let query = HashEmbedder::default().embed_sync("turn on the kitchen lights");

        let results = backend
            .dense_search("kb:default", "u1", &query, 10, None)
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].id, "a");
        assert!((results[0].score - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_dense_search_filter() {
        let backend = backend().await;
        let query = HashEmbedder::default().embed_sync("grocery");
        let filter = SearchFilter::new().item_type("device");

        let results = backend
            .dense_search("kb:default", "u1", &query, 10, Some(&filter))
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "a");
    }

    #[tokio::test]
    async fn test_sparse_search_carries_embedding() {
        let backend = backend().await;
        let results = backend
            .sparse_search("kb:default", "u1", "grocery", 10, None)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "b");
        assert!(results[0].embedding.is_some());
    }

    #[tokio::test]
    async fn test_remove_items() {
        let backend = backend().await;
        backend
            .remove_items("kb:default", "u1", &["a".to_string()])
            .await
            .unwrap();
        assert_eq!(backend.len(), 2);

        let results = backend
            .sparse_search("kb:default", "u1", "kitchen", 10, None)
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_same_id_from_another_user_does_not_replace() {
        let backend = LocalSearchBackend::in_memory(Arc::new(HashEmbedder::default())).unwrap();
        backend
            .add_items(
                "kb:default",
                "u1",
                vec![RetrievedItem::new("doc-1", "garage door code is 4471", 0.0)],
            )
            .await
            .unwrap();
        backend
            .add_items(
                "kb:default",
                "u2",
                vec![RetrievedItem::new("doc-1", "dentist on friday", 0.0)],
            )
            .await
            .unwrap();
        assert_eq!(backend.len(), 2);

        let query = HashEmbedder::default().embed_sync("garage door code is 4471");
        let dense = backend
            .dense_search("kb:default", "u1", &query, 10, None)
            .await
            .unwrap();
        assert_eq!(dense.len(), 1);
        assert_eq!(dense[0].text, "garage door code is 4471");

        let sparse = backend
            .sparse_search("kb:default", "u1", "garage", 10, None)
            .await
            .unwrap();
        assert_eq!(sparse.len(), 1);
        assert!(sparse[0].embedding.is_some());

        backend
            .remove_items("kb:default", "u2", &["doc-1".to_string()])
            .await
            .unwrap();
        assert_eq!(backend.len(), 1);
        let sparse = backend
            .sparse_search("kb:default", "u1", "garage", 10, None)
            .await
            .unwrap();
        assert_eq!(sparse.len(), 1);
    }
}
