//! Backend search adapter contract

use async_trait::async_trait;

use crate::{RetrievedItem, Result, SearchFilter};

/// Dense and sparse search over a collection
///
/// Both operations return only items that belong to `user_id`, ranked
/// best-first. Dense scores are raw cosine similarity; sparse scores are
/// backend-native relevance.
#[async_trait]
pub trait SearchBackend: Send + Sync {
    async fn dense_search(
        &self,
        collection: &str,
        user_id: &str,
        vector: &[f32],
        limit: usize,
        filter: Option<&SearchFilter>,
    ) -> Result<Vec<RetrievedItem>>;

    async fn sparse_search(
        &self,
        collection: &str,
        user_id: &str,
        query: &str,
        limit: usize,
        filter: Option<&SearchFilter>,
    ) -> Result<Vec<RetrievedItem>>;

    /// Backend name for logging
    fn name(&self) -> &str;
}
