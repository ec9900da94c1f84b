//! Rerank stage contract

use async_trait::async_trait;

use crate::{RetrievedItem, Result};

/// Query handed to a reranker
///
/// Carries the query embedding when the caller already has it so cheap
/// rerankers don't embed twice.
#[derive(Debug, Clone)]
pub struct RerankQuery {
    pub text: String,
    pub embedding: Option<Vec<f32>>,
}

impl RerankQuery {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            embedding: None,
        }
    }

    pub fn with_embedding(mut self, embedding: Option<Vec<f32>>) -> Self {
        self.embedding = embedding;
        self
    }
}

/// Re-scores items and keeps the best `keep`, sorted best-first
#[async_trait]
pub trait Reranker: Send + Sync {
    async fn rerank(
        &self,
        query: &RerankQuery,
        items: Vec<RetrievedItem>,
        keep: usize,
    ) -> Result<Vec<RetrievedItem>>;

    fn name(&self) -> &str;
}
