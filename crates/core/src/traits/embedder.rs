//! Embedding collaborator

use async_trait::async_trait;

use crate::Result;

/// How the produced vectors should be compared
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmbedderKind {
    /// Real semantic embeddings, compared by cosine similarity
    #[default]
    Semantic,
    /// Length-keyed stub kept for backward-compatible test behavior;
    /// compared by distance cutoff
    Length,
}

/// Turns text into a dense vector of fixed dimension
///
/// Implementations must be deterministic per text and must surface
/// failures as errors rather than returning zeroed vectors.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Vector dimension
    fn dim(&self) -> usize;

    fn kind(&self) -> EmbedderKind {
        EmbedderKind::Semantic
    }

    /// Embed several texts; the default embeds one at a time
    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }
}
