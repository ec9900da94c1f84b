//! Deterministic stub embedders
//!
//! Used by the in-memory store, tests and local development. Real
//! embedders (Ollama, hosted APIs) live in the rag crate.

use async_trait::async_trait;

use crate::traits::{Embedder, EmbedderKind};
use crate::Result;

/// Default dimension for the hash embedder
pub const DEFAULT_HASH_DIM: usize = 256;

/// Character-hash embedder (no model required)
///
/// Each character bumps one bucket chosen from its code point and
/// position, then the vector is L2-normalized. Identical texts map to
/// identical vectors.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dim: usize,
    normalize: bool,
}

impl HashEmbedder {
    pub fn new(dim: usize) -> Self {
        Self {
            dim: dim.max(1),
            normalize: true,
        }
    }

    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut embedding = vec![0.0f32; self.dim];

        for (i, c) in text.chars().enumerate() {
            let idx = (c as usize + i) % self.dim;
            embedding[idx] += 1.0;
        }

        if self.normalize {
            l2_normalize(&mut embedding);
        }

        embedding
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_HASH_DIM)
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_sync(text))
    }

    fn dim(&self) -> usize {
        self.dim
    }
}

/// Length-keyed stub embedder
///
/// Produces a one-dimensional vector holding the character count, so two
/// texts are "close" when their lengths are close. Stores compare these
/// with a distance cutoff and guard against equal-length false positives.
#[derive(Debug, Clone, Default)]
pub struct LengthEmbedder;

#[async_trait]
impl Embedder for LengthEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(vec![text.chars().count() as f32])
    }

    fn dim(&self) -> usize {
        1
    }

    fn kind(&self) -> EmbedderKind {
        EmbedderKind::Length
    }
}

fn l2_normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Cosine similarity; 0.0 for empty, zero or mismatched vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut na = 0.0f32;
    let mut nb = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }

    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hash_embedder_is_deterministic_and_normalized() {
        let embedder = HashEmbedder::default();
        let a = embedder.embed("Hello world").await.unwrap();
        let b = embedder.embed("Hello world").await.unwrap();

        assert_eq!(a.len(), DEFAULT_HASH_DIM);
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 0.01);
    }

    #[tokio::test]
    async fn test_length_embedder() {
        let embedder = LengthEmbedder;
        assert_eq!(embedder.embed("abcd").await.unwrap(), vec![4.0]);
        assert_eq!(embedder.kind(), EmbedderKind::Length);
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
    }
}
