//! Seam traits
//!
//! The retrieval core depends on its collaborators only through these
//! traits. Implementations are constructed once at the composition root
//! and shared behind `Arc<dyn ...>`.

mod backend;
mod embedder;
mod reranker;

pub use backend::SearchBackend;
pub use embedder::{Embedder, EmbedderKind};
pub use reranker::{RerankQuery, Reranker};
