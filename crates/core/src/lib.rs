//! Core traits and types for hybrid retrieval
//!
//! This crate provides the foundational types shared by the retrieval
//! pipeline and the vector store layer:
//! - `RetrievedItem`, the unit flowing through every pipeline stage
//! - `Trace`/`TraceEvent` for explainable retrieval
//! - `SearchFilter` for metadata equality filtering
//! - Seam traits for embedding, backend search and reranking
//! - Deterministic stub embedders and text normalization helpers

pub mod embeddings;
pub mod error;
pub mod filter;
pub mod item;
pub mod text;
pub mod trace;
pub mod traits;

pub use embeddings::{cosine_similarity, HashEmbedder, LengthEmbedder};
pub use error::{Error, Result};
pub use filter::SearchFilter;
pub use item::{keys, Metadata, RetrievedItem};
pub use text::{jaccard, normalize_text, now_unix, token_set};
pub use trace::{Trace, TraceEvent};
pub use traits::{Embedder, EmbedderKind, RerankQuery, Reranker, SearchBackend};
