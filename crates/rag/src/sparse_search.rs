//! Sparse Search using Tantivy (BM25)
//!
//! Keyword-based search for hybrid retrieval. Documents are scoped by
//! collection and user; both are exact-match keyword fields that restrict
//! the BM25 query without contributing to the score.

use parking_lot::RwLock;
use std::path::Path;
use tantivy::{
    collector::TopDocs,
    query::{BooleanQuery, ConstScoreQuery, Occur, Query, QueryParser, TermQuery},
    schema::{
        Field, IndexRecordOption, OwnedValue, Schema, TextFieldIndexing, TextOptions, STORED,
        STRING,
    },
    tokenizer::{Language, LowerCaser, RemoveLongFilter, SimpleTokenizer, Stemmer, TextAnalyzer},
    Index, IndexReader, IndexWriter, TantivyDocument, Term,
};

use recall_core::{Metadata, SearchFilter};

use crate::RagError;

const TOKENIZER_NAME: &str = "recall_text";
/// Over-fetch factor when a metadata filter is applied after search
const FILTER_OVERFETCH: usize = 4;

/// Sparse search configuration
#[derive(Debug, Clone)]
pub struct SparseConfig {
    /// Index path (use RAM if None)
    pub index_path: Option<String>,
    /// Enable stemming
    pub stemming: bool,
    /// Language for analysis
    pub language: String,
    /// Writer heap budget in bytes
    pub writer_heap_bytes: usize,
}

impl Default for SparseConfig {
    fn default() -> Self {
        Self {
            index_path: None,
            stemming: true,
            language: "en".to_string(),
            writer_heap_bytes: 50_000_000,
        }
    }
}

/// Document handed to the index
#[derive(Debug, Clone)]
pub struct SparseDocument {
    pub collection: String,
    pub user_id: String,
    pub id: String,
    pub text: String,
    pub metadata: Metadata,
}

impl SparseDocument {
    /// Unique key across collections and users
    pub fn key(&self) -> String {
        document_key(&self.collection, &self.user_id, &self.id)
    }
}

/// Ids are only unique per user, so the user is part of the key
pub(crate) fn document_key(collection: &str, user_id: &str, id: &str) -> String {
    format!("{}/{}/{}", collection, user_id, id)
}

/// Sparse search result
#[derive(Debug, Clone)]
pub struct SparseResult {
    pub id: String,
    /// BM25 score
    pub score: f32,
    pub text: String,
    pub metadata: Metadata,
}

/// Sparse index for BM25 search
pub struct SparseIndex {
    index: Index,
    reader: IndexReader,
    writer: RwLock<Option<IndexWriter>>,
    key_field: Field,
    id_field: Field,
    collection_field: Field,
    user_field: Field,
    text_field: Field,
    metadata_field: Field,
}

impl SparseIndex {
    /// Create a new sparse index
    pub fn new(config: SparseConfig) -> Result<Self, RagError> {
        let mut schema_builder = Schema::builder();

        let text_options = TextOptions::default()
            .set_indexing_options(
                TextFieldIndexing::default()
                    .set_tokenizer(TOKENIZER_NAME)
                    .set_index_option(IndexRecordOption::WithFreqsAndPositions),
            )
            .set_stored();

        let key_field = schema_builder.add_text_field("key", STRING | STORED);
        let id_field = schema_builder.add_text_field("id", STRING | STORED);
        let collection_field = schema_builder.add_text_field("collection", STRING | STORED);
        let user_field = schema_builder.add_text_field("user_id", STRING | STORED);
        let text_field = schema_builder.add_text_field("text", text_options);
        let metadata_field = schema_builder.add_text_field("metadata", STORED);

        let schema = schema_builder.build();

        let index = if let Some(ref path) = config.index_path {
            let dir = tantivy::directory::MmapDirectory::open(Path::new(path))
                .map_err(|e| RagError::Index(e.to_string()))?;
            Index::open_or_create(dir, schema.clone())
                .map_err(|e| RagError::Index(e.to_string()))?
        } else {
            Index::create_in_ram(schema.clone())
        };

        index
            .tokenizers()
            .register(TOKENIZER_NAME, Self::build_tokenizer(&config));

        let reader = index.reader().map_err(|e| RagError::Index(e.to_string()))?;

        let writer = index
            .writer(config.writer_heap_bytes)
            .map_err(|e| RagError::Index(e.to_string()))?;

        tracing::info!(
            language = %config.language,
            stemming = config.stemming,
            persistent = config.index_path.is_some(),
            "Sparse index created"
        );

        Ok(Self {
            index,
            reader,
            writer: RwLock::new(Some(writer)),
            key_field,
            id_field,
            collection_field,
            user_field,
            text_field,
            metadata_field,
        })
    }

    /// Build tokenizer based on configuration
    fn build_tokenizer(config: &SparseConfig) -> TextAnalyzer {
        let base = TextAnalyzer::builder(SimpleTokenizer::default())
            .filter(RemoveLongFilter::limit(100))
            .filter(LowerCaser);

        if config.stemming && config.language == "en" {
            base.filter(Stemmer::new(Language::English)).build()
        } else {
            if config.language != "en" {
                tracing::warn!(
                    "Language '{}' has no stemmer, using simple tokenization",
                    config.language
                );
            }
            base.build()
        }
    }

    /// Index documents, replacing any with the same collection/user/id
    pub fn index_documents(&self, documents: &[SparseDocument]) -> Result<(), RagError> {
        let mut writer = self.writer.write();
        let writer = writer
            .as_mut()
            .ok_or_else(|| RagError::Index("Writer not available".to_string()))?;

        for doc in documents {
            let key = doc.key();
            writer.delete_term(Term::from_field_text(self.key_field, &key));

            let metadata = serde_json::to_string(&doc.metadata)
                .map_err(|e| RagError::Index(e.to_string()))?;

            let mut tantivy_doc = TantivyDocument::default();
            tantivy_doc.add_text(self.key_field, &key);
            tantivy_doc.add_text(self.id_field, &doc.id);
            tantivy_doc.add_text(self.collection_field, &doc.collection);
            tantivy_doc.add_text(self.user_field, &doc.user_id);
            tantivy_doc.add_text(self.text_field, &doc.text);
            tantivy_doc.add_text(self.metadata_field, &metadata);

            writer
                .add_document(tantivy_doc)
                .map_err(|e| RagError::Index(e.to_string()))?;
        }

        writer
            .commit()
            .map_err(|e| RagError::Index(e.to_string()))?;

        self.reader
            .reload()
            .map_err(|e| RagError::Index(e.to_string()))?;

        Ok(())
    }

    fn scope_clause(&self, field: Field, value: &str) -> (Occur, Box<dyn Query>) {
        let term = TermQuery::new(
            Term::from_field_text(field, value),
            IndexRecordOption::Basic,
        );
        (Occur::Must, Box::new(ConstScoreQuery::new(Box::new(term), 0.0)))
    }

    /// BM25 search within one collection, restricted to one user
    pub fn search(
        &self,
        collection: &str,
        user_id: &str,
        query: &str,
        limit: usize,
        filter: Option<&SearchFilter>,
    ) -> Result<Vec<SparseResult>, RagError> {
        if query.trim().is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let searcher = self.reader.searcher();
        let query_parser = QueryParser::for_index(&self.index, vec![self.text_field]);

        // Free text: syntax errors are ignored rather than rejected
        let (text_query, _errors) = query_parser.parse_query_lenient(query);

        let combined = BooleanQuery::new(vec![
            (Occur::Must, text_query),
            self.scope_clause(self.collection_field, collection),
            self.scope_clause(self.user_field, user_id),
        ]);

        let filter = filter.filter(|f| !f.is_empty());
        let fetch = if filter.is_some() {
            limit.saturating_mul(FILTER_OVERFETCH)
        } else {
            limit
        };

        let top_docs = searcher
            .search(&combined, &TopDocs::with_limit(fetch))
            .map_err(|e| RagError::Search(e.to_string()))?;

        let mut results = Vec::with_capacity(top_docs.len().min(limit));

        for (score, doc_address) in top_docs {
            let doc: TantivyDocument = searcher
                .doc(doc_address)
                .map_err(|e| RagError::Search(e.to_string()))?;

            let metadata: Metadata = stored_str(&doc, self.metadata_field)
                .and_then(|raw| serde_json::from_str(raw).ok())
                .unwrap_or_default();

            if let Some(f) = filter {
                if !f.matches(&metadata) {
                    continue;
                }
            }

            results.push(SparseResult {
                id: stored_str(&doc, self.id_field).unwrap_or("").to_string(),
                score,
                text: stored_str(&doc, self.text_field).unwrap_or("").to_string(),
                metadata,
            });

            if results.len() >= limit {
                break;
            }
        }

        Ok(results)
    }

    /// Delete one user's documents by collection/id
    pub fn delete(&self, collection: &str, user_id: &str, ids: &[String]) -> Result<(), RagError> {
        let mut writer = self.writer.write();
        let writer = writer
            .as_mut()
            .ok_or_else(|| RagError::Index("Writer not available".to_string()))?;

        for id in ids {
            let term = Term::from_field_text(self.key_field, &document_key(collection, user_id, id));
            writer.delete_term(term);
        }

        writer
            .commit()
            .map_err(|e| RagError::Index(e.to_string()))?;

        self.reader
            .reload()
            .map_err(|e| RagError::Index(e.to_string()))?;

        Ok(())
    }

    /// Get document count
    pub fn doc_count(&self) -> u64 {
        self.reader.searcher().num_docs()
    }
}

fn stored_str(doc: &TantivyDocument, field: Field) -> Option<&str> {
    doc.get_first(field).and_then(|v| match v {
        OwnedValue::Str(s) => Some(s.as_str()),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(user: &str, id: &str, text: &str) -> SparseDocument {
        SparseDocument {
            collection: "kb:default".to_string(),
            user_id: user.to_string(),
            id: id.to_string(),
            text: text.to_string(),
            metadata: Metadata::new(),
        }
    }

    #[test]
    fn test_sparse_index_create() {
        let index = SparseIndex::new(SparseConfig::default()).unwrap();
        assert_eq!(index.doc_count(), 0);
    }

    #[test]
    fn test_index_and_search_scoped_to_user() {
        let index = SparseIndex::new(SparseConfig::default()).unwrap();
        index
            .index_documents(&[
                doc("u1", "1", "Kitchen lights turn on at sunset"),
                doc("u1", "2", "Garage door closes at night"),
                doc("u2", "3", "Kitchen lights are red"),
            ])
            .unwrap();
        assert_eq!(index.doc_count(), 3);

        let results = index
            .search("kb:default", "u1", "kitchen lights", 10, None)
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "1");

        let other = index
            .search("kb:other", "u1", "kitchen lights", 10, None)
            .unwrap();
        assert!(other.is_empty());
    }

    #[test]
    fn test_reindex_replaces_document() {
        let index = SparseIndex::new(SparseConfig::default()).unwrap();
        index.index_documents(&[doc("u1", "1", "old text")]).unwrap();
        index.index_documents(&[doc("u1", "1", "new text")]).unwrap();

        assert_eq!(index.doc_count(), 1);
        let results = index.search("kb:default", "u1", "new", 5, None).unwrap();
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn test_metadata_filter_and_delete() {
        let index = SparseIndex::new(SparseConfig::default()).unwrap();
        let mut device = doc("u1", "1", "living room lamp");
        device.metadata.insert("type".into(), json!("device"));
        index
            .index_documents(&[device, doc("u1", "2", "lamp shopping list")])
            .unwrap();

        let filter = SearchFilter::new().item_type("device");
        let results = index
            .search("kb:default", "u1", "lamp", 5, Some(&filter))
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].metadata.get("type"), Some(&json!("device")));

        index.delete("kb:default", "u1", &["1".to_string()]).unwrap();
        assert_eq!(index.doc_count(), 1);
    }

    #[test]
    fn test_same_id_for_two_users_kept_apart() {
        let index = SparseIndex::new(SparseConfig::default()).unwrap();
        index.index_documents(&[doc("u1", "1", "garage door code")]).unwrap();
        index.index_documents(&[doc("u2", "1", "dentist on friday")]).unwrap();
        assert_eq!(index.doc_count(), 2);

        let results = index.search("kb:default", "u1", "garage", 5, None).unwrap();
        assert_eq!(results.len(), 1);

        index.delete("kb:default", "u2", &["1".to_string()]).unwrap();
        assert_eq!(index.doc_count(), 1);
        let results = index.search("kb:default", "u1", "garage", 5, None).unwrap();
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn test_malformed_query_is_lenient() {
        let index = SparseIndex::new(SparseConfig::default()).unwrap();
        index.index_documents(&[doc("u1", "1", "hello world")]).unwrap();

        let results = index
            .search("kb:default", "u1", "hello AND (", 5, None)
            .unwrap();
        assert!(results.len() <= 1);
        assert!(index.search("kb:default", "u1", "   ", 5, None).unwrap().is_empty());
    }

    #[test]
    fn test_persistent_index() {
        let dir = tempfile::tempdir().unwrap();
        let config = SparseConfig {
            index_path: Some(dir.path().to_string_lossy().to_string()),
            ..Default::default()
        };
        {
            let index = SparseIndex::new(config.clone()).unwrap();
            index.index_documents(&[doc("u1", "1", "persisted note")]).unwrap();
        }

        let reopened = SparseIndex::new(config).unwrap();
        assert_eq!(reopened.doc_count(), 1);
    }
}
