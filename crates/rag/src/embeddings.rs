//! Ollama Embeddings
//!
//! Uses Ollama's embedding API (`POST /api/embed`) for dense vectors.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use recall_config::constants::endpoints;
use recall_core::Embedder;

use crate::RagError;

/// Ollama embedding configuration
#[derive(Debug, Clone)]
pub struct OllamaEmbeddingConfig {
    /// Ollama API endpoint
    pub endpoint: String,
    /// Model name
    pub model: String,
    /// Embedding dimension
    pub embedding_dim: usize,
    /// Request timeout
    pub timeout: Duration,
}

impl Default for OllamaEmbeddingConfig {
    fn default() -> Self {
        Self {
            endpoint: endpoints::OLLAMA_DEFAULT.to_string(),
            model: "nomic-embed-text".to_string(),
            embedding_dim: 768,
            timeout: Duration::from_secs(10),
        }
    }
}

impl From<&recall_config::EmbeddingConfig> for OllamaEmbeddingConfig {
    fn from(config: &recall_config::EmbeddingConfig) -> Self {
        Self {
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            embedding_dim: config.dim,
            ..Default::default()
        }
    }
}

/// Request to Ollama embedding API
#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: Vec<&'a str>,
}

/// Response from Ollama embedding API
#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

/// Ollama embedder
pub struct OllamaEmbedder {
    client: Client,
    config: OllamaEmbeddingConfig,
}

impl OllamaEmbedder {
    pub fn new(config: OllamaEmbeddingConfig) -> Result<Self, RagError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| RagError::Connection(e.to_string()))?;
        Ok(Self { client, config })
    }

    async fn embed_raw(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, RagError> {
        let request = EmbedRequest {
            model: &self.config.model,
            input: texts.to_vec(),
        };

        let url = format!("{}/api/embed", self.config.endpoint.trim_end_matches('/'));

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| RagError::Embedding(format!("Ollama request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(RagError::Embedding(format!(
                "Ollama embedding failed: {} - {}",
                status, text
            )));
        }

        let embed_response: EmbedResponse = response
            .json()
            .await
            .map_err(|e| RagError::Embedding(format!("Failed to parse Ollama response: {}", e)))?;

        if embed_response.embeddings.len() != texts.len() {
            return Err(RagError::Embedding(format!(
                "Expected {} embeddings, got {}",
                texts.len(),
                embed_response.embeddings.len()
            )));
        }

        for embedding in &embed_response.embeddings {
            check_embedding(embedding, self.config.embedding_dim)?;
        }

        Ok(embed_response.embeddings)
    }

    /// Get model name
    pub fn model(&self) -> &str {
        &self.config.model
    }
}

/// Reject wrong-sized or all-zero vectors instead of passing them on
fn check_embedding(embedding: &[f32], dim: usize) -> Result<(), RagError> {
    if embedding.len() != dim {
        return Err(RagError::Embedding(format!(
            "Dimension mismatch: expected {}, got {}",
            dim,
            embedding.len()
        )));
    }
    if embedding.iter().all(|x| *x == 0.0) {
        return Err(RagError::Embedding("Model returned a zero vector".to_string()));
    }
    Ok(())
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    async fn embed(&self, text: &str) -> recall_core::Result<Vec<f32>> {
        let mut embeddings = self.embed_raw(&[text]).await?;
        embeddings
            .pop()
            .ok_or_else(|| RagError::Embedding("No embedding returned".to_string()).into())
    }

    async fn embed_batch(&self, texts: &[&str]) -> recall_core::Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self.embed_raw(texts).await?)
    }

    fn dim(&self) -> usize {
        self.config.embedding_dim
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_settings() {
        let settings = recall_config::EmbeddingConfig {
            provider: "ollama".to_string(),
            endpoint: "http://ollama:11434".to_string(),
            model: "mxbai-embed-large".to_string(),
            dim: 1024,
        };
        let config = OllamaEmbeddingConfig::from(&settings);
        assert_eq!(config.model, "mxbai-embed-large");
        assert_eq!(config.embedding_dim, 1024);
    }

    #[test]
    fn test_check_embedding() {
        assert!(check_embedding(&[0.1, 0.2], 2).is_ok());
        assert!(check_embedding(&[0.1], 2).is_err());
        assert!(check_embedding(&[0.0, 0.0], 2).is_err());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_an_error() {
        let embedder = OllamaEmbedder::new(OllamaEmbeddingConfig {
            endpoint: "http://127.0.0.1:9".to_string(),
            timeout: Duration::from_millis(200),
            ..Default::default()
        })
        .unwrap();

        assert!(embedder.embed("hello").await.is_err());
    }
}
