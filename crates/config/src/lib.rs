//! Configuration management for hybrid retrieval
//!
//! Supports loading configuration from:
//! - TOML/YAML/JSON files (`config/default.*`, `config/{env}.*`)
//! - Environment variables (`RECALL__` prefix, `__` separator)
//! - Runtime overrides
//!
//! Every field has a default, so the pipeline runs with zero configuration.

pub mod constants;
pub mod settings;

pub use settings::{
    load_settings, EmbeddingConfig, IntentBudget, ObservabilityConfig, RerankerSettings,
    RetrievalConfig, RuntimeEnvironment, Settings, StoreConfig,
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

impl From<config::ConfigError> for ConfigError {
    fn from(err: config::ConfigError) -> Self {
        ConfigError::ParseError(err.to_string())
    }
}
