//! Store selection from settings
//!
//! `store.dsn` names the backend. Test mode always gets the in-memory store.
//! Outside strict mode a backend that cannot be built degrades to memory
//! with a warning; in strict mode the error is returned.

use std::str::FromStr;
use std::sync::Arc;

use recall_config::Settings;
use recall_core::Embedder;

use crate::{
    ChromaConfig, ChromaStore, DualReadStore, MemoryStore, QdrantStore, QdrantStoreConfig,
    StoreError, VectorStore,
};

/// Backend named by a DSN
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreScheme {
    Memory,
    Chroma,
    Qdrant,
    /// Qdrant primary, Chroma fallback
    Dual,
}

impl StoreScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Chroma => "chroma",
            Self::Qdrant => "qdrant",
            Self::Dual => "dual",
        }
    }
}

impl FromStr for StoreScheme {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "memory" | "mem" | "inmemory" => Ok(Self::Memory),
            "chroma" | "chromadb" => Ok(Self::Chroma),
            "qdrant" => Ok(Self::Qdrant),
            "dual" => Ok(Self::Dual),
            other => Err(StoreError::Config(format!("Unknown store scheme: {}", other))),
        }
    }
}

/// Split a DSN into scheme and optional endpoint URL
///
/// `qdrant` → no URL; `qdrant://db:6334` → `http://db:6334`;
/// `chroma+https://host` → `https://host`.
pub fn parse_dsn(dsn: &str) -> Result<(StoreScheme, Option<String>), StoreError> {
    let dsn = dsn.trim();
    let Some((head, rest)) = dsn.split_once("://") else {
        return Ok((dsn.parse()?, None));
    };

    let (scheme, transport) = match head.split_once('+') {
        Some((scheme, transport)) => (scheme, transport),
        None => (head, "http"),
    };
    let scheme: StoreScheme = scheme.parse()?;

    if !matches!(transport, "http" | "https") {
        return Err(StoreError::Config(format!(
            "Unsupported transport '{}' in store DSN",
            transport
        )));
    }

    let rest = rest.trim_end_matches('/');
    if rest.is_empty() {
        return Ok((scheme, None));
    }
    if scheme == StoreScheme::Memory || scheme == StoreScheme::Dual {
        return Err(StoreError::Config(format!(
            "Store scheme '{}' takes no URL",
            scheme.as_str()
        )));
    }

    Ok((scheme, Some(format!("{}://{}", transport, rest))))
}

/// Build the configured store
pub fn build_store(
    settings: &Settings,
    embedder: Arc<dyn Embedder>,
) -> Result<Arc<dyn VectorStore>, StoreError> {
    if settings.is_test() {
        tracing::info!("Test environment, using in-memory store");
        return Ok(memory_store(settings, embedder));
    }

    let strict = settings.is_strict();
    match try_build(settings, embedder.clone()) {
        Ok(store) => {
            tracing::info!(backend = store.backend_name(), "Vector store ready");
            Ok(store)
        },
        Err(e) if strict => {
            tracing::error!(error = %e, dsn = %settings.store.dsn, "Vector store misconfigured");
            Err(e)
        },
        Err(e) => {
            tracing::warn!(
                error = %e,
                dsn = %settings.store.dsn,
                "Vector store unavailable, falling back to in-memory store"
            );
            Ok(memory_store(settings, embedder))
        },
    }
}

fn memory_store(settings: &Settings, embedder: Arc<dyn Embedder>) -> Arc<dyn VectorStore> {
    Arc::new(MemoryStore::new(embedder, settings.store.similarity_threshold))
}

fn try_build(
    settings: &Settings,
    embedder: Arc<dyn Embedder>,
) -> Result<Arc<dyn VectorStore>, StoreError> {
    let (scheme, url) = parse_dsn(&settings.store.dsn)?;

    let mut chroma = ChromaConfig::from(&settings.store);
    let mut qdrant = QdrantStoreConfig::from(&settings.store);
    match (scheme, url) {
        (StoreScheme::Chroma, Some(url)) => chroma.url = url,
        (StoreScheme::Qdrant, Some(url)) => qdrant.url = url,
        _ => {},
    }

    match scheme {
        StoreScheme::Memory => Ok(memory_store(settings, embedder)),
        StoreScheme::Chroma => Ok(Arc::new(chroma_store(chroma, embedder)?)),
        StoreScheme::Qdrant => Ok(Arc::new(qdrant_store(qdrant, embedder)?)),
        StoreScheme::Dual => {
            let primary = Arc::new(qdrant_store(qdrant, embedder.clone())?);
            let fallback = Arc::new(chroma_store(chroma, embedder)?);
            Ok(Arc::new(DualReadStore::new(
                primary,
                fallback,
                settings.store.write_both,
            )))
        },
    }
}

fn chroma_store(config: ChromaConfig, embedder: Arc<dyn Embedder>) -> Result<ChromaStore, StoreError> {
    require_credential("chroma", &config.url, config.token.as_deref())?;
    ChromaStore::new(config, embedder)
}

fn qdrant_store(
    config: QdrantStoreConfig,
    embedder: Arc<dyn Embedder>,
) -> Result<QdrantStore, StoreError> {
    require_credential("qdrant", &config.url, config.api_key.as_deref())?;
    QdrantStore::new(config, embedder)
}

/// Hosted (https) endpoints need a credential
fn require_credential(backend: &str, url: &str, credential: Option<&str>) -> Result<(), StoreError> {
    let has_credential = credential.is_some_and(|c| !c.trim().is_empty());
    if url.starts_with("https://") && !has_credential {
        return Err(StoreError::Config(format!(
            "{} at {} requires a credential",
            backend, url
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use recall_config::RuntimeEnvironment;
    use recall_core::HashEmbedder;

    fn embedder() -> Arc<dyn Embedder> {
        Arc::new(HashEmbedder::default())
    }

    fn settings(env: RuntimeEnvironment, dsn: &str) -> Settings {
        let mut settings = Settings::default();
        settings.environment = env;
        settings.store.dsn = dsn.to_string();
        settings
    }

    /// `ENV=test` in the process forces memory regardless of settings
    fn forced_test_env() -> bool {
        Settings::default().is_test()
    }

    #[test]
    fn test_parse_dsn() {
        assert_eq!(parse_dsn("memory").unwrap(), (StoreScheme::Memory, None));
        assert_eq!(parse_dsn(" Qdrant ").unwrap(), (StoreScheme::Qdrant, None));
        assert_eq!(
            parse_dsn("qdrant://db:6334").unwrap(),
            (StoreScheme::Qdrant, Some("http://db:6334".to_string()))
        );
        assert_eq!(
            parse_dsn("chroma+https://api.trychroma.com/").unwrap(),
            (
                StoreScheme::Chroma,
                Some("https://api.trychroma.com".to_string())
            )
        );
        assert_eq!(parse_dsn("dual://").unwrap(), (StoreScheme::Dual, None));
    }

    #[test]
    fn test_parse_dsn_rejects_garbage() {
        assert!(parse_dsn("redis").is_err());
        assert!(parse_dsn("qdrant+grpc://db:6334").is_err());
        assert!(parse_dsn("memory://somewhere").is_err());
    }

    #[test]
    fn test_require_credential() {
        assert!(require_credential("qdrant", "http://localhost:6334", None).is_ok());
        assert!(require_credential("qdrant", "https://cloud:6334", None).is_err());
        assert!(require_credential("qdrant", "https://cloud:6334", Some(" ")).is_err());
        assert!(require_credential("qdrant", "https://cloud:6334", Some("key")).is_ok());
    }

    #[test]
    fn test_test_environment_uses_memory() {
        let store = build_store(&settings(RuntimeEnvironment::Test, "qdrant"), embedder()).unwrap();
        assert_eq!(store.backend_name(), "memory");
    }

    #[test]
    fn test_unknown_scheme_degrades_outside_strict_mode() {
        let store = build_store(
            &settings(RuntimeEnvironment::Development, "redis"),
            embedder(),
        )
        .unwrap();
        assert_eq!(store.backend_name(), "memory");
    }

    #[test]
    fn test_strict_mode_fails_fast() {
        if forced_test_env() {
            return;
        }
        assert!(build_store(
            &settings(RuntimeEnvironment::Production, "redis"),
            embedder()
        )
        .is_err());

        let mut strict = settings(RuntimeEnvironment::Development, "chroma+https://hosted");
        strict.store.strict = true;
        assert!(build_store(&strict, embedder()).is_err());
    }

    #[test]
    fn test_chroma_store_from_dsn() {
        if forced_test_env() {
            return;
        }
        let store = build_store(
            &settings(RuntimeEnvironment::Development, "chroma://localhost:8000"),
            embedder(),
        )
        .unwrap();
        assert_eq!(store.backend_name(), "chroma");
    }
}
