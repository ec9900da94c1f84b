//! recall entry point
//!
//! Composition root: settings, tracing, metrics, embedder, store, search
//! backend and pipeline are wired here and nowhere else.

mod cli;

use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use recall_config::{load_settings, Settings};
use recall_core::{Embedder, HashEmbedder, LengthEmbedder, RetrievedItem, SearchBackend};
use recall_rag::{
    HttpReranker, HttpRerankerConfig, LocalSearchBackend, OllamaEmbedder, OllamaEmbeddingConfig,
    PassthroughReranker, Pipeline, PipelineRequest, QdrantSearchBackend, QdrantSearchConfig,
};
use recall_store::{build_store, parse_dsn, MemoryInput, StoreScheme, VectorStore};

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Priority: env vars > config/{env}.* > config/default.* > defaults
    let settings = match load_settings(cli.env.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            // Tracing not yet initialized
            eprintln!("Warning: Failed to load config: {}. Using defaults.", e);
            Settings::default()
        },
    };

    init_tracing(&settings);
    init_metrics(&settings);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = ?settings.environment,
        dsn = %settings.store.dsn,
        "Configuration loaded"
    );

    let embedder = build_embedder(&settings)?;
    let store = build_store(&settings, embedder.clone()).context("building vector store")?;

    let result = match cli.command {
        Commands::Query {
            user,
            intent,
            collection,
            text,
            explain,
        } => {
            let request = PipelineRequest::new(user, text.join(" "))
                .intent(intent)
                .collection(collection)
                .explain(explain);
            run_query(&settings, embedder, store.as_ref(), &request).await
        },
        Commands::Remember {
            user,
            text,
            doc_id,
            item_type,
            topic,
            pinned,
        } => {
            let mut input = MemoryInput::new(text.join(" ")).pinned(pinned);
            if let Some(doc_id) = doc_id {
                input = input.doc_id(doc_id);
            }
            if let Some(item_type) = item_type {
                input = input.item_type(item_type);
            }
            if let Some(topic) = topic {
                input = input.topic(topic);
            }
            let id = store.upsert_memory(&user, input).await?;
            println!("{}", id);
            Ok(())
        },
        Commands::Forget { user, id } => {
            let removed = store.delete_user_memory(&user, &id).await?;
            println!("{}", if removed { "deleted" } else { "not found" });
            Ok(())
        },
    };

    if let Err(e) = store.close().await {
        tracing::warn!(error = %e, "Closing vector store failed");
    }
    result
}

async fn run_query(
    settings: &Settings,
    embedder: Arc<dyn Embedder>,
    store: &dyn VectorStore,
    request: &PipelineRequest,
) -> anyhow::Result<()> {
    let backend = build_backend(settings, embedder.clone(), store, request).await?;
    let mut pipeline = Pipeline::new(settings.retrieval.clone(), embedder, backend);

    if settings.reranker.hosted_enabled {
        let hosted: Arc<dyn recall_core::Reranker> = match settings.reranker.provider.as_str() {
            "http" => {
                let config = HttpRerankerConfig::from_settings(&settings.reranker)
                    .context("reranker.endpoint is required for the http provider")?;
                Arc::new(HttpReranker::new(config)?)
            },
            _ => Arc::new(PassthroughReranker::new(pipeline.local_reranker())),
        };
        pipeline = pipeline.with_hosted_reranker(hosted);
    }

    let output = pipeline.run(request).await;
    tracing::info!(
        results = output.texts.len(),
        cache_hit = output.cache_hit,
        "Query complete"
    );

    for text in &output.texts {
        println!("{}", text);
    }
    if request.explain {
        println!("{}", serde_json::to_string_pretty(&output.trace.to_json())?);
    }
    Ok(())
}

/// Qdrant DSNs search the collection in place; anything else indexes the
/// user's stored memories into a local backend first
async fn build_backend(
    settings: &Settings,
    embedder: Arc<dyn Embedder>,
    store: &dyn VectorStore,
    request: &PipelineRequest,
) -> anyhow::Result<Arc<dyn SearchBackend>> {
    let (scheme, url) = parse_dsn(&settings.store.dsn)?;

    if scheme == StoreScheme::Qdrant && !settings.is_test() {
        let backend = QdrantSearchBackend::new(QdrantSearchConfig {
            endpoint: url.unwrap_or_else(|| settings.store.qdrant_url.clone()),
            api_key: settings.store.qdrant_api_key.clone(),
            vector_dim: embedder.dim(),
        })?;
        return Ok(Arc::new(backend));
    }

    let local = LocalSearchBackend::in_memory(embedder)?;
    let items: Vec<RetrievedItem> = store
        .list_user_memories(&request.user_id)
        .await?
        .into_iter()
        .map(|record| {
            let metadata = record.to_metadata();
            let mut item = RetrievedItem::new(record.id, record.text, 0.0);
            item.metadata = metadata;
            if !record.embedding.is_empty() {
                item.embedding = Some(record.embedding);
            }
            item
        })
        .collect();

    let count = local
        .add_items(&request.collection, &request.user_id, items)
        .await?;
    tracing::debug!(count, "Indexed stored memories for local search");
    Ok(Arc::new(local))
}

fn build_embedder(settings: &Settings) -> anyhow::Result<Arc<dyn Embedder>> {
    let embedding = &settings.embedding;
    let embedder: Arc<dyn Embedder> = match embedding.provider.as_str() {
        "ollama" => Arc::new(OllamaEmbedder::new(OllamaEmbeddingConfig::from(embedding))?),
        "length" => Arc::new(LengthEmbedder),
        "hash" => Arc::new(HashEmbedder::default()),
        other => {
            tracing::warn!(provider = other, "Unknown embedding provider, using hash embedder");
            Arc::new(HashEmbedder::default())
        },
    };
    tracing::info!(provider = %embedding.provider, dim = embedder.dim(), "Embedder ready");
    Ok(embedder)
}

fn init_tracing(settings: &Settings) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = &settings.observability.log_level;
        format!("recall={}", level).into()
    });

    let subscriber = tracing_subscriber::registry().with(env_filter);
    let fmt_layer = if settings.observability.log_json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .boxed()
    };
    subscriber.with(fmt_layer).init();
}

fn init_metrics(settings: &Settings) {
    if !settings.observability.metrics_enabled {
        return;
    }
    // Handle is dropped: the recorder stays installed globally
    if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
        eprintln!("Warning: Failed to install metrics recorder: {}", e);
    }
}
