//! Application bootstrap: provider, storage, and index wiring.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use quarry_index::{
    CodeIndexer, EmbeddingGenerator, HybridSearcher, IndexWatcher, LexicalIndex, ParserBackend,
    RecordStore,
};
use quarry_llm::any::AnyProvider;
use quarry_llm::ollama::OllamaProvider;
use quarry_llm::openai::OpenAiProvider;
use quarry_llm::provider::EmbeddingProvider;
use quarry_memory::cache::CacheStats;
use quarry_memory::{
    EmbeddingCache, InMemoryVectorStore, PoolStats, SqliteStore, StoreConnector, VectorGateway,
    VectorStore,
};
use tokio_util::sync::CancellationToken;

use crate::config::{Config, ProviderKind, VectorBackend};

/// Everything a command needs, built once from [`Config`] and passed down.
pub struct AppContext<P = AnyProvider> {
    pub config: Config,
    pub sqlite: SqliteStore,
    pub cache: Arc<EmbeddingCache>,
    pub generator: Arc<EmbeddingGenerator<P>>,
    pub gateway: Arc<VectorGateway>,
    pub records: RecordStore,
    pub lexical: LexicalIndex,
    pub indexer: Arc<CodeIndexer<P>>,
    pub searcher: HybridSearcher<P>,
    parser_name: &'static str,
}

/// Point-in-time view of the index for `quarry status`.
#[derive(Debug, Clone)]
pub struct IndexStatus {
    pub project: String,
    pub files: u64,
    pub units: u64,
    pub lexical_units: usize,
    pub collection: String,
    /// `None` when the vector store could not be reached.
    pub vector_points: Option<u64>,
    pub provider: &'static str,
    pub model: String,
    pub parser: &'static str,
    pub cache: CacheStats,
    pub pool: PoolStats,
}

impl AppContext<AnyProvider> {
    /// Build the full context from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the config is invalid, the database cannot be opened,
    /// or the requested provider/parser is unavailable in this build.
    pub async fn build(mut config: Config) -> anyhow::Result<Self> {
        let provider = create_provider(&config)?;
        let connector = create_connector(&config);
        if config.vector_store.backend == VectorBackend::Memory
            && config.storage.sqlite_path != ":memory:"
        {
            tracing::info!("memory vector backend selected, keeping file records in memory too");
            config.storage.sqlite_path = ":memory:".into();
        }
        Self::with_parts(config, provider, connector).await
    }
}

impl<P: EmbeddingProvider + 'static> AppContext<P> {
    /// Build the context around an explicit provider and vector store connector.
    ///
    /// The lexical index is rebuilt from the durable unit table, so search works
    /// right after startup without re-indexing.
    ///
    /// # Errors
    ///
    /// Returns an error if the config is invalid or any component fails to open.
    pub async fn with_parts(
        config: Config,
        provider: P,
        connector: StoreConnector,
    ) -> anyhow::Result<Self> {
        config.validate()?;

        let sqlite = SqliteStore::new(&config.storage.sqlite_path)
            .await
            .with_context(|| format!("failed to open {}", config.storage.sqlite_path))?;
        let cache = Arc::new(EmbeddingCache::new(
            sqlite.pool().clone(),
            config.cache.cache_config(),
        ));
        let generator = Arc::new(EmbeddingGenerator::new(
            provider,
            Arc::clone(&cache),
            config.llm.batch_size,
        ));
        let gateway = Arc::new(
            VectorGateway::new(connector, config.vector_store.gateway_config())
                .context("invalid vector store settings")?,
        );

        let parser = ParserBackend::from_preference(config.index.parser)
            .context("requested parser backend is unavailable")?;
        let parser_name = parser.name();

        let records = RecordStore::new(sqlite.pool().clone());
        let docs = records
            .load_docs()
            .await
            .context("failed to load indexed units")?;
        let lexical = LexicalIndex::from_docs(docs);
        tracing::info!(
            files = lexical.file_count(),
            units = lexical.len(),
            "lexical index rebuilt"
        );

        let indexer = Arc::new(CodeIndexer::new(
            parser,
            Arc::clone(&generator),
            Arc::clone(&gateway),
            records.clone(),
            lexical.clone(),
            config.index.indexer_config(),
        ));
        let searcher = HybridSearcher::new(
            Arc::clone(&generator),
            Arc::clone(&gateway),
            lexical.clone(),
            config.search.search_config(),
        );

        Ok(Self {
            config,
            sqlite,
            cache,
            generator,
            gateway,
            records,
            lexical,
            indexer,
            searcher,
            parser_name,
        })
    }

    /// Start re-indexing files under `root` as they change.
    ///
    /// # Errors
    ///
    /// Returns an error if the filesystem watcher cannot be initialized.
    pub fn watch(&self, root: &Path, cancel: CancellationToken) -> anyhow::Result<IndexWatcher> {
        IndexWatcher::start(
            root,
            Arc::clone(&self.indexer),
            self.config.index.watch_debounce(),
            cancel,
        )
        .with_context(|| format!("failed to watch {}", root.display()))
    }

    /// # Errors
    ///
    /// Returns an error if the local database cannot be read. An unreachable
    /// vector store is reported as `vector_points: None` instead.
    pub async fn status(&self) -> anyhow::Result<IndexStatus> {
        let (files, units) = self.records.counts().await.context("failed to count records")?;
        let cache = self.cache.stats().await.context("failed to read cache stats")?;
        let vector_points = match self.gateway.count().await {
            Ok(n) => Some(n),
            Err(e) => {
                tracing::warn!("vector store count failed: {e}");
                None
            }
        };
        let provider = self.generator.provider();
        Ok(IndexStatus {
            project: self.config.index.project.clone(),
            files,
            units,
            lexical_units: self.lexical.len(),
            collection: self.gateway.collection().to_owned(),
            vector_points,
            provider: provider.name(),
            model: format!("{}@{}", provider.model_identity(), provider.model_version()),
            parser: self.parser_name,
            cache,
            pool: self.gateway.pool_stats(),
        })
    }

    /// Close pooled vector store connections.
    pub fn shutdown(&self) {
        self.gateway.close();
        let stats = self.gateway.pool_stats();
        tracing::debug!(
            acquired = stats.acquired,
            released = stats.released,
            "vector store pool closed"
        );
    }
}

/// # Errors
///
/// Returns an error if the configured provider is not compiled into this build.
pub fn create_provider(config: &Config) -> anyhow::Result<AnyProvider> {
    let llm = &config.llm;
    match llm.provider {
        ProviderKind::Ollama => Ok(AnyProvider::Ollama(OllamaProvider::new(
            &llm.base_url,
            llm.embedding_model.clone(),
            llm.model_version.clone(),
        ))),
        ProviderKind::OpenAi => Ok(AnyProvider::OpenAi(
            OpenAiProvider::new(
                llm.api_key.clone(),
                llm.base_url.clone(),
                llm.embedding_model.clone(),
                llm.model_version.clone(),
            )
            .with_max_retries(llm.max_retries),
        )),
        #[cfg(feature = "mock")]
        ProviderKind::Mock => Ok(AnyProvider::Mock(
            quarry_llm::mock::MockProvider::default()
                .with_model(&llm.embedding_model, &llm.model_version),
        )),
        #[cfg(not(feature = "mock"))]
        ProviderKind::Mock => anyhow::bail!("the mock provider requires the `mock` feature"),
    }
}

#[must_use]
pub fn create_connector(config: &Config) -> StoreConnector {
    match config.vector_store.backend {
        VectorBackend::Qdrant => StoreConnector::Qdrant {
            url: config.vector_store.url.clone(),
        },
        VectorBackend::Memory => {
            let store: Arc<dyn VectorStore> = Arc::new(InMemoryVectorStore::new());
            StoreConnector::Shared(store)
        }
    }
}
