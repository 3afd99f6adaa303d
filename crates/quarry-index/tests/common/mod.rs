#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use quarry_index::unit::unit_id;
use quarry_index::{
    CodeIndexer, EmbeddingGenerator, FileIndexRecord, HybridSearcher, IndexerConfig, LexicalIndex,
    ParserBackend, RecordStore, RunSummary, SearchConfig,
};
use quarry_llm::mock::MockProvider;
use quarry_memory::cache::CacheConfig;
use quarry_memory::{
    EmbeddingCache, GatewayConfig, InMemoryVectorStore, SqliteStore, StoreConnector, VectorGateway,
    VectorStore,
};
use tokio_util::sync::CancellationToken;

pub struct Harness {
    pub indexer: Arc<CodeIndexer<MockProvider>>,
    pub searcher: HybridSearcher<MockProvider>,
    pub generator: Arc<EmbeddingGenerator<MockProvider>>,
    pub gateway: Arc<VectorGateway>,
    pub store: Arc<InMemoryVectorStore>,
    pub records: RecordStore,
    pub lexical: LexicalIndex,
    pub provider: MockProvider,
    pub src: tempfile::TempDir,
    /// Canonical source root, the key records and unit ids are scoped by.
    pub root_key: String,
    _db: tempfile::TempDir,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with(IndexerConfig::default(), MockProvider::default()).await
    }

    pub async fn with(config: IndexerConfig, provider: MockProvider) -> Self {
        let src = tempfile::tempdir().unwrap();
        let db = tempfile::tempdir().unwrap();
        let sqlite = SqliteStore::new(db.path().join("quarry.db").to_str().unwrap())
            .await
            .unwrap();
        let cache = Arc::new(EmbeddingCache::new(sqlite.pool().clone(), CacheConfig::default()));
        let generator = Arc::new(EmbeddingGenerator::new(provider.clone(), cache, 16));
        let store = Arc::new(InMemoryVectorStore::new());
        let shared: Arc<dyn VectorStore> = store.clone();
        let gateway = Arc::new(
            VectorGateway::new(StoreConnector::Shared(shared), GatewayConfig::default()).unwrap(),
        );
        let records = RecordStore::new(sqlite.pool().clone());
        let lexical = LexicalIndex::new();
        let indexer = Arc::new(CodeIndexer::new(
            ParserBackend::probe(),
            Arc::clone(&generator),
            Arc::clone(&gateway),
            records.clone(),
            lexical.clone(),
            config,
        ));
        let searcher = HybridSearcher::new(
            Arc::clone(&generator),
            Arc::clone(&gateway),
            lexical.clone(),
            SearchConfig::default(),
        );
        let root_key = std::fs::canonicalize(src.path())
            .unwrap()
            .to_str()
            .unwrap()
            .to_owned();
        Self {
            indexer,
            searcher,
            generator,
            gateway,
            store,
            records,
            lexical,
            provider,
            src,
            root_key,
            _db: db,
        }
    }

    pub fn root(&self) -> &Path {
        self.src.path()
    }

    pub fn write(&self, rel: &str, content: impl AsRef<[u8]>) {
        let path = self.root().join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }

    pub fn remove(&self, rel: &str) {
        std::fs::remove_file(self.root().join(rel)).unwrap();
    }

    pub async fn run(&self) -> RunSummary {
        self.run_at(self.root()).await
    }

    pub async fn run_at(&self, root: &Path) -> RunSummary {
        self.indexer
            .index_directory(root, &CancellationToken::new(), None)
            .await
            .unwrap()
    }

    /// Stored id of a unit under this harness's source root.
    pub fn id(&self, rel: &str, name: &str, line: usize) -> String {
        unit_id(&self.root_key, rel, name, line)
    }

    pub async fn record(&self, rel: &str) -> Option<FileIndexRecord> {
        self.records.get(&self.root_key, rel).await.unwrap()
    }

    pub fn has_point(&self, id: &str) -> bool {
        self.store
            .point_ids(self.gateway.collection())
            .iter()
            .any(|p| p == id)
    }

    pub fn point_count(&self) -> usize {
        self.store.point_ids(self.gateway.collection()).len()
    }
}

pub fn python_function(name: &str) -> String {
    format!("def {name}(value):\n    return value + 1\n")
}
