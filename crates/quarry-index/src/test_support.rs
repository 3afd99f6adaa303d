use std::path::Path;
use std::sync::Arc;

use quarry_llm::mock::MockProvider;
use quarry_memory::cache::CacheConfig;
use quarry_memory::{
    EmbeddingCache, GatewayConfig, InMemoryVectorStore, SqliteStore, StoreConnector, VectorGateway,
    VectorStore,
};

use crate::embedder::EmbeddingGenerator;
use crate::indexer::{CodeIndexer, IndexerConfig};
use crate::lexical::LexicalIndex;
use crate::parser::ParserBackend;
use crate::records::RecordStore;

/// A fully wired indexer over a temp source tree, sqlite file, mock embedder,
/// and in-memory vector store.
pub(crate) struct TestIndex {
    pub indexer: Arc<CodeIndexer<MockProvider>>,
    pub store: Arc<InMemoryVectorStore>,
    pub provider: MockProvider,
    src: tempfile::TempDir,
    _db: tempfile::TempDir,
}

impl TestIndex {
    pub async fn new() -> Self {
        let src = tempfile::tempdir().unwrap();
        let db = tempfile::tempdir().unwrap();
        let sqlite = SqliteStore::new(db.path().join("quarry.db").to_str().unwrap())
            .await
            .unwrap();
        let cache = Arc::new(EmbeddingCache::new(sqlite.pool().clone(), CacheConfig::default()));
        let provider = MockProvider::default();
        let generator = Arc::new(EmbeddingGenerator::new(provider.clone(), cache, 16));
        let store = Arc::new(InMemoryVectorStore::new());
        let shared: Arc<dyn VectorStore> = store.clone();
        let gateway = Arc::new(
            VectorGateway::new(StoreConnector::Shared(shared), GatewayConfig::default()).unwrap(),
        );
        let indexer = Arc::new(CodeIndexer::new(
            ParserBackend::probe(),
            generator,
            gateway,
            RecordStore::new(sqlite.pool().clone()),
            LexicalIndex::new(),
            IndexerConfig::default(),
        ));
        Self {
            indexer,
            store,
            provider,
            src,
            _db: db,
        }
    }

    pub fn root(&self) -> &Path {
        self.src.path()
    }
}
