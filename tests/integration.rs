use std::path::Path;
use std::sync::Arc;

use quarry_core::AppContext;
use quarry_core::config::{Config, ProviderKind, VectorBackend};
use quarry_index::{FileOutcome, SearchMode, SearchQuery};
use quarry_llm::mock::MockProvider;
use quarry_memory::{InMemoryVectorStore, StoreConnector, VectorStore};
use serial_test::serial;
use tokio_util::sync::CancellationToken;

// -- Fixtures --

struct Workspace {
    src: tempfile::TempDir,
    db: tempfile::TempDir,
    store: Arc<InMemoryVectorStore>,
}

impl Workspace {
    fn new() -> Self {
        Self {
            src: tempfile::tempdir().unwrap(),
            db: tempfile::tempdir().unwrap(),
            store: Arc::new(InMemoryVectorStore::new()),
        }
    }

    fn config(&self) -> Config {
        let mut config = Config::default();
        config.storage.sqlite_path = self
            .db
            .path()
            .join("quarry.db")
            .to_string_lossy()
            .into_owned();
        config.index.project = "fixture".into();
        config
    }

    async fn open(&self, provider: MockProvider) -> AppContext<MockProvider> {
        let shared: Arc<dyn VectorStore> = self.store.clone();
        AppContext::with_parts(self.config(), provider, StoreConnector::Shared(shared))
            .await
            .unwrap()
    }

    fn write(&self, rel: &str, content: &str) {
        let path = self.src.path().join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn root(&self) -> &Path {
        self.src.path()
    }

    fn root_key(&self) -> String {
        std::fs::canonicalize(self.root())
            .unwrap()
            .to_string_lossy()
            .into_owned()
    }
}

async fn index(app: &AppContext<MockProvider>, root: &Path) -> quarry_index::RunSummary {
    app.indexer
        .index_directory(root, &CancellationToken::new(), None)
        .await
        .unwrap()
}

fn seed(ws: &Workspace) {
    ws.write(
        "app/tokens.py",
        "class TokenStore:\n    def rotate_token(self, user):\n        return user.id\n\n    def revoke_token(self, user):\n        return None\n",
    );
    ws.write(
        "app/http.py",
        "def handle_request(req):\n    return respond(req)\n",
    );
    ws.write(
        "core/src/lib.rs",
        "pub fn checksum(data: &[u8]) -> u32 {\n    data.iter().map(|b| u32::from(*b)).sum()\n}\n",
    );
    ws.write("README.md", "# Fixture\n\nToken rotation notes.\n");
}

// -- End-to-end --

#[tokio::test]
async fn index_search_and_reopen() {
    let ws = Workspace::new();
    seed(&ws);
    let provider = MockProvider::default();

    let app = ws.open(provider.clone()).await;
    let summary = index(&app, ws.root()).await;
    assert_eq!(summary.files_indexed, 4);
    assert!(summary.files_failed.is_empty());

    let hits = app
        .searcher
        .search(&SearchQuery::new("rotate_token").with_mode(SearchMode::Lexical))
        .await
        .unwrap();
    assert_eq!(hits[0].file_path, "app/tokens.py");
    assert!(hits.iter().any(|hit| hit.name == "rotate_token"));
    app.shutdown();
    drop(app);

    // A fresh context sees the same index without re-embedding anything.
    let embedded = provider.texts_embedded();
    let app = ws.open(provider.clone()).await;
    let summary = index(&app, ws.root()).await;
    assert_eq!(summary.files_unchanged, 4);
    assert_eq!(summary.units_indexed, 0);
    assert_eq!(provider.texts_embedded(), embedded + 1);

    let hits = app
        .searcher
        .search(&SearchQuery::new("checksum data"))
        .await
        .unwrap();
    assert_eq!(hits[0].file_path, "core/src/lib.rs");
}

#[tokio::test]
async fn cache_makes_reindexing_after_clear_cheap() {
    let ws = Workspace::new();
    seed(&ws);
    let provider = MockProvider::default();
    let app = ws.open(provider.clone()).await;
    index(&app, ws.root()).await;

    let stats = app.cache.stats().await.unwrap();
    assert!(stats.total_entries >= 4);

    // Forget the records but keep the cache: every unit is a cache hit.
    let key = ws.root_key();
    for path in ["app/tokens.py", "app/http.py", "core/src/lib.rs", "README.md"] {
        app.records.remove_file(&key, path).await.unwrap();
    }
    let before = provider.texts_embedded();
    let summary = index(&app, ws.root()).await;
    assert_eq!(summary.files_indexed, 4);
    assert_eq!(provider.texts_embedded(), before + 1);

    let removed = app.cache.clear().await.unwrap();
    assert_eq!(removed, stats.total_entries);
    assert_eq!(app.cache.stats().await.unwrap().total_entries, 0);
}

#[tokio::test]
async fn switching_models_never_reuses_vectors() {
    let ws = Workspace::new();
    ws.write("a.py", "def alpha():\n    return 1\n");
    let first = MockProvider::default().with_model("embed-a", "1");
    let app = ws.open(first.clone()).await;
    index(&app, ws.root()).await;
    let cached = app.cache.stats().await.unwrap().total_entries;
    app.shutdown();
    drop(app);

    let second = MockProvider::default().with_model("embed-b", "1");
    let app = ws.open(second.clone()).await;
    app.records.remove_file(&ws.root_key(), "a.py").await.unwrap();
    index(&app, ws.root()).await;
    assert!(second.texts_embedded() > 1);
    assert!(app.cache.stats().await.unwrap().total_entries > cached);
}

#[tokio::test]
async fn single_file_reindex_matches_full_run() {
    let ws = Workspace::new();
    seed(&ws);
    let app = ws.open(MockProvider::default()).await;
    index(&app, ws.root()).await;

    ws.write("app/http.py", "def handle_upload(req):\n    return store(req)\n");
    let outcome = app
        .indexer
        .reindex_file(ws.root(), &ws.root().join("app/http.py"))
        .await
        .unwrap();
    assert_eq!(outcome, FileOutcome::Indexed);

    let summary = index(&app, ws.root()).await;
    assert_eq!(summary.files_unchanged, 4);
    let hits = app
        .searcher
        .search(&SearchQuery::new("handle_upload").with_mode(SearchMode::Lexical))
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert!(
        app.searcher
            .search(&SearchQuery::new("respond").with_mode(SearchMode::Lexical))
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn pool_is_balanced_after_mixed_runs() {
    let ws = Workspace::new();
    seed(&ws);
    let app = ws.open(MockProvider::default()).await;
    index(&app, ws.root()).await;
    ws.store.set_offline(true);
    assert!(
        app.indexer
            .index_directory(ws.root(), &CancellationToken::new(), None)
            .await
            .is_err()
    );
    ws.store.set_offline(false);
    std::fs::remove_file(ws.root().join("README.md")).unwrap();
    index(&app, ws.root()).await;

    let stats = app.gateway.pool_stats();
    assert_eq!(stats.acquired, stats.released);
    assert_eq!(stats.in_use, 0);
}

// -- Configuration --

#[tokio::test]
#[serial]
async fn build_from_env_configured_mock_stack() {
    let ws = Workspace::new();
    seed(&ws);
    let config_path = ws.db.path().join("quarry.toml");
    std::fs::write(
        &config_path,
        "[llm]\nprovider = \"mock\"\nembedding_model = \"fixture-embed\"\n\n[vector_store]\nbackend = \"qdrant\"\n",
    )
    .unwrap();
    unsafe { std::env::set_var("QUARRY_VECTOR_BACKEND", "memory") };
    let config = Config::load(&config_path).unwrap();
    unsafe { std::env::remove_var("QUARRY_VECTOR_BACKEND") };
    assert_eq!(config.llm.provider, ProviderKind::Mock);
    assert_eq!(config.vector_store.backend, VectorBackend::Memory);

    let app = AppContext::build(config).await.unwrap();
    assert_eq!(app.config.storage.sqlite_path, ":memory:");
    let summary = app
        .indexer
        .index_directory(ws.root(), &CancellationToken::new(), None)
        .await
        .unwrap();
    assert_eq!(summary.files_indexed, 4);

    let status = app.status().await.unwrap();
    assert_eq!(status.files, 4);
    assert_eq!(status.provider, "mock");
    assert_eq!(status.model, "fixture-embed@1");
    assert!(status.vector_points.unwrap_or_default() >= 4);
}
