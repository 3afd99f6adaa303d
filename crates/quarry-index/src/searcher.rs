//! Hybrid retrieval: BM25 and vector rankings fused with RRF.

use std::collections::HashMap;
use std::sync::Arc;

use quarry_llm::EmbeddingProvider;
use quarry_memory::{FieldCondition, VectorFilter, VectorGateway};
use serde::{Deserialize, Serialize};

use crate::category::{CATEGORY_FIELD, Category};
use crate::context::unit_display_header;
use crate::embedder::EmbeddingGenerator;
use crate::error::{IndexError, Result};
use crate::fusion::{DEFAULT_RRF_K, reciprocal_rank_fusion};
use crate::languages::Lang;
use crate::lexical::{LexicalIndex, UnitDoc};
use crate::unit::{FILE_PATH_FIELD, LANGUAGE_FIELD, PROJECT_FIELD, UnitType};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    #[default]
    Hybrid,
    Lexical,
    Vector,
}

impl std::str::FromStr for SearchMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hybrid" => Ok(Self::Hybrid),
            "lexical" | "bm25" => Ok(Self::Lexical),
            "vector" | "semantic" => Ok(Self::Vector),
            other => Err(format!("unknown search mode: {other}")),
        }
    }
}

/// Scope restriction applied identically to both rankings. An empty
/// `categories` list means [`Category::default_filter`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchFilter {
    pub project: Option<String>,
    pub file_path: Option<String>,
    pub language: Option<Lang>,
    pub categories: Vec<Category>,
}

impl SearchFilter {
    fn categories(&self) -> Vec<Category> {
        if self.categories.is_empty() {
            Category::default_filter()
        } else {
            self.categories.clone()
        }
    }

    #[must_use]
    pub fn matches(&self, doc: &UnitDoc) -> bool {
        self.project.as_ref().is_none_or(|p| *p == doc.project)
            && self.file_path.as_ref().is_none_or(|f| *f == doc.file_path)
            && self.language.is_none_or(|l| l == doc.language)
            && self.categories().contains(&doc.category)
    }

    #[must_use]
    pub fn to_vector_filter(&self) -> VectorFilter {
        let mut must = Vec::new();
        if let Some(project) = &self.project {
            must.push(FieldCondition::text(PROJECT_FIELD, project.as_str()));
        }
        if let Some(path) = &self.file_path {
            must.push(FieldCondition::text(FILE_PATH_FIELD, path.as_str()));
        }
        if let Some(lang) = self.language {
            must.push(FieldCondition::text(LANGUAGE_FIELD, lang.id()));
        }
        let should = self
            .categories()
            .into_iter()
            .map(|c| FieldCondition::text(CATEGORY_FIELD, c.as_str()))
            .collect();
        VectorFilter {
            must,
            should,
            must_not: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SearchQuery {
    pub text: String,
    /// 0 means the configured default.
    pub limit: usize,
    pub mode: SearchMode,
    pub filter: SearchFilter,
}

impl SearchQuery {
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    #[must_use]
    pub fn with_mode(mut self, mode: SearchMode) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub fn with_filter(mut self, filter: SearchFilter) -> Self {
        self.filter = filter;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub unit_id: String,
    pub file_path: String,
    pub name: String,
    pub unit_type: UnitType,
    pub language: Lang,
    pub category: Category,
    pub start_line: usize,
    pub end_line: usize,
    pub content: String,
    pub fused_score: f64,
    pub lexical_rank: Option<usize>,
    pub vector_rank: Option<usize>,
    pub lexical_score: Option<f64>,
    pub vector_score: Option<f32>,
}

impl SearchHit {
    #[must_use]
    pub fn header(&self) -> String {
        unit_display_header(&self.file_path, &self.name, self.start_line, self.end_line)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SearchConfig {
    pub rrf_k: f64,
    pub default_limit: usize,
    /// Each ranking fetches `limit * candidate_multiplier` candidates.
    pub candidate_multiplier: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            rrf_k: DEFAULT_RRF_K,
            default_limit: 10,
            candidate_multiplier: 3,
        }
    }
}

pub struct HybridSearcher<P> {
    generator: Arc<EmbeddingGenerator<P>>,
    gateway: Arc<VectorGateway>,
    lexical: LexicalIndex,
    config: SearchConfig,
}

impl<P: EmbeddingProvider> HybridSearcher<P> {
    #[must_use]
    pub fn new(
        generator: Arc<EmbeddingGenerator<P>>,
        gateway: Arc<VectorGateway>,
        lexical: LexicalIndex,
        config: SearchConfig,
    ) -> Self {
        Self {
            generator,
            gateway,
            lexical,
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> SearchConfig {
        self.config
    }

    /// Run `query` and return at most `limit` hits, best first. Equal scores are
    /// ordered by unit id, so an unchanged index always answers identically.
    ///
    /// # Errors
    ///
    /// Returns an error if the query cannot be embedded or the vector store
    /// cannot be searched. Lexical mode never touches either.
    pub async fn search(&self, query: &SearchQuery) -> Result<Vec<SearchHit>> {
        let limit = if query.limit == 0 {
            self.config.default_limit
        } else {
            query.limit
        };
        if query.text.trim().is_empty() || limit == 0 || self.lexical.is_empty() {
            return Ok(Vec::new());
        }
        let candidates = limit.saturating_mul(self.config.candidate_multiplier.max(1));

        let lexical_hits = if query.mode == SearchMode::Vector {
            Vec::new()
        } else {
            self.lexical
                .search(&query.text, candidates, |doc| query.filter.matches(doc))
        };
        let vector_hits = if query.mode == SearchMode::Lexical {
            Vec::new()
        } else {
            self.vector_candidates(query, candidates).await?
        };

        let lexical_ids: Vec<&str> = lexical_hits.iter().map(|h| h.unit_id.as_str()).collect();
        let vector_ids: Vec<&str> = vector_hits.iter().map(|(id, _)| id.as_str()).collect();
        let fused = reciprocal_rank_fusion(&lexical_ids, &vector_ids, self.config.rrf_k, limit);

        let lexical_scores: HashMap<&str, f64> = lexical_hits
            .iter()
            .map(|h| (h.unit_id.as_str(), h.score))
            .collect();
        let vector_scores: HashMap<&str, f32> = vector_hits
            .iter()
            .map(|(id, score)| (id.as_str(), *score))
            .collect();

        let hits: Vec<SearchHit> = fused
            .into_iter()
            .filter_map(|r| {
                let doc = self.lexical.get(&r.unit_id)?;
                Some(SearchHit {
                    lexical_score: lexical_scores.get(r.unit_id.as_str()).copied(),
                    vector_score: vector_scores.get(r.unit_id.as_str()).copied(),
                    unit_id: r.unit_id,
                    file_path: doc.file_path,
                    name: doc.name,
                    unit_type: doc.unit_type,
                    language: doc.language,
                    category: doc.category,
                    start_line: doc.start_line,
                    end_line: doc.end_line,
                    content: doc.content,
                    fused_score: r.fused_score,
                    lexical_rank: r.lexical_rank,
                    vector_rank: r.vector_rank,
                })
            })
            .collect();

        tracing::debug!(
            mode = ?query.mode,
            lexical = lexical_hits.len(),
            vector = vector_hits.len(),
            returned = hits.len(),
            "search complete"
        );
        Ok(hits)
    }

    /// Vector ranking restricted to units the lexical store knows, re-sorted by
    /// score then id so store-side tie order cannot leak into results.
    async fn vector_candidates(&self, query: &SearchQuery, candidates: usize) -> Result<Vec<(String, f32)>> {
        let vector = self.generator.embed_query(&query.text).await?;
        let points = self
            .gateway
            .query(
                vector,
                u64::try_from(candidates)?,
                Some(query.filter.to_vector_filter()),
            )
            .await
            .map_err(IndexError::from)?;

        let mut hits: Vec<(String, f32)> = points
            .into_iter()
            .filter(|p| {
                self.lexical
                    .get(&p.id)
                    .is_some_and(|doc| query.filter.matches(&doc))
            })
            .map(|p| (p.id, p.score))
            .collect();
        hits.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use quarry_llm::mock::MockProvider;
    use quarry_memory::cache::CacheConfig;
    use quarry_memory::{
        EmbeddingCache, GatewayConfig, InMemoryVectorStore, SqliteStore, StoreConnector, VectorPoint,
        VectorStore,
    };

    use super::*;
    use crate::context::contextualize_for_embedding;
    use crate::unit::SemanticUnit;

    struct Fixture {
        searcher: HybridSearcher<MockProvider>,
        store: Arc<InMemoryVectorStore>,
        _dir: tempfile::TempDir,
    }

    fn unit(path: &str, name: &str, content: &str, lang: Lang) -> SemanticUnit {
        let unit_type = if lang.is_whole_file() {
            UnitType::Module
        } else {
            UnitType::Function
        };
        SemanticUnit::new(path, unit_type, name, content, (1, 3), lang)
    }

    async fn fixture(units: &[SemanticUnit]) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let sqlite = SqliteStore::new(dir.path().join("q.db").to_str().unwrap())
            .await
            .unwrap();
        let cache = Arc::new(EmbeddingCache::new(sqlite.pool().clone(), CacheConfig::default()));
        let provider = MockProvider::default();
        let generator = Arc::new(EmbeddingGenerator::new(provider.clone(), cache, 16));

        let store = Arc::new(InMemoryVectorStore::new());
        let config = GatewayConfig::default();
        store.ensure_collection(&config.collection, 8).await.unwrap();
        let docs: Vec<UnitDoc> = units
            .iter()
            .map(|u| UnitDoc::from_unit(u, "demo", "/repo"))
            .collect();
        let points = units
            .iter()
            .zip(&docs)
            .map(|(u, d)| VectorPoint {
                id: u.unit_id.clone(),
                vector: provider.vector_for(&contextualize_for_embedding(u)),
                payload: d.payload(),
            })
            .collect();
        store.upsert(&config.collection, points).await.unwrap();

        let shared: Arc<dyn VectorStore> = store.clone();
        let gateway = Arc::new(VectorGateway::new(StoreConnector::Shared(shared), config).unwrap());
        let lexical = LexicalIndex::from_docs(docs);
        Fixture {
            searcher: HybridSearcher::new(generator, gateway, lexical, SearchConfig::default()),
            store,
            _dir: dir,
        }
    }

    fn corpus() -> Vec<SemanticUnit> {
        vec![
            unit("src/auth.py", "login", "def login(user, password):\n    verify_password(user, password)", Lang::Python),
            unit("src/auth.py", "logout", "def logout(session):\n    session.close()", Lang::Python),
            unit("src/db.rs", "connect", "fn connect(url: &str) -> Pool {\n    Pool::open(url)\n}", Lang::Rust),
            unit("docs/guide.md", "guide", "Call login with a password before anything else.", Lang::Markdown),
            unit("config/app.toml", "app", "password_min_length = 12", Lang::Toml),
        ]
    }

    #[tokio::test]
    async fn hybrid_search_is_deterministic() {
        let f = fixture(&corpus()).await;
        let query = SearchQuery::new("login password").with_limit(4);
        let first = f.searcher.search(&query).await.unwrap();
        let second = f.searcher.search(&query).await.unwrap();
        assert!(!first.is_empty());
        assert_eq!(first, second);
        assert!(first.len() <= 4);
    }

    #[tokio::test]
    async fn vector_only_hits_are_kept() {
        let f = fixture(&corpus()).await;
        let hits = f
            .searcher
            .search(&SearchQuery::new("login password").with_limit(5))
            .await
            .unwrap();
        // Five units, five vector candidates: every unit is reachable by vector.
        assert_eq!(hits.len(), 5);
        assert!(hits.iter().any(|h| h.lexical_rank.is_none() && h.vector_rank.is_some()));
    }

    #[tokio::test]
    async fn lexical_mode_skips_vector_store() {
        let f = fixture(&corpus()).await;
        f.store.set_offline(true);
        let hits = f
            .searcher
            .search(&SearchQuery::new("logout").with_mode(SearchMode::Lexical))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].name, "logout");
        assert!(hits[0].vector_rank.is_none());
    }

    #[tokio::test]
    async fn vector_mode_fails_when_store_offline() {
        let f = fixture(&corpus()).await;
        f.store.set_offline(true);
        let err = f
            .searcher
            .search(&SearchQuery::new("logout").with_mode(SearchMode::Vector))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn category_filter_applies_to_both_rankings() {
        let f = fixture(&corpus()).await;
        let filter = SearchFilter {
            categories: vec![Category::Docs],
            ..SearchFilter::default()
        };
        let hits = f
            .searcher
            .search(&SearchQuery::new("password").with_filter(filter))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].file_path, "docs/guide.md");
        assert!(hits[0].lexical_rank.is_some() && hits[0].vector_rank.is_some());
    }

    #[tokio::test]
    async fn default_filter_finds_every_category() {
        let f = fixture(&corpus()).await;
        let hits = f
            .searcher
            .search(&SearchQuery::new("password").with_mode(SearchMode::Lexical))
            .await
            .unwrap();
        let mut categories: Vec<Category> = hits.iter().map(|h| h.category).collect();
        categories.sort();
        categories.dedup();
        assert_eq!(categories, Category::ALL);
    }

    #[tokio::test]
    async fn language_and_file_filters_narrow_results() {
        let f = fixture(&corpus()).await;
        let filter = SearchFilter {
            language: Some(Lang::Rust),
            ..SearchFilter::default()
        };
        let hits = f
            .searcher
            .search(&SearchQuery::new("connect password").with_filter(filter))
            .await
            .unwrap();
        assert!(hits.iter().all(|h| h.language == Lang::Rust));
        assert_eq!(hits.len(), 1);

        let filter = SearchFilter {
            file_path: Some("src/auth.py".into()),
            ..SearchFilter::default()
        };
        let hits = f
            .searcher
            .search(&SearchQuery::new("session").with_filter(filter))
            .await
            .unwrap();
        assert!(hits.iter().all(|h| h.file_path == "src/auth.py"));
    }

    #[tokio::test]
    async fn empty_query_or_index_returns_nothing() {
        let f = fixture(&corpus()).await;
        assert!(f.searcher.search(&SearchQuery::new("   ")).await.unwrap().is_empty());
        let empty = fixture(&[]).await;
        assert!(empty.searcher.search(&SearchQuery::new("login")).await.unwrap().is_empty());
    }

    #[test]
    fn vector_filter_ors_categories() {
        let filter = SearchFilter {
            project: Some("demo".into()),
            ..SearchFilter::default()
        }
        .to_vector_filter();
        assert_eq!(filter.must.len(), 1);
        assert_eq!(filter.should.len(), Category::ALL.len());
        assert!(filter.should.iter().all(|c| c.field == CATEGORY_FIELD));
    }

    #[test]
    fn search_mode_parses_aliases() {
        assert_eq!("BM25".parse::<SearchMode>(), Ok(SearchMode::Lexical));
        assert_eq!("semantic".parse::<SearchMode>(), Ok(SearchMode::Vector));
        assert!("fuzzy".parse::<SearchMode>().is_err());
    }
}
