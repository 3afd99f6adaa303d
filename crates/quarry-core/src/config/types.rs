use std::time::Duration;

use quarry_index::indexer::{DEFAULT_EXCLUDES, IndexerConfig};
use quarry_index::{ParserPreference, SearchConfig};
use quarry_memory::cache::CacheConfig;
use quarry_memory::{GatewayConfig, PoolConfig};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub vector_store: VectorStoreConfig,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub index: IndexSettings,
    #[serde(default)]
    pub search: SearchSettings,
}

/// Embedding backend selector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    Ollama,
    OpenAi,
    /// Deterministic offline backend, only available with the `mock` feature.
    Mock,
}

impl ProviderKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ollama => "ollama",
            Self::OpenAi => "openai",
            Self::Mock => "mock",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub provider: ProviderKind,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    /// Bumped by hand when the served weights change under the same model name.
    #[serde(default = "default_model_version")]
    pub model_version: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_llm_max_retries")]
    pub max_retries: u32,
    /// Only read from `QUARRY_OPENAI_API_KEY`, never written back out.
    #[serde(skip)]
    pub api_key: Option<String>,
}

fn default_base_url() -> String {
    "http://localhost:11434".into()
}

fn default_embedding_model() -> String {
    "nomic-embed-text".into()
}

fn default_model_version() -> String {
    "1".into()
}

fn default_batch_size() -> usize {
    32
}

fn default_llm_max_retries() -> u32 {
    3
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::default(),
            base_url: default_base_url(),
            embedding_model: default_embedding_model(),
            model_version: default_model_version(),
            batch_size: default_batch_size(),
            max_retries: default_llm_max_retries(),
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,
}

fn default_sqlite_path() -> String {
    "./.quarry/quarry.db".into()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sqlite_path: default_sqlite_path(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VectorBackend {
    #[default]
    Qdrant,
    /// Process-local store. Vectors do not survive a restart.
    Memory,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct VectorStoreConfig {
    #[serde(default)]
    pub backend: VectorBackend,
    #[serde(default = "default_qdrant_url")]
    pub url: String,
    #[serde(default = "default_collection")]
    pub collection: String,
    #[serde(default = "default_upsert_chunk_size")]
    pub upsert_chunk_size: usize,
    #[serde(default = "default_delete_chunk_size")]
    pub delete_chunk_size: usize,
    #[serde(default = "default_store_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub pool: PoolSettings,
}

fn default_qdrant_url() -> String {
    "http://localhost:6334".into()
}

fn default_collection() -> String {
    "quarry_code_units".into()
}

fn default_upsert_chunk_size() -> usize {
    64
}

fn default_delete_chunk_size() -> usize {
    256
}

fn default_store_max_retries() -> u32 {
    2
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            backend: VectorBackend::default(),
            url: default_qdrant_url(),
            collection: default_collection(),
            upsert_chunk_size: default_upsert_chunk_size(),
            delete_chunk_size: default_delete_chunk_size(),
            max_retries: default_store_max_retries(),
            pool: PoolSettings::default(),
        }
    }
}

impl VectorStoreConfig {
    #[must_use]
    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            collection: self.collection.clone(),
            upsert_chunk_size: self.upsert_chunk_size,
            delete_chunk_size: self.delete_chunk_size,
            max_retries: self.max_retries,
            pool: self.pool.pool_config(),
            ..GatewayConfig::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct PoolSettings {
    #[serde(default = "default_pool_min")]
    pub min_size: usize,
    #[serde(default = "default_pool_max")]
    pub max_size: usize,
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,
    #[serde(default = "default_health_check_after_secs")]
    pub health_check_after_secs: u64,
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u32,
}

fn default_pool_min() -> usize {
    1
}

fn default_pool_max() -> usize {
    5
}

fn default_acquire_timeout_secs() -> u64 {
    10
}

fn default_max_age_secs() -> u64 {
    3600
}

fn default_health_check_after_secs() -> u64 {
    30
}

fn default_max_consecutive_errors() -> u32 {
    3
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_size: default_pool_min(),
            max_size: default_pool_max(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
            max_age_secs: default_max_age_secs(),
            health_check_after_secs: default_health_check_after_secs(),
            max_consecutive_errors: default_max_consecutive_errors(),
        }
    }
}

impl PoolSettings {
    #[must_use]
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            min_size: self.min_size,
            max_size: self.max_size,
            acquire_timeout: Duration::from_secs(self.acquire_timeout_secs),
            max_age: Duration::from_secs(self.max_age_secs),
            health_check_after: Duration::from_secs(self.health_check_after_secs),
            max_consecutive_errors: self.max_consecutive_errors,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct CacheSettings {
    #[serde(default = "default_ttl_days")]
    pub ttl_days: u64,
    #[serde(default = "default_max_entries")]
    pub max_entries: u64,
}

fn default_ttl_days() -> u64 {
    30
}

fn default_max_entries() -> u64 {
    100_000
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl_days: default_ttl_days(),
            max_entries: default_max_entries(),
        }
    }
}

impl CacheSettings {
    #[must_use]
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            ttl: Duration::from_secs(self.ttl_days.saturating_mul(86_400)),
            max_entries: self.max_entries,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct IndexSettings {
    #[serde(default = "default_project")]
    pub project: String,
    #[serde(default = "default_max_concurrent_files")]
    pub max_concurrent_files: usize,
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default = "default_exclude")]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub parser: ParserPreference,
    #[serde(default = "default_watch_debounce_ms")]
    pub watch_debounce_ms: u64,
}

fn default_project() -> String {
    "default".into()
}

fn default_max_concurrent_files() -> usize {
    4
}

fn default_max_file_size() -> u64 {
    quarry_index::change::DEFAULT_MAX_FILE_SIZE
}

fn default_exclude() -> Vec<String> {
    DEFAULT_EXCLUDES.iter().map(|s| (*s).to_owned()).collect()
}

fn default_watch_debounce_ms() -> u64 {
    500
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            project: default_project(),
            max_concurrent_files: default_max_concurrent_files(),
            max_file_size: default_max_file_size(),
            include: Vec::new(),
            exclude: default_exclude(),
            parser: ParserPreference::default(),
            watch_debounce_ms: default_watch_debounce_ms(),
        }
    }
}

impl IndexSettings {
    #[must_use]
    pub fn indexer_config(&self) -> IndexerConfig {
        IndexerConfig {
            project: self.project.clone(),
            max_concurrent_files: self.max_concurrent_files,
            max_file_size: self.max_file_size,
            include: self.include.clone(),
            exclude: self.exclude.clone(),
        }
    }

    #[must_use]
    pub fn watch_debounce(&self) -> Duration {
        Duration::from_millis(self.watch_debounce_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct SearchSettings {
    #[serde(default = "default_rrf_k")]
    pub rrf_k: f64,
    #[serde(default = "default_limit")]
    pub default_limit: usize,
    #[serde(default = "default_candidate_multiplier")]
    pub candidate_multiplier: usize,
}

fn default_rrf_k() -> f64 {
    quarry_index::DEFAULT_RRF_K
}

fn default_limit() -> usize {
    10
}

fn default_candidate_multiplier() -> usize {
    3
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            rrf_k: default_rrf_k(),
            default_limit: default_limit(),
            candidate_multiplier: default_candidate_multiplier(),
        }
    }
}

impl SearchSettings {
    #[must_use]
    pub fn search_config(&self) -> SearchConfig {
        SearchConfig {
            rrf_k: self.rrf_k,
            default_limit: self.default_limit,
            candidate_multiplier: self.candidate_multiplier,
        }
    }
}
