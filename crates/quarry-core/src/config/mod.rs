mod env;
mod types;


pub use types::*;

use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use quarry_memory::MAX_UPSERT_RETRIES;

/// Default location of the config file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

impl Config {
    /// Load configuration from a TOML file with env var overrides.
    ///
    /// Falls back to defaults when the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            toml::from_str::<Self>(&content)
                .with_context(|| format!("failed to parse config file {}", path.display()))?
        } else {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Reject settings that cannot work at runtime.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first offending key.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.llm.embedding_model.trim().is_empty() {
            bail!("llm.embedding_model must not be empty");
        }
        if self.llm.batch_size == 0 {
            bail!("llm.batch_size must be at least 1");
        }
        if self.storage.sqlite_path.trim().is_empty() {
            bail!("storage.sqlite_path must not be empty");
        }
        if self.vector_store.collection.trim().is_empty() {
            bail!("vector_store.collection must not be empty");
        }
        if self.vector_store.upsert_chunk_size == 0 || self.vector_store.delete_chunk_size == 0 {
            bail!("vector_store chunk sizes must be at least 1");
        }
        if self.vector_store.max_retries > MAX_UPSERT_RETRIES {
            bail!(
                "vector_store.max_retries must be at most {MAX_UPSERT_RETRIES}, got {}",
                self.vector_store.max_retries
            );
        }
        self.vector_store
            .pool
            .pool_config()
            .validate()
            .context("invalid vector_store.pool settings")?;
        if self.cache.ttl_days == 0 {
            bail!("cache.ttl_days must be at least 1");
        }
        if self.cache.max_entries == 0 {
            bail!("cache.max_entries must be at least 1");
        }
        if self.index.max_concurrent_files == 0 {
            bail!("index.max_concurrent_files must be at least 1");
        }
        if self.index.max_file_size == 0 {
            bail!("index.max_file_size must be positive");
        }
        if self.index.watch_debounce_ms == 0 {
            bail!("index.watch_debounce_ms must be positive");
        }
        if !self.search.rrf_k.is_finite() || self.search.rrf_k <= 0.0 {
            bail!("search.rrf_k must be a positive number, got {}", self.search.rrf_k);
        }
        if self.search.default_limit == 0 || self.search.candidate_multiplier == 0 {
            bail!("search.default_limit and search.candidate_multiplier must be at least 1");
        }
        Ok(())
    }
}

/// Priority: `--config` argument > `QUARRY_CONFIG` env > [`DEFAULT_CONFIG_PATH`].
#[must_use]
pub fn resolve_config_path(cli: Option<&Path>) -> PathBuf {
    if let Some(path) = cli {
        return path.to_path_buf();
    }
    if let Ok(path) = std::env::var("QUARRY_CONFIG")
        && !path.is_empty()
    {
        return PathBuf::from(path);
    }
    PathBuf::from(DEFAULT_CONFIG_PATH)
}
