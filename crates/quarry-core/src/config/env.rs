use super::Config;

/// Parse `key` as `T`, warning (not failing) on values that do not parse.
fn parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("ignoring invalid {key} value: {raw}");
            None
        }
    }
}

/// Deserialize a lowercase enum name the same way the TOML file would.
fn parsed_enum<T: serde::de::DeserializeOwned>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match serde_json::from_value(serde_json::Value::String(raw.trim().to_ascii_lowercase())) {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("ignoring invalid {key} value: {raw}");
            None
        }
    }
}

fn csv(key: &str) -> Option<Vec<String>> {
    let raw = std::env::var(key).ok()?;
    Some(
        raw.split(',')
            .map(|s| s.trim().to_owned())
            .filter(|s| !s.is_empty())
            .collect(),
    )
}

impl Config {
    pub(crate) fn apply_env_overrides(&mut self) {
        self.apply_env_overrides_llm();
        self.apply_env_overrides_storage();
        self.apply_env_overrides_index();
    }

    fn apply_env_overrides_llm(&mut self) {
        if let Some(kind) = parsed_enum("QUARRY_LLM_PROVIDER") {
            self.llm.provider = kind;
        }
        if let Ok(v) = std::env::var("QUARRY_LLM_BASE_URL") {
            self.llm.base_url = v;
        }
        if let Ok(v) = std::env::var("QUARRY_LLM_EMBEDDING_MODEL") {
            self.llm.embedding_model = v;
        }
        if let Ok(v) = std::env::var("QUARRY_LLM_MODEL_VERSION") {
            self.llm.model_version = v;
        }
        if let Some(n) = parsed("QUARRY_LLM_BATCH_SIZE") {
            self.llm.batch_size = n;
        }
        if let Some(n) = parsed("QUARRY_LLM_MAX_RETRIES") {
            self.llm.max_retries = n;
        }
        if let Ok(v) = std::env::var("QUARRY_OPENAI_API_KEY")
            && !v.is_empty()
        {
            self.llm.api_key = Some(v);
        }
    }

    fn apply_env_overrides_storage(&mut self) {
        if let Ok(v) = std::env::var("QUARRY_SQLITE_PATH") {
            self.storage.sqlite_path = v;
        }
        if let Some(backend) = parsed_enum("QUARRY_VECTOR_BACKEND") {
            self.vector_store.backend = backend;
        }
        if let Ok(v) = std::env::var("QUARRY_QDRANT_URL") {
            self.vector_store.url = v;
        }
        if let Ok(v) = std::env::var("QUARRY_COLLECTION") {
            self.vector_store.collection = v;
        }
        if let Some(n) = parsed("QUARRY_POOL_MIN_SIZE") {
            self.vector_store.pool.min_size = n;
        }
        if let Some(n) = parsed("QUARRY_POOL_MAX_SIZE") {
            self.vector_store.pool.max_size = n;
        }
        if let Some(secs) = parsed("QUARRY_POOL_ACQUIRE_TIMEOUT") {
            self.vector_store.pool.acquire_timeout_secs = secs;
        }
        if let Some(days) = parsed("QUARRY_CACHE_TTL_DAYS") {
            self.cache.ttl_days = days;
        }
        if let Some(n) = parsed("QUARRY_CACHE_MAX_ENTRIES") {
            self.cache.max_entries = n;
        }
    }

    fn apply_env_overrides_index(&mut self) {
        if let Ok(v) = std::env::var("QUARRY_INDEX_PROJECT") {
            self.index.project = v;
        }
        if let Some(n) = parsed("QUARRY_INDEX_CONCURRENCY") {
            self.index.max_concurrent_files = n;
        }
        if let Some(bytes) = parsed("QUARRY_INDEX_MAX_FILE_SIZE") {
            self.index.max_file_size = bytes;
        }
        if let Some(globs) = csv("QUARRY_INDEX_INCLUDE") {
            self.index.include = globs;
        }
        if let Some(globs) = csv("QUARRY_INDEX_EXCLUDE") {
            self.index.exclude = globs;
        }
        if let Some(pref) = parsed_enum("QUARRY_PARSER") {
            self.index.parser = pref;
        }
        if let Some(ms) = parsed("QUARRY_WATCH_DEBOUNCE_MS") {
            self.index.watch_debounce_ms = ms;
        }
        if let Some(k) = parsed("QUARRY_SEARCH_RRF_K") {
            self.search.rrf_k = k;
        }
        if let Some(n) = parsed("QUARRY_SEARCH_LIMIT") {
            self.search.default_limit = n;
        }
    }
}
