//! Persistent embedding cache keyed by content hash and model identity.
//!
//! Vectors are stored as little-endian `f32` blobs with a blake3 checksum. A row
//! that fails to decode is deleted, counted as a corruption, and reported as a
//! miss so the caller re-embeds the text.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use sqlx::{QueryBuilder, Sqlite, SqlitePool};

/// Sqlite binds at most 999 parameters per statement on older builds.
const IN_CHUNK: usize = 500;

pub const DEFAULT_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);
pub const DEFAULT_MAX_ENTRIES: u64 = 100_000;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache database error: {0}")]
    Sqlite(#[from] sqlx::Error),
    #[error("integer conversion: {0}")]
    IntConversion(#[from] std::num::TryFromIntError),
}

/// Identity of a cached vector. Two texts share an entry only when their content
/// hash, model name, and model version all match.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub content_hash: String,
    pub model: String,
    pub model_version: String,
}

impl CacheKey {
    #[must_use]
    pub fn new(
        content_hash: impl Into<String>,
        model: impl Into<String>,
        model_version: impl Into<String>,
    ) -> Self {
        Self {
            content_hash: content_hash.into(),
            model: model.into(),
            model_version: model_version.into(),
        }
    }

    /// Key for the exact text that will be sent to the embedding model.
    #[must_use]
    pub fn for_text(text: &str, model: &str, model_version: &str) -> Self {
        Self::new(
            blake3::hash(text.as_bytes()).to_hex().to_string(),
            model,
            model_version,
        )
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@{}", self.content_hash, self.model, self.model_version)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    pub ttl: Duration,
    pub max_entries: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_TTL,
            max_entries: DEFAULT_MAX_ENTRIES,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub corruptions: u64,
    pub total_entries: u64,
    pub total_hits_recorded: u64,
    pub hit_rate: f64,
}

/// Embedding cache backed by the shared `SQLite` pool.
#[derive(Debug)]
pub struct EmbeddingCache {
    pool: SqlitePool,
    config: CacheConfig,
    hits: AtomicU64,
    misses: AtomicU64,
    corruptions: AtomicU64,
}

#[derive(sqlx::FromRow)]
struct CacheRow {
    cache_key: String,
    dimensions: i64,
    vector: Vec<u8>,
    checksum: String,
    created_at: i64,
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}

fn encode_vector(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_vector(row: &CacheRow) -> Result<Vec<f32>, String> {
    let dims = usize::try_from(row.dimensions).map_err(|_| "negative dimensions".to_string())?;
    if row.vector.len() != dims * 4 {
        return Err(format!(
            "blob is {} bytes, expected {} for {dims} dimensions",
            row.vector.len(),
            dims * 4
        ));
    }
    if blake3::hash(&row.vector).to_hex().as_str() != row.checksum {
        return Err("checksum mismatch".into());
    }
    let vector: Vec<f32> = row
        .vector
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    if vector.iter().any(|v| !v.is_finite()) {
        return Err("non-finite component".into());
    }
    Ok(vector)
}

impl EmbeddingCache {
    #[must_use]
    pub fn new(pool: SqlitePool, config: CacheConfig) -> Self {
        Self {
            pool,
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            corruptions: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn config(&self) -> CacheConfig {
        self.config
    }

    fn ttl_secs(&self) -> i64 {
        i64::try_from(self.config.ttl.as_secs()).unwrap_or(i64::MAX)
    }

    fn is_expired(&self, created_at: i64, now: i64) -> bool {
        now.saturating_sub(created_at) > self.ttl_secs()
    }

    /// Look up a single vector.
    ///
    /// Expired and corrupt entries are deleted and reported as a miss.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn get(&self, key: &CacheKey) -> Result<Option<Vec<f32>>, CacheError> {
        let mut found = self.get_many(std::slice::from_ref(key)).await?;
        Ok(found.pop().flatten())
    }

    /// Look up many vectors at once. The result is aligned with `keys`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn get_many(&self, keys: &[CacheKey]) -> Result<Vec<Option<Vec<f32>>>, CacheError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let rendered: Vec<String> = keys.iter().map(ToString::to_string).collect();
        let now = now_secs();
        let mut found: HashMap<String, Vec<f32>> = HashMap::new();
        let mut stale: Vec<String> = Vec::new();

        for chunk in rendered.chunks(IN_CHUNK) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
                "SELECT cache_key, dimensions, vector, checksum, created_at \
                 FROM embedding_cache WHERE cache_key IN (",
            );
            let mut sep = qb.separated(", ");
            for key in chunk {
                sep.push_bind(key);
            }
            sep.push_unseparated(")");
            let rows: Vec<CacheRow> = qb.build_query_as().fetch_all(&self.pool).await?;

            for row in rows {
                if self.is_expired(row.created_at, now) {
                    tracing::debug!(key = %row.cache_key, "cache entry expired");
                    stale.push(row.cache_key);
                    continue;
                }
                match decode_vector(&row) {
                    Ok(vector) => {
                        found.insert(row.cache_key, vector);
                    }
                    Err(reason) => {
                        tracing::warn!(key = %row.cache_key, reason, "corrupt cache entry removed");
                        self.corruptions.fetch_add(1, Ordering::Relaxed);
                        stale.push(row.cache_key);
                    }
                }
            }
        }

        self.delete_keys(&stale).await?;

        let hit_keys: Vec<&String> = rendered.iter().filter(|k| found.contains_key(*k)).collect();
        for chunk in hit_keys.chunks(IN_CHUNK) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
                "UPDATE embedding_cache SET hit_count = hit_count + 1, last_accessed_at = ",
            );
            qb.push_bind(now);
            qb.push(" WHERE cache_key IN (");
            let mut sep = qb.separated(", ");
            for key in chunk {
                sep.push_bind(*key);
            }
            sep.push_unseparated(")");
            qb.build().execute(&self.pool).await?;
        }

        let hits = u64::try_from(hit_keys.len())?;
        let misses = u64::try_from(keys.len())? - hits;
        self.hits.fetch_add(hits, Ordering::Relaxed);
        self.misses.fetch_add(misses, Ordering::Relaxed);

        Ok(rendered.iter().map(|k| found.get(k).cloned()).collect())
    }

    async fn delete_keys(&self, keys: &[String]) -> Result<u64, CacheError> {
        let mut deleted = 0;
        for chunk in keys.chunks(IN_CHUNK) {
            let mut qb: QueryBuilder<Sqlite> =
                QueryBuilder::new("DELETE FROM embedding_cache WHERE cache_key IN (");
            let mut sep = qb.separated(", ");
            for key in chunk {
                sep.push_bind(key);
            }
            sep.push_unseparated(")");
            deleted += qb.build().execute(&self.pool).await?.rows_affected();
        }
        Ok(deleted)
    }

    /// Store a single vector, replacing any previous entry for the key.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub async fn put(&self, key: &CacheKey, vector: &[f32]) -> Result<(), CacheError> {
        self.put_many(&[(key.clone(), vector.to_vec())]).await
    }

    /// Store many vectors in one transaction, then evict down to capacity.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction fails.
    pub async fn put_many(&self, entries: &[(CacheKey, Vec<f32>)]) -> Result<(), CacheError> {
        if entries.is_empty() {
            return Ok(());
        }
        let now = now_secs();
        let mut tx = self.pool.begin().await?;
        for (key, vector) in entries {
            let blob = encode_vector(vector);
            let checksum = blake3::hash(&blob).to_hex().to_string();
            sqlx::query(
                "INSERT INTO embedding_cache \
                 (cache_key, content_hash, model, model_version, dimensions, vector, checksum, \
                  created_at, last_accessed_at, hit_count) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0) \
                 ON CONFLICT(cache_key) DO UPDATE SET \
                   dimensions = excluded.dimensions, vector = excluded.vector, \
                   checksum = excluded.checksum, created_at = excluded.created_at, \
                   last_accessed_at = excluded.last_accessed_at",
            )
            .bind(key.to_string())
            .bind(&key.content_hash)
            .bind(&key.model)
            .bind(&key.model_version)
            .bind(i64::try_from(vector.len())?)
            .bind(blob)
            .bind(checksum)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        let evicted = self.evict_to_capacity().await?;
        if evicted > 0 {
            tracing::debug!(evicted, "embedding cache trimmed to capacity");
        }
        Ok(())
    }

    /// Delete entries created longer ago than `older_than` (the configured TTL
    /// when `None`). Returns the number of rows removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub async fn purge_expired(&self, older_than: Option<Duration>) -> Result<u64, CacheError> {
        let ttl = older_than.map_or_else(
            || self.ttl_secs(),
            |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX),
        );
        let cutoff = now_secs().saturating_sub(ttl);
        let deleted = sqlx::query("DELETE FROM embedding_cache WHERE created_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();
        tracing::info!(deleted, "purged expired embedding cache entries");
        Ok(deleted)
    }

    /// Remove least recently used entries until at most `max_entries` remain.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn evict_to_capacity(&self) -> Result<u64, CacheError> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM embedding_cache")
            .fetch_one(&self.pool)
            .await?;
        let max = i64::try_from(self.config.max_entries).unwrap_or(i64::MAX);
        let excess = total - max;
        if excess <= 0 {
            return Ok(0);
        }
        let deleted = sqlx::query(
            "DELETE FROM embedding_cache WHERE cache_key IN \
             (SELECT cache_key FROM embedding_cache \
              ORDER BY last_accessed_at ASC, hit_count ASC LIMIT ?)",
        )
        .bind(excess)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(deleted)
    }

    /// Session counters plus persisted totals.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn stats(&self) -> Result<CacheStats, CacheError> {
        let (total_entries, total_hits): (i64, i64) =
            sqlx::query_as("SELECT COUNT(*), COALESCE(SUM(hit_count), 0) FROM embedding_cache")
                .fetch_one(&self.pool)
                .await?;
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        #[allow(clippy::cast_precision_loss)]
        let hit_rate = if lookups == 0 {
            0.0
        } else {
            hits as f64 / lookups as f64
        };
        Ok(CacheStats {
            hits,
            misses,
            corruptions: self.corruptions.load(Ordering::Relaxed),
            total_entries: u64::try_from(total_entries)?,
            total_hits_recorded: u64::try_from(total_hits)?,
            hit_rate,
        })
    }

    /// Remove every entry. Returns the number of rows removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub async fn clear(&self) -> Result<u64, CacheError> {
        let deleted = sqlx::query("DELETE FROM embedding_cache")
            .execute(&self.pool)
            .await?
            .rows_affected();
        tracing::info!(deleted, "embedding cache cleared");
        Ok(deleted)
    }
}
