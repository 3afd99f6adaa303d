//! Pooled access to the vector store with chunked, retried writes.

use std::sync::Arc;
use std::time::Duration;

use crate::pool::{Connector, Pool, PoolConfig, PoolError, PoolStats, PooledConnection};
use crate::qdrant_ops::QdrantOps;
use crate::vector_store::{ScoredVectorPoint, VectorFilter, VectorPoint, VectorStore, VectorStoreError};

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Store(#[from] VectorStoreError),
    #[error("{} point(s) failed to upsert: {reason}", failed_ids.len())]
    PartialUpsert {
        failed_ids: Vec<String>,
        reason: String,
        retryable: bool,
    },
}

impl GatewayError {
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Pool(e) => e.is_retryable(),
            Self::Store(e) => e.is_retryable(),
            Self::PartialUpsert { retryable, .. } => *retryable,
        }
    }

    /// Whether the backend could not be reached at all, as opposed to refusing
    /// a particular request.
    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        match self {
            Self::Pool(PoolError::InvalidConfig(_)) => false,
            Self::Pool(_) => true,
            Self::Store(e) => e.is_retryable(),
            Self::PartialUpsert { retryable, .. } => *retryable,
        }
    }
}

/// How the gateway obtains store handles.
#[derive(Clone)]
pub enum StoreConnector {
    /// A fresh gRPC client per pooled connection.
    Qdrant { url: String },
    /// Every pooled connection shares one store (in-memory backend, tests).
    Shared(Arc<dyn VectorStore>),
}

impl std::fmt::Debug for StoreConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Qdrant { url } => f.debug_struct("Qdrant").field("url", url).finish(),
            Self::Shared(_) => f.write_str("Shared"),
        }
    }
}

impl Connector for StoreConnector {
    type Connection = Arc<dyn VectorStore>;
    type Error = VectorStoreError;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        match self {
            Self::Qdrant { url } => {
                let ops = QdrantOps::new(url)
                    .map_err(|e| VectorStoreError::Unavailable(e.to_string()))?;
                Ok(Arc::new(ops))
            }
            Self::Shared(store) => Ok(Arc::clone(store)),
        }
    }

    async fn is_healthy(&self, conn: &Self::Connection) -> bool {
        conn.health_check().await.is_ok()
    }
}

/// Upper bound on `GatewayConfig::max_retries` accepted by configuration.
pub const MAX_UPSERT_RETRIES: u32 = 10;
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Backoff before retry number `attempt` (0-based), capped at [`MAX_RETRY_DELAY`].
fn retry_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt))
        .min(MAX_RETRY_DELAY)
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub collection: String,
    pub upsert_chunk_size: usize,
    pub delete_chunk_size: usize,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub pool: PoolConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            collection: "quarry_code_units".into(),
            upsert_chunk_size: 64,
            delete_chunk_size: 256,
            max_retries: 2,
            retry_base_delay: Duration::from_millis(200),
            pool: PoolConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertReport {
    pub upserted: usize,
    pub chunks: usize,
    pub retries: u32,
}

#[derive(Debug, Clone)]
pub struct VectorGateway {
    pool: Pool<StoreConnector>,
    config: GatewayConfig,
}

impl VectorGateway {
    /// # Errors
    ///
    /// Returns [`GatewayError::Pool`] if the pool configuration is invalid.
    pub fn new(connector: StoreConnector, config: GatewayConfig) -> Result<Self, GatewayError> {
        if config.upsert_chunk_size == 0 || config.delete_chunk_size == 0 {
            return Err(PoolError::InvalidConfig("chunk sizes must be at least 1".into()).into());
        }
        let pool = Pool::new(connector, config.pool)?;
        Ok(Self { pool, config })
    }

    #[must_use]
    pub fn collection(&self) -> &str {
        &self.config.collection
    }

    /// # Errors
    ///
    /// Returns an error if no connection can be obtained within the acquire timeout.
    pub async fn acquire(&self) -> Result<PooledConnection<StoreConnector>, GatewayError> {
        Ok(self.pool.acquire().await?)
    }

    pub fn release(&self, conn: PooledConnection<StoreConnector>) {
        conn.release();
    }

    /// Verify the backend answers a health probe.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreachable.
    pub async fn ping(&self) -> Result<(), GatewayError> {
        let mut conn = self.acquire().await?;
        match conn.health_check().await {
            Ok(()) => {
                conn.record_success();
                Ok(())
            }
            Err(e) => {
                conn.record_error();
                Err(e.into())
            }
        }
    }

    /// # Errors
    ///
    /// Returns an error if the collection cannot be created or has a different dimension.
    pub async fn ensure_collection(&self, dimensions: u64) -> Result<(), GatewayError> {
        let mut conn = self.acquire().await?;
        let result = conn
            .ensure_collection(&self.config.collection, dimensions)
            .await;
        track(&mut conn, &result);
        Ok(result?)
    }

    /// Nearest-neighbour search in the configured collection.
    ///
    /// # Errors
    ///
    /// Returns an error if the search fails.
    pub async fn query(
        &self,
        vector: Vec<f32>,
        limit: u64,
        filter: Option<VectorFilter>,
    ) -> Result<Vec<ScoredVectorPoint>, GatewayError> {
        let mut conn = self.acquire().await?;
        let result = conn
            .search(&self.config.collection, vector, limit, filter)
            .await;
        track(&mut conn, &result);
        Ok(result?)
    }

    /// Upsert `points` in chunks of `upsert_chunk_size`, retrying retryable chunk
    /// failures with exponential backoff. Chunks that still fail are reported in
    /// [`GatewayError::PartialUpsert`]; the remaining chunks are still written.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::PartialUpsert`] listing every point id that was not
    /// confirmed written, or a pool error if no connection is available.
    pub async fn upsert(&self, points: Vec<VectorPoint>) -> Result<UpsertReport, GatewayError> {
        let mut report = UpsertReport::default();
        if points.is_empty() {
            return Ok(report);
        }
        let mut failed_ids: Vec<String> = Vec::new();
        let mut last_error: Option<VectorStoreError> = None;

        for chunk in points.chunks(self.config.upsert_chunk_size) {
            report.chunks += 1;
            let mut attempt = 0u32;
            loop {
                let mut conn = self.acquire().await?;
                let result = conn
                    .upsert(&self.config.collection, chunk.to_vec())
                    .await;
                track(&mut conn, &result);
                drop(conn);
                match result {
                    Ok(()) => {
                        report.upserted += chunk.len();
                        break;
                    }
                    Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                        let delay = retry_delay(self.config.retry_base_delay, attempt);
                        tracing::warn!(
                            attempt = attempt + 1,
                            max_retries = self.config.max_retries,
                            points = chunk.len(),
                            "upsert chunk failed, retrying in {}ms: {e}",
                            delay.as_millis()
                        );
                        attempt += 1;
                        report.retries += 1;
                        tokio::time::sleep(delay).await;
                    }
                    Err(e) => {
                        tracing::warn!(points = chunk.len(), "upsert chunk failed: {e}");
                        failed_ids.extend(chunk.iter().map(|p| p.id.clone()));
                        last_error = Some(e);
                        break;
                    }
                }
            }
        }

        match last_error {
            None => Ok(report),
            Some(e) => Err(GatewayError::PartialUpsert {
                failed_ids,
                retryable: e.is_retryable(),
                reason: e.to_string(),
            }),
        }
    }

    /// Delete points by id in chunks of `delete_chunk_size`.
    ///
    /// # Errors
    ///
    /// Returns the first delete failure.
    pub async fn delete(&self, ids: Vec<String>) -> Result<usize, GatewayError> {
        let mut deleted = 0;
        for chunk in ids.chunks(self.config.delete_chunk_size) {
            let mut conn = self.acquire().await?;
            let result = conn
                .delete_by_ids(&self.config.collection, chunk.to_vec())
                .await;
            track(&mut conn, &result);
            result?;
            deleted += chunk.len();
        }
        Ok(deleted)
    }

    /// Number of points in the collection (0 when it does not exist yet).
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be queried.
    pub async fn count(&self) -> Result<u64, GatewayError> {
        let mut conn = self.acquire().await?;
        let exists = conn.collection_exists(&self.config.collection).await;
        track(&mut conn, &exists);
        if !exists? {
            return Ok(0);
        }
        let result = conn.count(&self.config.collection).await;
        track(&mut conn, &result);
        Ok(result?)
    }

    /// # Errors
    ///
    /// Returns an error if a connection cannot be opened.
    pub async fn warm_up(&self) -> Result<usize, GatewayError> {
        Ok(self.pool.warm_up().await?)
    }

    #[must_use]
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn close(&self) {
        self.pool.close();
    }
}

fn track<T>(conn: &mut PooledConnection<StoreConnector>, result: &Result<T, VectorStoreError>) {
    match result {
        Ok(_) => conn.record_success(),
        Err(e) if e.is_retryable() => conn.record_error(),
        Err(_) => {}
    }
}
