//! Durable local state and vector-store access for quarry.
//!
//! - [`sqlite::SqliteStore`] opens the shared WAL-mode database and runs migrations.
//! - [`cache::EmbeddingCache`] memoizes vectors by content + model identity.
//! - [`pool::Pool`] and [`gateway::VectorGateway`] give bounded, health-checked
//!   access to a [`VectorStore`] backend (Qdrant or in-memory).

pub mod cache;
pub mod error;
pub mod gateway;
pub mod in_memory_store;
pub mod pool;
pub mod qdrant_ops;
pub mod sqlite;
pub mod vector_store;

pub use cache::{CacheKey, CacheStats, EmbeddingCache};
pub use error::MemoryError;
pub use gateway::{
    GatewayConfig, GatewayError, MAX_UPSERT_RETRIES, StoreConnector, UpsertReport, VectorGateway,
};
pub use in_memory_store::InMemoryVectorStore;
pub use pool::{Connector, Pool, PoolConfig, PoolError, PoolStats, PooledConnection};
pub use qdrant_ops::QdrantOps;
pub use sqlite::SqliteStore;
pub use vector_store::{
    FieldCondition, FieldValue, ScoredVectorPoint, VectorFilter, VectorPoint, VectorStore,
    VectorStoreError,
};
