use std::collections::HashMap;
use std::sync::RwLock;
#[cfg(any(test, feature = "mock"))]
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::vector_store::{
    BoxFuture, FieldCondition, FieldValue, ScoredVectorPoint, VectorFilter, VectorPoint,
    VectorStore, VectorStoreError,
};

struct StoredPoint {
    vector: Vec<f32>,
    payload: HashMap<String, serde_json::Value>,
}

struct InMemoryCollection {
    vector_size: u64,
    points: HashMap<String, StoredPoint>,
}

/// Process-local [`VectorStore`] with brute-force cosine search.
///
/// Used for the `memory` backend and throughout the test suites. With the `mock`
/// feature it can simulate outages and per-point rejections.
pub struct InMemoryVectorStore {
    collections: RwLock<HashMap<String, InMemoryCollection>>,
    #[cfg(any(test, feature = "mock"))]
    faults: Faults,
}

#[cfg(any(test, feature = "mock"))]
#[derive(Default)]
struct Faults {
    offline: AtomicBool,
    reject: RwLock<Option<FieldCondition>>,
    health_checks: AtomicUsize,
}

impl InMemoryVectorStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            #[cfg(any(test, feature = "mock"))]
            faults: Faults::default(),
        }
    }

    #[cfg(any(test, feature = "mock"))]
    fn check_online(&self) -> Result<(), VectorStoreError> {
        if self.faults.offline.load(Ordering::SeqCst) {
            return Err(VectorStoreError::Unavailable(
                "in-memory store is offline".into(),
            ));
        }
        Ok(())
    }

    #[cfg(not(any(test, feature = "mock")))]
    #[allow(clippy::unnecessary_wraps, clippy::unused_self)]
    fn check_online(&self) -> Result<(), VectorStoreError> {
        Ok(())
    }
}

#[cfg(any(test, feature = "mock"))]
impl InMemoryVectorStore {
    /// Make every operation fail with [`VectorStoreError::Unavailable`].
    pub fn set_offline(&self, offline: bool) {
        self.faults.offline.store(offline, Ordering::SeqCst);
    }

    /// Reject upserts that contain a point whose payload matches `cond`.
    /// Matching points are skipped; the rest of the batch is stored.
    pub fn reject_points_matching(&self, cond: Option<FieldCondition>) {
        if let Ok(mut guard) = self.faults.reject.write() {
            *guard = cond;
        }
    }

    #[must_use]
    pub fn health_checks(&self) -> usize {
        self.faults.health_checks.load(Ordering::SeqCst)
    }

    /// Ids of every point in `collection`, sorted.
    #[must_use]
    pub fn point_ids(&self, collection: &str) -> Vec<String> {
        let Ok(cols) = self.collections.read() else {
            return Vec::new();
        };
        let mut ids: Vec<String> = cols
            .get(collection)
            .map(|c| c.points.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    fn rejection(&self) -> Option<FieldCondition> {
        self.faults.reject.read().ok().and_then(|g| g.clone())
    }
}

impl Default for InMemoryVectorStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryVectorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryVectorStore")
            .finish_non_exhaustive()
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

fn matches_filter(payload: &HashMap<String, serde_json::Value>, filter: &VectorFilter) -> bool {
    let holds = |cond: &FieldCondition| {
        payload
            .get(&cond.field)
            .is_some_and(|val| field_matches(val, &cond.value))
    };
    filter.must.iter().all(holds)
        && !filter.must_not.iter().any(holds)
        && (filter.should.is_empty() || filter.should.iter().any(holds))
}

fn field_matches(val: &serde_json::Value, expected: &FieldValue) -> bool {
    match expected {
        FieldValue::Integer(i) => val.as_i64() == Some(*i),
        FieldValue::Text(s) => val.as_str() == Some(s.as_str()),
    }
}

impl VectorStore for InMemoryVectorStore {
    fn health_check(&self) -> BoxFuture<'_, Result<(), VectorStoreError>> {
        Box::pin(async move {
            #[cfg(any(test, feature = "mock"))]
            self.faults.health_checks.fetch_add(1, Ordering::SeqCst);
            self.check_online()
        })
    }

    fn ensure_collection(
        &self,
        collection: &str,
        vector_size: u64,
    ) -> BoxFuture<'_, Result<(), VectorStoreError>> {
        let collection = collection.to_owned();
        Box::pin(async move {
            self.check_online()?;
            let mut cols = self
                .collections
                .write()
                .map_err(|e| VectorStoreError::Collection(e.to_string()))?;
            let col = cols
                .entry(collection.clone())
                .or_insert_with(|| InMemoryCollection {
                    vector_size,
                    points: HashMap::new(),
                });
            if col.vector_size != vector_size {
                return Err(VectorStoreError::Rejected(format!(
                    "collection {collection} has dimension {}, requested {vector_size}",
                    col.vector_size
                )));
            }
            Ok(())
        })
    }

    fn collection_exists(&self, collection: &str) -> BoxFuture<'_, Result<bool, VectorStoreError>> {
        let collection = collection.to_owned();
        Box::pin(async move {
            self.check_online()?;
            let cols = self
                .collections
                .read()
                .map_err(|e| VectorStoreError::Collection(e.to_string()))?;
            Ok(cols.contains_key(&collection))
        })
    }

    fn delete_collection(&self, collection: &str) -> BoxFuture<'_, Result<(), VectorStoreError>> {
        let collection = collection.to_owned();
        Box::pin(async move {
            self.check_online()?;
            let mut cols = self
                .collections
                .write()
                .map_err(|e| VectorStoreError::Collection(e.to_string()))?;
            cols.remove(&collection);
            Ok(())
        })
    }

    fn upsert(
        &self,
        collection: &str,
        points: Vec<VectorPoint>,
    ) -> BoxFuture<'_, Result<(), VectorStoreError>> {
        let collection = collection.to_owned();
        Box::pin(async move {
            self.check_online()?;
            #[cfg(any(test, feature = "mock"))]
            let rejection = self.rejection();
            let mut cols = self
                .collections
                .write()
                .map_err(|e| VectorStoreError::Upsert(e.to_string()))?;
            let col = cols.get_mut(&collection).ok_or_else(|| {
                VectorStoreError::Upsert(format!("collection {collection} not found"))
            })?;
            let mut rejected = 0usize;
            for p in points {
                if p.vector.len() as u64 != col.vector_size {
                    return Err(VectorStoreError::Rejected(format!(
                        "point {} has dimension {}, collection expects {}",
                        p.id,
                        p.vector.len(),
                        col.vector_size
                    )));
                }
                #[cfg(any(test, feature = "mock"))]
                if let Some(cond) = &rejection
                    && p.payload
                        .get(&cond.field)
                        .is_some_and(|v| field_matches(v, &cond.value))
                {
                    rejected += 1;
                    continue;
                }
                col.points.insert(
                    p.id,
                    StoredPoint {
                        vector: p.vector,
                        payload: p.payload,
                    },
                );
            }
            if rejected > 0 {
                return Err(VectorStoreError::Rejected(format!(
                    "{rejected} point(s) rejected"
                )));
            }
            Ok(())
        })
    }

    fn search(
        &self,
        collection: &str,
        vector: Vec<f32>,
        limit: u64,
        filter: Option<VectorFilter>,
    ) -> BoxFuture<'_, Result<Vec<ScoredVectorPoint>, VectorStoreError>> {
        let collection = collection.to_owned();
        Box::pin(async move {
            self.check_online()?;
            let cols = self
                .collections
                .read()
                .map_err(|e| VectorStoreError::Search(e.to_string()))?;
            let col = cols.get(&collection).ok_or_else(|| {
                VectorStoreError::Search(format!("collection {collection} not found"))
            })?;

            let empty_filter = VectorFilter::default();
            let f = filter.as_ref().unwrap_or(&empty_filter);

            let mut scored: Vec<ScoredVectorPoint> = col
                .points
                .iter()
                .filter(|(_, sp)| matches_filter(&sp.payload, f))
                .map(|(id, sp)| ScoredVectorPoint {
                    id: id.clone(),
                    score: cosine_similarity(&vector, &sp.vector),
                    payload: sp.payload.clone(),
                })
                .collect();

            scored.sort_by(|a, b| {
                b.score
                    .partial_cmp(&a.score)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.id.cmp(&b.id))
            });
            scored.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
            Ok(scored)
        })
    }

    fn delete_by_ids(
        &self,
        collection: &str,
        ids: Vec<String>,
    ) -> BoxFuture<'_, Result<(), VectorStoreError>> {
        let collection = collection.to_owned();
        Box::pin(async move {
            self.check_online()?;
            if ids.is_empty() {
                return Ok(());
            }
            let mut cols = self
                .collections
                .write()
                .map_err(|e| VectorStoreError::Delete(e.to_string()))?;
            let col = cols.get_mut(&collection).ok_or_else(|| {
                VectorStoreError::Delete(format!("collection {collection} not found"))
            })?;
            for id in &ids {
                col.points.remove(id);
            }
            Ok(())
        })
    }

    fn count(&self, collection: &str) -> BoxFuture<'_, Result<u64, VectorStoreError>> {
        let collection = collection.to_owned();
        Box::pin(async move {
            self.check_online()?;
            let cols = self
                .collections
                .read()
                .map_err(|e| VectorStoreError::Search(e.to_string()))?;
            Ok(cols
                .get(&collection)
                .map_or(0, |c| c.points.len() as u64))
        })
    }
}
