//! Cache-aware, batching embedding generator with per-key single flight.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use quarry_llm::EmbeddingProvider;
use quarry_memory::{CacheKey, EmbeddingCache};
use tokio::sync::watch;

use crate::context::contextualize_for_embedding;
use crate::error::{IndexError, Result};
use crate::unit::SemanticUnit;

pub const DEFAULT_BATCH_SIZE: usize = 32;
const PROBE_TEXT: &str = "quarry embedding dimension probe";

type Flight = Option<std::result::Result<Vec<f32>, String>>;

/// Keys this call is computing. Dropping the claim (normally or because the
/// future was cancelled) unregisters them, which wakes followers.
struct Claim<'a> {
    in_flight: &'a Mutex<HashMap<String, watch::Receiver<Flight>>>,
    senders: HashMap<String, watch::Sender<Flight>>,
}

impl Claim<'_> {
    fn publish(&self, key: &str, value: std::result::Result<Vec<f32>, String>) {
        if let Some(tx) = self.senders.get(key) {
            tx.send_replace(Some(value));
        }
    }
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        let mut map = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        for key in self.senders.keys() {
            map.remove(key);
        }
    }
}

struct Pending {
    key: CacheKey,
    text: String,
    positions: Vec<usize>,
}

pub struct EmbeddingGenerator<P> {
    provider: P,
    cache: Arc<EmbeddingCache>,
    batch_size: usize,
    dimensions: AtomicUsize,
    inference_calls: AtomicU64,
    in_flight: Mutex<HashMap<String, watch::Receiver<Flight>>>,
}

impl<P> std::fmt::Debug for EmbeddingGenerator<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingGenerator")
            .field("batch_size", &self.batch_size)
            .field("dimensions", &self.dimensions.load(Ordering::Relaxed))
            .field("inference_calls", &self.inference_calls.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<P: EmbeddingProvider> EmbeddingGenerator<P> {
    #[must_use]
    pub fn new(provider: P, cache: Arc<EmbeddingCache>, batch_size: usize) -> Self {
        Self {
            provider,
            cache,
            batch_size: batch_size.max(1),
            dimensions: AtomicUsize::new(0),
            inference_calls: AtomicU64::new(0),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn provider(&self) -> &P {
        &self.provider
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<EmbeddingCache> {
        &self.cache
    }

    /// Vector width, once known from a probe or a successful inference call.
    #[must_use]
    pub fn dimensions(&self) -> Option<usize> {
        match self.dimensions.load(Ordering::Acquire) {
            0 => None,
            n => Some(n),
        }
    }

    /// Number of calls that reached the inference backend.
    #[must_use]
    pub fn inference_calls(&self) -> u64 {
        self.inference_calls.load(Ordering::Relaxed)
    }

    /// Ask the backend for one vector, bypassing the cache, and remember its width.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::EmbeddingBackendUnavailable`] if the backend cannot
    /// embed the probe text.
    pub async fn probe_dimensions(&self) -> Result<usize> {
        self.inference_calls.fetch_add(1, Ordering::Relaxed);
        let vectors = self.provider.embed_batch(&[PROBE_TEXT.to_owned()]).await?;
        let dims = vectors.first().map_or(0, Vec::len);
        if dims == 0 {
            return Err(IndexError::EmbeddingBackendUnavailable(format!(
                "{} returned an empty probe vector",
                self.provider.name()
            )));
        }
        self.dimensions.store(dims, Ordering::Release);
        tracing::debug!(provider = self.provider.name(), dims, "embedding dimensions probed");
        Ok(dims)
    }

    /// One vector per unit, in input order.
    ///
    /// # Errors
    ///
    /// Fails as a whole if any inference call fails or returns malformed output.
    pub async fn embed_batch(&self, units: &[SemanticUnit]) -> Result<Vec<Vec<f32>>> {
        let texts: Vec<String> = units.iter().map(contextualize_for_embedding).collect();
        self.embed_texts(&texts).await
    }

    /// # Errors
    ///
    /// Fails if the inference backend is unavailable.
    pub async fn embed_query(&self, query: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_texts(&[query.to_owned()]).await?;
        vectors
            .pop()
            .ok_or_else(|| IndexError::EmbeddingBackendUnavailable("no vector for query".into()))
    }

    /// One vector per text, in input order. Cache hits are served without
    /// inference; misses are de-duplicated, batched, and written back.
    ///
    /// # Errors
    ///
    /// Fails as a whole if any inference call fails or returns malformed output.
    /// Cache failures only degrade to misses.
    pub async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let model = self.provider.model_identity();
        let version = self.provider.model_version();
        let keys: Vec<CacheKey> = texts
            .iter()
            .map(|t| CacheKey::for_text(t, model, version))
            .collect();

        let mut out: Vec<Option<Vec<f32>>> = match self.cache.get_many(&keys).await {
            Ok(found) => self.screen_cached(&keys, found),
            Err(e) => {
                tracing::warn!("embedding cache read failed, treating batch as misses: {e}");
                vec![None; texts.len()]
            }
        };

        let mut pending: Vec<Pending> = Vec::new();
        let mut by_key: HashMap<String, usize> = HashMap::new();
        for (i, slot) in out.iter().enumerate() {
            if slot.is_some() {
                continue;
            }
            let key_str = keys[i].to_string();
            if let Some(&p) = by_key.get(&key_str) {
                pending[p].positions.push(i);
            } else {
                by_key.insert(key_str, pending.len());
                pending.push(Pending {
                    key: keys[i].clone(),
                    text: texts[i].clone(),
                    positions: vec![i],
                });
            }
        }
        tracing::debug!(
            total = texts.len(),
            misses = pending.len(),
            "embedding batch cache lookup"
        );

        while !pending.is_empty() {
            pending = self.resolve(pending, &mut out).await?;
        }

        out.into_iter()
            .map(|v| {
                v.ok_or_else(|| IndexError::EmbeddingBackendUnavailable("missing vector".into()))
            })
            .collect()
    }

    /// Lead the keys nobody is computing and follow the rest. Returns the keys
    /// whose leader went away without a result; the caller retries them.
    async fn resolve(
        &self,
        pending: Vec<Pending>,
        out: &mut [Option<Vec<f32>>],
    ) -> Result<Vec<Pending>> {
        let mut leading = Vec::new();
        let mut following = Vec::new();
        let mut claim = Claim {
            in_flight: &self.in_flight,
            senders: HashMap::new(),
        };
        {
            let mut map = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            for item in pending {
                let key = item.key.to_string();
                if let Some(rx) = map.get(&key) {
                    following.push((item, rx.clone()));
                } else {
                    let (tx, rx) = watch::channel(None);
                    map.insert(key.clone(), rx);
                    claim.senders.insert(key, tx);
                    leading.push(item);
                }
            }
        }
        let leading = self.take_cached(leading, &claim, out).await;

        for (n, chunk) in leading.chunks(self.batch_size).enumerate() {
            match self.infer(chunk).await {
                Ok(vectors) => {
                    let entries: Vec<(CacheKey, Vec<f32>)> = chunk
                        .iter()
                        .zip(&vectors)
                        .map(|(p, v)| (p.key.clone(), v.clone()))
                        .collect();
                    if let Err(e) = self.cache.put_many(&entries).await {
                        tracing::warn!("embedding cache write failed: {e}");
                    }
                    for (item, vector) in chunk.iter().zip(vectors) {
                        claim.publish(&item.key.to_string(), Ok(vector.clone()));
                        for &pos in &item.positions {
                            out[pos] = Some(vector.clone());
                        }
                    }
                }
                Err(e) => {
                    let reason = e.to_string();
                    for item in &leading[n * self.batch_size..] {
                        claim.publish(&item.key.to_string(), Err(reason.clone()));
                    }
                    return Err(e);
                }
            }
        }
        drop(claim);

        let mut retry = Vec::new();
        for (item, mut rx) in following {
            let flight = match rx.wait_for(Option::is_some).await {
                Ok(value) => value.clone(),
                Err(_) => None,
            };
            match flight {
                Some(Ok(vector)) => {
                    for &pos in &item.positions {
                        out[pos] = Some(vector.clone());
                    }
                }
                Some(Err(reason)) => return Err(IndexError::EmbeddingBackendUnavailable(reason)),
                None => retry.push(item),
            }
        }
        Ok(retry)
    }

    /// A previous leader may have finished between the caller's cache read and
    /// this claim. Serve those keys from the cache and return the rest.
    async fn take_cached(
        &self,
        leading: Vec<Pending>,
        claim: &Claim<'_>,
        out: &mut [Option<Vec<f32>>],
    ) -> Vec<Pending> {
        if leading.is_empty() {
            return leading;
        }
        let keys: Vec<CacheKey> = leading.iter().map(|p| p.key.clone()).collect();
        let found = match self.cache.get_many(&keys).await {
            Ok(found) => self.screen_cached(&keys, found),
            Err(e) => {
                tracing::warn!("embedding cache re-check failed, inferring claimed keys: {e}");
                return leading;
            }
        };
        let mut missing = Vec::with_capacity(leading.len());
        for (item, hit) in leading.into_iter().zip(found) {
            match hit {
                Some(vector) => {
                    claim.publish(&item.key.to_string(), Ok(vector.clone()));
                    for &pos in &item.positions {
                        out[pos] = Some(vector.clone());
                    }
                }
                None => missing.push(item),
            }
        }
        missing
    }

    /// Drop cache hits that cannot be the model's output; those keys are
    /// regenerated and overwritten like any other miss.
    fn screen_cached(
        &self,
        keys: &[CacheKey],
        found: Vec<Option<Vec<f32>>>,
    ) -> Vec<Option<Vec<f32>>> {
        found
            .into_iter()
            .zip(keys)
            .map(|(hit, key)| {
                hit.and_then(|vector| match self.check_cached(key, vector) {
                    Ok(vector) => Some(vector),
                    Err(e) => {
                        tracing::warn!("{e}, regenerating");
                        None
                    }
                })
            })
            .collect()
    }

    fn check_cached(&self, key: &CacheKey, vector: Vec<f32>) -> Result<Vec<f32>> {
        if vector.is_empty() || vector.iter().any(|x| !x.is_finite()) {
            return Err(IndexError::CacheCorruption(format!(
                "{key} holds an empty or non-finite vector"
            )));
        }
        if let Some(expected) = self.dimensions()
            && expected != vector.len()
        {
            return Err(IndexError::CacheCorruption(format!(
                "{key} has {} dimensions, model produces {expected}",
                vector.len()
            )));
        }
        Ok(vector)
    }

    async fn infer(&self, chunk: &[Pending]) -> Result<Vec<Vec<f32>>> {
        let texts: Vec<String> = chunk.iter().map(|p| p.text.clone()).collect();
        self.inference_calls.fetch_add(1, Ordering::Relaxed);
        let vectors = self.provider.embed_batch(&texts).await?;
        if vectors.len() != texts.len() {
            return Err(IndexError::EmbeddingBackendUnavailable(format!(
                "{} returned {} vectors for {} texts",
                self.provider.name(),
                vectors.len(),
                texts.len()
            )));
        }
        let expected = match self.dimensions() {
            Some(d) => d,
            None => vectors.first().map_or(0, Vec::len),
        };
        if expected == 0 || vectors.iter().any(|v| v.len() != expected) {
            return Err(IndexError::EmbeddingBackendUnavailable(format!(
                "{} returned vectors with inconsistent dimensions (expected {expected})",
                self.provider.name()
            )));
        }
        self.dimensions.store(expected, Ordering::Release);
        Ok(vectors)
    }
}

#[cfg(test)]
mod tests {
    use quarry_llm::mock::MockProvider;
    use quarry_memory::SqliteStore;
    use quarry_memory::cache::CacheConfig;

    use super::*;
    use crate::languages::Lang;
    use crate::unit::UnitType;

    async fn cache() -> (Arc<EmbeddingCache>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        let store = SqliteStore::new(path.to_str().unwrap()).await.unwrap();
        (
            Arc::new(EmbeddingCache::new(store.pool().clone(), CacheConfig::default())),
            dir,
        )
    }

    fn texts(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_owned()).collect()
    }

    #[tokio::test]
    async fn output_follows_input_order_across_hits_and_misses() {
        let (cache, _dir) = cache().await;
        let provider = MockProvider::default();
        let generator = EmbeddingGenerator::new(provider.clone(), cache, 2);

        generator.embed_texts(&texts(&["b"])).await.unwrap();
        let out = generator.embed_texts(&texts(&["a", "b", "c", "a"])).await.unwrap();

        assert_eq!(out[0], provider.vector_for("a"));
        assert_eq!(out[1], provider.vector_for("b"));
        assert_eq!(out[2], provider.vector_for("c"));
        assert_eq!(out[3], out[0]);
        // "b" was cached, "a" deduplicated: only a and c reach the backend.
        assert_eq!(provider.texts_embedded(), 3);
    }

    #[tokio::test]
    async fn second_call_is_served_from_cache() {
        let (cache, _dir) = cache().await;
        let provider = MockProvider::default();
        let generator = EmbeddingGenerator::new(provider.clone(), cache, 8);

        generator.embed_texts(&texts(&["x", "y"])).await.unwrap();
        let calls = provider.calls();
        generator.embed_texts(&texts(&["y", "x"])).await.unwrap();
        assert_eq!(provider.calls(), calls);
        assert_eq!(generator.inference_calls(), 1);
    }

    #[tokio::test]
    async fn misses_are_chunked_by_batch_size() {
        let (cache, _dir) = cache().await;
        let provider = MockProvider::default();
        let generator = EmbeddingGenerator::new(provider.clone(), cache, 2);
        generator
            .embed_texts(&texts(&["1", "2", "3", "4", "5"]))
            .await
            .unwrap();
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test]
    async fn model_identity_separates_cache_entries() {
        let (cache, _dir) = cache().await;
        let a = MockProvider::default().with_model("model-a", "1");
        let b = MockProvider::default().with_model("model-b", "1");
        let gen_a = EmbeddingGenerator::new(a.clone(), Arc::clone(&cache), 8);
        let gen_b = EmbeddingGenerator::new(b.clone(), cache, 8);

        let va = gen_a.embed_texts(&texts(&["same"])).await.unwrap();
        let vb = gen_b.embed_texts(&texts(&["same"])).await.unwrap();
        assert_eq!(b.calls(), 1);
        assert_eq!(vb[0], b.vector_for("same"));
        assert_ne!(va, vb);
    }

    #[tokio::test]
    async fn backend_failure_fails_whole_batch() {
        let (cache, _dir) = cache().await;
        let provider = MockProvider::default().failing_on("boom");
        let generator = EmbeddingGenerator::new(provider, Arc::clone(&cache), 1);

        let err = generator
            .embed_texts(&texts(&["fine", "boom"]))
            .await
            .unwrap_err();
        assert!(matches!(err, IndexError::EmbeddingBackendUnavailable(_)));
        assert!(err.is_retryable());
        assert!(generator.in_flight.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn concurrent_requests_for_same_text_infer_once() {
        let (cache, _dir) = cache().await;
        let provider = MockProvider::default().with_delay(50);
        let generator = Arc::new(EmbeddingGenerator::new(provider.clone(), cache, 8));

        let g1 = Arc::clone(&generator);
        let g2 = Arc::clone(&generator);
        let (a, b) = tokio::join!(
            tokio::spawn(async move { g1.embed_texts(&texts(&["shared"])).await }),
            tokio::spawn(async move { g2.embed_texts(&texts(&["shared"])).await }),
        );
        assert_eq!(a.unwrap().unwrap(), b.unwrap().unwrap());
        assert_eq!(provider.texts_embedded(), 1);
    }

    #[tokio::test]
    async fn cancelled_leader_lets_follower_retry() {
        let (cache, _dir) = cache().await;
        let provider = MockProvider::default().with_delay(200);
        let generator = Arc::new(EmbeddingGenerator::new(provider.clone(), cache, 8));

        let leader = {
            let g = Arc::clone(&generator);
            tokio::spawn(async move { g.embed_texts(&texts(&["k"])).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let follower = {
            let g = Arc::clone(&generator);
            tokio::spawn(async move { g.embed_texts(&texts(&["k"])).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        leader.abort();

        let out = follower.await.unwrap().unwrap();
        assert_eq!(out[0], provider.vector_for("k"));
    }

    #[tokio::test]
    async fn key_cached_after_lookup_is_not_inferred_again() {
        let (cache, _dir) = cache().await;
        let provider = MockProvider::default();
        let generator = EmbeddingGenerator::new(provider.clone(), cache, 8);

        // A caller that saw "k" missing from the cache, then lost the race to a
        // leader that finished and released its claim before this one claimed.
        let text = "k".to_owned();
        let key = CacheKey::for_text(&text, provider.model_identity(), provider.model_version());
        let stale = vec![Pending {
            key,
            text: text.clone(),
            positions: vec![0],
        }];
        generator.embed_texts(std::slice::from_ref(&text)).await.unwrap();
        assert_eq!(provider.calls(), 1);
        assert!(generator.in_flight.lock().unwrap().is_empty());

        let mut out = vec![None];
        let retry = generator.resolve(stale, &mut out).await.unwrap();
        assert!(retry.is_empty());
        assert_eq!(out[0].as_deref(), Some(provider.vector_for("k").as_slice()));
        assert_eq!(provider.calls(), 1);
        assert_eq!(generator.inference_calls(), 1);
        assert!(generator.in_flight.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cached_vector_of_wrong_width_is_regenerated() {
        let (cache, _dir) = cache().await;
        let provider = MockProvider::default();
        let generator = EmbeddingGenerator::new(provider.clone(), Arc::clone(&cache), 8);
        generator.probe_dimensions().await.unwrap();

        let key = CacheKey::for_text("k", provider.model_identity(), provider.model_version());
        cache.put(&key, &[1.0, 2.0]).await.unwrap();

        let out = generator.embed_texts(&texts(&["k"])).await.unwrap();
        assert_eq!(out[0], provider.vector_for("k"));
        assert_eq!(generator.inference_calls(), 2);
        assert_eq!(cache.get(&key).await.unwrap(), Some(provider.vector_for("k")));
    }

    #[tokio::test]
    async fn non_finite_cache_hit_is_corruption() {
        let (cache, _dir) = cache().await;
        let generator = EmbeddingGenerator::new(MockProvider::default(), cache, 1);
        let key = CacheKey::for_text("k", "m", "1");
        let err = generator.check_cached(&key, vec![f32::NAN]).unwrap_err();
        assert!(matches!(err, IndexError::CacheCorruption(_)));
        assert!(generator.check_cached(&key, vec![0.5]).is_ok());
    }

    #[tokio::test]
    async fn probe_records_dimensions() {
        let (cache, _dir) = cache().await;
        let generator =
            EmbeddingGenerator::new(MockProvider::default().with_dimensions(12), cache, 8);
        assert_eq!(generator.dimensions(), None);
        assert_eq!(generator.probe_dimensions().await.unwrap(), 12);
        assert_eq!(generator.dimensions(), Some(12));
    }

    #[tokio::test]
    async fn probe_fails_when_backend_down() {
        let (cache, _dir) = cache().await;
        let generator = EmbeddingGenerator::new(MockProvider::failing(), cache, 8);
        assert!(matches!(
            generator.probe_dimensions().await,
            Err(IndexError::EmbeddingBackendUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn embed_batch_uses_contextualized_text() {
        let (cache, _dir) = cache().await;
        let provider = MockProvider::default();
        let generator = EmbeddingGenerator::new(provider.clone(), cache, 8);
        let unit = SemanticUnit::new(
            "src/a.py",
            UnitType::Function,
            "f",
            "def f(): pass",
            (1, 1),
            Lang::Python,
        );
        let out = generator.embed_batch(std::slice::from_ref(&unit)).await.unwrap();
        assert_eq!(out[0], provider.vector_for(&contextualize_for_embedding(&unit)));
    }
}
