//! Deterministic in-process embedding backend for tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::error::LlmError;
use crate::provider::EmbeddingProvider;

#[derive(Debug, Clone)]
pub struct MockProvider {
    pub dimensions: usize,
    pub model: String,
    pub version: String,
    /// Milliseconds to sleep inside every `embed_batch` call.
    pub delay_ms: u64,
    /// Fail any batch containing a text with this substring.
    pub fail_on: Option<String>,
    failing: Arc<AtomicBool>,
    calls: Arc<AtomicUsize>,
    texts: Arc<AtomicUsize>,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self {
            dimensions: 8,
            model: "mock-embed".into(),
            version: "1".into(),
            delay_ms: 0,
            fail_on: None,
            failing: Arc::new(AtomicBool::new(false)),
            calls: Arc::new(AtomicUsize::new(0)),
            texts: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl MockProvider {
    #[must_use]
    pub fn with_model(mut self, model: &str, version: &str) -> Self {
        self.model = model.into();
        self.version = version.into();
        self
    }

    #[must_use]
    pub fn with_dimensions(mut self, dimensions: usize) -> Self {
        self.dimensions = dimensions;
        self
    }

    #[must_use]
    pub fn with_delay(mut self, ms: u64) -> Self {
        self.delay_ms = ms;
        self
    }

    #[must_use]
    pub fn failing_on(mut self, needle: &str) -> Self {
        self.fail_on = Some(needle.into());
        self
    }

    #[must_use]
    pub fn failing() -> Self {
        let provider = Self::default();
        provider.set_failing(true);
        provider
    }

    /// Toggle backend availability. Clones share the flag.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of `embed_batch` calls that reached the backend.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Total number of texts embedded across all calls.
    #[must_use]
    pub fn texts_embedded(&self) -> usize {
        self.texts.load(Ordering::SeqCst)
    }

    /// The vector this backend produces for `text`.
    #[must_use]
    pub fn vector_for(&self, text: &str) -> Vec<f32> {
        let seed = format!("{}@{}:{text}", self.model, self.version);
        let mut out = Vec::with_capacity(self.dimensions);
        let mut hasher = blake3::Hasher::new();
        hasher.update(seed.as_bytes());
        let mut reader = hasher.finalize_xof();
        let mut buf = [0u8; 4];
        for _ in 0..self.dimensions {
            reader.fill(&mut buf);
            let raw = u32::from_le_bytes(buf);
            #[allow(clippy::cast_precision_loss)]
            out.push((raw as f32 / u32::MAX as f32) * 2.0 - 1.0);
        }
        out
    }
}

impl EmbeddingProvider for MockProvider {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(LlmError::Unavailable("mock backend offline".into()));
        }
        if let Some(needle) = &self.fail_on
            && texts.iter().any(|t| t.contains(needle.as_str()))
        {
            return Err(LlmError::Unavailable(format!("mock refused input containing {needle}")));
        }
        self.texts.fetch_add(texts.len(), Ordering::SeqCst);
        Ok(texts.iter().map(|t| self.vector_for(t)).collect())
    }

    fn model_identity(&self) -> &str {
        &self.model
    }

    fn model_version(&self) -> &str {
        &self.version
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn vectors_are_deterministic_and_ordered() {
        let p = MockProvider::default();
        let texts = vec!["a".to_string(), "b".to_string()];
        let first = p.embed_batch(&texts).await.unwrap();
        let second = p.embed_batch(&texts).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first[0], p.vector_for("a"));
        assert_eq!(first[1], p.vector_for("b"));
        assert_eq!(p.calls(), 2);
        assert_eq!(p.texts_embedded(), 4);
    }

    #[test]
    fn model_changes_vectors() {
        let a = MockProvider::default().with_model("a", "1");
        let b = MockProvider::default().with_model("b", "1");
        assert_ne!(a.vector_for("same"), b.vector_for("same"));
    }

    #[tokio::test]
    async fn failing_flag_is_shared_between_clones() {
        let p = MockProvider::default();
        let clone = p.clone();
        clone.set_failing(true);
        assert!(p.embed_batch(&["x".to_string()]).await.is_err());
        p.set_failing(false);
        assert!(clone.embed_batch(&["x".to_string()]).await.is_ok());
    }

    #[tokio::test]
    async fn fail_on_needle() {
        let p = MockProvider::default().failing_on("boom");
        assert!(p.embed_batch(&["ok".to_string()]).await.is_ok());
        assert!(p.embed_batch(&["ok".to_string(), "boom!".to_string()]).await.is_err());
    }

    #[test]
    fn dimensions_respected() {
        let p = MockProvider::default().with_dimensions(3);
        assert_eq!(p.vector_for("x").len(), 3);
    }
}
