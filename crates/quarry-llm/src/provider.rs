use std::future::Future;

use crate::error::LlmError;

/// An inference backend that turns texts into fixed-width vectors.
///
/// Every vector returned by one provider instance has the same dimensionality for
/// a given `(model_identity, model_version)` pair. Callers rely on that pair to key
/// cached vectors, so two providers must never share it unless they produce
/// interchangeable embeddings.
pub trait EmbeddingProvider: Send + Sync {
    /// Embed `texts`, returning one vector per input in input order.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be reached or returns a malformed
    /// response. A failed call yields no vectors at all.
    fn embed_batch(
        &self,
        texts: &[String],
    ) -> impl Future<Output = Result<Vec<Vec<f32>>, LlmError>> + Send;

    /// Model name used in cache keys.
    fn model_identity(&self) -> &str;

    /// Model revision used in cache keys. Bump it when the same model name starts
    /// producing different vectors.
    fn model_version(&self) -> &str;

    fn name(&self) -> &'static str;
}

/// Check that a backend answered with exactly one vector per input.
///
/// # Errors
///
/// Returns [`LlmError::CountMismatch`] when the counts differ.
pub(crate) fn ensure_count(
    provider: &'static str,
    expected: usize,
    vectors: Vec<Vec<f32>>,
) -> Result<Vec<Vec<f32>>, LlmError> {
    if vectors.len() == expected {
        Ok(vectors)
    } else {
        Err(LlmError::CountMismatch {
            provider,
            expected,
            got: vectors.len(),
        })
    }
}
