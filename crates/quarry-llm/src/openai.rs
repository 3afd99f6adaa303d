use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::LlmError;
use crate::provider::{EmbeddingProvider, ensure_count};
use crate::retry::send_with_retry;

/// Embedding backend for OpenAI and any server speaking the same `/embeddings` API
/// (vLLM, LM Studio, text-embeddings-inference).
#[derive(Clone)]
pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
    embedding_model: String,
    model_version: String,
    max_retries: u32,
}

impl fmt::Debug for OpenAiProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAiProvider")
            .field("client", &"<reqwest::Client>")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .field("embedding_model", &self.embedding_model)
            .field("model_version", &self.model_version)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

impl OpenAiProvider {
    #[must_use]
    pub fn new(
        api_key: Option<String>,
        mut base_url: String,
        embedding_model: String,
        model_version: String,
    ) -> Self {
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            client: crate::http::default_client(),
            api_key,
            base_url,
            embedding_model,
            model_version,
            max_retries: 3,
        }
    }

    #[must_use]
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

impl EmbeddingProvider for OpenAiProvider {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let body = EmbeddingRequest {
            input: texts,
            model: &self.embedding_model,
        };
        let url = format!("{}/embeddings", self.base_url);

        let response = send_with_retry("openai", self.max_retries, || {
            let mut req = self
                .client
                .post(&url)
                .header("Content-Type", "application/json")
                .json(&body);
            if let Some(key) = &self.api_key {
                req = req.bearer_auth(key);
            }
            req.send()
        })
        .await?;

        let status = response.status();
        let text = response.text().await.map_err(LlmError::Http)?;

        if status.is_server_error() {
            tracing::error!("embedding API error {status}: {text}");
            return Err(LlmError::Unavailable(format!(
                "embedding endpoint returned {status}"
            )));
        }
        if !status.is_success() {
            tracing::error!("embedding API rejected request {status}: {text}");
            return Err(LlmError::Rejected {
                status: status.as_u16(),
                message: text,
            });
        }

        let resp: EmbeddingResponse = serde_json::from_str(&text)?;
        if resp.data.is_empty() {
            return Err(LlmError::EmptyResponse { provider: "openai" });
        }
        ensure_count("openai", texts.len(), into_ordered(resp.data))
    }

    fn model_identity(&self) -> &str {
        &self.embedding_model
    }

    fn model_version(&self) -> &str {
        &self.model_version
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}

/// The API may return items out of order; `index` is authoritative.
fn into_ordered(mut data: Vec<EmbeddingData>) -> Vec<Vec<f32>> {
    data.sort_by_key(|d| d.index);
    data.into_iter().map(|d| d.embedding).collect()
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    input: &'a [String],
    model: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_trims_trailing_slashes() {
        let p = OpenAiProvider::new(
            None,
            "http://localhost:8000/v1//".into(),
            "text-embedding-3-small".into(),
            "1".into(),
        );
        assert_eq!(p.base_url, "http://localhost:8000/v1");
    }

    #[test]
    fn debug_redacts_api_key() {
        let p = OpenAiProvider::new(
            Some("sk-secret".into()),
            "https://api.openai.com/v1".into(),
            "text-embedding-3-small".into(),
            "1".into(),
        );
        let dbg = format!("{p:?}");
        assert!(!dbg.contains("sk-secret"));
        assert!(dbg.contains("<redacted>"));
    }

    #[test]
    fn response_reordered_by_index() {
        let json = r#"{"data":[
            {"index":1,"embedding":[0.2]},
            {"index":0,"embedding":[0.1]}
        ]}"#;
        let resp: EmbeddingResponse = serde_json::from_str(json).unwrap();
        let ordered = into_ordered(resp.data);
        assert_eq!(ordered, vec![vec![0.1], vec![0.2]]);
    }

    #[test]
    fn request_serializes_batch_input() {
        let input = vec!["a".to_string(), "b".to_string()];
        let body = EmbeddingRequest {
            input: &input,
            model: "m",
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["input"], serde_json::json!(["a", "b"]));
        assert_eq!(json["model"], "m");
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_unavailable() {
        let p = OpenAiProvider::new(None, "http://127.0.0.1:1".into(), "m".into(), "1".into())
            .with_max_retries(0);
        let err = p.embed_batch(&["x".to_string()]).await.unwrap_err();
        assert!(matches!(err, LlmError::Unavailable(_)), "got {err:?}");
    }
}
