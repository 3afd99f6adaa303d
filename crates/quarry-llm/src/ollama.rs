use ollama_rs::Ollama;
use ollama_rs::generation::embeddings::request::{EmbeddingsInput, GenerateEmbeddingsRequest};

use crate::error::LlmError;
use crate::provider::{EmbeddingProvider, ensure_count};

#[derive(Debug, Clone)]
pub struct OllamaProvider {
    client: Ollama,
    embedding_model: String,
    model_version: String,
}

impl OllamaProvider {
    #[must_use]
    pub fn new(base_url: &str, embedding_model: String, model_version: String) -> Self {
        let (host, port) = parse_host_port(base_url);
        Self {
            client: Ollama::new(host, port),
            embedding_model,
            model_version,
        }
    }
}

impl EmbeddingProvider for OllamaProvider {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let request = GenerateEmbeddingsRequest::new(
            self.embedding_model.clone(),
            EmbeddingsInput::Multiple(texts.to_vec()),
        );

        let response = self
            .client
            .generate_embeddings(request)
            .await
            .map_err(|e| LlmError::Unavailable(format!("Ollama embedding request failed: {e}")))?;

        if response.embeddings.is_empty() {
            return Err(LlmError::EmptyResponse { provider: "ollama" });
        }
        ensure_count("ollama", texts.len(), response.embeddings)
    }

    fn model_identity(&self) -> &str {
        &self.embedding_model
    }

    fn model_version(&self) -> &str {
        &self.model_version
    }

    fn name(&self) -> &'static str {
        "ollama"
    }
}

fn parse_host_port(url: &str) -> (String, u16) {
    let url = url.trim_end_matches('/');
    if let Some(colon_pos) = url.rfind(':') {
        let port_str = &url[colon_pos + 1..];
        if let Ok(port) = port_str.parse::<u16>() {
            let host = url[..colon_pos].to_string();
            return (host, port);
        }
    }
    (url.to_string(), 11434)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_host_port_with_port() {
        let (host, port) = parse_host_port("http://localhost:11434");
        assert_eq!(host, "http://localhost");
        assert_eq!(port, 11434);
    }

    #[test]
    fn parse_host_port_without_port() {
        let (host, port) = parse_host_port("http://localhost");
        assert_eq!(host, "http://localhost");
        assert_eq!(port, 11434);
    }

    #[test]
    fn parse_host_port_trailing_slash() {
        let (host, port) = parse_host_port("http://localhost:11434/");
        assert_eq!(host, "http://localhost");
        assert_eq!(port, 11434);
    }

    #[test]
    fn parse_host_port_invalid_port_falls_back() {
        let (host, port) = parse_host_port("http://localhost:notaport");
        assert_eq!(host, "http://localhost:notaport");
        assert_eq!(port, 11434);
    }

    #[test]
    fn parse_host_port_port_overflow_falls_back() {
        let (host, port) = parse_host_port("http://localhost:99999");
        assert_eq!(host, "http://localhost:99999");
        assert_eq!(port, 11434);
    }

    #[test]
    fn identity_reports_model_and_version() {
        let provider =
            OllamaProvider::new("http://localhost:11434", "nomic-embed-text".into(), "v1.5".into());
        assert_eq!(provider.model_identity(), "nomic-embed-text");
        assert_eq!(provider.model_version(), "v1.5");
        assert_eq!(provider.name(), "ollama");
    }

    #[tokio::test]
    async fn empty_batch_skips_request() {
        let provider = OllamaProvider::new("http://127.0.0.1:1", "embed".into(), "1".into());
        let out = provider.embed_batch(&[]).await.unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn embed_with_unreachable_endpoint_is_unavailable() {
        let provider = OllamaProvider::new("http://127.0.0.1:1", "embed".into(), "1".into());
        let result = provider.embed_batch(&["fn main() {}".to_string()]).await;
        assert!(matches!(result, Err(LlmError::Unavailable(_))));
    }
}
