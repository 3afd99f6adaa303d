#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parse failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("rate limited")]
    RateLimited,

    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("empty response from {provider}")]
    EmptyResponse { provider: &'static str },

    #[error("{provider} returned {got} embeddings for {expected} inputs")]
    CountMismatch {
        provider: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("embedding request rejected (status {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("{0}")]
    Other(String),
}

impl LlmError {
    /// Whether retrying the same request later may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            Self::RateLimited | Self::Unavailable(_) | Self::EmptyResponse { .. } => true,
            Self::Json(_) | Self::CountMismatch { .. } | Self::Rejected { .. } | Self::Other(_) => {
                false
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, LlmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_is_transient() {
        assert!(LlmError::Unavailable("down".into()).is_transient());
        assert!(LlmError::RateLimited.is_transient());
    }

    #[test]
    fn rejected_is_not_transient() {
        let err = LlmError::Rejected {
            status: 400,
            message: "bad input".into(),
        };
        assert!(!err.is_transient());
        assert!(err.to_string().contains("400"));
    }

    #[test]
    fn count_mismatch_message() {
        let err = LlmError::CountMismatch {
            provider: "ollama",
            expected: 3,
            got: 2,
        };
        assert_eq!(err.to_string(), "ollama returned 2 embeddings for 3 inputs");
    }
}
