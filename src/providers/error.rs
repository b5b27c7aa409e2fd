use thiserror::Error;

/// Errors raised while talking to the ChatGLM backend or replaying its stream
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("JSON serialization failed: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Refresh/login failure; the refresh token is most likely expired
    #[error("Upstream authentication failed: {0}")]
    UpstreamAuth(String),

    /// Any non-success vendor response that carried a message
    #[error("Upstream API error: {status} - {message}")]
    ApiError {
        status: u16,
        code: Option<i64>,
        message: String,
    },

    #[error("Stream response invalid: {0}")]
    MalformedStream(String),

    #[error("File is not valid: {0}")]
    FileInvalid(String),

    #[error("Content was filtered by the upstream moderation")]
    ContentFiltered,

    #[error("Generation failed: {0}")]
    GenerationFailed(String),

    #[error("Upstream timed out: {0}")]
    Timeout(String),
}

impl ProviderError {
    /// Check if the vendor rejected the access token.
    /// The cached token for the refresh token must be evicted when this is true.
    pub fn is_auth_failure(&self) -> bool {
        match self {
            ProviderError::ApiError { status, code, .. } => *status == 401 || *code == Some(401),
            _ => false,
        }
    }

    /// Check if the orchestrator may retry the whole round trip after this error
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::UpstreamAuth(_)
            | ProviderError::FileInvalid(_)
            | ProviderError::ContentFiltered => false,
            ProviderError::ApiError { .. } => !self.is_auth_failure(),
            ProviderError::HttpError(_)
            | ProviderError::SerializationError(_)
            | ProviderError::MalformedStream(_)
            | ProviderError::GenerationFailed(_)
            | ProviderError::Timeout(_) => true,
        }
    }

    /// Check if this error came from a timed out request
    pub fn is_timeout(&self) -> bool {
        match self {
            ProviderError::HttpError(e) => e.is_timeout(),
            ProviderError::Timeout(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_failure_detection() {
        let by_status = ProviderError::ApiError {
            status: 401,
            code: None,
            message: "unauthorized".to_string(),
        };
        let by_code = ProviderError::ApiError {
            status: 200,
            code: Some(401),
            message: "token invalid".to_string(),
        };
        let other = ProviderError::ApiError {
            status: 500,
            code: Some(10001),
            message: "busy".to_string(),
        };

        assert!(by_status.is_auth_failure());
        assert!(by_code.is_auth_failure());
        assert!(!other.is_auth_failure());
    }

    #[test]
    fn test_retry_policy() {
        assert!(ProviderError::MalformedStream("x".to_string()).is_retryable());
        assert!(ProviderError::ApiError { status: 502, code: None, message: String::new() }.is_retryable());
        assert!(!ProviderError::ApiError { status: 200, code: Some(401), message: String::new() }.is_retryable());
        assert!(!ProviderError::UpstreamAuth("expired".to_string()).is_retryable());
        assert!(!ProviderError::FileInvalid("too big".to_string()).is_retryable());
        assert!(!ProviderError::ContentFiltered.is_retryable());
        assert!(ProviderError::Timeout("stream".to_string()).is_retryable());
        assert!(ProviderError::Timeout("stream".to_string()).is_timeout());
    }
}
