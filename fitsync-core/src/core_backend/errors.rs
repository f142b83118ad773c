//! Backend error types

use thiserror::Error;

/// Result type for backend calls
pub type ApiResult<T> = Result<T, ApiError>;

/// Failures talking to the server of record
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ApiError {
    /// Non-success status; `message` comes from the error body when present
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// Connection refused, reset, DNS failure...
    #[error("Transport error: {0}")]
    Transport(String),

    /// Request exceeded its deadline
    #[error("Request timed out")]
    Timeout,

    /// Response body did not match the expected shape
    #[error("Decode error: {0}")]
    Decode(String),
}

impl ApiError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::Http { status: 404, .. })
    }

    /// Whether repeating the request could plausibly succeed
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::Transport(_) | ApiError::Timeout => true,
            ApiError::Http { status, .. } => *status >= 500 || *status == 429,
            ApiError::Decode(_) => false,
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ApiError::Timeout
        } else if e.is_decode() {
            ApiError::Decode(e.to_string())
        } else if let Some(status) = e.status() {
            ApiError::Http { status: status.as_u16(), message: e.to_string() }
        } else {
            ApiError::Transport(e.to_string())
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(e: serde_json::Error) -> Self {
        ApiError::Decode(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ApiError::Http { status: 404, message: "group 9 not found".to_string() };
        assert_eq!(err.to_string(), "HTTP 404: group 9 not found");
        assert!(err.is_not_found());
        assert!(!err.is_transient());
    }

    #[test]
    fn test_transient_classification() {
        assert!(ApiError::Timeout.is_transient());
        assert!(ApiError::Http { status: 503, message: String::new() }.is_transient());
        assert!(!ApiError::Decode("x".into()).is_transient());
    }

    #[test]
    fn test_json_error_conversion() {
        let err: ApiError = serde_json::from_str::<u64>("nope").unwrap_err().into();
        assert!(matches!(err, ApiError::Decode(_)));
    }
}
