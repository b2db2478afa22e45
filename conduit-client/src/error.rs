//! Error types for the Conduit client

use thiserror::Error;

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors that can occur when using the Conduit client
#[derive(Debug, Error)]
pub enum ClientError {
    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    /// API returned an error status code
    #[error("API error (status {status}): {message}")]
    ApiError {
        /// HTTP status code
        status: u16,
        /// Error message from the API
        message: String,
        /// Machine readable reason, when the body carried one
        reason: Option<String>,
    },

    /// The job is no longer running on the server; the runner must stop it
    #[error("Job is no longer running (status {status})")]
    JobNotRunning { status: String },

    /// Failed to parse response
    #[error("Failed to parse response: {0}")]
    ParseError(String),
}

impl ClientError {
    /// Create an API error from status code and message
    pub fn api_error(status: u16, message: impl Into<String>, reason: Option<String>) -> Self {
        Self::ApiError {
            status,
            message: message.into(),
            reason,
        }
    }

    /// Build an API error from a response body, preferring the
    /// `{"error": ..., "reason": ...}` shape the orchestrator answers with
    pub fn from_body(status: u16, body: &str) -> Self {
        match serde_json::from_str::<serde_json::Value>(body) {
            Ok(value) if value.get("error").is_some() => Self::api_error(
                status,
                value["error"].as_str().unwrap_or_default(),
                value["reason"].as_str().map(str::to_string),
            ),
            _ => Self::api_error(status, body.trim(), None),
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::ApiError { status, .. } => Some(*status),
            Self::JobNotRunning { .. } => Some(403),
            _ => None,
        }
    }

    /// Check if this error is a "not found" error
    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }

    /// Check if this error is a client error (4xx status)
    pub fn is_client_error(&self) -> bool {
        matches!(self.status(), Some(status) if (400..500).contains(&status))
    }

    /// Check if this error is a server error (5xx status)
    pub fn is_server_error(&self) -> bool {
        matches!(self.status(), Some(status) if status >= 500)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_json_body() {
        let err = ClientError::from_body(404, r#"{"error":"Pipeline 3 not found","reason":"not_found"}"#);
        match &err {
            ClientError::ApiError {
                status,
                message,
                reason,
            } => {
                assert_eq!(*status, 404);
                assert_eq!(message, "Pipeline 3 not found");
                assert_eq!(reason.as_deref(), Some("not_found"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(err.is_not_found());
        assert!(err.is_client_error());
    }

    #[test]
    fn test_from_plain_body() {
        let err = ClientError::from_body(502, "bad gateway\n");
        assert!(err.is_server_error());
        assert_eq!(err.to_string(), "API error (status 502): bad gateway");
    }

    #[test]
    fn test_job_not_running_is_forbidden() {
        let err = ClientError::JobNotRunning {
            status: "canceled".to_string(),
        };
        assert_eq!(err.status(), Some(403));
    }
}
