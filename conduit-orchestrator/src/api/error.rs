//! API Error Handling
//!
//! Service errors become JSON responses `{"error": ..., "reason": ...}` with
//! the status code of their reason.

use axum::{
    Json,
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};

use crate::error::ServiceError;

/// API error type
#[derive(Debug)]
pub struct ApiError {
    error: ServiceError,
    headers: HeaderMap,
}

impl ApiError {
    /// Attach a response header, ignoring values that are not valid headers
    pub fn with_header(mut self, name: &'static str, value: &str) -> Self {
        if let Ok(value) = HeaderValue::from_str(value) {
            self.headers.insert(HeaderName::from_static(name), value);
        }
        self
    }

    pub fn service_error(&self) -> &ServiceError {
        &self.error
    }
}

impl From<ServiceError> for ApiError {
    fn from(error: ServiceError) -> Self {
        Self {
            error,
            headers: HeaderMap::new(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.error.reason.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        if status.is_server_error() {
            tracing::error!(reason = %self.error.reason, "Request failed: {}", self.error);
        } else {
            tracing::debug!(reason = %self.error.reason, "Request rejected: {}", self.error);
        }

        let body = Json(serde_json::json!({
            "error": self.error.message,
            "reason": self.error.reason,
        }));

        (status, self.headers, body).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
