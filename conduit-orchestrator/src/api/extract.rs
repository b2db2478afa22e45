//! Request identity
//!
//! Users are identified by the gateway through the `X-Conduit-User` header.
//! Runners and jobs authenticate with tokens instead.

use axum::extract::FromRequestParts;
use axum::http::HeaderMap;
use axum::http::request::Parts;
use conduit_core::domain::project::User;

use crate::api::error::ApiError;
use crate::error::ServiceError;
use crate::service::ServiceContext;

pub const USER_HEADER: &str = "x-conduit-user";
pub const JOB_TOKEN_HEADER: &str = "job-token";

/// The calling user, `None` for anonymous requests
#[derive(Debug, Clone)]
pub struct CurrentUser(pub Option<User>);

impl CurrentUser {
    pub fn user(&self) -> Option<&User> {
        self.0.as_ref()
    }
}

impl FromRequestParts<ServiceContext> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        ctx: &ServiceContext,
    ) -> Result<Self, Self::Rejection> {
        let Some(value) = parts.headers.get(USER_HEADER) else {
            return Ok(CurrentUser(None));
        };

        let username = value
            .to_str()
            .map_err(|_| ServiceError::bad_request("Invalid user header"))?;

        let user = ctx
            .store
            .find_user_by_username(username.trim())
            .await
            .map_err(ServiceError::from)?
            .ok_or_else(|| ServiceError::unauthorized(format!("Unknown user '{}'", username)))?;

        Ok(CurrentUser(Some(user)))
    }
}

/// Job token from the `Job-Token` header, else from the request itself
pub fn job_token(headers: &HeaderMap, fallback: Option<&str>) -> Result<String, ApiError> {
    headers
        .get(JOB_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .or(fallback)
        .map(str::to_string)
        .filter(|token| !token.is_empty())
        .ok_or_else(|| ServiceError::unauthorized("Missing job token").into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_job_token_prefers_header() {
        let mut headers = HeaderMap::new();
        assert!(job_token(&headers, None).is_err());
        assert_eq!(job_token(&headers, Some("body")).unwrap(), "body");

        headers.insert(JOB_TOKEN_HEADER, HeaderValue::from_static("header"));
        assert_eq!(job_token(&headers, Some("body")).unwrap(), "header");
    }
}
