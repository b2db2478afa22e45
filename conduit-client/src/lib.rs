//! Conduit HTTP Client
//!
//! A type-safe HTTP client for the Conduit orchestrator API, shared by the
//! CLI and the runner.
//!
//! # Example
//!
//! ```no_run
//! use conduit_client::ConduitClient;
//! use conduit_core::dto::pipeline::CreatePipeline;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = ConduitClient::new("http://localhost:8080").as_user("alice");
//!
//!     let pipeline = client
//!         .create_pipeline(
//!             1,
//!             &CreatePipeline {
//!                 ref_name: "main".to_string(),
//!                 sha: None,
//!                 config: None,
//!                 variables: Default::default(),
//!             },
//!         )
//!         .await?;
//!
//!     println!("Created pipeline: {}", pipeline.id);
//!     Ok(())
//! }
//! ```

pub mod error;
mod jobs;
mod pipelines;
mod projects;
mod runners;

// Re-export commonly used types
pub use error::{ClientError, Result};
pub use conduit_core::dto::job::{JobPayload, TraceAppend};

use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;

/// Header naming the acting user
pub const USER_HEADER: &str = "x-conduit-user";
/// Header carrying a job token on runner calls
pub const JOB_TOKEN_HEADER: &str = "job-token";
/// Header the orchestrator sets to the job status on trace and state calls
pub const JOB_STATUS_HEADER: &str = "job-status";

/// HTTP client for the Conduit orchestrator API
///
/// Methods are grouped by resource:
/// - Users, projects, members and trigger tokens
/// - Pipelines (create, trigger, list, cancel, retry)
/// - Jobs, including the runner job API (request, trace, state, artifacts)
/// - Runner registration and heartbeats
#[derive(Debug, Clone)]
pub struct ConduitClient {
    /// Base URL of the orchestrator (e.g., "http://localhost:8080")
    base_url: String,
    /// HTTP client instance
    client: Client,
    /// Username sent with user-facing calls
    user: Option<String>,
}

impl ConduitClient {
    /// Create a new client
    ///
    /// # Example
    /// ```
    /// use conduit_client::ConduitClient;
    ///
    /// let client = ConduitClient::new("http://localhost:8080");
    /// ```
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, Client::new())
    }

    /// Create a new client with a custom HTTP client
    ///
    /// This allows you to configure timeouts, proxies, TLS settings, etc.
    pub fn with_client(base_url: impl Into<String>, client: Client) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            user: None,
        }
    }

    /// Act as `username` on user-facing endpoints
    pub fn as_user(mut self, username: impl Into<String>) -> Self {
        self.user = Some(username.into());
        self
    }

    /// Get the base URL of the orchestrator
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Start a request, identifying the user when one is set
    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.client.request(method, self.url(path));
        match &self.user {
            Some(user) => builder.header(USER_HEADER, user),
            None => builder,
        }
    }

    /// Start a runner call authenticated by a job token
    fn job_request(&self, method: Method, path: &str, token: &str) -> RequestBuilder {
        self.client
            .request(method, self.url(path))
            .header(JOB_TOKEN_HEADER, token)
    }

    // =============================================================================
    // Response Handlers
    // =============================================================================

    /// Turn a failed response into a [`ClientError`]
    ///
    /// A 403 carrying a `job-status` header means the job left the running
    /// state on the server.
    async fn error_for(response: reqwest::Response) -> ClientError {
        let status = response.status();
        if status == StatusCode::FORBIDDEN
            && let Some(job_status) = header_str(&response, JOB_STATUS_HEADER)
        {
            return ClientError::JobNotRunning {
                status: job_status.to_string(),
            };
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        ClientError::from_body(status.as_u16(), &body)
    }

    /// Handle an API response and deserialize JSON
    async fn handle_response<T: DeserializeOwned>(&self, response: reqwest::Response) -> Result<T> {
        if !response.status().is_success() {
            return Err(Self::error_for(response).await);
        }

        response
            .json()
            .await
            .map_err(|e| ClientError::ParseError(format!("Failed to parse JSON response: {}", e)))
    }

    /// Handle an API response that returns no content
    async fn handle_empty_response(&self, response: reqwest::Response) -> Result<()> {
        if !response.status().is_success() {
            return Err(Self::error_for(response).await);
        }

        Ok(())
    }
}

fn header_str<'a>(response: &'a reqwest::Response, name: &str) -> Option<&'a str> {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let client = ConduitClient::new("http://localhost:8080");
        assert_eq!(client.base_url(), "http://localhost:8080");
        assert_eq!(client.user(), None);
    }

    #[test]
    fn test_client_trims_trailing_slash() {
        let client = ConduitClient::new("http://localhost:8080/");
        assert_eq!(client.url("/health"), "http://localhost:8080/health");
    }

    #[test]
    fn test_as_user_sets_header() {
        let client = ConduitClient::new("http://localhost:8080").as_user("alice");
        let request = client.request(Method::GET, "/api/pipelines/1").build().unwrap();
        assert_eq!(request.headers()[USER_HEADER], "alice");
        assert_eq!(request.url().as_str(), "http://localhost:8080/api/pipelines/1");
    }

    #[test]
    fn test_job_request_carries_token() {
        let client = ConduitClient::new("http://localhost:8080").as_user("alice");
        let request = client
            .job_request(Method::PATCH, "/api/jobs/4/trace", "secret")
            .build()
            .unwrap();
        assert_eq!(request.headers()[JOB_TOKEN_HEADER], "secret");
        assert!(request.headers().get(USER_HEADER).is_none());
    }
}
