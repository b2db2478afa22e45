//! Runner-related API endpoints

use crate::ConduitClient;
use crate::error::Result;
use conduit_core::dto::runner::{RegisterRunner, RegisteredRunner, RunnerSummary, RunnerToken};
use reqwest::Method;

impl ConduitClient {
    // =============================================================================
    // Runner Registration & Lifecycle
    // =============================================================================

    /// Register a runner with the instance registration token or a
    /// project's runners token
    ///
    /// # Returns
    /// The runner id and the token it authenticates with from now on
    ///
    /// # Example
    /// ```no_run
    /// # use conduit_client::ConduitClient;
    /// # use conduit_core::dto::runner::RegisterRunner;
    /// # async fn example() -> anyhow::Result<()> {
    /// let client = ConduitClient::new("http://localhost:8080");
    /// let registered = client
    ///     .register_runner(&RegisterRunner {
    ///         token: "registration-token".to_string(),
    ///         description: Some("builder-01".to_string()),
    ///         group_id: None,
    ///         tags: vec!["linux".to_string()],
    ///         run_untagged: true,
    ///         access_level: Default::default(),
    ///     })
    ///     .await?;
    /// println!("runner {}", registered.id);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn register_runner(&self, req: &RegisterRunner) -> Result<RegisteredRunner> {
        let response = self
            .client
            .post(self.url("/api/runners"))
            .json(req)
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Check that a runner token is still valid
    pub async fn verify_runner(&self, token: &str) -> Result<RunnerSummary> {
        let response = self
            .client
            .post(self.url("/api/runners/verify"))
            .json(&RunnerToken {
                token: token.to_string(),
            })
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Send a heartbeat to the orchestrator
    ///
    /// Keeps the runner marked as online. Should be called periodically.
    pub async fn send_heartbeat(&self, token: &str) -> Result<()> {
        let response = self
            .client
            .post(self.url("/api/runners/heartbeat"))
            .json(&RunnerToken {
                token: token.to_string(),
            })
            .send()
            .await?;

        self.handle_empty_response(response).await
    }

    // =============================================================================
    // Administration
    // =============================================================================

    /// List the runners visible to the current user
    pub async fn list_runners(&self) -> Result<Vec<RunnerSummary>> {
        let response = self.request(Method::GET, "/api/runners").send().await?;

        self.handle_response(response).await
    }

    pub async fn delete_runner(&self, runner_id: i64) -> Result<()> {
        let path = format!("/api/runners/{}", runner_id);
        let response = self.request(Method::DELETE, &path).send().await?;

        self.handle_empty_response(response).await
    }
}
