//! Configuration module
//!
//! Handles CLI configuration including orchestrator URL and the acting user.

use conduit_client::ConduitClient;

/// CLI configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// URL of the orchestrator service
    pub orchestrator_url: String,

    /// Username sent with every request
    pub user: Option<String>,
}

impl Config {
    pub fn client(&self) -> ConduitClient {
        let client = ConduitClient::new(&self.orchestrator_url);
        match &self.user {
            Some(user) => client.as_user(user),
            None => client,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_uses_config() {
        let config = Config {
            orchestrator_url: "http://ci.local/".to_string(),
            user: Some("alice".to_string()),
        };
        let client = config.client();
        assert_eq!(client.base_url(), "http://ci.local");
        assert_eq!(client.user(), Some("alice"));
    }
}
