//! Runner configuration
//!
//! Defines all configurable parameters for the runner including
//! polling intervals, trace streaming and orchestrator connection settings.

use std::path::PathBuf;
use std::time::Duration;

/// Runner configuration
///
/// All intervals are configurable to allow tuning for different deployment
/// scenarios (dev vs prod, fast vs slow networks).
#[derive(Debug, Clone)]
pub struct Config {
    /// Orchestrator base URL (e.g., "http://localhost:8080")
    pub orchestrator_url: String,

    /// Token of an already registered runner
    pub runner_token: Option<String>,

    /// Registration or project runners token, used when no runner token is set
    pub registration_token: Option<String>,

    /// Shown in `conduit runner list`
    pub description: Option<String>,

    /// Tags this runner accepts jobs for
    pub tags: Vec<String>,

    /// Also pick jobs without tags
    pub run_untagged: bool,

    /// How often to ask the orchestrator for new jobs
    pub poll_interval: Duration,

    /// How often buffered trace output is sent
    pub trace_send_interval: Duration,

    pub heartbeat_interval: Duration,

    /// Max parallel jobs the runner can handle
    pub max_parallel_jobs: usize,

    /// Base directory for per-job workspaces
    pub workspace_dir: PathBuf,
}

impl Config {
    /// Creates a new configuration with defaults
    pub fn new(orchestrator_url: String) -> Self {
        Self {
            orchestrator_url,
            runner_token: None,
            registration_token: None,
            description: None,
            tags: Vec::new(),
            run_untagged: true,
            poll_interval: Duration::from_secs(5),
            trace_send_interval: Duration::from_secs(3),
            heartbeat_interval: Duration::from_secs(30),
            max_parallel_jobs: 2,
            workspace_dir: std::env::temp_dir().join("conduit-runner"),
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Expected environment variables:
    /// - ORCHESTRATOR_URL (required)
    /// - RUNNER_TOKEN or RUNNER_REGISTRATION_TOKEN (one of them required)
    /// - RUNNER_DESCRIPTION (optional)
    /// - RUNNER_TAGS (optional, comma separated)
    /// - RUNNER_RUN_UNTAGGED (optional, default: true)
    /// - POLL_INTERVAL (optional, seconds, default: 5)
    /// - TRACE_SEND_INTERVAL (optional, seconds, default: 3)
    /// - MAX_PARALLEL_JOBS (optional, default: 2)
    /// - WORKSPACE_DIR (optional, default: $TMPDIR/conduit-runner)
    pub fn from_env() -> anyhow::Result<Self> {
        let orchestrator_url = std::env::var("ORCHESTRATOR_URL")
            .map_err(|_| anyhow::anyhow!("ORCHESTRATOR_URL environment variable not set"))?;
        let mut config = Self::new(orchestrator_url);

        config.runner_token = non_empty_var("RUNNER_TOKEN");
        config.registration_token = non_empty_var("RUNNER_REGISTRATION_TOKEN");
        config.description = non_empty_var("RUNNER_DESCRIPTION");

        if let Some(tags) = non_empty_var("RUNNER_TAGS") {
            config.tags = parse_tags(&tags);
        }

        if let Some(run_untagged) = non_empty_var("RUNNER_RUN_UNTAGGED") {
            config.run_untagged = matches!(run_untagged.as_str(), "1" | "true" | "yes");
        }

        if let Some(secs) = parse_var::<u64>("POLL_INTERVAL") {
            config.poll_interval = Duration::from_secs(secs);
        }

        if let Some(secs) = parse_var::<u64>("TRACE_SEND_INTERVAL") {
            config.trace_send_interval = Duration::from_secs(secs);
        }

        if let Some(max) = parse_var::<usize>("MAX_PARALLEL_JOBS") {
            config.max_parallel_jobs = max;
        }

        if let Some(dir) = non_empty_var("WORKSPACE_DIR") {
            config.workspace_dir = PathBuf::from(dir);
        }

        Ok(config)
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.orchestrator_url.is_empty() {
            anyhow::bail!("orchestrator_url cannot be empty");
        }

        if !self.orchestrator_url.starts_with("http://")
            && !self.orchestrator_url.starts_with("https://")
        {
            anyhow::bail!("orchestrator_url must start with http:// or https://");
        }

        if self.runner_token.is_none() && self.registration_token.is_none() {
            anyhow::bail!("either RUNNER_TOKEN or RUNNER_REGISTRATION_TOKEN must be set");
        }

        if self.poll_interval.as_secs() == 0 {
            anyhow::bail!("poll_interval must be greater than 0");
        }

        if self.trace_send_interval.as_secs() == 0 {
            anyhow::bail!("trace_send_interval must be greater than 0");
        }

        if self.max_parallel_jobs == 0 {
            anyhow::bail!("max_parallel_jobs must be greater than 0");
        }

        Ok(())
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.trim().is_empty())
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    non_empty_var(name).and_then(|value| value.trim().parse().ok())
}

fn parse_tags(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        let mut config = Config::new("http://localhost:8080".to_string());
        config.registration_token = Some("register-me".to_string());
        config
    }

    #[test]
    fn test_default_config() {
        let config = config();
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.trace_send_interval, Duration::from_secs(3));
        assert!(config.run_untagged);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = config();

        // Invalid URL should fail
        config.orchestrator_url = "not-a-url".to_string();
        assert!(config.validate().is_err());
        config.orchestrator_url = "http://localhost:8080".to_string();

        // Some token is needed to talk to the orchestrator
        config.registration_token = None;
        assert!(config.validate().is_err());
        config.runner_token = Some("abc".to_string());
        assert!(config.validate().is_ok());

        config.max_parallel_jobs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_tags() {
        assert_eq!(parse_tags("linux, docker,,gpu "), vec!["linux", "docker", "gpu"]);
        assert!(parse_tags(" , ").is_empty());
    }
}
