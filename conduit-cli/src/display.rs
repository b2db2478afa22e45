//! Shared output helpers

use anyhow::{Context, Result};
use colored::*;
use conduit_core::Status;
use serde::de::DeserializeOwned;

/// Colorize a job or pipeline status for display
pub fn colorize_status(status: Status) -> ColoredString {
    let text = status.as_str();
    match status {
        Status::Success => text.green(),
        Status::Failed => text.red(),
        Status::Running => text.blue(),
        Status::Pending | Status::Created => text.yellow(),
        Status::Canceled | Status::Skipped => text.dimmed(),
        Status::Manual | Status::Scheduled => text.magenta(),
    }
}

/// Parse a snake_case enum value the way the API spells it
pub fn parse_enum<T: DeserializeOwned>(value: &str) -> Result<T> {
    serde_json::from_value(serde_json::Value::String(value.to_string()))
        .with_context(|| format!("Invalid value: {}", value))
}

/// Parse a single KEY=value pair
pub fn parse_key_val(s: &str) -> Result<(String, String)> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| anyhow::anyhow!("invalid KEY=value: no `=` found in `{}`", s))?;
    Ok((key.to_string(), value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::domain::project::{MemberRole, Visibility};

    #[test]
    fn test_parse_key_val() {
        assert_eq!(
            parse_key_val("DEPLOY_ENV=staging=blue").unwrap(),
            ("DEPLOY_ENV".to_string(), "staging=blue".to_string())
        );
        assert!(parse_key_val("novalue").is_err());
    }

    #[test]
    fn test_parse_enum() {
        assert_eq!(parse_enum::<MemberRole>("maintainer").unwrap(), MemberRole::Maintainer);
        assert_eq!(parse_enum::<Visibility>("public").unwrap(), Visibility::Public);
        assert!(parse_enum::<MemberRole>("boss").is_err());
    }
}
