//! Commands module
//!
//! Defines all CLI commands and their handlers.

mod job;
mod pipeline;
mod project;
mod runner;
mod user;

pub use job::JobCommands;
pub use pipeline::PipelineCommands;
pub use project::ProjectCommands;
pub use runner::RunnerCommands;
pub use user::UserCommands;

use anyhow::Result;
use clap::Subcommand;

use crate::config::Config;

/// Top-level CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Pipeline management
    Pipeline {
        #[command(subcommand)]
        command: PipelineCommands,
    },
    /// Job management
    Job {
        #[command(subcommand)]
        command: JobCommands,
    },
    /// Runner management
    Runner {
        #[command(subcommand)]
        command: RunnerCommands,
    },
    /// Projects, members and trigger tokens
    Project {
        #[command(subcommand)]
        command: ProjectCommands,
    },
    /// User management
    User {
        #[command(subcommand)]
        command: UserCommands,
    },
}

/// Handle a CLI command
///
/// Routes the command to the appropriate handler module.
pub async fn handle_command(command: Commands, config: &Config) -> Result<()> {
    let client = config.client();

    match command {
        Commands::Pipeline { command } => pipeline::handle_pipeline_command(command, &client).await,
        Commands::Job { command } => job::handle_job_command(command, &client).await,
        Commands::Runner { command } => runner::handle_runner_command(command, &client).await,
        Commands::Project { command } => project::handle_project_command(command, &client).await,
        Commands::User { command } => user::handle_user_command(command, &client).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(subcommand)]
        command: Commands,
    }

    #[test]
    fn test_parse_pipeline_create() {
        let cli = TestCli::try_parse_from([
            "conduit", "pipeline", "create", "4", "--ref", "release", "-v", "DEPLOY=1", "--file",
            ".conduit.lua",
        ])
        .unwrap();

        match cli.command {
            Commands::Pipeline {
                command:
                    PipelineCommands::Create {
                        project,
                        ref_name,
                        variable,
                        file,
                        ..
                    },
            } => {
                assert_eq!(project, 4);
                assert_eq!(ref_name, "release");
                assert_eq!(variable, vec![("DEPLOY".to_string(), "1".to_string())]);
                assert_eq!(file.as_deref(), Some(".conduit.lua"));
            }
            _ => panic!("parsed the wrong command"),
        }
    }

    #[test]
    fn test_parse_cancel_wait() {
        let cli = TestCli::try_parse_from(["conduit", "pipeline", "cancel", "9", "--wait"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Pipeline {
                command: PipelineCommands::Cancel { id: 9, wait: true }
            }
        ));
    }

    #[test]
    fn test_rejects_unknown_role() {
        assert!(
            TestCli::try_parse_from(["conduit", "project", "member", "1", "2", "--role", "boss"])
                .is_err()
        );
    }
}
